//! 本地服务面
//!
//! 两个相互独立的监听端：
//! - `intake`：回环 HTTP，接收辅助采集端推送 + 认证回调
//! - `control`：domain socket / 命名管道上的特权控制面

pub mod control;
pub mod intake;

pub use control::{ControlState, router as control_router};
pub use intake::{IntakeState, router as intake_router};
