//! 数据库迁移模块
//!
//! 版本号存放在 `PRAGMA user_version`（单个整数）。迁移按版本号严格升序
//! 应用，每一步在事务内执行并以版本写入收尾。

use rusqlite::Connection;
use tracing::info;

use crate::error::Result;
use crate::schema;

/// 一次迁移：目标版本 + SQL 批
struct Migration {
    version: i64,
    sql: &'static str,
}

/// 迁移列表（升序）
const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        sql: schema::MIGRATION_1_SQL,
    },
    Migration {
        version: 2,
        sql: schema::MIGRATION_2_SQL,
    },
];

/// 最新 schema 版本
pub const LATEST_VERSION: i64 = 2;

/// 读取当前 schema 版本
pub fn current_version(conn: &Connection) -> Result<i64> {
    let version: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    Ok(version)
}

/// 应用所有待执行迁移
pub fn run_migrations(conn: &Connection) -> Result<()> {
    let current = current_version(conn)?;
    if current >= LATEST_VERSION {
        return Ok(());
    }

    info!("当前 schema 版本: {}, 目标: {}", current, LATEST_VERSION);

    for migration in MIGRATIONS {
        if migration.version <= current {
            continue;
        }

        // 每步迁移一个事务：SQL 执行 + 版本写入要么全部生效要么全部回滚
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(migration.sql)?;
        tx.pragma_update(None, "user_version", migration.version)?;
        tx.commit()?;

        info!("✅ 迁移 {} 已应用", migration.version);
    }

    Ok(())
}
