//! Watcher 偏移量持久化
//!
//! `{绝对路径 → 字节偏移}` 映射保存为一个 JSON 文件。偏移只在一个文件的
//! 完整行处理全部落库之后推进，保证重启后不重读、不漏读。

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use crate::error::Result;

/// 偏移量映射
#[derive(Debug)]
pub struct OffsetMap {
    path: PathBuf,
    offsets: HashMap<String, u64>,
}

impl OffsetMap {
    /// 从磁盘加载；文件缺失或损坏时从空映射开始
    pub fn load(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let offsets = match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<HashMap<String, u64>>(&text) {
                Ok(map) => map,
                Err(e) => {
                    tracing::warn!("⚠️ 偏移量文件损坏，重置为空: {}", e);
                    HashMap::new()
                }
            },
            Err(_) => HashMap::new(),
        };

        Self { path, offsets }
    }

    /// 读取文件偏移；未记录的文件默认 0
    pub fn get(&self, file: &Path) -> u64 {
        self.offsets
            .get(&file.display().to_string())
            .copied()
            .unwrap_or(0)
    }

    /// 更新文件偏移（内存中）
    pub fn set(&mut self, file: &Path, offset: u64) {
        self.offsets.insert(file.display().to_string(), offset);
    }

    /// 持久化：整文件写入，临时文件 + rename 保证原子性
    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_string_pretty(&self.offsets)?;
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, json)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    /// 已记录的文件数（测试用）
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }
}
