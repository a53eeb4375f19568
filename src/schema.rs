//! 数据库 Schema 定义
//!
//! Schema 版本记录在 `PRAGMA user_version`，由 migrations 模块按序应用。

/// 迁移 1：sessions / messages / messages_fts / sync_ledger / 云端记忆侧表
pub const MIGRATION_1_SQL: &str = r#"
-- Sessions 表
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    source TEXT NOT NULL,
    external_id TEXT NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    synced_at TEXT,                 -- 最近一次云端同步；NULL 表示未同步
    content_hash TEXT NOT NULL DEFAULT '',
    UNIQUE(source, external_id)
);

-- Messages 表
CREATE TABLE IF NOT EXISTS messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    role TEXT NOT NULL,             -- "user" | "assistant"
    content TEXT NOT NULL,
    created_at TEXT NOT NULL,
    token_count INTEGER,
    UNIQUE(session_id, role, created_at)
);

CREATE INDEX IF NOT EXISTS idx_sessions_updated ON sessions(updated_at DESC);
CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id);
CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at);

-- 同步台账（每会话一行）
CREATE TABLE IF NOT EXISTS sync_ledger (
    source TEXT NOT NULL,
    external_id TEXT NOT NULL,
    last_synced_at TEXT NOT NULL,
    doc_service_id TEXT,            -- 云端文档服务返回的句柄
    memory_synced INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (source, external_id)
);

-- 云端记忆侧表（由共驻的 memory 工具只读消费）
CREATE TABLE IF NOT EXISTS memory_entries (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    content TEXT NOT NULL,
    importance INTEGER NOT NULL DEFAULT 3,
    tags TEXT,                      -- JSON 数组
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS memory_sync_state (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

-- Messages 全文搜索虚拟表（触发器自动维护）
CREATE VIRTUAL TABLE IF NOT EXISTS messages_fts USING fts5(
    content,
    content='messages',
    content_rowid='id',
    tokenize='unicode61'
);

CREATE TRIGGER IF NOT EXISTS messages_ai AFTER INSERT ON messages BEGIN
    INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
END;

CREATE TRIGGER IF NOT EXISTS messages_ad AFTER DELETE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, content) VALUES('delete', old.id, old.content);
END;

CREATE TRIGGER IF NOT EXISTS messages_au AFTER UPDATE ON messages BEGIN
    INSERT INTO messages_fts(messages_fts, rowid, content) VALUES('delete', old.id, old.content);
    INSERT INTO messages_fts(rowid, content) VALUES (new.id, new.content);
END;
"#;

/// 迁移 2：observations + 全文索引 + 三个查询索引
pub const MIGRATION_2_SQL: &str = r#"
-- Observations 表（编码助手会话的结构化事件）
CREATE TABLE IF NOT EXISTS observations (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id INTEGER NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
    observation_type TEXT NOT NULL,
    tool_name TEXT,
    file_path TEXT,
    content TEXT NOT NULL,
    token_count INTEGER,
    sequence_number INTEGER NOT NULL,
    parent_observation_id INTEGER REFERENCES observations(id) ON DELETE SET NULL,
    created_at TEXT NOT NULL,
    UNIQUE(session_id, sequence_number)
);

CREATE INDEX IF NOT EXISTS idx_observations_session ON observations(session_id);
CREATE INDEX IF NOT EXISTS idx_observations_type ON observations(observation_type);
CREATE INDEX IF NOT EXISTS idx_observations_parent ON observations(parent_observation_id);

-- Observations 全文搜索虚拟表
CREATE VIRTUAL TABLE IF NOT EXISTS observations_fts USING fts5(
    content,
    tool_name,
    file_path,
    content='observations',
    content_rowid='id',
    tokenize='unicode61'
);

CREATE TRIGGER IF NOT EXISTS observations_ai AFTER INSERT ON observations BEGIN
    INSERT INTO observations_fts(rowid, content, tool_name, file_path)
    VALUES (new.id, new.content, new.tool_name, new.file_path);
END;

CREATE TRIGGER IF NOT EXISTS observations_ad AFTER DELETE ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, content, tool_name, file_path)
    VALUES('delete', old.id, old.content, old.tool_name, old.file_path);
END;

CREATE TRIGGER IF NOT EXISTS observations_au AFTER UPDATE ON observations BEGIN
    INSERT INTO observations_fts(observations_fts, rowid, content, tool_name, file_path)
    VALUES('delete', old.id, old.content, old.tool_name, old.file_path);
    INSERT INTO observations_fts(rowid, content, tool_name, file_path)
    VALUES (new.id, new.content, new.tool_name, new.file_path);
END;
"#;
