//! 数据库连接和操作
//!
//! LocalStore 是所有已摄取会话的唯一事实来源。进程内采用唯一写入者约束：
//! 连接由 store 独占，所有变更只经由本模块的方法；进程外的只读访问
//! （共驻的 memory 工具）依赖 SQLite 自身的 WAL 并发。

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::migrations;
use crate::types::{
    ConversationMessage, ConversationObservation, ConversationSession, LedgerEntry, Source, Stats,
};

/// 本地存储
pub struct LocalStore {
    pub(crate) conn: Arc<Mutex<Connection>>,
}

impl LocalStore {
    /// 打开（或创建）数据库并应用迁移
    pub fn connect<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;

        // WAL 必开：外部读者需要在写入进行时看到一致快照
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "foreign_keys", "ON")?;

        migrations::run_migrations(&conn)?;

        tracing::info!("数据库已连接: {:?}", path);

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 内存数据库（测试用）
    pub fn connect_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.pragma_update(None, "foreign_keys", "ON")?;
        migrations::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// 获取底层连接 (用于测试)
    #[doc(hidden)]
    pub fn connection(&self) -> &Arc<Mutex<Connection>> {
        &self.conn
    }

    // ==================== Session 操作 ====================

    /// 创建或更新会话，冲突键 `(source, external_id)`
    ///
    /// 返回时 `session.id` 已回填。
    pub fn upsert_session(&self, session: &mut ConversationSession) -> Result<()> {
        let conn = self.conn.lock();

        let id: i64 = conn.query_row(
            r#"
            INSERT INTO sessions (source, external_id, title, created_at, updated_at, content_hash)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(source, external_id) DO UPDATE SET
                title = excluded.title,
                updated_at = excluded.updated_at,
                content_hash = excluded.content_hash
            RETURNING id
            "#,
            params![
                session.source.as_str(),
                session.external_id,
                session.title,
                session.created_at,
                session.updated_at,
                session.content_hash,
            ],
            |row| row.get(0),
        )?;

        session.id = id;
        Ok(())
    }

    /// 按 `(source, external_id)` 读取会话
    pub fn get_session(&self, source: Source, external_id: &str) -> Result<Option<ConversationSession>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT id, source, external_id, title, created_at, updated_at, synced_at, content_hash
            FROM sessions
            WHERE source = ?1 AND external_id = ?2
            "#,
            params![source.as_str(), external_id],
            session_from_row,
        )
        .optional()
        .map_err(Into::into)
    }

    /// 待同步会话：`synced_at IS NULL OR updated_at > synced_at`
    ///
    /// 按 updated_at 降序，最多 `batch_size` 条。
    pub fn get_pending_sync(&self, batch_size: usize) -> Result<Vec<ConversationSession>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, source, external_id, title, created_at, updated_at, synced_at, content_hash
            FROM sessions
            WHERE synced_at IS NULL OR datetime(updated_at) > datetime(synced_at)
            ORDER BY datetime(updated_at) DESC
            LIMIT ?1
            "#,
        )?;

        let rows = stmt.query_map(params![batch_size as i64], session_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 标记会话已同步，并原子地更新台账
    ///
    /// session 的 `synced_at` 与台账的 `last_synced_at` 写入同一时间戳，
    /// 整体在一个事务内完成，二者永不漂移。
    pub fn mark_synced(&self, session_id: i64, doc_service_id: Option<&str>) -> Result<()> {
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let now = Utc::now().to_rfc3339();

        let (source, external_id): (String, String) = tx.query_row(
            "SELECT source, external_id FROM sessions WHERE id = ?1",
            params![session_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?;

        tx.execute(
            "UPDATE sessions SET synced_at = ?1 WHERE id = ?2",
            params![now, session_id],
        )?;

        tx.execute(
            r#"
            INSERT INTO sync_ledger (source, external_id, last_synced_at, doc_service_id)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(source, external_id) DO UPDATE SET
                last_synced_at = excluded.last_synced_at,
                doc_service_id = COALESCE(excluded.doc_service_id, sync_ledger.doc_service_id)
            "#,
            params![source, external_id, now, doc_service_id],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// 标记台账 memory 侧已投递（best-effort 端点 2xx 时调用）
    pub fn mark_memory_synced(&self, session_id: i64) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            r#"
            UPDATE sync_ledger SET memory_synced = 1
            WHERE (source, external_id) IN
                (SELECT source, external_id FROM sessions WHERE id = ?1)
            "#,
            params![session_id],
        )?;
        Ok(())
    }

    /// 读取台账行
    pub fn get_ledger(&self, source: Source, external_id: &str) -> Result<Option<LedgerEntry>> {
        let conn = self.conn.lock();
        conn.query_row(
            r#"
            SELECT source, external_id, last_synced_at, doc_service_id, memory_synced
            FROM sync_ledger
            WHERE source = ?1 AND external_id = ?2
            "#,
            params![source.as_str(), external_id],
            |row| {
                let source_str: String = row.get(0)?;
                let memory_synced: i64 = row.get(4)?;
                Ok((source_str, row.get::<_, String>(1)?, row.get::<_, String>(2)?, row.get::<_, Option<String>>(3)?, memory_synced))
            },
        )
        .optional()?
        .map(|(source_str, external_id, last_synced_at, doc_service_id, memory_synced)| {
            let source = source_str
                .parse::<Source>()
                .map_err(|e| Error::Config(e))?;
            Ok(LedgerEntry {
                source,
                external_id,
                last_synced_at,
                doc_service_id,
                memory_synced: memory_synced != 0,
            })
        })
        .transpose()
    }

    // ==================== Message 操作 ====================

    /// 批量写入消息（事务），冲突键 `(session_id, role, created_at)`
    ///
    /// 返回受影响的行数。
    pub fn upsert_messages(&self, messages: &[ConversationMessage]) -> Result<usize> {
        if messages.is_empty() {
            return Ok(0);
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut affected = 0;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO messages (session_id, role, content, created_at, token_count)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT(session_id, role, created_at) DO UPDATE SET
                    content = excluded.content,
                    token_count = excluded.token_count
                "#,
            )?;

            for msg in messages {
                affected += stmt.execute(params![
                    msg.session_id,
                    msg.role,
                    msg.content,
                    msg.created_at,
                    msg.token_count,
                ])?;
            }
        }

        tx.commit()?;
        Ok(affected)
    }

    /// 会话全部消息，按 created_at 升序
    pub fn get_messages(&self, session_id: i64) -> Result<Vec<ConversationMessage>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, session_id, role, content, created_at, token_count
            FROM messages
            WHERE session_id = ?1
            ORDER BY datetime(created_at) ASC
            "#,
        )?;

        let rows = stmt.query_map(params![session_id], |row| {
            Ok(ConversationMessage {
                id: row.get(0)?,
                session_id: row.get(1)?,
                role: row.get(2)?,
                content: row.get(3)?,
                created_at: row.get(4)?,
                token_count: row.get(5)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 会话消息数量
    pub fn session_message_count(&self, session_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COUNT(*) FROM messages WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    // ==================== Observation 操作 ====================

    /// 批量写入观测（事务），冲突键 `(session_id, sequence_number)`
    ///
    /// 冲突时更新全部可变字段；返回时每行的 `id` 已回填。
    pub fn upsert_observations(
        &self,
        observations: &mut [ConversationObservation],
    ) -> Result<()> {
        if observations.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare(
                r#"
                INSERT INTO observations
                    (session_id, observation_type, tool_name, file_path, content,
                     token_count, sequence_number, parent_observation_id, created_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(session_id, sequence_number) DO UPDATE SET
                    observation_type = excluded.observation_type,
                    tool_name = excluded.tool_name,
                    file_path = excluded.file_path,
                    content = excluded.content,
                    token_count = excluded.token_count,
                    parent_observation_id = excluded.parent_observation_id,
                    created_at = excluded.created_at
                RETURNING id
                "#,
            )?;

            for obs in observations.iter_mut() {
                let id: i64 = stmt.query_row(
                    params![
                        obs.session_id,
                        obs.observation_type.as_str(),
                        obs.tool_name,
                        obs.file_path,
                        obs.content,
                        obs.token_count,
                        obs.sequence_number,
                        obs.parent_observation_id,
                        obs.created_at,
                    ],
                    |row| row.get(0),
                )?;
                obs.id = id;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// 批量回填父观测链接（事务）
    ///
    /// `pairs` 为 `(observation_id, parent_observation_id)`；不存在的 id 无副作用。
    pub fn update_observation_parents(&self, pairs: &[(i64, i64)]) -> Result<()> {
        if pairs.is_empty() {
            return Ok(());
        }

        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;

        {
            let mut stmt =
                tx.prepare("UPDATE observations SET parent_observation_id = ?2 WHERE id = ?1")?;
            for (id, parent_id) in pairs {
                stmt.execute(params![id, parent_id])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    /// 会话全部观测，按 sequence_number 升序
    pub fn get_observations(&self, session_id: i64) -> Result<Vec<ConversationObservation>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT id, session_id, observation_type, tool_name, file_path, content,
                   token_count, sequence_number, parent_observation_id, created_at
            FROM observations
            WHERE session_id = ?1
            ORDER BY sequence_number ASC
            "#,
        )?;

        let rows = stmt.query_map(params![session_id], observation_from_row)?;
        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 会话的下一个观测序号（COALESCE(MAX+1, 0)）
    pub fn next_observation_sequence(&self, session_id: i64) -> Result<i64> {
        let conn = self.conn.lock();
        conn.query_row(
            "SELECT COALESCE(MAX(sequence_number) + 1, 0) FROM observations WHERE session_id = ?1",
            params![session_id],
            |row| row.get(0),
        )
        .map_err(Into::into)
    }

    // ==================== 统计 ====================

    /// 获取统计信息
    pub fn stats(&self) -> Result<Stats> {
        let conn = self.conn.lock();

        let session_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM sessions", [], |row| row.get(0))?;
        let message_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        let observation_count: i64 =
            conn.query_row("SELECT COUNT(*) FROM observations", [], |row| row.get(0))?;

        Ok(Stats {
            session_count,
            message_count,
            observation_count,
        })
    }
}

/// 行 → 会话
fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationSession> {
    let source_str: String = row.get(1)?;
    let source = source_str.parse::<Source>().map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(ConversationSession {
        id: row.get(0)?,
        source,
        external_id: row.get(2)?,
        title: row.get(3)?,
        created_at: row.get(4)?,
        updated_at: row.get(5)?,
        synced_at: row.get(6)?,
        content_hash: row.get(7)?,
    })
}

/// 行 → 观测
fn observation_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationObservation> {
    let type_str: String = row.get(2)?;
    let observation_type = type_str.parse().map_err(|e: String| {
        rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Text, e.into())
    })?;
    Ok(ConversationObservation {
        id: row.get(0)?,
        session_id: row.get(1)?,
        observation_type,
        tool_name: row.get(3)?,
        file_path: row.get(4)?,
        content: row.get(5)?,
        token_count: row.get(6)?,
        sequence_number: row.get(7)?,
        parent_observation_id: row.get(8)?,
        created_at: row.get(9)?,
    })
}
