//! 全文搜索
//!
//! FTS5 匹配，按 bm25 评分排序。

use rusqlite::params;

use crate::db::LocalStore;
use crate::error::Result;
use crate::types::{ObservationHit, SearchHit};

/// 转义 FTS5 查询：整体包成带引号的短语，内部引号翻倍
///
/// 外部输入直接拼进 MATCH 会被当作 FTS5 查询语法解析，
/// 特殊字符（`"`、`-`、`*`）会产生语法错误。
pub fn escape_fts_query(query: &str) -> String {
    let escaped = query.replace('"', "\"\"");
    format!("\"{}\"", escaped)
}

impl LocalStore {
    /// 消息全文搜索，按相关度排序
    pub fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<SearchHit>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT
                m.id,
                m.session_id,
                s.title,
                m.role,
                m.content,
                snippet(messages_fts, 0, '<mark>', '</mark>', '...', 64) as snippet,
                bm25(messages_fts) as score
            FROM messages_fts
            JOIN messages m ON messages_fts.rowid = m.id
            JOIN sessions s ON m.session_id = s.id
            WHERE messages_fts MATCH ?1
            ORDER BY score
            LIMIT ?2
            "#,
        )?;

        let rows = stmt.query_map(params![escape_fts_query(query), limit as i64], |row| {
            Ok(SearchHit {
                message_id: row.get(0)?,
                session_id: row.get(1)?,
                session_title: row.get(2)?,
                role: row.get(3)?,
                content: row.get(4)?,
                snippet: row.get(5)?,
                score: row.get(6)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }

    /// 观测全文搜索，按相关度排序
    pub fn search_observations(&self, query: &str, limit: usize) -> Result<Vec<ObservationHit>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            r#"
            SELECT
                o.id,
                o.session_id,
                o.observation_type,
                o.tool_name,
                o.file_path,
                o.content,
                snippet(observations_fts, 0, '<mark>', '</mark>', '...', 64) as snippet,
                bm25(observations_fts) as score
            FROM observations_fts
            JOIN observations o ON observations_fts.rowid = o.id
            WHERE observations_fts MATCH ?1
            ORDER BY score
            LIMIT ?2
            "#,
        )?;

        let rows = stmt.query_map(params![escape_fts_query(query), limit as i64], |row| {
            Ok(ObservationHit {
                observation_id: row.get(0)?,
                session_id: row.get(1)?,
                observation_type: row.get(2)?,
                tool_name: row.get(3)?,
                file_path: row.get(4)?,
                content: row.get(5)?,
                snippet: row.get(6)?,
                score: row.get(7)?,
            })
        })?;

        rows.collect::<std::result::Result<Vec<_>, _>>()
            .map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_fts_query() {
        assert_eq!(escape_fts_query("hello"), "\"hello\"");
        assert_eq!(escape_fts_query("a \"b\""), "\"a \"\"b\"\"\"");
        // 连字符不再被解析为 NOT
        assert_eq!(escape_fts_query("foo-bar"), "\"foo-bar\"");
    }
}
