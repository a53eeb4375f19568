//! 本地存储集成测试

use ses_daemon::types::{
    content_hash, ConversationMessage, ConversationObservation, ConversationSession,
    ObservationType, Source,
};
use ses_daemon::LocalStore;
use tempfile::TempDir;

/// 创建临时数据库
fn setup_db() -> (LocalStore, TempDir) {
    let tmp = TempDir::new().unwrap();
    let db_path = tmp.path().join("local.db");
    let store = LocalStore::connect(&db_path).unwrap();
    (store, tmp)
}

fn make_session(external_id: &str, updated_at: &str, message_count: usize) -> ConversationSession {
    ConversationSession::new(
        Source::ClaudeCode,
        external_id,
        format!("proj/{}", external_id),
        "2026-01-01T00:00:00Z",
        updated_at,
        message_count,
    )
}

fn make_message(session_id: i64, role: &str, created_at: &str, content: &str) -> ConversationMessage {
    ConversationMessage {
        id: 0,
        session_id,
        role: role.to_string(),
        content: content.to_string(),
        created_at: created_at.to_string(),
        token_count: None,
    }
}

fn make_observation(
    session_id: i64,
    seq: i64,
    observation_type: ObservationType,
    content: &str,
) -> ConversationObservation {
    ConversationObservation {
        id: 0,
        session_id,
        observation_type,
        tool_name: None,
        file_path: None,
        content: content.to_string(),
        token_count: None,
        sequence_number: seq,
        parent_observation_id: None,
        created_at: "2026-01-01T00:00:00Z".to_string(),
    }
}

// ==================== 连接测试 ====================

mod connection_tests {
    use super::*;

    #[test]
    fn test_connect_creates_db_file() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("subdir").join("local.db");
        assert!(!db_path.parent().unwrap().exists());

        let _store = LocalStore::connect(&db_path).unwrap();
        assert!(db_path.exists());
    }

    #[test]
    fn test_wal_mode_enabled() {
        let (store, _tmp) = setup_db();
        let conn = store.connection().lock();
        let mode: String = conn
            .query_row("PRAGMA journal_mode", [], |row| row.get(0))
            .unwrap();
        assert_eq!(mode.to_lowercase(), "wal");
    }

    #[test]
    fn test_reconnect_existing_db() {
        let tmp = TempDir::new().unwrap();
        let db_path = tmp.path().join("local.db");

        {
            let store = LocalStore::connect(&db_path).unwrap();
            let mut session = make_session("s1", "2026-01-01T00:00:01Z", 0);
            store.upsert_session(&mut session).unwrap();
        }

        let store = LocalStore::connect(&db_path).unwrap();
        let stats = store.stats().unwrap();
        assert_eq!(stats.session_count, 1);
    }
}

// ==================== Session 测试 ====================

mod session_tests {
    use super::*;

    #[test]
    fn test_upsert_populates_id() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 2);

        assert_eq!(session.id, 0);
        store.upsert_session(&mut session).unwrap();
        assert!(session.id > 0);
    }

    #[test]
    fn test_upsert_collapses_on_source_external_id() {
        let (store, _tmp) = setup_db();

        let mut first = make_session("s1", "2026-01-01T00:00:01Z", 2);
        store.upsert_session(&mut first).unwrap();

        let mut second = make_session("s1", "2026-01-01T00:05:00Z", 5);
        second.title = "proj/renamed".to_string();
        store.upsert_session(&mut second).unwrap();

        // 同一行被更新，不新建
        assert_eq!(first.id, second.id);
        assert_eq!(store.stats().unwrap().session_count, 1);

        let loaded = store
            .get_session(Source::ClaudeCode, "s1")
            .unwrap()
            .unwrap();
        assert_eq!(loaded.title, "proj/renamed");
        assert_eq!(loaded.updated_at, "2026-01-01T00:05:00Z");
        assert_eq!(loaded.content_hash, second.content_hash);
    }

    #[test]
    fn test_different_sources_do_not_collapse() {
        let (store, _tmp) = setup_db();

        let mut a = make_session("same-id", "2026-01-01T00:00:01Z", 0);
        store.upsert_session(&mut a).unwrap();

        let mut b = ConversationSession::new(
            Source::ClaudeChat,
            "same-id",
            "chat title",
            "2026-01-01T00:00:00Z",
            "2026-01-01T00:00:01Z",
            0,
        );
        store.upsert_session(&mut b).unwrap();

        assert_ne!(a.id, b.id);
        assert_eq!(store.stats().unwrap().session_count, 2);
    }

    #[test]
    fn test_content_hash_matches_helper() {
        let session = make_session("s1", "2026-01-01T00:00:01Z", 3);
        assert_eq!(
            session.content_hash,
            content_hash("s1", "2026-01-01T00:00:01Z", 3)
        );
    }
}

// ==================== Message 测试 ====================

mod message_tests {
    use super::*;

    #[test]
    fn test_upsert_messages_idempotent() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 2);
        store.upsert_session(&mut session).unwrap();

        let messages = vec![
            make_message(session.id, "user", "2026-01-01T00:00:00Z", "Hello"),
            make_message(session.id, "assistant", "2026-01-01T00:00:01Z", "Hi!"),
        ];

        store.upsert_messages(&messages).unwrap();
        store.upsert_messages(&messages).unwrap();

        // 重复摄取不产生新行
        assert_eq!(store.session_message_count(session.id).unwrap(), 2);
    }

    #[test]
    fn test_upsert_messages_conflict_updates_content() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 1);
        store.upsert_session(&mut session).unwrap();

        store
            .upsert_messages(&[make_message(
                session.id,
                "user",
                "2026-01-01T00:00:00Z",
                "v1",
            )])
            .unwrap();

        let mut updated = make_message(session.id, "user", "2026-01-01T00:00:00Z", "v2");
        updated.token_count = Some(9);
        store.upsert_messages(&[updated]).unwrap();

        let messages = store.get_messages(session.id).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].content, "v2");
        assert_eq!(messages[0].token_count, Some(9));
    }

    #[test]
    fn test_get_messages_ordered_ascending() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:09Z", 3);
        store.upsert_session(&mut session).unwrap();

        // 乱序写入
        let messages = vec![
            make_message(session.id, "assistant", "2026-01-01T00:00:09Z", "third"),
            make_message(session.id, "user", "2026-01-01T00:00:01Z", "first"),
            make_message(session.id, "assistant", "2026-01-01T00:00:05Z", "second"),
        ];
        store.upsert_messages(&messages).unwrap();

        let loaded = store.get_messages(session.id).unwrap();
        let contents: Vec<_> = loaded.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["first", "second", "third"]);
    }
}

// ==================== Observation 测试 ====================

mod observation_tests {
    use super::*;

    #[test]
    fn test_upsert_backfills_ids() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 0);
        store.upsert_session(&mut session).unwrap();

        let mut observations = vec![
            make_observation(session.id, 0, ObservationType::Text, "a"),
            make_observation(session.id, 1, ObservationType::ToolUse, "b"),
        ];
        store.upsert_observations(&mut observations).unwrap();

        assert!(observations[0].id > 0);
        assert!(observations[1].id > 0);
        assert_ne!(observations[0].id, observations[1].id);
    }

    #[test]
    fn test_sequence_conflict_updates_in_place() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 0);
        store.upsert_session(&mut session).unwrap();

        let mut first = vec![make_observation(session.id, 0, ObservationType::Text, "v1")];
        store.upsert_observations(&mut first).unwrap();

        let mut second = vec![make_observation(
            session.id,
            0,
            ObservationType::Error,
            "v2",
        )];
        store.upsert_observations(&mut second).unwrap();

        let loaded = store.get_observations(session.id).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].content, "v2");
        assert_eq!(loaded[0].observation_type, ObservationType::Error);
        // 幂等：行 id 不变
        assert_eq!(first[0].id, second[0].id);
    }

    #[test]
    fn test_next_observation_sequence() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 0);
        store.upsert_session(&mut session).unwrap();

        assert_eq!(store.next_observation_sequence(session.id).unwrap(), 0);

        let mut observations = vec![
            make_observation(session.id, 0, ObservationType::Text, "a"),
            make_observation(session.id, 1, ObservationType::Text, "b"),
        ];
        store.upsert_observations(&mut observations).unwrap();

        assert_eq!(store.next_observation_sequence(session.id).unwrap(), 2);
    }

    #[test]
    fn test_update_observation_parents() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 0);
        store.upsert_session(&mut session).unwrap();

        let mut observations = vec![
            make_observation(session.id, 0, ObservationType::ToolUse, "use"),
            make_observation(session.id, 1, ObservationType::ToolResult, "result"),
        ];
        store.upsert_observations(&mut observations).unwrap();

        store
            .update_observation_parents(&[(observations[1].id, observations[0].id)])
            .unwrap();

        let loaded = store.get_observations(session.id).unwrap();
        assert_eq!(loaded[1].parent_observation_id, Some(observations[0].id));
        assert_eq!(loaded[0].parent_observation_id, None);
    }

    #[test]
    fn test_update_parents_missing_id_noop() {
        let (store, _tmp) = setup_db();
        // 不存在的 id：无副作用也不报错
        store.update_observation_parents(&[(424242, 434343)]).unwrap();
    }

    #[test]
    fn test_parent_delete_nulls_backreference() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 0);
        store.upsert_session(&mut session).unwrap();

        let mut observations = vec![
            make_observation(session.id, 0, ObservationType::ToolUse, "use"),
            make_observation(session.id, 1, ObservationType::ToolResult, "result"),
        ];
        store.upsert_observations(&mut observations).unwrap();
        store
            .update_observation_parents(&[(observations[1].id, observations[0].id)])
            .unwrap();

        // 删除父观测（关系非生命周期依赖）
        {
            let conn = store.connection().lock();
            conn.execute(
                "DELETE FROM observations WHERE id = ?1",
                [observations[0].id],
            )
            .unwrap();
        }

        let loaded = store.get_observations(session.id).unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].parent_observation_id, None);
    }
}

// ==================== 级联删除测试 ====================

mod cascade_tests {
    use super::*;

    #[test]
    fn test_session_delete_cascades() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 1);
        store.upsert_session(&mut session).unwrap();

        store
            .upsert_messages(&[make_message(
                session.id,
                "user",
                "2026-01-01T00:00:00Z",
                "hi",
            )])
            .unwrap();
        let mut observations = vec![make_observation(session.id, 0, ObservationType::Text, "x")];
        store.upsert_observations(&mut observations).unwrap();

        {
            let conn = store.connection().lock();
            conn.execute("DELETE FROM sessions WHERE id = ?1", [session.id])
                .unwrap();
        }

        let stats = store.stats().unwrap();
        assert_eq!(stats.session_count, 0);
        assert_eq!(stats.message_count, 0);
        assert_eq!(stats.observation_count, 0);
    }
}

// ==================== 同步台账测试 ====================

mod ledger_tests {
    use super::*;

    #[test]
    fn test_pending_sync_predicate() {
        let (store, _tmp) = setup_db();

        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 0);
        store.upsert_session(&mut session).unwrap();

        // 新会话：待同步
        let pending = store.get_pending_sync(10).unwrap();
        assert_eq!(pending.len(), 1);

        store.mark_synced(session.id, Some("doc-1")).unwrap();
        assert!(store.get_pending_sync(10).unwrap().is_empty());

        // 更新时间推进（晚于 synced_at）→ 再次待同步
        let future = chrono::Utc::now() + chrono::Duration::hours(1);
        let mut updated = make_session("s1", &future.to_rfc3339(), 3);
        store.upsert_session(&mut updated).unwrap();
        assert_eq!(store.get_pending_sync(10).unwrap().len(), 1);
    }

    #[test]
    fn test_pending_sync_ordering_and_limit() {
        let (store, _tmp) = setup_db();

        for (id, updated) in [
            ("a", "2026-01-01T00:00:01Z"),
            ("b", "2026-01-03T00:00:01Z"),
            ("c", "2026-01-02T00:00:01Z"),
        ] {
            let mut s = make_session(id, updated, 0);
            store.upsert_session(&mut s).unwrap();
        }

        let pending = store.get_pending_sync(2).unwrap();
        let ids: Vec<_> = pending.iter().map(|s| s.external_id.as_str()).collect();
        // updated_at 降序，截断到 batch
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[test]
    fn test_mark_synced_ledger_consistency() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 0);
        store.upsert_session(&mut session).unwrap();

        store.mark_synced(session.id, Some("doc-123")).unwrap();

        let loaded = store
            .get_session(Source::ClaudeCode, "s1")
            .unwrap()
            .unwrap();
        let ledger = store
            .get_ledger(Source::ClaudeCode, "s1")
            .unwrap()
            .unwrap();

        // 会话与台账的同步时间严格一致
        assert_eq!(loaded.synced_at.as_deref(), Some(ledger.last_synced_at.as_str()));
        assert_eq!(ledger.doc_service_id.as_deref(), Some("doc-123"));
        assert!(!ledger.memory_synced);
    }

    #[test]
    fn test_mark_memory_synced() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 0);
        store.upsert_session(&mut session).unwrap();
        store.mark_synced(session.id, Some("doc-1")).unwrap();

        store.mark_memory_synced(session.id).unwrap();

        let ledger = store
            .get_ledger(Source::ClaudeCode, "s1")
            .unwrap()
            .unwrap();
        assert!(ledger.memory_synced);
    }

    #[test]
    fn test_mark_synced_preserves_doc_id_on_resync() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 0);
        store.upsert_session(&mut session).unwrap();

        store.mark_synced(session.id, Some("doc-1")).unwrap();
        // 二次同步未拿到新 id 时保留旧句柄
        store.mark_synced(session.id, None).unwrap();

        let ledger = store
            .get_ledger(Source::ClaudeCode, "s1")
            .unwrap()
            .unwrap();
        assert_eq!(ledger.doc_service_id.as_deref(), Some("doc-1"));
    }
}

// ==================== 全文搜索测试 ====================

mod search_tests {
    use super::*;

    #[test]
    fn test_search_messages() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:02Z", 2);
        store.upsert_session(&mut session).unwrap();

        store
            .upsert_messages(&[
                make_message(
                    session.id,
                    "user",
                    "2026-01-01T00:00:00Z",
                    "how do I parse quaternions",
                ),
                make_message(session.id, "assistant", "2026-01-01T00:00:01Z", "like this"),
            ])
            .unwrap();

        let hits = store.search_messages("quaternions", 10).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].session_id, session.id);
        assert_eq!(hits[0].role, "user");

        assert!(store.search_messages("nonexistent", 10).unwrap().is_empty());
    }

    #[test]
    fn test_search_reflects_updates() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 1);
        store.upsert_session(&mut session).unwrap();

        store
            .upsert_messages(&[make_message(
                session.id,
                "user",
                "2026-01-01T00:00:00Z",
                "original zebra content",
            )])
            .unwrap();
        assert_eq!(store.search_messages("zebra", 10).unwrap().len(), 1);

        // 同键更新后，FTS 触发器应同步索引（墓碑 + 重建）
        store
            .upsert_messages(&[make_message(
                session.id,
                "user",
                "2026-01-01T00:00:00Z",
                "replaced giraffe content",
            )])
            .unwrap();

        assert!(store.search_messages("zebra", 10).unwrap().is_empty());
        assert_eq!(store.search_messages("giraffe", 10).unwrap().len(), 1);
    }

    #[test]
    fn test_search_observations() {
        let (store, _tmp) = setup_db();
        let mut session = make_session("s1", "2026-01-01T00:00:01Z", 0);
        store.upsert_session(&mut session).unwrap();

        let mut observations = vec![
            {
                let mut o = make_observation(
                    session.id,
                    0,
                    ObservationType::ToolUse,
                    r#"{"path":"/src/widget.rs"}"#,
                );
                o.tool_name = Some("Read".to_string());
                o.file_path = Some("/src/widget.rs".to_string());
                o
            },
            make_observation(session.id, 1, ObservationType::Error, "panicked at widget"),
        ];
        store.upsert_observations(&mut observations).unwrap();

        let hits = store.search_observations("widget", 10).unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn test_search_special_chars_do_not_error() {
        let (store, _tmp) = setup_db();
        // FTS5 语法字符经转义后不报错
        assert!(store.search_messages("foo-bar \"baz\"", 10).unwrap().is_empty());
    }
}
