#![allow(unused_results)]

use std::sync::Arc;
use std::thread;

use chrono::{Duration, Utc};
use loom_session::{
    CheckpointId, CreateBranchOptions, RegistryConfig, ResumeBlocker, SessionRegistry,
    SessionStatus, StreamChunk, ThreadId,
};
use loom_store::Database;
use serde_json::{json, Map};

fn registry() -> SessionRegistry {
    SessionRegistry::new(Database::in_memory().unwrap(), RegistryConfig::default())
}

fn s1() -> ThreadId {
    ThreadId::from_raw("s1")
}

fn branch_from(id: &CheckpointId) -> CreateBranchOptions {
    CreateBranchOptions {
        from_checkpoint_id: Some(id.clone()),
        switch: false,
    }
}

/// Every session's pointer resolves to a checkpoint in its own tree, and
/// every non-root checkpoint's parent lives in the same tree.
fn assert_tree_integrity(reg: &SessionRegistry, thread_id: &ThreadId) {
    let session = reg.get_session(thread_id).unwrap();
    reg.get_checkpoint(thread_id, &session.current_checkpoint_id)
        .unwrap();

    let checkpoints = reg.list_checkpoints(thread_id).unwrap();
    let roots = checkpoints.iter().filter(|c| c.parent_id.is_none()).count();
    assert_eq!(roots, 1);
    for cp in &checkpoints {
        if let Some(parent) = &cp.parent_id {
            reg.get_checkpoint(thread_id, parent).unwrap();
        }
    }
    for branch in reg.list_branches(thread_id).unwrap() {
        reg.get_checkpoint(thread_id, &branch.head_checkpoint_id)
            .unwrap();
    }
}

#[test]
fn thinking_is_separated_from_text() {
    let reg = registry();
    reg.create_session(&s1(), Map::new(), None).unwrap();
    reg.append_chunk(&s1(), StreamChunk::thinking("A")).unwrap();
    reg.append_chunk(&s1(), StreamChunk::text("B")).unwrap();

    let block = reg.get_thinking_summary(&s1()).unwrap();
    assert_eq!(block.thinking_text, "A");
}

#[test]
fn time_travel_restores_message_count() {
    let reg = registry();
    reg.create_session(&s1(), Map::new(), None).unwrap();
    let cp1 = reg
        .create_checkpoint(&s1(), json!({"msgs": ["m1"]}), "cp1", true)
        .unwrap();
    reg.create_checkpoint(&s1(), json!({"msgs": ["m1", "m2"]}), "cp2", true)
        .unwrap();

    let result = reg.time_travel(&s1(), &cp1.id).unwrap();
    assert!(result.success);
    assert_eq!(result.message_count, 1);
    assert_tree_integrity(&reg, &s1());
}

#[test]
fn branch_is_not_current_until_switched() {
    let reg = registry();
    reg.create_session(&s1(), Map::new(), None).unwrap();
    let cp1 = reg
        .create_checkpoint(&s1(), json!({"msgs": ["m1"]}), "cp1", true)
        .unwrap();
    reg.create_branch(&s1(), "alt", branch_from(&cp1.id)).unwrap();

    let current = |reg: &SessionRegistry| -> Vec<(String, bool)> {
        reg.list_branches(&s1())
            .unwrap()
            .into_iter()
            .map(|b| (b.name, b.is_current))
            .collect()
    };
    assert_eq!(
        current(&reg),
        vec![("main".to_string(), true), ("alt".to_string(), false)]
    );

    reg.switch_branch(&s1(), "alt").unwrap();
    assert_eq!(
        current(&reg),
        vec![("main".to_string(), false), ("alt".to_string(), true)]
    );
}

#[test]
fn token_stops_working_after_expiry() {
    let reg = registry();
    reg.create_session(&s1(), Map::new(), None).unwrap();
    let issued_at = Utc::now();
    let info = reg.mark_reconnectable_at(&s1(), issued_at).unwrap();

    let fresh = reg
        .get_reconnection_state_at(&s1(), Some(&info.reconnect_token), issued_at)
        .unwrap();
    assert!(fresh.success);

    let at_boundary = reg
        .get_reconnection_state_at(&s1(), Some(&info.reconnect_token), info.expires_at)
        .unwrap();
    assert!(at_boundary.success);

    let after = info.expires_at + Duration::milliseconds(1);
    let stale = reg
        .get_reconnection_state_at(&s1(), Some(&info.reconnect_token), after)
        .unwrap();
    assert!(!stale.success);
    assert!(!stale.can_resume);
    assert_eq!(stale.reason, Some(ResumeBlocker::TokenExpired));
}

#[test]
fn checkpoint_state_round_trips() {
    let reg = registry();
    reg.create_session(&s1(), Map::new(), None).unwrap();
    let state = json!({
        "messages": [{"role": "user", "content": "hi"}, {"role": "assistant", "content": "hello"}],
        "tools": ["Read"],
    });
    let cp = reg
        .create_checkpoint(&s1(), state.clone(), "after greeting", false)
        .unwrap();
    assert_eq!(reg.get_checkpoint(&s1(), &cp.id).unwrap().state, state);
    assert_eq!(cp.message_count, 2);
}

#[test]
fn reconnection_reads_are_idempotent() {
    let reg = registry();
    reg.create_session(&s1(), Map::new(), None).unwrap();
    reg.append_chunk(&s1(), StreamChunk::text("delivered")).unwrap();
    let info = reg.mark_reconnectable(&s1()).unwrap();
    reg.append_chunk(&s1(), StreamChunk::thinking("t1")).unwrap();
    reg.append_chunk(&s1(), StreamChunk::text("t2")).unwrap();

    let first = reg
        .get_reconnection_state(&s1(), Some(&info.reconnect_token))
        .unwrap();
    let second = reg
        .get_reconnection_state(&s1(), Some(&info.reconnect_token))
        .unwrap();
    assert_eq!(first.pending_chunks, second.pending_chunks);
    assert_eq!(first.pending_chunks_count, 2);
    assert_eq!(first.last_stream_position, 1);

    // Only an explicit acknowledgement moves the cursor.
    reg.acknowledge(&s1(), 2).unwrap();
    let third = reg
        .get_reconnection_state(&s1(), Some(&info.reconnect_token))
        .unwrap();
    assert_eq!(third.pending_chunks.len(), 1);
    assert_eq!(third.pending_chunks[0].content, "t2");
}

#[test]
fn disconnect_never_drops_chunks() {
    let reg = registry();
    reg.create_session(&s1(), Map::new(), None).unwrap();
    let info = reg.mark_reconnectable(&s1()).unwrap();
    let sent: Vec<String> = (0..20).map(|i| format!("chunk-{i}")).collect();
    for content in &sent {
        reg.append_chunk(&s1(), StreamChunk::text(content.clone()))
            .unwrap();
    }

    let state = reg.resume(&s1(), &info.reconnect_token).unwrap();
    assert!(state.can_resume);
    let replayed: Vec<String> = state.pending_chunks.into_iter().map(|c| c.content).collect();
    assert_eq!(replayed, sent);

    let session = reg.get_session(&s1()).unwrap();
    assert_eq!(session.status, SessionStatus::Active);
    assert_eq!(session.last_stream_position, 20);
}

#[test]
fn time_travel_keeps_later_checkpoints() {
    let reg = registry();
    reg.create_session(&s1(), Map::new(), None).unwrap();
    let a = reg.create_checkpoint(&s1(), json!([1]), "a", true).unwrap();
    let mid = reg.create_checkpoint(&s1(), json!([1, 2]), "mid", true).unwrap();
    let b = reg
        .create_checkpoint(&s1(), json!([1, 2, 3]), "b", true)
        .unwrap();

    reg.time_travel(&s1(), &a.id).unwrap();
    reg.time_travel(&s1(), &b.id).unwrap();

    let listed: Vec<CheckpointId> = reg
        .get_history_tree(&s1())
        .unwrap()
        .checkpoints
        .into_iter()
        .map(|n| n.checkpoint_id)
        .collect();
    for id in [&a.id, &mid.id, &b.id] {
        assert!(listed.contains(id));
    }
    assert_tree_integrity(&reg, &s1());
}

#[test]
fn branch_heads_stay_isolated() {
    let reg = registry();
    reg.create_session(&s1(), Map::new(), None).unwrap();
    let base = reg.create_checkpoint(&s1(), json!([1]), "base", true).unwrap();
    reg.create_branch(&s1(), "x", branch_from(&base.id)).unwrap();
    reg.create_branch(&s1(), "y", branch_from(&base.id)).unwrap();

    reg.switch_branch(&s1(), "x").unwrap();
    let mut on_x = Vec::new();
    for i in 0..3 {
        on_x.push(
            reg.create_checkpoint(&s1(), json!({"msgs": vec![i; 2]}), "x work", true)
                .unwrap()
                .id,
        );
    }

    let tree = reg.get_history_tree(&s1()).unwrap();
    assert_eq!(tree.branches["y"], base.id);
    assert_eq!(tree.branches["main"], base.id);
    assert_eq!(tree.branches["x"], on_x[2]);
    assert!(!on_x.contains(&tree.branches["y"]));

    reg.switch_branch(&s1(), "y").unwrap();
    let on_y = reg.create_checkpoint(&s1(), json!([9]), "y work", true).unwrap();
    assert_eq!(on_y.parent_id.as_ref(), Some(&base.id));
    assert_eq!(reg.get_history_tree(&s1()).unwrap().branches["x"], on_x[2]);
    assert_tree_integrity(&reg, &s1());
}

#[test]
fn swept_session_reports_expired() {
    let reg = registry();
    reg.create_session(&s1(), Map::new(), None).unwrap();
    let issued_at = Utc::now();
    reg.mark_reconnectable_at(&s1(), issued_at).unwrap();

    let expired = reg
        .expire_stale_sessions(issued_at + reg.config().token_ttl + Duration::seconds(1))
        .unwrap();
    assert_eq!(expired, vec![s1()]);

    let state = reg.get_reconnection_state(&s1(), None).unwrap();
    assert!(!state.can_resume);
    assert_eq!(state.reason, Some(ResumeBlocker::SessionExpired));
    assert!(state.pending_chunks.is_empty());
}

#[test]
fn concurrent_appends_are_serialized() {
    let reg = Arc::new(registry());
    reg.create_session(&s1(), Map::new(), None).unwrap();
    reg.mark_reconnectable(&s1()).unwrap();

    let writers: Vec<_> = (0..8)
        .map(|w| {
            let reg = Arc::clone(&reg);
            thread::spawn(move || {
                let mut positions = Vec::new();
                for i in 0..25 {
                    positions.push(
                        reg.append_chunk(&s1(), StreamChunk::text(format!("{w}-{i}")))
                            .unwrap(),
                    );
                }
                positions
            })
        })
        .collect();

    let mut positions: Vec<u64> = writers
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    positions.sort_unstable();
    assert_eq!(positions, (0..200).collect::<Vec<u64>>());
    assert_eq!(reg.get_chunks_from(&s1(), 0).unwrap().len(), 200);
}

#[test]
fn concurrent_checkpoints_keep_tree_valid() {
    let reg = Arc::new(registry());
    reg.create_session(&s1(), Map::new(), None).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|w| {
            let reg = Arc::clone(&reg);
            thread::spawn(move || {
                for i in 0..10 {
                    reg.create_checkpoint(&s1(), json!({"msgs": [w, i]}), "worker", true)
                        .unwrap();
                }
            })
        })
        .collect();
    for handle in workers {
        handle.join().unwrap();
    }

    let checkpoints = reg.list_checkpoints(&s1()).unwrap();
    assert_eq!(checkpoints.len(), 41);
    let sequences: Vec<i64> = checkpoints.iter().map(|c| c.sequence).collect();
    assert_eq!(sequences, (0..41).collect::<Vec<i64>>());

    // With adopt every checkpoint chains from the previous one.
    let head = reg.get_session(&s1()).unwrap().current_checkpoint_id;
    assert_eq!(reg.get_ancestors(&s1(), &head).unwrap().len(), 41);
    assert_tree_integrity(&reg, &s1());
}

#[test]
fn sessions_survive_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("loom.db");
    let thread_id = ThreadId::new();

    let (token, cp_id) = {
        let reg = SessionRegistry::new(Database::open(&path).unwrap(), RegistryConfig::default());
        reg.create_session(&thread_id, Map::new(), None).unwrap();
        let cp = reg
            .create_checkpoint(&thread_id, json!({"msgs": ["m1"]}), "cp1", true)
            .unwrap();
        let info = reg.mark_reconnectable(&thread_id).unwrap();
        reg.append_chunk(&thread_id, StreamChunk::text("after drop"))
            .unwrap();
        (info.reconnect_token, cp.id)
    };

    let reg = SessionRegistry::new(Database::open(&path).unwrap(), RegistryConfig::default());
    let session = reg.get_session(&thread_id).unwrap();
    assert_eq!(session.status, SessionStatus::Disconnected);
    assert_eq!(session.current_checkpoint_id, cp_id);

    let state = reg.resume(&thread_id, &token).unwrap();
    assert!(state.can_resume);
    assert_eq!(state.pending_chunks[0].content, "after drop");
}

/// Pending chunks are always the buffer suffix after the cursor.
fn assert_pending(reg: &SessionRegistry, thread_id: &ThreadId, expected: &[&str]) {
    let session = reg.get_session(thread_id).unwrap();
    let state = reg.get_reconnection_state(thread_id, None).unwrap();
    let from_cursor = reg
        .get_chunks_from(thread_id, session.last_stream_position)
        .unwrap();
    assert_eq!(state.last_stream_position, session.last_stream_position);
    assert_eq!(state.pending_chunks, from_cursor);
    assert_eq!(state.pending_chunks_count, from_cursor.len());
    let contents: Vec<&str> = state.pending_chunks.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(contents, expected);
}

#[test]
fn status_flips_do_not_skip_buffered_chunks() {
    let reg = registry();
    reg.create_session(&s1(), Map::new(), None).unwrap();
    reg.append_chunk(&s1(), StreamChunk::text("live")).unwrap();
    assert_pending(&reg, &s1(), &[]);

    reg.update_status(&s1(), SessionStatus::Disconnected).unwrap();
    reg.append_chunk(&s1(), StreamChunk::text("a")).unwrap();
    assert_pending(&reg, &s1(), &["a"]);

    reg.update_status(&s1(), SessionStatus::Active).unwrap();
    reg.append_chunk(&s1(), StreamChunk::text("b")).unwrap();
    assert_pending(&reg, &s1(), &["a", "b"]);

    reg.acknowledge(&s1(), 2).unwrap();
    assert_pending(&reg, &s1(), &["b"]);

    reg.append_chunk(&s1(), StreamChunk::text("c")).unwrap();
    assert_pending(&reg, &s1(), &["b", "c"]);

    reg.acknowledge(&s1(), 4).unwrap();
    reg.append_chunk(&s1(), StreamChunk::text("d")).unwrap();
    assert_pending(&reg, &s1(), &[]);
}

#[test]
fn disconnect_resume_cycles_replay_exactly_the_gap() {
    let reg = registry();
    reg.create_session(&s1(), Map::new(), None).unwrap();

    let first = reg.mark_reconnectable(&s1()).unwrap();
    reg.append_chunk(&s1(), StreamChunk::text("a")).unwrap();
    reg.append_chunk(&s1(), StreamChunk::thinking("t")).unwrap();
    assert_pending(&reg, &s1(), &["a", "t"]);

    // A second disconnect before resuming keeps the earlier gap.
    let second = reg.mark_reconnectable(&s1()).unwrap();
    assert_eq!(second.last_position, 0);
    reg.append_chunk(&s1(), StreamChunk::text("b")).unwrap();
    let stale = reg.resume(&s1(), &first.reconnect_token).unwrap();
    assert_eq!(stale.reason, Some(ResumeBlocker::TokenMismatch));
    assert_pending(&reg, &s1(), &["a", "t", "b"]);

    let resumed = reg.resume(&s1(), &second.reconnect_token).unwrap();
    assert_eq!(resumed.pending_chunks_count, 3);
    assert_pending(&reg, &s1(), &[]);

    reg.append_chunk(&s1(), StreamChunk::text("live")).unwrap();
    assert_pending(&reg, &s1(), &[]);

    let third = reg.mark_reconnectable(&s1()).unwrap();
    assert_eq!(third.last_position, 4);
    reg.append_chunk(&s1(), StreamChunk::text("c")).unwrap();
    reg.update_status(&s1(), SessionStatus::Active).unwrap();
    reg.append_chunk(&s1(), StreamChunk::text("d")).unwrap();
    // Acknowledging behind the cursor is a no-op.
    assert_eq!(reg.acknowledge(&s1(), 2).unwrap(), 4);
    assert_pending(&reg, &s1(), &["c", "d"]);

    let resumed = reg.resume(&s1(), &third.reconnect_token).unwrap();
    let replayed: Vec<&str> = resumed.pending_chunks.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(replayed, vec!["c", "d"]);
    assert_eq!(reg.get_session(&s1()).unwrap().last_stream_position, 6);
}
