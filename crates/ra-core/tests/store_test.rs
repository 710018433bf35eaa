use chrono::{Duration, Utc};
use ra_core::memory_store::MemoryAgentStore;
use ra_core::sqlite_store::SqliteAgentStore;
use ra_core::store::{AgentStore, StateChange, StoreError};
use ra_core::types::*;
use uuid::Uuid;

fn ctx_for(user: &str, prompt: &str) -> AgentContext {
    AgentContext::from_config(&AgentConfig::new("worker", user, prompt))
}

// ---------------------------------------------------------------------------
// Shared scenarios, run against every adapter
// ---------------------------------------------------------------------------

async fn save_and_load_roundtrip(store: &dyn AgentStore) {
    let mut ctx = ctx_for("alice", "count the files");
    ctx.memory.insert("k".into(), "v".into());
    ctx.tool_state
        .insert("shell".into(), ToolStateValue::Text("cwd=/tmp".into()));
    ctx.function_call_history
        .push(FunctionCallResult::success(FunctionCall::new("Shell_run"), "3"));
    store.save(&ctx).await.unwrap();

    let loaded = store.load(ctx.agent_id).await.unwrap().expect("stored");
    assert_eq!(loaded, ctx);
    assert!(store.load(Uuid::new_v4()).await.unwrap().is_none());
}

async fn update_state_is_narrow(store: &dyn AgentStore) {
    let mut ctx = ctx_for("alice", "p");
    store.save(&ctx).await.unwrap();

    // unsaved local edits must not leak through a narrow write
    let mut local = ctx.clone();
    local.notes.push("unsaved".into());
    store
        .update_state(&mut local, AgentState::HitlUser)
        .await
        .unwrap();
    assert_eq!(local.state, AgentState::HitlUser);

    let loaded = store.load(ctx.agent_id).await.unwrap().unwrap();
    assert_eq!(loaded.state, AgentState::HitlUser);
    assert!(loaded.notes.is_empty());
    assert!(loaded.last_update >= ctx.last_update);

    ctx.agent_id = Uuid::new_v4();
    let err = store
        .update_state(&mut ctx, AgentState::Error)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

async fn iterations_upsert_and_order(store: &dyn AgentStore) {
    let ctx = ctx_for("alice", "p");
    store.save(&ctx).await.unwrap();

    for n in [3u32, 1, 2] {
        let mut rec = AutonomousIteration::new(&ctx, n, format!("prompt {n}"));
        rec.agent_plan = format!("plan {n}");
        store.save_iteration(&rec).await.unwrap();
    }
    let mut again = AutonomousIteration::new(&ctx, 2, "prompt 2");
    again.agent_plan = "revised".into();
    store.save_iteration(&again).await.unwrap();

    let recs = store.load_iterations(ctx.agent_id).await.unwrap();
    let numbers: Vec<u32> = recs.iter().map(|r| r.iteration).collect();
    assert_eq!(numbers, vec![1, 2, 3]);
    assert_eq!(recs[1].agent_plan, "revised");

    let zero = AutonomousIteration::new(&ctx, 0, "bad");
    let err = store.save_iteration(&zero).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidIteration(0)));

    assert!(store.load_iterations(Uuid::new_v4()).await.unwrap().is_empty());
}

async fn child_links_parent(store: &dyn AgentStore) {
    let parent = ctx_for("alice", "parent");
    store.save(&parent).await.unwrap();

    let child = AgentContext::from_config(
        &AgentConfig::new("child", "alice", "sub task").with_parent(parent.agent_id),
    );
    store.save(&child).await.unwrap();

    let loaded = store.load(parent.agent_id).await.unwrap().unwrap();
    assert_eq!(loaded.child_agent_ids, vec![child.agent_id]);

    // a later save of the stale parent copy keeps the link
    store.save(&parent).await.unwrap();
    let loaded = store.load(parent.agent_id).await.unwrap().unwrap();
    assert_eq!(loaded.child_agent_ids, vec![child.agent_id]);

    let orphan = AgentContext::from_config(
        &AgentConfig::new("orphan", "alice", "x").with_parent(Uuid::new_v4()),
    );
    let err = store.save(&orphan).await.unwrap_err();
    assert!(matches!(err, StoreError::ParentNotFound(_)));
    assert!(store.load(orphan.agent_id).await.unwrap().is_none());
}

async fn cascade_delete(store: &dyn AgentStore) {
    let root = ctx_for("alice", "root");
    store.save(&root).await.unwrap();
    let child = AgentContext::from_config(
        &AgentConfig::new("child", "alice", "c").with_parent(root.agent_id),
    );
    store.save(&child).await.unwrap();
    let grandchild = AgentContext::from_config(
        &AgentConfig::new("grandchild", "alice", "g").with_parent(child.agent_id),
    );
    store.save(&grandchild).await.unwrap();
    store
        .save_iteration(&AutonomousIteration::new(&grandchild, 1, "p"))
        .await
        .unwrap();

    let other = ctx_for("bob", "bob's");
    store.save(&other).await.unwrap();

    // child ids and foreign ids are skipped
    let deleted = store
        .delete("alice", &[child.agent_id, other.agent_id])
        .await
        .unwrap();
    assert!(deleted.is_empty());
    assert!(store.load(child.agent_id).await.unwrap().is_some());
    assert!(store.load(other.agent_id).await.unwrap().is_some());

    let mut deleted = store.delete("alice", &[root.agent_id]).await.unwrap();
    deleted.sort();
    let mut expected = vec![root.agent_id, child.agent_id, grandchild.agent_id];
    expected.sort();
    assert_eq!(deleted, expected);

    for id in expected {
        assert!(store.load(id).await.unwrap().is_none());
    }
    assert!(store
        .load_iterations(grandchild.agent_id)
        .await
        .unwrap()
        .is_empty());
    assert!(store.load(other.agent_id).await.unwrap().is_some());
}

async fn list_and_list_running(store: &dyn AgentStore) {
    let base = Utc::now();
    let mut older = ctx_for("carol", "older");
    older.last_update = base - Duration::seconds(30);
    let mut newer = ctx_for("carol", "newer");
    newer.last_update = base;
    let mut done = ctx_for("carol", "done");
    done.state = AgentState::Completed;
    done.last_update = base - Duration::seconds(10);
    let mut failed = ctx_for("carol", "failed");
    failed.state = AgentState::Error;
    let mut paused = ctx_for("carol", "paused");
    paused.state = AgentState::HitlFeedback;
    paused.last_update = base - Duration::seconds(60);

    for ctx in [&older, &newer, &done, &failed, &paused] {
        store.save(ctx).await.unwrap();
    }
    store.save(&ctx_for("dave", "not mine")).await.unwrap();

    let all = store.list("carol").await.unwrap();
    assert_eq!(all.len(), 5);
    assert!(all
        .windows(2)
        .all(|w| w[0].last_update >= w[1].last_update));

    let running: Vec<Uuid> = store
        .list_running("carol")
        .await
        .unwrap()
        .iter()
        .map(|a| a.agent_id)
        .collect();
    assert_eq!(running, vec![newer.agent_id, older.agent_id, paused.agent_id]);

    assert!(store.list("nobody").await.unwrap().is_empty());
}

async fn update_functions_narrow(store: &dyn AgentStore) {
    let ctx = ctx_for("alice", "p");
    store.save(&ctx).await.unwrap();
    store
        .update_functions(ctx.agent_id, &["Shell_run".to_string()])
        .await
        .unwrap();
    let loaded = store.load(ctx.agent_id).await.unwrap().unwrap();
    assert_eq!(loaded.functions, vec!["Shell_run".to_string()]);

    let err = store
        .update_functions(Uuid::new_v4(), &[])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

async fn hil_flag_narrow(store: &dyn AgentStore) {
    let ctx = ctx_for("alice", "p");
    store.save(&ctx).await.unwrap();
    store.update_hil_requested(ctx.agent_id, true).await.unwrap();
    let loaded = store.load(ctx.agent_id).await.unwrap().unwrap();
    assert!(loaded.hil_requested);
    assert_eq!(loaded.iterations, ctx.iterations);

    let err = store
        .update_hil_requested(Uuid::new_v4(), true)
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

async fn conditional_cycle_write(store: &dyn AgentStore) {
    let mut ctx = ctx_for("alice", "p");
    ctx.state = AgentState::Agent;
    ctx.functions = vec!["Shell_run".into()];
    store.save(&ctx).await.unwrap();
    let child = AgentContext::from_config(
        &AgentConfig::new("child", "alice", "c").with_parent(ctx.agent_id),
    );
    store.save(&child).await.unwrap();

    // another writer narrows functions and asks for a pause meanwhile
    store.update_hil_requested(ctx.agent_id, true).await.unwrap();
    store.update_functions(ctx.agent_id, &[]).await.unwrap();

    let mut local = ctx.clone();
    local.iterations = 1;
    local.functions = vec!["Shell_run".into(), "Text_upper".into()];
    let record = AutonomousIteration::new(&local, 1, "prompt");
    let written = store
        .save_if_owned(&local, Some(&record), ctx.execution_id, AgentState::Agent)
        .await
        .unwrap()
        .expect("still owned");
    assert_eq!(written.iterations, 1);
    assert!(written.hil_requested);
    assert!(written.functions.is_empty());
    assert_eq!(written.child_agent_ids, vec![child.agent_id]);
    assert_eq!(store.load(ctx.agent_id).await.unwrap().unwrap(), written);
    assert_eq!(store.load_iterations(ctx.agent_id).await.unwrap().len(), 1);

    // a different execution id writes neither the context nor the iteration
    local.iterations = 2;
    let record = AutonomousIteration::new(&local, 2, "prompt");
    let stale = store
        .save_if_owned(&local, Some(&record), Uuid::new_v4(), AgentState::Agent)
        .await
        .unwrap();
    assert!(stale.is_none());
    // so does a record that left the expected state
    store
        .change_state(
            ctx.agent_id,
            StateChange::new(ctx.execution_id, AgentState::Agent, AgentState::Completed),
        )
        .await
        .unwrap()
        .expect("applied");
    let moved = store
        .save_if_owned(&local, Some(&record), ctx.execution_id, AgentState::Agent)
        .await
        .unwrap();
    assert!(moved.is_none());
    let stored = store.load(ctx.agent_id).await.unwrap().unwrap();
    assert_eq!(stored.state, AgentState::Completed);
    assert_eq!(stored.iterations, 1);
    assert_eq!(store.load_iterations(ctx.agent_id).await.unwrap().len(), 1);

    let gone = AgentContext::from_config(&AgentConfig::new("gone", "alice", "p"));
    let missing = store
        .save_if_owned(&gone, None, gone.execution_id, gone.state)
        .await
        .unwrap();
    assert!(missing.is_none());
}

async fn conditional_state_change(store: &dyn AgentStore) {
    let mut ctx = ctx_for("alice", "p");
    ctx.state = AgentState::HitlTool;
    ctx.awaiting_review = Some("Deploy_run".into());
    ctx.invoking.push(FunctionCall::new("Deploy_run"));
    store.save(&ctx).await.unwrap();

    // a loop wrote progress after the caller's read
    let mut progressed = ctx.clone();
    progressed.cost = 2.0;
    store.save(&progressed).await.unwrap();

    let change = StateChange::new(ctx.execution_id, AgentState::HitlTool, AgentState::Completed)
        .with_history_entry(FunctionCallResult::success(
            FunctionCall::new(AGENT_CANCELLED),
            "stop",
        ))
        .dropping_pending_calls();
    let updated = store
        .change_state(ctx.agent_id, change)
        .await
        .unwrap()
        .expect("applied");
    assert_eq!(updated.state, AgentState::Completed);
    assert_eq!(updated.cost, 2.0);
    assert!(updated.invoking.is_empty());
    assert!(updated.awaiting_review.is_none());
    assert_eq!(updated.function_call_history.len(), 1);
    assert_eq!(store.load(ctx.agent_id).await.unwrap().unwrap(), updated);

    // expectation no longer holds: nothing is written
    let again = StateChange::new(ctx.execution_id, AgentState::HitlTool, AgentState::Error)
        .with_error("late");
    assert!(store
        .change_state(ctx.agent_id, again)
        .await
        .unwrap()
        .is_none());
    let stored = store.load(ctx.agent_id).await.unwrap().unwrap();
    assert_eq!(stored, updated);

    let err = store
        .change_state(
            Uuid::new_v4(),
            StateChange::new(ctx.execution_id, AgentState::Agent, AgentState::Error),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::NotFound(_)));
}

async fn clearing_iterations(store: &dyn AgentStore) {
    let ctx = ctx_for("alice", "p");
    let other = ctx_for("alice", "q");
    store.save(&ctx).await.unwrap();
    store.save(&other).await.unwrap();
    for n in 1..=3u32 {
        store
            .save_iteration(&AutonomousIteration::new(&ctx, n, "p"))
            .await
            .unwrap();
    }
    store
        .save_iteration(&AutonomousIteration::new(&other, 1, "q"))
        .await
        .unwrap();

    store.clear_iterations(ctx.agent_id).await.unwrap();
    assert!(store.load_iterations(ctx.agent_id).await.unwrap().is_empty());
    assert_eq!(store.load_iterations(other.agent_id).await.unwrap().len(), 1);
    // the context itself is untouched
    assert!(store.load(ctx.agent_id).await.unwrap().is_some());
}

macro_rules! adapter_tests {
    ($module:ident, $make:expr) => {
        mod $module {
            use super::*;

            #[tokio::test]
            async fn roundtrip() {
                save_and_load_roundtrip(&$make).await;
            }

            #[tokio::test]
            async fn narrow_state_write() {
                update_state_is_narrow(&$make).await;
            }

            #[tokio::test]
            async fn iteration_ledger() {
                iterations_upsert_and_order(&$make).await;
            }

            #[tokio::test]
            async fn parent_linkage() {
                child_links_parent(&$make).await;
            }

            #[tokio::test]
            async fn delete_cascades() {
                cascade_delete(&$make).await;
            }

            #[tokio::test]
            async fn listing() {
                list_and_list_running(&$make).await;
            }

            #[tokio::test]
            async fn functions_write() {
                update_functions_narrow(&$make).await;
            }

            #[tokio::test]
            async fn hil_flag_write() {
                hil_flag_narrow(&$make).await;
            }

            #[tokio::test]
            async fn owned_cycle_write() {
                conditional_cycle_write(&$make).await;
            }

            #[tokio::test]
            async fn expected_state_change() {
                conditional_state_change(&$make).await;
            }

            #[tokio::test]
            async fn iteration_ledger_cleared() {
                clearing_iterations(&$make).await;
            }
        }
    };
}

adapter_tests!(memory, MemoryAgentStore::new());
adapter_tests!(sqlite, SqliteAgentStore::new_in_memory().await.unwrap());

#[tokio::test]
async fn sqlite_file_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("agents.db");
    let ctx = ctx_for("alice", "persist me");
    {
        let store = SqliteAgentStore::new(&path).await.unwrap();
        store.save(&ctx).await.unwrap();
        store
            .save_iteration(&AutonomousIteration::new(&ctx, 1, "p"))
            .await
            .unwrap();
    }
    let store = SqliteAgentStore::new(&path).await.unwrap();
    let loaded = store.load(ctx.agent_id).await.unwrap().unwrap();
    assert_eq!(loaded.user_prompt, "persist me");
    assert_eq!(store.load_iterations(ctx.agent_id).await.unwrap().len(), 1);
}
