use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::OptionalExtension;
use tokio_rusqlite::Connection;
use uuid::Uuid;

use crate::store::{
    check_iteration, merge_owned_fields, still_matches, AgentStore, Result, StateChange, StoreError,
};
use crate::types::{AgentContext, AgentState, AutonomousIteration};

/// Async SQLite-backed [`AgentStore`].
///
/// Each context is stored as a canonical JSON body next to the columns the
/// queries filter on. Parent/child links live in their own table so a
/// child's creation and its parent back-reference commit together.
pub struct SqliteAgentStore {
    conn: Connection,
}

// ---------------------------------------------------------------------------
// helpers
// ---------------------------------------------------------------------------

/// Fixed-width timestamp so lexical order matches time order.
fn ts_to_sql(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn other(err: impl std::error::Error + Send + Sync + 'static) -> tokio_rusqlite::Error {
    tokio_rusqlite::Error::Other(Box::new(err))
}

fn decode_context(body: &str) -> std::result::Result<AgentContext, tokio_rusqlite::Error> {
    serde_json::from_str(body).map_err(other)
}

fn encode_context(ctx: &AgentContext) -> std::result::Result<String, tokio_rusqlite::Error> {
    serde_json::to_string(ctx).map_err(other)
}

fn child_ids(
    conn: &rusqlite::Connection,
    parent_id: &str,
) -> std::result::Result<Vec<Uuid>, tokio_rusqlite::Error> {
    let mut stmt =
        conn.prepare("SELECT child_id FROM agent_children WHERE parent_id = ?1 ORDER BY seq")?;
    let mut rows = stmt.query(rusqlite::params![parent_id])?;
    let mut out = Vec::new();
    while let Some(row) = rows.next()? {
        let raw: String = row.get(0)?;
        out.push(Uuid::parse_str(&raw).map_err(other)?);
    }
    Ok(out)
}

/// Decode a context body and merge in the persisted child links.
fn read_context(
    conn: &rusqlite::Connection,
    agent_id: &str,
    body: &str,
) -> std::result::Result<AgentContext, tokio_rusqlite::Error> {
    let mut ctx = decode_context(body)?;
    for child in child_ids(conn, agent_id)? {
        ctx.add_child(child);
    }
    Ok(ctx)
}

/// The stored context for `agent_id`, if any.
fn read_row(
    conn: &rusqlite::Connection,
    agent_id: &str,
) -> std::result::Result<Option<AgentContext>, tokio_rusqlite::Error> {
    let body: Option<String> = conn
        .query_row(
            "SELECT body FROM agent_contexts WHERE agent_id = ?1",
            rusqlite::params![agent_id],
            |r| r.get(0),
        )
        .optional()?;
    body.map(|body| read_context(conn, agent_id, &body)).transpose()
}

fn insert_iteration(
    conn: &rusqlite::Connection,
    record: &AutonomousIteration,
) -> std::result::Result<(), tokio_rusqlite::Error> {
    let body = serde_json::to_string(record).map_err(other)?;
    conn.execute(
        "INSERT INTO autonomous_iterations (agent_id, iteration, created_at, body)
         VALUES (?1,?2,?3,?4)
         ON CONFLICT(agent_id, iteration) DO UPDATE SET
            created_at=excluded.created_at, body=excluded.body",
        rusqlite::params![
            record.agent_id.to_string(),
            record.iteration,
            ts_to_sql(&record.created_at),
            body
        ],
    )?;
    Ok(())
}

fn write_context(
    conn: &rusqlite::Connection,
    ctx: &AgentContext,
) -> std::result::Result<(), tokio_rusqlite::Error> {
    let body = encode_context(ctx)?;
    conn.execute(
        "INSERT INTO agent_contexts (agent_id, user_id, parent_agent_id, state,
            execution_id, last_update, body)
         VALUES (?1,?2,?3,?4,?5,?6,?7)
         ON CONFLICT(agent_id) DO UPDATE SET
            user_id=excluded.user_id, parent_agent_id=excluded.parent_agent_id,
            state=excluded.state, execution_id=excluded.execution_id,
            last_update=excluded.last_update, body=excluded.body",
        rusqlite::params![
            ctx.agent_id.to_string(),
            ctx.user_id,
            ctx.parent_agent_id.map(|p| p.to_string()),
            ctx.state.as_str(),
            ctx.execution_id.to_string(),
            ts_to_sql(&ctx.last_update),
            body,
        ],
    )?;
    Ok(())
}

fn link_child(
    conn: &rusqlite::Connection,
    parent_id: &str,
    child_id: &str,
) -> std::result::Result<(), tokio_rusqlite::Error> {
    conn.execute(
        "INSERT OR IGNORE INTO agent_children (parent_id, child_id) VALUES (?1, ?2)",
        rusqlite::params![parent_id, child_id],
    )?;
    Ok(())
}

enum SaveOutcome {
    Saved,
    MissingParent(Uuid),
}

impl SqliteAgentStore {
    /// Open (or create) a database at the given file path.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref()).await?;
        let store = Self { conn };
        store.init_schema().await?;
        tracing::debug!(path = %path.as_ref().display(), "agent store opened");
        Ok(store)
    }

    /// Create a purely in-memory database (useful for tests).
    pub async fn new_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().await?;
        let store = Self { conn };
        store.init_schema().await?;
        Ok(store)
    }

    // -----------------------------------------------------------------------
    // Schema
    // -----------------------------------------------------------------------

    async fn init_schema(&self) -> Result<()> {
        self.conn
            .call(|conn| {
                conn.execute_batch(
                    "
                    PRAGMA journal_mode=WAL;
                    PRAGMA synchronous=NORMAL;
                    PRAGMA foreign_keys=ON;
                    PRAGMA busy_timeout=5000;

                    CREATE TABLE IF NOT EXISTS agent_contexts (
                        agent_id        TEXT PRIMARY KEY,
                        user_id         TEXT NOT NULL,
                        parent_agent_id TEXT,
                        state           TEXT NOT NULL,
                        execution_id    TEXT NOT NULL,
                        last_update     TEXT NOT NULL,
                        body            TEXT NOT NULL
                    );

                    CREATE INDEX IF NOT EXISTS idx_agent_contexts_user
                        ON agent_contexts(user_id, last_update);
                    CREATE INDEX IF NOT EXISTS idx_agent_contexts_parent
                        ON agent_contexts(parent_agent_id);

                    CREATE TABLE IF NOT EXISTS agent_children (
                        seq       INTEGER PRIMARY KEY AUTOINCREMENT,
                        parent_id TEXT NOT NULL,
                        child_id  TEXT NOT NULL,
                        UNIQUE(parent_id, child_id)
                    );

                    CREATE TABLE IF NOT EXISTS autonomous_iterations (
                        agent_id   TEXT NOT NULL,
                        iteration  INTEGER NOT NULL,
                        created_at TEXT NOT NULL,
                        body       TEXT NOT NULL,
                        PRIMARY KEY (agent_id, iteration)
                    );
                    ",
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    async fn list_where(&self, user_id: &str, running_only: bool) -> Result<Vec<AgentContext>> {
        let user_id = user_id.to_string();
        let agents = self
            .conn
            .call(move |conn| {
                let sql = if running_only {
                    "SELECT agent_id, body FROM agent_contexts
                     WHERE user_id = ?1 AND state NOT IN ('completed', 'error')
                     ORDER BY last_update DESC"
                } else {
                    "SELECT agent_id, body FROM agent_contexts
                     WHERE user_id = ?1
                     ORDER BY last_update DESC"
                };
                let mut stmt = conn.prepare(sql)?;
                let mut rows = stmt.query(rusqlite::params![user_id])?;
                let mut out = Vec::new();
                while let Some(row) = rows.next()? {
                    let id: String = row.get(0)?;
                    let body: String = row.get(1)?;
                    out.push(read_context(conn, &id, &body)?);
                }
                Ok(out)
            })
            .await?;
        Ok(agents)
    }

    /// Read-modify-write of one context inside a transaction. Nothing is
    /// written when `apply` returns false.
    async fn modify_if<F>(&self, agent_id: Uuid, apply: F) -> Result<Option<AgentContext>>
    where
        F: FnOnce(&mut AgentContext) -> bool + Send + 'static,
    {
        let id = agent_id.to_string();
        let updated = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(mut ctx) = read_row(&tx, &id)? else {
                    return Ok(None);
                };
                if !apply(&mut ctx) {
                    return Ok(Some(None));
                }
                write_context(&tx, &ctx)?;
                tx.commit()?;
                Ok(Some(Some(ctx)))
            })
            .await?;
        updated.ok_or(StoreError::NotFound(agent_id))
    }

    async fn modify<F>(&self, agent_id: Uuid, apply: F) -> Result<()>
    where
        F: FnOnce(&mut AgentContext) + Send + 'static,
    {
        self.modify_if(agent_id, move |ctx| {
            apply(ctx);
            true
        })
        .await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AgentStore for SqliteAgentStore {
    async fn save(&self, ctx: &AgentContext) -> Result<()> {
        let ctx = ctx.clone();
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let agent_id = ctx.agent_id.to_string();

                if let Some(parent_id) = ctx.parent_agent_id {
                    let parent = parent_id.to_string();
                    let exists: Option<i64> = tx
                        .query_row(
                            "SELECT 1 FROM agent_contexts WHERE agent_id = ?1",
                            rusqlite::params![parent],
                            |r| r.get(0),
                        )
                        .optional()?;
                    if exists.is_none() {
                        return Ok(SaveOutcome::MissingParent(parent_id));
                    }
                    link_child(&tx, &parent, &agent_id)?;
                }

                for child in &ctx.child_agent_ids {
                    link_child(&tx, &agent_id, &child.to_string())?;
                }
                write_context(&tx, &ctx)?;
                tx.commit()?;
                Ok(SaveOutcome::Saved)
            })
            .await?;

        match outcome {
            SaveOutcome::Saved => Ok(()),
            SaveOutcome::MissingParent(parent_id) => Err(StoreError::ParentNotFound(parent_id)),
        }
    }

    async fn update_state(&self, ctx: &mut AgentContext, state: AgentState) -> Result<()> {
        let now = Utc::now();
        self.modify(ctx.agent_id, move |stored| {
            stored.state = state;
            stored.last_update = now;
        })
        .await?;
        ctx.state = state;
        ctx.last_update = now;
        Ok(())
    }

    async fn save_if_owned(
        &self,
        ctx: &AgentContext,
        iteration: Option<&AutonomousIteration>,
        expected_execution_id: Uuid,
        expected_state: AgentState,
    ) -> Result<Option<AgentContext>> {
        if let Some(record) = iteration {
            check_iteration(record)?;
        }
        let ctx = ctx.clone();
        let iteration = iteration.cloned();
        let written = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(stored) = read_row(&tx, &ctx.agent_id.to_string())? else {
                    return Ok(None);
                };
                if !still_matches(&stored, expected_execution_id, expected_state) {
                    return Ok(None);
                }
                let record = merge_owned_fields(&ctx, &stored);
                if let Some(iteration) = &iteration {
                    insert_iteration(&tx, iteration)?;
                }
                write_context(&tx, &record)?;
                tx.commit()?;
                Ok(Some(record))
            })
            .await?;
        Ok(written)
    }

    async fn change_state(
        &self,
        agent_id: Uuid,
        change: StateChange,
    ) -> Result<Option<AgentContext>> {
        self.modify_if(agent_id, move |stored| change.apply(stored))
            .await
    }

    async fn load(&self, agent_id: Uuid) -> Result<Option<AgentContext>> {
        let id = agent_id.to_string();
        let ctx = self.conn.call(move |conn| read_row(conn, &id)).await?;
        Ok(ctx)
    }

    async fn list(&self, user_id: &str) -> Result<Vec<AgentContext>> {
        self.list_where(user_id, false).await
    }

    async fn list_running(&self, user_id: &str) -> Result<Vec<AgentContext>> {
        self.list_where(user_id, true).await
    }

    async fn delete(&self, user_id: &str, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let user_id = user_id.to_string();
        let requested: Vec<String> = ids.iter().map(|id| id.to_string()).collect();
        let deleted = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;

                let mut queue: Vec<String> = Vec::new();
                for id in &requested {
                    let row: Option<(String, Option<String>)> = tx
                        .query_row(
                            "SELECT user_id, parent_agent_id FROM agent_contexts
                             WHERE agent_id = ?1",
                            rusqlite::params![id],
                            |r| Ok((r.get(0)?, r.get(1)?)),
                        )
                        .optional()?;
                    if let Some((owner, None)) = row {
                        if owner == user_id {
                            queue.push(id.clone());
                        }
                    }
                }

                let mut doomed: Vec<String> = Vec::new();
                while let Some(id) = queue.pop() {
                    if doomed.contains(&id) {
                        continue;
                    }
                    let mut stmt = tx.prepare(
                        "SELECT child_id FROM agent_children WHERE parent_id = ?1
                         UNION
                         SELECT agent_id FROM agent_contexts WHERE parent_agent_id = ?1",
                    )?;
                    let mut rows = stmt.query(rusqlite::params![id])?;
                    while let Some(row) = rows.next()? {
                        queue.push(row.get(0)?);
                    }
                    doomed.push(id);
                }

                for id in &doomed {
                    tx.execute(
                        "DELETE FROM autonomous_iterations WHERE agent_id = ?1",
                        rusqlite::params![id],
                    )?;
                }
                for id in &doomed {
                    tx.execute(
                        "DELETE FROM agent_children WHERE parent_id = ?1 OR child_id = ?1",
                        rusqlite::params![id],
                    )?;
                    tx.execute(
                        "DELETE FROM agent_contexts WHERE agent_id = ?1",
                        rusqlite::params![id],
                    )?;
                }
                tx.commit()?;

                doomed
                    .iter()
                    .map(|id| Uuid::parse_str(id).map_err(other))
                    .collect::<std::result::Result<Vec<_>, _>>()
            })
            .await?;
        Ok(deleted)
    }

    async fn update_functions(&self, agent_id: Uuid, names: &[String]) -> Result<()> {
        let names = names.to_vec();
        self.modify(agent_id, move |stored| stored.functions = names)
            .await?;
        Ok(())
    }

    async fn update_hil_requested(&self, agent_id: Uuid, requested: bool) -> Result<()> {
        self.modify(agent_id, move |stored| stored.hil_requested = requested)
            .await?;
        Ok(())
    }

    async fn save_iteration(&self, record: &AutonomousIteration) -> Result<()> {
        check_iteration(record)?;
        let record = record.clone();
        self.conn
            .call(move |conn| insert_iteration(conn, &record))
            .await?;
        Ok(())
    }

    async fn load_iterations(&self, agent_id: Uuid) -> Result<Vec<AutonomousIteration>> {
        let id = agent_id.to_string();
        let bodies = self
            .conn
            .call(move |conn| {
                let mut stmt = conn.prepare(
                    "SELECT body FROM autonomous_iterations
                     WHERE agent_id = ?1 ORDER BY iteration ASC",
                )?;
                let mut rows = stmt.query(rusqlite::params![id])?;
                let mut out: Vec<String> = Vec::new();
                while let Some(row) = rows.next()? {
                    out.push(row.get(0)?);
                }
                Ok(out)
            })
            .await?;
        bodies
            .iter()
            .map(|body| serde_json::from_str(body).map_err(StoreError::from))
            .collect()
    }

    async fn clear_iterations(&self, agent_id: Uuid) -> Result<()> {
        let id = agent_id.to_string();
        self.conn
            .call(move |conn| {
                conn.execute(
                    "DELETE FROM autonomous_iterations WHERE agent_id = ?1",
                    rusqlite::params![id],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}
