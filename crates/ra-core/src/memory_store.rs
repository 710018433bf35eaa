use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};

use chrono::Utc;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::store::{
    check_iteration, merge_owned_fields, sort_recent_first, still_matches, AgentStore, Result,
    StateChange, StoreError,
};
use crate::types::{AgentContext, AgentState, AutonomousIteration};

#[derive(Default)]
struct Tables {
    agents: HashMap<Uuid, AgentContext>,
    iterations: HashMap<Uuid, BTreeMap<u32, AutonomousIteration>>,
}

/// In-process [`AgentStore`]. One lock guards both tables, which gives the
/// parent linkage and cascade delete the same all-or-nothing behaviour the
/// SQLite adapter gets from transactions.
#[derive(Default)]
pub struct MemoryAgentStore {
    tables: Mutex<Tables>,
}

impl MemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait::async_trait]
impl AgentStore for MemoryAgentStore {
    async fn save(&self, ctx: &AgentContext) -> Result<()> {
        let mut tables = self.tables.lock().await;

        if let Some(parent_id) = ctx.parent_agent_id {
            let parent = tables
                .agents
                .get_mut(&parent_id)
                .ok_or(StoreError::ParentNotFound(parent_id))?;
            parent.add_child(ctx.agent_id);
        }

        let mut record = ctx.clone();
        if let Some(existing) = tables.agents.get(&ctx.agent_id) {
            for child in &existing.child_agent_ids {
                record.add_child(*child);
            }
        }
        tables.agents.insert(record.agent_id, record);
        Ok(())
    }

    async fn update_state(&self, ctx: &mut AgentContext, state: AgentState) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .agents
            .get_mut(&ctx.agent_id)
            .ok_or(StoreError::NotFound(ctx.agent_id))?;
        let now = Utc::now();
        stored.state = state;
        stored.last_update = now;
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
        let mut tables = self.tables.lock().await;
        let Some(stored) = tables.agents.get(&ctx.agent_id) else {
            return Ok(None);
        };
        if !still_matches(stored, expected_execution_id, expected_state) {
            return Ok(None);
        }
        let record = merge_owned_fields(ctx, stored);
        if let Some(iteration) = iteration {
            tables
                .iterations
                .entry(iteration.agent_id)
                .or_default()
                .insert(iteration.iteration, iteration.clone());
        }
        tables.agents.insert(record.agent_id, record.clone());
        Ok(Some(record))
    }

    async fn change_state(
        &self,
        agent_id: Uuid,
        change: StateChange,
    ) -> Result<Option<AgentContext>> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .agents
            .get_mut(&agent_id)
            .ok_or(StoreError::NotFound(agent_id))?;
        Ok(change.apply(stored).then(|| stored.clone()))
    }

    async fn load(&self, agent_id: Uuid) -> Result<Option<AgentContext>> {
        Ok(self.tables.lock().await.agents.get(&agent_id).cloned())
    }

    async fn list(&self, user_id: &str) -> Result<Vec<AgentContext>> {
        let tables = self.tables.lock().await;
        let mut out: Vec<AgentContext> = tables
            .agents
            .values()
            .filter(|a| a.user_id == user_id)
            .cloned()
            .collect();
        sort_recent_first(&mut out);
        Ok(out)
    }

    async fn list_running(&self, user_id: &str) -> Result<Vec<AgentContext>> {
        let mut out = self.list(user_id).await?;
        out.retain(|a| !a.state.is_terminal());
        Ok(out)
    }

    async fn delete(&self, user_id: &str, ids: &[Uuid]) -> Result<Vec<Uuid>> {
        let mut tables = self.tables.lock().await;

        let mut queue: VecDeque<Uuid> = ids
            .iter()
            .copied()
            .filter(|id| {
                tables
                    .agents
                    .get(id)
                    .is_some_and(|a| a.user_id == user_id && a.parent_agent_id.is_none())
            })
            .collect();

        let mut doomed: Vec<Uuid> = Vec::new();
        let mut seen: HashSet<Uuid> = HashSet::new();
        while let Some(id) = queue.pop_front() {
            if !seen.insert(id) {
                continue;
            }
            doomed.push(id);
            let mut children: Vec<Uuid> = tables
                .agents
                .get(&id)
                .map(|a| a.child_agent_ids.clone())
                .unwrap_or_default();
            children.extend(
                tables
                    .agents
                    .values()
                    .filter(|a| a.parent_agent_id == Some(id))
                    .map(|a| a.agent_id),
            );
            queue.extend(children);
        }

        for id in &doomed {
            tables.iterations.remove(id);
        }
        for id in &doomed {
            tables.agents.remove(id);
        }
        Ok(doomed)
    }

    async fn update_functions(&self, agent_id: Uuid, names: &[String]) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .agents
            .get_mut(&agent_id)
            .ok_or(StoreError::NotFound(agent_id))?;
        stored.functions = names.to_vec();
        Ok(())
    }

    async fn update_hil_requested(&self, agent_id: Uuid, requested: bool) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let stored = tables
            .agents
            .get_mut(&agent_id)
            .ok_or(StoreError::NotFound(agent_id))?;
        stored.hil_requested = requested;
        Ok(())
    }

    async fn save_iteration(&self, record: &AutonomousIteration) -> Result<()> {
        check_iteration(record)?;
        self.tables
            .lock()
            .await
            .iterations
            .entry(record.agent_id)
            .or_default()
            .insert(record.iteration, record.clone());
        Ok(())
    }

    async fn load_iterations(&self, agent_id: Uuid) -> Result<Vec<AutonomousIteration>> {
        Ok(self
            .tables
            .lock()
            .await
            .iterations
            .get(&agent_id)
            .map(|by_number| by_number.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn clear_iterations(&self, agent_id: Uuid) -> Result<()> {
        self.tables.lock().await.iterations.remove(&agent_id);
        Ok(())
    }
}
