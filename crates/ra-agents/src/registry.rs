use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("agent {agent_id} is already executing (execution {execution_id})")]
    AlreadyExecuting { agent_id: Uuid, execution_id: Uuid },
}

// ---------------------------------------------------------------------------
// ExecutionRegistry
// ---------------------------------------------------------------------------

/// What the registry knows about an in-flight task.
#[derive(Debug, Clone, PartialEq)]
pub struct RunningExecution {
    pub execution_id: Uuid,
    pub started_at: DateTime<Utc>,
    token: u64,
}

/// Agents with a task running in this process.
///
/// Only answers "is something running here for this id". Agent state lives
/// in the store; after a restart this registry is empty whatever the store
/// says. Cloning shares the same table.
#[derive(Debug, Clone, Default)]
pub struct ExecutionRegistry {
    running: Arc<DashMap<Uuid, RunningExecution>>,
    next_token: Arc<AtomicU64>,
}

impl ExecutionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task for `agent_id`. The entry lives exactly as long as the
    /// returned claim.
    pub fn claim(&self, agent_id: Uuid, execution_id: Uuid) -> Result<ExecutionClaim, RegistryError> {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        match self.running.entry(agent_id) {
            Entry::Occupied(existing) => Err(RegistryError::AlreadyExecuting {
                agent_id,
                execution_id: existing.get().execution_id,
            }),
            Entry::Vacant(slot) => {
                slot.insert(RunningExecution {
                    execution_id,
                    started_at: Utc::now(),
                    token,
                });
                tracing::debug!(%agent_id, %execution_id, "execution registered");
                Ok(ExecutionClaim {
                    agent_id,
                    execution_id,
                    token,
                    running: Arc::clone(&self.running),
                })
            }
        }
    }

    /// Synchronous liveness probe.
    pub fn is_executing(&self, agent_id: &Uuid) -> bool {
        self.running.contains_key(agent_id)
    }

    pub fn get(&self, agent_id: &Uuid) -> Option<RunningExecution> {
        self.running.get(agent_id).map(|entry| entry.value().clone())
    }

    pub fn running_ids(&self) -> Vec<Uuid> {
        self.running.iter().map(|entry| *entry.key()).collect()
    }

    pub fn len(&self) -> usize {
        self.running.len()
    }

    pub fn is_empty(&self) -> bool {
        self.running.is_empty()
    }
}

// ---------------------------------------------------------------------------
// ExecutionClaim
// ---------------------------------------------------------------------------

/// Registry entry guard. Dropping it removes the entry, whether the task
/// returned, failed or panicked. Only the claim that inserted an entry can
/// remove it.
#[derive(Debug)]
pub struct ExecutionClaim {
    agent_id: Uuid,
    execution_id: Uuid,
    token: u64,
    running: Arc<DashMap<Uuid, RunningExecution>>,
}

impl ExecutionClaim {
    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    pub fn execution_id(&self) -> Uuid {
        self.execution_id
    }
}

impl Drop for ExecutionClaim {
    fn drop(&mut self) {
        let token = self.token;
        if self
            .running
            .remove_if(&self.agent_id, |_, entry| entry.token == token)
            .is_some()
        {
            tracing::debug!(
                agent_id = %self.agent_id,
                execution_id = %self.execution_id,
                "execution released"
            );
        }
    }
}
