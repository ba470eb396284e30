//! Per-execution mutual exclusion.
//!
//! Two mechanisms, used together:
//!
//! - [`ExecutionLocks::lock`] hands out an async mutex guard per execution.
//!   Every read-modify-write of an execution holds it.
//! - [`ExecutionLocks::try_claim_loop`] makes the step loop single-flight. The
//!   claim must be released while the execution lock is held, right after the
//!   loop observes a state it cannot advance; a caller that changes the state
//!   under the lock and then tries to claim will therefore either see the old
//!   loop continue or win the claim itself.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::OwnedMutexGuard;
use vigil_core::ExecutionId;

#[derive(Debug, Default)]
pub struct ExecutionLocks {
    locks: Mutex<HashMap<ExecutionId, Arc<tokio::sync::Mutex<()>>>>,
    running: Mutex<HashSet<ExecutionId>>,
}

/// Held execution lock.
pub type ExecutionGuard = OwnedMutexGuard<()>;

impl ExecutionLocks {
    pub fn new() -> Self {
        Self::default()
    }

    fn registry(&self) -> MutexGuard<'_, HashMap<ExecutionId, Arc<tokio::sync::Mutex<()>>>> {
        self.locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn running(&self) -> MutexGuard<'_, HashSet<ExecutionId>> {
        self.running.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Wait for and take the execution's lock.
    pub async fn lock(&self, execution_id: ExecutionId) -> ExecutionGuard {
        let mutex = self.registry().entry(execution_id).or_default().clone();
        mutex.lock_owned().await
    }

    /// Claim the step loop of an execution. `None` when another loop owns it.
    pub fn try_claim_loop(self: &Arc<Self>, execution_id: ExecutionId) -> Option<LoopClaim> {
        if self.running().insert(execution_id) {
            Some(LoopClaim {
                locks: Arc::clone(self),
                execution_id,
                released: false,
            })
        } else {
            None
        }
    }

    /// Whether a step loop currently owns the execution.
    pub fn loop_active(&self, execution_id: ExecutionId) -> bool {
        self.running().contains(&execution_id)
    }

    /// Drop the registry entry when nobody holds or waits on it.
    pub fn forget(&self, execution_id: ExecutionId) {
        let mut registry = self.registry();
        if let Some(mutex) = registry.get(&execution_id) {
            if Arc::strong_count(mutex) == 1 {
                registry.remove(&execution_id);
            }
        }
    }

    pub fn tracked(&self) -> usize {
        self.registry().len()
    }
}

/// Ownership of an execution's step loop. Released on drop.
#[derive(Debug)]
pub struct LoopClaim {
    locks: Arc<ExecutionLocks>,
    execution_id: ExecutionId,
    released: bool,
}

impl LoopClaim {
    pub fn execution_id(&self) -> ExecutionId {
        self.execution_id
    }

    /// Give up the claim. Call while holding the execution lock.
    pub fn release(&mut self) {
        if !self.released {
            self.locks.running().remove(&self.execution_id);
            self.released = true;
        }
    }
}

impl Drop for LoopClaim {
    fn drop(&mut self) {
        self.release();
    }
}
