//! Process-wide registry of runs currently executing a chunk.
//!
//! An out-of-band signal (operator action, adaptive controller) can ask a
//! mid-flight run to yield at its next checkpoint. The coordinator does not
//! cancel anything: it flips `force_yield_immediately` in the store so the
//! next body built for the run asks the endpoint to stop early.
//!
//! The registry itself is a process-global static: every coordinator handle
//! in the process observes the same in-flight set, and it needs no
//! initialisation beyond the process.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

use once_cell::sync::Lazy;

use crate::models::RunId;
use crate::store::{CoordinatorStore, StoreResult};

static IN_FLIGHT: Lazy<Mutex<HashSet<RunId>>> = Lazy::new(|| Mutex::new(HashSet::new()));

fn in_flight() -> MutexGuard<'static, HashSet<RunId>> {
    IN_FLIGHT.lock().expect("yield registry poisoned")
}

pub struct YieldCoordinator {
    store: Arc<dyn CoordinatorStore>,
}

impl YieldCoordinator {
    pub fn new(store: Arc<dyn CoordinatorStore>) -> Self {
        Self { store }
    }

    /// Track the run for the duration of a chunk. Deregistration happens in
    /// the guard's `Drop`, so every exit path of the caller is covered.
    pub fn register(&self, id: RunId) -> RunRegistration {
        in_flight().insert(id);
        RunRegistration { id }
    }

    pub fn is_registered(&self, id: RunId) -> bool {
        in_flight().contains(&id)
    }

    /// Request a yield at the run's next checkpoint. The store flag is set
    /// regardless; the return value reports whether the run was mid-chunk
    /// at the time of the request.
    pub async fn force_yield(&self, id: RunId) -> StoreResult<bool> {
        let mid_flight = self.is_registered(id);
        self.store.set_force_yield(id, true).await?;
        Ok(mid_flight)
    }
}

pub struct RunRegistration {
    id: RunId,
}

impl Drop for RunRegistration {
    fn drop(&mut self) {
        in_flight().remove(&self.id);
    }
}
