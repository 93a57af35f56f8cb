//! Per-subscription step list cache.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use fleet_state::{RowId, StateStore, SubscriptionStep};
use tracing::debug;

use crate::error::{SubscriptionError, SubscriptionResult};

/// Loaded step lists keyed by subscription id.
///
/// Entries are filled on first use and stay until [`StepCache::invalidate`]
/// or [`StepCache::clear`] drops them.
#[derive(Debug, Default)]
pub struct StepCache {
    entries: Mutex<HashMap<RowId, Arc<[SubscriptionStep]>>>,
}

impl StepCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Steps of `subscription_id`, loading them from `store` on a miss.
    pub fn get_or_load(
        &self,
        store: &StateStore,
        subscription_id: RowId,
    ) -> SubscriptionResult<Arc<[SubscriptionStep]>> {
        if let Some(steps) = self.lock().get(&subscription_id) {
            return Ok(Arc::clone(steps));
        }
        if store.get_subscription(subscription_id)?.is_none() {
            return Err(SubscriptionError::NotFound(format!(
                "subscription {subscription_id}"
            )));
        }
        let steps: Arc<[SubscriptionStep]> = store.list_steps(subscription_id)?.into();
        debug!(subscription_id, steps = steps.len(), "subscription steps cached");
        self.lock().insert(subscription_id, Arc::clone(&steps));
        Ok(steps)
    }

    pub fn invalidate(&self, subscription_id: RowId) {
        self.lock().remove(&subscription_id);
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RowId, Arc<[SubscriptionStep]>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
