//! In-memory process runner for tests.

use std::collections::HashSet;
use std::sync::{Mutex, PoisonError};

use serde_json::Value;

use crate::runner::{Priority, ProcessRunner, RunOutcome};

#[derive(Default)]
pub(crate) struct FakeRunner {
    started: Mutex<Vec<(String, Value, Priority)>>,
    running: Mutex<HashSet<String>>,
    refusal: Mutex<Option<String>>,
}

impl FakeRunner {
    pub(crate) fn started(&self) -> Vec<(String, Value, Priority)> {
        self.started.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub(crate) fn set_running(&self, handle: &str, running: bool) {
        let mut set = self.running.lock().unwrap_or_else(PoisonError::into_inner);
        if running {
            set.insert(handle.to_string());
        } else {
            set.remove(handle);
        }
    }

    pub(crate) fn refuse_with(&self, message: &str) {
        *self.refusal.lock().unwrap_or_else(PoisonError::into_inner) = Some(message.to_string());
    }
}

impl ProcessRunner for FakeRunner {
    fn run(&self, handle: &str, tree: &Value, priority: Priority) -> RunOutcome {
        if let Some(message) = self.refusal.lock().unwrap_or_else(PoisonError::into_inner).clone() {
            return RunOutcome::failed(message);
        }
        self.started
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((handle.to_string(), tree.clone(), priority));
        self.set_running(handle, true);
        RunOutcome::ok()
    }

    fn is_running(&self, handle: &str) -> bool {
        self.running
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(handle)
    }
}
