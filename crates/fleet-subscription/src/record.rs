//! Instance record step ledger.
//!
//! A record's step list starts unset and is filled from the owning
//! subscription's steps on first access. After that each entry may only
//! gain an action, a process handle and extra info; its `id` and `type`
//! never change. Only [`SubscriptionService::reset_steps`] rebuilds the list.

use fleet_state::{
    InstanceRecord, NewInstance, ProcessTree, RowId, StepEntry, SubscriptionStep, epoch_secs,
};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::error::{SubscriptionError, SubscriptionResult};
use crate::runner::{Priority, RunOutcome};
use crate::service::SubscriptionService;

const HOST_SUMMARY_KEYS: &[&str] = &[
    "bk_host_innerip",
    "bk_cloud_id",
    "bk_supplier_account",
    "bk_host_name",
    "bk_host_id",
    "bk_biz_id",
    "bk_biz_name",
    "bk_cloud_name",
];
const SERVICE_SUMMARY_KEYS: &[&str] = &["id", "name", "bk_module_id", "bk_host_id"];

/// Partial update of one step entry. `None` leaves a field as it is.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepPatch {
    /// Must match the current id when given.
    pub id: Option<String>,
    /// Must match the current type when given.
    pub step_type: Option<String>,
    pub pipeline_id: Option<String>,
    pub action: Option<String>,
    /// Merged key by key into the existing extra info.
    pub extra_info: Option<Map<String, Value>>,
}

impl StepPatch {
    pub fn action(action: impl Into<String>) -> Self {
        Self {
            action: Some(action.into()),
            ..Self::default()
        }
    }

    fn apply(self, entry: &mut StepEntry) -> SubscriptionResult<()> {
        if self.id.as_ref().is_some_and(|id| *id != entry.id) {
            return Err(SubscriptionError::ImmutableStepField {
                step_id: entry.id.clone(),
                field: "id",
            });
        }
        if self.step_type.as_ref().is_some_and(|t| *t != entry.step_type) {
            return Err(SubscriptionError::ImmutableStepField {
                step_id: entry.id.clone(),
                field: "type",
            });
        }
        if let Some(pipeline_id) = self.pipeline_id {
            entry.pipeline_id = pipeline_id;
        }
        if let Some(action) = self.action {
            entry.action = Some(action);
        }
        if let Some(extra) = self.extra_info {
            entry.extra_info.extend(extra);
        }
        Ok(())
    }
}

fn initial_steps(steps: &[SubscriptionStep]) -> Vec<StepEntry> {
    steps
        .iter()
        .map(|step| StepEntry {
            id: step.step_id.clone(),
            step_type: step.step_type.clone(),
            pipeline_id: String::new(),
            action: None,
            extra_info: Map::new(),
        })
        .collect()
}

/// Project an instance snapshot down to the fields shown in summaries.
/// Keys absent from the snapshot are left out.
pub fn simple_instance_info(record: &InstanceRecord) -> Value {
    let pick = |section: &str, keys: &[&str]| -> Map<String, Value> {
        record
            .instance_info
            .get(section)
            .and_then(Value::as_object)
            .map(|obj| {
                obj.iter()
                    .filter(|(k, _)| keys.contains(&k.as_str()))
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect()
            })
            .unwrap_or_default()
    };
    let mut summary = Map::new();
    summary.insert("host".to_string(), Value::Object(pick("host", HOST_SUMMARY_KEYS)));
    summary.insert(
        "service".to_string(),
        Value::Object(pick("service", SERVICE_SUMMARY_KEYS)),
    );
    Value::Object(summary)
}

impl SubscriptionService {
    fn record(&self, record_id: RowId) -> SubscriptionResult<InstanceRecord> {
        self.store
            .get_instance_record(record_id)?
            .ok_or_else(|| SubscriptionError::NotFound(format!("instance record {record_id}")))
    }

    /// Add a record for one instance to an existing task. The instance's
    /// previous latest record is demoted in the same transaction.
    pub fn create_instance_record(
        &self,
        task_id: RowId,
        instance: NewInstance,
    ) -> SubscriptionResult<InstanceRecord> {
        let record = self.store.create_instance_record(task_id, instance)?;
        info!(
            task_id,
            record_id = record.id,
            instance_id = %record.instance_id,
            "instance record created"
        );
        Ok(record)
    }

    /// Fill the step list from the subscription. Fails if it is already set.
    pub fn init_steps(&self, record_id: RowId) -> SubscriptionResult<Vec<StepEntry>> {
        let record = self.record(record_id)?;
        let steps = self.cache.get_or_load(&self.store, record.subscription_id)?;
        let updated = self.store.update_instance_record(record_id, |rec| {
            if rec.steps.is_some() {
                return Err(SubscriptionError::StepsAlreadyInitialized(record_id));
            }
            rec.steps = Some(initial_steps(&steps));
            Ok(())
        })?;
        debug!(record_id, steps = steps.len(), "instance steps initialised");
        Ok(updated.steps.unwrap_or_default())
    }

    /// Rebuild the step list from the subscription's current steps,
    /// discarding all progress recorded on it.
    pub fn reset_steps(&self, record_id: RowId) -> SubscriptionResult<Vec<StepEntry>> {
        let record = self.record(record_id)?;
        self.cache.invalidate(record.subscription_id);
        let steps = self.cache.get_or_load(&self.store, record.subscription_id)?;
        let updated = self
            .store
            .update_instance_record::<SubscriptionError>(record_id, |rec| {
                rec.steps = Some(initial_steps(&steps));
                Ok(())
            })?;
        warn!(record_id, "instance steps reset");
        Ok(updated.steps.unwrap_or_default())
    }

    /// The record's steps, initialising them on first access.
    pub fn steps(&self, record_id: RowId) -> SubscriptionResult<Vec<StepEntry>> {
        if let Some(steps) = self.record(record_id)?.steps {
            return Ok(steps);
        }
        match self.init_steps(record_id) {
            Err(SubscriptionError::StepsAlreadyInitialized(_)) => {
                Ok(self.record(record_id)?.steps.unwrap_or_default())
            }
            other => other,
        }
    }

    pub fn get_step(&self, record_id: RowId, step_id: &str) -> SubscriptionResult<StepEntry> {
        self.steps(record_id)?
            .into_iter()
            .find(|step| step.id == step_id)
            .ok_or_else(|| SubscriptionError::StepNotFound {
                record_id,
                step_id: step_id.to_string(),
            })
    }

    /// Merge `patch` into one step and persist the whole list.
    ///
    /// An unknown step id or an attempt to change `id`/`type` fails without
    /// writing anything.
    pub fn set_step(
        &self,
        record_id: RowId,
        step_id: &str,
        patch: StepPatch,
    ) -> SubscriptionResult<StepEntry> {
        let initial = self.steps(record_id)?;
        let mut changed = None;
        self.store
            .update_instance_record::<SubscriptionError>(record_id, |rec| {
                let steps = rec.steps.get_or_insert_with(|| initial.clone());
                let entry = steps
                    .iter_mut()
                    .find(|step| step.id == step_id)
                    .ok_or_else(|| SubscriptionError::StepNotFound {
                        record_id,
                        step_id: step_id.to_string(),
                    })?;
                let mut next = entry.clone();
                patch.apply(&mut next)?;
                *entry = next.clone();
                changed = Some(next);
                Ok(())
            })?;
        let entry = changed.ok_or_else(|| SubscriptionError::StepNotFound {
            record_id,
            step_id: step_id.to_string(),
        })?;
        debug!(record_id, step_id, action = ?entry.action, "step updated");
        Ok(entry)
    }

    /// Point the record at an external process handle.
    pub fn attach_process(
        &self,
        record_id: RowId,
        handle: &str,
    ) -> SubscriptionResult<InstanceRecord> {
        let record = self
            .store
            .update_instance_record::<SubscriptionError>(record_id, |rec| {
                rec.pipeline_id = handle.to_string();
                Ok(())
            })?;
        info!(record_id, handle, "process attached");
        Ok(record)
    }

    /// Store `tree` under `handle` (replacing any earlier tree) and attach it.
    pub fn save_process(
        &self,
        record_id: RowId,
        handle: &str,
        tree: Value,
    ) -> SubscriptionResult<InstanceRecord> {
        self.record(record_id)?;
        self.store.put_process_tree(&ProcessTree {
            handle: handle.to_string(),
            tree,
            created_at: epoch_secs(),
        })?;
        self.attach_process(record_id, handle)
    }

    /// Hand the attached process tree to the runner.
    ///
    /// A refusal from the runner is an error carrying its message.
    pub fn run_process(
        &self,
        record_id: RowId,
        priority: Priority,
    ) -> SubscriptionResult<RunOutcome> {
        let record = self.record(record_id)?;
        if record.pipeline_id.is_empty() {
            return Err(SubscriptionError::NoProcess(record_id));
        }
        let tree = self
            .store
            .get_process_tree(&record.pipeline_id)?
            .ok_or_else(|| {
                SubscriptionError::NotFound(format!("process tree {}", record.pipeline_id))
            })?;
        let outcome = self.runner.run(&tree.handle, &tree.tree, priority);
        if !outcome.success {
            warn!(
                record_id,
                handle = %tree.handle,
                message = %outcome.message,
                "runner refused process"
            );
            return Err(SubscriptionError::Runner {
                handle: tree.handle,
                message: outcome.message,
            });
        }
        info!(record_id, handle = %tree.handle, ?priority, "process started");
        Ok(outcome)
    }

    /// Whether the record's process is running, according to the runner.
    pub fn record_is_running(&self, record_id: RowId) -> SubscriptionResult<bool> {
        let record = self.record(record_id)?;
        Ok(!record.pipeline_id.is_empty() && self.runner.is_running(&record.pipeline_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{SubscriptionSpec, TriggerRequest};
    use crate::testing::FakeRunner;
    use fleet_state::{NewStep, NodeType, ObjectType, StateStore};
    use serde_json::json;
    use std::sync::Arc;

    struct Fixture {
        service: SubscriptionService,
        runner: Arc<FakeRunner>,
        subscription_id: RowId,
        task_id: RowId,
        record_id: RowId,
    }

    fn fixture() -> Fixture {
        let runner = Arc::new(FakeRunner::default());
        let store = StateStore::open_in_memory().unwrap();
        let service = SubscriptionService::new(store, runner.clone());
        let steps = ["agent", "basereport", "processbeat"]
            .into_iter()
            .map(|id| NewStep {
                step_id: id.to_string(),
                step_type: if id == "agent" { "AGENT" } else { "PLUGIN" }.to_string(),
                config: json!({}),
                params: json!({}),
            })
            .collect();
        let created = service
            .create(SubscriptionSpec {
                name: "hosts".to_string(),
                bk_biz_id: None,
                object_type: ObjectType::Host,
                node_type: NodeType::Instance,
                nodes: vec![json!({"bk_host_id": 7})],
                target_hosts: None,
                from_system: "fleet".to_string(),
                creator: "admin".to_string(),
                enable: true,
                is_main: false,
                steps,
            })
            .unwrap();
        let subscription_id = created.subscription.id;
        let (task, records) = service
            .trigger(
                subscription_id,
                TriggerRequest {
                    instances: vec![NewInstance {
                        instance_id: "host|instance|host|7".to_string(),
                        instance_info: json!({
                            "host": {
                                "bk_host_id": 7,
                                "bk_host_innerip": "10.0.0.7",
                                "bk_cloud_id": 0,
                                "bk_host_outerip": "1.2.3.4",
                                "os_type": "linux"
                            },
                            "service": {"id": 3, "name": "nginx", "pid": 99}
                        }),
                    }],
                    ..TriggerRequest::default()
                },
            )
            .unwrap();
        Fixture {
            service,
            runner,
            subscription_id,
            task_id: task.id,
            record_id: records[0].id,
        }
    }

    #[test]
    fn steps_initialise_lazily_once() {
        let f = fixture();
        let stored = f.service.store().get_instance_record(f.record_id).unwrap().unwrap();
        assert!(stored.steps.is_none());

        let steps = f.service.steps(f.record_id).unwrap();
        assert_eq!(
            steps.iter().map(|s| s.id.as_str()).collect::<Vec<_>>(),
            ["agent", "basereport", "processbeat"]
        );
        assert!(steps.iter().all(|s| s.pipeline_id.is_empty() && s.action.is_none()));

        let err = f.service.init_steps(f.record_id).unwrap_err();
        assert!(matches!(err, SubscriptionError::StepsAlreadyInitialized(_)));
    }

    #[test]
    fn set_step_merges_fields() {
        let f = fixture();
        let mut extra = Map::new();
        extra.insert("retry".to_string(), json!(1));
        let patch = StepPatch {
            pipeline_id: Some("node-1".to_string()),
            extra_info: Some(extra),
            ..StepPatch::action("INSTALL")
        };
        let entry = f.service.set_step(f.record_id, "basereport", patch).unwrap();
        assert_eq!(entry.action.as_deref(), Some("INSTALL"));
        assert_eq!(entry.pipeline_id, "node-1");

        let mut more = Map::new();
        more.insert("reason".to_string(), json!("upgrade"));
        f.service
            .set_step(
                f.record_id,
                "basereport",
                StepPatch {
                    extra_info: Some(more),
                    ..StepPatch::default()
                },
            )
            .unwrap();
        let stored = f.service.get_step(f.record_id, "basereport").unwrap();
        assert_eq!(stored.extra_info["retry"], 1);
        assert_eq!(stored.extra_info["reason"], "upgrade");
        assert_eq!(stored.action.as_deref(), Some("INSTALL"));
    }

    #[test]
    fn unknown_step_changes_nothing() {
        let f = fixture();
        f.service
            .set_step(f.record_id, "agent", StepPatch::action("INSTALL"))
            .unwrap();
        let before = f.service.store().get_instance_record(f.record_id).unwrap().unwrap();

        let err = f
            .service
            .set_step(f.record_id, "missing", StepPatch::action("UNINSTALL"))
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::StepNotFound { .. }));
        let err = f.service.get_step(f.record_id, "missing").unwrap_err();
        assert!(matches!(err, SubscriptionError::StepNotFound { .. }));

        let after = f.service.store().get_instance_record(f.record_id).unwrap().unwrap();
        assert_eq!(before.steps, after.steps);
        assert_eq!(before.updated_at, after.updated_at);
    }

    #[test]
    fn identity_fields_are_immutable() {
        let f = fixture();
        let err = f
            .service
            .set_step(
                f.record_id,
                "agent",
                StepPatch {
                    id: Some("renamed".to_string()),
                    action: Some("INSTALL".to_string()),
                    ..StepPatch::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::ImmutableStepField { field: "id", .. }));

        let err = f
            .service
            .set_step(
                f.record_id,
                "agent",
                StepPatch {
                    step_type: Some("PLUGIN".to_string()),
                    ..StepPatch::default()
                },
            )
            .unwrap_err();
        assert!(matches!(err, SubscriptionError::ImmutableStepField { field: "type", .. }));
        assert_eq!(f.service.get_step(f.record_id, "agent").unwrap().action, None);

        let same = StepPatch {
            id: Some("agent".to_string()),
            step_type: Some("AGENT".to_string()),
            ..StepPatch::action("INSTALL")
        };
        assert!(f.service.set_step(f.record_id, "agent", same).is_ok());
    }

    #[test]
    fn reset_discards_progress() {
        let f = fixture();
        f.service
            .set_step(f.record_id, "agent", StepPatch::action("INSTALL"))
            .unwrap();
        let steps = f.service.reset_steps(f.record_id).unwrap();
        assert!(steps.iter().all(|s| s.action.is_none()));
    }

    #[test]
    fn new_record_supersedes_latest() {
        let f = fixture();
        let instance = NewInstance {
            instance_id: "host|instance|host|7".to_string(),
            instance_info: json!({}),
        };
        let newer = f.service.create_instance_record(f.task_id, instance).unwrap();
        assert!(newer.is_latest);

        let old = f.service.store().get_instance_record(f.record_id).unwrap().unwrap();
        assert!(!old.is_latest);
        let latest = f
            .service
            .store()
            .list_latest_records(f.subscription_id)
            .unwrap();
        assert_eq!(latest.len(), 1);
        assert_eq!(latest[0].id, newer.id);

        // step updates on the stale record never re-promote it
        f.service
            .set_step(f.record_id, "agent", StepPatch::action("INSTALL"))
            .unwrap();
        let old = f.service.store().get_instance_record(f.record_id).unwrap().unwrap();
        assert!(!old.is_latest);
    }

    #[test]
    fn process_lifecycle() {
        let f = fixture();
        let err = f.service.run_process(f.record_id, Priority::Normal).unwrap_err();
        assert!(matches!(err, SubscriptionError::NoProcess(_)));

        let tree = json!({"start": "n1", "activities": {"n1": {"component": "install"}}});
        let record = f.service.save_process(f.record_id, "pipe-7", tree.clone()).unwrap();
        assert_eq!(record.pipeline_id, "pipe-7");

        let outcome = f.service.run_process(f.record_id, Priority::High).unwrap();
        assert!(outcome.success);
        assert_eq!(f.runner.started(), vec![("pipe-7".to_string(), tree, Priority::High)]);
        assert!(f.service.record_is_running(f.record_id).unwrap());
        assert!(f.service.is_running(f.subscription_id).unwrap());
    }

    #[test]
    fn runner_refusal_is_an_error() {
        let f = fixture();
        f.service
            .save_process(f.record_id, "pipe-8", json!({}))
            .unwrap();
        f.runner.refuse_with("engine overloaded");
        let err = f.service.run_process(f.record_id, Priority::Low).unwrap_err();
        match err {
            SubscriptionError::Runner { handle, message } => {
                assert_eq!(handle, "pipe-8");
                assert_eq!(message, "engine overloaded");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(!f.service.record_is_running(f.record_id).unwrap());
    }

    #[test]
    fn summary_keeps_known_keys() {
        let f = fixture();
        let record = f.service.store().get_instance_record(f.record_id).unwrap().unwrap();
        let summary = simple_instance_info(&record);
        assert_eq!(
            summary,
            json!({
                "host": {"bk_host_id": 7, "bk_host_innerip": "10.0.0.7", "bk_cloud_id": 0},
                "service": {"id": 3, "name": "nginx"}
            })
        );

        let bare = InstanceRecord {
            instance_info: json!({"host": {"bk_host_id": 1}}),
            ..record
        };
        assert_eq!(
            simple_instance_info(&bare),
            json!({"host": {"bk_host_id": 1}, "service": {}})
        );
    }
}
