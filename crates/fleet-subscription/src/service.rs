//! Subscription model operations and task triggering.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_state::{
    InstanceRecord, NewInstance, NewStep, NodeType, ObjectType, RowId, StateStore, Subscription,
    SubscriptionStep, SubscriptionTask,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::cache::StepCache;
use crate::error::{SubscriptionError, SubscriptionResult};
use crate::runner::ProcessRunner;

/// Everything needed to create a subscription.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionSpec {
    pub name: String,
    pub bk_biz_id: Option<i64>,
    pub object_type: ObjectType,
    pub node_type: NodeType,
    pub nodes: Vec<Value>,
    pub target_hosts: Option<Value>,
    pub from_system: String,
    pub creator: String,
    pub enable: bool,
    pub is_main: bool,
    pub steps: Vec<NewStep>,
}

/// Target scope of a subscription, as recorded on every task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scope {
    pub bk_biz_id: Option<i64>,
    pub object_type: ObjectType,
    pub node_type: NodeType,
    pub nodes: Vec<Value>,
    /// Hosts in the node list carry their own `instance_info` and must be
    /// registered before anything runs on them.
    pub need_register: bool,
}

impl Scope {
    pub fn of(subscription: &Subscription) -> Self {
        let need_register = subscription.node_type == NodeType::Instance
            && subscription.object_type == ObjectType::Host
            && subscription
                .nodes
                .iter()
                .any(|node| node.get("instance_info").is_some());
        Self {
            bk_biz_id: subscription.bk_biz_id,
            object_type: subscription.object_type,
            node_type: subscription.node_type,
            nodes: subscription.nodes.clone(),
            need_register,
        }
    }
}

/// A subscription together with its ordered steps.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscriptionWithSteps {
    pub subscription: Subscription,
    pub steps: Vec<SubscriptionStep>,
}

/// One trigger of a subscription.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TriggerRequest {
    pub instances: Vec<NewInstance>,
    /// instance id → action name. Every key must name one of `instances`.
    pub actions: BTreeMap<String, String>,
    pub is_auto_trigger: bool,
}

/// Subscription operations over a state store and an external runner.
#[derive(Clone)]
pub struct SubscriptionService {
    pub(crate) store: StateStore,
    pub(crate) runner: Arc<dyn ProcessRunner>,
    pub(crate) cache: Arc<StepCache>,
}

impl SubscriptionService {
    pub fn new(store: StateStore, runner: Arc<dyn ProcessRunner>) -> Self {
        Self {
            store,
            runner,
            cache: Arc::new(StepCache::new()),
        }
    }

    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The step list cache; call [`StepCache::invalidate`] after editing a
    /// subscription's steps out of band.
    pub fn step_cache(&self) -> &StepCache {
        &self.cache
    }

    /// Create a subscription and its steps.
    pub fn create(&self, spec: SubscriptionSpec) -> SubscriptionResult<SubscriptionWithSteps> {
        if spec.steps.is_empty() {
            return Err(SubscriptionError::Invalid(format!(
                "subscription {:?} has no steps",
                spec.name
            )));
        }
        let record = Subscription {
            id: 0,
            name: spec.name,
            bk_biz_id: spec.bk_biz_id,
            object_type: spec.object_type,
            node_type: spec.node_type,
            nodes: spec.nodes,
            target_hosts: spec.target_hosts,
            from_system: spec.from_system,
            creator: spec.creator,
            enable: spec.enable,
            is_main: spec.is_main,
            is_deleted: false,
            created_at: 0,
            updated_at: 0,
        };
        let (subscription, steps) = self.store.create_subscription(&record, spec.steps)?;
        info!(
            subscription_id = subscription.id,
            name = %subscription.name,
            steps = steps.len(),
            "subscription created"
        );
        Ok(SubscriptionWithSteps {
            subscription,
            steps,
        })
    }

    pub fn get(&self, id: RowId) -> SubscriptionResult<SubscriptionWithSteps> {
        let subscription = self
            .store
            .get_subscription(id)?
            .ok_or_else(|| SubscriptionError::NotFound(format!("subscription {id}")))?;
        let steps = self.cache.get_or_load(&self.store, id)?.to_vec();
        Ok(SubscriptionWithSteps {
            subscription,
            steps,
        })
    }

    /// Subscriptions by id (all when `ids` is empty), optionally filtered
    /// by their deleted flag, with steps loaded in one pass.
    pub fn get_subscriptions(
        &self,
        ids: &[RowId],
        deleted: Option<bool>,
    ) -> SubscriptionResult<Vec<SubscriptionWithSteps>> {
        let subscriptions = self.store.list_subscriptions(ids, deleted)?;
        let found: Vec<RowId> = subscriptions.iter().map(|s| s.id).collect();
        let mut steps = self.store.steps_for(&found)?;
        Ok(subscriptions
            .into_iter()
            .map(|subscription| SubscriptionWithSteps {
                steps: steps.remove(&subscription.id).unwrap_or_default(),
                subscription,
            })
            .collect())
    }

    pub fn scope(&self, id: RowId) -> SubscriptionResult<Scope> {
        Ok(Scope::of(&self.get(id)?.subscription))
    }

    /// Logically delete a subscription. Its records stay queryable.
    pub fn delete(&self, id: RowId) -> SubscriptionResult<Subscription> {
        let subscription = self.store.soft_delete_subscription(id)?;
        self.cache.invalidate(id);
        info!(subscription_id = id, "subscription deleted");
        Ok(subscription)
    }

    pub fn set_enabled(&self, id: RowId, enable: bool) -> SubscriptionResult<Subscription> {
        let subscription = self.store.set_subscription_enabled(id, enable)?;
        info!(subscription_id = id, enable, "subscription toggled");
        Ok(subscription)
    }

    /// Whether any latest instance record of the subscription has a process
    /// the runner still reports as running.
    pub fn is_running(&self, id: RowId) -> SubscriptionResult<bool> {
        let records = self.store.list_latest_records(id)?;
        Ok(records
            .iter()
            .any(|rec| !rec.pipeline_id.is_empty() && self.runner.is_running(&rec.pipeline_id)))
    }

    /// Create a task over the subscription's scope with one latest instance
    /// record per target instance.
    pub fn trigger(
        &self,
        id: RowId,
        request: TriggerRequest,
    ) -> SubscriptionResult<(SubscriptionTask, Vec<InstanceRecord>)> {
        let subscription = self.get(id)?.subscription;
        if subscription.is_deleted {
            return Err(SubscriptionError::Invalid(format!(
                "subscription {id} is deleted"
            )));
        }
        if request.is_auto_trigger && !subscription.enable {
            warn!(subscription_id = id, "auto trigger on disabled subscription refused");
            return Err(SubscriptionError::Invalid(format!(
                "subscription {id} is disabled"
            )));
        }
        if let Some(unknown) = request
            .actions
            .keys()
            .find(|key| !request.instances.iter().any(|i| &i.instance_id == *key))
        {
            return Err(SubscriptionError::Invalid(format!(
                "action given for instance {unknown:?} outside the task"
            )));
        }

        let scope = serde_json::to_value(Scope::of(&subscription))
            .map_err(|e| SubscriptionError::Invalid(format!("scope: {e}")))?;
        let (task, records) = self.store.create_task(
            id,
            scope,
            request.actions,
            request.is_auto_trigger,
            request.instances,
        )?;
        debug!(task_id = task.id, records = records.len(), "task records created");
        info!(
            subscription_id = id,
            task_id = task.id,
            auto = task.is_auto_trigger,
            "subscription triggered"
        );
        Ok((task, records))
    }
}
