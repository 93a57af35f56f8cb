//! Subscriptions, steps, tasks, instance records and process trees.
//!
//! The `LATEST_RECORDS` index holds, per `(subscription, instance)`, the id
//! of the only record whose `is_latest` flag is set. Every record insert
//! reads that index, clears the flag on the superseded record and points the
//! index at the new one inside the same write transaction.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use redb::{ReadableDatabase, ReadableTable, Table};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{StateError, StateResult};
use crate::store::{StateStore, decode, encode, epoch_secs, next_id};
use crate::tables::*;
use crate::types::*;

const SUBSCRIPTION_SEQ: &str = "subscriptions";
const TASK_SEQ: &str = "subscription_tasks";
const RECORD_SEQ: &str = "instance_records";

/// Insert `record` as the latest for its instance, demoting the previous one.
fn insert_latest(
    records: &mut Table<'_, u64, &'static [u8]>,
    latest: &mut Table<'_, &'static str, u64>,
    mut record: InstanceRecord,
) -> StateResult<InstanceRecord> {
    let key = latest_key(record.subscription_id, &record.instance_id);
    let previous_id = latest
        .get(key.as_str())
        .map_err(map_err!(Read))?
        .map(|guard| guard.value());
    if let Some(previous_id) = previous_id {
        let previous: Option<InstanceRecord> = records
            .get(previous_id)
            .map_err(map_err!(Read))?
            .map(|guard| decode(guard.value()))
            .transpose()?;
        if let Some(mut previous) = previous {
            previous.is_latest = false;
            previous.updated_at = record.created_at;
            records
                .insert(previous_id, encode(&previous)?.as_slice())
                .map_err(map_err!(Write))?;
        }
    }
    record.is_latest = true;
    records
        .insert(record.id, encode(&record)?.as_slice())
        .map_err(map_err!(Write))?;
    latest
        .insert(key.as_str(), record.id)
        .map_err(map_err!(Write))?;
    debug!(
        subscription_id = record.subscription_id,
        instance_id = %record.instance_id,
        record_id = record.id,
        superseded = ?previous_id,
        "instance record is latest"
    );
    Ok(record)
}

fn new_record(
    id: RowId,
    task_id: RowId,
    subscription_id: RowId,
    instance: NewInstance,
    now: u64,
) -> InstanceRecord {
    InstanceRecord {
        id,
        task_id,
        subscription_id,
        instance_id: instance.instance_id,
        instance_info: instance.instance_info,
        steps: None,
        pipeline_id: String::new(),
        need_clean: false,
        is_latest: true,
        created_at: now,
        updated_at: now,
    }
}

impl StateStore {
    // ── Subscriptions ──────────────────────────────────────────────

    /// Insert a subscription with its ordered steps.
    ///
    /// Step ids must be unique within the subscription; step indexes are
    /// assigned from list position.
    pub fn create_subscription(
        &self,
        subscription: &Subscription,
        steps: Vec<NewStep>,
    ) -> StateResult<(Subscription, Vec<SubscriptionStep>)> {
        let mut seen = HashSet::new();
        for step in &steps {
            if !seen.insert(step.step_id.as_str()) {
                return Err(StateError::Conflict(format!(
                    "duplicate step id {:?} in subscription",
                    step.step_id
                )));
            }
        }

        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let stored;
        let mut stored_steps = Vec::with_capacity(steps.len());
        {
            let id = next_id(&txn, SUBSCRIPTION_SEQ)?;
            stored = Subscription {
                id,
                is_deleted: false,
                created_at: now,
                updated_at: now,
                ..subscription.clone()
            };
            let mut subs = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            subs.insert(id, encode(&stored)?.as_slice())
                .map_err(map_err!(Write))?;

            let mut step_table = txn.open_table(SUBSCRIPTION_STEPS).map_err(map_err!(Table))?;
            for (index, step) in steps.into_iter().enumerate() {
                let row = SubscriptionStep {
                    subscription_id: id,
                    index: index as u32,
                    step_id: step.step_id,
                    step_type: step.step_type,
                    config: step.config,
                    params: step.params,
                };
                step_table
                    .insert(row.table_key().as_str(), encode(&row)?.as_slice())
                    .map_err(map_err!(Write))?;
                stored_steps.push(row);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(id = stored.id, steps = stored_steps.len(), "subscription created");
        Ok((stored, stored_steps))
    }

    pub fn get_subscription(&self, id: RowId) -> StateResult<Option<Subscription>> {
        self.get_row(SUBSCRIPTIONS, id)
    }

    /// Subscriptions by id (every subscription when `ids` is empty),
    /// optionally filtered on the soft-delete flag. Missing ids are skipped.
    pub fn list_subscriptions(
        &self,
        ids: &[RowId],
        deleted: Option<bool>,
    ) -> StateResult<Vec<Subscription>> {
        let wanted: BTreeSet<RowId> = ids.iter().copied().collect();
        self.list_rows(SUBSCRIPTIONS, |sub: &Subscription| {
            (wanted.is_empty() || wanted.contains(&sub.id))
                && deleted.is_none_or(|d| d == sub.is_deleted)
        })
    }

    /// Ordered steps of one subscription.
    pub fn list_steps(&self, subscription_id: RowId) -> StateResult<Vec<SubscriptionStep>> {
        let mut by_sub = self.steps_for(&[subscription_id])?;
        Ok(by_sub.remove(&subscription_id).unwrap_or_default())
    }

    /// Ordered steps of many subscriptions, read in one transaction.
    pub fn steps_for(
        &self,
        subscription_ids: &[RowId],
    ) -> StateResult<BTreeMap<RowId, Vec<SubscriptionStep>>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(SUBSCRIPTION_STEPS).map_err(map_err!(Table))?;
        let mut results = BTreeMap::new();
        for &id in subscription_ids {
            let prefix = step_prefix(id);
            let mut steps = Vec::new();
            for entry in table.range(prefix.as_str()..).map_err(map_err!(Read))? {
                let (key, value) = entry.map_err(map_err!(Read))?;
                if !key.value().starts_with(&prefix) {
                    break;
                }
                steps.push(decode::<SubscriptionStep>(value.value())?);
            }
            results.insert(id, steps);
        }
        Ok(results)
    }

    /// Logically delete a subscription. Steps and records are kept.
    pub fn soft_delete_subscription(&self, id: RowId) -> StateResult<Subscription> {
        self.update_subscription(id, |sub| sub.is_deleted = true)
    }

    pub fn set_subscription_enabled(&self, id: RowId, enable: bool) -> StateResult<Subscription> {
        self.update_subscription(id, |sub| sub.enable = enable)
    }

    fn update_subscription(
        &self,
        id: RowId,
        change: impl FnOnce(&mut Subscription),
    ) -> StateResult<Subscription> {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut subs = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            let found: Option<Subscription> = subs
                .get(id)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            let mut sub = found.ok_or_else(|| StateError::NotFound(format!("subscription {id}")))?;
            change(&mut sub);
            sub.updated_at = epoch_secs();
            subs.insert(id, encode(&sub)?.as_slice())
                .map_err(map_err!(Write))?;
            updated = sub;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Tasks & instance records ───────────────────────────────────

    /// Create a task and one latest instance record per target instance.
    pub fn create_task(
        &self,
        subscription_id: RowId,
        scope: Value,
        actions: BTreeMap<String, String>,
        is_auto_trigger: bool,
        instances: Vec<NewInstance>,
    ) -> StateResult<(SubscriptionTask, Vec<InstanceRecord>)> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let task;
        let mut created = Vec::with_capacity(instances.len());
        {
            let subs = txn.open_table(SUBSCRIPTIONS).map_err(map_err!(Table))?;
            let found: Option<Subscription> = subs
                .get(subscription_id)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            match found {
                None => {
                    return Err(StateError::NotFound(format!(
                        "subscription {subscription_id}"
                    )));
                }
                Some(sub) if sub.is_deleted => {
                    return Err(StateError::Invalid(format!(
                        "subscription {subscription_id} is deleted"
                    )));
                }
                Some(_) => {}
            }

            let task_id = next_id(&txn, TASK_SEQ)?;
            task = SubscriptionTask {
                id: task_id,
                subscription_id,
                scope,
                actions,
                is_auto_trigger,
                created_at: now,
            };
            let mut tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            tasks
                .insert(task_id, encode(&task)?.as_slice())
                .map_err(map_err!(Write))?;

            let mut records = txn.open_table(INSTANCE_RECORDS).map_err(map_err!(Table))?;
            let mut latest = txn.open_table(LATEST_RECORDS).map_err(map_err!(Table))?;
            for instance in instances {
                let id = next_id(&txn, RECORD_SEQ)?;
                let record = new_record(id, task_id, subscription_id, instance, now);
                created.push(insert_latest(&mut records, &mut latest, record)?);
            }
        }
        txn.commit().map_err(map_err!(Transaction))?;
        info!(task_id = task.id, subscription_id, records = created.len(), "task created");
        Ok((task, created))
    }

    /// Add one instance record to an existing task, superseding the
    /// instance's previous latest record atomically.
    pub fn create_instance_record(
        &self,
        task_id: RowId,
        instance: NewInstance,
    ) -> StateResult<InstanceRecord> {
        let now = epoch_secs();
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let created;
        {
            let tasks = txn.open_table(TASKS).map_err(map_err!(Table))?;
            let task: SubscriptionTask = tasks
                .get(task_id)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?
                .ok_or_else(|| StateError::NotFound(format!("task {task_id}")))?;

            let id = next_id(&txn, RECORD_SEQ)?;
            let mut records = txn.open_table(INSTANCE_RECORDS).map_err(map_err!(Table))?;
            let mut latest = txn.open_table(LATEST_RECORDS).map_err(map_err!(Table))?;
            let record = new_record(id, task_id, task.subscription_id, instance, now);
            created = insert_latest(&mut records, &mut latest, record)?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(created)
    }

    pub fn get_task(&self, id: RowId) -> StateResult<Option<SubscriptionTask>> {
        self.get_row(TASKS, id)
    }

    pub fn get_instance_record(&self, id: RowId) -> StateResult<Option<InstanceRecord>> {
        self.get_row(INSTANCE_RECORDS, id)
    }

    /// Latest record of one instance, if any record exists.
    pub fn latest_record(
        &self,
        subscription_id: RowId,
        instance_id: &str,
    ) -> StateResult<Option<InstanceRecord>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let latest = txn.open_table(LATEST_RECORDS).map_err(map_err!(Table))?;
        let Some(id) = latest
            .get(latest_key(subscription_id, instance_id).as_str())
            .map_err(map_err!(Read))?
            .map(|guard| guard.value())
        else {
            return Ok(None);
        };
        let records = txn.open_table(INSTANCE_RECORDS).map_err(map_err!(Table))?;
        match records.get(id).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }

    /// Latest record of every instance of a subscription, in id order.
    pub fn list_latest_records(&self, subscription_id: RowId) -> StateResult<Vec<InstanceRecord>> {
        let prefix = format!("{subscription_id}:");
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let latest = txn.open_table(LATEST_RECORDS).map_err(map_err!(Table))?;
        let records = txn.open_table(INSTANCE_RECORDS).map_err(map_err!(Table))?;
        let mut results = Vec::new();
        for entry in latest.range(prefix.as_str()..).map_err(map_err!(Read))? {
            let (key, id) = entry.map_err(map_err!(Read))?;
            if !key.value().starts_with(&prefix) {
                break;
            }
            if let Some(guard) = records.get(id.value()).map_err(map_err!(Read))? {
                results.push(decode::<InstanceRecord>(guard.value())?);
            }
        }
        results.sort_by_key(|rec| rec.id);
        Ok(results)
    }

    /// Every record of one instance, oldest first.
    pub fn list_instance_history(
        &self,
        subscription_id: RowId,
        instance_id: &str,
    ) -> StateResult<Vec<InstanceRecord>> {
        self.list_rows(INSTANCE_RECORDS, |rec: &InstanceRecord| {
            rec.subscription_id == subscription_id && rec.instance_id == instance_id
        })
    }

    /// Records created by one task, in id order.
    pub fn list_task_records(&self, task_id: RowId) -> StateResult<Vec<InstanceRecord>> {
        self.list_rows(INSTANCE_RECORDS, |rec: &InstanceRecord| rec.task_id == task_id)
    }

    /// Read-modify-write one instance record in a single transaction.
    ///
    /// `change` may edit steps, the process handle and `need_clean`; the
    /// identity fields and `is_latest` are restored afterwards. If `change`
    /// fails nothing is written.
    pub fn update_instance_record<E>(
        &self,
        id: RowId,
        change: impl FnOnce(&mut InstanceRecord) -> Result<(), E>,
    ) -> Result<InstanceRecord, E>
    where
        E: From<StateError>,
    {
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        let updated;
        {
            let mut records = txn.open_table(INSTANCE_RECORDS).map_err(map_err!(Table))?;
            let found: Option<InstanceRecord> = records
                .get(id)
                .map_err(map_err!(Read))?
                .map(|guard| decode(guard.value()))
                .transpose()?;
            let original =
                found.ok_or_else(|| StateError::NotFound(format!("instance record {id}")))?;
            let mut record = original.clone();
            change(&mut record)?;
            record.id = original.id;
            record.task_id = original.task_id;
            record.subscription_id = original.subscription_id;
            record.instance_id = original.instance_id;
            record.is_latest = original.is_latest;
            record.created_at = original.created_at;
            record.updated_at = epoch_secs();
            records
                .insert(id, encode(&record)?.as_slice())
                .map_err(map_err!(Write))?;
            updated = record;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(updated)
    }

    // ── Process trees ──────────────────────────────────────────────

    pub fn put_process_tree(&self, tree: &ProcessTree) -> StateResult<()> {
        let value = encode(tree)?;
        let txn = self.db.begin_write().map_err(map_err!(Transaction))?;
        {
            let mut table = txn.open_table(PROCESS_TREES).map_err(map_err!(Table))?;
            table
                .insert(tree.handle.as_str(), value.as_slice())
                .map_err(map_err!(Write))?;
        }
        txn.commit().map_err(map_err!(Transaction))?;
        Ok(())
    }

    pub fn get_process_tree(&self, handle: &str) -> StateResult<Option<ProcessTree>> {
        let txn = self.db.begin_read().map_err(map_err!(Transaction))?;
        let table = txn.open_table(PROCESS_TREES).map_err(map_err!(Table))?;
        match table.get(handle).map_err(map_err!(Read))? {
            Some(guard) => Ok(Some(decode(guard.value())?)),
            None => Ok(None),
        }
    }
}
