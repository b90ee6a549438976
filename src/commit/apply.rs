use compact_str::CompactString;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::address::{Address, TreeId};
use crate::cache::LocalRevisionCache;
use crate::command::{ChangeOp, Command};
use crate::error::{RevlogError, RevlogResult};
use crate::event::ChangeEvent;
use crate::record::{ChangeRecord, ChangeStatus};
use crate::store::{ChangeStore, DistributedCache, NodeExpectation, Versioned};
use crate::tree::{NodeRecord, Value};

use super::{ChangeOrchestrator, Claim, CommitOutcome, now_ms};

/// Node-write loops contend only with idempotent redoers and writers of
/// disjoint fields, both of which make progress; this bound exists to
/// turn a broken backend into a diagnosable error instead of a spin.
const MAX_NODE_WRITE_RACES: usize = 64;

/// What validation decided the command amounts to.
enum Planned {
    Rejected(String),
    NoChange,
    Events(Vec<ChangeEvent>),
}

/// Working state of one object while the command's ops are folded over
/// it. `overrides` layers the command's own writes on top of what the
/// store held at revision - 1; `wiped` records that an intermediate
/// remove or create reset the field set along the way.
struct ObjectPlan {
    existed_before: bool,
    stored_fields: BTreeMap<CompactString, Option<Value>>,
    exists: bool,
    wiped: bool,
    overrides: BTreeMap<CompactString, Option<Value>>,
}

impl ObjectPlan {
    fn current(&self, field: &str) -> Option<Value> {
        if let Some(v) = self.overrides.get(field) {
            return v.clone();
        }
        if self.wiped {
            return None;
        }
        self.stored_fields.get(field).cloned().flatten()
    }

    fn before(&self, field: &str) -> Option<Value> {
        if !self.existed_before {
            return None;
        }
        self.stored_fields.get(field).cloned().flatten()
    }
}

impl<S: ChangeStore, C: DistributedCache> ChangeOrchestrator<S, C> {
    /// Validates, stages and executes a claimed change, producing its
    /// terminal record and outcome. Every rewrite of the record goes
    /// through the claim's version, so a recoverer that takes the record
    /// away from us is always detected, never raced.
    pub(crate) async fn execute_claim(
        &self,
        local: &mut LocalRevisionCache,
        tree: &TreeId,
        command: &Command,
        mut claim: Claim,
    ) -> RevlogResult<CommitOutcome> {
        let revision = claim.revision();
        self.keep_claim_alive(tree, &mut claim).await?;

        match self.plan_events(tree, command).await? {
            Planned::Rejected(reason) => {
                debug!(%tree, revision, %reason, "preconditions failed");
                let terminal = self
                    .commit_from_creating(tree, claim, ChangeStatus::FailedPreconditions)
                    .await?;
                self.remember_terminal(local, tree, terminal).await;
                Ok(CommitOutcome::Rejected { revision, reason })
            }
            Planned::NoChange => {
                let terminal = self
                    .commit_from_creating(tree, claim, ChangeStatus::SuccessNoChange)
                    .await?;
                self.remember_terminal(local, tree, terminal).await;
                Ok(CommitOutcome::NoChange { revision })
            }
            Planned::Events(events) => {
                // Last clean give-up point: nothing durable yet.
                self.keep_claim_alive(tree, &mut claim).await?;

                let mut staged = claim.record.clone();
                staged.begin_executing(events, now_ms())?;
                match self
                    .store()
                    .update_record(tree, claim.version, &staged)
                    .await
                {
                    Ok(version) => {
                        claim.record = staged;
                        claim.version = version;
                    }
                    Err(err) if err.is_contention() => {
                        return self.own_record_lost(tree, revision).await;
                    }
                    Err(err) => return Err(err),
                }

                for (index, event) in claim.record.events.iter().enumerate() {
                    self.store()
                        .put_event(tree, revision, index as u32, event)
                        .await?;
                }

                // From here on abandoning is safe again: the events are
                // durable and anyone can roll us forward.
                self.keep_claim_alive(tree, &mut claim).await?;
                self.apply_events(tree, revision, &claim.record.events)
                    .await?;

                let terminal = self.commit_executed(local, tree, claim).await?;
                self.remember_terminal(local, tree, terminal).await;
                Ok(CommitOutcome::Executed { revision })
            }
        }
    }

    /// Folds the command over the tree state at revision - 1 and derives
    /// the net event list: per object at most a creation or removal, per
    /// field at most one final value. Intermediate states inside one
    /// command (create-set-remove chains) never reach the log, which
    /// keeps replay of the list idempotent under the per-node stamps.
    async fn plan_events(&self, tree: &TreeId, command: &Command) -> RevlogResult<Planned> {
        let mut plans: BTreeMap<CompactString, ObjectPlan> = BTreeMap::new();
        let mut order: Vec<CompactString> = Vec::new();

        for op in &command.ops {
            let object = CompactString::from(op.object());
            if !plans.contains_key(&object) {
                let stored = self
                    .store()
                    .read_node(tree, &Address::object(tree, object.clone()))
                    .await?;
                let (existed, fields) = match stored {
                    Some(v) if v.value.live => (
                        true,
                        v.value
                            .fields
                            .iter()
                            .map(|(name, slot)| (name.clone(), slot.value.clone()))
                            .collect(),
                    ),
                    _ => (false, BTreeMap::new()),
                };
                plans.insert(
                    object.clone(),
                    ObjectPlan {
                        existed_before: existed,
                        stored_fields: fields,
                        exists: existed,
                        wiped: false,
                        overrides: BTreeMap::new(),
                    },
                );
                order.push(object.clone());
            }
            let plan = plans.get_mut(&object).expect("plan just inserted");

            match op {
                ChangeOp::CreateObject { object } => {
                    if plan.exists {
                        return Ok(Planned::Rejected(format!(
                            "create_object: {object} already exists"
                        )));
                    }
                    plan.exists = true;
                    plan.wiped = true;
                    plan.overrides.clear();
                }
                ChangeOp::RemoveObject { object } => {
                    if !plan.exists {
                        return Ok(Planned::Rejected(format!(
                            "remove_object: {object} does not exist"
                        )));
                    }
                    plan.exists = false;
                    plan.wiped = true;
                    plan.overrides.clear();
                }
                ChangeOp::SetField {
                    object,
                    field,
                    value,
                } => {
                    if !plan.exists {
                        return Ok(Planned::Rejected(format!(
                            "set_field: {object} does not exist"
                        )));
                    }
                    if plan.current(field) != *value {
                        plan.overrides.insert(field.clone(), value.clone());
                    }
                }
            }
        }

        let mut events = Vec::new();
        for object in order {
            let plan = &plans[&object];
            match (plan.existed_before, plan.exists) {
                (false, true) => {
                    events.push(ChangeEvent::ObjectCreated {
                        object: object.clone(),
                    });
                    for (field, value) in &plan.overrides {
                        if let Some(value) = value {
                            events.push(ChangeEvent::FieldSet {
                                object: object.clone(),
                                field: field.clone(),
                                value: Some(value.clone()),
                            });
                        }
                    }
                }
                (true, false) => {
                    events.push(ChangeEvent::ObjectRemoved {
                        object: object.clone(),
                    });
                }
                (true, true) => {
                    // Fields the command touched, plus everything the
                    // stored object held if an intermediate wipe reset it.
                    let mut candidates: Vec<&CompactString> = plan.overrides.keys().collect();
                    if plan.wiped {
                        for (field, value) in &plan.stored_fields {
                            if value.is_some() && !plan.overrides.contains_key(field) {
                                candidates.push(field);
                            }
                        }
                        candidates.sort();
                        candidates.dedup();
                    }
                    for field in candidates {
                        let now = plan.current(field);
                        if now != plan.before(field) {
                            events.push(ChangeEvent::FieldSet {
                                object: object.clone(),
                                field: field.clone(),
                                value: now,
                            });
                        }
                    }
                }
                (false, false) => {}
            }
        }

        if events.is_empty() {
            Ok(Planned::NoChange)
        } else {
            Ok(Planned::Events(events))
        }
    }

    /// Commits a record that never left `Creating`. Losing the swap here
    /// means a recoverer declared us dead, which ends the attempt.
    async fn commit_from_creating(
        &self,
        tree: &TreeId,
        claim: Claim,
        status: ChangeStatus,
    ) -> RevlogResult<Arc<ChangeRecord>> {
        let revision = claim.revision();
        let mut committed = claim.record;
        committed.commit(status, now_ms())?;
        match self
            .store()
            .update_record(tree, claim.version, &committed)
            .await
        {
            Ok(_) => Ok(Arc::new(committed)),
            Err(err) if err.is_contention() => self.own_record_lost(tree, revision).await,
            Err(err) => Err(err),
        }
    }

    /// Commits `SuccessExecuted` after the effects are applied. A lost
    /// swap means a recoverer claimed us mid-apply; whoever commits, the
    /// change counts as executed exactly once and we report the settled
    /// terminal state as ours.
    async fn commit_executed(
        &self,
        local: &mut LocalRevisionCache,
        tree: &TreeId,
        claim: Claim,
    ) -> RevlogResult<Arc<ChangeRecord>> {
        let revision = claim.revision();
        let mut committed = claim.record;
        committed.commit(ChangeStatus::SuccessExecuted, now_ms())?;
        match self
            .store()
            .update_record(tree, claim.version, &committed)
            .await
        {
            Ok(_) => Ok(Arc::new(committed)),
            Err(err) if err.is_contention() => {
                debug!(%tree, revision, "commit lost to a recoverer; settling");
                let settled = self.settle_record(local, tree, revision).await?;
                if settled.status == ChangeStatus::SuccessExecuted {
                    Ok(settled)
                } else {
                    Err(RevlogError::integrity(format!(
                        "revision {revision} had durable events but settled \
                         as {}",
                        settled.status
                    )))
                }
            }
            Err(err) => Err(err),
        }
    }

    /// Maps the disappearance of our own `Creating` record to its cause.
    /// Never returns Ok.
    async fn own_record_lost<T>(&self, tree: &TreeId, revision: u64) -> RevlogResult<T> {
        let stored = self.store().read_record(tree, revision).await?;
        match stored {
            Some(v) if v.value.status == ChangeStatus::FailedTimeout => {
                Err(RevlogError::VoluntaryTimeout { revision })
            }
            Some(v) => Err(RevlogError::integrity(format!(
                "own record {revision} rewritten to {} by another process",
                v.value.status
            ))),
            None => Err(RevlogError::integrity(format!(
                "own record {revision} on {tree} vanished"
            ))),
        }
    }

    /// Replays an event list against the tree. Safe to run any number of
    /// times by any process: every write is guarded by the revision
    /// stamps on the node records, so reruns and races converge on the
    /// same state.
    pub(crate) async fn apply_events(
        &self,
        tree: &TreeId,
        revision: u64,
        events: &[ChangeEvent],
    ) -> RevlogResult<()> {
        for event in events {
            match event {
                ChangeEvent::ObjectCreated { object } => {
                    let address = Address::object(tree, object.clone());
                    self.write_incarnation(tree, &address, revision, true)
                        .await?;
                    self.bump_container(tree, &tree.root(), revision).await;
                }
                ChangeEvent::ObjectRemoved { object } => {
                    let address = Address::object(tree, object.clone());
                    self.write_incarnation(tree, &address, revision, false)
                        .await?;
                    self.bump_container(tree, &tree.root(), revision).await;
                }
                ChangeEvent::FieldSet {
                    object,
                    field,
                    value,
                } => {
                    let address = Address::object(tree, object.clone());
                    self.write_field(tree, &address, field, value.clone(), revision)
                        .await?;
                }
            }
        }
        Ok(())
    }

    /// Creates or removes one node incarnation, stamped with `revision`.
    /// Skips silently when a stamp at or above `revision` is already
    /// there: that is a redo arriving after the fact.
    async fn write_incarnation(
        &self,
        tree: &TreeId,
        address: &Address,
        revision: u64,
        live: bool,
    ) -> RevlogResult<()> {
        for _ in 0..MAX_NODE_WRITE_RACES {
            let stored = self.store().read_node(tree, address).await?;
            let result = match &stored {
                None => {
                    if !live {
                        warn!(%tree, %address, revision, "removal of a node that never materialized");
                        return Ok(());
                    }
                    self.store()
                        .write_node(
                            tree,
                            address,
                            NodeExpectation::Absent,
                            &NodeRecord::created(revision, 0),
                        )
                        .await
                }
                Some(v) => {
                    if v.value.revision >= revision {
                        return Ok(());
                    }
                    let node = if live {
                        NodeRecord::created(revision, v.value.child_revision)
                    } else {
                        NodeRecord::removed(revision, v.value.child_revision)
                    };
                    self.store()
                        .write_node(tree, address, NodeExpectation::Version(v.version), &node)
                        .await
                }
            };
            match result {
                Ok(_) => return Ok(()),
                Err(err) if err.is_contention() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(RevlogError::integrity(format!(
            "node write for {address} lost {MAX_NODE_WRITE_RACES} races in a row"
        )))
    }

    /// Writes one final field value through the object record's
    /// conditional-write loop. The record is shared by every field of
    /// the object, so disjoint-field writers contend here even though
    /// their locks do not.
    async fn write_field(
        &self,
        tree: &TreeId,
        address: &Address,
        field: &str,
        value: Option<Value>,
        revision: u64,
    ) -> RevlogResult<()> {
        for _ in 0..MAX_NODE_WRITE_RACES {
            let Some(stored) = self.store().read_node(tree, address).await? else {
                warn!(%tree, %address, field, revision, "field effect on a node that never materialized");
                return Ok(());
            };
            let mut node = stored.value.clone();
            if !node.apply_field(field, value.clone(), revision) {
                return Ok(());
            }
            match self
                .store()
                .write_node(
                    tree,
                    address,
                    NodeExpectation::Version(stored.version),
                    &node,
                )
                .await
            {
                Ok(_) => return Ok(()),
                Err(err) if err.is_contention() => continue,
                Err(err) => return Err(err),
            }
        }
        Err(RevlogError::integrity(format!(
            "field write for {address}.{field} lost {MAX_NODE_WRITE_RACES} races in a row"
        )))
    }

    /// Raises the cached child revision on a container node. Best
    /// effort: the value is a monotonic hint for readers, so losing
    /// every race or hitting a backend error here never fails a change.
    async fn bump_container(&self, tree: &TreeId, address: &Address, revision: u64) {
        for _ in 0..MAX_NODE_WRITE_RACES {
            let stored = match self.store().read_node(tree, address).await {
                Ok(stored) => stored,
                Err(err) => {
                    warn!(%tree, %address, error = %err, "container read failed; child revision not bumped");
                    return;
                }
            };
            let (expected, node) = match &stored {
                None => {
                    let mut node = NodeRecord::created(0, 0);
                    node.note_child_change(revision);
                    (NodeExpectation::Absent, node)
                }
                Some(v) => {
                    let mut node = v.value.clone();
                    if !node.note_child_change(revision) {
                        return;
                    }
                    (NodeExpectation::Version(v.version), node)
                }
            };
            match self.store().write_node(tree, address, expected, &node).await {
                Ok(_) => return,
                Err(err) if err.is_contention() => continue,
                Err(err) => {
                    warn!(%tree, %address, error = %err, "container write failed; child revision not bumped");
                    return;
                }
            }
        }
        debug!(%tree, %address, revision, "container bump gave up after repeated races");
    }
}
