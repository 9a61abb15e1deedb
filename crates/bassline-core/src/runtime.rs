//! # Runtime
//!
//! The command dispatcher: the one place where an [`ExternalInput`] turns
//! into graph mutations. It owns the live group trees (roots keyed by group
//! id), the primitive registry and the active scheduler.
//!
//! Side products of every command:
//! - a [`ContactChange`] per applied content change, pushed synchronously to
//!   every subscriber
//! - [`Mutation`]s in the journal, drained by the kernel into storage
//! - while capturing, a [`CapturedOp`] holding the commands that redo and
//!   undo the command
//!
//! Commands replayed from history apply raw: removals leave contents alone
//! and content is restored by explicit `set-contents` commands. Replay is
//! reachable only in-process, through the history driver; [`Runtime::dispatch`]
//! refuses the replay-only commands whatever the issuer claims to be.
//! A replayed sequence runs inside a transaction: it either applies as a
//! whole or leaves the graph, the journal and the subscribers untouched.

use crate::command::{
    ContactChange, ContentSnapshot, DispatchError, ExternalInput, GroupSummary, GroupView,
    HISTORY_SOURCE, ImportResult, QueryOptions, UpdateReceipt, unix_millis,
};
use crate::gadget::{ModuleSource, PrimitiveRegistry};
use crate::group::{ContactGroup, GroupCounts, GroupSnapshot, Removal};
use crate::history::CapturedOp;
use crate::limits::MAX_CONTRADICTION_LOG;
use crate::scheduler::{
    SchedulePolicy, ScheduledUpdate, Scheduler, SchedulerInfo, available_schedulers,
    scheduler_by_id,
};
use crate::storage::{GroupRecord, Mutation, StoredNetwork};
use crate::template::GroupTemplate;
use crate::types::{
    BlendMode, Contact, ContactId, Contradiction, CoreError, GroupId, OwnedWire, Position,
    Propagation, Wire, WireId, WireType,
};
use serde_json::{Value, json};
use std::collections::{BTreeMap, VecDeque};
use std::fmt;

/// Callback receiving every applied content change.
pub type Subscriber = Box<dyn FnMut(&ContactChange) + Send>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SubscriptionId(pub u64);

/// Result of one dispatched command.
#[derive(Debug, Clone, PartialEq)]
pub struct Dispatched {
    pub data: Value,
    /// Present when capture was requested and the command changed the graph.
    pub captured: Option<CapturedOp>,
}

type Outcome = Result<(Value, Option<CapturedOp>), DispatchError>;

// =============================================================================
// RUNTIME
// =============================================================================

pub struct Runtime {
    roots: BTreeMap<GroupId, ContactGroup>,
    registry: Box<dyn PrimitiveRegistry>,
    scheduler: Box<dyn Scheduler>,
    subscribers: BTreeMap<SubscriptionId, Subscriber>,
    next_subscription: u64,
    journal: Vec<Mutation>,
    contradictions: VecDeque<Contradiction>,
    transaction: Option<Transaction>,
}

/// State to return to if a replayed sequence fails, and the changes held
/// back from subscribers until it succeeds.
struct Transaction {
    roots: BTreeMap<GroupId, ContactGroup>,
    journal_len: usize,
    held: Vec<ContactChange>,
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("roots", &self.roots.keys().collect::<Vec<_>>())
            .field("scheduler", &self.scheduler)
            .field("subscribers", &self.subscribers.len())
            .field("journal", &self.journal.len())
            .finish_non_exhaustive()
    }
}

impl Runtime {
    pub fn new(registry: Box<dyn PrimitiveRegistry>, scheduler: Box<dyn Scheduler>) -> Self {
        Self {
            roots: BTreeMap::new(),
            registry,
            scheduler,
            subscribers: BTreeMap::new(),
            next_subscription: 1,
            journal: Vec::new(),
            contradictions: VecDeque::new(),
            transaction: None,
        }
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn roots(&self) -> impl Iterator<Item = &ContactGroup> {
        self.roots.values()
    }

    pub fn registry(&self) -> &dyn PrimitiveRegistry {
        &*self.registry
    }

    pub fn registry_mut(&mut self) -> &mut dyn PrimitiveRegistry {
        &mut *self.registry
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        &*self.scheduler
    }

    /// Swap the active scheduler. Updates pending in the old one are applied
    /// first.
    pub fn set_scheduler(&mut self, scheduler: Box<dyn Scheduler>) {
        self.tick();
        tracing::info!(scheduler = %scheduler.info().id, "scheduler changed");
        self.scheduler = scheduler;
    }

    /// Find a group in any tree.
    pub fn group(&self, id: GroupId) -> Option<&ContactGroup> {
        find_group(&self.roots, id)
    }

    /// Find a contact in any tree.
    pub fn find_contact(&self, id: ContactId) -> Option<&Contact> {
        self.roots.values().find_map(|root| root.find_contact(id))
    }

    /// Resolve a contact as seen from inside `group_id`: the group's
    /// subtree, then the boundary contacts of its parent.
    pub fn find_contact_from(&self, group_id: GroupId, contact_id: ContactId) -> Option<&Contact> {
        let group = self.group(group_id)?;
        if let Some(contact) = group.find_contact(contact_id) {
            return Some(contact);
        }
        let parent = self.group(group.parent_id()?)?;
        if parent.is_boundary(contact_id) {
            parent.contact(contact_id)
        } else {
            None
        }
    }

    /// Element counts over every tree.
    pub fn counts(&self) -> GroupCounts {
        self.roots
            .values()
            .map(ContactGroup::counts)
            .fold(GroupCounts::default(), |acc, c| GroupCounts {
                groups: acc.groups + c.groups,
                contacts: acc.contacts + c.contacts,
                wires: acc.wires + c.wires,
            })
    }

    /// Most recent contradictions, oldest first.
    pub fn contradictions(&self) -> impl Iterator<Item = &Contradiction> {
        self.contradictions.iter()
    }

    // =========================================================================
    // SUBSCRIPTIONS & JOURNAL
    // =========================================================================

    pub fn subscribe(&mut self, subscriber: Subscriber) -> SubscriptionId {
        let id = SubscriptionId(self.next_subscription);
        self.next_subscription += 1;
        self.subscribers.insert(id, subscriber);
        id
    }

    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        self.subscribers.remove(&id).is_some()
    }

    /// Take every mutation journaled since the last drain.
    pub fn drain_journal(&mut self) -> Vec<Mutation> {
        std::mem::take(&mut self.journal)
    }

    /// Journal and broadcast the results of a wave.
    fn settle(&mut self, wave: &Propagation) {
        let timestamp = unix_millis();
        for change in &wave.changes {
            self.journal.push(Mutation::ContentChanged {
                contact_id: change.contact_id,
                value: change.current.clone(),
            });
            let note = ContactChange {
                contact_id: change.contact_id,
                group_id: change.group_id,
                value: change.current.clone(),
                timestamp,
            };
            match &mut self.transaction {
                Some(transaction) => transaction.held.push(note),
                None => self.broadcast(&note),
            }
        }
        for contradiction in &wave.contradictions {
            self.log_contradiction(contradiction.clone());
        }
    }

    fn broadcast(&mut self, note: &ContactChange) {
        for subscriber in self.subscribers.values_mut() {
            subscriber(note);
        }
    }

    fn log_contradiction(&mut self, contradiction: Contradiction) {
        if self.contradictions.len() >= MAX_CONTRADICTION_LOG {
            self.contradictions.pop_front();
        }
        self.contradictions.push_back(contradiction);
    }

    // =========================================================================
    // REPLAY TRANSACTIONS
    // =========================================================================

    /// Remember the current graph so a replayed sequence can be abandoned.
    pub(crate) fn begin(&mut self) {
        if self.transaction.is_some() {
            tracing::warn!("replay transaction already open, keeping the outer one");
            return;
        }
        self.transaction = Some(Transaction {
            roots: self.roots.clone(),
            journal_len: self.journal.len(),
            held: Vec::new(),
        });
    }

    /// Keep the replayed changes and release them to subscribers.
    pub(crate) fn commit(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            for note in &transaction.held {
                self.broadcast(note);
            }
        }
    }

    /// Return to the state remembered by [`Runtime::begin`].
    pub(crate) fn rollback(&mut self) {
        if let Some(transaction) = self.transaction.take() {
            self.roots = transaction.roots;
            self.journal.truncate(transaction.journal_len);
            tracing::debug!(discarded = transaction.held.len(), "replay rolled back");
        }
    }

    // =========================================================================
    // SCHEDULING
    // =========================================================================

    /// Apply every scheduled update that is ready; returns how many were
    /// applied. Failures are logged and do not stop the remaining updates.
    pub fn tick(&mut self) -> usize {
        let updates = self.scheduler.take_ready();
        let count = updates.len();
        for update in updates {
            let contact_id = update.contact_id;
            if let Err(e) = self.apply_update(update) {
                tracing::warn!(contact_id = %contact_id, error = %e, "scheduled update failed");
            }
        }
        count
    }

    fn flush(&mut self) -> Result<Propagation, CoreError> {
        let mut wave = Propagation::default();
        for update in self.scheduler.take_ready() {
            wave.absorb(self.apply_update(update)?);
        }
        Ok(wave)
    }

    fn apply_update(&mut self, update: ScheduledUpdate) -> Result<Propagation, CoreError> {
        let Some(root_id) = self.root_of_contact(update.contact_id) else {
            tracing::debug!(contact_id = %update.contact_id, "scheduled update target removed");
            return Ok(Propagation::default());
        };
        let root = self
            .roots
            .get_mut(&root_id)
            .ok_or(CoreError::GroupNotFound(root_id))?;
        let wave = root.deliver_content(update.contact_id, update.value, None)?;
        self.settle(&wave);
        Ok(wave)
    }

    // =========================================================================
    // LOOKUP HELPERS
    // =========================================================================

    fn root_of_group(&self, id: GroupId) -> Result<GroupId, CoreError> {
        self.roots
            .iter()
            .find(|(_, root)| root.contains_group(id))
            .map(|(root_id, _)| *root_id)
            .ok_or(CoreError::GroupNotFound(id))
    }

    fn root_of_contact(&self, id: ContactId) -> Option<GroupId> {
        self.roots
            .iter()
            .find(|(_, root)| root.find_contact(id).is_some())
            .map(|(root_id, _)| *root_id)
    }

    fn root_of_wire(&self, id: WireId) -> Option<GroupId> {
        self.roots
            .iter()
            .find(|(_, root)| root.wire_owner(id).is_some())
            .map(|(root_id, _)| *root_id)
    }

    fn root_mut(&mut self, id: GroupId) -> Result<&mut ContactGroup, CoreError> {
        self.roots.get_mut(&id).ok_or(CoreError::GroupNotFound(id))
    }

    /// Attach a group as a new root or below `parent`, journaling the
    /// whole subtree.
    fn insert_group(
        &mut self,
        group: ContactGroup,
        parent: Option<GroupId>,
    ) -> Result<GroupId, CoreError> {
        let id = match parent {
            None => {
                let id = group.id();
                self.roots.insert(id, group);
                id
            }
            Some(parent) => {
                let root_id = self.root_of_group(parent)?;
                self.root_mut(root_id)?.add_subgroup_within(parent, group)?
            }
        };
        let inserted = find_group(&self.roots, id).ok_or(CoreError::GroupNotFound(id))?;
        journal_saved(&mut self.journal, inserted);
        tracing::debug!(group_id = %id, parent_id = ?parent, "group attached");
        Ok(id)
    }

    fn snapshot_of(&self, id: GroupId) -> Result<GroupSnapshot, CoreError> {
        self.group(id)
            .map(ContactGroup::snapshot)
            .ok_or(CoreError::GroupNotFound(id))
    }

    // =========================================================================
    // DISPATCH
    // =========================================================================

    /// Execute one command.
    ///
    /// `source` names the issuer for logging only. Replay-only commands are
    /// always refused here. With `capture` set, mutating commands return the
    /// operations that redo and undo them.
    pub fn dispatch(
        &mut self,
        input: ExternalInput,
        source: Option<&str>,
        capture: bool,
    ) -> Result<Dispatched, DispatchError> {
        if input.is_replay_only() {
            return Err(DispatchError::ReservedCommand(input.command_type()));
        }
        self.execute(input, source, false, capture)
    }

    /// Apply a command replayed from history: removals are raw and nothing
    /// is captured.
    pub(crate) fn replay(&mut self, input: ExternalInput) -> Result<Value, DispatchError> {
        self.execute(input, Some(HISTORY_SOURCE), true, false)
            .map(|dispatched| dispatched.data)
    }

    fn execute(
        &mut self,
        input: ExternalInput,
        source: Option<&str>,
        replay: bool,
        capture: bool,
    ) -> Result<Dispatched, DispatchError> {
        let command = input.command_type();
        if input.is_history() {
            return Err(DispatchError::NoHistoryDriver(command));
        }
        let capture = capture && !replay;
        let removal = if replay {
            Removal::Raw
        } else {
            Removal::ClearOrphans
        };
        tracing::debug!(command = command, source = source.unwrap_or("-"), "dispatch");

        let (data, captured) = match input {
            ExternalInput::AddContact {
                group_id,
                content,
                blend_mode,
            } => self.add_contact(group_id, content, blend_mode, capture)?,
            ExternalInput::ContactUpdate {
                contact_id,
                group_id,
                value,
            } => self.contact_update(contact_id, group_id, value, capture)?,
            ExternalInput::AddGroup {
                name,
                parent_group_id,
                primitive_id,
            } => self.add_group(name, parent_group_id, primitive_id, capture)?,
            ExternalInput::CreateWire {
                from_contact_id,
                to_contact_id,
                wire_type,
            } => self.create_wire(
                from_contact_id,
                to_contact_id,
                wire_type.unwrap_or_default(),
                capture,
            )?,
            ExternalInput::RemoveWire { wire_id } => self.remove_wire(wire_id, removal, capture)?,
            ExternalInput::RemoveContact { contact_id } => {
                self.remove_contact(contact_id, removal, capture)?
            }
            ExternalInput::RemoveGroup { group_id } => {
                self.remove_group(group_id, removal, capture)?
            }
            ExternalInput::QueryGroup { group_id, options } => {
                (json!(self.query_group(group_id, options)?), None)
            }
            ExternalInput::QueryContact { contact_id } => {
                let contact = self
                    .find_contact(contact_id)
                    .ok_or(CoreError::ContactNotFound(contact_id))?;
                (json!(contact.content), None)
            }
            ExternalInput::LoadPrimitive {
                module_source,
                namespace,
            } => (json!(self.load_primitive(&module_source, &namespace)?), None),
            ExternalInput::CreatePrimitiveGadget {
                qualified_name,
                parent_group_id,
            } => self.create_primitive_gadget(&qualified_name, parent_group_id, capture)?,
            ExternalInput::ListPrimitives => (json!(self.registry.names()), None),
            ExternalInput::ListPrimitiveInfo => {
                let infos: Vec<_> = self
                    .registry
                    .names()
                    .iter()
                    .filter_map(|name| self.registry.info(name))
                    .collect();
                (json!(infos), None)
            }
            ExternalInput::GetPrimitiveInfo { qualified_name } => {
                let info = self
                    .registry
                    .info(&qualified_name)
                    .ok_or(CoreError::PrimitiveNotFound(qualified_name))?;
                (json!(info), None)
            }
            ExternalInput::ListSchedulers => (json!(available_schedulers()), None),
            ExternalInput::GetSchedulerInfo { scheduler_id } => {
                (json!(self.scheduler_info(&scheduler_id)?), None)
            }
            ExternalInput::SetScheduler {
                scheduler_id,
                config,
            } => {
                let scheduler = scheduler_by_id(&scheduler_id, config.as_ref())?;
                self.set_scheduler(scheduler);
                (json!(self.scheduler.info()), None)
            }
            ExternalInput::ExportGroup { group_id } => {
                let group = self
                    .group(group_id)
                    .ok_or(CoreError::GroupNotFound(group_id))?;
                (json!(group.to_template()), None)
            }
            ExternalInput::ImportTemplate {
                template,
                parent_group_id,
            } => self.import_template(&template, parent_group_id, capture)?,
            ExternalInput::SetContents { contents } => {
                self.set_contents(contents)?;
                (Value::Null, None)
            }
            ExternalInput::RestoreContact { contact, wires } => {
                let id = contact.id;
                self.restore_contact(contact, wires)?;
                (json!(id), None)
            }
            ExternalInput::RestoreWire { wire } => {
                self.restore_wire(wire)?;
                (json!(wire.wire.id), None)
            }
            ExternalInput::RestoreGroup { snapshot, wires } => {
                let id = self.restore_group(&snapshot, wires)?;
                (json!(id), None)
            }
            ExternalInput::Undo
            | ExternalInput::Redo
            | ExternalInput::GetHistory
            | ExternalInput::StartRecording { .. }
            | ExternalInput::StopRecording
            | ExternalInput::CancelRecording => {
                return Err(DispatchError::NoHistoryDriver(command));
            }
        };
        Ok(Dispatched { data, captured })
    }

    // =========================================================================
    // STRUCTURAL COMMANDS
    // =========================================================================

    fn add_contact(
        &mut self,
        group_id: GroupId,
        content: Option<Value>,
        blend_mode: Option<BlendMode>,
        capture: bool,
    ) -> Outcome {
        let root_id = self.root_of_group(group_id)?;
        let root = self
            .roots
            .get_mut(&root_id)
            .ok_or(CoreError::GroupNotFound(root_id))?;
        let owner = root
            .group_mut(group_id)
            .ok_or(CoreError::GroupNotFound(group_id))?;
        let contact_id = owner.add_contact(Position::default(), blend_mode);

        let wave = match content {
            Some(value) => {
                let root = self.root_mut(root_id)?;
                match root.deliver_content(contact_id, Some(value), None) {
                    Ok(wave) => wave,
                    Err(e) => {
                        root.remove_contact_with(contact_id, Removal::Raw)?;
                        return Err(e.into());
                    }
                }
            }
            None => Propagation::default(),
        };
        if let Some(contact) = self.find_contact(contact_id) {
            self.journal.push(Mutation::ContactSaved(contact.clone()));
        }
        self.settle(&wave);

        let captured = if capture {
            let contact = self
                .find_contact(contact_id)
                .cloned()
                .ok_or(CoreError::ContactNotFound(contact_id))?;
            Some(CapturedOp {
                description: "add-contact".to_string(),
                forward: vec![ExternalInput::RestoreContact {
                    contact,
                    wires: Vec::new(),
                }],
                inverse: vec![ExternalInput::RemoveContact { contact_id }],
            })
        } else {
            None
        };
        Ok((json!(contact_id), captured))
    }

    fn add_group(
        &mut self,
        name: String,
        parent: Option<GroupId>,
        primitive_id: Option<String>,
        capture: bool,
    ) -> Outcome {
        let group = match primitive_id {
            Some(qualified_name) => {
                let mut group = self.registry.build(&qualified_name)?;
                group.rename(name);
                group
            }
            None => ContactGroup::new(name),
        };
        let id = self.insert_group(group, parent)?;
        Ok((json!(id), self.capture_created_group(id, "add-group", capture)?))
    }

    fn create_primitive_gadget(
        &mut self,
        qualified_name: &str,
        parent: Option<GroupId>,
        capture: bool,
    ) -> Outcome {
        let group = self.registry.build(qualified_name)?;
        let id = self.insert_group(group, parent)?;
        tracing::debug!(group_id = %id, primitive = qualified_name, "gadget instantiated");
        Ok((
            json!(id),
            self.capture_created_group(id, "create-primitive-gadget", capture)?,
        ))
    }

    fn import_template(
        &mut self,
        template: &GroupTemplate,
        parent: Option<GroupId>,
        capture: bool,
    ) -> Outcome {
        let import = ContactGroup::from_template(template, &*self.registry)?;
        let group_id = self.insert_group(import.group, parent)?;
        let result = ImportResult {
            group_id,
            skipped_wires: import.skipped,
        };
        Ok((
            json!(result),
            self.capture_created_group(group_id, "import-template", capture)?,
        ))
    }

    fn capture_created_group(
        &self,
        id: GroupId,
        description: &str,
        capture: bool,
    ) -> Result<Option<CapturedOp>, CoreError> {
        if !capture {
            return Ok(None);
        }
        Ok(Some(CapturedOp {
            description: description.to_string(),
            forward: vec![ExternalInput::RestoreGroup {
                snapshot: self.snapshot_of(id)?,
                wires: Vec::new(),
            }],
            inverse: vec![ExternalInput::RemoveGroup { group_id: id }],
        }))
    }

    fn create_wire(
        &mut self,
        from: ContactId,
        to: ContactId,
        wire_type: WireType,
        capture: bool,
    ) -> Outcome {
        let root_id = self
            .root_of_contact(from)
            .ok_or(CoreError::ContactNotFound(from))?;
        let root = self
            .roots
            .get(&root_id)
            .ok_or(CoreError::GroupNotFound(root_id))?;
        let from_contact = root
            .find_contact(from)
            .ok_or(CoreError::ContactNotFound(from))?;
        let Some(to_contact) = root.find_contact(to) else {
            return Err(match self.root_of_contact(to) {
                Some(_) => CoreError::UnresolvedEndpoint {
                    from,
                    to,
                    endpoint: to,
                    group: from_contact.group_id,
                },
                None => CoreError::ContactNotFound(to),
            }
            .into());
        };
        let owner = wire_owner(root, from_contact, to_contact);

        let (wire, wave) = self
            .root_mut(root_id)?
            .connect_within(owner, from, to, wire_type)?;
        let owned = OwnedWire {
            group_id: owner,
            wire,
        };
        self.journal.push(Mutation::WireSaved(owned));
        self.settle(&wave);

        let captured = capture.then(|| {
            let diff = ContentDiff::of(&wave);
            CapturedOp {
                description: "create-wire".to_string(),
                forward: with_contents(ExternalInput::RestoreWire { wire: owned }, diff.after()),
                inverse: with_contents(
                    ExternalInput::RemoveWire { wire_id: wire.id },
                    diff.before(),
                ),
            }
        });
        Ok((json!(wire.id), captured))
    }

    fn remove_wire(&mut self, wire_id: WireId, removal: Removal, capture: bool) -> Outcome {
        let root_id = self
            .root_of_wire(wire_id)
            .ok_or(CoreError::WireNotFound(wire_id))?;
        let removed = self.root_mut(root_id)?.remove_wire_with(wire_id, removal)?;
        self.journal.push(Mutation::WireRemoved(wire_id));
        self.settle(&removed.propagation);

        let captured = capture.then(|| {
            let diff = ContentDiff::of(&removed.propagation);
            CapturedOp {
                description: "remove-wire".to_string(),
                forward: with_contents(ExternalInput::RemoveWire { wire_id }, diff.after()),
                inverse: with_contents(
                    ExternalInput::RestoreWire {
                        wire: removed.wire,
                    },
                    diff.before(),
                ),
            }
        });
        Ok((Value::Null, captured))
    }

    fn remove_contact(&mut self, contact_id: ContactId, removal: Removal, capture: bool) -> Outcome {
        let root_id = self
            .root_of_contact(contact_id)
            .ok_or(CoreError::ContactNotFound(contact_id))?;
        let removed = self
            .root_mut(root_id)?
            .remove_contact_with(contact_id, removal)?;
        for wire in &removed.wires {
            self.journal.push(Mutation::WireRemoved(wire.wire.id));
        }
        self.journal.push(Mutation::ContactRemoved(contact_id));
        self.settle(&removed.propagation);

        let captured = capture.then(|| {
            let diff = ContentDiff::of(&removed.propagation);
            CapturedOp {
                description: "remove-contact".to_string(),
                forward: with_contents(ExternalInput::RemoveContact { contact_id }, diff.after()),
                inverse: with_contents(
                    ExternalInput::RestoreContact {
                        contact: removed.contact.clone(),
                        wires: removed.wires.clone(),
                    },
                    diff.before(),
                ),
            }
        });
        Ok((Value::Null, captured))
    }

    fn remove_group(&mut self, group_id: GroupId, removal: Removal, capture: bool) -> Outcome {
        let (group, wires, propagation) = match self.roots.remove(&group_id) {
            Some(group) => (group, Vec::new(), Propagation::default()),
            None => {
                let root_id = self.root_of_group(group_id)?;
                let removed = self
                    .root_mut(root_id)?
                    .remove_subgroup_with(group_id, removal)?;
                (removed.group, removed.wires, removed.propagation)
            }
        };
        for wire in &wires {
            self.journal.push(Mutation::WireRemoved(wire.wire.id));
        }
        journal_removed(&mut self.journal, &group);
        self.settle(&propagation);
        tracing::debug!(group_id = %group_id, "group removed");

        let captured = capture.then(|| {
            let diff = ContentDiff::of(&propagation);
            CapturedOp {
                description: "remove-group".to_string(),
                forward: with_contents(ExternalInput::RemoveGroup { group_id }, diff.after()),
                inverse: with_contents(
                    ExternalInput::RestoreGroup {
                        snapshot: group.snapshot(),
                        wires,
                    },
                    diff.before(),
                ),
            }
        });
        Ok((Value::Null, captured))
    }

    // =========================================================================
    // CONTENT COMMANDS
    // =========================================================================

    fn contact_update(
        &mut self,
        contact_id: ContactId,
        group_id: GroupId,
        value: Option<Value>,
        capture: bool,
    ) -> Outcome {
        let owner = self
            .find_contact_from(group_id, contact_id)
            .ok_or(CoreError::ContactNotFound(contact_id))?
            .group_id;

        // A recorded update is applied at once so its whole wave can be
        // captured. Updates already waiting in a batch window go first.
        let policy = self.scheduler.policy();
        let deferred = policy == SchedulePolicy::Batch && !capture;
        if policy == SchedulePolicy::Batch && capture {
            self.tick();
        }

        let update = ScheduledUpdate {
            contact_id,
            group_id: owner,
            value,
        };
        if let Some(reason) = self.scheduler.schedule(update) {
            let contradiction = match self.group(owner) {
                Some(group) => group.handle_contradiction(contact_id, &reason),
                None => Contradiction {
                    contact_id,
                    group_id: owner,
                    reason,
                },
            };
            self.log_contradiction(contradiction);
        }

        if deferred {
            let receipt = UpdateReceipt {
                scheduled: true,
                pending: self.scheduler.pending(),
            };
            return Ok((json!(receipt), None));
        }

        let wave = self.flush()?;
        let diff = ContentDiff::of(&wave);
        let captured = (capture && !diff.is_empty()).then(|| CapturedOp {
            description: "contact-update".to_string(),
            forward: diff.after().into_iter().collect(),
            inverse: diff.before().into_iter().collect(),
        });
        let receipt = UpdateReceipt {
            scheduled: false,
            pending: self.scheduler.pending(),
        };
        Ok((json!(receipt), captured))
    }

    fn query_group(&self, group_id: GroupId, options: QueryOptions) -> Result<GroupView, CoreError> {
        let group = self
            .group(group_id)
            .ok_or(CoreError::GroupNotFound(group_id))?;
        Ok(GroupView {
            id: group.id(),
            name: group.name().to_string(),
            parent_id: group.parent_id(),
            is_primitive: group.is_primitive(),
            primitive_id: group.primitive_id().map(str::to_string),
            boundary_contact_ids: group.boundary_ids().collect(),
            contacts: options
                .include_contacts
                .then(|| group.contacts().cloned().collect()),
            wires: options
                .include_wires
                .then(|| group.wires().copied().collect::<Vec<Wire>>()),
            subgroups: options.include_subgroups.then(|| {
                group
                    .subgroups()
                    .map(|sub| GroupSummary {
                        id: sub.id(),
                        name: sub.name().to_string(),
                        is_primitive: sub.is_primitive(),
                        primitive_id: sub.primitive_id().map(str::to_string),
                    })
                    .collect()
            }),
        })
    }

    fn load_primitive(
        &mut self,
        source: &ModuleSource,
        namespace: &str,
    ) -> Result<Vec<String>, CoreError> {
        self.registry.load_module(source, namespace)
    }

    fn scheduler_info(&self, id: &str) -> Result<SchedulerInfo, CoreError> {
        let active = self.scheduler.info();
        if active.id == id {
            return Ok(active);
        }
        available_schedulers()
            .into_iter()
            .find(|info| info.id == id)
            .ok_or_else(|| CoreError::UnknownScheduler(id.to_string()))
    }

    // =========================================================================
    // REPLAY COMMANDS
    // =========================================================================

    fn set_contents(&mut self, contents: Vec<ContentSnapshot>) -> Result<(), CoreError> {
        let mut wave = Propagation::default();
        for snapshot in contents {
            let Some(root_id) = self.root_of_contact(snapshot.contact_id) else {
                tracing::debug!(contact_id = %snapshot.contact_id, "restore target missing");
                continue;
            };
            if let Some(change) = self
                .root_mut(root_id)?
                .set_content_raw(snapshot.contact_id, snapshot.content)?
            {
                wave.changes.push(change);
            }
        }
        self.settle(&wave);
        Ok(())
    }

    fn restore_contact(&mut self, contact: Contact, wires: Vec<OwnedWire>) -> Result<(), CoreError> {
        let root_id = self.root_of_group(contact.group_id)?;
        self.journal.push(Mutation::ContactSaved(contact.clone()));
        self.root_mut(root_id)?.insert_contact_raw(contact)?;
        for wire in wires {
            self.restore_wire(wire)?;
        }
        Ok(())
    }

    fn restore_wire(&mut self, wire: OwnedWire) -> Result<(), CoreError> {
        let root_id = self.root_of_group(wire.group_id)?;
        self.root_mut(root_id)?.insert_wire_raw(wire)?;
        self.journal.push(Mutation::WireSaved(wire));
        Ok(())
    }

    fn restore_group(
        &mut self,
        snapshot: &GroupSnapshot,
        wires: Vec<OwnedWire>,
    ) -> Result<GroupId, CoreError> {
        let group = ContactGroup::from_snapshot(snapshot, &*self.registry);
        let id = self.insert_group(group, snapshot.parent_id)?;
        for wire in wires {
            self.restore_wire(wire)?;
        }
        Ok(id)
    }

    // =========================================================================
    // STORAGE RESTORE
    // =========================================================================

    /// Rebuild group trees from stored records. Nothing is journaled.
    /// Returns the number of restored roots.
    pub fn restore(&mut self, network: StoredNetwork) -> usize {
        let mut parts = Parts::default();
        for contact in network.contacts {
            parts.contacts.entry(contact.group_id).or_default().push(contact);
        }
        for owned in network.wires {
            parts.wires.entry(owned.group_id).or_default().push(owned.wire);
        }
        for record in network.groups {
            parts.children.entry(record.parent_id).or_default().push(record);
        }

        let roots = parts.children.remove(&None).unwrap_or_default();
        let count = roots.len();
        for record in roots {
            let snapshot = parts.assemble(record);
            let group = ContactGroup::from_snapshot(&snapshot, &*self.registry);
            self.roots.insert(group.id(), group);
        }

        let orphaned: usize = parts.children.values().map(Vec::len).sum();
        if orphaned > 0 {
            tracing::warn!(groups = orphaned, "stored groups without a reachable parent skipped");
        }
        tracing::info!(roots = count, "network restored from storage");
        count
    }
}

// =============================================================================
// HELPERS
// =============================================================================

fn find_group(roots: &BTreeMap<GroupId, ContactGroup>, id: GroupId) -> Option<&ContactGroup> {
    roots.values().find_map(|root| root.group(id))
}

/// The group that owns a new wire between two contacts: the owner of
/// `from`, its parent when `from` is a boundary, then the same for `to`.
/// The first candidate that can reach both endpoints wins.
fn wire_owner(root: &ContactGroup, from: &Contact, to: &Contact) -> GroupId {
    let mut candidates = Vec::with_capacity(4);
    for contact in [from, to] {
        candidates.push(contact.group_id);
        if contact.is_boundary {
            if let Some(parent) = root.group(contact.group_id).and_then(ContactGroup::parent_id) {
                candidates.push(parent);
            }
        }
    }
    candidates
        .into_iter()
        .find(|id| {
            root.group(*id)
                .is_some_and(|g| g.can_connect_to(from.id) && g.can_connect_to(to.id))
        })
        .unwrap_or(from.group_id)
}

fn group_record(group: &ContactGroup) -> GroupRecord {
    GroupRecord {
        id: group.id(),
        name: group.name().to_string(),
        parent_id: group.parent_id(),
        is_primitive: group.is_primitive(),
        primitive_id: group.primitive_id().map(str::to_string),
    }
}

fn journal_saved(journal: &mut Vec<Mutation>, group: &ContactGroup) {
    journal.push(Mutation::GroupSaved(group_record(group)));
    for contact in group.contacts() {
        journal.push(Mutation::ContactSaved(contact.clone()));
    }
    for wire in group.wires() {
        journal.push(Mutation::WireSaved(OwnedWire {
            group_id: group.id(),
            wire: *wire,
        }));
    }
    for sub in group.subgroups() {
        journal_saved(journal, sub);
    }
}

fn journal_removed(journal: &mut Vec<Mutation>, group: &ContactGroup) {
    for sub in group.subgroups() {
        journal_removed(journal, sub);
    }
    for wire in group.wires() {
        journal.push(Mutation::WireRemoved(wire.id));
    }
    for contact in group.contacts() {
        journal.push(Mutation::ContactRemoved(contact.id));
    }
    journal.push(Mutation::GroupRemoved(group.id()));
}

/// Contents before and after a wave, one entry per touched contact.
#[derive(Debug, Default)]
struct ContentDiff {
    before: BTreeMap<ContactId, Option<Value>>,
    after: BTreeMap<ContactId, Option<Value>>,
}

impl ContentDiff {
    fn of(wave: &Propagation) -> Self {
        let mut diff = Self::default();
        for change in &wave.changes {
            diff.before
                .entry(change.contact_id)
                .or_insert_with(|| change.previous.clone());
            diff.after.insert(change.contact_id, change.current.clone());
        }
        diff
    }

    fn is_empty(&self) -> bool {
        self.after.is_empty()
    }

    fn before(&self) -> Option<ExternalInput> {
        Self::restore(&self.before)
    }

    fn after(&self) -> Option<ExternalInput> {
        Self::restore(&self.after)
    }

    fn restore(contents: &BTreeMap<ContactId, Option<Value>>) -> Option<ExternalInput> {
        if contents.is_empty() {
            return None;
        }
        Some(ExternalInput::SetContents {
            contents: contents
                .iter()
                .map(|(id, content)| ContentSnapshot {
                    contact_id: *id,
                    content: content.clone(),
                })
                .collect(),
        })
    }
}

fn with_contents(command: ExternalInput, contents: Option<ExternalInput>) -> Vec<ExternalInput> {
    let mut commands = vec![command];
    commands.extend(contents);
    commands
}

/// Stored records grouped for tree assembly.
#[derive(Default)]
struct Parts {
    children: BTreeMap<Option<GroupId>, Vec<GroupRecord>>,
    contacts: BTreeMap<GroupId, Vec<Contact>>,
    wires: BTreeMap<GroupId, Vec<Wire>>,
}

impl Parts {
    fn assemble(&mut self, record: GroupRecord) -> GroupSnapshot {
        let children = self.children.remove(&Some(record.id)).unwrap_or_default();
        GroupSnapshot {
            id: record.id,
            name: record.name,
            parent_id: record.parent_id,
            is_primitive: record.is_primitive,
            primitive_id: record.primitive_id,
            contacts: self.contacts.remove(&record.id).unwrap_or_default(),
            wires: self.wires.remove(&record.id).unwrap_or_default(),
            subgroups: children.into_iter().map(|c| self.assemble(c)).collect(),
        }
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::GadgetRegistry;
    use crate::scheduler::{BatchConfig, BatchScheduler, ImmediateScheduler};
    use std::sync::{Arc, Mutex};

    fn runtime() -> Runtime {
        Runtime::new(
            Box::new(GadgetRegistry::with_builtins()),
            Box::new(ImmediateScheduler::new()),
        )
    }

    fn run(rt: &mut Runtime, input: ExternalInput) -> Value {
        rt.dispatch(input, None, false).expect("dispatch").data
    }

    fn id_of<T: serde::de::DeserializeOwned>(value: Value) -> T {
        serde_json::from_value(value).expect("id")
    }

    fn root(rt: &mut Runtime) -> GroupId {
        id_of(run(
            rt,
            ExternalInput::AddGroup {
                name: "root".into(),
                parent_group_id: None,
                primitive_id: None,
            },
        ))
    }

    fn contact(rt: &mut Runtime, group_id: GroupId, content: Option<Value>) -> ContactId {
        id_of(run(
            rt,
            ExternalInput::AddContact {
                group_id,
                content,
                blend_mode: None,
            },
        ))
    }

    #[test]
    fn adder_gadget_end_to_end() {
        let mut rt = runtime();
        let g = root(&mut rt);
        let a = contact(&mut rt, g, Some(json!(5)));
        let b = contact(&mut rt, g, Some(json!(3)));
        let out = contact(&mut rt, g, None);
        let gadget: GroupId = id_of(run(
            &mut rt,
            ExternalInput::CreatePrimitiveGadget {
                qualified_name: "core/add".into(),
                parent_group_id: Some(g),
            },
        ));
        let port = |rt: &Runtime, name: &str| {
            rt.group(gadget)
                .and_then(|grp| grp.boundary_by_name(name))
                .map(|c| c.id)
                .expect("port")
        };
        let (pa, pb, sum) = (port(&rt, "a"), port(&rt, "b"), port(&rt, "sum"));
        for (from, to) in [(a, pa), (b, pb), (sum, out)] {
            run(
                &mut rt,
                ExternalInput::CreateWire {
                    from_contact_id: from,
                    to_contact_id: to,
                    wire_type: Some(WireType::Directed),
                },
            );
        }

        let value = run(&mut rt, ExternalInput::QueryContact { contact_id: out });
        assert_eq!(value, json!(8));
    }

    #[test]
    fn replay_commands_are_refused_whatever_the_source() {
        let mut rt = runtime();
        for source in [Some("cli"), Some(HISTORY_SOURCE), None] {
            let err = rt.dispatch(
                ExternalInput::SetContents {
                    contents: Vec::new(),
                },
                source,
                false,
            );
            assert!(matches!(err, Err(DispatchError::ReservedCommand("set-contents"))));
        }
        assert!(
            rt.replay(ExternalInput::SetContents {
                contents: Vec::new()
            })
            .is_ok()
        );
    }

    #[test]
    fn replayed_wire_needs_reachable_endpoints() {
        let mut rt = runtime();
        let g = root(&mut rt);
        let a = contact(&mut rt, g, None);
        let err = rt.replay(ExternalInput::RestoreWire {
            wire: OwnedWire {
                group_id: g,
                wire: Wire {
                    id: WireId(999_999),
                    from_id: a,
                    to_id: ContactId(424_242),
                    wire_type: WireType::Directed,
                },
            },
        });
        assert!(matches!(
            err,
            Err(DispatchError::Core(CoreError::UnresolvedEndpoint { .. }))
        ));
        assert_eq!(rt.counts().wires, 0);
    }

    #[test]
    fn rollback_restores_graph_and_holds_back_changes() {
        let mut rt = runtime();
        let seen = Arc::new(Mutex::new(0usize));
        let sink = Arc::clone(&seen);
        rt.subscribe(Box::new(move |_: &ContactChange| {
            if let Ok(mut count) = sink.lock() {
                *count += 1;
            }
        }));
        let g = root(&mut rt);
        let a = contact(&mut rt, g, Some(json!(1)));
        let before = *seen.lock().expect("lock");
        rt.drain_journal();

        rt.begin();
        rt.replay(ExternalInput::SetContents {
            contents: vec![ContentSnapshot {
                contact_id: a,
                content: Some(json!(2)),
            }],
        })
        .expect("replay");
        rt.replay(ExternalInput::RemoveContact { contact_id: a })
            .expect("replay");
        rt.rollback();

        assert_eq!(rt.find_contact(a).and_then(|c| c.content.clone()), Some(json!(1)));
        assert!(rt.drain_journal().is_empty());
        assert_eq!(*seen.lock().expect("lock"), before);
    }

    #[test]
    fn runaway_wire_is_rolled_back() {
        let mut rt = runtime();
        let g = root(&mut rt);
        let x = contact(&mut rt, g, Some(json!(true)));
        let gadget: GroupId = id_of(run(
            &mut rt,
            ExternalInput::CreatePrimitiveGadget {
                qualified_name: "core/not".into(),
                parent_group_id: Some(g),
            },
        ));
        let port = |rt: &Runtime, name: &str| {
            rt.group(gadget)
                .and_then(|grp| grp.boundary_by_name(name))
                .map(|c| c.id)
                .expect("port")
        };
        let (value, result) = (port(&rt, "value"), port(&rt, "result"));
        run(
            &mut rt,
            ExternalInput::CreateWire {
                from_contact_id: x,
                to_contact_id: value,
                wire_type: Some(WireType::Directed),
            },
        );
        let before = rt.group(g).map(ContactGroup::snapshot);
        rt.drain_journal();

        let err = rt.dispatch(
            ExternalInput::CreateWire {
                from_contact_id: result,
                to_contact_id: x,
                wire_type: Some(WireType::Directed),
            },
            None,
            true,
        );

        assert!(matches!(
            err,
            Err(DispatchError::Core(CoreError::PropagationLimit { .. }))
        ));
        assert_eq!(rt.group(g).map(ContactGroup::snapshot), before);
        assert!(rt.drain_journal().is_empty());
    }

    #[test]
    fn history_commands_without_driver_are_unsupported() {
        let mut rt = runtime();
        let err = rt.dispatch(ExternalInput::Undo, None, false);
        assert!(matches!(err, Err(DispatchError::NoHistoryDriver("undo"))));
    }

    #[test]
    fn subscribers_see_every_change() {
        let mut rt = runtime();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        rt.subscribe(Box::new(move |change: &ContactChange| {
            if let Ok(mut log) = sink.lock() {
                log.push(change.contact_id);
            }
        }));
        let g = root(&mut rt);
        let a = contact(&mut rt, g, None);
        let b = contact(&mut rt, g, None);
        run(
            &mut rt,
            ExternalInput::CreateWire {
                from_contact_id: a,
                to_contact_id: b,
                wire_type: None,
            },
        );
        run(
            &mut rt,
            ExternalInput::ContactUpdate {
                contact_id: a,
                group_id: g,
                value: Some(json!("hi")),
            },
        );

        let log = seen.lock().expect("lock");
        assert_eq!(*log, vec![a, b]);
    }

    #[test]
    fn wire_between_parent_and_child_boundary_lives_in_parent() {
        let mut rt = runtime();
        let g = root(&mut rt);
        let a = contact(&mut rt, g, Some(json!(1)));
        let gadget: GroupId = id_of(run(
            &mut rt,
            ExternalInput::CreatePrimitiveGadget {
                qualified_name: "core/identity".into(),
                parent_group_id: Some(g),
            },
        ));
        let input = rt
            .group(gadget)
            .and_then(|grp| grp.boundary_by_name("value"))
            .map(|c| c.id)
            .expect("port");

        // Ask with the child's port first; the parent still owns the wire.
        let wire: WireId = id_of(run(
            &mut rt,
            ExternalInput::CreateWire {
                from_contact_id: input,
                to_contact_id: a,
                wire_type: None,
            },
        ));
        assert_eq!(rt.group(g).and_then(|grp| grp.wire(wire)).map(|w| w.id), Some(wire));
        let result = rt
            .group(gadget)
            .and_then(|grp| grp.boundary_by_name("result"))
            .and_then(|c| c.content.clone());
        assert_eq!(result, Some(json!(1)));
    }

    #[test]
    fn wire_across_roots_is_unresolved() {
        let mut rt = runtime();
        let g1 = root(&mut rt);
        let g2 = root(&mut rt);
        let a = contact(&mut rt, g1, None);
        let b = contact(&mut rt, g2, None);
        let err = rt.dispatch(
            ExternalInput::CreateWire {
                from_contact_id: a,
                to_contact_id: b,
                wire_type: None,
            },
            None,
            false,
        );
        assert!(matches!(
            err,
            Err(DispatchError::Core(CoreError::UnresolvedEndpoint { .. }))
        ));
    }

    #[test]
    fn batch_updates_wait_for_tick() {
        let mut rt = Runtime::new(
            Box::new(GadgetRegistry::with_builtins()),
            Box::new(BatchScheduler::new(BatchConfig::default())),
        );
        let g = root(&mut rt);
        let a = contact(&mut rt, g, None);
        for value in [json!(1), json!(2)] {
            let receipt = run(
                &mut rt,
                ExternalInput::ContactUpdate {
                    contact_id: a,
                    group_id: g,
                    value: Some(value),
                },
            );
            assert_eq!(receipt["scheduled"], true);
        }
        assert_eq!(rt.find_contact(a).and_then(|c| c.content.clone()), None);
        assert_eq!(rt.contradictions().count(), 1);

        assert_eq!(rt.tick(), 1);
        assert_eq!(rt.find_contact(a).and_then(|c| c.content.clone()), Some(json!(2)));
    }

    #[test]
    fn journal_covers_subtree_and_restore_rebuilds_it() {
        let mut rt = runtime();
        let g = root(&mut rt);
        let a = contact(&mut rt, g, Some(json!("x")));
        run(
            &mut rt,
            ExternalInput::CreatePrimitiveGadget {
                qualified_name: "core/not".into(),
                parent_group_id: Some(g),
            },
        );
        let mut storage = crate::storage::MemoryStorage::new();
        crate::storage::StorageDriver::apply(&mut storage, &rt.drain_journal()).expect("apply");
        let network = crate::storage::StorageDriver::load(&storage).expect("load");

        let mut restored = runtime();
        assert_eq!(restored.restore(network), 1);
        assert_eq!(restored.counts(), rt.counts());
        assert_eq!(
            restored.find_contact(a).and_then(|c| c.content.clone()),
            Some(json!("x"))
        );
    }

    #[test]
    fn find_contact_from_sees_parent_boundary() {
        let mut rt = runtime();
        let outer = root(&mut rt);
        let gadget: GroupId = id_of(run(
            &mut rt,
            ExternalInput::CreatePrimitiveGadget {
                qualified_name: "core/identity".into(),
                parent_group_id: Some(outer),
            },
        ));
        let inner: GroupId = id_of(run(
            &mut rt,
            ExternalInput::AddGroup {
                name: "inner".into(),
                parent_group_id: Some(gadget),
                primitive_id: None,
            },
        ));
        let port = rt
            .group(gadget)
            .and_then(|grp| grp.boundary_by_name("value"))
            .map(|c| c.id)
            .expect("port");

        assert!(rt.find_contact_from(inner, port).is_some());
        assert!(rt.find_contact_from(outer, port).is_some());
    }
}
