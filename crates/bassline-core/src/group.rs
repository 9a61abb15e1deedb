//! # Contact Groups
//!
//! A `ContactGroup` exclusively owns its contacts, its wires and its child
//! groups. The parent is referenced by id only; nothing below a group can
//! reach it directly.
//!
//! ## Propagation scope
//!
//! Every operation treats the group it is invoked on as the *scope*: a
//! propagation wave may travel down into descendants and back up to the
//! scope, but never above it. The runtime always invokes operations on the
//! root of a tree, so in practice waves cover the whole tree.
//!
//! ## Wave order
//!
//! A wave is a depth-first worklist seeded at the write site. When a
//! contact's content changes, the next deliveries are (in order):
//! 1. wires of the owning group that carry content away from the contact
//! 2. wires of the parent group, if the contact is a boundary contact
//! 3. output boundary contacts, if the owning group is primitive and the
//!    contact is an input boundary
//!
//! Clearing a contact (delivering `None`) never travels along wires; it
//! only re-runs the primitive computation of the owning group.

use crate::blend::BlendOutcome;
use crate::gadget::PrimitiveRegistry;
use crate::limits::MAX_PROPAGATION_STEPS;
use crate::types::{
    BlendMode, BoundaryDirection, Contact, ContactId, ContentChange, Contradiction, CoreError,
    GroupId, OwnedWire, Position, Propagation, Wire, WireId, WireType, observe_id,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;

// =============================================================================
// PRIMITIVE COMPUTATION
// =============================================================================

/// Maps input boundary values (by name) to output boundary values (by name).
///
/// Inputs without content are absent from the map. An output missing from
/// the result, or mapped to `None`, is cleared.
pub type ComputeFn =
    Arc<dyn Fn(&BTreeMap<String, Value>) -> BTreeMap<String, Option<Value>> + Send + Sync>;

// =============================================================================
// CONTACT GROUP
// =============================================================================

/// A node of the group tree.
#[derive(Clone)]
pub struct ContactGroup {
    id: GroupId,
    name: String,
    parent_id: Option<GroupId>,
    contacts: BTreeMap<ContactId, Contact>,
    wires: BTreeMap<WireId, Wire>,
    boundary: BTreeSet<ContactId>,
    subgroups: BTreeMap<GroupId, ContactGroup>,
    is_primitive: bool,
    primitive_id: Option<String>,
    compute: Option<ComputeFn>,
}

impl fmt::Debug for ContactGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContactGroup")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("parent_id", &self.parent_id)
            .field("contacts", &self.contacts.len())
            .field("wires", &self.wires.len())
            .field("subgroups", &self.subgroups.keys().collect::<Vec<_>>())
            .field("primitive_id", &self.primitive_id)
            .finish_non_exhaustive()
    }
}

/// Whether removing a wire clears endpoints left without connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Removal {
    /// Clear orphaned endpoints and recompute dependent primitives.
    ClearOrphans,
    /// Remove only; contents are left as they are.
    Raw,
}

/// A removed wire.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedWire {
    pub wire: OwnedWire,
    pub propagation: Propagation,
}

/// A removed contact with every wire that was removed along with it.
#[derive(Debug, Clone, PartialEq)]
pub struct RemovedContact {
    pub contact: Contact,
    pub wires: Vec<OwnedWire>,
    pub propagation: Propagation,
}

/// A removed subtree with the parent wires that terminated on it.
#[derive(Debug, Clone)]
pub struct RemovedGroup {
    pub group: ContactGroup,
    pub parent_id: GroupId,
    pub wires: Vec<OwnedWire>,
    pub propagation: Propagation,
}

/// Element counts of a subtree, the group itself included.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct GroupCounts {
    pub groups: usize,
    pub contacts: usize,
    pub wires: usize,
}

/// One pending delivery of a wave.
#[derive(Debug)]
struct Delivery {
    target: ContactId,
    content: Option<Value>,
    source: Option<ContactId>,
}

impl ContactGroup {
    /// Create an empty group with a fresh id.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_id(GroupId::fresh(), name)
    }

    /// Create an empty group with a known id (restores and snapshots).
    #[must_use]
    pub fn with_id(id: GroupId, name: impl Into<String>) -> Self {
        observe_id(id.0);
        Self {
            id,
            name: name.into(),
            parent_id: None,
            contacts: BTreeMap::new(),
            wires: BTreeMap::new(),
            boundary: BTreeSet::new(),
            subgroups: BTreeMap::new(),
            is_primitive: false,
            primitive_id: None,
            compute: None,
        }
    }

    /// Mark this group as an instance of a primitive gadget.
    ///
    /// `compute` may be `None` when the primitive is not registered in the
    /// current process; the group then keeps its boundary but computes
    /// nothing.
    pub fn mark_primitive(&mut self, qualified_name: impl Into<String>, compute: Option<ComputeFn>) {
        self.is_primitive = true;
        self.primitive_id = Some(qualified_name.into());
        self.compute = compute;
    }

    pub(crate) fn rename(&mut self, name: impl Into<String>) {
        self.name = name.into();
    }

    // =========================================================================
    // ACCESSORS
    // =========================================================================

    pub fn id(&self) -> GroupId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn parent_id(&self) -> Option<GroupId> {
        self.parent_id
    }

    pub fn is_primitive(&self) -> bool {
        self.is_primitive
    }

    pub fn primitive_id(&self) -> Option<&str> {
        self.primitive_id.as_deref()
    }

    /// True when the primitive has a compute function bound.
    pub fn has_compute(&self) -> bool {
        self.compute.is_some()
    }

    /// Contacts owned directly by this group.
    pub fn contacts(&self) -> impl Iterator<Item = &Contact> {
        self.contacts.values()
    }

    /// Local contact lookup (no recursion).
    pub fn contact(&self, id: ContactId) -> Option<&Contact> {
        self.contacts.get(&id)
    }

    /// Wires owned directly by this group.
    pub fn wires(&self) -> impl Iterator<Item = &Wire> {
        self.wires.values()
    }

    pub fn wire(&self, id: WireId) -> Option<&Wire> {
        self.wires.get(&id)
    }

    pub fn boundary_ids(&self) -> impl Iterator<Item = ContactId> + '_ {
        self.boundary.iter().copied()
    }

    pub fn is_boundary(&self, id: ContactId) -> bool {
        self.boundary.contains(&id)
    }

    /// Immediate child groups.
    pub fn subgroups(&self) -> impl Iterator<Item = &ContactGroup> {
        self.subgroups.values()
    }

    pub fn subgroup(&self, id: GroupId) -> Option<&ContactGroup> {
        self.subgroups.get(&id)
    }

    /// Boundary contact of this group looked up by name.
    pub fn boundary_by_name(&self, name: &str) -> Option<&Contact> {
        self.boundary
            .iter()
            .filter_map(|id| self.contacts.get(id))
            .find(|c| c.name.as_deref() == Some(name))
    }

    pub fn counts(&self) -> GroupCounts {
        self.subgroups.values().fold(
            GroupCounts {
                groups: 1,
                contacts: self.contacts.len(),
                wires: self.wires.len(),
            },
            |acc, sub| {
                let c = sub.counts();
                GroupCounts {
                    groups: acc.groups + c.groups,
                    contacts: acc.contacts + c.contacts,
                    wires: acc.wires + c.wires,
                }
            },
        )
    }

    // =========================================================================
    // TREE NAVIGATION
    // =========================================================================

    /// Path of group ids from this group (exclusive) down to the group
    /// satisfying `owns`.
    fn locate(&self, owns: &dyn Fn(&ContactGroup) -> bool) -> Option<Vec<GroupId>> {
        if owns(self) {
            return Some(Vec::new());
        }
        for (id, sub) in &self.subgroups {
            if let Some(mut path) = sub.locate(owns) {
                path.insert(0, *id);
                return Some(path);
            }
        }
        None
    }

    fn locate_contact(&self, id: ContactId) -> Option<Vec<GroupId>> {
        self.locate(&|g| g.contacts.contains_key(&id))
    }

    fn locate_wire(&self, id: WireId) -> Option<Vec<GroupId>> {
        self.locate(&|g| g.wires.contains_key(&id))
    }

    fn locate_group(&self, id: GroupId) -> Option<Vec<GroupId>> {
        self.locate(&|g| g.id == id)
    }

    fn at(&self, path: &[GroupId]) -> Option<&ContactGroup> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => self.subgroups.get(head)?.at(rest),
        }
    }

    fn at_mut(&mut self, path: &[GroupId]) -> Option<&mut ContactGroup> {
        match path.split_first() {
            None => Some(self),
            Some((head, rest)) => self.subgroups.get_mut(head)?.at_mut(rest),
        }
    }

    /// True if `id` is this group or any descendant.
    pub fn contains_group(&self, id: GroupId) -> bool {
        self.locate_group(id).is_some()
    }

    /// Find a group in this subtree.
    pub fn group(&self, id: GroupId) -> Option<&ContactGroup> {
        self.at(&self.locate_group(id)?)
    }

    /// Find a group in this subtree for structural edits.
    pub fn group_mut(&mut self, id: GroupId) -> Option<&mut ContactGroup> {
        let path = self.locate_group(id)?;
        self.at_mut(&path)
    }

    /// Find a contact anywhere in this subtree.
    pub fn find_contact(&self, id: ContactId) -> Option<&Contact> {
        self.at(&self.locate_contact(id)?)?.contacts.get(&id)
    }

    /// Id of the group owning a wire anywhere in this subtree.
    pub fn wire_owner(&self, id: WireId) -> Option<GroupId> {
        Some(self.at(&self.locate_wire(id)?)?.id)
    }

    // =========================================================================
    // FACTORIES
    // =========================================================================

    /// Create an interior contact.
    pub fn add_contact(&mut self, position: Position, blend_mode: Option<BlendMode>) -> ContactId {
        let contact = Contact::new(self.id, position, blend_mode.unwrap_or_default());
        let id = contact.id;
        self.contacts.insert(id, contact);
        id
    }

    /// Create a boundary contact.
    pub fn add_boundary_contact(
        &mut self,
        position: Position,
        direction: BoundaryDirection,
        name: Option<String>,
        blend_mode: Option<BlendMode>,
    ) -> ContactId {
        let contact = Contact::boundary(
            self.id,
            position,
            direction,
            name,
            blend_mode.unwrap_or_default(),
        );
        let id = contact.id;
        self.boundary.insert(id);
        self.contacts.insert(id, contact);
        id
    }

    /// Attach `group` as an immediate child.
    pub fn add_subgroup(&mut self, mut group: ContactGroup) -> GroupId {
        let id = group.id;
        group.parent_id = Some(self.id);
        self.subgroups.insert(id, group);
        id
    }

    /// Attach `group` as a child of `parent`, anywhere in this subtree.
    pub fn add_subgroup_within(
        &mut self,
        parent: GroupId,
        group: ContactGroup,
    ) -> Result<GroupId, CoreError> {
        let owner = self
            .group_mut(parent)
            .ok_or(CoreError::GroupNotFound(parent))?;
        Ok(owner.add_subgroup(group))
    }

    // =========================================================================
    // CONNECTIVITY
    // =========================================================================

    /// True for local contacts and boundary contacts of immediate subgroups.
    pub fn can_connect_to(&self, id: ContactId) -> bool {
        self.contacts.contains_key(&id) || self.subgroups.values().any(|s| s.is_boundary(id))
    }

    /// Wire two contacts inside this group and propagate existing content.
    pub fn connect(
        &mut self,
        from: ContactId,
        to: ContactId,
        wire_type: WireType,
    ) -> Result<(Wire, Propagation), CoreError> {
        self.connect_within(self.id, from, to, wire_type)
    }

    /// Wire two contacts inside the descendant `group_id`, propagating with
    /// this group as scope.
    ///
    /// Fails without effect if either endpoint is not connectable from
    /// `group_id`, or if the initial wave exceeds the step limit.
    pub fn connect_within(
        &mut self,
        group_id: GroupId,
        from: ContactId,
        to: ContactId,
        wire_type: WireType,
    ) -> Result<(Wire, Propagation), CoreError> {
        let owner = self
            .group_mut(group_id)
            .ok_or(CoreError::GroupNotFound(group_id))?;
        for endpoint in [from, to] {
            if !owner.can_connect_to(endpoint) {
                return Err(CoreError::UnresolvedEndpoint {
                    from,
                    to,
                    endpoint,
                    group: group_id,
                });
            }
        }
        let wire = Wire::new(from, to, wire_type);
        owner.wires.insert(wire.id, wire);

        let from_content = self.find_contact(from).and_then(|c| c.content.clone());
        let to_content = self.find_contact(to).and_then(|c| c.content.clone());

        let mut seeds = Vec::new();
        if let Some(content) = from_content {
            seeds.push(Delivery {
                target: to,
                content: Some(content),
                source: Some(from),
            });
        }
        if wire_type == WireType::Bidirectional {
            if let Some(content) = to_content {
                seeds.push(Delivery {
                    target: from,
                    content: Some(content),
                    source: Some(to),
                });
            }
        }
        match self.run(seeds) {
            Ok(propagation) => {
                tracing::debug!(wire_id = %wire.id, %from, %to, group_id = %group_id, "wire connected");
                Ok((wire, propagation))
            }
            Err(e) => {
                if let Some(owner) = self.group_mut(group_id) {
                    owner.wires.remove(&wire.id);
                }
                Err(e)
            }
        }
    }

    /// True if any wire still touches the contact: wires of its owning
    /// group, plus wires of the parent group for boundary contacts.
    pub fn has_any_connections(&self, id: ContactId) -> bool {
        let Some(path) = self.locate_contact(id) else {
            return false;
        };
        let Some(owner) = self.at(&path) else {
            return false;
        };
        if owner.wires.values().any(|w| w.touches(id)) {
            return true;
        }
        match path.split_last() {
            Some((_, parent_path)) if owner.is_boundary(id) => self
                .at(parent_path)
                .is_some_and(|parent| parent.wires.values().any(|w| w.touches(id))),
            _ => false,
        }
    }

    // =========================================================================
    // PROPAGATION
    // =========================================================================

    /// Deliver content to a contact anywhere in this subtree and run the
    /// resulting wave. `None` clears the contact.
    pub fn deliver_content(
        &mut self,
        id: ContactId,
        content: Option<Value>,
        source: Option<ContactId>,
    ) -> Result<Propagation, CoreError> {
        if self.locate_contact(id).is_none() {
            return Err(CoreError::ContactNotFound(id));
        }
        self.run(vec![Delivery {
            target: id,
            content,
            source,
        }])
    }

    /// Record a conflicting write. Never aborts the wave.
    pub fn handle_contradiction(&self, contact_id: ContactId, reason: &str) -> Contradiction {
        tracing::warn!(
            contact_id = %contact_id,
            group_id = %self.id,
            reason = reason,
            "contradiction"
        );
        Contradiction {
            contact_id,
            group_id: self.id,
            reason: reason.to_string(),
        }
    }

    /// Run a wave to quiescence. A wave that hits the step limit is undone
    /// before the error is returned.
    fn run(&mut self, seeds: Vec<Delivery>) -> Result<Propagation, CoreError> {
        let mut wave = Propagation::default();
        let mut stack: Vec<Delivery> = seeds.into_iter().rev().collect();
        let mut steps = 0usize;

        while let Some(delivery) = stack.pop() {
            steps += 1;
            if steps > MAX_PROPAGATION_STEPS {
                self.revert(&wave);
                tracing::warn!(
                    contact_id = %delivery.target,
                    changes = wave.changes.len(),
                    "propagation limit reached, wave reverted"
                );
                return Err(CoreError::PropagationLimit {
                    contact: delivery.target,
                    limit: MAX_PROPAGATION_STEPS,
                });
            }
            let mut next = self.apply(delivery, &mut wave);
            next.reverse();
            stack.extend(next);
        }
        Ok(wave)
    }

    /// Put back the contents a wave overwrote, newest change first.
    fn revert(&mut self, wave: &Propagation) {
        for change in wave.changes.iter().rev() {
            let Some(path) = self.locate_contact(change.contact_id) else {
                continue;
            };
            if let Some(contact) = self
                .at_mut(&path)
                .and_then(|owner| owner.contacts.get_mut(&change.contact_id))
            {
                contact.content = change.previous.clone();
            }
        }
    }

    /// Apply one delivery; returns the deliveries it causes, in order.
    fn apply(&mut self, delivery: Delivery, wave: &mut Propagation) -> Vec<Delivery> {
        let target = delivery.target;
        let Some(path) = self.locate_contact(target) else {
            tracing::debug!(contact_id = %target, "delivery target no longer exists");
            return Vec::new();
        };
        let Some(owner) = self.at_mut(&path) else {
            return Vec::new();
        };
        let group_id = owner.id;
        let Some(contact) = owner.contacts.get(&target) else {
            return Vec::new();
        };
        let previous = contact.content.clone();
        let (is_input, is_boundary) = (contact.is_input(), contact.is_boundary);

        let current = match delivery.content {
            None if previous.is_none() => return Vec::new(),
            None => None,
            Some(incoming) => match contact.blend_mode.blend(previous.as_ref(), &incoming) {
                BlendOutcome::Unchanged => return Vec::new(),
                BlendOutcome::Contradiction(reason) => {
                    wave.contradictions
                        .push(owner.handle_contradiction(target, &reason));
                    return Vec::new();
                }
                BlendOutcome::Changed(value) => Some(value),
            },
        };

        if let Some(contact) = owner.contacts.get_mut(&target) {
            contact.content = current.clone();
        }
        tracing::trace!(
            contact_id = %target,
            source = ?delivery.source,
            "content changed"
        );
        wave.changes.push(ContentChange {
            contact_id: target,
            group_id,
            previous,
            current: current.clone(),
        });

        let mut next = Vec::new();
        if let Some(value) = &current {
            next.extend(owner.fan_out(target, value));
        }
        let recompute = is_input && owner.is_primitive;
        let outputs = if recompute {
            owner.compute_outputs()
        } else {
            Vec::new()
        };

        if let (Some(value), true, Some((_, parent_path))) =
            (&current, is_boundary, path.split_last())
        {
            if let Some(parent) = self.at(parent_path) {
                next.extend(parent.fan_out(target, value));
            }
        }
        next.extend(outputs);
        next
    }

    /// Deliveries along this group's wires carrying content away from
    /// `contact`.
    fn fan_out(&self, contact: ContactId, value: &Value) -> Vec<Delivery> {
        self.wires
            .values()
            .filter_map(|w| w.downstream_of(contact))
            .map(|target| Delivery {
                target,
                content: Some(value.clone()),
                source: Some(contact),
            })
            .collect()
    }

    /// Run the primitive computation and target every output boundary.
    fn compute_outputs(&self) -> Vec<Delivery> {
        let Some(compute) = &self.compute else {
            return Vec::new();
        };
        let inputs: BTreeMap<String, Value> = self
            .contacts
            .values()
            .filter(|c| c.is_input())
            .filter_map(|c| Some((c.name.clone()?, c.content.clone()?)))
            .collect();
        let mut outputs = compute(&inputs);
        self.contacts
            .values()
            .filter(|c| c.is_output())
            .map(|c| Delivery {
                target: c.id,
                content: c
                    .name
                    .as_ref()
                    .and_then(|name| outputs.remove(name))
                    .flatten(),
                source: None,
            })
            .collect()
    }

    // =========================================================================
    // REMOVAL
    // =========================================================================

    /// Remove a wire, clearing endpoints left without connections.
    pub fn remove_wire(&mut self, id: WireId) -> Result<RemovedWire, CoreError> {
        self.remove_wire_with(id, Removal::ClearOrphans)
    }

    pub fn remove_wire_with(
        &mut self,
        id: WireId,
        removal: Removal,
    ) -> Result<RemovedWire, CoreError> {
        let (wire, propagation) = self.detach_wire(id, removal, &BTreeSet::new())?;
        Ok(RemovedWire { wire, propagation })
    }

    fn detach_wire(
        &mut self,
        id: WireId,
        removal: Removal,
        skip: &BTreeSet<ContactId>,
    ) -> Result<(OwnedWire, Propagation), CoreError> {
        let path = self.locate_wire(id).ok_or(CoreError::WireNotFound(id))?;
        let owner = self.at_mut(&path).ok_or(CoreError::WireNotFound(id))?;
        let wire = owner.wires.remove(&id).ok_or(CoreError::WireNotFound(id))?;
        let owned = OwnedWire {
            group_id: owner.id,
            wire,
        };

        let mut propagation = Propagation::default();
        if removal == Removal::ClearOrphans {
            let mut endpoints = vec![wire.from_id];
            if wire.to_id != wire.from_id {
                endpoints.push(wire.to_id);
            }
            for endpoint in endpoints {
                if skip.contains(&endpoint) || self.has_any_connections(endpoint) {
                    continue;
                }
                let stale = self
                    .find_contact(endpoint)
                    .is_some_and(|c| c.content.is_some());
                if stale {
                    let cleared = self.run(vec![Delivery {
                        target: endpoint,
                        content: None,
                        source: None,
                    }]);
                    match cleared {
                        Ok(wave) => propagation.absorb(wave),
                        Err(e) => {
                            self.reattach(vec![(owned, propagation)]);
                            return Err(e);
                        }
                    }
                }
            }
        }
        tracing::debug!(wire_id = %id, group_id = %owned.group_id, "wire removed");
        Ok((owned, propagation))
    }

    /// Detach every wire in `ids`. On failure the wires already detached
    /// are put back and their waves reverted.
    fn detach_all(
        &mut self,
        ids: Vec<WireId>,
        removal: Removal,
        skip: &BTreeSet<ContactId>,
    ) -> Result<(Vec<OwnedWire>, Propagation), CoreError> {
        let mut detached = Vec::with_capacity(ids.len());
        for wire_id in ids {
            match self.detach_wire(wire_id, removal, skip) {
                Ok(done) => detached.push(done),
                Err(e) => {
                    self.reattach(detached);
                    return Err(e);
                }
            }
        }
        let mut propagation = Propagation::default();
        let wires = detached
            .into_iter()
            .map(|(wire, wave)| {
                propagation.absorb(wave);
                wire
            })
            .collect();
        Ok((wires, propagation))
    }

    /// Undo detachments, newest first.
    fn reattach(&mut self, detached: Vec<(OwnedWire, Propagation)>) {
        for (owned, wave) in detached.into_iter().rev() {
            self.revert(&wave);
            if let Some(owner) = self.group_mut(owned.group_id) {
                owner.wires.insert(owned.wire.id, owned.wire);
            }
        }
    }

    /// Remove a contact together with every incident wire.
    pub fn remove_contact(&mut self, id: ContactId) -> Result<RemovedContact, CoreError> {
        self.remove_contact_with(id, Removal::ClearOrphans)
    }

    pub fn remove_contact_with(
        &mut self,
        id: ContactId,
        removal: Removal,
    ) -> Result<RemovedContact, CoreError> {
        let path = self
            .locate_contact(id)
            .ok_or(CoreError::ContactNotFound(id))?;
        let owner = self.at(&path).ok_or(CoreError::ContactNotFound(id))?;

        let mut incident: Vec<WireId> = owner
            .wires
            .values()
            .filter(|w| w.touches(id))
            .map(|w| w.id)
            .collect();
        if let (true, Some((_, parent_path))) = (owner.is_boundary(id), path.split_last()) {
            if let Some(parent) = self.at(parent_path) {
                incident.extend(parent.wires.values().filter(|w| w.touches(id)).map(|w| w.id));
            }
        }

        let skip = BTreeSet::from([id]);
        let (wires, propagation) = self.detach_all(incident, removal, &skip)?;

        let owner = self.at_mut(&path).ok_or(CoreError::ContactNotFound(id))?;
        owner.boundary.remove(&id);
        let contact = owner
            .contacts
            .remove(&id)
            .ok_or(CoreError::ContactNotFound(id))?;
        tracing::debug!(contact_id = %id, group_id = %contact.group_id, "contact removed");
        Ok(RemovedContact {
            contact,
            wires,
            propagation,
        })
    }

    /// Remove a descendant group and every wire terminating on its boundary.
    pub fn remove_subgroup(&mut self, id: GroupId) -> Result<RemovedGroup, CoreError> {
        self.remove_subgroup_with(id, Removal::ClearOrphans)
    }

    pub fn remove_subgroup_with(
        &mut self,
        id: GroupId,
        removal: Removal,
    ) -> Result<RemovedGroup, CoreError> {
        let path = self.locate_group(id).ok_or(CoreError::GroupNotFound(id))?;
        let Some((_, parent_path)) = path.split_last() else {
            // The scope itself cannot be removed from within.
            return Err(CoreError::GroupNotFound(id));
        };
        let parent = self.at(parent_path).ok_or(CoreError::GroupNotFound(id))?;
        let parent_id = parent.id;
        let sub = parent.subgroups.get(&id).ok_or(CoreError::GroupNotFound(id))?;
        let skip: BTreeSet<ContactId> = sub.boundary.clone();
        let incident: Vec<WireId> = parent
            .wires
            .values()
            .filter(|w| skip.contains(&w.from_id) || skip.contains(&w.to_id))
            .map(|w| w.id)
            .collect();

        let (wires, propagation) = self.detach_all(incident, removal, &skip)?;

        let parent = self
            .at_mut(parent_path)
            .ok_or(CoreError::GroupNotFound(id))?;
        let group = parent
            .subgroups
            .remove(&id)
            .ok_or(CoreError::GroupNotFound(id))?;
        tracing::debug!(group_id = %id, parent_id = %parent_id, "group removed");
        Ok(RemovedGroup {
            group,
            parent_id,
            wires,
            propagation,
        })
    }

    // =========================================================================
    // RAW RESTORES (history replay, storage)
    // =========================================================================

    /// Re-insert a contact into its recorded group without propagating.
    pub fn insert_contact_raw(&mut self, contact: Contact) -> Result<(), CoreError> {
        let owner = self
            .group_mut(contact.group_id)
            .ok_or(CoreError::GroupNotFound(contact.group_id))?;
        observe_id(contact.id.0);
        if contact.is_boundary {
            owner.boundary.insert(contact.id);
        }
        owner.contacts.insert(contact.id, contact);
        Ok(())
    }

    /// Re-insert a wire into its recorded group without propagating. Both
    /// endpoints must be connectable from that group.
    pub fn insert_wire_raw(&mut self, owned: OwnedWire) -> Result<(), CoreError> {
        let owner = self
            .group_mut(owned.group_id)
            .ok_or(CoreError::GroupNotFound(owned.group_id))?;
        let Wire { from_id, to_id, .. } = owned.wire;
        for endpoint in [from_id, to_id] {
            if !owner.can_connect_to(endpoint) {
                return Err(CoreError::UnresolvedEndpoint {
                    from: from_id,
                    to: to_id,
                    endpoint,
                    group: owned.group_id,
                });
            }
        }
        observe_id(owned.wire.id.0);
        owner.wires.insert(owned.wire.id, owned.wire);
        Ok(())
    }

    /// Overwrite a contact's content without blending or propagating.
    pub fn set_content_raw(
        &mut self,
        id: ContactId,
        content: Option<Value>,
    ) -> Result<Option<ContentChange>, CoreError> {
        let path = self
            .locate_contact(id)
            .ok_or(CoreError::ContactNotFound(id))?;
        let owner = self.at_mut(&path).ok_or(CoreError::ContactNotFound(id))?;
        let group_id = owner.id;
        let contact = owner
            .contacts
            .get_mut(&id)
            .ok_or(CoreError::ContactNotFound(id))?;
        if contact.content == content {
            return Ok(None);
        }
        let previous = std::mem::replace(&mut contact.content, content.clone());
        Ok(Some(ContentChange {
            contact_id: id,
            group_id,
            previous,
            current: content,
        }))
    }

    // =========================================================================
    // SNAPSHOTS
    // =========================================================================

    /// Id-preserving snapshot of this subtree, content included.
    pub fn snapshot(&self) -> GroupSnapshot {
        GroupSnapshot {
            id: self.id,
            name: self.name.clone(),
            parent_id: self.parent_id,
            is_primitive: self.is_primitive,
            primitive_id: self.primitive_id.clone(),
            contacts: self.contacts.values().cloned().collect(),
            wires: self.wires.values().copied().collect(),
            subgroups: self.subgroups.values().map(|g| g.snapshot()).collect(),
        }
    }

    /// Rebuild a subtree from a snapshot, re-binding primitive computations
    /// through `registry`.
    pub fn from_snapshot(snapshot: &GroupSnapshot, registry: &dyn PrimitiveRegistry) -> Self {
        let mut group = Self::with_id(snapshot.id, snapshot.name.clone());
        group.parent_id = snapshot.parent_id;
        if snapshot.is_primitive {
            let compute = snapshot
                .primitive_id
                .as_deref()
                .and_then(|name| registry.compute(name));
            group.is_primitive = true;
            group.primitive_id = snapshot.primitive_id.clone();
            group.compute = compute;
        }
        for contact in &snapshot.contacts {
            observe_id(contact.id.0);
            if contact.is_boundary {
                group.boundary.insert(contact.id);
            }
            group.contacts.insert(contact.id, contact.clone());
        }
        for wire in &snapshot.wires {
            observe_id(wire.id.0);
            group.wires.insert(wire.id, *wire);
        }
        for sub in &snapshot.subgroups {
            let child = Self::from_snapshot(sub, registry);
            group.subgroups.insert(child.id, child);
        }
        group
    }
}

/// Serializable, id-preserving image of a subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupSnapshot {
    pub id: GroupId,
    pub name: String,
    #[serde(default)]
    pub parent_id: Option<GroupId>,
    #[serde(default)]
    pub is_primitive: bool,
    #[serde(default)]
    pub primitive_id: Option<String>,
    #[serde(default)]
    pub contacts: Vec<Contact>,
    #[serde(default)]
    pub wires: Vec<Wire>,
    #[serde(default)]
    pub subgroups: Vec<GroupSnapshot>,
}

impl GroupSnapshot {
    /// Every contact id in the subtree.
    pub fn contact_ids(&self) -> Vec<ContactId> {
        let mut ids: Vec<ContactId> = self.contacts.iter().map(|c| c.id).collect();
        for sub in &self.subgroups {
            ids.extend(sub.contact_ids());
        }
        ids
    }
}

// =============================================================================
// TESTS
// =============================================================================
