//! # Storage Drivers
//!
//! The runtime journals every structural and content mutation; after each
//! command the kernel drains the journal into the storage driver. On
//! initialization the driver hands back everything it holds and the runtime
//! rebuilds its group trees from it.
//!
//! Two backends:
//! - [`MemoryStorage`]: ordered maps, lost with the process.
//! - [`RedbStorage`]: redb tables, one write transaction per drained journal.

mod redb_store;

pub use redb_store::RedbStorage;

use crate::types::{Contact, ContactId, CoreError, GroupId, OwnedWire, WireId};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

// =============================================================================
// RECORDS
// =============================================================================

/// A group without its contents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRecord {
    pub id: GroupId,
    pub name: String,
    pub parent_id: Option<GroupId>,
    pub is_primitive: bool,
    pub primitive_id: Option<String>,
}

/// One journaled change.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    GroupSaved(GroupRecord),
    GroupRemoved(GroupId),
    ContactSaved(Contact),
    ContactRemoved(ContactId),
    ContentChanged {
        contact_id: ContactId,
        value: Option<Value>,
    },
    WireSaved(OwnedWire),
    WireRemoved(WireId),
}

/// Everything a storage driver holds, as flat record lists.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoredNetwork {
    pub groups: Vec<GroupRecord>,
    pub contacts: Vec<Contact>,
    pub wires: Vec<OwnedWire>,
}

impl StoredNetwork {
    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}

// =============================================================================
// DRIVER TRAIT
// =============================================================================

/// Persistence backend of a kernel.
pub trait StorageDriver: Send {
    fn name(&self) -> &'static str;

    /// Apply a drained journal atomically.
    fn apply(&mut self, mutations: &[Mutation]) -> Result<(), CoreError>;

    /// Everything currently stored.
    fn load(&self) -> Result<StoredNetwork, CoreError>;
}

// =============================================================================
// IN-MEMORY BACKEND
// =============================================================================

/// Volatile storage backed by ordered maps.
#[derive(Debug, Default, Clone)]
pub struct MemoryStorage {
    groups: BTreeMap<GroupId, GroupRecord>,
    contacts: BTreeMap<ContactId, Contact>,
    wires: BTreeMap<WireId, OwnedWire>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StorageDriver for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn apply(&mut self, mutations: &[Mutation]) -> Result<(), CoreError> {
        for mutation in mutations {
            match mutation {
                Mutation::GroupSaved(record) => {
                    self.groups.insert(record.id, record.clone());
                }
                Mutation::GroupRemoved(id) => {
                    self.groups.remove(id);
                }
                Mutation::ContactSaved(contact) => {
                    self.contacts.insert(contact.id, contact.clone());
                }
                Mutation::ContactRemoved(id) => {
                    self.contacts.remove(id);
                }
                Mutation::ContentChanged { contact_id, value } => {
                    if let Some(contact) = self.contacts.get_mut(contact_id) {
                        contact.content = value.clone();
                    }
                }
                Mutation::WireSaved(owned) => {
                    self.wires.insert(owned.wire.id, *owned);
                }
                Mutation::WireRemoved(id) => {
                    self.wires.remove(id);
                }
            }
        }
        Ok(())
    }

    fn load(&self) -> Result<StoredNetwork, CoreError> {
        Ok(StoredNetwork {
            groups: self.groups.values().cloned().collect(),
            contacts: self.contacts.values().cloned().collect(),
            wires: self.wires.values().copied().collect(),
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{BlendMode, Position, Wire, WireType};
    use serde_json::json;

    #[test]
    fn memory_storage_applies_journal_in_order() {
        let mut storage = MemoryStorage::new();
        let group = GroupRecord {
            id: GroupId(1),
            name: "root".into(),
            parent_id: None,
            is_primitive: false,
            primitive_id: None,
        };
        let contact = Contact::new(GroupId(1), Position::default(), BlendMode::AcceptLast);
        let wire = Wire::new(contact.id, contact.id, WireType::Directed);

        storage
            .apply(&[
                Mutation::GroupSaved(group.clone()),
                Mutation::ContactSaved(contact.clone()),
                Mutation::ContentChanged {
                    contact_id: contact.id,
                    value: Some(json!(3)),
                },
                Mutation::WireSaved(OwnedWire {
                    group_id: GroupId(1),
                    wire,
                }),
                Mutation::WireRemoved(wire.id),
            ])
            .expect("apply");

        let network = storage.load().expect("load");
        assert_eq!(network.groups, vec![group]);
        assert_eq!(network.contacts[0].content, Some(json!(3)));
        assert!(network.wires.is_empty());
    }
}
