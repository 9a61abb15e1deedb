//! # redb-backed Storage
//!
//! Three tables keyed by element id, values encoded with postcard:
//!
//! | table      | key        | value                |
//! |------------|------------|----------------------|
//! | `groups`   | group id   | [`GroupRecord`]      |
//! | `contacts` | contact id | contact, content as JSON text |
//! | `wires`    | wire id    | [`OwnedWire`]        |
//!
//! Contact content is arbitrary JSON, which postcard cannot describe, so it
//! is stored as its JSON serialization.

use super::{GroupRecord, Mutation, StorageDriver, StoredNetwork};
use crate::types::{
    BlendMode, BoundaryDirection, Contact, ContactId, CoreError, GroupId, OwnedWire, Position,
};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use std::path::Path;

const GROUPS: TableDefinition<u64, &[u8]> = TableDefinition::new("groups");
const CONTACTS: TableDefinition<u64, &[u8]> = TableDefinition::new("contacts");
const WIRES: TableDefinition<u64, &[u8]> = TableDefinition::new("wires");

/// Postcard-friendly contact row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct StoredContact {
    id: ContactId,
    group_id: GroupId,
    position: Position,
    content_json: Option<String>,
    blend_mode: BlendMode,
    is_boundary: bool,
    boundary_direction: Option<BoundaryDirection>,
    name: Option<String>,
}

impl StoredContact {
    fn from_contact(contact: &Contact) -> Result<Self, CoreError> {
        let content_json = contact
            .content
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| CoreError::SerializationError(e.to_string()))?;
        Ok(Self {
            id: contact.id,
            group_id: contact.group_id,
            position: contact.position,
            content_json,
            blend_mode: contact.blend_mode,
            is_boundary: contact.is_boundary,
            boundary_direction: contact.boundary_direction,
            name: contact.name.clone(),
        })
    }

    fn into_contact(self) -> Result<Contact, CoreError> {
        let content = self
            .content_json
            .as_deref()
            .map(serde_json::from_str)
            .transpose()
            .map_err(|e| CoreError::SerializationError(e.to_string()))?;
        Ok(Contact {
            id: self.id,
            group_id: self.group_id,
            position: self.position,
            content,
            blend_mode: self.blend_mode,
            is_boundary: self.is_boundary,
            boundary_direction: self.boundary_direction,
            name: self.name,
        })
    }
}

fn storage_err(e: impl std::fmt::Display) -> CoreError {
    CoreError::StorageError(e.to_string())
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CoreError> {
    postcard::to_allocvec(value).map_err(|e| CoreError::SerializationError(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, CoreError> {
    postcard::from_bytes(bytes).map_err(|e| CoreError::SerializationError(e.to_string()))
}

/// Durable storage in a single redb file.
pub struct RedbStorage {
    db: Database,
}

impl std::fmt::Debug for RedbStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedbStorage").finish_non_exhaustive()
    }
}

impl RedbStorage {
    /// Open or create a database at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let db = Database::create(path.as_ref()).map_err(|e| CoreError::IoError(e.to_string()))?;

        let write_txn = db.begin_write().map_err(storage_err)?;
        let _ = write_txn.open_table(GROUPS).map_err(storage_err)?;
        let _ = write_txn.open_table(CONTACTS).map_err(storage_err)?;
        let _ = write_txn.open_table(WIRES).map_err(storage_err)?;
        write_txn.commit().map_err(storage_err)?;

        tracing::info!(path = %path.as_ref().display(), "redb storage opened");
        Ok(Self { db })
    }

    fn read_all<T: DeserializeOwned>(
        &self,
        definition: TableDefinition<u64, &[u8]>,
    ) -> Result<Vec<T>, CoreError> {
        let read_txn = self.db.begin_read().map_err(storage_err)?;
        let table = read_txn.open_table(definition).map_err(storage_err)?;
        let mut rows = Vec::new();
        for entry in table.iter().map_err(storage_err)? {
            let (_, value) = entry.map_err(storage_err)?;
            rows.push(decode(value.value())?);
        }
        Ok(rows)
    }
}

impl StorageDriver for RedbStorage {
    fn name(&self) -> &'static str {
        "redb"
    }

    fn apply(&mut self, mutations: &[Mutation]) -> Result<(), CoreError> {
        if mutations.is_empty() {
            return Ok(());
        }
        let write_txn = self.db.begin_write().map_err(storage_err)?;
        {
            let mut groups = write_txn.open_table(GROUPS).map_err(storage_err)?;
            let mut contacts = write_txn.open_table(CONTACTS).map_err(storage_err)?;
            let mut wires = write_txn.open_table(WIRES).map_err(storage_err)?;

            for mutation in mutations {
                match mutation {
                    Mutation::GroupSaved(record) => {
                        let bytes = encode(record)?;
                        groups
                            .insert(record.id.0, bytes.as_slice())
                            .map_err(storage_err)?;
                    }
                    Mutation::GroupRemoved(id) => {
                        groups.remove(id.0).map_err(storage_err)?;
                    }
                    Mutation::ContactSaved(contact) => {
                        let bytes = encode(&StoredContact::from_contact(contact)?)?;
                        contacts
                            .insert(contact.id.0, bytes.as_slice())
                            .map_err(storage_err)?;
                    }
                    Mutation::ContactRemoved(id) => {
                        contacts.remove(id.0).map_err(storage_err)?;
                    }
                    Mutation::ContentChanged { contact_id, value } => {
                        let existing = contacts
                            .get(contact_id.0)
                            .map_err(storage_err)?
                            .map(|guard| guard.value().to_vec());
                        let Some(existing) = existing else {
                            tracing::debug!(contact_id = %contact_id, "content change for unsaved contact");
                            continue;
                        };
                        let mut row: StoredContact = decode(&existing)?;
                        row.content_json = value
                            .as_ref()
                            .map(serde_json::to_string)
                            .transpose()
                            .map_err(|e| CoreError::SerializationError(e.to_string()))?;
                        let bytes = encode(&row)?;
                        contacts
                            .insert(contact_id.0, bytes.as_slice())
                            .map_err(storage_err)?;
                    }
                    Mutation::WireSaved(owned) => {
                        let bytes = encode(owned)?;
                        wires
                            .insert(owned.wire.id.0, bytes.as_slice())
                            .map_err(storage_err)?;
                    }
                    Mutation::WireRemoved(id) => {
                        wires.remove(id.0).map_err(storage_err)?;
                    }
                }
            }
        }
        write_txn.commit().map_err(storage_err)?;
        tracing::trace!(mutations = mutations.len(), "journal committed");
        Ok(())
    }

    fn load(&self) -> Result<StoredNetwork, CoreError> {
        let groups: Vec<GroupRecord> = self.read_all(GROUPS)?;
        let contacts = self
            .read_all::<StoredContact>(CONTACTS)?
            .into_iter()
            .map(StoredContact::into_contact)
            .collect::<Result<Vec<_>, _>>()?;
        let wires: Vec<OwnedWire> = self.read_all(WIRES)?;
        Ok(StoredNetwork {
            groups,
            contacts,
            wires,
        })
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Wire, WireType};
    use serde_json::json;
    use tempfile::tempdir;

    fn root_record() -> GroupRecord {
        GroupRecord {
            id: GroupId(10),
            name: "root".into(),
            parent_id: None,
            is_primitive: false,
            primitive_id: None,
        }
    }

    #[test]
    fn survives_reopen() {
        let temp = tempdir().expect("temp dir");
        let path = temp.path().join("net.redb");
        let mut contact = Contact::new(GroupId(10), Position::new(3.0, 4.0), BlendMode::SetUnion);
        contact.content = Some(json!({"nested": [1, "two", null]}));
        let wire = OwnedWire {
            group_id: GroupId(10),
            wire: Wire::new(contact.id, contact.id, WireType::Bidirectional),
        };

        {
            let mut storage = RedbStorage::open(&path).expect("open");
            storage
                .apply(&[
                    Mutation::GroupSaved(root_record()),
                    Mutation::ContactSaved(contact.clone()),
                    Mutation::WireSaved(wire),
                ])
                .expect("apply");
        }

        let storage = RedbStorage::open(&path).expect("reopen");
        let network = storage.load().expect("load");
        assert_eq!(network.groups, vec![root_record()]);
        assert_eq!(network.contacts, vec![contact]);
        assert_eq!(network.wires, vec![wire]);
    }

    #[test]
    fn content_changes_rewrite_rows() {
        let temp = tempdir().expect("temp dir");
        let mut storage = RedbStorage::open(temp.path().join("net.redb")).expect("open");
        let contact = Contact::new(GroupId(10), Position::default(), BlendMode::AcceptLast);

        storage
            .apply(&[
                Mutation::GroupSaved(root_record()),
                Mutation::ContactSaved(contact.clone()),
                Mutation::ContentChanged {
                    contact_id: contact.id,
                    value: Some(json!("set")),
                },
            ])
            .expect("apply");
        storage
            .apply(&[Mutation::ContentChanged {
                contact_id: contact.id,
                value: None,
            }])
            .expect("apply");

        let network = storage.load().expect("load");
        assert_eq!(network.contacts[0].content, None);
    }

    #[test]
    fn removals_delete_rows() {
        let temp = tempdir().expect("temp dir");
        let mut storage = RedbStorage::open(temp.path().join("net.redb")).expect("open");
        storage
            .apply(&[Mutation::GroupSaved(root_record())])
            .expect("apply");
        storage
            .apply(&[Mutation::GroupRemoved(GroupId(10))])
            .expect("apply");
        assert!(storage.load().expect("load").is_empty());
    }
}
