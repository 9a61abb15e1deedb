//! # Group Templates
//!
//! Structural, id-independent snapshots of a group subtree.
//!
//! A template numbers contacts by their position in the exported list and
//! references wire endpoints either by that local index or, for boundary
//! contacts of a subgroup, by `(subgroup index, boundary name)`. A boundary
//! contact without a name, or whose name is shared with another boundary
//! contact of the same subgroup, is referenced by its position in the
//! subgroup's own contact list instead. Content is never part of a
//! template.
//!
//! ## Binary framing
//!
//! ```text
//! [header_len: u32 LE] [TemplateHeader (postcard)] [FlatTemplate (postcard)]
//! ```
//!
//! The header carries magic bytes, a version, the total contact count (so
//! oversized imports are rejected before the payload is decoded), an FNV-1a
//! checksum of the payload and, with the `crypto-hash` feature, a BLAKE3
//! digest. The payload lists the groups of the tree in pre-order, each with
//! the index of its parent, so decoding never recurses and the nesting
//! limit is checked before the tree is rebuilt.

use crate::gadget::PrimitiveRegistry;
use crate::group::ContactGroup;
use crate::limits::{
    MAX_TEMPLATE_BYTES, MAX_TEMPLATE_CONTACTS, MAX_TEMPLATE_DEPTH, TEMPLATE_MAGIC,
    TEMPLATE_VERSION,
};
use crate::types::{BlendMode, BoundaryDirection, ContactId, CoreError, Position, WireType};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =============================================================================
// TEMPLATE TYPES
// =============================================================================

/// One contact of a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContactSpec {
    pub blend_mode: BlendMode,
    pub position: Position,
    pub is_boundary: bool,
    pub boundary_direction: Option<BoundaryDirection>,
    pub name: Option<String>,
}

/// A wire endpoint inside a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WireEndpoint {
    /// Index into the template's own contact list.
    Local { index: u32 },
    /// Boundary contact of the subgroup at `subgroup`, by name.
    Subgroup { subgroup: u32, name: String },
    /// Boundary contact of the subgroup at `subgroup`, by its position in
    /// that subgroup's contact list.
    Port { subgroup: u32, index: u32 },
}

/// One wire of a template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireSpec {
    pub from: WireEndpoint,
    pub to: WireEndpoint,
    pub wire_type: WireType,
}

/// Structural snapshot of a group subtree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupTemplate {
    pub name: String,
    pub contacts: Vec<ContactSpec>,
    pub wires: Vec<WireSpec>,
    pub subgroups: Vec<GroupTemplate>,
    pub boundary_indices: Vec<u32>,
    /// Qualified gadget name for primitive groups.
    pub primitive: Option<String>,
}

impl GroupTemplate {
    /// Contacts summed over every nesting level.
    pub fn contact_count(&self) -> usize {
        self.contacts.len()
            + self
                .subgroups
                .iter()
                .map(GroupTemplate::contact_count)
                .sum::<usize>()
    }

    /// Nesting depth; a template without subgroups has depth 1.
    pub fn depth(&self) -> usize {
        1 + self
            .subgroups
            .iter()
            .map(GroupTemplate::depth)
            .max()
            .unwrap_or(0)
    }

    /// Check import limits.
    pub fn validate(&self) -> Result<(), CoreError> {
        if self.depth() > MAX_TEMPLATE_DEPTH {
            return Err(CoreError::InvalidTemplate(format!(
                "nesting depth {} exceeds maximum {}",
                self.depth(),
                MAX_TEMPLATE_DEPTH
            )));
        }
        let contacts = self.contact_count();
        if contacts > MAX_TEMPLATE_CONTACTS {
            return Err(CoreError::InvalidTemplate(format!(
                "{} contacts exceeds maximum {}",
                contacts, MAX_TEMPLATE_CONTACTS
            )));
        }
        Ok(())
    }
}

/// A template wire that could not be resolved on import.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SkippedWire {
    /// Name of the template group that declared the wire.
    pub group: String,
    pub wire: WireSpec,
    pub reason: String,
}

/// Result of [`ContactGroup::from_template`].
#[derive(Debug)]
pub struct TemplateImport {
    pub group: ContactGroup,
    pub skipped: Vec<SkippedWire>,
}

// =============================================================================
// EXPORT
// =============================================================================

impl ContactGroup {
    /// Structural snapshot of this subtree.
    pub fn to_template(&self) -> GroupTemplate {
        let local: BTreeMap<ContactId, u32> = self
            .contacts()
            .enumerate()
            .map(|(i, c)| (c.id, i as u32))
            .collect();

        let mut ported: BTreeMap<ContactId, WireEndpoint> = BTreeMap::new();
        for (sub_index, sub) in self.subgroups().enumerate() {
            let subgroup = sub_index as u32;
            let mut uses: BTreeMap<&str, usize> = BTreeMap::new();
            for name in sub.contacts().filter(|c| c.is_boundary).filter_map(|c| c.name.as_deref()) {
                *uses.entry(name).or_default() += 1;
            }
            for (position, contact) in sub.contacts().enumerate() {
                if !contact.is_boundary {
                    continue;
                }
                let endpoint = match contact.name.as_deref() {
                    Some(name) if uses.get(name) == Some(&1) => WireEndpoint::Subgroup {
                        subgroup,
                        name: name.to_string(),
                    },
                    _ => WireEndpoint::Port {
                        subgroup,
                        index: position as u32,
                    },
                };
                ported.insert(contact.id, endpoint);
            }
        }

        let endpoint = |id: ContactId| -> Option<WireEndpoint> {
            match local.get(&id) {
                Some(index) => Some(WireEndpoint::Local { index: *index }),
                None => ported.get(&id).cloned(),
            }
        };

        let mut wires = Vec::new();
        for wire in self.wires() {
            match (endpoint(wire.from_id), endpoint(wire.to_id)) {
                (Some(from), Some(to)) => wires.push(WireSpec {
                    from,
                    to,
                    wire_type: wire.wire_type,
                }),
                _ => tracing::warn!(wire_id = %wire.id, group_id = %self.id(), "dangling wire left out of template"),
            }
        }

        GroupTemplate {
            name: self.name().to_string(),
            contacts: self
                .contacts()
                .map(|c| ContactSpec {
                    blend_mode: c.blend_mode,
                    position: c.position,
                    is_boundary: c.is_boundary,
                    boundary_direction: c.boundary_direction,
                    name: c.name.clone(),
                })
                .collect(),
            wires,
            subgroups: self.subgroups().map(ContactGroup::to_template).collect(),
            boundary_indices: self
                .contacts()
                .filter(|c| c.is_boundary)
                .filter_map(|c| local.get(&c.id).copied())
                .collect(),
            primitive: self.primitive_id().map(str::to_string),
        }
    }

    // =========================================================================
    // IMPORT
    // =========================================================================

    /// Build a fresh subtree from a template.
    ///
    /// Contacts are created first, then every subgroup, then wires; a wire
    /// whose endpoints cannot be resolved is skipped and reported, never
    /// aborting the import. Primitive groups are re-bound to their
    /// computation through `registry`.
    pub fn from_template(
        template: &GroupTemplate,
        registry: &dyn PrimitiveRegistry,
    ) -> Result<TemplateImport, CoreError> {
        template.validate()?;
        let mut skipped = Vec::new();
        let group = Self::build_from(template, registry, &mut skipped);
        Ok(TemplateImport { group, skipped })
    }

    fn build_from(
        template: &GroupTemplate,
        registry: &dyn PrimitiveRegistry,
        skipped: &mut Vec<SkippedWire>,
    ) -> ContactGroup {
        let mut group = ContactGroup::new(template.name.clone());

        let boundary_flags: Vec<bool> = template
            .contacts
            .iter()
            .enumerate()
            .map(|(i, spec)| spec.is_boundary || template.boundary_indices.contains(&(i as u32)))
            .collect();
        let contacts: Vec<ContactId> = template
            .contacts
            .iter()
            .zip(&boundary_flags)
            .map(|(spec, is_boundary)| {
                if *is_boundary {
                    group.add_boundary_contact(
                        spec.position,
                        spec.boundary_direction.unwrap_or(BoundaryDirection::Input),
                        spec.name.clone(),
                        Some(spec.blend_mode),
                    )
                } else {
                    group.add_contact(spec.position, Some(spec.blend_mode))
                }
            })
            .collect();

        let subgroups: Vec<_> = template
            .subgroups
            .iter()
            .map(|sub| {
                let child = Self::build_from(sub, registry, skipped);
                group.add_subgroup(child)
            })
            .collect();

        for spec in &template.wires {
            let resolved = resolve(&group, &contacts, &subgroups, &spec.from).and_then(|from| {
                resolve(&group, &contacts, &subgroups, &spec.to).map(|to| (from, to))
            });
            let outcome = resolved.and_then(|(from, to)| {
                group
                    .connect(from, to, spec.wire_type)
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            });
            if let Err(reason) = outcome {
                tracing::warn!(group = %template.name, reason = %reason, "template wire skipped");
                skipped.push(SkippedWire {
                    group: template.name.clone(),
                    wire: spec.clone(),
                    reason,
                });
            }
        }

        if let Some(primitive) = &template.primitive {
            let compute = registry.compute(primitive);
            if compute.is_none() {
                tracing::warn!(primitive = %primitive, "primitive not registered, group will not compute");
            }
            group.mark_primitive(primitive.clone(), compute);
        }
        group
    }
}

fn resolve(
    group: &ContactGroup,
    contacts: &[ContactId],
    subgroups: &[crate::types::GroupId],
    endpoint: &WireEndpoint,
) -> Result<ContactId, String> {
    match endpoint {
        WireEndpoint::Local { index } => contacts
            .get(*index as usize)
            .copied()
            .ok_or_else(|| format!("no contact at index {}", index)),
        WireEndpoint::Subgroup { subgroup, name } => {
            let sub = subgroup_at(group, subgroups, *subgroup)?;
            sub.boundary_by_name(name)
                .map(|c| c.id)
                .ok_or_else(|| format!("subgroup '{}' has no boundary contact '{}'", sub.name(), name))
        }
        WireEndpoint::Port { subgroup, index } => {
            let sub = subgroup_at(group, subgroups, *subgroup)?;
            sub.contacts()
                .nth(*index as usize)
                .filter(|c| c.is_boundary)
                .map(|c| c.id)
                .ok_or_else(|| {
                    format!("subgroup '{}' has no boundary contact at index {}", sub.name(), index)
                })
        }
    }
}

fn subgroup_at<'a>(
    group: &'a ContactGroup,
    subgroups: &[crate::types::GroupId],
    index: u32,
) -> Result<&'a ContactGroup, String> {
    subgroups
        .get(index as usize)
        .and_then(|id| group.subgroup(*id))
        .ok_or_else(|| format!("no subgroup at index {}", index))
}

// =============================================================================
// BINARY FORMAT
// =============================================================================

/// Header of the framed binary template format.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateHeader {
    pub magic: [u8; 4],
    pub version: u8,
    /// Contacts over every nesting level.
    pub contact_count: u64,
    /// FNV-1a of the payload.
    pub checksum: u64,
    /// BLAKE3 of the payload, written with the `crypto-hash` feature.
    pub digest: Option<[u8; 32]>,
}

impl TemplateHeader {
    fn validate(&self) -> Result<(), CoreError> {
        if self.magic != TEMPLATE_MAGIC {
            return Err(CoreError::SerializationError(
                "Invalid file format".to_string(),
            ));
        }
        if self.version != TEMPLATE_VERSION {
            return Err(CoreError::SerializationError(
                "Unsupported file version".to_string(),
            ));
        }
        if self.contact_count > MAX_TEMPLATE_CONTACTS as u64 {
            return Err(CoreError::SerializationError(format!(
                "Contact count {} exceeds maximum allowed {}",
                self.contact_count, MAX_TEMPLATE_CONTACTS
            )));
        }
        Ok(())
    }
}

/// One group of a [`FlatTemplate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FlatNode {
    /// Index of the parent node; `None` only for the first node.
    parent: Option<u32>,
    name: String,
    contacts: Vec<ContactSpec>,
    wires: Vec<WireSpec>,
    boundary_indices: Vec<u32>,
    primitive: Option<String>,
}

/// Binary payload: the template tree in pre-order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct FlatTemplate {
    nodes: Vec<FlatNode>,
}

impl FlatTemplate {
    fn from_tree(template: &GroupTemplate) -> Self {
        let mut nodes = Vec::new();
        let mut stack = vec![(template, None)];
        while let Some((group, parent)) = stack.pop() {
            let index = nodes.len() as u32;
            nodes.push(FlatNode {
                parent,
                name: group.name.clone(),
                contacts: group.contacts.clone(),
                wires: group.wires.clone(),
                boundary_indices: group.boundary_indices.clone(),
                primitive: group.primitive.clone(),
            });
            stack.extend(group.subgroups.iter().rev().map(|sub| (sub, Some(index))));
        }
        Self { nodes }
    }

    /// Rebuild the tree, rejecting malformed parent links and trees deeper
    /// than [`MAX_TEMPLATE_DEPTH`] before anything is assembled.
    fn into_tree(self) -> Result<GroupTemplate, CoreError> {
        let count = self.nodes.len();
        let mut parents = Vec::with_capacity(count);
        let mut depths: Vec<usize> = Vec::with_capacity(count);
        for (index, node) in self.nodes.iter().enumerate() {
            let depth = match (index, node.parent) {
                (0, None) => 1,
                (_, Some(parent)) if (parent as usize) < index => {
                    depths.get(parent as usize).copied().unwrap_or(0) + 1
                }
                _ => {
                    return Err(CoreError::InvalidTemplate(format!(
                        "group {} has an invalid parent link",
                        index
                    )));
                }
            };
            if depth > MAX_TEMPLATE_DEPTH {
                return Err(CoreError::InvalidTemplate(format!(
                    "nesting depth {} exceeds maximum {}",
                    depth, MAX_TEMPLATE_DEPTH
                )));
            }
            depths.push(depth);
            parents.push(node.parent.map(|p| p as usize));
        }

        // Children always follow their parent, so walking backwards
        // finishes every subtree before its parent needs it.
        let mut children: Vec<Vec<GroupTemplate>> = vec![Vec::new(); count];
        let mut root = None;
        for (index, node) in self.nodes.into_iter().enumerate().rev() {
            let mut subgroups = std::mem::take(&mut children[index]);
            subgroups.reverse();
            let group = GroupTemplate {
                name: node.name,
                contacts: node.contacts,
                wires: node.wires,
                subgroups,
                boundary_indices: node.boundary_indices,
                primitive: node.primitive,
            };
            match parents[index] {
                Some(parent) => children[parent].push(group),
                None => root = Some(group),
            }
        }
        root.ok_or_else(|| CoreError::InvalidTemplate("template has no groups".to_string()))
    }
}

/// FNV-1a over the payload. Detects corruption, not tampering.
fn fnv1a(bytes: &[u8]) -> u64 {
    bytes.iter().fold(0xcbf2_9ce4_8422_2325, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(0x0100_0000_01b3)
    })
}

#[cfg(feature = "crypto-hash")]
fn digest(bytes: &[u8]) -> Option<[u8; 32]> {
    Some(*blake3::hash(bytes).as_bytes())
}

#[cfg(not(feature = "crypto-hash"))]
fn digest(_bytes: &[u8]) -> Option<[u8; 32]> {
    None
}

/// Encode a template in the framed binary format.
pub fn encode_template(template: &GroupTemplate) -> Result<Vec<u8>, CoreError> {
    let payload = postcard::to_allocvec(&FlatTemplate::from_tree(template))
        .map_err(|e| CoreError::SerializationError(format!("Data: {}", e)))?;
    frame(&payload, template.contact_count() as u64)
}

fn frame(payload: &[u8], contact_count: u64) -> Result<Vec<u8>, CoreError> {
    let header = TemplateHeader {
        magic: TEMPLATE_MAGIC,
        version: TEMPLATE_VERSION,
        contact_count,
        checksum: fnv1a(payload),
        digest: digest(payload),
    };
    let header_bytes = postcard::to_allocvec(&header)
        .map_err(|e| CoreError::SerializationError(format!("Header: {}", e)))?;

    let mut out = Vec::with_capacity(4 + header_bytes.len() + payload.len());
    out.extend_from_slice(&(header_bytes.len() as u32).to_le_bytes());
    out.extend_from_slice(&header_bytes);
    out.extend_from_slice(payload);
    Ok(out)
}

/// Decode a template from the framed binary format, verifying header,
/// limits and checksums before returning.
pub fn decode_template(data: &[u8]) -> Result<GroupTemplate, CoreError> {
    if data.len() > MAX_TEMPLATE_BYTES {
        return Err(CoreError::SerializationError(format!(
            "Template of {} bytes exceeds maximum allowed {}",
            data.len(),
            MAX_TEMPLATE_BYTES
        )));
    }
    let (len_bytes, rest) = data
        .split_first_chunk::<4>()
        .ok_or_else(|| CoreError::SerializationError("Data too short".to_string()))?;
    let header_len = u32::from_le_bytes(*len_bytes) as usize;
    if rest.len() < header_len {
        return Err(CoreError::SerializationError(
            "Data too short for header".to_string(),
        ));
    }
    let (header_bytes, payload) = rest.split_at(header_len);

    let header: TemplateHeader = postcard::from_bytes(header_bytes)
        .map_err(|e| CoreError::SerializationError(format!("Header: {}", e)))?;
    header.validate()?;

    if fnv1a(payload) != header.checksum {
        return Err(CoreError::SerializationError(
            "Checksum mismatch".to_string(),
        ));
    }
    if let (Some(expected), Some(actual)) = (header.digest, digest(payload)) {
        if expected != actual {
            return Err(CoreError::SerializationError(
                "Digest mismatch".to_string(),
            ));
        }
    }

    let flat: FlatTemplate = postcard::from_bytes(payload)
        .map_err(|e| CoreError::SerializationError(format!("Data: {}", e)))?;
    let contacts: usize = flat.nodes.iter().map(|node| node.contacts.len()).sum();
    if contacts as u64 != header.contact_count {
        return Err(CoreError::SerializationError(
            "Contact count does not match header".to_string(),
        ));
    }
    let template = flat.into_tree()?;
    template.validate()?;
    Ok(template)
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gadget::GadgetRegistry;
    use serde_json::json;

    /// root: a, b (max), c interior; an `add` gadget;
    /// wires a->add.a, b<->add.b, add.sum->c.
    fn sample() -> ContactGroup {
        let registry = GadgetRegistry::with_builtins();
        let mut root = ContactGroup::new("sample");
        let a = root.add_contact(Position::new(0.0, 0.0), None);
        let b = root.add_contact(Position::new(10.0, 0.0), Some(BlendMode::Max));
        let c = root.add_contact(Position::new(20.0, 0.0), None);
        let gadget = registry.build("core/add").expect("build");
        let ga = gadget.boundary_by_name("a").map(|c| c.id).expect("a");
        let gb = gadget.boundary_by_name("b").map(|c| c.id).expect("b");
        let sum = gadget.boundary_by_name("sum").map(|c| c.id).expect("sum");
        root.add_subgroup(gadget);
        root.connect(a, ga, WireType::Directed).expect("wire");
        root.connect(b, gb, WireType::Bidirectional).expect("wire");
        root.connect(sum, c, WireType::Directed).expect("wire");
        root
    }

    #[test]
    fn export_references_subgroup_ports_by_name() {
        let template = sample().to_template();

        assert_eq!(template.contacts.len(), 3);
        assert_eq!(template.contacts[1].blend_mode, BlendMode::Max);
        assert_eq!(template.subgroups.len(), 1);
        assert_eq!(template.subgroups[0].primitive.as_deref(), Some("core/add"));
        assert!(template.wires.iter().any(|w| w.to
            == WireEndpoint::Subgroup {
                subgroup: 0,
                name: "a".to_string()
            }));
        assert!(template.wires.iter().any(|w| w.from
            == WireEndpoint::Subgroup {
                subgroup: 0,
                name: "sum".to_string()
            }));
    }

    #[test]
    fn import_rebinds_primitive_computation() {
        let registry = GadgetRegistry::with_builtins();
        let template = sample().to_template();

        let TemplateImport { mut group, skipped } =
            ContactGroup::from_template(&template, &registry).expect("import");
        assert!(skipped.is_empty());

        let ids: Vec<ContactId> = group.contacts().map(|c| c.id).collect();
        group.deliver_content(ids[0], Some(json!(2)), None).expect("a");
        group.deliver_content(ids[1], Some(json!(3)), None).expect("b");

        assert_eq!(
            group.find_contact(ids[2]).and_then(|c| c.content.clone()),
            Some(json!(5))
        );
    }

    #[test]
    fn unresolvable_wire_is_skipped_not_fatal() {
        let registry = GadgetRegistry::with_builtins();
        let mut template = sample().to_template();
        template.wires.push(WireSpec {
            from: WireEndpoint::Local { index: 0 },
            to: WireEndpoint::Subgroup {
                subgroup: 0,
                name: "missing".to_string(),
            },
            wire_type: WireType::Bidirectional,
        });
        template.wires.push(WireSpec {
            from: WireEndpoint::Local { index: 42 },
            to: WireEndpoint::Local { index: 0 },
            wire_type: WireType::Bidirectional,
        });

        let import = ContactGroup::from_template(&template, &registry).expect("import");

        assert_eq!(import.skipped.len(), 2);
        assert_eq!(import.group.wires().count(), 3);
    }

    #[test]
    fn port_named_like_a_position_keeps_its_wire() {
        let registry = GadgetRegistry::new();
        let mut root = ContactGroup::new("root");
        let outer = root.add_contact(Position::default(), None);
        let mut inner = ContactGroup::new("inner");
        inner.add_boundary_contact(Position::default(), BoundaryDirection::Input, None, None);
        let named = inner.add_boundary_contact(
            Position::default(),
            BoundaryDirection::Input,
            Some("#0".into()),
            None,
        );
        root.add_subgroup(inner);
        root.connect(outer, named, WireType::Directed).expect("wire");

        let template = root.to_template();
        let import = ContactGroup::from_template(&template, &registry).expect("import");

        let sub = import.group.subgroups().next().expect("subgroup");
        let target = sub.boundary_by_name("#0").map(|c| c.id).expect("port");
        let wire = import.group.wires().next().expect("wire");
        assert_eq!(wire.to_id, target);
    }

    #[test]
    fn duplicate_port_names_are_exported_by_position() {
        let mut root = ContactGroup::new("root");
        let outer = root.add_contact(Position::default(), None);
        let mut inner = ContactGroup::new("inner");
        inner.add_boundary_contact(Position::default(), BoundaryDirection::Input, Some("in".into()), None);
        let second =
            inner.add_boundary_contact(Position::default(), BoundaryDirection::Input, Some("in".into()), None);
        root.add_subgroup(inner);
        root.connect(outer, second, WireType::Directed).expect("wire");

        let template = root.to_template();
        assert_eq!(
            template.wires[0].to,
            WireEndpoint::Port {
                subgroup: 0,
                index: 1
            }
        );
    }

    #[test]
    fn unnamed_boundary_contacts_use_position() {
        let registry = GadgetRegistry::new();
        let mut root = ContactGroup::new("root");
        let outer = root.add_contact(Position::default(), None);
        let mut inner = ContactGroup::new("inner");
        inner.add_contact(Position::default(), None);
        let port = inner.add_boundary_contact(Position::default(), BoundaryDirection::Output, None, None);
        root.add_subgroup(inner);
        root.connect(port, outer, WireType::Directed).expect("wire");

        let template = root.to_template();
        assert_eq!(
            template.wires[0].from,
            WireEndpoint::Port {
                subgroup: 0,
                index: 1
            }
        );

        let import = ContactGroup::from_template(&template, &registry).expect("import");
        assert!(import.skipped.is_empty());
        assert_eq!(import.group.wires().count(), 1);
    }

    #[test]
    fn binary_round_trip() {
        let template = sample().to_template();
        let bytes = encode_template(&template).expect("encode");
        assert_eq!(decode_template(&bytes).expect("decode"), template);
    }

    #[test]
    fn binary_rejects_bad_magic() {
        let template = sample().to_template();
        let mut bytes = encode_template(&template).expect("encode");
        bytes[4] ^= 0xFF;
        assert!(decode_template(&bytes).is_err());
    }

    #[test]
    fn binary_rejects_corrupted_payload() {
        let template = sample().to_template();
        let mut bytes = encode_template(&template).expect("encode");
        let last = bytes.len() - 1;
        bytes[last] ^= 0x01;
        assert!(matches!(
            decode_template(&bytes),
            Err(CoreError::SerializationError(_))
        ));
    }

    #[test]
    fn binary_keeps_sibling_order() {
        let mut template = template_stub();
        template.name = "root".into();
        for name in ["first", "second", "third"] {
            let mut child = template_stub();
            child.name = name.into();
            child.subgroups.push(GroupTemplate {
                name: format!("{}-leaf", name),
                ..template_stub()
            });
            template.subgroups.push(child);
        }
        let bytes = encode_template(&template).expect("encode");
        assert_eq!(decode_template(&bytes).expect("decode"), template);
    }

    #[test]
    fn binary_rejects_over_deep_payload_without_recursing() {
        let levels = 200_000;
        let nodes = (0..levels)
            .map(|i| FlatNode {
                parent: (i > 0).then(|| i - 1),
                name: String::new(),
                contacts: Vec::new(),
                wires: Vec::new(),
                boundary_indices: Vec::new(),
                primitive: None,
            })
            .collect();
        let payload = postcard::to_allocvec(&FlatTemplate { nodes }).expect("payload");
        let bytes = frame(&payload, 0).expect("frame");

        assert!(matches!(
            decode_template(&bytes),
            Err(CoreError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn binary_rejects_forward_parent_links() {
        let node = |parent| FlatNode {
            parent,
            name: String::new(),
            contacts: Vec::new(),
            wires: Vec::new(),
            boundary_indices: Vec::new(),
            primitive: None,
        };
        let payload = postcard::to_allocvec(&FlatTemplate {
            nodes: vec![node(None), node(Some(1))],
        })
        .expect("payload");
        let bytes = frame(&payload, 0).expect("frame");

        assert!(matches!(
            decode_template(&bytes),
            Err(CoreError::InvalidTemplate(_))
        ));
    }

    #[test]
    fn binary_rejects_truncated_input() {
        assert!(decode_template(&[1, 0]).is_err());
        assert!(decode_template(&[200, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn too_deep_template_is_rejected() {
        let mut template = GroupTemplate {
            name: "leaf".into(),
            contacts: Vec::new(),
            wires: Vec::new(),
            subgroups: Vec::new(),
            boundary_indices: Vec::new(),
            primitive: None,
        };
        for _ in 0..MAX_TEMPLATE_DEPTH {
            template = GroupTemplate {
                name: "level".into(),
                subgroups: vec![template],
                ..template_stub()
            };
        }
        let registry = GadgetRegistry::new();
        assert!(matches!(
            ContactGroup::from_template(&template, &registry),
            Err(CoreError::InvalidTemplate(_))
        ));
    }

    fn template_stub() -> GroupTemplate {
        GroupTemplate {
            name: String::new(),
            contacts: Vec::new(),
            wires: Vec::new(),
            subgroups: Vec::new(),
            boundary_indices: Vec::new(),
            primitive: None,
        }
    }
}
