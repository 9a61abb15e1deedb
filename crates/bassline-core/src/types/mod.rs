//! # Core Type Definitions
//!
//! This module contains the data model of the propagation network:
//! - Identifiers (`ContactId`, `WireId`, `GroupId`) minted from one counter
//! - Cells and links (`Contact`, `Wire`, `OwnedWire`)
//! - Merge and layout enums (`BlendMode`, `WireType`, `BoundaryDirection`)
//! - Propagation results (`ContentChange`, `Contradiction`, `Propagation`)
//! - Error types (`CoreError`)
//!
//! Contact content is an opaque JSON value. Only the blend rule of the
//! receiving contact interprets it; JSON `null` and an absent value both mean
//! "undefined" at every protocol boundary.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use thiserror::Error;

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Process-wide id counter shared by contacts, wires and groups, so that one
/// id never names two elements of different kinds.
static NEXT_ID: AtomicU64 = AtomicU64::new(1);

fn mint_id() -> u64 {
    NEXT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Advance the id counter past `id`.
///
/// Called for every element restored from storage or from a history
/// snapshot so that freshly minted ids never collide with restored ones.
pub fn observe_id(id: u64) {
    NEXT_ID.fetch_max(id.saturating_add(1), Ordering::Relaxed);
}

macro_rules! element_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(pub u64);

        impl $name {
            /// Mint a fresh, never-used id.
            #[must_use]
            pub fn fresh() -> Self {
                Self(mint_id())
            }

            /// Get the raw id value.
            #[must_use]
            pub const fn value(self) -> u64 {
                self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "{}"), self.0)
            }
        }
    };
}

element_id!(
    /// Identifier of a [`Contact`].
    ContactId,
    "contact#"
);
element_id!(
    /// Identifier of a [`Wire`].
    WireId,
    "wire#"
);
element_id!(
    /// Identifier of a contact group.
    GroupId,
    "group#"
);

// =============================================================================
// ENUMS
// =============================================================================

/// Merge rule applied when content arrives at a contact.
///
/// See [`crate::blend`] for the exact semantics of each rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BlendMode {
    /// Incoming content replaces the current content.
    #[default]
    AcceptLast,
    /// Numeric content, the larger value wins.
    Max,
    /// Numeric content, the smaller value wins.
    Min,
    /// Arrays unioned in first-seen order.
    SetUnion,
    /// Booleans, logical or.
    BooleanOr,
    /// Objects, shallow merge with incoming keys winning.
    ObjectMerge,
}

impl BlendMode {
    /// Wire name of the mode (`accept-last`, `set-union`, ...).
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AcceptLast => "accept-last",
            Self::Max => "max",
            Self::Min => "min",
            Self::SetUnion => "set-union",
            Self::BooleanOr => "boolean-or",
            Self::ObjectMerge => "object-merge",
        }
    }
}

/// Propagation direction of a wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum WireType {
    /// Content flows both ways.
    #[default]
    Bidirectional,
    /// Content flows only from `from_id` to `to_id`.
    Directed,
}

/// Direction of a boundary contact, seen from inside its group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum BoundaryDirection {
    Input,
    Output,
}

// =============================================================================
// CONTACT & WIRE
// =============================================================================

/// 2D layout position. Carried through templates and storage, never
/// interpreted by the kernel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Position {
    pub x: f64,
    pub y: f64,
}

impl Position {
    #[must_use]
    pub const fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }
}

/// An addressable cell of the network.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contact {
    pub id: ContactId,
    /// The group that owns this contact.
    pub group_id: GroupId,
    #[serde(default)]
    pub position: Position,
    /// Current content; `None` is "undefined".
    #[serde(default)]
    pub content: Option<Value>,
    #[serde(default)]
    pub blend_mode: BlendMode,
    #[serde(default)]
    pub is_boundary: bool,
    #[serde(default)]
    pub boundary_direction: Option<BoundaryDirection>,
    #[serde(default)]
    pub name: Option<String>,
}

impl Contact {
    /// Create an interior contact with no content.
    #[must_use]
    pub fn new(group_id: GroupId, position: Position, blend_mode: BlendMode) -> Self {
        Self {
            id: ContactId::fresh(),
            group_id,
            position,
            content: None,
            blend_mode,
            is_boundary: false,
            boundary_direction: None,
            name: None,
        }
    }

    /// Create a boundary contact with no content.
    #[must_use]
    pub fn boundary(
        group_id: GroupId,
        position: Position,
        direction: BoundaryDirection,
        name: Option<String>,
        blend_mode: BlendMode,
    ) -> Self {
        Self {
            is_boundary: true,
            boundary_direction: Some(direction),
            name,
            ..Self::new(group_id, position, blend_mode)
        }
    }

    /// True for input boundary contacts.
    #[must_use]
    pub fn is_input(&self) -> bool {
        self.is_boundary && self.boundary_direction == Some(BoundaryDirection::Input)
    }

    /// True for output boundary contacts.
    #[must_use]
    pub fn is_output(&self) -> bool {
        self.is_boundary && self.boundary_direction == Some(BoundaryDirection::Output)
    }
}

/// A link between two contacts, owned by exactly one group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Wire {
    pub id: WireId,
    pub from_id: ContactId,
    pub to_id: ContactId,
    #[serde(rename = "type")]
    pub wire_type: WireType,
}

impl Wire {
    #[must_use]
    pub fn new(from_id: ContactId, to_id: ContactId, wire_type: WireType) -> Self {
        Self {
            id: WireId::fresh(),
            from_id,
            to_id,
            wire_type,
        }
    }

    /// True if `contact` is either endpoint.
    #[must_use]
    pub fn touches(&self, contact: ContactId) -> bool {
        self.from_id == contact || self.to_id == contact
    }

    /// The endpoint that receives content when `contact` changes, if the
    /// wire carries content away from `contact`.
    #[must_use]
    pub fn downstream_of(&self, contact: ContactId) -> Option<ContactId> {
        if self.from_id == contact {
            Some(self.to_id)
        } else if self.to_id == contact && self.wire_type == WireType::Bidirectional {
            Some(self.from_id)
        } else {
            None
        }
    }
}

/// A wire together with the id of the group that owns it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OwnedWire {
    pub group_id: GroupId,
    pub wire: Wire,
}

// =============================================================================
// PROPAGATION RESULTS
// =============================================================================

/// One contact whose content changed during a propagation wave.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentChange {
    pub contact_id: ContactId,
    pub group_id: GroupId,
    pub previous: Option<Value>,
    pub current: Option<Value>,
}

/// A conflicting write detected by a blend rule or by batch coalescing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Contradiction {
    pub contact_id: ContactId,
    pub group_id: GroupId,
    pub reason: String,
}

/// Everything a propagation wave did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Propagation {
    /// Content changes in application order. A contact may appear more than
    /// once if it changed repeatedly within the wave.
    pub changes: Vec<ContentChange>,
    pub contradictions: Vec<Contradiction>,
}

impl Propagation {
    /// Append another wave's results.
    pub fn absorb(&mut self, other: Propagation) {
        self.changes.extend(other.changes);
        self.contradictions.extend(other.contradictions);
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty() && self.contradictions.is_empty()
    }
}

// =============================================================================
// ERROR TYPES
// =============================================================================

/// Errors that can occur in kernel operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CoreError {
    #[error("contact not found: {0}")]
    ContactNotFound(ContactId),

    #[error("wire not found: {0}")]
    WireNotFound(WireId),

    #[error("group not found: {0}")]
    GroupNotFound(GroupId),

    #[error("cannot connect {from} -> {to}: {endpoint} is not reachable from {group}")]
    UnresolvedEndpoint {
        from: ContactId,
        to: ContactId,
        endpoint: ContactId,
        group: GroupId,
    },

    #[error("propagation exceeded {limit} steps at {contact}")]
    PropagationLimit { contact: ContactId, limit: usize },

    #[error("primitive not found: {0}")]
    PrimitiveNotFound(String),

    #[error("primitive already registered: {0}")]
    DuplicatePrimitive(String),

    #[error("invalid module: {0}")]
    InvalidModule(String),

    #[error("unsupported module source: {0}")]
    UnsupportedModuleSource(String),

    #[error("unknown scheduler: {0}")]
    UnknownScheduler(String),

    #[error("invalid template: {0}")]
    InvalidTemplate(String),

    #[error("serialization error: {0}")]
    SerializationError(String),

    #[error("storage error: {0}")]
    StorageError(String),

    #[error("I/O error: {0}")]
    IoError(String),
}

// =============================================================================
// TESTS
// =============================================================================
