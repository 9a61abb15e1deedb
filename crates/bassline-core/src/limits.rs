//! # Kernel Limits
//!
//! Hard bounds the kernel enforces. Every value here is a ceiling on work
//! or memory that a single request (or a single imported file) may cause.

// =============================================================================
// PROPAGATION
// =============================================================================

/// Maximum deliveries processed by one propagation wave.
///
/// Accept-last contacts wired in a cycle with disagreeing primitives can
/// oscillate forever; the wave is aborted with
/// [`CoreError::PropagationLimit`](crate::CoreError::PropagationLimit)
/// once this many deliveries have been processed.
pub const MAX_PROPAGATION_STEPS: usize = 100_000;

/// Contradictions retained by the runtime for inspection.
pub const MAX_CONTRADICTION_LOG: usize = 256;

// =============================================================================
// TEMPLATES
// =============================================================================

/// Magic bytes of the framed binary template format.
pub const TEMPLATE_MAGIC: [u8; 4] = *b"BLTP";

/// Current binary template format version.
pub const TEMPLATE_VERSION: u8 = 1;

/// Maximum size of an encoded binary template accepted on import.
pub const MAX_TEMPLATE_BYTES: usize = 16 * 1024 * 1024;

/// Maximum number of contacts (summed over all nesting levels) in one
/// imported template.
pub const MAX_TEMPLATE_CONTACTS: usize = 250_000;

/// Maximum subgroup nesting depth of an imported template.
pub const MAX_TEMPLATE_DEPTH: usize = 64;

// =============================================================================
// HISTORY & SUBSCRIPTIONS
// =============================================================================

/// Default bound of the undo stack.
pub const DEFAULT_MAX_HISTORY_SIZE: usize = 100;

/// Changes buffered per remote subscription before the oldest are dropped.
pub const MAX_PENDING_CHANGES: usize = 10_000;

/// Default batch scheduler window in milliseconds.
pub const DEFAULT_BATCH_WINDOW_MS: u64 = 16;
