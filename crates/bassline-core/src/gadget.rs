//! # Primitive Gadgets
//!
//! A primitive gadget is a reusable computation exposed as a group: named
//! input boundary contacts, named output boundary contacts, and a compute
//! function run whenever an input changes.
//!
//! Gadgets are addressed by qualified name (`namespace/name`). The kernel
//! registers the built-in `core/*` gadgets at initialization; further
//! gadgets are loaded from TOML manifests that bind names to built-in
//! operations:
//!
//! ```toml
//! [[gadget]]
//! name = "total"
//! op = "add"
//! inputs = ["left", "right"]
//! outputs = ["total"]
//! description = "Adds two prices"
//! ```

use crate::group::{ComputeFn, ContactGroup};
use crate::types::{BoundaryDirection, CoreError, Position};
use serde::{Deserialize, Serialize};
use serde_json::{Number, Value};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

/// Namespace of the gadgets every kernel starts with.
pub const BUILTIN_NAMESPACE: &str = "core";

/// Largest manifest accepted by [`GadgetRegistry::load_module`].
const MAX_MANIFEST_BYTES: u64 = 1024 * 1024;

// =============================================================================
// GADGET
// =============================================================================

/// A registered primitive: qualified name, boundary layout and computation.
#[derive(Clone)]
pub struct PrimitiveGadget {
    qualified_name: String,
    description: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    compute: ComputeFn,
}

impl std::fmt::Debug for PrimitiveGadget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PrimitiveGadget")
            .field("qualified_name", &self.qualified_name)
            .field("inputs", &self.inputs)
            .field("outputs", &self.outputs)
            .finish_non_exhaustive()
    }
}

/// Introspection record of a registered primitive.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrimitiveInfo {
    pub qualified_name: String,
    pub namespace: String,
    pub name: String,
    pub description: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
}

impl PrimitiveGadget {
    pub fn new(
        qualified_name: impl Into<String>,
        description: impl Into<String>,
        inputs: Vec<String>,
        outputs: Vec<String>,
        compute: ComputeFn,
    ) -> Self {
        Self {
            qualified_name: qualified_name.into(),
            description: description.into(),
            inputs,
            outputs,
            compute,
        }
    }

    pub fn qualified_name(&self) -> &str {
        &self.qualified_name
    }

    /// The part after the namespace.
    pub fn short_name(&self) -> &str {
        split_qualified(&self.qualified_name).1
    }

    pub fn info(&self) -> PrimitiveInfo {
        let (namespace, name) = split_qualified(&self.qualified_name);
        PrimitiveInfo {
            qualified_name: self.qualified_name.clone(),
            namespace: namespace.to_string(),
            name: name.to_string(),
            description: self.description.clone(),
            inputs: self.inputs.clone(),
            outputs: self.outputs.clone(),
        }
    }

    /// Instantiate the gadget as a fresh primitive group.
    ///
    /// Inputs are laid out in a column on the left, outputs on the right.
    pub fn build(&self) -> ContactGroup {
        let mut group = ContactGroup::new(self.short_name());
        for (row, name) in self.inputs.iter().enumerate() {
            group.add_boundary_contact(
                Position::new(0.0, row_offset(row)),
                BoundaryDirection::Input,
                Some(name.clone()),
                None,
            );
        }
        for (row, name) in self.outputs.iter().enumerate() {
            group.add_boundary_contact(
                Position::new(160.0, row_offset(row)),
                BoundaryDirection::Output,
                Some(name.clone()),
                None,
            );
        }
        group.mark_primitive(&self.qualified_name, Some(Arc::clone(&self.compute)));
        group
    }
}

fn row_offset(row: usize) -> f64 {
    f64::from((row as u32).saturating_mul(40))
}

fn split_qualified(qualified: &str) -> (&str, &str) {
    qualified.split_once('/').unwrap_or(("", qualified))
}

/// One gadget per built-in operation, under [`BUILTIN_NAMESPACE`] with the
/// default boundary names.
pub fn builtin_gadgets() -> Vec<PrimitiveGadget> {
    Operation::ALL
        .iter()
        .map(|op| op.gadget(BUILTIN_NAMESPACE, op.as_str(), None, None, None))
        .collect()
}

// =============================================================================
// MODULE SOURCES
// =============================================================================

/// Where a gadget module comes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ModuleSource {
    /// A package from the npm registry. Not loadable by this kernel.
    Npm { package: String },
    /// A TOML gadget manifest on the local file system.
    File { path: PathBuf },
    /// A manifest behind a URL. Not loadable by this kernel.
    Url { url: String },
}

#[derive(Debug, Deserialize)]
struct Manifest {
    #[serde(default, rename = "gadget")]
    gadgets: Vec<ManifestGadget>,
}

#[derive(Debug, Deserialize)]
struct ManifestGadget {
    name: String,
    op: Operation,
    #[serde(default)]
    inputs: Option<Vec<String>>,
    #[serde(default)]
    outputs: Option<Vec<String>>,
    #[serde(default)]
    description: Option<String>,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// The narrow interface the kernel uses to reach primitives.
pub trait PrimitiveRegistry: Send {
    /// Register a gadget; qualified names are unique.
    fn register(&mut self, gadget: PrimitiveGadget) -> Result<(), CoreError>;

    /// Instantiate a registered gadget as a new primitive group.
    fn build(&self, qualified_name: &str) -> Result<ContactGroup, CoreError>;

    /// Compute function of a registered gadget, for re-binding restored groups.
    fn compute(&self, qualified_name: &str) -> Option<ComputeFn>;

    /// Qualified names in sorted order.
    fn names(&self) -> Vec<String>;

    fn info(&self, qualified_name: &str) -> Option<PrimitiveInfo>;

    /// Load every gadget of a module under `namespace`; returns the
    /// registered qualified names.
    fn load_module(
        &mut self,
        source: &ModuleSource,
        namespace: &str,
    ) -> Result<Vec<String>, CoreError>;
}

/// In-process registry backed by a sorted map.
#[derive(Debug, Default, Clone)]
pub struct GadgetRegistry {
    gadgets: BTreeMap<String, PrimitiveGadget>,
}

impl GadgetRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding the built-in `core/*` gadgets.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_builtins();
        registry
    }

    /// Register every built-in operation under [`BUILTIN_NAMESPACE`].
    /// Already-registered names are left alone.
    pub fn register_builtins(&mut self) {
        for gadget in builtin_gadgets() {
            self.gadgets
                .entry(gadget.qualified_name.clone())
                .or_insert(gadget);
        }
    }

    pub fn len(&self) -> usize {
        self.gadgets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gadgets.is_empty()
    }

    fn load_manifest(&mut self, text: &str, namespace: &str) -> Result<Vec<String>, CoreError> {
        let manifest: Manifest =
            toml::from_str(text).map_err(|e| CoreError::InvalidModule(e.to_string()))?;
        if manifest.gadgets.is_empty() {
            return Err(CoreError::InvalidModule(
                "manifest declares no gadgets".to_string(),
            ));
        }

        // Validate everything before registering anything.
        let mut staged = Vec::with_capacity(manifest.gadgets.len());
        for entry in manifest.gadgets {
            if entry.name.is_empty() || entry.name.contains('/') {
                return Err(CoreError::InvalidModule(format!(
                    "invalid gadget name '{}'",
                    entry.name
                )));
            }
            let inputs = entry.inputs.unwrap_or_else(|| entry.op.default_inputs());
            let outputs = entry.outputs.unwrap_or_else(|| entry.op.default_outputs());
            if inputs.len() != entry.op.arity() || outputs.len() != 1 {
                return Err(CoreError::InvalidModule(format!(
                    "'{}' ({}) needs {} input(s) and 1 output",
                    entry.name,
                    entry.op.as_str(),
                    entry.op.arity()
                )));
            }
            let gadget = entry.op.gadget(
                namespace,
                &entry.name,
                Some(inputs),
                Some(outputs),
                entry.description,
            );
            if self.gadgets.contains_key(&gadget.qualified_name)
                || staged
                    .iter()
                    .any(|g: &PrimitiveGadget| g.qualified_name == gadget.qualified_name)
            {
                return Err(CoreError::DuplicatePrimitive(gadget.qualified_name));
            }
            staged.push(gadget);
        }

        let names = staged.iter().map(|g| g.qualified_name.clone()).collect();
        for gadget in staged {
            self.gadgets.insert(gadget.qualified_name.clone(), gadget);
        }
        Ok(names)
    }
}

impl PrimitiveRegistry for GadgetRegistry {
    fn register(&mut self, gadget: PrimitiveGadget) -> Result<(), CoreError> {
        if self.gadgets.contains_key(&gadget.qualified_name) {
            return Err(CoreError::DuplicatePrimitive(gadget.qualified_name));
        }
        self.gadgets.insert(gadget.qualified_name.clone(), gadget);
        Ok(())
    }

    fn build(&self, qualified_name: &str) -> Result<ContactGroup, CoreError> {
        self.gadgets
            .get(qualified_name)
            .map(PrimitiveGadget::build)
            .ok_or_else(|| CoreError::PrimitiveNotFound(qualified_name.to_string()))
    }

    fn compute(&self, qualified_name: &str) -> Option<ComputeFn> {
        self.gadgets
            .get(qualified_name)
            .map(|g| Arc::clone(&g.compute))
    }

    fn names(&self) -> Vec<String> {
        self.gadgets.keys().cloned().collect()
    }

    fn info(&self, qualified_name: &str) -> Option<PrimitiveInfo> {
        self.gadgets.get(qualified_name).map(PrimitiveGadget::info)
    }

    fn load_module(
        &mut self,
        source: &ModuleSource,
        namespace: &str,
    ) -> Result<Vec<String>, CoreError> {
        if namespace.is_empty() || namespace.contains('/') {
            return Err(CoreError::InvalidModule(format!(
                "invalid namespace '{}'",
                namespace
            )));
        }
        let path = match source {
            ModuleSource::File { path } => path,
            ModuleSource::Npm { package } => {
                return Err(CoreError::UnsupportedModuleSource(format!("npm:{}", package)));
            }
            ModuleSource::Url { url } => {
                return Err(CoreError::UnsupportedModuleSource(url.clone()));
            }
        };
        let metadata = std::fs::metadata(path)
            .map_err(|e| CoreError::IoError(format!("{}: {}", path.display(), e)))?;
        if metadata.len() > MAX_MANIFEST_BYTES {
            return Err(CoreError::InvalidModule(format!(
                "manifest is {} bytes, limit is {}",
                metadata.len(),
                MAX_MANIFEST_BYTES
            )));
        }
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoreError::IoError(format!("{}: {}", path.display(), e)))?;
        let names = self.load_manifest(&text, namespace)?;
        tracing::info!(
            namespace = namespace,
            count = names.len(),
            path = %path.display(),
            "gadget module loaded"
        );
        Ok(names)
    }
}

// =============================================================================
// BUILT-IN OPERATIONS
// =============================================================================

/// Computations a gadget can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    Add,
    Subtract,
    Multiply,
    Divide,
    Max,
    Min,
    Concat,
    And,
    Or,
    Not,
    Identity,
}

impl Operation {
    pub const ALL: [Operation; 11] = [
        Self::Add,
        Self::Subtract,
        Self::Multiply,
        Self::Divide,
        Self::Max,
        Self::Min,
        Self::Concat,
        Self::And,
        Self::Or,
        Self::Not,
        Self::Identity,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Add => "add",
            Self::Subtract => "subtract",
            Self::Multiply => "multiply",
            Self::Divide => "divide",
            Self::Max => "max",
            Self::Min => "min",
            Self::Concat => "concat",
            Self::And => "and",
            Self::Or => "or",
            Self::Not => "not",
            Self::Identity => "identity",
        }
    }

    const fn arity(self) -> usize {
        match self {
            Self::Not | Self::Identity => 1,
            _ => 2,
        }
    }

    fn default_inputs(self) -> Vec<String> {
        let names: &[&str] = match self.arity() {
            1 => &["value"],
            _ => &["a", "b"],
        };
        names.iter().map(|s| s.to_string()).collect()
    }

    fn default_outputs(self) -> Vec<String> {
        let name = match self {
            Self::Add => "sum",
            Self::Subtract => "difference",
            Self::Multiply => "product",
            Self::Divide => "quotient",
            _ => "result",
        };
        vec![name.to_string()]
    }

    const fn description(self) -> &'static str {
        match self {
            Self::Add => "Numeric sum of two inputs",
            Self::Subtract => "First input minus second input",
            Self::Multiply => "Numeric product of two inputs",
            Self::Divide => "First input divided by second input; undefined for zero",
            Self::Max => "Larger of two numeric inputs",
            Self::Min => "Smaller of two numeric inputs",
            Self::Concat => "Concatenation of two strings or two arrays",
            Self::And => "Logical and of two booleans",
            Self::Or => "Logical or of two booleans",
            Self::Not => "Logical negation of a boolean",
            Self::Identity => "Passes its input through unchanged",
        }
    }

    fn gadget(
        self,
        namespace: &str,
        name: &str,
        inputs: Option<Vec<String>>,
        outputs: Option<Vec<String>>,
        description: Option<String>,
    ) -> PrimitiveGadget {
        let inputs = inputs.unwrap_or_else(|| self.default_inputs());
        let outputs = outputs.unwrap_or_else(|| self.default_outputs());
        let compute = self.compute_fn(inputs.clone(), outputs.clone());
        PrimitiveGadget::new(
            format!("{}/{}", namespace, name),
            description.unwrap_or_else(|| self.description().to_string()),
            inputs,
            outputs,
            compute,
        )
    }

    fn compute_fn(self, inputs: Vec<String>, outputs: Vec<String>) -> ComputeFn {
        Arc::new(move |values: &BTreeMap<String, Value>| {
            let args: Vec<Option<&Value>> = inputs.iter().map(|n| values.get(n)).collect();
            let result = self.apply(&args);
            outputs
                .iter()
                .map(|name| (name.clone(), result.clone()))
                .collect()
        })
    }

    /// Result of the operation, `None` while an input is missing or has the
    /// wrong shape.
    fn apply(self, args: &[Option<&Value>]) -> Option<Value> {
        match (self, args) {
            (Self::Not, [Some(Value::Bool(v))]) => Some(Value::Bool(!v)),
            (Self::Identity, [Some(v)]) => Some((*v).clone()),
            (Self::And, [Some(Value::Bool(a)), Some(Value::Bool(b))]) => Some(Value::Bool(*a && *b)),
            (Self::Or, [Some(Value::Bool(a)), Some(Value::Bool(b))]) => Some(Value::Bool(*a || *b)),
            (Self::Concat, [Some(Value::String(a)), Some(Value::String(b))]) => {
                Some(Value::String(format!("{}{}", a, b)))
            }
            (Self::Concat, [Some(Value::Array(a)), Some(Value::Array(b))]) => {
                Some(Value::Array(a.iter().chain(b).cloned().collect()))
            }
            (Self::Add, [Some(a), Some(b)]) => arithmetic(a, b, i64::checked_add, add_f64),
            (Self::Subtract, [Some(a), Some(b)]) => arithmetic(a, b, i64::checked_sub, sub_f64),
            (Self::Multiply, [Some(a), Some(b)]) => arithmetic(a, b, i64::checked_mul, mul_f64),
            (Self::Divide, [Some(a), Some(b)]) => arithmetic(a, b, exact_div, div_f64),
            (Self::Max, [Some(a), Some(b)]) => pick(a, b, |x, y| x >= y),
            (Self::Min, [Some(a), Some(b)]) => pick(a, b, |x, y| x <= y),
            _ => None,
        }
    }
}

/// Integer arithmetic when both sides are integers and the result fits,
/// floating point otherwise.
fn arithmetic(
    a: &Value,
    b: &Value,
    int_op: fn(i64, i64) -> Option<i64>,
    float_op: fn(f64, f64) -> f64,
) -> Option<Value> {
    if let (Some(x), Some(y)) = (a.as_i64(), b.as_i64()) {
        if let Some(r) = int_op(x, y) {
            return Some(Value::from(r));
        }
    }
    let r = float_op(a.as_f64()?, b.as_f64()?);
    Number::from_f64(r).map(Value::Number)
}

/// Integer division only when it is exact; `7 / 2` falls back to floats.
fn exact_div(x: i64, y: i64) -> Option<i64> {
    match x.checked_rem(y) {
        Some(0) => x.checked_div(y),
        _ => None,
    }
}

#[allow(clippy::float_arithmetic)]
fn add_f64(x: f64, y: f64) -> f64 {
    x + y
}

#[allow(clippy::float_arithmetic)]
fn sub_f64(x: f64, y: f64) -> f64 {
    x - y
}

#[allow(clippy::float_arithmetic)]
fn mul_f64(x: f64, y: f64) -> f64 {
    x * y
}

/// Division by zero yields a non-finite value, which `Number::from_f64`
/// rejects, so the output becomes undefined.
#[allow(clippy::float_arithmetic)]
fn div_f64(x: f64, y: f64) -> f64 {
    x / y
}

fn pick(a: &Value, b: &Value, keep_first: fn(f64, f64) -> bool) -> Option<Value> {
    let (x, y) = (a.as_f64()?, b.as_f64()?);
    Some(if keep_first(x, y) { a.clone() } else { b.clone() })
}

// =============================================================================
// TESTS
// =============================================================================
