//! Function catalogue: descriptor metadata plus the callable behind each name.
//!
//! A [`Catalogue`] is built once at start-up and treated as a read-only
//! snapshot afterwards. The descriptor `name` is the only key into the callable
//! table; registration rejects duplicates and non-identifier names so the name
//! can be spliced into generated source verbatim.

pub mod builtin;
pub mod manifest;

pub use manifest::{load_catalogue, parse_manifest, ManifestResult};

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;

/// Bound arguments for one invocation, keyed by parameter name.
pub type Arguments = Map<String, Value>;

/// Metadata describing one automation function.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FunctionDescriptor {
    /// Unique identifier, also the key into the callable table.
    pub name: String,
    pub description: String,
    /// Keyword tags, order-preserving and deduplicated.
    #[serde(default)]
    pub keywords: Vec<String>,
    pub category: String,
    /// Declared parameter names, in declaration order.
    #[serde(default)]
    pub parameters: Vec<String>,
}

impl FunctionDescriptor {
    pub fn new(
        name: impl Into<String>,
        description: impl Into<String>,
        keywords: &[&str],
        category: impl Into<String>,
        parameters: &[&str],
    ) -> Self {
        Self {
            name: name.into(),
            description: description.into(),
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
            category: category.into(),
            parameters: parameters.iter().map(|p| p.to_string()).collect(),
        }
    }

    /// Text fed to the embedding function: description followed by keywords.
    pub fn embedding_text(&self) -> String {
        if self.keywords.is_empty() {
            return self.description.clone();
        }
        format!("{} {}", self.description, self.keywords.join(" "))
    }

    pub fn declares(&self, parameter: &str) -> bool {
        self.parameters.iter().any(|p| p == parameter)
    }
}

/// Fault raised by a callable. Converted into the `error` field of a result.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FunctionFault {
    #[error("missing required parameter `{0}`")]
    MissingParameter(String),

    #[error("parameter `{name}` must be a {expected}")]
    InvalidParameter { name: String, expected: &'static str },

    #[error("{0}")]
    Failed(String),

    #[error("invocation cancelled")]
    Cancelled,
}

/// Cancellation signal handed to every invocation.
///
/// Cancellation is advisory: the executor raises the flag on timeout, and
/// callables that run for a while are expected to poll it.
#[derive(Debug, Clone, Default)]
pub struct InvocationContext {
    cancelled: Arc<AtomicBool>,
}

impl InvocationContext {
    /// A fresh context, not linked to any executor.
    pub fn detached() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }
}

/// Capability interface implemented by every catalogue function.
pub trait AutomationFunction: Send + Sync {
    fn invoke(&self, args: &Arguments, ctx: &InvocationContext) -> Result<Value, FunctionFault>;
}

impl<F> AutomationFunction for F
where
    F: Fn(&Arguments, &InvocationContext) -> Result<Value, FunctionFault> + Send + Sync,
{
    fn invoke(&self, args: &Arguments, ctx: &InvocationContext) -> Result<Value, FunctionFault> {
        self(args, ctx)
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum CatalogueError {
    #[error("function `{0}` is already registered")]
    Duplicate(String),

    #[error("`{0}` is not a valid identifier")]
    InvalidName(String),

    #[error("parameter `{parameter}` of `{function}` is not a valid identifier")]
    InvalidParameter { function: String, parameter: String },
}

impl From<CatalogueError> for crate::error::AppError {
    fn from(err: CatalogueError) -> Self {
        crate::error::AppError::CatalogueError(err.to_string())
    }
}

#[derive(Clone)]
struct CatalogueEntry {
    descriptor: FunctionDescriptor,
    function: Arc<dyn AutomationFunction>,
}

/// Registry of descriptors and their callables, in insertion order.
#[derive(Default, Clone)]
pub struct Catalogue {
    entries: Vec<CatalogueEntry>,
    by_name: HashMap<String, usize>,
}

impl Catalogue {
    pub fn new() -> Self {
        Self::default()
    }

    /// The built-in automation functions.
    pub fn builtin() -> Self {
        builtin::catalogue()
    }

    pub fn register(
        &mut self,
        descriptor: FunctionDescriptor,
        function: Arc<dyn AutomationFunction>,
    ) -> Result<(), CatalogueError> {
        if !is_identifier(&descriptor.name) {
            return Err(CatalogueError::InvalidName(descriptor.name));
        }
        if let Some(parameter) = descriptor.parameters.iter().find(|p| !is_identifier(p)) {
            return Err(CatalogueError::InvalidParameter {
                function: descriptor.name.clone(),
                parameter: parameter.clone(),
            });
        }
        if self.by_name.contains_key(&descriptor.name) {
            return Err(CatalogueError::Duplicate(descriptor.name));
        }

        self.by_name
            .insert(descriptor.name.clone(), self.entries.len());
        self.entries.push(CatalogueEntry {
            descriptor,
            function,
        });
        Ok(())
    }

    /// Register a plain function or closure.
    pub fn register_fn<F>(
        &mut self,
        descriptor: FunctionDescriptor,
        function: F,
    ) -> Result<(), CatalogueError>
    where
        F: Fn(&Arguments, &InvocationContext) -> Result<Value, FunctionFault>
            + Send
            + Sync
            + 'static,
    {
        self.register(descriptor, Arc::new(function))
    }

    /// Build a new catalogue with `descriptors`, binding each to the callable
    /// registered under the same name here. Descriptors without a callable are
    /// skipped.
    pub fn rebind(&self, descriptors: Vec<FunctionDescriptor>) -> Result<Self, CatalogueError> {
        let mut catalogue = Self::new();
        for descriptor in descriptors {
            match self.function(&descriptor.name) {
                Some(function) => catalogue.register(descriptor, function)?,
                None => {
                    tracing::warn!(
                        function = %descriptor.name,
                        "No callable registered for descriptor, skipping"
                    );
                }
            }
        }
        Ok(catalogue)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn descriptors(&self) -> impl Iterator<Item = &FunctionDescriptor> {
        self.entries.iter().map(|e| &e.descriptor)
    }

    pub fn descriptor(&self, name: &str) -> Option<&FunctionDescriptor> {
        self.position(name).map(|idx| &self.entries[idx].descriptor)
    }

    /// Insertion position of `name`, used as the deterministic tie-breaker.
    pub fn position(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn function(&self, name: &str) -> Option<Arc<dyn AutomationFunction>> {
        self.position(name)
            .map(|idx| Arc::clone(&self.entries[idx].function))
    }

    /// SHA-256 over the serialized descriptors, in catalogue order.
    pub fn fingerprint(&self) -> [u8; 32] {
        let mut hasher = Sha256::new();

        for descriptor in self.descriptors() {
            // Serializing a plain struct of strings cannot fail.
            let bytes = serde_json::to_vec(descriptor).unwrap_or_default();
            hasher.update(&bytes);
            hasher.update(b"\n");
        }

        hasher.finalize().into()
    }
}

impl std::fmt::Debug for Catalogue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Catalogue")
            .field(
                "functions",
                &self.descriptors().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

/// Lower-case hex rendering of a fingerprint.
pub fn fingerprint_hex(fingerprint: &[u8; 32]) -> String {
    fingerprint.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn is_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}
