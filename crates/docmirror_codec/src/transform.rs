//! Whole-record conversion.
//!
//! A stored record is a class pickle followed by a state pickle.
//! [`RecordTransform`] decodes both, extracts the class name, applies the
//! skip predicate and the optional state hook, and produces the three
//! values a document row needs.

use crate::decoder::GraphDecoder;
use crate::error::{CodecError, CodecResult};
use crate::graph::{Node, NodeArena, NodeId};
use crate::projector::{scrub_json, JsonOptions, JsonProjector};
use crate::reducers::ReducerRegistry;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, error};

/// Number of raw bytes included in conversion failure logs.
const LOG_PREFIX_LEN: usize = 50;

/// Decides whether records of a class are left out.
pub type SkipPredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Rewrites a record's state JSON.
///
/// Called with the class name and the state JSON. `None` keeps the state,
/// an empty string skips the record, anything else replaces the state.
pub type StateHook = Arc<dyn Fn(&str, &str) -> Option<String> + Send + Sync>;

/// A converted record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedRecord {
    /// Dotted class name.
    pub class_name: String,
    /// The raw bytes of the class pickle, through its STOP opcode.
    pub header_bytes: Vec<u8>,
    /// The state as JSON text.
    pub state_json: String,
}

/// Why a record produced no document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    /// The raw data was empty (a deleted object).
    Empty,
    /// The skip predicate matched the class.
    Filtered {
        /// Dotted class name.
        class_name: String,
    },
    /// The state hook returned an empty string.
    Declined {
        /// Dotted class name.
        class_name: String,
    },
    /// Decoding or projection failed.
    Failed(CodecError),
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => write!(f, "empty record"),
            Self::Filtered { class_name } => write!(f, "class {class_name} is skipped"),
            Self::Declined { class_name } => write!(f, "hook declined {class_name}"),
            Self::Failed(err) => write!(f, "conversion failed: {err}"),
        }
    }
}

/// Outcome of converting one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transformed {
    /// A document to store.
    Record(DecodedRecord),
    /// No document for this record.
    Skip(SkipReason),
}

impl Transformed {
    /// Returns true for [`Transformed::Skip`].
    pub fn is_skip(&self) -> bool {
        matches!(self, Self::Skip(_))
    }

    /// The decoded record, if there is one.
    pub fn into_record(self) -> Option<DecodedRecord> {
        match self {
            Self::Record(record) => Some(record),
            Self::Skip(_) => None,
        }
    }
}

/// The default skip predicate: B-tree internals and blobs.
pub fn default_skip(class_name: &str) -> bool {
    class_name.starts_with("BTrees.") || class_name.starts_with("ZODB.blob")
}

/// Converts raw records to [`DecodedRecord`]s.
#[derive(Clone)]
pub struct RecordTransform {
    registry: ReducerRegistry,
    options: JsonOptions,
    skip: SkipPredicate,
    hook: Option<StateHook>,
}

impl RecordTransform {
    /// Create a transform with the built-in reducers, compact output and
    /// the default skip predicate.
    pub fn new() -> Self {
        Self {
            registry: ReducerRegistry::new(),
            options: JsonOptions::compact(),
            skip: Arc::new(default_skip),
            hook: None,
        }
    }

    /// Use a different reducer registry.
    pub fn with_registry(mut self, registry: ReducerRegistry) -> Self {
        self.registry = registry;
        self
    }

    /// Use different output options.
    pub fn with_options(mut self, options: JsonOptions) -> Self {
        self.options = options;
        self
    }

    /// Replace the skip predicate.
    pub fn with_skip<F>(mut self, skip: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.skip = Arc::new(skip);
        self
    }

    /// Install a state hook.
    pub fn with_hook<F>(mut self, hook: F) -> Self
    where
        F: Fn(&str, &str) -> Option<String> + Send + Sync + 'static,
    {
        self.hook = Some(Arc::new(hook));
        self
    }

    /// The reducer registry in use.
    pub fn registry(&self) -> &ReducerRegistry {
        &self.registry
    }

    /// Convert one record. Never fails: problems are logged and turn into
    /// [`Transformed::Skip`].
    pub fn transform(&self, object_id: u64, raw: &[u8]) -> Transformed {
        if raw.is_empty() {
            return Transformed::Skip(SkipReason::Empty);
        }
        match self.try_transform(raw) {
            Ok(transformed) => {
                if let Transformed::Skip(reason) = &transformed {
                    debug!(object_id, %reason, "record skipped");
                }
                transformed
            }
            Err(err) => {
                error!(
                    object_id,
                    error = %err,
                    prefix = ?&raw[..raw.len().min(LOG_PREFIX_LEN)],
                    "failed to convert record"
                );
                Transformed::Skip(SkipReason::Failed(err))
            }
        }
    }

    /// Convert one record, returning errors instead of logging them.
    ///
    /// # Errors
    ///
    /// Fails when either pickle cannot be decoded, the class name cannot be
    /// determined, or the state cannot be projected.
    pub fn try_transform(&self, raw: &[u8]) -> CodecResult<Transformed> {
        if raw.is_empty() {
            return Ok(Transformed::Skip(SkipReason::Empty));
        }
        let mut decoder = GraphDecoder::new(raw, &self.registry);
        let class_root = decoder.decode_next()?;
        let header_len = decoder.position();
        let class_name = class_name_of(decoder.arena(), class_root)?;
        if (self.skip)(&class_name) {
            return Ok(Transformed::Skip(SkipReason::Filtered { class_name }));
        }

        let state_root = decoder.decode_next()?;
        let arena = decoder.arena();
        let mut state_json = JsonProjector::new(arena, state_root).to_json(state_root, self.options)?;

        if let Some(hook) = &self.hook {
            match hook(&class_name, &state_json) {
                None => {}
                Some(replacement) if replacement.is_empty() => {
                    return Ok(Transformed::Skip(SkipReason::Declined { class_name }));
                }
                Some(replacement) => state_json = replacement,
            }
        }

        Ok(Transformed::Record(DecodedRecord {
            class_name,
            header_bytes: raw[..header_len].to_vec(),
            state_json: scrub_json(&state_json),
        }))
    }
}

impl Default for RecordTransform {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for RecordTransform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordTransform")
            .field("registry", &self.registry)
            .field("options", &self.options)
            .field("hook", &self.hook.is_some())
            .finish_non_exhaustive()
    }
}

/// Extracts the class name from a decoded class pickle.
///
/// The class pickle is either a class reference, or a pair whose first
/// element is a class reference or a `(module, name)` sequence of strings.
pub fn class_name_of(arena: &NodeArena, root: NodeId) -> CodecResult<String> {
    let class = match arena.resolved(root) {
        Node::GlobalRef { name } => return Ok(name.clone()),
        Node::Sequence { items, .. } => match items.as_slice() {
            [class, _args] => *class,
            _ => {
                return Err(CodecError::class_name(format!(
                    "expected a (class, args) pair, got {} items",
                    items.len()
                )))
            }
        },
        _ => return Err(CodecError::class_name("class pickle is not a class or pair")),
    };
    match arena.resolved(class) {
        Node::GlobalRef { name } => Ok(name.clone()),
        Node::Sequence { items, .. } => items
            .iter()
            .map(|item| {
                arena
                    .as_str(*item)
                    .ok_or_else(|| CodecError::class_name("class name parts must be strings"))
            })
            .collect::<CodecResult<Vec<_>>>()
            .map(|parts| parts.join(".")),
        _ => Err(CodecError::class_name("first element is not a class")),
    }
}
