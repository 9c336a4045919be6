//! Class reducers.
//!
//! When the decoder reaches a constructor step it hands the class name and
//! argument node to a [`ReducerRegistry`]. Well-known classes (timestamps,
//! sets, decimals, the legacy reconstructor) are collapsed into plain JSON
//! shapes by built-in reducers; anything else becomes a generic
//! [`Node::ClassRecord`]. Callers extend the registry by registering
//! reducers under a dotted class name.

use crate::error::{CodecError, CodecResult};
use crate::graph::{Node, NodeArena, NodeId, Scalar, SequenceKind};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// A registered reducer.
///
/// Returning `Ok(None)` declines the class; the decoder then falls back to
/// the built-in reducer, if any, or a generic class record.
pub type Reducer = Arc<dyn Fn(&mut Reduction<'_>) -> CodecResult<Option<NodeId>> + Send + Sync>;

type Builtin = fn(&ReducerRegistry, &mut Reduction<'_>) -> CodecResult<NodeId>;

/// Names of the legacy two-argument reconstruction helper.
const RECONSTRUCTORS: [&str; 2] = ["copy_reg._reconstructor", "copyreg._reconstructor"];

static BUILTINS: &[(&str, Builtin)] = &[
    ("datetime.datetime", reduce_datetime),
    ("datetime.date", reduce_date),
    ("datetime.time", reduce_time),
    ("_codecs.encode", reduce_codecs_encode),
    ("copy_reg._reconstructor", reduce_reconstructor),
    ("copyreg._reconstructor", reduce_reconstructor),
    ("__builtin__.set", reduce_set),
    ("__builtin__.frozenset", reduce_set),
    ("builtins.set", reduce_set),
    ("builtins.frozenset", reduce_set),
    ("decimal.Decimal", reduce_decimal),
];

/// The inputs of one reduction: a class name and its argument node.
pub struct Reduction<'a> {
    arena: &'a mut NodeArena,
    class_name: &'a str,
    args: NodeId,
}

impl<'a> Reduction<'a> {
    /// Creates a reduction over nodes in `arena`.
    pub fn new(arena: &'a mut NodeArena, class_name: &'a str, args: NodeId) -> Self {
        Self {
            arena,
            class_name,
            args,
        }
    }

    /// Dotted name of the class being constructed.
    pub fn class_name(&self) -> &str {
        self.class_name
    }

    /// The argument node (usually a tuple; for reconstructed classes, the
    /// state).
    pub fn args(&self) -> NodeId {
        self.args
    }

    /// The arena, for inspecting arguments and building the result.
    pub fn arena(&mut self) -> &mut NodeArena {
        self.arena
    }

    /// The positional arguments, when the argument node is a sequence.
    pub fn arg_items(&self) -> CodecResult<Vec<NodeId>> {
        self.arena
            .sequence_items(self.args)
            .map(<[NodeId]>::to_vec)
            .ok_or_else(|| CodecError::reduce(self.class_name, "arguments are not a tuple"))
    }

    fn fail(&self, message: impl Into<String>) -> CodecError {
        CodecError::reduce(self.class_name, message)
    }
}

/// Maps dotted class names to reducers, plus the extension-code table used
/// by the EXT opcodes.
#[derive(Clone)]
pub struct ReducerRegistry {
    reducers: HashMap<String, Reducer>,
    extensions: HashMap<i64, (String, String)>,
}

impl ReducerRegistry {
    /// Creates a registry with only the built-in reducers.
    pub fn new() -> Self {
        Self {
            reducers: HashMap::new(),
            extensions: HashMap::new(),
        }
    }

    /// Registers a reducer for a dotted class name, replacing any earlier
    /// registration for the same name.
    pub fn register<F>(&mut self, class_name: impl Into<String>, reducer: F) -> &mut Self
    where
        F: Fn(&mut Reduction<'_>) -> CodecResult<Option<NodeId>> + Send + Sync + 'static,
    {
        self.reducers.insert(class_name.into(), Arc::new(reducer));
        self
    }

    /// Builder form of [`register`](Self::register).
    pub fn with_reducer<F>(mut self, class_name: impl Into<String>, reducer: F) -> Self
    where
        F: Fn(&mut Reduction<'_>) -> CodecResult<Option<NodeId>> + Send + Sync + 'static,
    {
        self.register(class_name, reducer);
        self
    }

    /// Registers an extension code, as `copyreg.add_extension` would.
    pub fn register_extension(
        &mut self,
        code: i64,
        module: impl Into<String>,
        name: impl Into<String>,
    ) -> &mut Self {
        self.extensions.insert(code, (module.into(), name.into()));
        self
    }

    /// Looks up the dotted name registered for an extension code.
    pub fn extension(&self, code: i64) -> Option<String> {
        self.extensions
            .get(&code)
            .map(|(module, name)| format!("{module}.{name}"))
    }

    /// Returns true if a reducer (registered or built-in) exists for a name.
    pub fn handles(&self, class_name: &str) -> bool {
        self.reducers.contains_key(class_name) || builtin(class_name).is_some()
    }

    /// Reduces `class_name(*args)` to a node.
    pub fn instantiate(
        &self,
        arena: &mut NodeArena,
        class_name: &str,
        args: NodeId,
    ) -> CodecResult<NodeId> {
        if !RECONSTRUCTORS.contains(&class_name) {
            if let Some(reducer) = self.reducers.get(class_name) {
                if let Some(node) = reducer(&mut Reduction::new(arena, class_name, args))? {
                    return Ok(node);
                }
            }
        }
        if let Some(reduce) = builtin(class_name) {
            return reduce(self, &mut Reduction::new(arena, class_name, args));
        }
        Ok(arena.push(Node::ClassRecord {
            class_name: class_name.to_string(),
            args: Some(args),
            state: None,
        }))
    }
}

impl Default for ReducerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ReducerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut names: Vec<_> = self.reducers.keys().collect();
        names.sort();
        f.debug_struct("ReducerRegistry")
            .field("reducers", &names)
            .field("extensions", &self.extensions.len())
            .finish()
    }
}

fn builtin(class_name: &str) -> Option<Builtin> {
    BUILTINS
        .iter()
        .find(|(name, _)| *name == class_name)
        .map(|(_, f)| *f)
}

/// Wraps a timestamp string with its tzinfo, as `{"::": kind, "value", "tz"}`.
fn with_tz(r: &mut Reduction<'_>, kind: &str, iso: String, tz: Option<NodeId>) -> NodeId {
    let arena = r.arena();
    let value = arena.string(iso);
    match tz {
        Some(tz) if !matches!(arena.resolved(tz), Node::Scalar(Scalar::None)) => {
            let value_key = arena.string("value");
            let tz_key = arena.string("tz");
            let state = arena.mapping(vec![(value_key, value), (tz_key, tz)]);
            arena.push(Node::ClassRecord {
                class_name: kind.to_string(),
                args: None,
                state: Some(state),
            })
        }
        _ => value,
    }
}

fn payload(r: &Reduction<'_>, node: NodeId, len: usize) -> CodecResult<Vec<u8>> {
    match r.arena.as_bytes(node) {
        Some(bytes) if bytes.len() == len => Ok(bytes),
        Some(bytes) => Err(r.fail(format!("expected {len}-byte payload, got {}", bytes.len()))),
        None => Err(r.fail("payload is not binary")),
    }
}

fn reduce_datetime(_: &ReducerRegistry, r: &mut Reduction<'_>) -> CodecResult<NodeId> {
    let args = r.arg_items()?;
    let first = *args.first().ok_or_else(|| r.fail("missing payload"))?;
    let b = payload(r, first, 10)?;
    let year = u16::from_be_bytes([b[0], b[1]]);
    let micros = u32::from_be_bytes([0, b[7], b[8], b[9]]);
    let mut iso = format!(
        "{year:04}-{:02}-{:02}T{:02}:{:02}:{:02}",
        b[2] & 0x7f,
        b[3],
        b[4],
        b[5],
        b[6]
    );
    if micros != 0 {
        iso.push_str(&format!(".{micros:06}"));
    }
    Ok(with_tz(r, "datetime", iso, args.get(1).copied()))
}

fn reduce_date(_: &ReducerRegistry, r: &mut Reduction<'_>) -> CodecResult<NodeId> {
    let args = r.arg_items()?;
    let first = *args.first().ok_or_else(|| r.fail("missing payload"))?;
    let b = payload(r, first, 4)?;
    let year = u16::from_be_bytes([b[0], b[1]]);
    let iso = format!("{year:04}-{:02}-{:02}", b[2], b[3]);
    Ok(r.arena().string(iso))
}

fn reduce_time(_: &ReducerRegistry, r: &mut Reduction<'_>) -> CodecResult<NodeId> {
    let args = r.arg_items()?;
    let first = *args.first().ok_or_else(|| r.fail("missing payload"))?;
    let b = payload(r, first, 6)?;
    let micros = u32::from_be_bytes([0, b[3], b[4], b[5]]);
    let mut iso = format!("{:02}:{:02}:{:02}", b[0] & 0x7f, b[1], b[2]);
    if micros != 0 {
        iso.push_str(&format!(".{micros:06}"));
    }
    Ok(with_tz(r, "time", iso, args.get(1).copied()))
}

fn reduce_codecs_encode(_: &ReducerRegistry, r: &mut Reduction<'_>) -> CodecResult<NodeId> {
    let args = r.arg_items()?;
    let (Some(&text), Some(&encoding)) = (args.first(), args.get(1)) else {
        return Err(r.fail("expected (text, encoding)"));
    };
    let encoding = r
        .arena
        .as_str(encoding)
        .ok_or_else(|| r.fail("encoding is not a string"))?
        .to_ascii_lowercase();
    if encoding != "latin1" && encoding != "latin-1" {
        return Err(r.fail(format!("unsupported encoding {encoding}")));
    }
    let bytes = r
        .arena
        .as_bytes(text)
        .ok_or_else(|| r.fail("text is not Latin-1"))?;
    Ok(r.arena().push(Node::Bytes(bytes)))
}

fn reduce_reconstructor(registry: &ReducerRegistry, r: &mut Reduction<'_>) -> CodecResult<NodeId> {
    let args = r.arg_items()?;
    let [cls, _base, state] = args[..] else {
        return Err(r.fail("expected (class, base, state)"));
    };
    let class_name = match r.arena.resolved(cls) {
        Node::GlobalRef { name } => name.clone(),
        _ => return Err(r.fail("first argument is not a class")),
    };

    if let Some(reducer) = registry.reducers.get(&class_name) {
        if let Some(node) = reducer(&mut Reduction::new(r.arena, &class_name, state))? {
            return Ok(node);
        }
    }

    let state = match r.arena.resolved(state) {
        Node::Scalar(Scalar::None) => None,
        _ => Some(state),
    };
    Ok(r.arena().push(Node::ClassRecord {
        class_name,
        args: None,
        state,
    }))
}

fn reduce_set(_: &ReducerRegistry, r: &mut Reduction<'_>) -> CodecResult<NodeId> {
    let args = r.arg_items()?;
    let mut items = match args.first() {
        Some(&members) => r
            .arena
            .sequence_items(members)
            .ok_or_else(|| r.fail("members are not a sequence"))?
            .to_vec(),
        None => Vec::new(),
    };
    let arena = r.arena();
    items.sort_by(|a, b| arena.cmp_for_sort(*a, *b));
    Ok(arena.push(Node::Sequence {
        kind: SequenceKind::List,
        items,
    }))
}

fn reduce_decimal(_: &ReducerRegistry, r: &mut Reduction<'_>) -> CodecResult<NodeId> {
    let args = r.arg_items()?;
    let first = *args.first().ok_or_else(|| r.fail("missing value"))?;
    let value = match r.arena.resolved(first) {
        Node::Scalar(Scalar::Str(text)) => text
            .trim()
            .parse::<f64>()
            .map_err(|e| r.fail(format!("bad decimal {text:?}: {e}")))?,
        Node::Scalar(Scalar::Int(i)) => i.to_f64(),
        Node::Scalar(Scalar::Float(f)) => *f,
        _ => return Err(r.fail("value is not a string")),
    };
    Ok(r.arena().scalar(Scalar::Float(value)))
}
