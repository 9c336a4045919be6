//! JSON projection of a decoded node graph.
//!
//! Projection runs in two passes. The first finds which memo handles are
//! genuinely cyclic: a handle is cyclic when its value can reach one of its
//! own back-references. The second renders the graph, inlining shared but
//! acyclic values at every use site and emitting symbolic references only
//! for cyclic ones.

use crate::error::{CodecError, CodecResult};
use crate::graph::{Node, NodeArena, NodeId, Scalar};
use crate::number::Integer;
use serde::Serialize;
use serde_json::ser::PrettyFormatter;
use serde_json::{Map, Number, Value};
use std::collections::HashSet;

/// Nesting depth beyond which projection gives up.
const MAX_DEPTH: usize = 2048;

/// Output formatting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JsonOptions {
    /// Sort object keys recursively.
    pub sort_keys: bool,
    /// Indent width; `None` produces compact output.
    pub indent: Option<usize>,
}

impl JsonOptions {
    /// Compact output in insertion order. Used for stored documents.
    pub fn compact() -> Self {
        Self {
            sort_keys: false,
            indent: None,
        }
    }

    /// Sorted keys, two-space indent. Used for debugging dumps.
    pub fn pretty() -> Self {
        Self {
            sort_keys: true,
            indent: Some(2),
        }
    }

    /// Set key sorting.
    pub fn with_sort_keys(mut self, sort_keys: bool) -> Self {
        self.sort_keys = sort_keys;
        self
    }

    /// Set the indent width.
    pub fn with_indent(mut self, indent: Option<usize>) -> Self {
        self.indent = indent;
        self
    }
}

impl Default for JsonOptions {
    fn default() -> Self {
        Self::compact()
    }
}

/// Renders nodes of one arena as JSON.
pub struct JsonProjector<'a> {
    arena: &'a NodeArena,
    cyclic: HashSet<u32>,
}

impl<'a> JsonProjector<'a> {
    /// Analyze the graph reachable from `root` and prepare to render it.
    pub fn new(arena: &'a NodeArena, root: NodeId) -> Self {
        let cyclic = cyclic_handles(arena, root);
        Self { arena, cyclic }
    }

    /// Returns true if `handle` takes part in a cycle.
    pub fn is_cyclic(&self, handle: u32) -> bool {
        self.cyclic.contains(&handle)
    }

    /// Render a node as a JSON value.
    ///
    /// # Errors
    ///
    /// Fails on mapping keys that have no JSON spelling and on graphs nested
    /// too deeply.
    pub fn to_value(&self, id: NodeId) -> CodecResult<Value> {
        self.render(id, 0)
    }

    /// Render a node as JSON text.
    pub fn to_json(&self, id: NodeId, options: JsonOptions) -> CodecResult<String> {
        let value = self.to_value(id)?;
        write_json(value, options)
    }

    fn render(&self, id: NodeId, depth: usize) -> CodecResult<Value> {
        if depth > MAX_DEPTH {
            return Err(CodecError::projection("value nested too deeply"));
        }
        let depth = depth + 1;
        let value = match self.arena.get(id) {
            Node::Scalar(scalar) => scalar_value(scalar)?,
            Node::Bytes(bytes) => bytes_value(bytes),
            Node::Sequence { items, .. } => Value::Array(
                items
                    .iter()
                    .map(|item| self.render(*item, depth))
                    .collect::<CodecResult<_>>()?,
            ),
            Node::Mapping(pairs) => Value::Object(self.render_pairs(pairs, depth)?),
            Node::ClassRecord {
                class_name,
                args,
                state,
            } => self.render_record(class_name, *args, *state, None, depth)?,
            Node::GlobalRef { name } => tagged("global", [("name", Value::from(name.as_str()))]),
            Node::ExternalRef {
                object_id,
                class_hint,
            } => {
                let id = match class_hint {
                    Some(class) => Value::Array(vec![Value::from(*object_id), Value::from(class.as_str())]),
                    None => Value::from(*object_id),
                };
                tagged("persistent", [("id", id)])
            }
            Node::SharedMarker { handle, target } if self.is_cyclic(*handle) => {
                match self.arena.get(*target) {
                    Node::ClassRecord {
                        class_name,
                        args,
                        state,
                    } => self.render_record(class_name, *args, *state, Some(*handle), depth)?,
                    Node::Mapping(pairs) => {
                        let mut map = self.render_pairs(pairs, depth)?;
                        map.insert("::id".into(), Value::from(*handle));
                        Value::Object(map)
                    }
                    _ => tagged(
                        "shared",
                        [
                            ("::id", Value::from(*handle)),
                            ("value", self.render(*target, depth)?),
                        ],
                    ),
                }
            }
            Node::BackRef { handle, .. } if self.is_cyclic(*handle) => {
                tagged("ref", [("id", Value::from(*handle))])
            }
            Node::SharedMarker { target, .. } | Node::BackRef { target, .. } => self.render(*target, depth)?,
        };
        Ok(value)
    }

    fn render_pairs(&self, pairs: &[(NodeId, NodeId)], depth: usize) -> CodecResult<Map<String, Value>> {
        let mut map = Map::new();
        for (key, value) in pairs {
            map.insert(self.render_key(*key)?, self.render(*value, depth)?);
        }
        Ok(map)
    }

    fn render_key(&self, id: NodeId) -> CodecResult<String> {
        match self.arena.resolved(id) {
            Node::Scalar(Scalar::Str(s)) => Ok(s.clone()),
            Node::Scalar(Scalar::Int(i)) => Ok(i.to_string()),
            Node::Scalar(Scalar::Float(f)) => Ok(float_repr(*f)),
            Node::Scalar(Scalar::Bool(b)) => Ok(b.to_string()),
            Node::Scalar(Scalar::None) => Ok("null".into()),
            Node::Bytes(bytes) if bytes.is_ascii() => Ok(bytes.iter().map(|&b| char::from(b)).collect()),
            other => Err(CodecError::projection(format!(
                "mapping key {} cannot be a JSON key",
                describe(other)
            ))),
        }
    }

    fn render_record(
        &self,
        class_name: &str,
        args: Option<NodeId>,
        state: Option<NodeId>,
        cycle_id: Option<u32>,
        depth: usize,
    ) -> CodecResult<Value> {
        let mut map = match state {
            // Cyclic shared state keeps its identity under "state".
            Some(state) if self.is_cyclic_memo(state) => {
                let mut map = Map::new();
                map.insert("state".into(), self.render(state, depth)?);
                map
            }
            Some(state) => match self.arena.resolved(state) {
                Node::Mapping(pairs) => self.render_pairs(pairs, depth)?,
                _ if self.arena.is_truthy(state) => {
                    let mut map = Map::new();
                    map.insert("state".into(), self.render(state, depth)?);
                    map
                }
                _ => Map::new(),
            },
            None => Map::new(),
        };
        map.insert("::".into(), Value::from(class_name));
        if let Some(args) = args.filter(|args| self.arena.is_truthy(*args)) {
            map.insert("::()".into(), self.render(args, depth)?);
        }
        if let Some(id) = cycle_id {
            map.insert("::id".into(), Value::from(id));
        }
        Ok(Value::Object(map))
    }

    fn is_cyclic_memo(&self, id: NodeId) -> bool {
        matches!(
            self.arena.get(id),
            Node::SharedMarker { handle, .. } | Node::BackRef { handle, .. } if self.is_cyclic(*handle)
        )
    }
}

/// Serialize a JSON value with the given options.
pub fn write_json(value: Value, options: JsonOptions) -> CodecResult<String> {
    let value = if options.sort_keys { sort_keys(value) } else { value };
    match options.indent {
        None => serde_json::to_string(&value).map_err(|e| CodecError::projection(e.to_string())),
        Some(width) => {
            let indent = vec![b' '; width];
            let mut out = Vec::new();
            let mut ser = serde_json::Serializer::with_formatter(&mut out, PrettyFormatter::with_indent(&indent));
            value
                .serialize(&mut ser)
                .map_err(|e| CodecError::projection(e.to_string()))?;
            String::from_utf8(out).map_err(|e| CodecError::projection(e.to_string()))
        }
    }
}

/// Replaces the characters a JSON document store cannot hold: escaped NUL
/// and escaped lone surrogates become a space, as do raw NUL bytes.
pub fn scrub_json(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut chars = text.char_indices().peekable();
    while let Some((i, c)) = chars.next() {
        match c {
            '\0' => out.push(' '),
            '\\' => {
                let escape = text.get(i + 1..i + 6);
                match escape {
                    Some(_) if is_surrogate_pair(text.get(i + 1..i + 12)) => {
                        out.push_str(&text[i..i + 12]);
                        for _ in 0..11 {
                            chars.next();
                        }
                    }
                    Some(esc) if is_unstorable_escape(esc) => {
                        out.push(' ');
                        for _ in 0..5 {
                            chars.next();
                        }
                    }
                    _ => {
                        out.push('\\');
                        if let Some((_, next)) = chars.next() {
                            out.push(next);
                        }
                    }
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// `u0000` or `ud800`..`udfff`, case-insensitively.
fn is_unstorable_escape(esc: &str) -> bool {
    escape_code(esc).is_some_and(|code| code == 0 || (0xd800..=0xdfff).contains(&code))
}

/// A high surrogate escape followed by a low one, as in `\ud83d\ude00`.
fn is_surrogate_pair(text: Option<&str>) -> bool {
    let Some(text) = text else {
        return false;
    };
    let high = text.get(..5).and_then(escape_code);
    let low = text.get(5..).and_then(|rest| rest.strip_prefix('\\')).and_then(escape_code);
    matches!((high, low), (Some(0xd800..=0xdbff), Some(0xdc00..=0xdfff)))
}

fn escape_code(esc: &str) -> Option<u32> {
    let bytes = esc.as_bytes();
    if bytes.len() != 5 || bytes[0] != b'u' || !bytes[1..].iter().all(u8::is_ascii_hexdigit) {
        return None;
    }
    u32::from_str_radix(&esc[1..], 16).ok()
}

fn sort_keys(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<_> = map.into_iter().collect();
            entries.sort_by(|a, b| a.0.cmp(&b.0));
            Value::Object(entries.into_iter().map(|(k, v)| (k, sort_keys(v))).collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(sort_keys).collect()),
        other => other,
    }
}

fn tagged<const N: usize>(kind: &str, fields: [(&str, Value); N]) -> Value {
    let mut map = Map::new();
    map.insert("::".into(), Value::from(kind));
    for (key, value) in fields {
        map.insert(key.into(), value);
    }
    Value::Object(map)
}

fn scalar_value(scalar: &Scalar) -> CodecResult<Value> {
    Ok(match scalar {
        Scalar::None => Value::Null,
        Scalar::Bool(b) => Value::Bool(*b),
        Scalar::Int(Integer::Small(i)) => Value::from(*i),
        Scalar::Int(Integer::Big(digits)) => Value::Number(
            serde_json::from_str::<Number>(digits).map_err(|e| CodecError::projection(e.to_string()))?,
        ),
        Scalar::Float(f) => Number::from_f64(*f).map_or(Value::Null, Value::Number),
        Scalar::Str(s) => Value::from(s.as_str()),
    })
}

fn bytes_value(bytes: &[u8]) -> Value {
    if bytes.is_ascii() {
        return Value::from(bytes.iter().map(|&b| char::from(b)).collect::<String>());
    }
    let hex: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    tagged("hex", [("hex", Value::from(hex))])
}

/// Python's `repr` spelling of a float, used for float mapping keys.
fn float_repr(f: f64) -> String {
    if f.is_nan() {
        return "NaN".into();
    }
    if f.is_infinite() {
        return if f > 0.0 { "Infinity".into() } else { "-Infinity".into() };
    }
    // `{:e}` gives the shortest round-trip digits as `d.ddde±x`.
    let sci = format!("{f:e}");
    let (mantissa, exp) = sci.split_once('e').unwrap_or((&sci, "0"));
    let exp: i32 = exp.parse().unwrap_or(0);
    let (sign, mantissa) = match mantissa.strip_prefix('-') {
        Some(m) => ("-", m),
        None => ("", mantissa),
    };
    let digits: String = mantissa.chars().filter(char::is_ascii_digit).collect();

    if (-4..16).contains(&exp) {
        let point = exp + 1;
        let text = if point <= 0 {
            format!("0.{}{digits}", "0".repeat(point.unsigned_abs() as usize))
        } else {
            let point = point as usize;
            if digits.len() <= point {
                format!("{digits}{}.0", "0".repeat(point - digits.len()))
            } else {
                format!("{}.{}", &digits[..point], &digits[point..])
            }
        };
        format!("{sign}{text}")
    } else {
        let exp_sign = if exp < 0 { '-' } else { '+' };
        format!("{sign}{mantissa}e{exp_sign}{:02}", exp.unsigned_abs())
    }
}

fn describe(node: &Node) -> &'static str {
    match node {
        Node::Scalar(_) => "scalar",
        Node::Bytes(_) => "non-ASCII bytes",
        Node::Sequence { .. } => "sequence",
        Node::Mapping(_) => "mapping",
        Node::ClassRecord { .. } => "object",
        Node::GlobalRef { .. } => "class reference",
        Node::ExternalRef { .. } => "persistent reference",
        Node::SharedMarker { .. } | Node::BackRef { .. } => "reference",
    }
}

fn children(node: &Node) -> Vec<NodeId> {
    match node {
        Node::Sequence { items, .. } => items.clone(),
        Node::Mapping(pairs) => pairs.iter().flat_map(|(k, v)| [*k, *v]).collect(),
        Node::ClassRecord { args, state, .. } => args.iter().chain(state.iter()).copied().collect(),
        Node::SharedMarker { target, .. } | Node::BackRef { target, .. } => vec![*target],
        _ => Vec::new(),
    }
}

/// Finds memo handles whose value reaches one of its own back-references.
///
/// Runs Tarjan's strongly-connected-components algorithm over the nodes
/// reachable from `root`, with back-references as edges to their targets.
/// A back-reference in the same component as its target closes a cycle.
fn cyclic_handles(arena: &NodeArena, root: NodeId) -> HashSet<u32> {
    const UNSEEN: usize = usize::MAX;

    struct Frame {
        node: usize,
        children: Vec<NodeId>,
        next: usize,
    }

    let n = arena.len();
    let mut index = vec![UNSEEN; n];
    let mut low = vec![0; n];
    let mut component = vec![UNSEEN; n];
    let mut on_stack = vec![false; n];
    let mut stack = Vec::new();
    let mut work = Vec::new();
    let mut counter = 0;
    let mut components = 0;

    let mut enter = |node: usize,
                     index: &mut Vec<usize>,
                     low: &mut Vec<usize>,
                     on_stack: &mut Vec<bool>,
                     stack: &mut Vec<usize>,
                     work: &mut Vec<Frame>| {
        index[node] = counter;
        low[node] = counter;
        counter += 1;
        on_stack[node] = true;
        stack.push(node);
        work.push(Frame {
            node,
            children: children(arena.get(NodeId::from_index(node))),
            next: 0,
        });
    };

    enter(root.index(), &mut index, &mut low, &mut on_stack, &mut stack, &mut work);
    while let Some(frame) = work.last_mut() {
        let v = frame.node;
        if let Some(child) = frame.children.get(frame.next).copied() {
            frame.next += 1;
            let w = child.index();
            if index[w] == UNSEEN {
                enter(w, &mut index, &mut low, &mut on_stack, &mut stack, &mut work);
            } else if on_stack[w] {
                low[v] = low[v].min(index[w]);
            }
            continue;
        }
        work.pop();
        if let Some(parent) = work.last() {
            low[parent.node] = low[parent.node].min(low[v]);
        }
        if low[v] == index[v] {
            while let Some(w) = stack.pop() {
                on_stack[w] = false;
                component[w] = components;
                if w == v {
                    break;
                }
            }
            components += 1;
        }
    }

    (0..n)
        .filter(|&i| component[i] != UNSEEN)
        .filter_map(|i| match arena.get(NodeId::from_index(i)) {
            Node::BackRef { handle, target } if component[target.index()] == component[i] => Some(*handle),
            _ => None,
        })
        .collect()
}
