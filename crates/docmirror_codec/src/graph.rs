//! Decoded object graph.
//!
//! Nodes live in an arena and refer to each other by [`NodeId`]. Shared
//! and cyclic structure is expressed through memo handles
//! ([`Node::SharedMarker`] / [`Node::BackRef`]) rather than pointers, so a
//! cycle in the pickle never becomes an ownership cycle here.

use crate::number::Integer;
use std::cmp::Ordering;

/// Index of a node in a [`NodeArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(u32);

impl NodeId {
    /// Position in the arena.
    pub fn index(self) -> usize {
        self.0 as usize
    }

    pub(crate) fn from_index(index: usize) -> Self {
        Self(u32::try_from(index).unwrap_or(u32::MAX))
    }
}

/// A scalar value.
#[derive(Debug, Clone, PartialEq)]
pub enum Scalar {
    /// Python `None`.
    None,
    /// Boolean.
    Bool(bool),
    /// Integer of any width.
    Int(Integer),
    /// Double-precision float.
    Float(f64),
    /// Text.
    Str(String),
}

/// Whether a sequence came from a list (mutable) or a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequenceKind {
    /// A list; can be appended to.
    List,
    /// A tuple.
    Tuple,
}

/// One decoded node.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    /// A scalar.
    Scalar(Scalar),
    /// Binary data; ASCII data projects as a string.
    Bytes(Vec<u8>),
    /// A list or tuple.
    Sequence {
        /// List or tuple.
        kind: SequenceKind,
        /// Elements in order.
        items: Vec<NodeId>,
    },
    /// Key/value pairs in insertion order.
    Mapping(Vec<(NodeId, NodeId)>),
    /// An instance of a class.
    ClassRecord {
        /// Dotted class name.
        class_name: String,
        /// Constructor arguments, if any were given.
        args: Option<NodeId>,
        /// State attached by a build step.
        state: Option<NodeId>,
    },
    /// A reference to a class or function, without state.
    GlobalRef {
        /// Dotted name.
        name: String,
    },
    /// A reference to an object stored outside this record.
    ExternalRef {
        /// Object id of the referenced object.
        object_id: u64,
        /// Class of the referenced object, when the pickle names it.
        class_hint: Option<String>,
    },
    /// The memoized occurrence of an identity-bearing value.
    SharedMarker {
        /// Memo handle.
        handle: u32,
        /// The shared value.
        target: NodeId,
    },
    /// A later fetch of a memoized value.
    BackRef {
        /// Memo handle.
        handle: u32,
        /// The shared value.
        target: NodeId,
    },
}

/// Arena holding every node of one decode pass.
#[derive(Debug, Default, Clone)]
pub struct NodeArena {
    nodes: Vec<Node>,
}

impl NodeArena {
    /// Creates an empty arena.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a node and returns its id.
    pub fn push(&mut self, node: Node) -> NodeId {
        let id = NodeId::from_index(self.nodes.len());
        self.nodes.push(node);
        id
    }

    /// Adds a scalar node.
    pub fn scalar(&mut self, scalar: Scalar) -> NodeId {
        self.push(Node::Scalar(scalar))
    }

    /// Adds a string node.
    pub fn string(&mut self, text: impl Into<String>) -> NodeId {
        self.scalar(Scalar::Str(text.into()))
    }

    /// Adds an empty mapping node.
    pub fn mapping(&mut self, pairs: Vec<(NodeId, NodeId)>) -> NodeId {
        self.push(Node::Mapping(pairs))
    }

    /// Returns the node for an id.
    pub fn get(&self, id: NodeId) -> &Node {
        &self.nodes[id.index()]
    }

    /// Returns the node for an id, mutably.
    pub fn get_mut(&mut self, id: NodeId) -> &mut Node {
        &mut self.nodes[id.index()]
    }

    /// Number of nodes.
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Returns true if the arena holds no nodes.
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Follows shared markers and back-references to the underlying value.
    pub fn resolve(&self, mut id: NodeId) -> NodeId {
        loop {
            match self.get(id) {
                Node::SharedMarker { target, .. } | Node::BackRef { target, .. } => id = *target,
                _ => return id,
            }
        }
    }

    /// The node behind any memo indirection.
    pub fn resolved(&self, id: NodeId) -> &Node {
        self.get(self.resolve(id))
    }

    /// The items of a sequence, looking through memo indirection.
    pub fn sequence_items(&self, id: NodeId) -> Option<&[NodeId]> {
        match self.resolved(id) {
            Node::Sequence { items, .. } => Some(items),
            _ => None,
        }
    }

    /// The text of a string node, looking through memo indirection.
    pub fn as_str(&self, id: NodeId) -> Option<&str> {
        match self.resolved(id) {
            Node::Scalar(Scalar::Str(s)) => Some(s),
            _ => None,
        }
    }

    /// The raw bytes of a node that carries binary data.
    ///
    /// Latin-1 text (8-bit strings from old pickles) is accepted when every
    /// character fits in a byte.
    pub fn as_bytes(&self, id: NodeId) -> Option<Vec<u8>> {
        match self.resolved(id) {
            Node::Bytes(b) => Some(b.clone()),
            Node::Scalar(Scalar::Str(s)) => s.chars().map(|c| u8::try_from(u32::from(c)).ok()).collect(),
            _ => None,
        }
    }

    /// Python truthiness of a node.
    pub fn is_truthy(&self, id: NodeId) -> bool {
        match self.resolved(id) {
            Node::Scalar(Scalar::None) => false,
            Node::Scalar(Scalar::Bool(b)) => *b,
            Node::Scalar(Scalar::Int(i)) => !i.is_zero(),
            Node::Scalar(Scalar::Float(f)) => *f != 0.0,
            Node::Scalar(Scalar::Str(s)) => !s.is_empty(),
            Node::Bytes(b) => !b.is_empty(),
            Node::Sequence { items, .. } => !items.is_empty(),
            Node::Mapping(pairs) => !pairs.is_empty(),
            _ => true,
        }
    }

    /// Total order used to sort set members deterministically.
    ///
    /// None < booleans < numbers < strings < bytes; anything else sorts
    /// after and keeps its relative order.
    pub fn cmp_for_sort(&self, a: NodeId, b: NodeId) -> Ordering {
        fn rank(node: &Node) -> u8 {
            match node {
                Node::Scalar(Scalar::None) => 0,
                Node::Scalar(Scalar::Bool(_)) => 1,
                Node::Scalar(Scalar::Int(_) | Scalar::Float(_)) => 2,
                Node::Scalar(Scalar::Str(_)) => 3,
                Node::Bytes(_) => 4,
                _ => 5,
            }
        }
        let (na, nb) = (self.resolved(a), self.resolved(b));
        rank(na).cmp(&rank(nb)).then_with(|| match (na, nb) {
            (Node::Scalar(Scalar::Bool(x)), Node::Scalar(Scalar::Bool(y))) => x.cmp(y),
            (Node::Scalar(Scalar::Int(x)), Node::Scalar(Scalar::Int(y))) => x.cmp_value(y),
            (Node::Scalar(x), Node::Scalar(y)) if rank(na) == 2 => {
                let fx = number_as_f64(x);
                let fy = number_as_f64(y);
                fx.total_cmp(&fy)
            }
            (Node::Scalar(Scalar::Str(x)), Node::Scalar(Scalar::Str(y))) => x.cmp(y),
            (Node::Bytes(x), Node::Bytes(y)) => x.cmp(y),
            _ => Ordering::Equal,
        })
    }
}

fn number_as_f64(scalar: &Scalar) -> f64 {
    match scalar {
        Scalar::Int(i) => i.to_f64(),
        Scalar::Float(f) => *f,
        _ => f64::NAN,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_follows_memo_chain() {
        let mut arena = NodeArena::new();
        let list = arena.push(Node::Sequence {
            kind: SequenceKind::List,
            items: vec![],
        });
        let shared = arena.push(Node::SharedMarker {
            handle: 0,
            target: list,
        });
        let back = arena.push(Node::BackRef {
            handle: 0,
            target: shared,
        });
        assert_eq!(arena.resolve(back), list);
        assert_eq!(arena.sequence_items(back), Some(&[][..]));
    }

    #[test]
    fn truthiness_matches_python() {
        let mut arena = NodeArena::new();
        let zero = arena.scalar(Scalar::Int(0.into()));
        let empty = arena.string("");
        let none = arena.scalar(Scalar::None);
        let text = arena.string("x");
        let map = arena.mapping(vec![]);
        assert!(!arena.is_truthy(zero));
        assert!(!arena.is_truthy(empty));
        assert!(!arena.is_truthy(none));
        assert!(!arena.is_truthy(map));
        assert!(arena.is_truthy(text));
    }

    #[test]
    fn latin1_text_converts_to_bytes() {
        let mut arena = NodeArena::new();
        let text = arena.string("\u{ff}\u{0}a");
        let wide = arena.string("\u{100}");
        assert_eq!(arena.as_bytes(text), Some(vec![0xff, 0x00, b'a']));
        assert_eq!(arena.as_bytes(wide), None);
    }

    #[test]
    fn sort_order_mixes_ints_and_floats() {
        let mut arena = NodeArena::new();
        let a = arena.scalar(Scalar::Float(1.5));
        let b = arena.scalar(Scalar::Int(1.into()));
        let c = arena.string("a");
        let mut ids = vec![c, a, b];
        ids.sort_by(|x, y| arena.cmp_for_sort(*x, *y));
        assert_eq!(ids, vec![b, a, c]);
    }
}
