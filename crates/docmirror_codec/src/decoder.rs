//! Pickle stack machine.
//!
//! [`GraphDecoder`] replays the opcodes produced by a [`FormatReader`] and
//! builds a [`NodeArena`]. A database record holds two pickles back to
//! back; call [`GraphDecoder::decode_next`] once per pickle. The memo table
//! survives between calls, so the second pickle may refer to values stored
//! by the first.

use crate::error::{CodecError, CodecResult};
use crate::graph::{Node, NodeArena, NodeId, Scalar, SequenceKind};
use crate::opcode::Opcode;
use crate::reader::{Arg, FormatReader, Instruction};
use crate::reducers::ReducerRegistry;
use std::collections::HashMap;
use tracing::trace;

/// What a memo handle resolves to on a later GET.
#[derive(Debug, Clone, Copy)]
enum MemoEntry {
    /// A value without identity; GET pushes the same node again.
    Plain(NodeId),
    /// An identity-bearing value; GET pushes a back-reference.
    Shared { handle: u32, target: NodeId },
}

/// Decodes pickled values into a node graph.
pub struct GraphDecoder<'a> {
    reader: FormatReader<'a>,
    registry: &'a ReducerRegistry,
    arena: NodeArena,
    stack: Vec<NodeId>,
    marks: Vec<usize>,
    memo: HashMap<u32, MemoEntry>,
}

impl<'a> GraphDecoder<'a> {
    /// Create a decoder over `data` using `registry` for constructor steps.
    pub fn new(data: &'a [u8], registry: &'a ReducerRegistry) -> Self {
        Self {
            reader: FormatReader::new(data),
            registry,
            arena: NodeArena::new(),
            stack: Vec::new(),
            marks: Vec::new(),
            memo: HashMap::new(),
        }
    }

    /// Byte position just past the last STOP consumed.
    pub fn position(&self) -> usize {
        self.reader.position()
    }

    /// Returns true once all input has been consumed.
    pub fn is_finished(&self) -> bool {
        self.reader.is_empty()
    }

    /// The nodes decoded so far.
    pub fn arena(&self) -> &NodeArena {
        &self.arena
    }

    /// Consumes the decoder, returning its arena.
    pub fn into_arena(self) -> NodeArena {
        self.arena
    }

    /// Decode the next pickle, up to and including its STOP opcode.
    ///
    /// # Errors
    ///
    /// Fails on malformed input, on opcodes outside protocols 0-4, on memo
    /// misuse, and when the input ends before STOP.
    pub fn decode_next(&mut self) -> CodecResult<NodeId> {
        while let Some(ins) = self.reader.next_instruction()? {
            if ins.opcode == Opcode::STOP {
                let root = self.pop(ins.opcode, ins.offset)?;
                self.stack.clear();
                self.marks.clear();
                return Ok(root);
            }
            trace!(opcode = ins.opcode.name(), offset = ins.offset, "pickle op");
            self.step(ins)?;
        }
        Err(CodecError::MissingStop)
    }

    fn step(&mut self, ins: Instruction<'a>) -> CodecResult<()> {
        let Instruction {
            opcode,
            arg,
            offset,
        } = ins;
        match (opcode, arg) {
            (Opcode::PROTO | Opcode::FRAME, _) => {}
            (Opcode::NEXT_BUFFER | Opcode::READONLY_BUFFER, _) => {
                return Err(CodecError::unsupported_opcode(opcode.name(), offset));
            }

            (Opcode::MARK, _) => self.marks.push(self.stack.len()),
            (Opcode::POP, _) => {
                self.pop(opcode, offset)?;
            }
            (Opcode::POP_MARK, _) => {
                self.pop_marked(opcode, offset)?;
            }
            (Opcode::DUP, _) => {
                let top = self.top(opcode, offset)?;
                self.stack.push(top);
            }

            (Opcode::NONE, _) => self.push_scalar(Scalar::None),
            (Opcode::NEWTRUE, _) => self.push_scalar(Scalar::Bool(true)),
            (Opcode::NEWFALSE, _) => self.push_scalar(Scalar::Bool(false)),
            (Opcode::INT, Arg::Bool(b)) => self.push_scalar(Scalar::Bool(b)),
            (
                Opcode::INT
                | Opcode::BININT
                | Opcode::BININT1
                | Opcode::BININT2
                | Opcode::LONG
                | Opcode::LONG1
                | Opcode::LONG4,
                Arg::Int(i),
            ) => self.push_scalar(Scalar::Int(i)),
            (Opcode::FLOAT | Opcode::BINFLOAT, Arg::Float(f)) => self.push_scalar(Scalar::Float(f)),
            (
                Opcode::STRING
                | Opcode::BINSTRING
                | Opcode::SHORT_BINSTRING
                | Opcode::UNICODE
                | Opcode::BINUNICODE
                | Opcode::SHORT_BINUNICODE
                | Opcode::BINUNICODE8,
                Arg::Text(text),
            ) => self.push_scalar(Scalar::Str(text)),
            (
                Opcode::BINBYTES | Opcode::SHORT_BINBYTES | Opcode::BINBYTES8 | Opcode::BYTEARRAY8,
                Arg::Bytes(bytes),
            ) => self.push(Node::Bytes(bytes.to_vec())),

            (Opcode::EMPTY_LIST | Opcode::EMPTY_SET, _) => self.push_sequence(SequenceKind::List, Vec::new()),
            (Opcode::EMPTY_TUPLE, _) => self.push_sequence(SequenceKind::Tuple, Vec::new()),
            (Opcode::EMPTY_DICT, _) => self.push(Node::Mapping(Vec::new())),
            (Opcode::LIST, _) => {
                let items = self.pop_marked(opcode, offset)?;
                self.push_sequence(SequenceKind::List, items);
            }
            (Opcode::TUPLE, _) => {
                let items = self.pop_marked(opcode, offset)?;
                self.push_sequence(SequenceKind::Tuple, items);
            }
            (Opcode::TUPLE1 | Opcode::TUPLE2 | Opcode::TUPLE3, _) => {
                let n = match opcode {
                    Opcode::TUPLE1 => 1,
                    Opcode::TUPLE2 => 2,
                    _ => 3,
                };
                let items = self.pop_n(n, opcode, offset)?;
                self.push_sequence(SequenceKind::Tuple, items);
            }
            (Opcode::FROZENSET, _) => {
                let mut items = self.pop_marked(opcode, offset)?;
                self.sort_items(&mut items);
                self.push_sequence(SequenceKind::List, items);
            }
            (Opcode::DICT, _) => {
                let marked = self.pop_marked(opcode, offset)?;
                let pairs = pairs(marked, opcode, offset)?;
                self.push(Node::Mapping(pairs));
            }

            (Opcode::APPEND, _) => {
                let item = self.pop(opcode, offset)?;
                let target = self.top(opcode, offset)?;
                self.extend_list(target, vec![item], opcode, offset)?;
            }
            (Opcode::APPENDS, _) => {
                let items = self.pop_marked(opcode, offset)?;
                let target = self.top(opcode, offset)?;
                self.extend_list(target, items, opcode, offset)?;
            }
            (Opcode::ADDITEMS, _) => {
                let mut items = self.pop_marked(opcode, offset)?;
                self.sort_items(&mut items);
                let target = self.top(opcode, offset)?;
                self.extend_list(target, items, opcode, offset)?;
            }
            (Opcode::SETITEM, _) => {
                let value = self.pop(opcode, offset)?;
                let key = self.pop(opcode, offset)?;
                let target = self.top(opcode, offset)?;
                self.extend_mapping(target, vec![(key, value)], opcode, offset)?;
            }
            (Opcode::SETITEMS, _) => {
                let marked = self.pop_marked(opcode, offset)?;
                let pairs = pairs(marked, opcode, offset)?;
                let target = self.top(opcode, offset)?;
                self.extend_mapping(target, pairs, opcode, offset)?;
            }

            (Opcode::GET | Opcode::BINGET | Opcode::LONG_BINGET, arg) => {
                let handle = memo_handle(&arg, opcode, offset)?;
                self.memo_get(handle, offset)?;
            }
            (Opcode::PUT | Opcode::BINPUT | Opcode::LONG_BINPUT, arg) => {
                let handle = memo_handle(&arg, opcode, offset)?;
                self.memo_put(handle, opcode, offset)?;
            }
            (Opcode::MEMOIZE, _) => {
                let handle = u32::try_from(self.memo.len())
                    .map_err(|_| CodecError::invalid_argument(opcode.name(), offset, "memo full"))?;
                self.memo_put(handle, opcode, offset)?;
            }

            (Opcode::GLOBAL, Arg::Pair(module, name)) => {
                self.push(Node::GlobalRef {
                    name: format!("{module}.{name}"),
                });
            }
            (Opcode::STACK_GLOBAL, _) => {
                let name = self.pop(opcode, offset)?;
                let module = self.pop(opcode, offset)?;
                let (Some(module), Some(name)) = (self.arena.as_str(module), self.arena.as_str(name)) else {
                    return Err(CodecError::type_mismatch(
                        opcode.name(),
                        offset,
                        "module and name must be strings",
                    ));
                };
                let name = format!("{module}.{name}");
                self.push(Node::GlobalRef { name });
            }
            (Opcode::EXT1 | Opcode::EXT2 | Opcode::EXT4, Arg::Int(code)) => {
                let name = code
                    .as_i64()
                    .and_then(|code| self.registry.extension(code))
                    .ok_or_else(|| {
                        CodecError::invalid_argument(
                            opcode.name(),
                            offset,
                            format!("unregistered extension code {code}"),
                        )
                    })?;
                self.push(Node::GlobalRef { name });
            }

            (Opcode::REDUCE | Opcode::NEWOBJ, _) => {
                let args = self.pop(opcode, offset)?;
                let class = self.pop(opcode, offset)?;
                self.instantiate(class, args, opcode, offset)?;
            }
            (Opcode::NEWOBJ_EX, _) => {
                let kwargs = self.pop(opcode, offset)?;
                let args = self.pop(opcode, offset)?;
                let class = self.pop(opcode, offset)?;
                let args = match (self.arena.is_truthy(args), self.arena.is_truthy(kwargs)) {
                    (true, true) => self.arena.push(Node::Sequence {
                        kind: SequenceKind::Tuple,
                        items: vec![args, kwargs],
                    }),
                    (false, true) => kwargs,
                    _ => args,
                };
                self.instantiate(class, args, opcode, offset)?;
            }
            (Opcode::OBJ, _) => {
                let mut marked = self.pop_marked(opcode, offset)?;
                if marked.is_empty() {
                    return Err(CodecError::StackUnderflow {
                        opcode: opcode.name(),
                        offset,
                    });
                }
                let class = marked.remove(0);
                let args = self.arena.push(Node::Sequence {
                    kind: SequenceKind::Tuple,
                    items: marked,
                });
                self.instantiate(class, args, opcode, offset)?;
            }
            (Opcode::INST, Arg::Pair(module, name)) => {
                let items = self.pop_marked(opcode, offset)?;
                let class = self.arena.push(Node::GlobalRef {
                    name: format!("{module}.{name}"),
                });
                let args = self.arena.push(Node::Sequence {
                    kind: SequenceKind::Tuple,
                    items,
                });
                self.instantiate(class, args, opcode, offset)?;
            }
            (Opcode::BUILD, _) => {
                let state = self.pop(opcode, offset)?;
                let target = self.top(opcode, offset)?;
                let target = self.arena.resolve(target);
                match self.arena.get_mut(target) {
                    Node::ClassRecord { state: slot, .. } => *slot = Some(state),
                    _ => {
                        return Err(CodecError::type_mismatch(
                            opcode.name(),
                            offset,
                            "state applied to a value that is not an object",
                        ))
                    }
                }
            }

            (Opcode::PERSID, Arg::Text(id)) => {
                let id = self.arena.string(id);
                let node = self.external_ref(id, opcode, offset)?;
                self.stack.push(node);
            }
            (Opcode::BINPERSID, _) => {
                let id = self.pop(opcode, offset)?;
                let node = self.external_ref(id, opcode, offset)?;
                self.stack.push(node);
            }

            (opcode, arg) => {
                return Err(CodecError::invalid_argument(
                    opcode.name(),
                    offset,
                    format!("unexpected argument {arg:?}"),
                ));
            }
        }
        Ok(())
    }

    fn push(&mut self, node: Node) {
        let id = self.arena.push(node);
        self.stack.push(id);
    }

    fn push_scalar(&mut self, scalar: Scalar) {
        self.push(Node::Scalar(scalar));
    }

    fn push_sequence(&mut self, kind: SequenceKind, items: Vec<NodeId>) {
        self.push(Node::Sequence { kind, items });
    }

    fn pop(&mut self, opcode: Opcode, offset: usize) -> CodecResult<NodeId> {
        // Items below the innermost mark belong to an outer construction.
        if self.marks.last().is_some_and(|&mark| self.stack.len() <= mark) {
            return Err(CodecError::StackUnderflow {
                opcode: opcode.name(),
                offset,
            });
        }
        self.stack.pop().ok_or(CodecError::StackUnderflow {
            opcode: opcode.name(),
            offset,
        })
    }

    fn pop_n(&mut self, n: usize, opcode: Opcode, offset: usize) -> CodecResult<Vec<NodeId>> {
        let floor = self.marks.last().copied().unwrap_or(0);
        if self.stack.len() < floor + n {
            return Err(CodecError::StackUnderflow {
                opcode: opcode.name(),
                offset,
            });
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn top(&self, opcode: Opcode, offset: usize) -> CodecResult<NodeId> {
        self.stack.last().copied().ok_or(CodecError::StackUnderflow {
            opcode: opcode.name(),
            offset,
        })
    }

    fn pop_marked(&mut self, opcode: Opcode, offset: usize) -> CodecResult<Vec<NodeId>> {
        let mark = self.marks.pop().ok_or(CodecError::MarkUnderflow {
            opcode: opcode.name(),
            offset,
        })?;
        if mark > self.stack.len() {
            return Err(CodecError::StackUnderflow {
                opcode: opcode.name(),
                offset,
            });
        }
        Ok(self.stack.split_off(mark))
    }

    fn sort_items(&self, items: &mut [NodeId]) {
        items.sort_by(|a, b| self.arena.cmp_for_sort(*a, *b));
    }

    fn extend_list(
        &mut self,
        target: NodeId,
        new_items: Vec<NodeId>,
        opcode: Opcode,
        offset: usize,
    ) -> CodecResult<()> {
        let target = self.arena.resolve(target);
        match self.arena.get_mut(target) {
            Node::Sequence {
                kind: SequenceKind::List,
                items,
            } => {
                items.extend(new_items);
                Ok(())
            }
            _ => Err(CodecError::type_mismatch(
                opcode.name(),
                offset,
                "items appended to a value that is not a list",
            )),
        }
    }

    fn extend_mapping(
        &mut self,
        target: NodeId,
        new_pairs: Vec<(NodeId, NodeId)>,
        opcode: Opcode,
        offset: usize,
    ) -> CodecResult<()> {
        let target = self.arena.resolve(target);
        match self.arena.get_mut(target) {
            Node::Mapping(pairs) => {
                pairs.extend(new_pairs);
                Ok(())
            }
            _ => Err(CodecError::type_mismatch(
                opcode.name(),
                offset,
                "items set on a value that is not a dict",
            )),
        }
    }

    fn memo_put(&mut self, handle: u32, opcode: Opcode, offset: usize) -> CodecResult<()> {
        if self.memo.contains_key(&handle) {
            return Err(CodecError::DuplicateMemo { handle, offset });
        }
        let top = self.top(opcode, offset)?;
        let entry = match self.arena.get(top) {
            Node::SharedMarker { handle, target } | Node::BackRef { handle, target } => {
                MemoEntry::Shared {
                    handle: *handle,
                    target: *target,
                }
            }
            Node::Sequence {
                kind: SequenceKind::List,
                ..
            }
            | Node::Mapping(_)
            | Node::ClassRecord { .. } => {
                let marker = self.arena.push(Node::SharedMarker {
                    handle,
                    target: top,
                });
                if let Some(slot) = self.stack.last_mut() {
                    *slot = marker;
                }
                MemoEntry::Shared {
                    handle,
                    target: top,
                }
            }
            _ => MemoEntry::Plain(top),
        };
        self.memo.insert(handle, entry);
        Ok(())
    }

    fn memo_get(&mut self, handle: u32, offset: usize) -> CodecResult<()> {
        match self.memo.get(&handle).copied() {
            Some(MemoEntry::Plain(id)) => self.stack.push(id),
            Some(MemoEntry::Shared { handle, target }) => self.push(Node::BackRef { handle, target }),
            None => return Err(CodecError::UnknownMemo { handle, offset }),
        }
        Ok(())
    }

    fn instantiate(&mut self, class: NodeId, args: NodeId, opcode: Opcode, offset: usize) -> CodecResult<()> {
        let class_name = match self.arena.resolved(class) {
            Node::GlobalRef { name } => name.clone(),
            _ => {
                return Err(CodecError::type_mismatch(
                    opcode.name(),
                    offset,
                    "constructor is not a class reference",
                ))
            }
        };
        let node = self.registry.instantiate(&mut self.arena, &class_name, args)?;
        self.stack.push(node);
        Ok(())
    }

    /// Builds an external reference from a persistent id: either an 8-byte
    /// big-endian object id, or an `(object id, class)` pair.
    fn external_ref(&mut self, id: NodeId, opcode: Opcode, offset: usize) -> CodecResult<NodeId> {
        let (oid, class_hint) = match self.arena.sequence_items(id) {
            Some(&[oid, class]) => match self.arena.resolved(class) {
                Node::GlobalRef { name } => (oid, Some(name.clone())),
                _ => {
                    return Err(CodecError::type_mismatch(
                        opcode.name(),
                        offset,
                        "persistent reference class is not a class reference",
                    ))
                }
            },
            _ => (id, None),
        };
        let object_id = self
            .arena
            .as_bytes(oid)
            .and_then(|bytes| <[u8; 8]>::try_from(bytes.as_slice()).ok())
            .map(u64::from_be_bytes)
            .ok_or_else(|| {
                CodecError::type_mismatch(opcode.name(), offset, "persistent id is not an 8-byte object id")
            })?;
        Ok(self.arena.push(Node::ExternalRef {
            object_id,
            class_hint,
        }))
    }
}

fn memo_handle(arg: &Arg<'_>, opcode: Opcode, offset: usize) -> CodecResult<u32> {
    let handle = match arg {
        Arg::Int(i) => i.as_i64(),
        Arg::Bool(b) => Some(i64::from(*b)),
        _ => None,
    };
    handle
        .and_then(|h| u32::try_from(h).ok())
        .ok_or_else(|| CodecError::invalid_argument(opcode.name(), offset, "bad memo handle"))
}

fn pairs(marked: Vec<NodeId>, opcode: Opcode, offset: usize) -> CodecResult<Vec<(NodeId, NodeId)>> {
    if marked.len() % 2 != 0 {
        return Err(CodecError::type_mismatch(
            opcode.name(),
            offset,
            "odd number of items for key/value pairs",
        ));
    }
    Ok(marked.chunks_exact(2).map(|kv| (kv[0], kv[1])).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode_one(data: &[u8]) -> CodecResult<(NodeArena, NodeId)> {
        let registry = ReducerRegistry::new();
        let mut decoder = GraphDecoder::new(data, &registry);
        let root = decoder.decode_next()?;
        Ok((decoder.into_arena(), root))
    }

    #[test]
    fn decodes_protocol_0_list() {
        // [1, 'a']
        let (arena, root) = decode_one(b"(lp0\nI1\naVa\np1\na.").unwrap();
        assert!(matches!(arena.get(root), Node::SharedMarker { handle: 0, .. }));
        let items = arena.sequence_items(root).unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(arena.as_str(items[1]), Some("a"));
    }

    #[test]
    fn get_of_scalar_repushes_same_node() {
        // (x, x) where x = 'abc'
        let (arena, root) = decode_one(b"\x80\x02X\x03\x00\x00\x00abcq\x00h\x00\x86q\x01.").unwrap();
        let items = arena.sequence_items(root).unwrap();
        assert_eq!(items[0], items[1]);
    }

    #[test]
    fn get_of_list_pushes_back_reference() {
        // l = []; l.append(l)
        let (arena, root) = decode_one(b"\x80\x02]q\x00h\x00a.").unwrap();
        let items = arena.sequence_items(root).unwrap();
        assert!(matches!(arena.get(items[0]), Node::BackRef { handle: 0, .. }));
    }

    #[test]
    fn memo_survives_between_pickles() {
        let registry = ReducerRegistry::new();
        let data = b"\x80\x02X\x01\x00\x00\x00aq\x00.\x80\x02h\x00.";
        let mut decoder = GraphDecoder::new(data, &registry);
        decoder.decode_next().unwrap();
        assert_eq!(decoder.position(), 11);
        let second = decoder.decode_next().unwrap();
        assert_eq!(decoder.arena().as_str(second), Some("a"));
        assert!(decoder.is_finished());
    }

    #[test]
    fn memo_errors() {
        assert!(matches!(
            decode_one(b"\x80\x02h\x05."),
            Err(CodecError::UnknownMemo { handle: 5, offset: 2 })
        ));
        assert!(matches!(
            decode_one(b"\x80\x02Nq\x00q\x00."),
            Err(CodecError::DuplicateMemo { handle: 0, offset: 5 })
        ));
    }

    #[test]
    fn stack_and_mark_errors() {
        assert!(matches!(
            decode_one(b"a."),
            Err(CodecError::StackUnderflow { opcode: "APPEND", .. })
        ));
        assert!(matches!(
            decode_one(b"]e."),
            Err(CodecError::MarkUnderflow { opcode: "APPENDS", .. })
        ));
        assert!(matches!(decode_one(b"N"), Err(CodecError::MissingStop)));
        assert!(matches!(
            decode_one(b"\x80\x05\x97."),
            Err(CodecError::UnsupportedOpcode { .. })
        ));
    }

    #[test]
    fn build_requires_an_object() {
        assert!(matches!(
            decode_one(b"]}b."),
            Err(CodecError::TypeMismatch { opcode: "BUILD", .. })
        ));
    }

    #[test]
    fn binpersid_reads_oid_and_class_hint() {
        let data = b"\x80\x02C\x08\x00\x00\x00\x00\x00\x00\x00\x2acapp\nThing\n\x86Q.";
        let (arena, root) = decode_one(data).unwrap();
        assert_eq!(
            arena.get(root),
            &Node::ExternalRef {
                object_id: 42,
                class_hint: Some("app.Thing".into()),
            }
        );
    }

    #[test]
    fn newobj_ex_combines_args_and_kwargs() {
        let data = b"\x80\x04capp\nK\n)}X\x01\x00\x00\x00aK\x01s\x92.";
        let (arena, root) = decode_one(data).unwrap();
        let Node::ClassRecord { args: Some(args), .. } = arena.get(root) else {
            panic!("expected record");
        };
        assert!(matches!(arena.get(*args), Node::Mapping(pairs) if pairs.len() == 1));
    }

    #[test]
    fn sets_are_sorted_lists() {
        let data = b"\x80\x04\x8f(K\x03K\x01K\x02\x90.";
        let (arena, root) = decode_one(data).unwrap();
        let items = arena.sequence_items(root).unwrap();
        let ints: Vec<_> = items
            .iter()
            .map(|id| match arena.get(*id) {
                Node::Scalar(Scalar::Int(i)) => i.as_i64().unwrap(),
                other => panic!("unexpected {other:?}"),
            })
            .collect();
        assert_eq!(ints, vec![1, 2, 3]);
    }
}
