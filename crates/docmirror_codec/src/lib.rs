//! # Docmirror Codec
//!
//! Converts pickled object records into JSON documents.
//!
//! The pipeline has three layers:
//!
//! - [`FormatReader`] walks the byte stream one opcode at a time.
//! - [`GraphDecoder`] replays opcodes on a stack machine and builds a
//!   [`NodeArena`] of scalars, containers, class records and memo
//!   references.
//! - [`JsonProjector`] decides which shared values are cyclic and renders
//!   the graph as JSON.
//!
//! [`RecordTransform`] ties these together for a full database record
//! (class pickle plus state pickle).
//!
//! ## JSON shape
//!
//! - Class instances: `{"::": "mod.Class", "::()": [args], ...state}`
//! - Class references: `{"::": "global", "name": "mod.Class"}`
//! - References to other records: `{"::": "persistent", "id": oid}`
//! - Non-ASCII bytes: `{"::": "hex", "hex": "..."}`
//! - Cycles: `{"::": "shared", "::id": n, "value": ...}` and
//!   `{"::": "ref", "id": n}`
//!
//! ## Usage
//!
//! ```
//! use docmirror_codec::{pickle_to_json, JsonOptions};
//!
//! // {'a': 1} at protocol 2
//! let json = pickle_to_json(b"\x80\x02}q\x00X\x01\x00\x00\x00aK\x01s.", JsonOptions::compact()).unwrap();
//! assert_eq!(json, r#"{"a":1}"#);
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod decoder;
mod error;
mod graph;
mod number;
mod opcode;
mod projector;
mod reader;
mod reducers;
mod transform;

pub use decoder::GraphDecoder;
pub use error::{CodecError, CodecResult};
pub use graph::{Node, NodeArena, NodeId, Scalar, SequenceKind};
pub use number::Integer;
pub use opcode::{ArgKind, Opcode};
pub use projector::{scrub_json, write_json, JsonOptions, JsonProjector};
pub use reader::{Arg, FormatReader, Instruction};
pub use reducers::{Reducer, ReducerRegistry, Reduction};
pub use transform::{
    class_name_of, default_skip, DecodedRecord, RecordTransform, SkipPredicate, SkipReason, StateHook,
    Transformed,
};

/// Decode a single pickle with the built-in reducers and render it as JSON.
///
/// # Errors
///
/// Returns an error if the pickle is malformed or cannot be expressed as
/// JSON.
pub fn pickle_to_json(data: &[u8], options: JsonOptions) -> CodecResult<String> {
    pickle_to_json_with(data, &ReducerRegistry::new(), options)
}

/// Like [`pickle_to_json`], with a caller-supplied reducer registry.
pub fn pickle_to_json_with(
    data: &[u8],
    registry: &ReducerRegistry,
    options: JsonOptions,
) -> CodecResult<String> {
    let mut decoder = GraphDecoder::new(data, registry);
    let root = decoder.decode_next()?;
    JsonProjector::new(decoder.arena(), root).to_json(root, options)
}
