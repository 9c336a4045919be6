//! Pickle opcode table.
//!
//! Every opcode of protocols 0 through 5 is listed so that the reader can
//! name whatever it finds; the decoder rejects the few it does not handle.

/// How an opcode's argument is encoded after the opcode byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgKind {
    /// No argument.
    None,
    /// One unsigned byte.
    U1,
    /// Two-byte little-endian unsigned integer.
    U2,
    /// Four-byte little-endian signed integer.
    I4,
    /// Four-byte little-endian unsigned integer.
    U4,
    /// Eight-byte little-endian unsigned integer.
    U8,
    /// Eight-byte big-endian IEEE-754 double.
    F8,
    /// Newline-terminated decimal integer; `00`/`01` mean false/true.
    DecimalShort,
    /// Newline-terminated decimal integer with an optional `L` suffix.
    DecimalLong,
    /// Newline-terminated float literal.
    FloatLine,
    /// Newline-terminated quoted, escaped 8-bit string.
    QuotedLine,
    /// Newline-terminated raw-unicode-escape text.
    UnicodeLine,
    /// Newline-terminated text taken verbatim.
    RawLine,
    /// Two newline-terminated lines (module and qualified name).
    LinePair,
    /// Byte string with a one-byte length prefix.
    Bytes1,
    /// Byte string with a four-byte signed length prefix.
    BytesI4,
    /// Byte string with a four-byte unsigned length prefix.
    BytesU4,
    /// Byte string with an eight-byte length prefix.
    BytesU8,
    /// Two's-complement integer with a one-byte length prefix.
    Long1,
    /// Two's-complement integer with a four-byte signed length prefix.
    Long4,
}

macro_rules! opcodes {
    ($( $variant:ident = $byte:literal, $arg:ident; )*) => {
        /// A pickle opcode.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[allow(non_camel_case_types, missing_docs)]
        pub enum Opcode {
            $( $variant, )*
        }

        impl Opcode {
            /// Looks up the opcode for a byte.
            pub fn from_byte(byte: u8) -> Option<Self> {
                match byte {
                    $( $byte => Some(Self::$variant), )*
                    _ => None,
                }
            }

            /// The opcode byte.
            pub fn byte(self) -> u8 {
                match self {
                    $( Self::$variant => $byte, )*
                }
            }

            /// The canonical upper-case opcode name.
            pub fn name(self) -> &'static str {
                match self {
                    $( Self::$variant => stringify!($variant), )*
                }
            }

            /// How the argument following the opcode is encoded.
            pub fn arg_kind(self) -> ArgKind {
                match self {
                    $( Self::$variant => ArgKind::$arg, )*
                }
            }
        }
    };
}

opcodes! {
    MARK = b'(', None;
    STOP = b'.', None;
    POP = b'0', None;
    POP_MARK = b'1', None;
    DUP = b'2', None;
    FLOAT = b'F', FloatLine;
    INT = b'I', DecimalShort;
    BININT = b'J', I4;
    BININT1 = b'K', U1;
    LONG = b'L', DecimalLong;
    BININT2 = b'M', U2;
    NONE = b'N', None;
    PERSID = b'P', RawLine;
    BINPERSID = b'Q', None;
    REDUCE = b'R', None;
    STRING = b'S', QuotedLine;
    BINSTRING = b'T', BytesI4;
    SHORT_BINSTRING = b'U', Bytes1;
    UNICODE = b'V', UnicodeLine;
    BINUNICODE = b'X', BytesU4;
    APPEND = b'a', None;
    BUILD = b'b', None;
    GLOBAL = b'c', LinePair;
    DICT = b'd', None;
    EMPTY_DICT = b'}', None;
    APPENDS = b'e', None;
    GET = b'g', DecimalShort;
    BINGET = b'h', U1;
    INST = b'i', LinePair;
    LONG_BINGET = b'j', U4;
    LIST = b'l', None;
    EMPTY_LIST = b']', None;
    OBJ = b'o', None;
    PUT = b'p', DecimalShort;
    BINPUT = b'q', U1;
    LONG_BINPUT = b'r', U4;
    SETITEM = b's', None;
    TUPLE = b't', None;
    EMPTY_TUPLE = b')', None;
    SETITEMS = b'u', None;
    BINFLOAT = b'G', F8;
    PROTO = 0x80, U1;
    NEWOBJ = 0x81, None;
    EXT1 = 0x82, U1;
    EXT2 = 0x83, U2;
    EXT4 = 0x84, I4;
    TUPLE1 = 0x85, None;
    TUPLE2 = 0x86, None;
    TUPLE3 = 0x87, None;
    NEWTRUE = 0x88, None;
    NEWFALSE = 0x89, None;
    LONG1 = 0x8a, Long1;
    LONG4 = 0x8b, Long4;
    BINBYTES = b'B', BytesU4;
    SHORT_BINBYTES = b'C', Bytes1;
    SHORT_BINUNICODE = 0x8c, Bytes1;
    BINUNICODE8 = 0x8d, BytesU8;
    BINBYTES8 = 0x8e, BytesU8;
    EMPTY_SET = 0x8f, None;
    ADDITEMS = 0x90, None;
    FROZENSET = 0x91, None;
    NEWOBJ_EX = 0x92, None;
    STACK_GLOBAL = 0x93, None;
    MEMOIZE = 0x94, None;
    FRAME = 0x95, U8;
    BYTEARRAY8 = 0x96, BytesU8;
    NEXT_BUFFER = 0x97, None;
    READONLY_BUFFER = 0x98, None;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_lookup_roundtrips() {
        for byte in 0..=u8::MAX {
            if let Some(op) = Opcode::from_byte(byte) {
                assert_eq!(op.byte(), byte, "{}", op.name());
            }
        }
    }

    #[test]
    fn names_match_protocol_table() {
        assert_eq!(Opcode::from_byte(b'.'), Some(Opcode::STOP));
        assert_eq!(Opcode::from_byte(0x95).map(Opcode::name), Some("FRAME"));
        assert_eq!(Opcode::LONG_BINGET.arg_kind(), ArgKind::U4);
        assert_eq!(Opcode::from_byte(0xff), None);
    }
}
