//! A small pickle writer for building test records.
//!
//! The writer emits opcodes directly, choosing the encoding a real pickler
//! would use for the selected protocol. It does not track the stack, so a
//! test can also build deliberately malformed streams.

/// Builds a pickle stream opcode by opcode.
#[derive(Debug, Clone)]
pub struct PickleWriter {
    buf: Vec<u8>,
    protocol: u8,
    next_memo: u32,
}

impl PickleWriter {
    /// Starts a pickle at `protocol` (0 through 4). Protocols 2 and up open
    /// with a `PROTO` opcode.
    pub fn new(protocol: u8) -> Self {
        let mut buf = Vec::new();
        if protocol >= 2 {
            buf.extend_from_slice(&[0x80, protocol]);
        }
        Self {
            buf,
            protocol,
            next_memo: 0,
        }
    }

    /// The protocol being written.
    pub fn protocol(&self) -> u8 {
        self.protocol
    }

    /// Append raw bytes.
    pub fn raw(&mut self, bytes: &[u8]) -> &mut Self {
        self.buf.extend_from_slice(bytes);
        self
    }

    fn op(&mut self, byte: u8) -> &mut Self {
        self.buf.push(byte);
        self
    }

    fn line(&mut self, byte: u8, text: &str) -> &mut Self {
        self.line_bytes(byte, text.as_bytes())
    }

    fn line_bytes(&mut self, byte: u8, data: &[u8]) -> &mut Self {
        self.buf.push(byte);
        self.buf.extend_from_slice(data);
        self.buf.push(b'\n');
        self
    }

    /// `None`.
    pub fn none(&mut self) -> &mut Self {
        self.op(b'N')
    }

    /// A boolean.
    pub fn bool(&mut self, value: bool) -> &mut Self {
        if self.protocol >= 2 {
            self.op(if value { 0x88 } else { 0x89 })
        } else {
            self.line(b'I', if value { "01" } else { "00" })
        }
    }

    /// An integer.
    pub fn int(&mut self, value: i64) -> &mut Self {
        if self.protocol == 0 {
            return self.line(b'I', &value.to_string());
        }
        match value {
            0..=0xff => self.op(b'K').raw(&[value as u8]),
            0x100..=0xffff => self.op(b'M').raw(&(value as u16).to_le_bytes()),
            _ if i32::try_from(value).is_ok() => self.op(b'J').raw(&(value as i32).to_le_bytes()),
            _ if self.protocol >= 2 => self.long_le(&minimal_le(value)),
            _ => self.line(b'L', &format!("{value}L")),
        }
    }

    /// An arbitrary integer as little-endian two's-complement bytes,
    /// written with `LONG1` or `LONG4`.
    pub fn long_le(&mut self, bytes: &[u8]) -> &mut Self {
        match u8::try_from(bytes.len()) {
            Ok(len) => self.op(0x8a).raw(&[len]),
            Err(_) => self.op(0x8b).raw(&(bytes.len() as i32).to_le_bytes()),
        };
        self.raw(bytes)
    }

    /// A float.
    pub fn float(&mut self, value: f64) -> &mut Self {
        if self.protocol == 0 {
            self.line(b'F', &format!("{value:?}"))
        } else {
            self.op(b'G').raw(&value.to_be_bytes())
        }
    }

    /// A text string.
    pub fn str(&mut self, text: &str) -> &mut Self {
        if self.protocol == 0 {
            return self.line_bytes(b'V', &raw_unicode_escape(text));
        }
        let bytes = text.as_bytes();
        match u8::try_from(bytes.len()) {
            Ok(len) if self.protocol >= 4 => self.op(0x8c).raw(&[len]),
            _ => self.op(b'X').raw(&(bytes.len() as u32).to_le_bytes()),
        };
        self.raw(bytes)
    }

    /// A byte string: `bytes` at protocol 3 and up, an 8-bit `str` below.
    pub fn bytes(&mut self, data: &[u8]) -> &mut Self {
        if self.protocol == 0 {
            return self.line(b'S', &quote(data));
        }
        let (short, long) = if self.protocol >= 3 { (b'C', b'B') } else { (b'U', b'T') };
        match u8::try_from(data.len()) {
            Ok(len) => self.op(short).raw(&[len]),
            Err(_) => self.op(long).raw(&(data.len() as u32).to_le_bytes()),
        };
        self.raw(data)
    }

    /// `MARK`.
    pub fn mark(&mut self) -> &mut Self {
        self.op(b'(')
    }

    /// An empty list.
    pub fn empty_list(&mut self) -> &mut Self {
        if self.protocol == 0 {
            self.mark().op(b'l')
        } else {
            self.op(b']')
        }
    }

    /// An empty dict.
    pub fn empty_dict(&mut self) -> &mut Self {
        if self.protocol == 0 {
            self.mark().op(b'd')
        } else {
            self.op(b'}')
        }
    }

    /// An empty tuple.
    pub fn empty_tuple(&mut self) -> &mut Self {
        if self.protocol == 0 {
            self.mark().op(b't')
        } else {
            self.op(b')')
        }
    }

    /// `LIST`: build a list from everything above the mark.
    pub fn list(&mut self) -> &mut Self {
        self.op(b'l')
    }

    /// `DICT`: build a dict from key/value pairs above the mark.
    pub fn dict(&mut self) -> &mut Self {
        self.op(b'd')
    }

    /// `TUPLE`: build a tuple from everything above the mark.
    pub fn tuple(&mut self) -> &mut Self {
        self.op(b't')
    }

    /// Build a tuple of the top `n` items, using `TUPLE1`..`TUPLE3` where
    /// the protocol allows. Larger tuples need a preceding [`Self::mark`].
    pub fn tuple_n(&mut self, n: usize) -> &mut Self {
        match n {
            0 => self.empty_tuple(),
            1..=3 if self.protocol >= 2 => self.op(0x84 + n as u8),
            _ => self.tuple(),
        }
    }

    /// `APPEND`.
    pub fn append(&mut self) -> &mut Self {
        self.op(b'a')
    }

    /// `APPENDS` (needs a mark).
    pub fn appends(&mut self) -> &mut Self {
        self.op(b'e')
    }

    /// `SETITEM`.
    pub fn setitem(&mut self) -> &mut Self {
        self.op(b's')
    }

    /// `SETITEMS` (needs a mark).
    pub fn setitems(&mut self) -> &mut Self {
        self.op(b'u')
    }

    /// `EMPTY_SET` (protocol 4).
    pub fn empty_set(&mut self) -> &mut Self {
        self.op(0x8f)
    }

    /// `ADDITEMS` (needs a mark).
    pub fn additems(&mut self) -> &mut Self {
        self.op(0x90)
    }

    /// `FROZENSET` (needs a mark).
    pub fn frozenset(&mut self) -> &mut Self {
        self.op(0x91)
    }

    /// A class reference: `STACK_GLOBAL` at protocol 4, `GLOBAL` below.
    pub fn global(&mut self, module: &str, name: &str) -> &mut Self {
        if self.protocol >= 4 {
            self.str(module).str(name).op(0x93)
        } else {
            self.line(b'c', &format!("{module}\n{name}"))
        }
    }

    /// `INST module name` (needs a mark).
    pub fn inst(&mut self, module: &str, name: &str) -> &mut Self {
        self.line(b'i', &format!("{module}\n{name}"))
    }

    /// `REDUCE`.
    pub fn reduce(&mut self) -> &mut Self {
        self.op(b'R')
    }

    /// `NEWOBJ`.
    pub fn newobj(&mut self) -> &mut Self {
        self.op(0x81)
    }

    /// `OBJ` (needs a mark).
    pub fn obj(&mut self) -> &mut Self {
        self.op(b'o')
    }

    /// `BUILD`.
    pub fn build(&mut self) -> &mut Self {
        self.op(b'b')
    }

    /// `DUP`.
    pub fn dup(&mut self) -> &mut Self {
        self.op(b'2')
    }

    /// `POP`.
    pub fn pop(&mut self) -> &mut Self {
        self.op(b'0')
    }

    /// Store the top of the stack under `handle`.
    pub fn put(&mut self, handle: u32) -> &mut Self {
        self.next_memo = self.next_memo.max(handle + 1);
        if self.protocol == 0 {
            return self.line(b'p', &handle.to_string());
        }
        match u8::try_from(handle) {
            Ok(h) => self.op(b'q').raw(&[h]),
            Err(_) => self.op(b'r').raw(&handle.to_le_bytes()),
        }
    }

    /// Store the top of the stack under the next free handle and return
    /// it. Uses `MEMOIZE` at protocol 4.
    pub fn memoize(&mut self) -> u32 {
        let handle = self.next_memo;
        if self.protocol >= 4 {
            self.next_memo += 1;
            self.op(0x94);
        } else {
            self.put(handle);
        }
        handle
    }

    /// Push the value stored under `handle`.
    pub fn get(&mut self, handle: u32) -> &mut Self {
        if self.protocol == 0 {
            return self.line(b'g', &handle.to_string());
        }
        match u8::try_from(handle) {
            Ok(h) => self.op(b'h').raw(&[h]),
            Err(_) => self.op(b'j').raw(&handle.to_le_bytes()),
        }
    }

    /// A reference to another stored object by id.
    pub fn persistent(&mut self, object_id: u64) -> &mut Self {
        self.bytes(&object_id.to_be_bytes()).op(b'Q')
    }

    /// A reference to another stored object with a class hint.
    pub fn persistent_with_class(&mut self, object_id: u64, module: &str, name: &str) -> &mut Self {
        self.bytes(&object_id.to_be_bytes())
            .global(module, name)
            .tuple_n(2)
            .op(b'Q')
    }

    /// `STOP` without finishing, for records made of several pickles.
    pub fn stop(&mut self) -> &mut Self {
        self.op(b'.')
    }

    /// Appends `STOP` and returns the stream.
    pub fn finish(&mut self) -> Vec<u8> {
        self.stop();
        std::mem::take(&mut self.buf)
    }

    /// Returns the stream as written so far.
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

fn minimal_le(value: i64) -> Vec<u8> {
    let mut bytes = value.to_le_bytes().to_vec();
    while bytes.len() > 1 {
        let last = bytes[bytes.len() - 1];
        let sign = bytes[bytes.len() - 2] & 0x80;
        if (last == 0 && sign == 0) || (last == 0xff && sign != 0) {
            bytes.pop();
        } else {
            break;
        }
    }
    bytes
}

/// Encodes text as `raw-unicode-escape`: Latin-1 bytes, escapes above.
fn raw_unicode_escape(text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(text.len());
    for c in text.chars() {
        let code = c as u32;
        match c {
            '\\' | '\n' | '\r' => out.extend_from_slice(format!("\\u{code:04x}").as_bytes()),
            _ if code < 0x100 => out.push(code as u8),
            _ if code <= 0xffff => out.extend_from_slice(format!("\\u{code:04x}").as_bytes()),
            _ => out.extend_from_slice(format!("\\U{code:08x}").as_bytes()),
        }
    }
    out
}

fn quote(data: &[u8]) -> String {
    let mut out = String::from("'");
    for &b in data {
        match b {
            b'\\' => out.push_str("\\\\"),
            b'\'' => out.push_str("\\'"),
            0x20..=0x7e => out.push(char::from(b)),
            _ => out.push_str(&format!("\\x{b:02x}")),
        }
    }
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_2_dict_matches_stdlib_pickler() {
        // pickle.dumps({'a': 1}, 2) with the memo entry for 'a' dropped
        let mut w = PickleWriter::new(2);
        w.empty_dict();
        w.memoize();
        w.str("a").int(1).setitem();
        assert_eq!(w.finish(), b"\x80\x02}q\x00X\x01\x00\x00\x00aK\x01s.".to_vec());
    }

    #[test]
    fn protocol_0_uses_text_opcodes() {
        let mut w = PickleWriter::new(0);
        w.mark().int(1).str("\u{e9}\\").list();
        assert_eq!(w.finish(), b"(I1\nV\xe9\\u005c\nl.".to_vec());
    }

    #[test]
    fn protocol_4_memoizes_and_stack_globals() {
        let mut w = PickleWriter::new(4);
        w.global("app", "Doc");
        assert_eq!(w.memoize(), 0);
        assert_eq!(w.memoize(), 1);
        assert_eq!(
            w.finish(),
            b"\x80\x04\x8c\x03app\x8c\x03Doc\x93\x94\x94.".to_vec()
        );
    }

    #[test]
    fn minimal_two_complement() {
        assert_eq!(minimal_le(1 << 40), vec![0, 0, 0, 0, 0, 1]);
        assert_eq!(minimal_le(-(1 << 40)), vec![0, 0, 0, 0, 0, 0xff]);
        assert_eq!(minimal_le(0x80 << 32), vec![0, 0, 0, 0, 0x80, 0]);
    }
}
