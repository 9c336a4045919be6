//! Low-level opcode cursor.
//!
//! [`FormatReader`] walks a byte buffer and yields one [`Instruction`] per
//! opcode with its argument already decoded. It knows nothing about the
//! stack machine; it only understands how each opcode's argument is laid
//! out on the wire.

use crate::error::{CodecError, CodecResult};
use crate::number::Integer;
use crate::opcode::{ArgKind, Opcode};

/// Maximum length accepted for a single string or bytes argument.
/// Guards against allocation blowups from corrupt length prefixes.
const MAX_ARG_LENGTH: u64 = 256 * 1024 * 1024;

/// A decoded opcode argument.
#[derive(Debug, Clone, PartialEq)]
pub enum Arg<'a> {
    /// The opcode takes no argument.
    None,
    /// Protocol 0 boolean (`INT` with `00` or `01`).
    Bool(bool),
    /// An integer of any width.
    Int(Integer),
    /// A double.
    Float(f64),
    /// Raw bytes (BINBYTES family).
    Bytes(&'a [u8]),
    /// Text: unicode opcodes, Latin-1 decoded 8-bit strings, raw lines.
    Text(String),
    /// Module and qualified name (GLOBAL, INST).
    Pair(String, String),
}

/// One opcode with its argument and position.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction<'a> {
    /// The opcode.
    pub opcode: Opcode,
    /// Its decoded argument.
    pub arg: Arg<'a>,
    /// Byte offset of the opcode within the buffer.
    pub offset: usize,
}

/// Cursor over a pickle byte buffer.
pub struct FormatReader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> FormatReader<'a> {
    /// Creates a reader positioned at the start of `data`.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Current byte position (just past the last returned instruction).
    pub fn position(&self) -> usize {
        self.pos
    }

    /// Returns true once every byte has been consumed.
    pub fn is_empty(&self) -> bool {
        self.pos >= self.data.len()
    }

    /// The underlying buffer.
    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    /// Reads the next instruction, or `None` at the end of the buffer.
    pub fn next_instruction(&mut self) -> CodecResult<Option<Instruction<'a>>> {
        if self.is_empty() {
            return Ok(None);
        }
        let offset = self.pos;
        let byte = self.read_byte()?;
        let opcode = Opcode::from_byte(byte)
            .ok_or_else(|| CodecError::unsupported_opcode(format!("0x{byte:02x}"), offset))?;
        let arg = self.read_arg(opcode, offset)?;
        Ok(Some(Instruction {
            opcode,
            arg,
            offset,
        }))
    }

    fn read_arg(&mut self, opcode: Opcode, offset: usize) -> CodecResult<Arg<'a>> {
        let name = opcode.name();
        let arg = match opcode.arg_kind() {
            ArgKind::None => Arg::None,
            ArgKind::U1 => Arg::Int(i64::from(self.read_byte()?).into()),
            ArgKind::U2 => {
                let b = self.read_array::<2>()?;
                Arg::Int(i64::from(u16::from_le_bytes(b)).into())
            }
            ArgKind::I4 => {
                let b = self.read_array::<4>()?;
                Arg::Int(i64::from(i32::from_le_bytes(b)).into())
            }
            ArgKind::U4 => {
                let b = self.read_array::<4>()?;
                Arg::Int(i64::from(u32::from_le_bytes(b)).into())
            }
            ArgKind::U8 => {
                let b = self.read_array::<8>()?;
                let value = u64::from_le_bytes(b);
                let value = i64::try_from(value)
                    .map_err(|_| CodecError::invalid_argument(name, offset, "length overflow"))?;
                Arg::Int(value.into())
            }
            ArgKind::F8 => Arg::Float(f64::from_be_bytes(self.read_array::<8>()?)),
            ArgKind::DecimalShort => {
                let line = self.read_line_str(name, offset)?;
                match line {
                    "00" => Arg::Bool(false),
                    "01" => Arg::Bool(true),
                    _ => Arg::Int(parse_int(line, name, offset)?),
                }
            }
            ArgKind::DecimalLong => {
                let line = self.read_line_str(name, offset)?;
                let line = line.strip_suffix('L').unwrap_or(line);
                Arg::Int(parse_int(line, name, offset)?)
            }
            ArgKind::FloatLine => {
                let line = self.read_line_str(name, offset)?;
                let value = line
                    .trim()
                    .parse::<f64>()
                    .map_err(|e| CodecError::invalid_argument(name, offset, e.to_string()))?;
                Arg::Float(value)
            }
            ArgKind::QuotedLine => {
                let line = self.read_line()?;
                Arg::Text(unquote_string(line, name, offset)?)
            }
            ArgKind::UnicodeLine => {
                let line = self.read_line()?;
                Arg::Text(decode_raw_unicode_escape(line))
            }
            ArgKind::RawLine => Arg::Text(latin1(self.read_line()?)),
            ArgKind::LinePair => {
                let module = latin1(self.read_line()?);
                let qualname = latin1(self.read_line()?);
                Arg::Pair(module, qualname)
            }
            ArgKind::Bytes1 => {
                let len = u64::from(self.read_byte()?);
                self.read_sized(opcode, len, offset)?
            }
            ArgKind::BytesI4 => {
                let len = i32::from_le_bytes(self.read_array::<4>()?);
                let len = u64::try_from(len)
                    .map_err(|_| CodecError::invalid_argument(name, offset, "negative length"))?;
                self.read_sized(opcode, len, offset)?
            }
            ArgKind::BytesU4 => {
                let len = u64::from(u32::from_le_bytes(self.read_array::<4>()?));
                self.read_sized(opcode, len, offset)?
            }
            ArgKind::BytesU8 => {
                let len = u64::from_le_bytes(self.read_array::<8>()?);
                self.read_sized(opcode, len, offset)?
            }
            ArgKind::Long1 => {
                let len = u64::from(self.read_byte()?);
                let bytes = self.read_bytes(len, name, offset)?;
                Arg::Int(Integer::from_le_twos_complement(bytes))
            }
            ArgKind::Long4 => {
                let len = i32::from_le_bytes(self.read_array::<4>()?);
                let len = u64::try_from(len)
                    .map_err(|_| CodecError::invalid_argument(name, offset, "negative length"))?;
                let bytes = self.read_bytes(len, name, offset)?;
                Arg::Int(Integer::from_le_twos_complement(bytes))
            }
        };
        Ok(arg)
    }

    /// Reads a length-prefixed payload and interprets it per opcode.
    fn read_sized(&mut self, opcode: Opcode, len: u64, offset: usize) -> CodecResult<Arg<'a>> {
        let name = opcode.name();
        let bytes = self.read_bytes(len, name, offset)?;
        match opcode {
            Opcode::BINSTRING | Opcode::SHORT_BINSTRING => Ok(Arg::Text(latin1(bytes))),
            Opcode::BINUNICODE | Opcode::SHORT_BINUNICODE | Opcode::BINUNICODE8 => {
                let text = decode_utf8_surrogates(bytes)
                    .ok_or_else(|| CodecError::invalid_argument(name, offset, "invalid UTF-8"))?;
                Ok(Arg::Text(text))
            }
            _ => Ok(Arg::Bytes(bytes)),
        }
    }

    #[inline]
    fn read_byte(&mut self) -> CodecResult<u8> {
        let byte = *self
            .data
            .get(self.pos)
            .ok_or(CodecError::UnexpectedEof { offset: self.pos })?;
        self.pos += 1;
        Ok(byte)
    }

    #[inline]
    fn read_array<const N: usize>(&mut self) -> CodecResult<[u8; N]> {
        let end = self.pos + N;
        let slice = self
            .data
            .get(self.pos..end)
            .ok_or(CodecError::UnexpectedEof { offset: self.data.len() })?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        self.pos = end;
        Ok(out)
    }

    fn read_bytes(&mut self, len: u64, name: &'static str, offset: usize) -> CodecResult<&'a [u8]> {
        if len > MAX_ARG_LENGTH {
            return Err(CodecError::invalid_argument(
                name,
                offset,
                format!("length {len} exceeds limit"),
            ));
        }
        let len = usize::try_from(len)
            .map_err(|_| CodecError::invalid_argument(name, offset, "length overflow"))?;
        let end = self.pos.checked_add(len).filter(|&end| end <= self.data.len()).ok_or(
            CodecError::UnexpectedEof {
                offset: self.data.len(),
            },
        )?;
        let bytes = &self.data[self.pos..end];
        self.pos = end;
        Ok(bytes)
    }

    /// Reads through the next newline, returning the line without it.
    fn read_line(&mut self) -> CodecResult<&'a [u8]> {
        let rest = &self.data[self.pos..];
        let Some(newline) = rest.iter().position(|&b| b == b'\n') else {
            return Err(CodecError::UnexpectedEof {
                offset: self.data.len(),
            });
        };
        let line = &rest[..newline];
        self.pos += newline + 1;
        Ok(line)
    }

    fn read_line_str(&mut self, name: &'static str, offset: usize) -> CodecResult<&'a str> {
        let line = self.read_line()?;
        std::str::from_utf8(line)
            .map_err(|_| CodecError::invalid_argument(name, offset, "non-ASCII numeric argument"))
    }
}

impl<'a> Iterator for FormatReader<'a> {
    type Item = CodecResult<Instruction<'a>>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_instruction().transpose()
    }
}

fn parse_int(text: &str, name: &'static str, offset: usize) -> CodecResult<Integer> {
    Integer::parse_decimal(text.trim())
        .ok_or_else(|| CodecError::invalid_argument(name, offset, format!("bad integer {text:?}")))
}

/// Decodes bytes as Latin-1, which maps every byte to a code point.
pub(crate) fn latin1(bytes: &[u8]) -> String {
    bytes.iter().map(|&b| char::from(b)).collect()
}

/// Decodes UTF-8 that may contain encoded surrogates.
///
/// Each three-byte surrogate encoding (`ED A0..BF xx`) becomes a single
/// space; any other invalid sequence fails.
pub(crate) fn decode_utf8_surrogates(bytes: &[u8]) -> Option<String> {
    let mut out = String::with_capacity(bytes.len());
    let mut rest = bytes;
    loop {
        match std::str::from_utf8(rest) {
            Ok(valid) => {
                out.push_str(valid);
                return Some(out);
            }
            Err(err) => {
                let (valid, tail) = rest.split_at(err.valid_up_to());
                // The prefix was just validated.
                out.push_str(std::str::from_utf8(valid).ok()?);
                match tail {
                    [0xed, 0xa0..=0xbf, 0x80..=0xbf, ..] => {
                        out.push(' ');
                        rest = &tail[3..];
                    }
                    _ => return None,
                }
            }
        }
    }
}

/// Strips the quotes from a protocol 0 `STRING` argument and resolves its
/// backslash escapes, yielding Latin-1 text.
fn unquote_string(line: &[u8], name: &'static str, offset: usize) -> CodecResult<String> {
    let inner = match line {
        [q @ (b'\'' | b'"'), inner @ .., last] if last == q => inner,
        _ => {
            return Err(CodecError::invalid_argument(
                name,
                offset,
                "string argument is not quoted",
            ))
        }
    };

    let mut out = Vec::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        let b = inner[i];
        if b != b'\\' || i + 1 == inner.len() {
            out.push(b);
            i += 1;
            continue;
        }
        let esc = inner[i + 1];
        i += 2;
        match esc {
            b'\n' => {}
            b'\\' => out.push(b'\\'),
            b'\'' => out.push(b'\''),
            b'"' => out.push(b'"'),
            b'a' => out.push(0x07),
            b'b' => out.push(0x08),
            b'f' => out.push(0x0c),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'v' => out.push(0x0b),
            b'x' => {
                let hex = inner
                    .get(i..i + 2)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u8::from_str_radix(h, 16).ok())
                    .ok_or_else(|| CodecError::invalid_argument(name, offset, "bad \\x escape"))?;
                out.push(hex);
                i += 2;
            }
            b'0'..=b'7' => {
                let mut value = u32::from(esc - b'0');
                let mut taken = 0;
                while taken < 2 && i < inner.len() && (b'0'..=b'7').contains(&inner[i]) {
                    value = value * 8 + u32::from(inner[i] - b'0');
                    i += 1;
                    taken += 1;
                }
                #[allow(clippy::cast_possible_truncation)]
                out.push((value & 0xff) as u8);
            }
            other => {
                out.push(b'\\');
                out.push(other);
            }
        }
    }
    Ok(latin1(&out))
}

/// Decodes `raw-unicode-escape` text: `\uXXXX` and `\UXXXXXXXX` escapes,
/// every other byte taken as Latin-1. Surrogate escapes become a space.
fn decode_raw_unicode_escape(line: &[u8]) -> String {
    let mut out = String::with_capacity(line.len());
    let mut i = 0;
    while i < line.len() {
        let b = line[i];
        if b == b'\\' && i + 1 < line.len() {
            let width = match line[i + 1] {
                b'u' => Some(4),
                b'U' => Some(8),
                _ => None,
            };
            if let Some(width) = width {
                let code = line
                    .get(i + 2..i + 2 + width)
                    .and_then(|h| std::str::from_utf8(h).ok())
                    .and_then(|h| u32::from_str_radix(h, 16).ok());
                if let Some(code) = code {
                    out.push(char::from_u32(code).unwrap_or(' '));
                    i += 2 + width;
                    continue;
                }
            }
        }
        out.push(char::from(b));
        i += 1;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(data: &[u8]) -> Vec<Instruction<'_>> {
        FormatReader::new(data).collect::<CodecResult<Vec<_>>>().unwrap()
    }

    #[test]
    fn reads_binary_arguments_with_offsets() {
        let data = [0x80, 0x03, b'K', 0x07, b'M', 0x00, 0x01, b'.'];
        let ops = collect(&data);
        assert_eq!(ops.len(), 4);
        assert_eq!(ops[0].opcode, Opcode::PROTO);
        assert_eq!(ops[1].arg, Arg::Int(Integer::Small(7)));
        assert_eq!(ops[2].arg, Arg::Int(Integer::Small(256)));
        assert_eq!(ops[2].offset, 4);
        assert_eq!(ops[3].opcode, Opcode::STOP);
        assert_eq!(ops[3].offset, 7);
    }

    #[test]
    fn reads_text_arguments() {
        let data = b"I01\nI42\nL123456789012345678901234L\nF1.5\nS'a\\nb\\x41'\ncmod\nName\n.";
        let ops = collect(data);
        assert_eq!(ops[0].arg, Arg::Bool(true));
        assert_eq!(ops[1].arg, Arg::Int(Integer::Small(42)));
        assert_eq!(
            ops[2].arg,
            Arg::Int(Integer::Big("123456789012345678901234".into()))
        );
        assert_eq!(ops[3].arg, Arg::Float(1.5));
        assert_eq!(ops[4].arg, Arg::Text("a\nbA".into()));
        assert_eq!(ops[5].arg, Arg::Pair("mod".into(), "Name".into()));
    }

    #[test]
    fn unicode_line_escapes() {
        let data = b"V\\ua000\\u000a\\ud800x\n.";
        let ops = collect(data);
        assert_eq!(ops[0].arg, Arg::Text("\u{a000}\n x".into()));
    }

    #[test]
    fn binunicode_surrogates_become_spaces() {
        let mut data = vec![0x8c, 5];
        data.extend_from_slice(&[b'a', 0xed, 0xa0, 0x80, b'b']);
        data.push(b'.');
        let ops = collect(&data);
        assert_eq!(ops[0].arg, Arg::Text("a b".into()));
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        let data = [0x8c, 2, 0xff, 0xfe, b'.'];
        let err = FormatReader::new(&data).next_instruction().unwrap_err();
        assert!(matches!(err, CodecError::InvalidArgument { opcode: "SHORT_BINUNICODE", offset: 0, .. }));
    }

    #[test]
    fn unknown_byte_reports_offset() {
        let data = [b'N', 0xff];
        let mut reader = FormatReader::new(&data);
        assert!(reader.next_instruction().unwrap().is_some());
        assert_eq!(
            reader.next_instruction(),
            Err(CodecError::unsupported_opcode("0xff", 1))
        );
    }

    #[test]
    fn truncated_argument_is_eof() {
        let data = [b'X', 10, 0, 0, 0, b'a'];
        assert!(matches!(
            FormatReader::new(&data).next_instruction(),
            Err(CodecError::UnexpectedEof { .. })
        ));
        assert!(matches!(
            FormatReader::new(b"I12").next_instruction(),
            Err(CodecError::UnexpectedEof { .. })
        ));
    }
}
