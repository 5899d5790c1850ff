use super::chunk::{input_at, ChunkHeader, ChunkType, ChunkWriter};
use crate::core::diagnostics::{Diagnostics, Warning};
use crate::core::error::{ResError, Result};
use crate::core::stream::{ExtDataInput, ExtDataOutput};
use serde::{Deserialize, Serialize};
use std::io::{Seek, Write};

const SORTED_FLAG: u32 = 1 << 0;
const UTF8_FLAG: u32 = 1 << 8;
const SPAN_END: u32 = 0xffff_ffff;
const HEADER_SIZE: u16 = 28;

/// A styled range inside a pooled string.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct Span {
    /// Pool index of the tag name, e.g. `b`.
    pub name: u32,
    pub first_char: u32,
    pub last_char: u32,
}

/// An indexed list of strings shared by a table, a package or an XML document.
///
/// Duplicates are kept; indices are what the rest of the file refers to.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct StringPool {
    #[serde(default)]
    pub utf8: bool,
    #[serde(default)]
    pub sorted: bool,
    /// Flag bits other than UTF-8 and sorted, written back as read.
    #[serde(default, skip_serializing_if = "is_zero")]
    pub extra_flags: u32,
    pub strings: Vec<String>,
    /// `styles[i]` applies to `strings[i]`.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub styles: Vec<Vec<Span>>,
}

fn is_zero(flags: &u32) -> bool {
    *flags == 0
}

impl StringPool {
    pub fn new(utf8: bool) -> Self {
        Self {
            utf8,
            ..Self::default()
        }
    }

    pub fn get(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    pub fn position(&self, s: &str) -> Option<u32> {
        self.strings.iter().position(|x| x == s).map(|i| i as u32)
    }

    /// Append a string and return its index. Existing entries are not reused.
    pub fn push(&mut self, s: impl Into<String>) -> u32 {
        self.strings.push(s.into());
        (self.strings.len() - 1) as u32
    }

    pub fn len(&self) -> usize {
        self.strings.len()
    }

    pub fn is_empty(&self) -> bool {
        self.strings.is_empty()
    }

    pub fn decode(data: &[u8], header: &ChunkHeader, diag: &mut Diagnostics) -> Result<Self> {
        if header.header_size < HEADER_SIZE {
            return Err(header.malformed(format!(
                "string pool header is {} bytes, expected {}",
                header.header_size, HEADER_SIZE
            )));
        }
        let mut r = header.body(data)?;
        let string_count = r.read_u32()?;
        let style_count = r.read_u32()?;
        let flags = r.read_u32()?;
        let strings_start = r.read_u32()?;
        let styles_start = r.read_u32()?;
        let utf8 = flags & UTF8_FLAG != 0;
        let sorted = flags & SORTED_FLAG != 0;
        let chunk_end = header.end();

        let strings_pos = header.offset + strings_start as u64;
        let styles_pos = header.offset + styles_start as u64;
        if strings_start != 0 && strings_pos > chunk_end {
            return Err(header.malformed(format!(
                "strings start {} lies past the chunk end",
                strings_start
            )));
        }
        let offsets_limit = if strings_start != 0 {
            strings_pos
        } else if style_count != 0 {
            styles_pos
        } else {
            chunk_end
        };

        r.jump_to(header.header_end())?;
        let string_offsets = r.read_safe_u32_array(string_count as usize, offsets_limit, diag)?;
        let style_offsets = if style_count != 0 {
            r.read_safe_u32_array(style_count as usize, offsets_limit, diag)?
        } else {
            Vec::new()
        };

        let strings_end = if style_count != 0 && styles_start != 0 && styles_pos <= chunk_end {
            styles_pos
        } else {
            chunk_end
        };
        let mut strings = Vec::with_capacity(string_offsets.len());
        for (index, offset) in string_offsets.iter().enumerate() {
            let at = strings_pos + *offset as u64;
            let s = if utf8 {
                decode_utf8(data, at, strings_end, index, diag)
            } else {
                decode_utf16(data, at, strings_end, index, diag)
            }
            .map_err(|err| match err {
                ResError::Truncated { position, .. } => header.malformed(format!(
                    "string {} at offset {} runs past the string data ({})",
                    index, position, strings_end
                )),
                other => other,
            })?;
            strings.push(s);
        }

        let mut styles = Vec::with_capacity(style_offsets.len());
        for offset in &style_offsets {
            let mut r = input_at(data, styles_pos + *offset as u64, chunk_end)?;
            let mut spans = Vec::new();
            loop {
                let name = r.read_u32()?;
                if name == SPAN_END {
                    break;
                }
                let first_char = r.read_u32()?;
                let last_char = r.read_u32()?;
                spans.push(Span {
                    name,
                    first_char,
                    last_char,
                });
            }
            styles.push(spans);
        }

        log::trace!(
            "string pool at {}: {} strings, {} styles, utf8={}",
            header.offset,
            strings.len(),
            styles.len(),
            utf8
        );
        Ok(Self {
            utf8,
            sorted,
            extra_flags: flags & !(UTF8_FLAG | SORTED_FLAG),
            strings,
            styles,
        })
    }

    pub fn write<W: Write + Seek>(&self, w: &mut ExtDataOutput<W>) -> Result<()> {
        let mut chunk = ChunkWriter::start_chunk(ChunkType::StringPool as u16, w)?;
        let start = chunk.start();
        let fields = w.position();
        let mut flags = self.extra_flags & !(UTF8_FLAG | SORTED_FLAG);
        if self.utf8 {
            flags |= UTF8_FLAG;
        }
        if self.sorted {
            flags |= SORTED_FLAG;
        }
        w.write_u32(self.strings.len() as u32)?;
        w.write_u32(self.styles.len() as u32)?;
        w.write_u32(flags)?;
        w.write_u32(0)?;
        w.write_u32(0)?;
        chunk.end_header(w)?;

        let offsets = w.position();
        w.write_zeros(4 * (self.strings.len() + self.styles.len()))?;

        let strings_start = w.position();
        let mut string_offsets = Vec::with_capacity(self.strings.len());
        for s in &self.strings {
            string_offsets.push((w.position() - strings_start) as u32);
            if self.utf8 {
                encode_utf8(w, s)?;
            } else {
                encode_utf16(w, s)?;
            }
        }
        w.align(4)?;

        let mut style_offsets = Vec::with_capacity(self.styles.len());
        let styles_start = w.position();
        if !self.styles.is_empty() {
            for spans in &self.styles {
                style_offsets.push((w.position() - styles_start) as u32);
                for span in spans {
                    w.write_u32(span.name)?;
                    w.write_u32(span.first_char)?;
                    w.write_u32(span.last_char)?;
                }
                w.write_u32(SPAN_END)?;
            }
            w.write_u32(SPAN_END)?;
            w.write_u32(SPAN_END)?;
        }
        chunk.end_chunk(w)?;

        w.patch_u32(fields + 12, (strings_start - start) as u32)?;
        let styles_field = if self.styles.is_empty() {
            0
        } else {
            (styles_start - start) as u32
        };
        w.patch_u32(fields + 16, styles_field)?;
        for (i, offset) in string_offsets.iter().chain(style_offsets.iter()).enumerate() {
            w.patch_u32(offsets + 4 * i as u64, *offset)?;
        }
        Ok(())
    }
}

fn decode_utf8(
    data: &[u8],
    at: u64,
    end: u64,
    index: usize,
    diag: &mut Diagnostics,
) -> Result<String> {
    let mut r = input_at(data, at, end)?;
    let _char_len = read_utf8_len(&mut r)?;
    let byte_len = read_utf8_len(&mut r)?;
    let bytes = r.read_bytes(byte_len)?;
    match String::from_utf8(bytes) {
        Ok(s) => Ok(s),
        Err(err) => {
            diag.warn(Warning::InvalidString {
                index,
                reason: err.utf8_error().to_string(),
            });
            Ok(String::from_utf8_lossy(err.as_bytes()).into_owned())
        }
    }
}

fn read_utf8_len(r: &mut ExtDataInput<&[u8]>) -> Result<usize> {
    let first = r.read_u8()? as usize;
    if first & 0x80 != 0 {
        let second = r.read_u8()? as usize;
        Ok(((first & 0x7f) << 8) | second)
    } else {
        Ok(first)
    }
}

fn decode_utf16(
    data: &[u8],
    at: u64,
    end: u64,
    index: usize,
    diag: &mut Diagnostics,
) -> Result<String> {
    let mut r = input_at(data, at, end)?;
    let first = r.read_u16()? as usize;
    let len = if first & 0x8000 != 0 {
        let second = r.read_u16()? as usize;
        ((first & 0x7fff) << 16) | second
    } else {
        first
    };
    let mut units = Vec::with_capacity(len);
    for _ in 0..len {
        units.push(r.read_u16()?);
    }
    match String::from_utf16(&units) {
        Ok(s) => Ok(s),
        Err(err) => {
            diag.warn(Warning::InvalidString {
                index,
                reason: err.to_string(),
            });
            Ok(String::from_utf16_lossy(&units))
        }
    }
}

fn encode_utf8<W: Write>(w: &mut ExtDataOutput<W>, s: &str) -> Result<()> {
    let char_len = s.encode_utf16().count();
    let byte_len = s.len();
    for (what, len) in [("UTF-16 length", char_len), ("UTF-8 length", byte_len)] {
        if len > 0x7fff {
            return Err(ResError::EncodingSizeMismatch {
                what: format!("{} of pooled string", what),
                size: len as u64,
                max: 0x7fff,
            });
        }
        if len > 0x7f {
            w.write_u8(((len >> 8) as u8 & 0x7f) | 0x80)?;
            w.write_u8(len as u8)?;
        } else {
            w.write_u8(len as u8)?;
        }
    }
    w.write_bytes(s.as_bytes())?;
    w.write_u8(0)
}

fn encode_utf16<W: Write>(w: &mut ExtDataOutput<W>, s: &str) -> Result<()> {
    let units: Vec<u16> = s.encode_utf16().collect();
    let len = units.len();
    if len > 0x7fff_ffff {
        return Err(ResError::EncodingSizeMismatch {
            what: "pooled string".to_string(),
            size: len as u64,
            max: 0x7fff_ffff,
        });
    }
    if len > 0x7fff {
        w.write_u16(((len >> 16) as u16 & 0x7fff) | 0x8000)?;
        w.write_u16(len as u16)?;
    } else {
        w.write_u16(len as u16)?;
    }
    for unit in units {
        w.write_u16(unit)?;
    }
    w.write_u16(0)
}
