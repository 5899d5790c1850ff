use super::Endian;
use crate::core::error::{ResError, Result};
use byteorder::{BigEndian, LittleEndian, WriteBytesExt};
use std::io::{Seek, SeekFrom, Write};

macro_rules! write_primitive {
    ($name:ident, $ty:ty, $write:ident, $size:expr) => {
        pub fn $name(&mut self, value: $ty) -> Result<()> {
            match self.endian {
                Endian::Little => self.inner.$write::<LittleEndian>(value)?,
                Endian::Big => self.inner.$write::<BigEndian>(value)?,
            }
            self.position += $size;
            Ok(())
        }
    };
}

/// Sequential writer mirroring [`super::ExtDataInput`].
pub struct ExtDataOutput<W> {
    inner: W,
    position: u64,
    endian: Endian,
}

impl<W: Write> ExtDataOutput<W> {
    pub fn new(inner: W, endian: Endian) -> Self {
        Self {
            inner,
            position: 0,
            endian,
        }
    }

    pub fn little_endian(inner: W) -> Self {
        Self::new(inner, Endian::Little)
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn into_inner(self) -> W {
        self.inner
    }

    pub fn write_u8(&mut self, value: u8) -> Result<()> {
        self.inner.write_u8(value)?;
        self.position += 1;
        Ok(())
    }

    pub fn write_i8(&mut self, value: i8) -> Result<()> {
        self.write_u8(value as u8)
    }

    write_primitive!(write_u16, u16, write_u16, 2);
    write_primitive!(write_i16, i16, write_i16, 2);
    write_primitive!(write_u32, u32, write_u32, 4);
    write_primitive!(write_i32, i32, write_i32, 4);
    write_primitive!(write_u64, u64, write_u64, 8);
    write_primitive!(write_i64, i64, write_i64, 8);
    write_primitive!(write_f32, f32, write_f32, 4);
    write_primitive!(write_f64, f64, write_f64, 8);

    pub fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.inner.write_all(bytes)?;
        self.position += bytes.len() as u64;
        Ok(())
    }

    pub fn write_zeros(&mut self, count: usize) -> Result<()> {
        self.write_bytes(&vec![0; count])
    }

    /// Pad with zeros up to the next multiple of `alignment`.
    pub fn align(&mut self, alignment: u64) -> Result<()> {
        while self.position % alignment != 0 {
            self.write_u8(0)?;
        }
        Ok(())
    }

    /// Write `s` into a fixed field of `len` UTF-16 units, NUL padded.
    pub fn write_utf16_fixed(&mut self, s: &str, len: usize) -> Result<()> {
        let units: Vec<u16> = s.encode_utf16().collect();
        if units.len() >= len {
            return Err(ResError::EncodingSizeMismatch {
                what: format!("string `{}`", s),
                size: units.len() as u64 + 1,
                max: len as u64,
            });
        }
        for unit in &units {
            self.write_u16(*unit)?;
        }
        for _ in units.len()..len {
            self.write_u16(0)?;
        }
        Ok(())
    }
}

impl<W: Write + Seek> ExtDataOutput<W> {
    /// Overwrite a previously written `u32` and return to the current end.
    pub fn patch_u32(&mut self, at: u64, value: u32) -> Result<()> {
        let end = self.position;
        self.inner.seek(SeekFrom::Start(at))?;
        self.position = at;
        self.write_u32(value)?;
        self.inner.seek(SeekFrom::Start(end))?;
        self.position = end;
        Ok(())
    }

    pub fn patch_u16(&mut self, at: u64, value: u16) -> Result<()> {
        let end = self.position;
        self.inner.seek(SeekFrom::Start(at))?;
        self.position = at;
        self.write_u16(value)?;
        self.inner.seek(SeekFrom::Start(end))?;
        self.position = end;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::stream::ExtDataInput;
    use std::io::Cursor;

    #[test]
    fn patches_leave_position_at_end() {
        let mut out = ExtDataOutput::little_endian(Cursor::new(Vec::new()));
        out.write_u32(0).unwrap();
        out.write_u16(0xbeef).unwrap();
        out.patch_u32(0, 6).unwrap();
        assert_eq!(out.position(), 6);
        out.write_u8(1).unwrap();
        let bytes = out.into_inner().into_inner();
        assert_eq!(bytes, vec![6, 0, 0, 0, 0xef, 0xbe, 1]);
    }

    #[test]
    fn fixed_utf16_round_trips_through_input() {
        let mut out = ExtDataOutput::little_endian(Cursor::new(Vec::new()));
        out.write_utf16_fixed("android", 128).unwrap();
        assert_eq!(out.position(), 256);
        let bytes = out.into_inner().into_inner();
        let mut input = ExtDataInput::little_endian(Cursor::new(&bytes[..]));
        assert_eq!(input.read_utf16(128).unwrap(), "android");
        assert_eq!(input.position(), 256);
    }

    #[test]
    fn fixed_utf16_rejects_overlong_names() {
        let mut out = ExtDataOutput::little_endian(Cursor::new(Vec::new()));
        let name = "x".repeat(128);
        assert!(matches!(
            out.write_utf16_fixed(&name, 128),
            Err(ResError::EncodingSizeMismatch { .. })
        ));
    }

    #[test]
    fn big_endian_output() {
        let mut out = ExtDataOutput::new(Vec::new(), Endian::Big);
        out.write_u16(0x0102).unwrap();
        out.write_i32(-2).unwrap();
        assert_eq!(out.into_inner(), vec![1, 2, 0xff, 0xff, 0xff, 0xfe]);
    }
}
