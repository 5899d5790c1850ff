use super::Endian;
use crate::core::diagnostics::{Diagnostics, Warning};
use crate::core::error::{eof_as_truncated, ResError, Result};
use byteorder::{BigEndian, LittleEndian, ReadBytesExt};
use std::io::{self, Read};

macro_rules! read_primitive {
    ($(#[$doc:meta])* $name:ident, $ty:ty, $read:ident, $size:expr) => {
        $(#[$doc])*
        pub fn $name(&mut self) -> Result<$ty> {
            let value = match self.endian {
                Endian::Little => self.inner.$read::<LittleEndian>(),
                Endian::Big => self.inner.$read::<BigEndian>(),
            }
            .map_err(|e| eof_as_truncated(e, stringify!($ty), self.position))?;
            self.position += $size;
            Ok(value)
        }
    };
}

/// Sequential reader that knows how many bytes it has consumed.
///
/// The position only ever moves forward: [`ExtDataInput::jump_to`] skips
/// ahead and refuses to go back.
pub struct ExtDataInput<R> {
    inner: R,
    position: u64,
    endian: Endian,
}

impl<R: Read> ExtDataInput<R> {
    pub fn new(inner: R, endian: Endian) -> Self {
        Self::at(inner, endian, 0)
    }

    pub fn little_endian(inner: R) -> Self {
        Self::new(inner, Endian::Little)
    }

    pub fn big_endian(inner: R) -> Self {
        Self::new(inner, Endian::Big)
    }

    /// A reader whose first byte sits at `position` of some larger stream.
    pub fn at(inner: R, endian: Endian, position: u64) -> Self {
        Self {
            inner,
            position,
            endian,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    pub fn into_inner(self) -> R {
        self.inner
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        let value = self
            .inner
            .read_u8()
            .map_err(|e| eof_as_truncated(e, "u8", self.position))?;
        self.position += 1;
        Ok(value)
    }

    pub fn read_i8(&mut self) -> Result<i8> {
        Ok(self.read_u8()? as i8)
    }

    read_primitive!(read_u16, u16, read_u16, 2);
    read_primitive!(read_i16, i16, read_i16, 2);
    read_primitive!(read_u32, u32, read_u32, 4);
    read_primitive!(read_i32, i32, read_i32, 4);
    read_primitive!(read_u64, u64, read_u64, 8);
    read_primitive!(read_i64, i64, read_i64, 8);
    read_primitive!(read_f32, f32, read_f32, 4);
    read_primitive!(read_f64, f64, read_f64, 8);

    pub fn read_bytes(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0; len];
        self.inner
            .read_exact(&mut buf)
            .map_err(|e| eof_as_truncated(e, "bytes", self.position))?;
        self.position += len as u64;
        Ok(buf)
    }

    pub fn skip_u16(&mut self) -> Result<()> {
        self.read_u16().map(drop)
    }

    pub fn skip_u32(&mut self) -> Result<()> {
        self.read_u32().map(drop)
    }

    /// Skip up to `n` bytes, returning how many were actually skipped.
    pub fn skip_bytes(&mut self, n: u64) -> Result<u64> {
        let skipped = io::copy(&mut (&mut self.inner).take(n), &mut io::sink())?;
        self.position += skipped;
        Ok(skipped)
    }

    /// Move forward to an absolute position.
    pub fn jump_to(&mut self, expected: u64) -> Result<()> {
        if self.position > expected {
            return Err(ResError::BackwardSeek {
                from: self.position,
                to: expected,
            });
        }
        let wanted = expected - self.position;
        if wanted > 0 {
            let skipped = self.skip_bytes(wanted)?;
            if skipped != wanted {
                return Err(ResError::SkipFailed {
                    expected: wanted,
                    skipped,
                });
            }
        }
        Ok(())
    }

    pub fn read_u32_array(&mut self, len: usize) -> Result<Vec<u32>> {
        let mut arr = Vec::with_capacity(len);
        for _ in 0..len {
            arr.push(self.read_u32()?);
        }
        Ok(arr)
    }

    /// Read up to `len` integers, stopping early once `max_position` is reached.
    ///
    /// Some producers declare more strings than fit before the string data
    /// begins. Instead of failing, the prefix read so far is returned and one
    /// warning is recorded.
    pub fn read_safe_u32_array(
        &mut self,
        len: usize,
        max_position: u64,
        diag: &mut Diagnostics,
    ) -> Result<Vec<u32>> {
        let mut arr = Vec::with_capacity(len);
        for _ in 0..len {
            if self.position >= max_position {
                diag.warn(Warning::TruncatedOffsetTable {
                    position: self.position,
                    limit: max_position,
                    read: arr.len(),
                    expected: len,
                });
                return Ok(arr);
            }
            arr.push(self.read_u32()?);
        }
        Ok(arr)
    }

    /// Read a narrow string stored in a fixed field of `len` bytes.
    ///
    /// The string ends at the first NUL; the rest of the field is skipped.
    pub fn read_ascii(&mut self, len: usize) -> Result<String> {
        let mut out = String::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            remaining -= 1;
            let ch = self.read_u8()?;
            if ch == 0 {
                break;
            }
            out.push(ch as char);
        }
        if remaining > 0 {
            self.jump_to(self.position + remaining as u64)?;
        }
        Ok(out)
    }

    /// Read a UTF-16 string stored in a fixed field of `len` code units.
    ///
    /// The string ends at the first NUL unit; the rest of the field is skipped.
    pub fn read_utf16(&mut self, len: usize) -> Result<String> {
        let mut units = Vec::with_capacity(len);
        let mut remaining = len;
        while remaining > 0 {
            remaining -= 1;
            let unit = self.read_u16()?;
            if unit == 0 {
                break;
            }
            units.push(unit);
        }
        if remaining > 0 {
            self.jump_to(self.position + remaining as u64 * 2)?;
        }
        Ok(String::from_utf16_lossy(&units))
    }
}
