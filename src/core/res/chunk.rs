use crate::core::error::{ResError, Result};
use crate::core::stream::{Endian, ExtDataInput, ExtDataOutput};
use serde::{Deserialize, Serialize};
use std::io::{Seek, Write};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
#[repr(u16)]
pub enum ChunkType {
    Null = 0x0000,
    StringPool = 0x0001,
    Table = 0x0002,
    Xml = 0x0003,
    XmlStartNamespace = 0x0100,
    XmlEndNamespace = 0x0101,
    XmlStartElement = 0x0102,
    XmlEndElement = 0x0103,
    XmlCdata = 0x0104,
    XmlResourceMap = 0x0180,
    TablePackage = 0x0200,
    TableType = 0x0201,
    TableTypeSpec = 0x0202,
    TableLibrary = 0x0203,
    TableOverlayable = 0x0204,
    TableOverlayablePolicy = 0x0205,
    TableStagedAlias = 0x0206,
}

impl ChunkType {
    pub fn from_u16(ty: u16) -> Option<Self> {
        Some(match ty {
            0x0000 => Self::Null,
            0x0001 => Self::StringPool,
            0x0002 => Self::Table,
            0x0003 => Self::Xml,
            0x0100 => Self::XmlStartNamespace,
            0x0101 => Self::XmlEndNamespace,
            0x0102 => Self::XmlStartElement,
            0x0103 => Self::XmlEndElement,
            0x0104 => Self::XmlCdata,
            0x0180 => Self::XmlResourceMap,
            0x0200 => Self::TablePackage,
            0x0201 => Self::TableType,
            0x0202 => Self::TableTypeSpec,
            0x0203 => Self::TableLibrary,
            0x0204 => Self::TableOverlayable,
            0x0205 => Self::TableOverlayablePolicy,
            0x0206 => Self::TableStagedAlias,
            _ => return None,
        })
    }

    pub fn name(ty: u16) -> String {
        match Self::from_u16(ty) {
            Some(known) => format!("{:?}", known),
            None => format!("0x{:04x}", ty),
        }
    }
}

#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct ChunkHeader {
    /// Type identifier for this chunk. The meaning of this value depends
    /// on the containing chunk.
    pub ty: u16,
    /// Size of the chunk header (in bytes). Adding this value to the address
    /// of the chunk allows you to find its associated data (if any).
    pub header_size: u16,
    /// Total size of this chunk (in bytes), header and children included.
    pub size: u32,
    /// Absolute position of the first header byte.
    pub offset: u64,
}

impl ChunkHeader {
    pub const SIZE: u16 = 8;

    /// Read and validate the header of the chunk starting at `offset`.
    ///
    /// `limit` is the end of the enclosing chunk (or of the data).
    pub fn read_at(data: &[u8], offset: u64, limit: u64) -> Result<Self> {
        let mut input = input_at(data, offset, limit)?;
        let ty = input.read_u16()?;
        let header_size = input.read_u16()?;
        let size = input.read_u32()?;
        let header = Self {
            ty,
            header_size,
            size,
            offset,
        };
        let chunk = ChunkType::name(ty);
        if header_size < Self::SIZE {
            return Err(ResError::malformed(
                chunk,
                offset,
                format!("header size {} is smaller than {}", header_size, Self::SIZE),
            ));
        }
        if header_size as u32 > size {
            return Err(ResError::malformed(
                chunk,
                offset,
                format!("header size {} exceeds chunk size {}", header_size, size),
            ));
        }
        if header.end() > limit {
            return Err(ResError::malformed(
                chunk,
                offset,
                format!(
                    "chunk size {} exceeds the {} bytes remaining",
                    size,
                    limit - offset
                ),
            ));
        }
        Ok(header)
    }

    pub fn header_end(&self) -> u64 {
        self.offset + self.header_size as u64
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size as u64
    }

    pub fn kind(&self) -> Option<ChunkType> {
        ChunkType::from_u16(self.ty)
    }

    pub fn name(&self) -> String {
        ChunkType::name(self.ty)
    }

    /// A reader over this chunk's bytes, positioned just after the common header.
    pub fn body<'a>(&self, data: &'a [u8]) -> Result<ExtDataInput<&'a [u8]>> {
        input_at(data, self.offset + Self::SIZE as u64, self.end())
    }

    pub fn malformed(&self, reason: impl Into<String>) -> ResError {
        ResError::malformed(self.name(), self.offset, reason)
    }
}

/// A reader over `data[start..end]` that reports absolute positions.
pub(crate) fn input_at(data: &[u8], start: u64, end: u64) -> Result<ExtDataInput<&[u8]>> {
    let len = data.len() as u64;
    if start > end || end > len {
        return Err(ResError::Truncated {
            context: format!("range {}..{}", start, end),
            position: len.min(start),
        });
    }
    Ok(ExtDataInput::at(
        &data[start as usize..end as usize],
        Endian::Little,
        start,
    ))
}

/// Iterate the child chunks laid out back to back in `start..end`.
pub(crate) fn children(data: &[u8], start: u64, end: u64) -> Children<'_> {
    Children {
        data,
        pos: start,
        end,
        failed: false,
    }
}

pub(crate) struct Children<'a> {
    data: &'a [u8],
    pos: u64,
    end: u64,
    failed: bool,
}

impl Iterator for Children<'_> {
    type Item = Result<ChunkHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.pos >= self.end {
            return None;
        }
        // trailing padding shorter than a header is tolerated
        if self.end - self.pos < ChunkHeader::SIZE as u64 {
            log::debug!("ignoring {} trailing bytes at {}", self.end - self.pos, self.pos);
            self.pos = self.end;
            return None;
        }
        match ChunkHeader::read_at(self.data, self.pos, self.end) {
            Ok(header) => {
                self.pos = header.end();
                Some(Ok(header))
            }
            Err(err) => {
                self.failed = true;
                Some(Err(err))
            }
        }
    }
}

/// Writes a chunk header placeholder and fills in the sizes once the chunk
/// is complete.
pub(crate) struct ChunkWriter {
    ty: u16,
    start_chunk: u64,
    end_header: u64,
}

impl ChunkWriter {
    pub fn start_chunk<W: Write + Seek>(ty: u16, w: &mut ExtDataOutput<W>) -> Result<Self> {
        let start_chunk = w.position();
        w.write_u16(ty)?;
        w.write_u16(0)?;
        w.write_u32(0)?;
        Ok(Self {
            ty,
            start_chunk,
            end_header: 0,
        })
    }

    pub fn start(&self) -> u64 {
        self.start_chunk
    }

    pub fn end_header<W: Write + Seek>(&mut self, w: &mut ExtDataOutput<W>) -> Result<()> {
        self.end_header = w.position();
        Ok(())
    }

    pub fn end_chunk<W: Write + Seek>(self, w: &mut ExtDataOutput<W>) -> Result<(u64, u64)> {
        debug_assert_ne!(self.end_header, 0);
        let end_chunk = w.position();
        let header_size = self.end_header - self.start_chunk;
        let size = end_chunk - self.start_chunk;
        let what = ChunkType::name(self.ty);
        let header_size = u16::try_from(header_size).map_err(|_| ResError::EncodingSizeMismatch {
            what: format!("{} chunk header", what),
            size: header_size,
            max: u16::MAX as u64,
        })?;
        let size = u32::try_from(size).map_err(|_| ResError::EncodingSizeMismatch {
            what: format!("{} chunk", what),
            size,
            max: u32::MAX as u64,
        })?;
        w.patch_u16(self.start_chunk + 2, header_size)?;
        w.patch_u32(self.start_chunk + 4, size)?;
        Ok((self.start_chunk, end_chunk))
    }
}

/// A chunk kept as opaque bytes so it can be written back unchanged.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct RawChunk {
    pub ty: u16,
    /// Header bytes following the common 8-byte header.
    #[serde(with = "super::hex_bytes")]
    pub header: Vec<u8>,
    #[serde(with = "super::hex_bytes")]
    pub body: Vec<u8>,
}

impl RawChunk {
    pub fn read(data: &[u8], header: &ChunkHeader) -> Result<Self> {
        let mut input = header.body(data)?;
        let extra = header.header_size - ChunkHeader::SIZE;
        let head = input.read_bytes(extra as usize)?;
        let body = input.read_bytes((header.size - header.header_size as u32) as usize)?;
        Ok(Self {
            ty: header.ty,
            header: head,
            body,
        })
    }

    pub fn write<W: Write + Seek>(&self, w: &mut ExtDataOutput<W>) -> Result<()> {
        let mut chunk = ChunkWriter::start_chunk(self.ty, w)?;
        w.write_bytes(&self.header)?;
        chunk.end_header(w)?;
        w.write_bytes(&self.body)?;
        chunk.end_chunk(w)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn header_bytes(ty: u16, header_size: u16, size: u32) -> Vec<u8> {
        let mut v = ty.to_le_bytes().to_vec();
        v.extend_from_slice(&header_size.to_le_bytes());
        v.extend_from_slice(&size.to_le_bytes());
        v
    }

    #[test]
    fn rejects_header_larger_than_chunk() {
        let data = header_bytes(0x0002, 12, 8);
        let err = ChunkHeader::read_at(&data, 0, 8).unwrap_err();
        assert!(matches!(err, ResError::MalformedChunk { .. }));
    }

    #[test]
    fn rejects_chunk_overrunning_parent() {
        let mut data = header_bytes(0x0001, 8, 64);
        data.resize(32, 0);
        let err = ChunkHeader::read_at(&data, 0, 32).unwrap_err();
        assert!(err.to_string().contains("exceeds the 32 bytes remaining"));
    }

    #[test]
    fn raw_chunk_round_trips() {
        let mut data = header_bytes(0x0207, 12, 20);
        data.extend_from_slice(&[1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12]);
        let header = ChunkHeader::read_at(&data, 0, data.len() as u64).unwrap();
        let raw = RawChunk::read(&data, &header).unwrap();
        assert_eq!(raw.header, vec![1, 2, 3, 4]);
        assert_eq!(raw.body.len(), 8);

        let mut out = ExtDataOutput::little_endian(Cursor::new(Vec::new()));
        raw.write(&mut out).unwrap();
        assert_eq!(out.into_inner().into_inner(), data);
    }

    #[test]
    fn children_stop_after_error() {
        let mut data = header_bytes(0x0001, 8, 8);
        data.extend(header_bytes(0x0001, 8, 0));
        let found: Vec<_> = children(&data, 0, data.len() as u64).collect();
        assert_eq!(found.len(), 2);
        assert!(found[0].is_ok());
        assert!(found[1].is_err());
    }
}
