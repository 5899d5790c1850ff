use super::chunk::{children, input_at, ChunkHeader, ChunkType, ChunkWriter, RawChunk};
use super::{ResId, ResRef, ResValue, StringPool};
use crate::core::diagnostics::{Diagnostics, Warning};
use crate::core::error::{ResError, Result};
use crate::core::stream::{ExtDataInput, ExtDataOutput};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Seek, Write};

const TABLE_HEADER_SIZE: u16 = 12;
const PACKAGE_HEADER_SIZE: u16 = 288;
const PACKAGE_HEADER_SIZE_NO_OFFSET: u16 = 284;
const PACKAGE_NAME_LEN: usize = 128;
const TYPE_SPEC_HEADER_SIZE: u16 = 16;
const TYPE_HEADER_SIZE: u16 = 20;
const LIBRARY_HEADER_SIZE: u16 = 12;

const ENTRY_FLAG_COMPLEX: u16 = 0x0001;
const ENTRY_FLAG_COMPACT: u16 = 0x0008;
const NO_ENTRY: u32 = 0xffff_ffff;
const NO_ENTRY16: u16 = 0xffff;

pub const TYPE_FLAG_SPARSE: u8 = 0x01;
pub const TYPE_FLAG_OFFSET16: u8 = 0x02;

/// The decoded contents of a `resources.arsc` file.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ResTable {
    pub strings: StringPool,
    pub packages: Vec<Package>,
    /// Top-level chunks this crate does not model, written back verbatim.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown: Vec<RawChunk>,
}

impl ResTable {
    /// Read a whole table from a byte stream positioned at its first chunk.
    pub fn read<R: Read>(mut r: R, diag: &mut Diagnostics) -> Result<Self> {
        let mut data = Vec::new();
        r.read_to_end(&mut data)?;
        Self::decode(&data, diag)
    }

    pub fn decode(data: &[u8], diag: &mut Diagnostics) -> Result<Self> {
        let header = ChunkHeader::read_at(data, 0, data.len() as u64)?;
        if header.kind() != Some(ChunkType::Table) {
            return Err(header.malformed("expected a resource table"));
        }
        if header.header_size < TABLE_HEADER_SIZE {
            return Err(header.malformed(format!(
                "table header is {} bytes, expected {}",
                header.header_size, TABLE_HEADER_SIZE
            )));
        }
        let mut r = header.body(data)?;
        let package_count = r.read_u32()?;

        let mut strings = None;
        let mut packages = Vec::new();
        let mut unknown = Vec::new();
        for child in children(data, header.header_end(), header.end()) {
            let child = child?;
            match child.kind() {
                Some(ChunkType::StringPool) if strings.is_none() => {
                    strings = Some(StringPool::decode(data, &child, diag)?);
                }
                Some(ChunkType::TablePackage) => packages.push(Package::decode(data, &child, diag)?),
                _ => unknown.push(read_unknown(data, &child, diag)?),
            }
        }
        if packages.len() != package_count as usize {
            log::debug!(
                "table declares {} packages, found {}",
                package_count,
                packages.len()
            );
        }
        let strings = strings.ok_or_else(|| header.malformed("missing global string pool"))?;
        Ok(Self {
            strings,
            packages,
            unknown,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = ExtDataOutput::little_endian(Cursor::new(Vec::new()));
        self.write(&mut w)?;
        Ok(w.into_inner().into_inner())
    }

    pub fn write<W: Write + Seek>(&self, w: &mut ExtDataOutput<W>) -> Result<()> {
        let mut chunk = ChunkWriter::start_chunk(ChunkType::Table as u16, w)?;
        w.write_u32(self.packages.len() as u32)?;
        chunk.end_header(w)?;
        self.strings.write(w)?;
        for package in &self.packages {
            package.write(w)?;
        }
        for raw in &self.unknown {
            raw.write(w)?;
        }
        chunk.end_chunk(w)?;
        Ok(())
    }

    pub fn package(&self, id: u8) -> Option<&Package> {
        self.packages.iter().find(|p| p.package_id() == id)
    }

    /// The application package, or the first one for framework tables.
    pub fn main_package(&self) -> Option<&Package> {
        self.package(0x7f).or_else(|| self.packages.first())
    }

    pub fn defines_package(&self, id: u8) -> bool {
        self.package(id).is_some()
    }

    /// Look up an entry by id in the first configuration that defines it.
    pub fn resolve(&self, id: ResId) -> Option<ResolvedEntry<'_>> {
        let package = self.package(id.package())?;
        let entry = package.entry(id.ty(), id.entry())?;
        Some(ResolvedEntry {
            id,
            package,
            type_name: package.type_name(id.ty())?,
            key: package.key_name(entry.key)?,
            entry,
        })
    }

    /// Find the id of a symbolic reference. Without a package prefix the
    /// main package is searched.
    pub fn find(&self, reference: &ResRef<'_>) -> Option<ResId> {
        let package = match reference.package {
            Some(name) => self.packages.iter().find(|p| p.name == name)?,
            None => self.main_package()?,
        };
        package.find(reference.ty, reference.name)
    }

    pub fn values(&self) -> impl Iterator<Item = &ResValue> {
        self.packages
            .iter()
            .flat_map(|p| p.types.iter())
            .flat_map(|t| t.configs.iter())
            .flat_map(|c| c.entries.values())
            .flat_map(|e| e.values())
    }

    /// Point every reference to `from` at `to`, returning how many were changed.
    pub fn retarget_references(&mut self, from: ResId, to: ResId) -> usize {
        let mut changed = 0;
        for package in &mut self.packages {
            for ty in &mut package.types {
                for config in &mut ty.configs {
                    for entry in config.entries.values_mut() {
                        changed += entry.retarget(from, to);
                    }
                }
            }
        }
        changed
    }

    /// Switch every pool to UTF-8 for the next encode.
    pub fn force_utf8(&mut self) {
        self.strings.utf8 = true;
        for package in &mut self.packages {
            package.type_strings.utf8 = true;
            package.key_strings.utf8 = true;
        }
    }
}

fn read_unknown(data: &[u8], header: &ChunkHeader, diag: &mut Diagnostics) -> Result<RawChunk> {
    diag.warn(Warning::UnknownChunk {
        ty: header.ty,
        offset: header.offset,
        size: header.size,
    });
    RawChunk::read(data, header)
}

#[derive(Clone, Copy, Debug)]
pub struct ResolvedEntry<'a> {
    pub id: ResId,
    pub package: &'a Package,
    pub type_name: &'a str,
    pub key: &'a str,
    pub entry: &'a Entry,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Package {
    /// If this is a base package, its ID. Package IDs start at 1
    /// (corresponding to the value of the package bits in a resource
    /// identifier). 0 means this is not a base package.
    pub id: u32,
    pub name: String,
    /// 288 when the header carries `type_id_offset`, 284 for older tables.
    #[serde(default = "default_package_header_size")]
    pub header_size: u16,
    #[serde(default)]
    pub last_public_type: u32,
    #[serde(default)]
    pub last_public_key: u32,
    #[serde(default)]
    pub type_id_offset: u32,
    pub type_strings: StringPool,
    pub key_strings: StringPool,
    pub types: Vec<ResType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub library: Option<Library>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unknown: Vec<RawChunk>,
}

fn default_package_header_size() -> u16 {
    PACKAGE_HEADER_SIZE
}

impl Package {
    pub fn new(id: u8, name: impl Into<String>) -> Self {
        Self {
            id: id as u32,
            name: name.into(),
            header_size: PACKAGE_HEADER_SIZE,
            last_public_type: 0,
            last_public_key: 0,
            type_id_offset: 0,
            type_strings: StringPool::new(true),
            key_strings: StringPool::new(true),
            types: Vec::new(),
            library: None,
            unknown: Vec::new(),
        }
    }

    pub fn package_id(&self) -> u8 {
        self.id as u8
    }

    pub fn type_name(&self, type_id: u8) -> Option<&str> {
        let index = (type_id as u32).checked_sub(1 + self.type_id_offset)?;
        self.type_strings.get(index)
    }

    pub fn type_id(&self, name: &str) -> Option<u8> {
        let index = self.type_strings.position(name)?;
        u8::try_from(index + 1 + self.type_id_offset).ok()
    }

    pub fn key_name(&self, key: u32) -> Option<&str> {
        self.key_strings.get(key)
    }

    pub fn res_type(&self, type_id: u8) -> Option<&ResType> {
        self.types.iter().find(|t| t.id == type_id)
    }

    pub fn entry(&self, type_id: u8, index: u16) -> Option<&Entry> {
        self.res_type(type_id)?
            .configs
            .iter()
            .find_map(|c| c.entries.get(&index))
    }

    /// Configuration axes that vary for an entry, from its type spec.
    /// `SPEC_PUBLIC` (0x4000_0000) marks public resources.
    pub fn spec_flags(&self, type_id: u8, index: u16) -> Option<u32> {
        self.res_type(type_id)?
            .spec
            .as_ref()?
            .flags
            .get(index as usize)
            .copied()
    }

    pub fn find(&self, type_name: &str, key: &str) -> Option<ResId> {
        let type_id = self.type_id(type_name)?;
        let key = self.key_strings.position(key)?;
        let ty = self.res_type(type_id)?;
        ty.configs.iter().find_map(|c| {
            c.entries
                .iter()
                .find(|(_, e)| e.key == key)
                .map(|(index, _)| ResId::new(self.package_id(), type_id, *index))
        })
    }

    fn decode(data: &[u8], header: &ChunkHeader, diag: &mut Diagnostics) -> Result<Self> {
        if header.header_size < PACKAGE_HEADER_SIZE_NO_OFFSET {
            return Err(header.malformed(format!(
                "package header is {} bytes, expected at least {}",
                header.header_size, PACKAGE_HEADER_SIZE_NO_OFFSET
            )));
        }
        let mut r = header.body(data)?;
        let id = r.read_u32()?;
        let name = r.read_utf16(PACKAGE_NAME_LEN)?;
        let type_strings_offset = r.read_u32()?;
        let last_public_type = r.read_u32()?;
        let key_strings_offset = r.read_u32()?;
        let last_public_key = r.read_u32()?;
        let type_id_offset = if header.header_size >= PACKAGE_HEADER_SIZE {
            r.read_u32()?
        } else {
            0
        };
        log::trace!("package 0x{:02x} `{}` at {}", id, name, header.offset);

        let mut type_strings = None;
        let mut key_strings = None;
        let mut types: Vec<ResType> = Vec::new();
        let mut library = None;
        let mut unknown = Vec::new();
        for child in children(data, header.header_end(), header.end()) {
            let child = child?;
            match child.kind() {
                Some(ChunkType::StringPool) => {
                    let relative = child.offset - header.offset;
                    let pool = StringPool::decode(data, &child, diag)?;
                    if relative == type_strings_offset as u64 && type_strings.is_none() {
                        type_strings = Some(pool);
                    } else if relative == key_strings_offset as u64 && key_strings.is_none() {
                        key_strings = Some(pool);
                    } else if type_strings.is_none() {
                        type_strings = Some(pool);
                    } else if key_strings.is_none() {
                        key_strings = Some(pool);
                    } else {
                        unknown.push(read_unknown(data, &child, diag)?);
                    }
                }
                Some(ChunkType::TableTypeSpec) => {
                    let (type_id, spec) = TypeSpec::decode(data, &child)?;
                    let ty = type_slot(&mut types, type_id);
                    if ty.spec.is_some() {
                        return Err(child.malformed(format!("duplicate spec for type {}", type_id)));
                    }
                    ty.spec = Some(spec);
                }
                Some(ChunkType::TableType) => {
                    let (type_id, config) = TypeChunk::decode(data, &child)?;
                    type_slot(&mut types, type_id).configs.push(config);
                }
                Some(ChunkType::TableLibrary) if library.is_none() => {
                    library = Some(Library::decode(data, &child)?);
                }
                _ => unknown.push(read_unknown(data, &child, diag)?),
            }
        }

        Ok(Self {
            id,
            name,
            header_size: header.header_size.min(PACKAGE_HEADER_SIZE),
            last_public_type,
            last_public_key,
            type_id_offset,
            type_strings: type_strings.ok_or_else(|| header.malformed("missing type strings"))?,
            key_strings: key_strings.ok_or_else(|| header.malformed("missing key strings"))?,
            types,
            library,
            unknown,
        })
    }

    fn write<W: Write + Seek>(&self, w: &mut ExtDataOutput<W>) -> Result<()> {
        let mut chunk = ChunkWriter::start_chunk(ChunkType::TablePackage as u16, w)?;
        w.write_u32(self.id)?;
        w.write_utf16_fixed(&self.name, PACKAGE_NAME_LEN)?;
        let type_strings_at = w.position();
        w.write_u32(0)?;
        w.write_u32(self.last_public_type)?;
        let key_strings_at = w.position();
        w.write_u32(0)?;
        w.write_u32(self.last_public_key)?;
        if self.header_size >= PACKAGE_HEADER_SIZE {
            w.write_u32(self.type_id_offset)?;
        }
        chunk.end_header(w)?;

        let type_strings = w.position() - chunk.start();
        self.type_strings.write(w)?;
        let key_strings = w.position() - chunk.start();
        self.key_strings.write(w)?;
        w.patch_u32(type_strings_at, type_strings as u32)?;
        w.patch_u32(key_strings_at, key_strings as u32)?;

        for ty in &self.types {
            if let Some(spec) = &ty.spec {
                spec.write(ty.id, w)?;
            }
            for config in &ty.configs {
                config.write(ty.id, w)?;
            }
        }
        if let Some(library) = &self.library {
            library.write(w)?;
        }
        for raw in &self.unknown {
            raw.write(w)?;
        }
        chunk.end_chunk(w)?;
        Ok(())
    }
}

fn type_slot(types: &mut Vec<ResType>, id: u8) -> &mut ResType {
    let index = match types.iter().position(|t| t.id == id) {
        Some(index) => index,
        None => {
            types.push(ResType {
                id,
                spec: None,
                configs: Vec::new(),
            });
            types.len() - 1
        }
    };
    &mut types[index]
}

/// All configurations of one resource type within a package.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ResType {
    pub id: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub spec: Option<TypeSpec>,
    pub configs: Vec<TypeChunk>,
}

#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct TypeSpec {
    #[serde(default)]
    pub res0: u8,
    /// Number of type chunks that follow, as recorded by the producer.
    #[serde(default)]
    pub types_count: u16,
    /// Configuration change flags, one per entry.
    pub flags: Vec<u32>,
}

impl TypeSpec {
    fn decode(data: &[u8], header: &ChunkHeader) -> Result<(u8, Self)> {
        if header.header_size < TYPE_SPEC_HEADER_SIZE {
            return Err(header.malformed(format!(
                "type spec header is {} bytes, expected {}",
                header.header_size, TYPE_SPEC_HEADER_SIZE
            )));
        }
        let mut r = header.body(data)?;
        let id = r.read_u8()?;
        let res0 = r.read_u8()?;
        let types_count = r.read_u16()?;
        let entry_count = r.read_u32()?;
        if id == 0 {
            return Err(header.malformed("type id 0 is reserved"));
        }
        if entry_count as u64 * 4 > header.end() - header.header_end() {
            return Err(header.malformed(format!(
                "{} spec flags do not fit in the chunk",
                entry_count
            )));
        }
        r.jump_to(header.header_end())?;
        let flags = r.read_u32_array(entry_count as usize)?;
        log::trace!("type spec {} with {} entries", id, entry_count);
        Ok((
            id,
            Self {
                res0,
                types_count,
                flags,
            },
        ))
    }

    fn write<W: Write + Seek>(&self, id: u8, w: &mut ExtDataOutput<W>) -> Result<()> {
        let mut chunk = ChunkWriter::start_chunk(ChunkType::TableTypeSpec as u16, w)?;
        w.write_u8(id)?;
        w.write_u8(self.res0)?;
        w.write_u16(self.types_count)?;
        w.write_u32(self.flags.len() as u32)?;
        chunk.end_header(w)?;
        for flags in &self.flags {
            w.write_u32(*flags)?;
        }
        chunk.end_chunk(w)?;
        Ok(())
    }
}

/// The entries of one type for one configuration.
///
/// Entries are kept by index whatever the offset layout on disk;
/// `flags` records which layout to write back.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TypeChunk {
    #[serde(default)]
    pub flags: u8,
    pub entry_count: u32,
    pub config: ResConfig,
    pub entries: BTreeMap<u16, Entry>,
}

impl TypeChunk {
    pub fn is_sparse(&self) -> bool {
        self.flags & TYPE_FLAG_SPARSE != 0
    }

    pub fn is_offset16(&self) -> bool {
        self.flags & TYPE_FLAG_OFFSET16 != 0
    }

    fn decode(data: &[u8], header: &ChunkHeader) -> Result<(u8, Self)> {
        if header.header_size < TYPE_HEADER_SIZE + 4 {
            return Err(header.malformed(format!(
                "type header is {} bytes, too small for a configuration",
                header.header_size
            )));
        }
        let mut r = header.body(data)?;
        let id = r.read_u8()?;
        let flags = r.read_u8()?;
        let _reserved = r.read_u16()?;
        let entry_count = r.read_u32()?;
        let entries_start = r.read_u32()?;
        if id == 0 {
            return Err(header.malformed("type id 0 is reserved"));
        }
        let config = ResConfig::read(&mut r, header)?;
        if r.position() > header.header_end() {
            return Err(header.malformed(format!(
                "configuration of {} bytes overruns the {} byte header",
                config.size(),
                header.header_size
            )));
        }
        r.jump_to(header.header_end())?;

        let sparse = flags & TYPE_FLAG_SPARSE != 0;
        let offset16 = flags & TYPE_FLAG_OFFSET16 != 0;
        let slot_size = if offset16 && !sparse { 2 } else { 4 };
        if entry_count > 0x1_0000
            || entry_count as u64 * slot_size > header.end() - header.header_end()
        {
            return Err(header.malformed(format!(
                "{} entry offsets do not fit in the chunk",
                entry_count
            )));
        }
        let mut slots = Vec::with_capacity(entry_count as usize);
        for i in 0..entry_count {
            if sparse {
                let index = r.read_u16()?;
                let offset = r.read_u16()? as u32 * 4;
                slots.push((index, offset));
            } else if offset16 {
                let offset = r.read_u16()?;
                if offset != NO_ENTRY16 {
                    slots.push((i as u16, offset as u32 * 4));
                }
            } else {
                let offset = r.read_u32()?;
                if offset != NO_ENTRY {
                    slots.push((i as u16, offset));
                }
            }
        }

        let base = header.offset + entries_start as u64;
        if base > header.end() {
            return Err(header.malformed(format!(
                "entries start {} lies past the chunk end",
                entries_start
            )));
        }
        let mut entries = BTreeMap::new();
        let mut spans = Vec::with_capacity(slots.len());
        for (index, offset) in slots {
            let at = base + offset as u64;
            if at >= header.end() {
                return Err(header.malformed(format!(
                    "entry {} at offset {} lies past the chunk end",
                    index, offset
                )));
            }
            let (entry, size) = Entry::decode(data, at, header)?;
            spans.push((offset, size, index));
            entries.insert(index, entry);
        }
        spans.sort_unstable();
        for pair in spans.windows(2) {
            let (offset, size, index) = pair[0];
            let (next_offset, _, next_index) = pair[1];
            if offset != next_offset && offset + size > next_offset {
                return Err(header.malformed(format!(
                    "entry {} overlaps entry {} at offset {}",
                    index, next_index, next_offset
                )));
            }
        }

        log::trace!(
            "type {} config `{}`: {} of {} entries",
            id,
            config.qualifiers(),
            entries.len(),
            entry_count
        );
        Ok((
            id,
            Self {
                flags,
                entry_count,
                config,
                entries,
            },
        ))
    }

    fn write<W: Write + Seek>(&self, id: u8, w: &mut ExtDataOutput<W>) -> Result<()> {
        let count = if self.is_sparse() {
            self.entries.len() as u32
        } else {
            let last = self.entries.keys().next_back().map_or(0, |i| *i as u32 + 1);
            self.entry_count.max(last)
        };

        let mut chunk = ChunkWriter::start_chunk(ChunkType::TableType as u16, w)?;
        w.write_u8(id)?;
        w.write_u8(self.flags)?;
        w.write_u16(0)?;
        w.write_u32(count)?;
        let entries_start_at = w.position();
        w.write_u32(0)?;
        self.config.write(w)?;
        chunk.end_header(w)?;

        let mut offsets = BTreeMap::new();
        let mut next = 0u32;
        for (index, entry) in &self.entries {
            offsets.insert(*index, next);
            next += entry.encoded_size();
        }
        let quarter = |offset: u32, max: u32| -> Result<u16> {
            let value = offset / 4;
            if value >= max {
                return Err(ResError::EncodingSizeMismatch {
                    what: format!("entry offset in type {}", id),
                    size: offset as u64,
                    max: max as u64 * 4,
                });
            }
            Ok(value as u16)
        };
        if self.is_sparse() {
            for (index, offset) in &offsets {
                w.write_u16(*index)?;
                w.write_u16(quarter(*offset, 0x1_0000)?)?;
            }
        } else if self.is_offset16() {
            for i in 0..count {
                match offsets.get(&(i as u16)) {
                    Some(offset) => w.write_u16(quarter(*offset, NO_ENTRY16 as u32)?)?,
                    None => w.write_u16(NO_ENTRY16)?,
                }
            }
        } else {
            for i in 0..count {
                w.write_u32(*offsets.get(&(i as u16)).unwrap_or(&NO_ENTRY))?;
            }
        }
        w.align(4)?;
        w.patch_u32(entries_start_at, (w.position() - chunk.start()) as u32)?;

        for entry in self.entries.values() {
            entry.write(w)?;
        }
        chunk.end_chunk(w)?;
        Ok(())
    }
}

/// A resource configuration, kept as the raw size-prefixed bytes.
#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResConfig {
    #[serde(with = "super::hex_bytes")]
    raw: Vec<u8>,
}

impl Default for ResConfig {
    fn default() -> Self {
        let mut raw = vec![0; 64];
        raw[0] = 64;
        Self { raw }
    }
}

impl ResConfig {
    pub fn from_raw(raw: Vec<u8>) -> Result<Self> {
        if raw.len() < 4 || u32::from_le_bytes([raw[0], raw[1], raw[2], raw[3]]) as usize != raw.len()
        {
            return Err(ResError::malformed(
                "configuration",
                0,
                "size field does not match the data length",
            ));
        }
        Ok(Self { raw })
    }

    pub fn raw(&self) -> &[u8] {
        &self.raw
    }

    pub fn size(&self) -> usize {
        self.raw.len()
    }

    fn read(r: &mut ExtDataInput<&[u8]>, header: &ChunkHeader) -> Result<Self> {
        let size = r.read_u32()?;
        if size < 4 || r.position() + size as u64 - 4 > header.end() {
            return Err(header.malformed(format!("invalid configuration size {}", size)));
        }
        let mut raw = size.to_le_bytes().to_vec();
        raw.extend(r.read_bytes(size as usize - 4)?);
        Ok(Self { raw })
    }

    fn write<W: Write>(&self, w: &mut ExtDataOutput<W>) -> Result<()> {
        w.write_bytes(&self.raw)
    }

    fn u8_at(&self, offset: usize) -> u8 {
        self.raw.get(offset).copied().unwrap_or(0)
    }

    fn u16_at(&self, offset: usize) -> u16 {
        u16::from_le_bytes([self.u8_at(offset), self.u8_at(offset + 1)])
    }

    pub fn mcc(&self) -> u16 {
        self.u16_at(4)
    }

    pub fn mnc(&self) -> u16 {
        self.u16_at(6)
    }

    pub fn language(&self) -> String {
        unpack_locale_part([self.u8_at(8), self.u8_at(9)], b'a')
    }

    pub fn country(&self) -> String {
        unpack_locale_part([self.u8_at(10), self.u8_at(11)], b'0')
    }

    pub fn orientation(&self) -> u8 {
        self.u8_at(12)
    }

    pub fn density(&self) -> u16 {
        self.u16_at(14)
    }

    pub fn smallest_screen_width_dp(&self) -> u16 {
        self.u16_at(30)
    }

    pub fn sdk_version(&self) -> u16 {
        self.u16_at(24)
    }

    /// Directory-style qualifiers such as `en-rUS-hdpi-v21`; empty for the
    /// default configuration.
    pub fn qualifiers(&self) -> String {
        let mut parts = Vec::new();
        if self.mcc() != 0 {
            parts.push(format!("mcc{}", self.mcc()));
            if self.mnc() != 0 {
                parts.push(format!("mnc{}", self.mnc()));
            }
        }
        let language = self.language();
        if !language.is_empty() {
            parts.push(language);
            let country = self.country();
            if !country.is_empty() {
                parts.push(format!("r{}", country));
            }
        }
        if self.smallest_screen_width_dp() != 0 {
            parts.push(format!("sw{}dp", self.smallest_screen_width_dp()));
        }
        match self.orientation() {
            1 => parts.push("port".to_string()),
            2 => parts.push("land".to_string()),
            3 => parts.push("square".to_string()),
            _ => {}
        }
        match self.density() {
            0 => {}
            120 => parts.push("ldpi".to_string()),
            160 => parts.push("mdpi".to_string()),
            213 => parts.push("tvdpi".to_string()),
            240 => parts.push("hdpi".to_string()),
            320 => parts.push("xhdpi".to_string()),
            480 => parts.push("xxhdpi".to_string()),
            640 => parts.push("xxxhdpi".to_string()),
            0xfffe => parts.push("anydpi".to_string()),
            0xffff => parts.push("nodpi".to_string()),
            other => parts.push(format!("{}dpi", other)),
        }
        if self.sdk_version() != 0 {
            parts.push(format!("v{}", self.sdk_version()));
        }
        parts.join("-")
    }
}

/// Two-letter codes are stored as is; three-letter codes are packed into
/// 5-bit groups with the high bit set.
fn unpack_locale_part(bytes: [u8; 2], base: u8) -> String {
    if bytes[0] & 0x80 != 0 {
        let first = bytes[1] & 0x1f;
        let second = ((bytes[1] & 0xe0) >> 5) | ((bytes[0] & 0x03) << 3);
        let third = (bytes[0] & 0x7c) >> 2;
        [first, second, third]
            .iter()
            .map(|c| (c + base) as char)
            .collect()
    } else {
        bytes
            .iter()
            .take_while(|b| **b != 0)
            .map(|b| *b as char)
            .collect()
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Entry flags other than the layout bits, e.g. public or weak.
    #[serde(default)]
    pub flags: u16,
    /// Index into the package's key pool.
    pub key: u32,
    /// Written in the 8-byte compact form when the value allows it.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub compact: bool,
    pub value: EntryValue,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum EntryValue {
    Simple(ResValue),
    Complex { parent: ResId, items: Vec<MapItem> },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct MapItem {
    pub name: ResId,
    pub value: ResValue,
}

impl Entry {
    pub fn simple(key: u32, value: ResValue) -> Self {
        Self {
            flags: 0,
            key,
            compact: false,
            value: EntryValue::Simple(value),
        }
    }

    pub fn values(&self) -> Box<dyn Iterator<Item = &ResValue> + '_> {
        match &self.value {
            EntryValue::Simple(value) => Box::new(std::iter::once(value)),
            EntryValue::Complex { items, .. } => Box::new(items.iter().map(|item| &item.value)),
        }
    }

    fn retarget(&mut self, from: ResId, to: ResId) -> usize {
        let swap = |value: &mut ResValue| {
            if value.referenced_id() == Some(from) {
                value.data = to.into();
                1
            } else {
                0
            }
        };
        match &mut self.value {
            EntryValue::Simple(value) => swap(value),
            EntryValue::Complex { parent, items } => {
                let mut changed = 0;
                if *parent == from {
                    *parent = to;
                    changed += 1;
                }
                for item in items {
                    changed += swap(&mut item.value);
                }
                changed
            }
        }
    }

    fn writes_compact(&self) -> bool {
        self.compact
            && self.key <= u16::MAX as u32
            && self.flags & 0xff00 == 0
            && matches!(self.value, EntryValue::Simple(_))
    }

    fn encoded_size(&self) -> u32 {
        match &self.value {
            _ if self.writes_compact() => 8,
            EntryValue::Simple(_) => 16,
            EntryValue::Complex { items, .. } => 16 + 12 * items.len() as u32,
        }
    }

    /// Decode the entry at `at`, returning it with its encoded size.
    fn decode(data: &[u8], at: u64, header: &ChunkHeader) -> Result<(Self, u32)> {
        let mut r = input_at(data, at, header.end())?;
        let size = r.read_u16()?;
        let flags = r.read_u16()?;
        if flags & ENTRY_FLAG_COMPACT != 0 {
            let value = ResValue::new_raw((flags >> 8) as u8, r.read_u32()?);
            let entry = Self {
                flags: flags & 0x00ff & !ENTRY_FLAG_COMPACT,
                key: size as u32,
                compact: true,
                value: EntryValue::Simple(value),
            };
            return Ok((entry, 8));
        }
        let key = r.read_u32()?;
        let flags_kept = flags & !ENTRY_FLAG_COMPLEX;
        if flags & ENTRY_FLAG_COMPLEX != 0 {
            if size < 16 {
                return Err(header.malformed(format!("complex entry at {} has size {}", at, size)));
            }
            let parent = ResId::from(r.read_u32()?);
            let count = r.read_u32()?;
            r.jump_to(at + size as u64)?;
            if count as u64 * 12 > header.end() - r.position() {
                return Err(header.malformed(format!(
                    "map entry at {} declares {} items past the chunk end",
                    at, count
                )));
            }
            let mut items = Vec::with_capacity(count as usize);
            for _ in 0..count {
                let name = ResId::from(r.read_u32()?);
                let value = ResValue::read(&mut r)?;
                items.push(MapItem { name, value });
            }
            let entry = Self {
                flags: flags_kept,
                key,
                compact: false,
                value: EntryValue::Complex { parent, items },
            };
            Ok((entry, size as u32 + 12 * count))
        } else {
            if size < 8 {
                return Err(header.malformed(format!("entry at {} has size {}", at, size)));
            }
            r.jump_to(at + size as u64)?;
            let value = ResValue::read(&mut r)?;
            let entry = Self {
                flags: flags_kept,
                key,
                compact: false,
                value: EntryValue::Simple(value),
            };
            Ok((entry, size as u32 + ResValue::SIZE as u32))
        }
    }

    fn write<W: Write>(&self, w: &mut ExtDataOutput<W>) -> Result<()> {
        match &self.value {
            EntryValue::Simple(value) if self.writes_compact() => {
                w.write_u16(self.key as u16)?;
                w.write_u16(self.flags | ENTRY_FLAG_COMPACT | ((value.data_type as u16) << 8))?;
                w.write_u32(value.data)?;
            }
            EntryValue::Simple(value) => {
                w.write_u16(8)?;
                w.write_u16(self.flags & !(ENTRY_FLAG_COMPLEX | ENTRY_FLAG_COMPACT))?;
                w.write_u32(self.key)?;
                value.write(w)?;
            }
            EntryValue::Complex { parent, items } => {
                w.write_u16(16)?;
                w.write_u16((self.flags & !ENTRY_FLAG_COMPACT) | ENTRY_FLAG_COMPLEX)?;
                w.write_u32(self.key)?;
                w.write_u32((*parent).into())?;
                w.write_u32(items.len() as u32)?;
                for item in items {
                    w.write_u32(item.name.into())?;
                    item.value.write(w)?;
                }
            }
        }
        Ok(())
    }
}

/// Maps the dynamic package ids of shared libraries to package names.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize, Deserialize)]
pub struct Library {
    pub entries: Vec<LibraryEntry>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct LibraryEntry {
    pub package_id: u32,
    pub name: String,
}

impl Library {
    fn decode(data: &[u8], header: &ChunkHeader) -> Result<Self> {
        if header.header_size < LIBRARY_HEADER_SIZE {
            return Err(header.malformed(format!(
                "library header is {} bytes, expected {}",
                header.header_size, LIBRARY_HEADER_SIZE
            )));
        }
        let mut r = header.body(data)?;
        let count = r.read_u32()?;
        let entry_size = 4 + 2 * PACKAGE_NAME_LEN as u64;
        if count as u64 * entry_size > header.end() - header.header_end() {
            return Err(header.malformed(format!("{} library entries do not fit", count)));
        }
        r.jump_to(header.header_end())?;
        let mut entries = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let package_id = r.read_u32()?;
            let name = r.read_utf16(PACKAGE_NAME_LEN)?;
            entries.push(LibraryEntry { package_id, name });
        }
        Ok(Self { entries })
    }

    fn write<W: Write + Seek>(&self, w: &mut ExtDataOutput<W>) -> Result<()> {
        let mut chunk = ChunkWriter::start_chunk(ChunkType::TableLibrary as u16, w)?;
        w.write_u32(self.entries.len() as u32)?;
        chunk.end_header(w)?;
        for entry in &self.entries {
            w.write_u32(entry.package_id)?;
            w.write_utf16_fixed(&entry.name, PACKAGE_NAME_LEN)?;
        }
        chunk.end_chunk(w)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::res::ResValueType;

    /// A one-package table with a single integer resource.
    fn sample_table() -> ResTable {
        let mut strings = StringPool::new(true);
        strings.push("hello");
        let mut package = Package::new(0x7f, "com.example");
        package.type_strings.push("integer");
        package.key_strings.push("answer");
        let mut entries = BTreeMap::new();
        entries.insert(0, Entry::simple(0, ResValue::new(ResValueType::IntDec, 42)));
        package.types.push(ResType {
            id: 1,
            spec: Some(TypeSpec {
                res0: 0,
                types_count: 0,
                flags: vec![0],
            }),
            configs: vec![TypeChunk {
                flags: 0,
                entry_count: 1,
                config: ResConfig::default(),
                entries,
            }],
        });
        ResTable {
            strings,
            packages: vec![package],
            unknown: Vec::new(),
        }
    }

    fn decode(bytes: &[u8]) -> (ResTable, Diagnostics) {
        let mut diag = Diagnostics::new();
        let table = ResTable::decode(bytes, &mut diag).unwrap();
        (table, diag)
    }

    #[test]
    fn minimal_table_layout() {
        let bytes = sample_table().encode().unwrap();
        assert_eq!(bytes.len(), 552);
        assert_eq!(&bytes[0..12], &[2, 0, 12, 0, 0x28, 2, 0, 0, 1, 0, 0, 0]);
        // package chunk right after the 40-byte global pool
        assert_eq!(&bytes[52..60], &[0, 2, 0x20, 1, 0xf4, 1, 0, 0]);
        let (table, diag) = decode(&bytes);
        assert!(diag.is_empty());
        assert_eq!(table, sample_table());
        assert_eq!(table.encode().unwrap(), bytes);
    }

    #[test]
    fn resolves_entries_by_id_and_name() {
        let table = sample_table();
        let id = ResId::from(0x7f01_0000);
        let resolved = table.resolve(id).unwrap();
        assert_eq!(resolved.type_name, "integer");
        assert_eq!(resolved.key, "answer");
        assert_eq!(
            table.find(&ResRef::parse("@integer/answer").unwrap()),
            Some(id)
        );
        assert_eq!(
            table.find(&ResRef::parse("@com.example:integer/answer").unwrap()),
            Some(id)
        );
        assert!(table.resolve(ResId::from(0x7f01_0001)).is_none());
        assert!(table.resolve(ResId::from(0x0101_0000)).is_none());
    }

    #[test]
    fn spec_flags_are_per_entry() {
        let mut table = sample_table();
        let package = &mut table.packages[0];
        assert_eq!(package.spec_flags(1, 0), Some(0));
        package.types[0].spec.as_mut().unwrap().flags[0] = 0x4000_0004;
        assert_eq!(package.spec_flags(1, 0), Some(0x4000_0004));
        assert_eq!(package.spec_flags(1, 1), None);
        assert_eq!(package.spec_flags(2, 0), None);
    }

    #[test]
    fn offset_layouts_are_preserved() {
        for flags in [TYPE_FLAG_SPARSE, TYPE_FLAG_OFFSET16, 0] {
            let mut table = sample_table();
            let config = &mut table.packages[0].types[0].configs[0];
            config.flags = flags;
            config.entry_count = 4;
            let value = ResValue::new(ResValueType::IntDec, 7);
            config.entries.insert(3, Entry::simple(0, value));
            if flags == TYPE_FLAG_SPARSE {
                config.entry_count = 2;
            }
            let bytes = table.encode().unwrap();
            let (decoded, _) = decode(&bytes);
            let decoded_config = &decoded.packages[0].types[0].configs[0];
            assert_eq!(decoded_config.flags, flags);
            assert_eq!(decoded_config.entries.len(), 2);
            assert_eq!(
                decoded_config.entries[&3].value,
                EntryValue::Simple(value)
            );
            assert_eq!(decoded.encode().unwrap(), bytes);
        }
    }

    #[test]
    fn complex_and_compact_entries() {
        let mut table = sample_table();
        let package = &mut table.packages[0];
        package.type_strings.push("style");
        package.key_strings.push("AppTheme");
        let mut entries = BTreeMap::new();
        entries.insert(
            0,
            Entry {
                flags: 0x0002,
                key: 1,
                compact: false,
                value: EntryValue::Complex {
                    parent: ResId::from(0x0103_000b),
                    items: vec![MapItem {
                        name: ResId::from(0x0101_0098),
                        value: ResValue::new(ResValueType::IntColorArgb8, 0xff00_00ff),
                    }],
                },
            },
        );
        package.types.push(ResType {
            id: 2,
            spec: Some(TypeSpec {
                res0: 0,
                types_count: 1,
                flags: vec![0x4000_0000],
            }),
            configs: vec![TypeChunk {
                flags: 0,
                entry_count: 1,
                config: ResConfig::default(),
                entries,
            }],
        });
        let integer = &mut package.types[0].configs[0].entries;
        integer.get_mut(&0).unwrap().compact = true;

        let bytes = table.encode().unwrap();
        let (decoded, _) = decode(&bytes);
        assert_eq!(decoded, table);
        let style = decoded.resolve(ResId::from(0x7f02_0000)).unwrap();
        assert_eq!(style.key, "AppTheme");
        assert_eq!(style.entry.flags, 0x0002);
        // two grown pools, one compact entry, one more spec and type chunk
        assert_eq!(bytes.len(), 552 + 12 + 12 - 8 + 20 + 116);
    }

    #[test]
    fn overlapping_entries_are_rejected() {
        let mut table = sample_table();
        let config = &mut table.packages[0].types[0].configs[0];
        config.entry_count = 2;
        config
            .entries
            .insert(1, Entry::simple(0, ResValue::new(ResValueType::IntDec, 1)));
        let mut bytes = table.encode().unwrap();
        // the type chunk is last; its dense offsets follow the 84-byte header
        let type_start = bytes.len() - (84 + 8 + 32);
        let second = type_start + 84 + 4;
        assert_eq!(&bytes[second..second + 4], &[16, 0, 0, 0]);
        bytes[second] = 8;
        let err = ResTable::decode(&bytes, &mut Diagnostics::new()).unwrap_err();
        assert!(err.to_string().contains("overlaps"), "{}", err);
    }

    #[test]
    fn identical_offsets_are_allowed() {
        let mut table = sample_table();
        let config = &mut table.packages[0].types[0].configs[0];
        config.entry_count = 2;
        config
            .entries
            .insert(1, Entry::simple(0, ResValue::new(ResValueType::IntDec, 1)));
        let mut bytes = table.encode().unwrap();
        let type_start = bytes.len() - (84 + 8 + 32);
        let second = type_start + 84 + 4;
        bytes[second] = 0;
        let (decoded, _) = decode(&bytes);
        let entries = &decoded.packages[0].types[0].configs[0].entries;
        assert_eq!(entries[&0], entries[&1]);
    }

    #[test]
    fn unknown_chunks_are_kept_with_a_warning() {
        let mut table = sample_table();
        table.packages[0].unknown.push(RawChunk {
            ty: ChunkType::TableOverlayable as u16,
            header: vec![0; 4],
            body: vec![1, 2, 3, 4],
        });
        let bytes = table.encode().unwrap();
        let (decoded, diag) = decode(&bytes);
        assert_eq!(diag.len(), 1);
        assert_eq!(decoded.packages[0].unknown, table.packages[0].unknown);
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn library_chunk_round_trips() {
        let mut table = sample_table();
        table.packages[0].library = Some(Library {
            entries: vec![LibraryEntry {
                package_id: 2,
                name: "com.example.lib".to_string(),
            }],
        });
        let bytes = table.encode().unwrap();
        let (decoded, diag) = decode(&bytes);
        assert!(diag.is_empty());
        assert_eq!(decoded.packages[0].library, table.packages[0].library);
    }

    #[test]
    fn declared_size_larger_than_input_fails() {
        let mut bytes = sample_table().encode().unwrap();
        bytes.truncate(300);
        let err = ResTable::decode(&bytes, &mut Diagnostics::new()).unwrap_err();
        assert!(matches!(err, ResError::MalformedChunk { .. }));
    }

    #[test]
    fn old_package_header_size_is_preserved() {
        let mut table = sample_table();
        table.packages[0].header_size = PACKAGE_HEADER_SIZE_NO_OFFSET;
        let bytes = table.encode().unwrap();
        assert_eq!(bytes.len(), 548);
        let (decoded, _) = decode(&bytes);
        assert_eq!(decoded.packages[0].header_size, PACKAGE_HEADER_SIZE_NO_OFFSET);
        assert_eq!(decoded.encode().unwrap(), bytes);
    }

    #[test]
    fn retargets_references() {
        let mut table = sample_table();
        let old = ResId::from(0x0101_0000);
        let new = ResId::from(0x0101_0001);
        let entries = &mut table.packages[0].types[0].configs[0].entries;
        entries.insert(1, Entry::simple(0, ResValue::reference(old)));
        assert_eq!(table.retarget_references(old, new), 1);
        assert!(table.values().any(|v| v.referenced_id() == Some(new)));
        assert_eq!(table.retarget_references(old, new), 0);
    }

    #[test]
    fn config_qualifiers() {
        let mut raw = ResConfig::default().raw().to_vec();
        raw[8] = b'e';
        raw[9] = b'n';
        raw[10] = b'U';
        raw[11] = b'S';
        raw[14..16].copy_from_slice(&240u16.to_le_bytes());
        raw[24..26].copy_from_slice(&21u16.to_le_bytes());
        let config = ResConfig::from_raw(raw).unwrap();
        assert_eq!(config.qualifiers(), "en-rUS-hdpi-v21");
        assert_eq!(ResConfig::default().qualifiers(), "");
        assert!(ResConfig::from_raw(vec![8, 0, 0, 0]).is_err());
    }

    #[test]
    fn packed_three_letter_language() {
        // "fil" packed as in the platform's locale encoding
        assert_eq!(unpack_locale_part([0xad, 0x05], b'a'), "fil");
    }
}
