//! Codecs for the chunk-based resource formats: `resources.arsc` and
//! compiled XML. Both are little-endian trees of self-sizing chunks that
//! share the string pool encoding.

mod chunk;
mod render;
mod string_pool;
mod table;
mod value;
mod xml;

pub use chunk::{ChunkHeader, ChunkType, RawChunk};
pub use render::{render_xml, NameResolver};
pub use string_pool::{Span, StringPool};
pub use table::{
    Entry, EntryValue, Library, LibraryEntry, MapItem, Package, ResConfig, ResTable, ResType,
    ResolvedEntry, TypeChunk, TypeSpec, TYPE_FLAG_OFFSET16, TYPE_FLAG_SPARSE,
};
pub use value::{ResId, ResRef, ResValue, ResValueType};
pub use xml::{NodeKind, StartElement, XmlAttribute, XmlDocument, XmlNode};

/// Whether `data` starts with a compiled XML chunk.
pub fn is_binary_xml(data: &[u8]) -> bool {
    data.len() >= 8 && u16::from_le_bytes([data[0], data[1]]) == ChunkType::Xml as u16
}

/// Raw byte fields are kept as hex strings in the YAML model dumps.
pub(crate) mod hex_bytes {
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        hex::decode(s.trim()).map_err(D::Error::custom)
    }
}
