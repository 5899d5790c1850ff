use super::chunk::{children, input_at, ChunkHeader, ChunkType, ChunkWriter, RawChunk};
use super::{ResId, ResValue, ResValueType, StringPool};
use crate::core::diagnostics::{Diagnostics, Warning};
use crate::core::error::{ResError, Result};
use crate::core::stream::ExtDataOutput;
use serde::{Deserialize, Serialize};
use std::io::{Cursor, Read, Seek, Write};

const NODE_HEADER_SIZE: u16 = 16;
const ATTRIBUTE_START: u16 = 0x0014;
const ATTRIBUTE_SIZE: u16 = 0x0014;

fn no_index() -> i32 {
    -1
}

fn default_attribute_layout() -> u16 {
    ATTRIBUTE_START
}

/// A compiled XML document such as `AndroidManifest.xml`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct XmlDocument {
    pub strings: StringPool,
    /// Attribute resource ids, indexed like the leading pool strings.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_map: Option<Vec<u32>>,
    pub nodes: Vec<XmlNode>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct XmlNode {
    /// Line number in the original source file.
    #[serde(default)]
    pub line_number: u32,
    /// Pool index of a comment attached to the node, -1 if none.
    #[serde(default = "no_index")]
    pub comment: i32,
    /// Node header bytes past line number and comment.
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "super::hex_bytes")]
    pub header_extra: Vec<u8>,
    pub kind: NodeKind,
}

impl XmlNode {
    pub fn new(line_number: u32, kind: NodeKind) -> Self {
        Self {
            line_number,
            comment: -1,
            header_extra: Vec::new(),
            kind,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub enum NodeKind {
    StartNamespace { prefix: i32, uri: i32 },
    EndNamespace { prefix: i32, uri: i32 },
    StartElement(StartElement),
    EndElement { namespace: i32, name: i32 },
    Cdata { data: i32, value: ResValue },
    /// A node chunk of unknown type; line and comment are not written for it.
    Raw(RawChunk),
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct StartElement {
    /// String of the full namespace of this element, -1 if none.
    pub namespace: i32,
    pub name: i32,
    /// Index (1-based) of the "id" attribute. 0 if none.
    #[serde(default)]
    pub id_index: u16,
    /// Index (1-based) of the "class" attribute. 0 if none.
    #[serde(default)]
    pub class_index: u16,
    /// Index (1-based) of the "style" attribute. 0 if none.
    #[serde(default)]
    pub style_index: u16,
    /// Offset of the first attribute from the element fields.
    #[serde(default = "default_attribute_layout")]
    pub attribute_start: u16,
    /// Distance between attributes. Bytes past the known fields are zero.
    #[serde(default = "default_attribute_layout")]
    pub attribute_size: u16,
    pub attributes: Vec<XmlAttribute>,
}

impl StartElement {
    pub fn new(namespace: i32, name: i32, attributes: Vec<XmlAttribute>) -> Self {
        Self {
            namespace,
            name,
            id_index: 0,
            class_index: 0,
            style_index: 0,
            attribute_start: ATTRIBUTE_START,
            attribute_size: ATTRIBUTE_SIZE,
            attributes,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
pub struct XmlAttribute {
    pub namespace: i32,
    pub name: i32,
    /// Pool index of the original string value, -1 if none.
    pub raw_value: i32,
    pub typed_value: ResValue,
}

impl XmlDocument {
    pub fn read<R: Read>(mut r: R, diag: &mut Diagnostics) -> Result<Self> {
        let mut data = Vec::new();
        r.read_to_end(&mut data)?;
        Self::decode(&data, diag)
    }

    pub fn decode(data: &[u8], diag: &mut Diagnostics) -> Result<Self> {
        let header = ChunkHeader::read_at(data, 0, data.len() as u64)?;
        if header.kind() != Some(ChunkType::Xml) {
            return Err(header.malformed("expected an XML document"));
        }
        let mut strings = None;
        let mut resource_map = None;
        let mut nodes = Vec::new();
        for child in children(data, header.header_end(), header.end()) {
            let child = child?;
            match child.kind() {
                Some(ChunkType::StringPool) if strings.is_none() => {
                    strings = Some(StringPool::decode(data, &child, diag)?);
                }
                Some(ChunkType::XmlResourceMap) if resource_map.is_none() => {
                    let mut r = child.body(data)?;
                    r.jump_to(child.header_end())?;
                    let count = (child.end() - child.header_end()) / 4;
                    resource_map = Some(r.read_u32_array(count as usize)?);
                }
                Some(
                    ChunkType::XmlStartNamespace
                    | ChunkType::XmlEndNamespace
                    | ChunkType::XmlStartElement
                    | ChunkType::XmlEndElement
                    | ChunkType::XmlCdata,
                ) => nodes.push(XmlNode::decode(data, &child)?),
                _ => {
                    diag.warn(Warning::UnknownChunk {
                        ty: child.ty,
                        offset: child.offset,
                        size: child.size,
                    });
                    nodes.push(XmlNode::new(0, NodeKind::Raw(RawChunk::read(data, &child)?)));
                }
            }
        }
        let strings = strings.ok_or_else(|| header.malformed("missing string pool"))?;
        log::trace!(
            "xml document: {} strings, {} nodes",
            strings.len(),
            nodes.len()
        );
        Ok(Self {
            strings,
            resource_map,
            nodes,
        })
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut w = ExtDataOutput::little_endian(Cursor::new(Vec::new()));
        self.write(&mut w)?;
        Ok(w.into_inner().into_inner())
    }

    pub fn write<W: Write + Seek>(&self, w: &mut ExtDataOutput<W>) -> Result<()> {
        let mut chunk = ChunkWriter::start_chunk(ChunkType::Xml as u16, w)?;
        chunk.end_header(w)?;
        self.strings.write(w)?;
        if let Some(ids) = &self.resource_map {
            let mut map = ChunkWriter::start_chunk(ChunkType::XmlResourceMap as u16, w)?;
            map.end_header(w)?;
            for id in ids {
                w.write_u32(*id)?;
            }
            map.end_chunk(w)?;
        }
        for node in &self.nodes {
            node.write(w)?;
        }
        chunk.end_chunk(w)?;
        Ok(())
    }

    pub fn string(&self, index: i32) -> Option<&str> {
        u32::try_from(index).ok().and_then(|i| self.strings.get(i))
    }

    pub fn elements(&self) -> impl Iterator<Item = &StartElement> {
        self.nodes.iter().filter_map(|node| match &node.kind {
            NodeKind::StartElement(element) => Some(element),
            _ => None,
        })
    }

    pub fn element_name(&self, element: &StartElement) -> Option<&str> {
        self.string(element.name)
    }

    /// The attribute's name from the pool; may be empty for obfuscated
    /// documents, see [`XmlDocument::attribute_id`].
    pub fn attribute_name(&self, attribute: &XmlAttribute) -> Option<&str> {
        self.string(attribute.name)
    }

    /// The attribute resource id the name maps to through the resource map.
    pub fn attribute_id(&self, attribute: &XmlAttribute) -> Option<ResId> {
        let index = usize::try_from(attribute.name).ok()?;
        let id = *self.resource_map.as_ref()?.get(index)?;
        (id != 0).then(|| ResId::from(id))
    }

    /// Locate an attribute by element and attribute name, returning
    /// `(node index, attribute index)`.
    pub fn find_attribute(&self, element: &str, attribute: &str) -> Option<(usize, usize)> {
        self.nodes
            .iter()
            .enumerate()
            .find_map(|(node_index, node)| match &node.kind {
                NodeKind::StartElement(el) if self.element_name(el) == Some(element) => el
                    .attributes
                    .iter()
                    .position(|a| self.attribute_name(a) == Some(attribute))
                    .map(|attr_index| (node_index, attr_index)),
                _ => None,
            })
    }

    /// Replace an attribute's typed value. The raw string is kept only for
    /// string values, which carry it in both places.
    pub fn set_attribute_value(
        &mut self,
        node: usize,
        attribute: usize,
        value: ResValue,
    ) -> Result<()> {
        let target = match self.nodes.get_mut(node).map(|n| &mut n.kind) {
            Some(NodeKind::StartElement(element)) => element.attributes.get_mut(attribute),
            _ => None,
        };
        let target = target.ok_or(ResError::NoSuchAttribute { node, attribute })?;
        target.raw_value = match value.ty() {
            Some(ResValueType::String) => value.data as i32,
            _ => -1,
        };
        target.typed_value = value;
        Ok(())
    }

    pub fn values(&self) -> impl Iterator<Item = &ResValue> {
        self.nodes.iter().flat_map(node_values)
    }

    /// Point every reference to `from` at `to`, returning how many were changed.
    pub fn retarget_references(&mut self, from: ResId, to: ResId) -> usize {
        let mut changed = 0;
        for node in &mut self.nodes {
            if let NodeKind::StartElement(element) = &mut node.kind {
                for attribute in &mut element.attributes {
                    if attribute.typed_value.referenced_id() == Some(from) {
                        attribute.typed_value.data = to.into();
                        changed += 1;
                    }
                }
            }
        }
        changed
    }

    pub fn force_utf8(&mut self) {
        self.strings.utf8 = true;
    }
}

fn node_values(node: &XmlNode) -> Box<dyn Iterator<Item = &ResValue> + '_> {
    match &node.kind {
        NodeKind::StartElement(element) => {
            Box::new(element.attributes.iter().map(|a| &a.typed_value))
        }
        NodeKind::Cdata { value, .. } => Box::new(std::iter::once(value)),
        _ => Box::new(std::iter::empty()),
    }
}

impl XmlNode {
    fn decode(data: &[u8], header: &ChunkHeader) -> Result<Self> {
        if header.header_size < NODE_HEADER_SIZE {
            return Err(header.malformed(format!(
                "node header is {} bytes, expected {}",
                header.header_size, NODE_HEADER_SIZE
            )));
        }
        let mut r = header.body(data)?;
        let line_number = r.read_u32()?;
        let comment = r.read_i32()?;
        let header_extra = r.read_bytes((header.header_size - NODE_HEADER_SIZE) as usize)?;
        let kind = match header.kind() {
            Some(ChunkType::XmlStartNamespace) => NodeKind::StartNamespace {
                prefix: r.read_i32()?,
                uri: r.read_i32()?,
            },
            Some(ChunkType::XmlEndNamespace) => NodeKind::EndNamespace {
                prefix: r.read_i32()?,
                uri: r.read_i32()?,
            },
            Some(ChunkType::XmlEndElement) => NodeKind::EndElement {
                namespace: r.read_i32()?,
                name: r.read_i32()?,
            },
            Some(ChunkType::XmlCdata) => NodeKind::Cdata {
                data: r.read_i32()?,
                value: ResValue::read(&mut r)?,
            },
            Some(ChunkType::XmlStartElement) => {
                let ext_start = r.position();
                let namespace = r.read_i32()?;
                let name = r.read_i32()?;
                let attribute_start = r.read_u16()?;
                let attribute_size = r.read_u16()?;
                let attribute_count = r.read_u16()?;
                let id_index = r.read_u16()?;
                let class_index = r.read_u16()?;
                let style_index = r.read_u16()?;
                if attribute_count > 0 && attribute_start < ATTRIBUTE_START {
                    return Err(header.malformed(format!(
                        "attribute start {} lies inside the element fields",
                        attribute_start
                    )));
                }
                if attribute_count > 0 && attribute_size < ATTRIBUTE_SIZE {
                    return Err(header.malformed(format!(
                        "attribute size {} is smaller than {}",
                        attribute_size, ATTRIBUTE_SIZE
                    )));
                }
                let mut attributes = Vec::with_capacity(attribute_count as usize);
                for i in 0..attribute_count as u64 {
                    let at = ext_start + attribute_start as u64 + i * attribute_size as u64;
                    let mut a = input_at(data, at, header.end()).map_err(|_| {
                        header.malformed(format!("attribute {} lies past the chunk end", i))
                    })?;
                    attributes.push(XmlAttribute {
                        namespace: a.read_i32()?,
                        name: a.read_i32()?,
                        raw_value: a.read_i32()?,
                        typed_value: ResValue::read(&mut a)?,
                    });
                }
                NodeKind::StartElement(StartElement {
                    namespace,
                    name,
                    id_index,
                    class_index,
                    style_index,
                    attribute_start,
                    attribute_size,
                    attributes,
                })
            }
            _ => return Err(header.malformed("not an XML node")),
        };
        Ok(Self {
            line_number,
            comment,
            header_extra,
            kind,
        })
    }

    fn write<W: Write + Seek>(&self, w: &mut ExtDataOutput<W>) -> Result<()> {
        let ty = match &self.kind {
            NodeKind::Raw(raw) => return raw.write(w),
            NodeKind::StartNamespace { .. } => ChunkType::XmlStartNamespace,
            NodeKind::EndNamespace { .. } => ChunkType::XmlEndNamespace,
            NodeKind::StartElement(_) => ChunkType::XmlStartElement,
            NodeKind::EndElement { .. } => ChunkType::XmlEndElement,
            NodeKind::Cdata { .. } => ChunkType::XmlCdata,
        };
        let mut chunk = ChunkWriter::start_chunk(ty as u16, w)?;
        w.write_u32(self.line_number)?;
        w.write_i32(self.comment)?;
        w.write_bytes(&self.header_extra)?;
        chunk.end_header(w)?;
        match &self.kind {
            NodeKind::StartNamespace { prefix, uri } | NodeKind::EndNamespace { prefix, uri } => {
                w.write_i32(*prefix)?;
                w.write_i32(*uri)?;
            }
            NodeKind::EndElement { namespace, name } => {
                w.write_i32(*namespace)?;
                w.write_i32(*name)?;
            }
            NodeKind::Cdata { data, value } => {
                w.write_i32(*data)?;
                value.write(w)?;
            }
            NodeKind::StartElement(element) => {
                let count = u16::try_from(element.attributes.len()).map_err(|_| {
                    ResError::EncodingSizeMismatch {
                        what: "attribute count".to_string(),
                        size: element.attributes.len() as u64,
                        max: u16::MAX as u64,
                    }
                })?;
                // Attributes never overlap the fields; an empty element keeps what it had.
                let (attribute_start, attribute_size) = if element.attributes.is_empty() {
                    (element.attribute_start, element.attribute_size)
                } else {
                    (
                        element.attribute_start.max(ATTRIBUTE_START),
                        element.attribute_size.max(ATTRIBUTE_SIZE),
                    )
                };
                w.write_i32(element.namespace)?;
                w.write_i32(element.name)?;
                w.write_u16(attribute_start)?;
                w.write_u16(attribute_size)?;
                w.write_u16(count)?;
                w.write_u16(element.id_index)?;
                w.write_u16(element.class_index)?;
                w.write_u16(element.style_index)?;
                if !element.attributes.is_empty() {
                    w.write_zeros((attribute_start - ATTRIBUTE_START) as usize)?;
                }
                for attribute in &element.attributes {
                    w.write_i32(attribute.namespace)?;
                    w.write_i32(attribute.name)?;
                    w.write_i32(attribute.raw_value)?;
                    attribute.typed_value.write(w)?;
                    w.write_zeros((attribute_size - ATTRIBUTE_SIZE) as usize)?;
                }
            }
            NodeKind::Raw(_) => {}
        }
        chunk.end_chunk(w)?;
        Ok(())
    }
}
