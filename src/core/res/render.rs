use super::{NodeKind, ResId, ResValue, ResValueType, StartElement, StringPool, XmlDocument};
use crate::core::diagnostics::Diagnostics;
use crate::core::error::{ResError, Result};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::Writer;

/// Turns resource ids into the names used in text form.
pub trait NameResolver {
    /// `@[package:]type/key`, or `?...` for attribute references.
    fn reference(&self, id: ResId, attribute: bool, diag: &mut Diagnostics) -> String;

    /// The bare key of an attribute resource, e.g. `minSdkVersion`.
    fn attribute_key(&self, id: ResId, diag: &mut Diagnostics) -> Option<String>;

    fn format(&self, value: &ResValue, strings: &StringPool, diag: &mut Diagnostics) -> String {
        match value.format_plain(strings) {
            Some(text) => text,
            None => self.reference(
                ResId::from(value.data),
                value.ty().map_or(false, ResValueType::is_attribute),
                diag,
            ),
        }
    }
}

/// Render a compiled document as indented text XML.
pub fn render_xml(
    doc: &XmlDocument,
    resolver: &dyn NameResolver,
    diag: &mut Diagnostics,
) -> Result<String> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 4);
    writer.write_event(Event::Decl(BytesDecl::new("1.0", Some("utf-8"), None)))?;

    // (prefix, uri) pairs in scope, innermost last
    let mut namespaces: Vec<(i32, i32)> = Vec::new();
    let mut pending: Vec<(i32, i32)> = Vec::new();
    let mut nodes = doc.nodes.iter().peekable();
    while let Some(node) = nodes.next() {
        match &node.kind {
            NodeKind::StartNamespace { prefix, uri } => {
                namespaces.push((*prefix, *uri));
                pending.push((*prefix, *uri));
            }
            NodeKind::EndNamespace { .. } => {
                namespaces.pop();
            }
            NodeKind::StartElement(element) => {
                let name = qualified(doc, &namespaces, element.namespace, element.name);
                let mut start = BytesStart::new(name);
                for (prefix, uri) in pending.drain(..) {
                    let key = match doc.string(prefix) {
                        Some(prefix) if !prefix.is_empty() => format!("xmlns:{}", prefix),
                        _ => "xmlns".to_string(),
                    };
                    let uri = doc.string(uri).unwrap_or_default().to_string();
                    start.push_attribute((key.as_str(), uri.as_str()));
                }
                for (key, value) in attributes(doc, &namespaces, element, resolver, diag) {
                    start.push_attribute((key.as_str(), value.as_str()));
                }
                let empty = matches!(
                    nodes.peek().map(|n| &n.kind),
                    Some(NodeKind::EndElement { .. })
                );
                if empty {
                    nodes.next();
                    writer.write_event(Event::Empty(start))?;
                } else {
                    writer.write_event(Event::Start(start))?;
                }
            }
            NodeKind::EndElement { namespace, name } => {
                let name = qualified(doc, &namespaces, *namespace, *name);
                writer.write_event(Event::End(BytesEnd::new(name)))?;
            }
            NodeKind::Cdata { data, .. } => {
                let text = doc.string(*data).unwrap_or_default();
                writer.write_event(Event::Text(BytesText::new(text)))?;
            }
            NodeKind::Raw(raw) => {
                log::debug!("not rendering unknown node chunk 0x{:04x}", raw.ty);
            }
        }
    }
    String::from_utf8(writer.into_inner()).map_err(|e| ResError::InvalidString(e.to_string()))
}

fn qualified(doc: &XmlDocument, namespaces: &[(i32, i32)], namespace: i32, name: i32) -> String {
    let name = doc.string(name).unwrap_or_default();
    match prefix_for(doc, namespaces, namespace) {
        Some(prefix) => format!("{}:{}", prefix, name),
        None => name.to_string(),
    }
}

fn prefix_for<'a>(doc: &'a XmlDocument, namespaces: &[(i32, i32)], uri: i32) -> Option<&'a str> {
    if uri < 0 {
        return None;
    }
    let target = doc.string(uri);
    namespaces
        .iter()
        .rev()
        .find(|(_, u)| *u == uri || doc.string(*u) == target)
        .and_then(|(prefix, _)| doc.string(*prefix))
        .filter(|prefix| !prefix.is_empty())
}

fn attributes(
    doc: &XmlDocument,
    namespaces: &[(i32, i32)],
    element: &StartElement,
    resolver: &dyn NameResolver,
    diag: &mut Diagnostics,
) -> Vec<(String, String)> {
    element
        .attributes
        .iter()
        .map(|attribute| {
            let mut name = doc.attribute_name(attribute).unwrap_or_default().to_string();
            if name.is_empty() {
                name = match doc.attribute_id(attribute) {
                    Some(id) => resolver
                        .attribute_key(id, diag)
                        .unwrap_or_else(|| format!("attr_{:08x}", u32::from(id))),
                    None => format!("attr_{}", attribute.name),
                };
            }
            let key = match prefix_for(doc, namespaces, attribute.namespace) {
                Some(prefix) => format!("{}:{}", prefix, name),
                None => name,
            };
            let typed = &attribute.typed_value;
            let value = match doc.string(attribute.raw_value) {
                Some(raw) if typed.ty() == Some(ResValueType::String) || typed.size == 0 => {
                    raw.to_string()
                }
                _ => resolver.format(typed, &doc.strings, diag),
            };
            (key, value)
        })
        .collect()
}
