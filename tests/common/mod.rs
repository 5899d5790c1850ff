#![allow(dead_code)]

use apkres::core::packager::archive::{Zip, ZipFileOptions};
use apkres::core::res::{
    Entry, NodeKind, Package, ResConfig, ResId, ResTable, ResType, ResValue, ResValueType,
    StartElement, StringPool, TypeChunk, TypeSpec, XmlAttribute, XmlDocument, XmlNode,
};
use byteorder::{LittleEndian, WriteBytesExt};
use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};

pub const ANDROID_NS: &str = "http://schemas.android.com/apk/res/android";
pub const NETWORK_SECURITY_CONFIG_ATTR: u32 = 0x0101_0527;
pub const NETWORK_SECURITY_CONFIG_ID: u32 = 0x7f01_0000;

fn chunk_header(out: &mut Vec<u8>, ty: u16, header_size: u16, size: u32) {
    out.write_u16::<LittleEndian>(ty).unwrap();
    out.write_u16::<LittleEndian>(header_size).unwrap();
    out.write_u32::<LittleEndian>(size).unwrap();
}

/// A UTF-8 pool of short strings, laid out the way aapt2 writes it.
fn utf8_pool(strings: &[&str]) -> Vec<u8> {
    let mut data = Vec::new();
    let mut offsets = Vec::new();
    for s in strings {
        offsets.push(data.len() as u32);
        data.push(s.chars().count() as u8);
        data.push(s.len() as u8);
        data.extend_from_slice(s.as_bytes());
        data.push(0);
    }
    while data.len() % 4 != 0 {
        data.push(0);
    }
    let strings_start = 28 + 4 * strings.len() as u32;
    let mut out = Vec::new();
    chunk_header(&mut out, 0x0001, 28, strings_start + data.len() as u32);
    out.write_u32::<LittleEndian>(strings.len() as u32).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    out.write_u32::<LittleEndian>(0x100).unwrap();
    out.write_u32::<LittleEndian>(strings_start).unwrap();
    out.write_u32::<LittleEndian>(0).unwrap();
    for offset in offsets {
        out.write_u32::<LittleEndian>(offset).unwrap();
    }
    out.extend(data);
    out
}

/// `resources.arsc` bytes for package 0x7f with `integer/answer = 42`.
pub fn minimal_table_bytes() -> Vec<u8> {
    let global = utf8_pool(&["hello"]);
    let type_strings = utf8_pool(&["integer"]);
    let key_strings = utf8_pool(&["answer"]);

    let mut spec = Vec::new();
    chunk_header(&mut spec, 0x0202, 16, 20);
    spec.extend_from_slice(&[1, 0, 0, 0]);
    spec.write_u32::<LittleEndian>(1).unwrap();
    spec.write_u32::<LittleEndian>(0).unwrap();

    let mut ty = Vec::new();
    chunk_header(&mut ty, 0x0201, 84, 104);
    ty.extend_from_slice(&[1, 0, 0, 0]);
    ty.write_u32::<LittleEndian>(1).unwrap();
    ty.write_u32::<LittleEndian>(88).unwrap();
    let mut config = vec![0u8; 64];
    config[0] = 64;
    ty.extend(config);
    ty.write_u32::<LittleEndian>(0).unwrap();
    // entry: size, flags, key, then the value
    ty.write_u16::<LittleEndian>(8).unwrap();
    ty.write_u16::<LittleEndian>(0).unwrap();
    ty.write_u32::<LittleEndian>(0).unwrap();
    ty.write_u16::<LittleEndian>(8).unwrap();
    ty.extend_from_slice(&[0, 0x10]);
    ty.write_u32::<LittleEndian>(42).unwrap();

    let mut package = Vec::new();
    let package_size = 288 + type_strings.len() + key_strings.len() + spec.len() + ty.len();
    chunk_header(&mut package, 0x0200, 288, package_size as u32);
    package.write_u32::<LittleEndian>(0x7f).unwrap();
    let mut name = [0u16; 128];
    for (slot, unit) in name.iter_mut().zip("com.example".encode_utf16()) {
        *slot = unit;
    }
    for unit in name {
        package.write_u16::<LittleEndian>(unit).unwrap();
    }
    package.write_u32::<LittleEndian>(288).unwrap();
    package.write_u32::<LittleEndian>(0).unwrap();
    package.write_u32::<LittleEndian>(288 + type_strings.len() as u32).unwrap();
    package.write_u32::<LittleEndian>(0).unwrap();
    package.write_u32::<LittleEndian>(0).unwrap();
    package.extend(type_strings);
    package.extend(key_strings);
    package.extend(spec);
    package.extend(ty);

    let mut table = Vec::new();
    chunk_header(&mut table, 0x0002, 12, (12 + global.len() + package.len()) as u32);
    table.write_u32::<LittleEndian>(1).unwrap();
    table.extend(global);
    table.extend(package);
    table
}

fn one_entry_type(id: u8, entry: u16, value: ResValue) -> ResType {
    let mut entries = BTreeMap::new();
    entries.insert(entry, Entry::simple(0, value));
    ResType {
        id,
        spec: Some(TypeSpec {
            flags: vec![0; entry as usize + 1],
            ..TypeSpec::default()
        }),
        configs: vec![TypeChunk {
            flags: 0,
            entry_count: entry as u32 + 1,
            config: ResConfig::default(),
            entries,
        }],
    }
}

/// An application table defining `xml/network_security_config`.
pub fn app_table() -> ResTable {
    let mut strings = StringPool::new(true);
    let path = strings.push("res/xml/network_security_config.xml");
    let mut package = Package::new(0x7f, "com.example");
    package.type_strings.push("xml");
    package.key_strings.push("network_security_config");
    package
        .types
        .push(one_entry_type(1, 0, ResValue::new(ResValueType::String, path)));
    ResTable {
        strings,
        packages: vec![package],
        unknown: Vec::new(),
    }
}

/// A framework table defining `android:attr/networkSecurityConfig`.
pub fn android_table() -> ResTable {
    let mut package = Package::new(0x01, "android");
    package.type_strings.push("attr");
    package.key_strings.push("networkSecurityConfig");
    package
        .types
        .push(one_entry_type(1, 0x0527, ResValue::new(ResValueType::IntDec, 0)));
    ResTable {
        strings: StringPool::new(true),
        packages: vec![package],
        unknown: Vec::new(),
    }
}

/// `<application android:networkSecurityConfig="@xml/network_security_config"/>`
pub fn application_document() -> XmlDocument {
    let mut strings = StringPool::new(true);
    let attr = strings.push("networkSecurityConfig") as i32;
    let prefix = strings.push("android") as i32;
    let uri = strings.push(ANDROID_NS) as i32;
    let application = strings.push("application") as i32;
    let element = StartElement::new(
        -1,
        application,
        vec![XmlAttribute {
            namespace: uri,
            name: attr,
            raw_value: -1,
            typed_value: ResValue::reference(ResId::from(NETWORK_SECURITY_CONFIG_ID)),
        }],
    );
    XmlDocument {
        strings,
        resource_map: Some(vec![NETWORK_SECURITY_CONFIG_ATTR]),
        nodes: vec![
            XmlNode::new(1, NodeKind::StartNamespace { prefix, uri }),
            XmlNode::new(2, NodeKind::StartElement(element)),
            XmlNode::new(2, NodeKind::EndElement { namespace: -1, name: application }),
            XmlNode::new(2, NodeKind::EndNamespace { prefix, uri }),
        ],
    }
}

pub fn write_zip(path: &Path, entries: &[(&str, ZipFileOptions, Vec<u8>)]) -> PathBuf {
    let mut zip = Zip::new(Cursor::new(Vec::new()));
    for (name, options, data) in entries {
        zip.create_file(name, *options, data).unwrap();
    }
    std::fs::write(path, zip.finish().unwrap().into_inner()).unwrap();
    path.to_path_buf()
}
