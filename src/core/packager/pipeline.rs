//! Decode an APK into an editable tree and rebuild it.
//!
//! Each artifact moves `Idle -> Decoding -> Decoded -> Encoding -> Encoded`.
//! Any error moves it to `Failed`, after which the pipeline refuses work.
//! Encoding may be repeated from `Decoded` or `Encoded`; unmodified input
//! always encodes to the same bytes.

use super::archive::{read_entries, ArchiveEntry, Zip};
use super::compress::DoNotCompress;
use crate::core::config::{ApkInfo, SdkInfo, Settings, APK_INFO_FILE};
use crate::core::diagnostics::Diagnostics;
use crate::core::error::{ResError, Result};
use crate::core::framework::{FrameworkCache, Resolver, RESOURCES_ARSC};
use crate::core::res::{is_binary_xml, render_xml, ResId, ResTable, ResValueType, XmlDocument};
use rayon::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::io::Cursor;
use std::path::{Component, Path, PathBuf};

pub const MANIFEST: &str = "AndroidManifest.xml";
const DECODED_DIR: &str = "decoded";
const TEXT_DIR: &str = "text";
const RAW_DIR: &str = "raw";
const MODEL_SUFFIX: &str = ".yml";

const ATTR_MIN_SDK_VERSION: u32 = 0x0101_020c;
const ATTR_TARGET_SDK_VERSION: u32 = 0x0101_0270;
const ATTR_MAX_SDK_VERSION: u32 = 0x0101_0271;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum State {
    Idle,
    Decoding,
    Decoded,
    Encoding,
    Encoded,
    Failed,
}

#[derive(Clone, Debug, Default)]
pub struct PipelineOptions {
    pub strict: bool,
    /// Keep compiled XML that fails to decode as a raw file.
    pub keep_broken: bool,
    pub force_utf8: bool,
    /// Patterns added to the ones recorded at decode time.
    pub do_not_compress: Vec<String>,
}

impl From<&Settings> for PipelineOptions {
    fn from(settings: &Settings) -> Self {
        Self {
            strict: settings.decode.strict,
            keep_broken: settings.decode.keep_broken,
            force_utf8: settings.build.force_utf8,
            do_not_compress: settings.build.do_not_compress.clone(),
        }
    }
}

/// The editable form of an APK.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct DecodedApk {
    pub info: ApkInfo,
    pub table: Option<ResTable>,
    pub documents: BTreeMap<String, XmlDocument>,
    /// Entries kept verbatim.
    pub files: BTreeMap<String, Vec<u8>>,
    /// Rendered text XML, keyed like `documents`. Written for reading only.
    pub text: BTreeMap<String, String>,
}

impl DecodedApk {
    /// Write the tree to `dir`, which must not exist yet. Everything is
    /// staged next to it and moved into place once complete.
    pub fn write_to(&self, dir: &Path) -> Result<()> {
        if dir.exists() {
            return Err(ResError::InvalidState(format!(
                "output directory {} already exists",
                dir.display()
            )));
        }
        let parent = match dir.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&parent)?;
        let staging = tempfile::Builder::new()
            .prefix(".apkres-")
            .tempdir_in(&parent)?;
        let root = staging.path();

        self.info.save(&root.join(APK_INFO_FILE))?;
        if let Some(table) = &self.table {
            write_file(root, DECODED_DIR, &model_name(RESOURCES_ARSC), serde_yaml::to_string(table)?.as_bytes())?;
        }
        for (name, doc) in &self.documents {
            let yaml = serde_yaml::to_string(doc).map_err(|e| ResError::from(e).in_entry(name.as_str()))?;
            write_file(root, DECODED_DIR, &model_name(name), yaml.as_bytes())?;
        }
        for (name, text) in &self.text {
            write_file(root, TEXT_DIR, name, text.as_bytes())?;
        }
        for (name, data) in &self.files {
            write_file(root, RAW_DIR, name, data)?;
        }

        fs::rename(root, dir)?;
        log::info!("Decoded tree written to: {}", dir.display());
        Ok(())
    }

    /// Load a tree written by [`DecodedApk::write_to`], possibly edited since.
    pub fn read_from(dir: &Path) -> Result<Self> {
        let info = ApkInfo::load(&dir.join(APK_INFO_FILE))?;
        let mut decoded = Self {
            info,
            ..Self::default()
        };
        for name in &decoded.info.entry_order {
            let model = entry_path(&dir.join(DECODED_DIR), &model_name(name))?;
            if model.is_file() {
                let yaml = fs::read_to_string(&model)?;
                if name == RESOURCES_ARSC {
                    let table = serde_yaml::from_str(&yaml).map_err(|e| ResError::from(e).in_entry(name.as_str()))?;
                    decoded.table = Some(table);
                } else {
                    let doc = serde_yaml::from_str(&yaml).map_err(|e| ResError::from(e).in_entry(name.as_str()))?;
                    decoded.documents.insert(name.clone(), doc);
                }
            } else {
                let raw = entry_path(&dir.join(RAW_DIR), name)?;
                let data = fs::read(&raw).map_err(|e| ResError::from(e).in_entry(name.as_str()))?;
                decoded.files.insert(name.clone(), data);
            }
        }
        Ok(decoded)
    }

    /// Ids of the packages referenced but not defined by this APK.
    pub fn referenced_frameworks(&self) -> Vec<u8> {
        let local = |id: u8| self.table.as_ref().map_or(false, |t| t.defines_package(id));
        let table_values = self.table.iter().flat_map(|t| t.values());
        let doc_values = self.documents.values().flat_map(|d| d.values());
        let ids: BTreeSet<u8> = table_values
            .chain(doc_values)
            .filter_map(|v| v.referenced_id())
            .map(ResId::package)
            .filter(|&id| id != 0 && !local(id))
            .collect();
        ids.into_iter().collect()
    }
}

fn model_name(entry: &str) -> String {
    format!("{}{}", entry, MODEL_SUFFIX)
}

/// `root/name`, refusing names that would escape `root`.
fn entry_path(root: &Path, name: &str) -> Result<PathBuf> {
    let relative = Path::new(name);
    let escapes = relative
        .components()
        .any(|c| !matches!(c, Component::Normal(_)));
    if escapes || name.is_empty() {
        return Err(ResError::InvalidState(format!("refusing entry name {:?}", name)));
    }
    Ok(root.join(relative))
}

fn write_file(root: &Path, dir: &str, name: &str, data: &[u8]) -> Result<()> {
    let path = entry_path(&root.join(dir), name)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&path, data)?;
    Ok(())
}

/// Pattern recorded for an entry the input archive stored uncompressed.
fn stored_pattern(name: &str) -> String {
    let file = name.rsplit('/').next().unwrap_or(name);
    match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() && !ext.is_empty() && !has_glob_chars(ext) => {
            ext.to_string()
        }
        _ if has_glob_chars(name) => glob::Pattern::escape(name),
        _ => name.to_string(),
    }
}

fn has_glob_chars(s: &str) -> bool {
    s.contains(['*', '?', '[', ']'])
}

fn is_compiled_xml(entry: &ArchiveEntry) -> bool {
    (entry.name == MANIFEST || entry.name.starts_with("res/")) && is_binary_xml(&entry.data)
}

pub struct Pipeline<'a> {
    state: State,
    frameworks: &'a FrameworkCache,
    options: PipelineOptions,
    diagnostics: Diagnostics,
}

impl<'a> Pipeline<'a> {
    pub fn new(frameworks: &'a FrameworkCache, options: PipelineOptions) -> Self {
        Self {
            state: State::Idle,
            frameworks,
            options,
            diagnostics: Diagnostics::new(),
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Warnings collected so far, attributed to their entries.
    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    fn transition(&mut self, allowed: &[State], next: State) -> Result<()> {
        if !allowed.contains(&self.state) {
            return Err(ResError::InvalidState(format!(
                "cannot move from {:?} to {:?}",
                self.state, next
            )));
        }
        self.state = next;
        Ok(())
    }

    fn finish<T>(&mut self, result: Result<T>, done: State) -> Result<T> {
        self.state = match result {
            Ok(_) => done,
            Err(_) => State::Failed,
        };
        result
    }

    pub fn decode_apk(&mut self, apk: &Path) -> Result<DecodedApk> {
        self.transition(&[State::Idle], State::Decoding)?;
        log::info!("Decoding {}", apk.display());
        let result = read_entries(apk).and_then(|entries| {
            let file_name = apk
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            self.decode_entries(file_name, entries)
        });
        self.finish(result, State::Decoded)
    }

    /// Decode and write the tree to `dir`. Nothing is left at `dir` on failure.
    pub fn decode_to(&mut self, apk: &Path, dir: &Path) -> Result<DecodedApk> {
        let decoded = self.decode_apk(apk)?;
        let written = decoded.write_to(dir);
        self.finish(written, State::Decoded)?;
        Ok(decoded)
    }

    /// Resume from a tree on disk, skipping the decode.
    pub fn load(&mut self, dir: &Path) -> Result<DecodedApk> {
        self.transition(&[State::Idle], State::Decoding)?;
        let result = DecodedApk::read_from(dir);
        self.finish(result, State::Decoded)
    }

    fn decode_entries(&mut self, file_name: String, entries: Vec<ArchiveEntry>) -> Result<DecodedApk> {
        let strict = self.options.strict;
        let mut decoded = DecodedApk {
            info: ApkInfo::new(file_name),
            ..DecodedApk::default()
        };
        decoded.info.uses_framework.tag = self.frameworks.tag().map(str::to_string);

        let mut xml = Vec::new();
        for entry in entries {
            decoded.info.entry_order.push(entry.name.clone());
            if entry.stored {
                decoded.info.add_do_not_compress(stored_pattern(&entry.name));
            }
            if entry.name == RESOURCES_ARSC {
                let mut diag = Diagnostics::for_entry(RESOURCES_ARSC, strict);
                let table = ResTable::decode(&entry.data, &mut diag).map_err(|e| e.in_entry(RESOURCES_ARSC))?;
                diag.check_strict()?;
                self.diagnostics.merge(diag);
                decoded.table = Some(table);
            } else if is_compiled_xml(&entry) {
                xml.push(entry);
            } else {
                decoded.files.insert(entry.name, entry.data);
            }
        }

        let keep_broken = self.options.keep_broken;
        let parsed: Vec<(ArchiveEntry, Result<(XmlDocument, Diagnostics)>)> = xml
            .into_par_iter()
            .map(|entry| {
                let mut diag = Diagnostics::for_entry(entry.name.as_str(), strict);
                let doc = XmlDocument::decode(&entry.data, &mut diag).map(|doc| (doc, diag));
                (entry, doc)
            })
            .collect();
        for (entry, result) in parsed {
            match result {
                Ok((doc, diag)) => {
                    diag.check_strict()?;
                    self.diagnostics.merge(diag);
                    decoded.documents.insert(entry.name, doc);
                }
                Err(err) if keep_broken => {
                    log::warn!("{}: keeping undecodable XML as is: {}", entry.name, err);
                    decoded.files.insert(entry.name, entry.data);
                }
                Err(err) => return Err(err.in_entry(entry.name)),
            }
        }

        decoded.info.uses_framework.ids = decoded.referenced_frameworks();
        let (text, diag) = self.render(&decoded)?;
        self.diagnostics.merge(diag);
        decoded.text = text;
        if let Some(manifest) = decoded.documents.get(MANIFEST) {
            decoded.info.sdk_info = sdk_info(manifest);
        }
        Ok(decoded)
    }

    fn render(&self, decoded: &DecodedApk) -> Result<(BTreeMap<String, String>, Diagnostics)> {
        let resolver = Resolver::new(decoded.table.as_ref(), Some(self.frameworks));
        let strict = self.options.strict;
        let rendered: Vec<Result<(String, String, Diagnostics)>> = decoded
            .documents
            .par_iter()
            .map(|(name, doc)| {
                let mut diag = Diagnostics::for_entry(name.as_str(), strict);
                let text = render_xml(doc, &resolver, &mut diag).map_err(|e| e.in_entry(name.as_str()))?;
                diag.check_strict()?;
                Ok((name.clone(), text, diag))
            })
            .collect();
        let mut text = BTreeMap::new();
        let mut all = Diagnostics::new();
        for result in rendered {
            let (name, rendered, diag) = result?;
            all.merge(diag);
            text.insert(name, rendered);
        }
        Ok((text, all))
    }

    /// Rebuild the archive. Calling it twice on the same input gives the
    /// same bytes.
    pub fn encode_apk(&mut self, decoded: &DecodedApk) -> Result<Vec<u8>> {
        self.transition(&[State::Decoded, State::Encoded], State::Encoding)?;
        let result = self.encode_entries(decoded);
        self.finish(result, State::Encoded)
    }

    pub fn encode_to(&mut self, decoded: &DecodedApk, apk: &Path) -> Result<()> {
        let bytes = self.encode_apk(decoded)?;
        let written = fs::write(apk, bytes).map_err(ResError::from);
        self.finish(written, State::Encoded)?;
        log::info!("APK written to: {}", apk.display());
        Ok(())
    }

    fn encode_entries(&self, decoded: &DecodedApk) -> Result<Vec<u8>> {
        let policy = DoNotCompress::new(
            decoded
                .info
                .do_not_compress
                .iter()
                .chain(&self.options.do_not_compress),
        )?;
        let force_utf8 = self.options.force_utf8;

        let table = match &decoded.table {
            Some(table) if force_utf8 => {
                let mut table = table.clone();
                table.force_utf8();
                Some(table.encode())
            }
            Some(table) => Some(table.encode()),
            None => None,
        }
        .transpose()
        .map_err(|e| e.in_entry(RESOURCES_ARSC))?;

        let documents: BTreeMap<&str, Vec<u8>> = decoded
            .documents
            .par_iter()
            .map(|(name, doc)| {
                let bytes = if force_utf8 {
                    let mut doc = doc.clone();
                    doc.force_utf8();
                    doc.encode()
                } else {
                    doc.encode()
                };
                bytes.map(|b| (name.as_str(), b)).map_err(|e| e.in_entry(name.as_str()))
            })
            .collect::<Result<_>>()?;

        // original order first, then anything added to the tree since
        let known: BTreeSet<&str> = decoded.info.entry_order.iter().map(String::as_str).collect();
        let added = documents
            .keys()
            .copied()
            .chain(decoded.files.keys().map(String::as_str))
            .filter(|name| !known.contains(name));
        let mut order: Vec<&str> = decoded.info.entry_order.iter().map(String::as_str).collect();
        order.extend(added.collect::<BTreeSet<_>>());

        let mut zip = Zip::new(Cursor::new(Vec::new()));
        for name in order {
            let data = match (name, &table) {
                (RESOURCES_ARSC, Some(table)) => Some(table.as_slice()),
                _ => documents
                    .get(name)
                    .or_else(|| decoded.files.get(name))
                    .map(Vec::as_slice),
            }
            .ok_or_else(|| {
                ResError::InvalidState(format!("{} is listed but missing from the tree", name))
            })?;
            zip.create_file(name, policy.options_for(name), data)?;
        }
        Ok(zip.finish()?.into_inner())
    }
}

fn sdk_info(manifest: &XmlDocument) -> SdkInfo {
    let mut info = SdkInfo::default();
    let Some(element) = manifest
        .elements()
        .find(|e| manifest.element_name(e) == Some("uses-sdk"))
    else {
        return info;
    };
    for attribute in &element.attributes {
        let id = manifest.attribute_id(attribute).map(u32::from);
        let name = manifest.attribute_name(attribute).unwrap_or_default();
        let value = match attribute.typed_value.ty() {
            Some(ResValueType::String) | None => manifest.string(attribute.raw_value).map(str::to_string),
            _ => attribute.typed_value.format_plain(&manifest.strings),
        };
        let slot = match (name, id) {
            ("minSdkVersion", _) | (_, Some(ATTR_MIN_SDK_VERSION)) => &mut info.min_sdk_version,
            ("targetSdkVersion", _) | (_, Some(ATTR_TARGET_SDK_VERSION)) => &mut info.target_sdk_version,
            ("maxSdkVersion", _) | (_, Some(ATTR_MAX_SDK_VERSION)) => &mut info.max_sdk_version,
            _ => continue,
        };
        *slot = value;
    }
    info
}
