//! Installed framework tables and reference resolution against them.
//!
//! Frameworks live in a directory as `<id>.apk` or `<id>-<tag>.apk`, each a
//! zip holding a `resources.arsc`. Tables are loaded lazily and at most once
//! per package id.

use crate::core::diagnostics::{Diagnostics, Warning};
use crate::core::error::{ResError, Result};
use crate::core::packager::archive::{extract_zip_file, Zip, ZipFileOptions};
use crate::core::res::{NameResolver, ResId, ResTable};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const RESOURCES_ARSC: &str = "resources.arsc";
const FRAMEWORK_EXTENSION: &str = "apk";

#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub struct InstalledFramework {
    pub id: u8,
    pub tag: Option<String>,
    pub path: PathBuf,
}

#[derive(Clone, Debug)]
pub struct FrameworkStore {
    dir: PathBuf,
}

impl FrameworkStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `$HOME/.local/share/apkres/framework`, or `./framework` without a home.
    pub fn default_dir() -> PathBuf {
        match std::env::var_os("HOME") {
            Some(home) => Path::new(&home).join(".local/share/apkres/framework"),
            None => PathBuf::from("framework"),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn file_name(id: u8, tag: Option<&str>) -> String {
        match tag {
            Some(tag) => format!("{}-{}.{}", id, tag, FRAMEWORK_EXTENSION),
            None => format!("{}.{}", id, FRAMEWORK_EXTENSION),
        }
    }

    /// The file to load for `id`, preferring the tagged one.
    pub fn locate(&self, id: u8, tag: Option<&str>) -> Option<PathBuf> {
        let tagged = tag.map(|tag| self.dir.join(Self::file_name(id, Some(tag))));
        tagged
            .into_iter()
            .chain(std::iter::once(self.dir.join(Self::file_name(id, None))))
            .find(|path| path.is_file())
    }

    pub fn load(&self, id: u8, tag: Option<&str>) -> Result<ResTable> {
        let path = self
            .locate(id, tag)
            .ok_or(ResError::UnresolvedFrameworkReference(id))?;
        log::info!("Loading resource table from file: {}", path.display());
        let bytes = extract_zip_file(&path, RESOURCES_ARSC)?;
        let table = ResTable::decode(&bytes, &mut Diagnostics::for_entry(path.display().to_string(), false))?;
        if !table.defines_package(id) {
            log::warn!("{} does not define package {}", path.display(), id);
            return Err(ResError::UnresolvedFrameworkReference(id));
        }
        Ok(table)
    }

    /// Install the table found in `apk`, once per package id it defines.
    pub fn install(&self, apk: &Path, tag: Option<&str>) -> Result<Vec<InstalledFramework>> {
        let bytes = extract_zip_file(apk, RESOURCES_ARSC)?;
        self.install_bytes(&bytes, tag)
    }

    pub fn install_table(&self, table: &ResTable, tag: Option<&str>) -> Result<Vec<InstalledFramework>> {
        self.install_bytes(&table.encode()?, tag)
    }

    fn install_bytes(&self, bytes: &[u8], tag: Option<&str>) -> Result<Vec<InstalledFramework>> {
        let table = ResTable::decode(bytes, &mut Diagnostics::for_entry(RESOURCES_ARSC, false))?;
        if table.packages.is_empty() {
            return Err(ResError::malformed(RESOURCES_ARSC, 0, "framework defines no package"));
        }
        fs::create_dir_all(&self.dir)?;
        let mut installed = Vec::new();
        for package in &table.packages {
            let id = package.package_id();
            let path = self.dir.join(Self::file_name(id, tag));
            let tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
            let mut zip = Zip::new(BufWriter::new(tmp));
            zip.create_file(RESOURCES_ARSC, ZipFileOptions::Aligned(4), bytes)?;
            let tmp = zip
                .finish()?
                .into_inner()
                .map_err(|e| ResError::Io(e.into_error()))?;
            tmp.persist(&path).map_err(|e| ResError::Io(e.error))?;
            log::info!("Framework installed to: {}", path.display());
            installed.push(InstalledFramework {
                id,
                tag: tag.map(str::to_string),
                path,
            });
        }
        Ok(installed)
    }

    pub fn list(&self) -> Result<Vec<InstalledFramework>> {
        let mut found = Vec::new();
        let entries = match fs::read_dir(&self.dir) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(found),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let path = entry?.path();
            if let Some((id, tag)) = parse_file_name(&path) {
                found.push(InstalledFramework { id, tag, path });
            }
        }
        found.sort();
        Ok(found)
    }

    /// Delete installed frameworks with the given tag, or all of them.
    pub fn clean(&self, tag: Option<&str>) -> Result<usize> {
        let mut removed = 0;
        for framework in self.list()? {
            if tag.is_none() || framework.tag.as_deref() == tag {
                fs::remove_file(&framework.path)?;
                log::info!("Removed {}", framework.path.display());
                removed += 1;
            }
        }
        Ok(removed)
    }
}

fn parse_file_name(path: &Path) -> Option<(u8, Option<String>)> {
    if path.extension()?.to_str()? != FRAMEWORK_EXTENSION {
        return None;
    }
    let stem = path.file_stem()?.to_str()?;
    match stem.split_once('-') {
        Some((id, tag)) if !tag.is_empty() => Some((id.parse().ok()?, Some(tag.to_string()))),
        Some(_) => None,
        None => Some((stem.parse().ok()?, None)),
    }
}

type Slot = Arc<Mutex<Option<Arc<ResTable>>>>;

/// Framework tables shared by every decode and build of a run.
///
/// Each package id has its own slot: loading one id never waits on another,
/// and concurrent requests for the same id load it once.
pub struct FrameworkCache {
    store: FrameworkStore,
    tag: Option<String>,
    slots: RwLock<HashMap<u8, Slot>>,
}

impl FrameworkCache {
    pub fn new(store: FrameworkStore, tag: Option<String>) -> Self {
        Self {
            store,
            tag,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &FrameworkStore {
        &self.store
    }

    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    fn slot(&self, id: u8) -> Slot {
        if let Some(slot) = self.slots.read().get(&id) {
            return slot.clone();
        }
        self.slots.write().entry(id).or_default().clone()
    }

    /// The table defining package `id`. Failed loads are retried next time.
    pub fn get(&self, id: u8) -> Result<Arc<ResTable>> {
        let slot = self.slot(id);
        let mut guard = slot.lock();
        if let Some(table) = guard.as_ref() {
            return Ok(table.clone());
        }
        let table = Arc::new(self.store.load(id, self.tag.as_deref())?);
        *guard = Some(table.clone());
        Ok(table)
    }

    /// Use an in-memory table for every package it defines.
    pub fn insert(&self, table: ResTable) {
        let table = Arc::new(table);
        for package in &table.packages {
            *self.slot(package.package_id()).lock() = Some(table.clone());
        }
    }

    pub fn evict(&self, id: u8) {
        self.slots.write().remove(&id);
    }

    pub fn is_loaded(&self, id: u8) -> bool {
        self.slots
            .read()
            .get(&id)
            .map_or(false, |slot| slot.lock().is_some())
    }

    /// Install into the store and drop any cached copy of the ids installed.
    pub fn install(&self, apk: &Path) -> Result<Vec<InstalledFramework>> {
        let installed = self.store.install(apk, self.tag.as_deref())?;
        for framework in &installed {
            self.evict(framework.id);
        }
        Ok(installed)
    }
}

/// A resource name resolved from an id.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ResolvedName {
    pub id: ResId,
    pub package: String,
    pub type_name: String,
    pub key: String,
    /// Defined by the table being decoded rather than a framework.
    pub local: bool,
}

/// Resolves ids against the table being processed, then the frameworks.
pub struct Resolver<'a> {
    table: Option<&'a ResTable>,
    frameworks: Option<&'a FrameworkCache>,
}

impl<'a> Resolver<'a> {
    pub fn new(table: Option<&'a ResTable>, frameworks: Option<&'a FrameworkCache>) -> Self {
        Self { table, frameworks }
    }

    pub fn resolve(&self, id: ResId) -> Result<ResolvedName> {
        let package_id = id.package();
        if let Some(table) = self.table {
            // package 0 is the dynamic id of the table's own package
            let local = match package_id {
                0 => table
                    .main_package()
                    .map(|p| ResId::new(p.package_id(), id.ty(), id.entry())),
                _ if table.defines_package(package_id) => Some(id),
                _ => None,
            };
            if let Some(local) = local {
                let entry = table.resolve(local).ok_or(ResError::ResourceNotFound(id))?;
                return Ok(ResolvedName {
                    id,
                    package: entry.package.name.clone(),
                    type_name: entry.type_name.to_string(),
                    key: entry.key.to_string(),
                    local: true,
                });
            }
        }
        let frameworks = self
            .frameworks
            .ok_or(ResError::UnresolvedFrameworkReference(package_id))?;
        let table = frameworks.get(package_id)?;
        let entry = table.resolve(id).ok_or(ResError::ResourceNotFound(id))?;
        Ok(ResolvedName {
            id,
            package: entry.package.name.clone(),
            type_name: entry.type_name.to_string(),
            key: entry.key.to_string(),
            local: false,
        })
    }

    fn resolve_or_warn(&self, id: ResId, diag: &mut Diagnostics) -> Option<ResolvedName> {
        match self.resolve(id) {
            Ok(name) => Some(name),
            Err(ResError::UnresolvedFrameworkReference(_) | ResError::ResourceNotFound(_)) => {
                diag.warn(Warning::UnresolvedReference { id: id.into() });
                None
            }
            Err(err) => {
                log::warn!("could not resolve {}: {}", id, err);
                diag.warn(Warning::UnresolvedReference { id: id.into() });
                None
            }
        }
    }
}

impl NameResolver for Resolver<'_> {
    fn reference(&self, id: ResId, attribute: bool, diag: &mut Diagnostics) -> String {
        let sigil = if attribute { '?' } else { '@' };
        match self.resolve_or_warn(id, diag) {
            Some(name) if name.local => format!("{}{}/{}", sigil, name.type_name, name.key),
            Some(name) => format!("{}{}:{}/{}", sigil, name.package, name.type_name, name.key),
            None => format!("{}{}", sigil, id),
        }
    }

    fn attribute_key(&self, id: ResId, diag: &mut Diagnostics) -> Option<String> {
        self.resolve_or_warn(id, diag).map(|name| name.key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::res::{
        Entry, Package, ResConfig, ResType, ResValue, ResValueType, StringPool, TypeChunk,
        TypeSpec,
    };
    use std::collections::BTreeMap;

    fn framework_table() -> ResTable {
        let mut package = Package::new(0x01, "android");
        package.type_strings.push("attr");
        package.key_strings.push("label");
        let mut entries = BTreeMap::new();
        entries.insert(3, Entry::simple(0, ResValue::new(ResValueType::IntDec, 0)));
        package.types.push(ResType {
            id: 1,
            spec: Some(TypeSpec {
                flags: vec![0; 4],
                ..TypeSpec::default()
            }),
            configs: vec![TypeChunk {
                flags: 0,
                entry_count: 4,
                config: ResConfig::default(),
                entries,
            }],
        });
        ResTable {
            strings: StringPool::new(true),
            packages: vec![package],
            unknown: Vec::new(),
        }
    }

    #[test]
    fn file_names_and_parsing() {
        assert_eq!(FrameworkStore::file_name(1, None), "1.apk");
        assert_eq!(FrameworkStore::file_name(1, Some("samsung")), "1-samsung.apk");
        assert_eq!(parse_file_name(Path::new("/x/1-samsung.apk")), Some((1, Some("samsung".into()))));
        assert_eq!(parse_file_name(Path::new("/x/127.apk")), Some((127, None)));
        assert_eq!(parse_file_name(Path::new("/x/notes.txt")), None);
        assert_eq!(parse_file_name(Path::new("/x/1-.apk")), None);
    }

    #[test]
    fn install_then_resolve() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FrameworkCache::new(FrameworkStore::new(dir.path()), None);
        let id = ResId::from(0x0101_0003);
        let resolver = Resolver::new(None, Some(&cache));
        assert!(matches!(
            resolver.resolve(id),
            Err(ResError::UnresolvedFrameworkReference(1))
        ));
        assert!(!cache.is_loaded(1));

        let installed = cache.store().install_table(&framework_table(), None).unwrap();
        assert_eq!(installed.len(), 1);
        assert!(installed[0].path.ends_with("1.apk"));

        let name = resolver.resolve(id).unwrap();
        assert_eq!(name.package, "android");
        assert_eq!(name.key, "label");
        assert!(cache.is_loaded(1));
        let mut diag = Diagnostics::new();
        assert_eq!(resolver.reference(id, true, &mut diag), "?android:attr/label");
        assert!(diag.is_empty());
    }

    #[test]
    fn tagged_framework_is_preferred() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrameworkStore::new(dir.path());
        store.install_table(&framework_table(), None).unwrap();
        let mut tagged = framework_table();
        tagged.packages[0].key_strings.strings[0] = "tagged_label".to_string();
        store.install_table(&tagged, Some("vendor")).unwrap();

        let table = store.load(1, Some("vendor")).unwrap();
        assert_eq!(table.packages[0].key_strings.strings[0], "tagged_label");
        let table = store.load(1, Some("other")).unwrap();
        assert_eq!(table.packages[0].key_strings.strings[0], "label");

        assert_eq!(store.list().unwrap().len(), 2);
        assert_eq!(store.clean(Some("vendor")).unwrap(), 1);
        assert_eq!(store.list().unwrap().len(), 1);
        assert_eq!(store.clean(None).unwrap(), 1);
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn failed_loads_are_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let cache = FrameworkCache::new(FrameworkStore::new(dir.path().join("missing")), None);
        assert!(cache.get(1).is_err());
        assert!(!cache.is_loaded(1));
        assert!(cache.store().list().unwrap().is_empty());
    }

    #[test]
    fn parallel_lookups_load_once() {
        let dir = tempfile::tempdir().unwrap();
        let store = FrameworkStore::new(dir.path());
        store.install_table(&framework_table(), None).unwrap();
        let cache = FrameworkCache::new(store, None);
        let tables: Vec<Arc<ResTable>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8).map(|_| s.spawn(|| cache.get(1).unwrap())).collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });
        assert!(tables.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
    }

    #[test]
    fn unresolved_reference_is_a_warning_when_rendering() {
        let resolver = Resolver::new(None, None);
        let mut diag = Diagnostics::new();
        let text = resolver.reference(ResId::from(0x0201_0000), false, &mut diag);
        assert_eq!(text, "@0x02010000");
        assert_eq!(diag.len(), 1);
    }
}
