mod common;

use apkres::core::diagnostics::Diagnostics;
use apkres::core::error::ResError;
use apkres::core::framework::{FrameworkCache, FrameworkStore, Resolver};
use apkres::core::packager::archive::ZipFileOptions;
use apkres::core::res::{NameResolver, ResId, ResTable, StringPool};

#[test]
fn resolution_succeeds_once_the_framework_is_installed() {
    let dir = tempfile::tempdir().unwrap();
    let frameworks = FrameworkCache::new(FrameworkStore::new(dir.path().join("framework")), None);

    match frameworks.get(0x01) {
        Err(ResError::UnresolvedFrameworkReference(id)) => assert_eq!(id, 0x01),
        other => panic!("expected a missing framework, got {:?}", other.map(|_| ())),
    }

    let apk = common::write_zip(
        &dir.path().join("framework-res.apk"),
        &[(
            "resources.arsc",
            ZipFileOptions::Aligned(4),
            common::android_table().encode().unwrap(),
        )],
    );
    let installed = frameworks.install(&apk).unwrap();
    assert_eq!(installed.len(), 1);
    assert_eq!(installed[0].id, 0x01);

    let table = frameworks.get(0x01).unwrap();
    assert_eq!(table.packages[0].package_id(), 0x01);

    let resolver = Resolver::new(None, Some(&frameworks));
    let mut diag = Diagnostics::new();
    let id = ResId::from(common::NETWORK_SECURITY_CONFIG_ATTR);
    assert_eq!(
        resolver.attribute_key(id, &mut diag).as_deref(),
        Some("networkSecurityConfig")
    );
    assert!(diag.is_empty());
}

#[test]
fn installing_an_apk_without_a_table_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = FrameworkStore::new(dir.path().join("framework"));
    let apk = common::write_zip(
        &dir.path().join("empty.apk"),
        &[("classes.dex", ZipFileOptions::Compressed, b"dex\n035\0".to_vec())],
    );
    assert!(store.install(&apk, None).is_err());
    assert!(store.list().unwrap().is_empty());
}

#[test]
fn installing_a_table_without_packages_fails() {
    let dir = tempfile::tempdir().unwrap();
    let store = FrameworkStore::new(dir.path().join("framework"));
    let table = ResTable {
        strings: StringPool::new(true),
        packages: Vec::new(),
        unknown: Vec::new(),
    };
    let err = store.install_table(&table, None).unwrap_err();
    assert!(matches!(err, ResError::MalformedChunk { offset: 0, .. }));
    assert!(store.list().unwrap().is_empty());
}
