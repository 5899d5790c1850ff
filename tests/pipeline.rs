mod common;

use apkres::core::error::ResError;
use apkres::core::framework::{FrameworkCache, FrameworkStore};
use apkres::core::packager::archive::{read_entries, ZipFileOptions};
use apkres::core::packager::pipeline::{Pipeline, PipelineOptions, State, MANIFEST};
use apkres::core::res::{NodeKind, ResId, ResValue};
use std::path::{Path, PathBuf};

fn sample_apk(dir: &Path, manifest_reference: u32) -> PathBuf {
    let mut manifest = common::application_document();
    if let NodeKind::StartElement(element) = &mut manifest.nodes[1].kind {
        element.attributes[0].typed_value = ResValue::reference(ResId::from(manifest_reference));
    }
    let mut config = common::application_document();
    config.resource_map = None;
    common::write_zip(
        &dir.join("app.apk"),
        &[
            (MANIFEST, ZipFileOptions::Compressed, manifest.encode().unwrap()),
            ("classes.dex", ZipFileOptions::Compressed, b"dex\n035\0".to_vec()),
            (
                "resources.arsc",
                ZipFileOptions::Aligned(4),
                common::app_table().encode().unwrap(),
            ),
            (
                "res/xml/network_security_config.xml",
                ZipFileOptions::Compressed,
                config.encode().unwrap(),
            ),
            ("res/drawable/icon.png", ZipFileOptions::Aligned(4), b"\x89PNG\r\n".to_vec()),
        ],
    )
}

fn frameworks(dir: &Path) -> FrameworkCache {
    FrameworkCache::new(FrameworkStore::new(dir.join("framework")), None)
}

#[test]
fn decode_then_build_reproduces_every_entry() {
    let dir = tempfile::tempdir().unwrap();
    let apk = sample_apk(dir.path(), common::NETWORK_SECURITY_CONFIG_ID);
    let frameworks = frameworks(dir.path());
    let out = dir.path().join("app");

    let mut pipeline = Pipeline::new(&frameworks, PipelineOptions::default());
    pipeline.decode_to(&apk, &out).unwrap();
    assert!(pipeline.diagnostics().is_empty());
    let text = std::fs::read_to_string(out.join("text").join(MANIFEST)).unwrap();
    assert!(text.contains("android:networkSecurityConfig=\"@xml/network_security_config\""));

    let mut build = Pipeline::new(&frameworks, PipelineOptions::default());
    let decoded = build.load(&out).unwrap();
    assert_eq!(build.state(), State::Decoded);
    let rebuilt = dir.path().join("rebuilt.apk");
    build.encode_to(&decoded, &rebuilt).unwrap();
    let first = std::fs::read(&rebuilt).unwrap();
    build.encode_to(&decoded, &rebuilt).unwrap();
    assert_eq!(std::fs::read(&rebuilt).unwrap(), first);

    let original = read_entries(&apk).unwrap();
    let rebuilt = read_entries(&rebuilt).unwrap();
    assert_eq!(original, rebuilt);
}

#[test]
fn missing_framework_warns_in_lenient_mode_and_fails_in_strict_mode() {
    let dir = tempfile::tempdir().unwrap();
    let apk = sample_apk(dir.path(), 0x0106_0000);
    let frameworks = frameworks(dir.path());

    let mut lenient = Pipeline::new(&frameworks, PipelineOptions::default());
    let decoded = lenient.decode_apk(&apk).unwrap();
    assert_eq!(decoded.info.uses_framework.ids, vec![1]);
    assert_eq!(lenient.diagnostics().len(), 1);
    assert_eq!(
        lenient.diagnostics().records()[0].entry.as_deref(),
        Some(MANIFEST)
    );

    let strict = PipelineOptions {
        strict: true,
        ..PipelineOptions::default()
    };
    let mut strict = Pipeline::new(&frameworks, strict);
    let out = dir.path().join("strict");
    let err = strict.decode_to(&apk, &out).unwrap_err();
    assert!(matches!(err.root(), ResError::Strict(_)));
    assert_eq!(strict.state(), State::Failed);
    assert!(!out.exists());
}
