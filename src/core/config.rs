use crate::core::error::Result;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// User settings, looked up in the working directory.
pub const SETTINGS_FILE: &str = "apkres.toml";

/// Metadata written next to a decoded tree and read back by a build.
pub const APK_INFO_FILE: &str = "apkres.yml";

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct Settings {
    /// Every section carries `#[serde(default)]`: a missing or broken
    /// `[build]` group must not throw away a valid `[framework]` group.
    #[serde(default)]
    pub framework: FrameworkSettings,

    #[serde(default)]
    pub decode: DecodeSettings,

    #[serde(default)]
    pub build: BuildSettings,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct FrameworkSettings {
    /// Defaults to `FrameworkStore::default_dir()` when unset.
    pub dir: Option<PathBuf>,
    pub tag: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct DecodeSettings {
    /// Fail an artifact on its first warning.
    #[serde(default)]
    pub strict: bool,
    /// Keep compiled XML that fails to decode as a raw file instead of failing.
    #[serde(default)]
    pub keep_broken: bool,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq)]
pub struct BuildSettings {
    #[serde(default)]
    pub force_utf8: bool,
    /// Appended to the patterns recorded in `apkres.yml`.
    #[serde(default)]
    pub do_not_compress: Vec<String>,
}

impl Settings {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(toml::from_str(&content)?)
    }
}

/// Read settings from `path`. A missing file gives the defaults; so does a
/// malformed one, after a warning, so the user can fix it and run again.
pub fn parse_settings(path: &Path) -> Settings {
    if !path.exists() {
        return Settings::default();
    }
    match Settings::load(path) {
        Ok(settings) => settings,
        Err(e) => {
            log::warn!("Ignoring malformed {}: {}", path.display(), e);
            Settings::default()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct UsesFramework {
    #[serde(default)]
    pub ids: Vec<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct SdkInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_sdk_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_sdk_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_sdk_version: Option<String>,
}

/// What a build needs to know about the archive a tree was decoded from.
#[derive(Debug, Serialize, Deserialize, Default, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ApkInfo {
    #[serde(default = "default_version")]
    pub version: String,
    #[serde(default)]
    pub apk_file_name: String,
    #[serde(default)]
    pub uses_framework: UsesFramework,
    #[serde(default)]
    pub sdk_info: SdkInfo,
    /// Patterns for entries to store uncompressed, in the order found.
    #[serde(default)]
    pub do_not_compress: Vec<String>,
    /// Archive entry names in their original order.
    #[serde(default)]
    pub entry_order: Vec<String>,
}

fn default_version() -> String {
    VERSION.to_string()
}

impl ApkInfo {
    pub fn new(apk_file_name: impl Into<String>) -> Self {
        Self {
            version: default_version(),
            apk_file_name: apk_file_name.into(),
            ..Self::default()
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn add_do_not_compress(&mut self, pattern: impl Into<String>) {
        let pattern = pattern.into();
        if !self.do_not_compress.contains(&pattern) {
            self.do_not_compress.push(pattern);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::ResError;
    use tempfile::tempdir;

    fn with_settings_file(content: &str, f: impl Fn(&Path)) {
        let dir = tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        fs::write(&path, content).unwrap();
        f(&path)
    }

    #[test]
    fn should_read_all_sections() {
        with_settings_file(
            r#"
                [framework]
                dir = "/opt/frameworks"
                tag = "samsung"

                [decode]
                strict = true

                [build]
                force_utf8 = true
                do_not_compress = ["assets/*.bin"]
            "#,
            |path| {
                let settings = parse_settings(path);
                assert_eq!(settings.framework.dir, Some(PathBuf::from("/opt/frameworks")));
                assert_eq!(settings.framework.tag.as_deref(), Some("samsung"));
                assert!(settings.decode.strict);
                assert!(!settings.decode.keep_broken);
                assert!(settings.build.force_utf8);
                assert_eq!(settings.build.do_not_compress, vec!["assets/*.bin"]);
            },
        );
    }

    #[test]
    fn should_default_missing_sections() {
        with_settings_file("[decode]\nstrict = true\n", |path| {
            let settings = parse_settings(path);
            assert!(settings.decode.strict);
            assert_eq!(settings.build, BuildSettings::default());
            assert_eq!(settings.framework, FrameworkSettings::default());
        });
    }

    #[test]
    fn should_fall_back_on_malformed_file() {
        with_settings_file("[decode\nstrict = ", |path| {
            assert!(matches!(Settings::load(path), Err(ResError::Toml(_))));
            assert_eq!(parse_settings(path), Settings::default());
        });
        assert_eq!(parse_settings(Path::new("/nonexistent/apkres.toml")), Settings::default());
    }

    #[test]
    fn apk_info_round_trips_non_ascii_patterns() {
        let dir = tempdir().unwrap();
        let path = dir.path().join(APK_INFO_FILE);
        let mut info = ApkInfo::new("app.apk");
        info.uses_framework.ids.push(1);
        info.sdk_info.min_sdk_version = Some("21".to_string());
        info.add_do_not_compress("assets/AllAssetBundles/Andriod/tx_1001_冰原1");
        info.add_do_not_compress("png");
        info.add_do_not_compress("png");
        info.save(&path).unwrap();

        let text = fs::read_to_string(&path).unwrap();
        assert!(text.contains("apkFileName: app.apk"));
        assert!(text.contains("usesFramework:"));

        let loaded = ApkInfo::load(&path).unwrap();
        assert_eq!(loaded, info);
        assert_eq!(loaded.do_not_compress.len(), 2);
        assert_eq!(loaded.do_not_compress[0], "assets/AllAssetBundles/Andriod/tx_1001_冰原1");
    }
}
