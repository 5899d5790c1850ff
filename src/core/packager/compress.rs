use super::archive::ZipFileOptions;
use crate::core::error::Result;
use glob::{MatchOptions, Pattern};

/// Extensions of formats that are already compressed or must be mapped
/// directly from the archive.
pub const NO_COMPRESS_EXTENSIONS: &[&str] = &[
    "jpg", "jpeg", "png", "gif", "wav", "mp2", "mp3", "ogg", "aac", "mpg", "mpeg", "mid", "midi",
    "smf", "jet", "rtttl", "imy", "xmf", "mp4", "m4a", "m4v", "3gp", "3gpp", "3g2", "3gpp2", "amr",
    "awb", "wma", "wmv", "webm", "webp", "mkv", "arsc",
];

/// Stored entries start on a 4-byte boundary so they can be mapped in place.
pub const STORED_ALIGNMENT: u16 = 4;

const MATCH_OPTIONS: MatchOptions = MatchOptions {
    case_sensitive: true,
    require_literal_separator: false,
    require_literal_leading_dot: false,
};

/// Decides whether an archive entry is stored or deflated.
///
/// User patterns are tried first, as globs, as literal names, or as bare
/// extensions. Then the built-in extension list. Everything else is
/// compressed.
#[derive(Clone, Debug, Default)]
pub struct DoNotCompress {
    patterns: Vec<(String, Option<Pattern>)>,
}

impl DoNotCompress {
    pub fn new<I, S>(patterns: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut policy = Self::default();
        for pattern in patterns {
            policy.add(pattern.as_ref())?;
        }
        Ok(policy)
    }

    /// Add a pattern. Names that are not valid globs still match literally.
    pub fn add(&mut self, pattern: &str) -> Result<()> {
        if self.patterns.iter().any(|(p, _)| p == pattern) {
            return Ok(());
        }
        let compiled = if has_wildcard(pattern) {
            Some(Pattern::new(pattern)?)
        } else {
            None
        };
        self.patterns.push((pattern.to_string(), compiled));
        Ok(())
    }

    pub fn patterns(&self) -> impl Iterator<Item = &str> {
        self.patterns.iter().map(|(p, _)| p.as_str())
    }

    pub fn matches_user_pattern(&self, name: &str) -> bool {
        self.patterns.iter().any(|(raw, compiled)| match compiled {
            Some(pattern) => pattern.matches_with(name, MATCH_OPTIONS),
            None => {
                name == raw
                    || (!raw.contains('/')
                        && name
                            .rsplit_once('.')
                            .map_or(false, |(_, ext)| ext == raw.trim_start_matches('.')))
            }
        })
    }

    pub fn is_stored(&self, name: &str) -> bool {
        self.matches_user_pattern(name) || has_no_compress_extension(name)
    }

    pub fn options_for(&self, name: &str) -> ZipFileOptions {
        if self.is_stored(name) {
            ZipFileOptions::Aligned(STORED_ALIGNMENT)
        } else {
            ZipFileOptions::Compressed
        }
    }
}

fn has_wildcard(pattern: &str) -> bool {
    pattern.contains(['*', '?', '['])
}

fn has_no_compress_extension(name: &str) -> bool {
    let file = name.rsplit('/').next().unwrap_or(name);
    match file.rsplit_once('.') {
        Some((_, ext)) => NO_COMPRESS_EXTENSIONS.contains(&ext),
        None => false,
    }
}
