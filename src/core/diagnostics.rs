//! Non-fatal findings raised while decoding.
//!
//! Decoders never print; they push a [`Warning`] into the [`Diagnostics`]
//! handed to them. Each warning is logged once, when it is recorded.

use crate::core::error::{ResError, Result};
use std::fmt;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Warning {
    /// A chunk type this crate does not model was kept as opaque bytes.
    UnknownChunk { ty: u16, offset: u64, size: u32 },
    /// An offset table ran into the region that follows it.
    TruncatedOffsetTable {
        position: u64,
        limit: u64,
        read: usize,
        expected: usize,
    },
    /// A reference whose package has no framework table available.
    UnresolvedReference { id: u32 },
    /// A pooled string could not be decoded and was replaced lossily.
    InvalidString { index: usize, reason: String },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnknownChunk { ty, offset, size } => write!(
                f,
                "skipping unknown chunk type 0x{:04x} of {} bytes at offset {}",
                ty, size, offset
            ),
            Self::TruncatedOffsetTable {
                position, limit, ..
            } => write!(
                f,
                "bad string block: string entry is at {}, past end at {}",
                position, limit
            ),
            Self::UnresolvedReference { id } => write!(
                f,
                "could not resolve reference 0x{:08x}: no framework resources for package of id: {}",
                id,
                id >> 24
            ),
            Self::InvalidString { index, reason } => {
                write!(f, "string {} is not valid: {}", index, reason)
            }
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    pub entry: Option<String>,
    pub warning: Warning,
}

#[derive(Clone, Debug, Default)]
pub struct Diagnostics {
    strict: bool,
    entry: Option<String>,
    records: Vec<Record>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn strict(strict: bool) -> Self {
        Self {
            strict,
            ..Self::default()
        }
    }

    /// A sink whose warnings are attributed to one archive entry.
    pub fn for_entry(name: impl Into<String>, strict: bool) -> Self {
        Self {
            strict,
            entry: Some(name.into()),
            records: Vec::new(),
        }
    }

    pub fn is_strict(&self) -> bool {
        self.strict
    }

    pub fn warn(&mut self, warning: Warning) {
        match &self.entry {
            Some(entry) => log::warn!("{}: {}", entry, warning),
            None => log::warn!("{}", warning),
        }
        self.records.push(Record {
            entry: self.entry.clone(),
            warning,
        });
    }

    pub fn warnings(&self) -> impl Iterator<Item = &Warning> {
        self.records.iter().map(|record| &record.warning)
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Absorb warnings collected by another sink. They were already logged.
    pub fn merge(&mut self, other: Diagnostics) {
        self.records.extend(other.records);
    }

    /// In strict mode any warning fails the artifact. An unknown chunk
    /// fails as [`ResError::UnknownChunkType`].
    pub fn check_strict(&self) -> Result<()> {
        match self.records.first() {
            Some(record) if self.strict => {
                let err = match record.warning {
                    Warning::UnknownChunk { ty, offset, .. } => {
                        ResError::UnknownChunkType { ty, offset }
                    }
                    ref other => ResError::Strict(other.clone()),
                };
                Err(match &record.entry {
                    Some(entry) => err.in_entry(entry.clone()),
                    None => err,
                })
            }
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_attributed_to_their_entry() {
        let mut diag = Diagnostics::for_entry("res/xml/a.xml", false);
        diag.warn(Warning::UnresolvedReference { id: 0x0201_0000 });
        assert_eq!(diag.records()[0].entry.as_deref(), Some("res/xml/a.xml"));

        let mut all = Diagnostics::new();
        all.merge(diag);
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn strict_mode_turns_first_warning_into_error() {
        let mut diag = Diagnostics::for_entry("resources.arsc", true);
        assert!(diag.check_strict().is_ok());
        diag.warn(Warning::UnknownChunk {
            ty: 0x0207,
            offset: 64,
            size: 8,
        });
        let err = diag.check_strict().unwrap_err();
        assert!(matches!(
            err.root(),
            ResError::UnknownChunkType {
                ty: 0x0207,
                offset: 64
            }
        ));
        assert!(err.to_string().starts_with("resources.arsc:"));
    }

    #[test]
    fn strict_mode_reports_other_warnings_as_is() {
        let mut diag = Diagnostics::strict(true);
        diag.warn(Warning::UnresolvedReference { id: 0x0101_0000 });
        let err = diag.check_strict().unwrap_err();
        assert!(matches!(
            err,
            ResError::Strict(Warning::UnresolvedReference { id: 0x0101_0000 })
        ));
    }

    #[test]
    fn lenient_mode_keeps_going() {
        let mut diag = Diagnostics::new();
        diag.warn(Warning::UnresolvedReference { id: 0x0101_0000 });
        assert!(diag.check_strict().is_ok());
        assert_eq!(diag.warnings().count(), 1);
    }
}
