use crate::core::error::Result;
use std::fs::File;
use std::io::{Read, Seek, Write};
use std::path::Path;
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ZipFileOptions {
    Aligned(u16),
    Compressed,
}

impl ZipFileOptions {
    pub fn alignment(self) -> u16 {
        match self {
            Self::Aligned(align) => align,
            _ => 1,
        }
    }

    pub fn compression_method(&self) -> CompressionMethod {
        match self {
            Self::Compressed => CompressionMethod::Deflated,
            _ => CompressionMethod::Stored,
        }
    }

    pub fn is_stored(self) -> bool {
        matches!(self, Self::Aligned(_))
    }
}

/// One file of an archive, in archive order.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ArchiveEntry {
    pub name: String,
    pub data: Vec<u8>,
    /// Whether the entry was stored without compression.
    pub stored: bool,
}

pub fn read_entries(archive: &Path) -> Result<Vec<ArchiveEntry>> {
    read_entries_from(File::open(archive)?)
}

/// Read every file entry; directory entries are skipped.
pub fn read_entries_from<R: Read + Seek>(r: R) -> Result<Vec<ArchiveEntry>> {
    let mut archive = ZipArchive::new(r)?;
    let mut entries = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let mut f = archive.by_index(i)?;
        if f.is_dir() {
            continue;
        }
        let mut data = Vec::with_capacity(f.size() as usize);
        f.read_to_end(&mut data)?;
        entries.push(ArchiveEntry {
            name: f.name().to_string(),
            stored: f.compression() == CompressionMethod::Stored,
            data,
        });
    }
    Ok(entries)
}

pub fn extract_zip_file(archive: &Path, name: &str) -> Result<Vec<u8>> {
    let mut archive = ZipArchive::new(File::open(archive)?)?;
    let mut f = archive.by_name(name)?;
    let mut buf = Vec::with_capacity(f.size() as usize);
    f.read_to_end(&mut buf)?;
    Ok(buf)
}

/// Archive writer. Timestamps are left at the zip epoch so identical
/// inputs produce identical archives.
pub struct Zip<W: Write + Seek> {
    zip: ZipWriter<W>,
}

impl<W: Write + Seek> Zip<W> {
    pub fn new(w: W) -> Self {
        Self {
            zip: ZipWriter::new(w),
        }
    }

    pub fn create_file(&mut self, name: &str, opts: ZipFileOptions, contents: &[u8]) -> Result<()> {
        let zopts = FileOptions::default()
            .compression_method(opts.compression_method())
            .unix_permissions(0o644);
        self.zip.start_file_aligned(name, zopts, opts.alignment())?;
        self.zip.write_all(contents)?;
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        Ok(self.zip.finish()?)
    }
}
