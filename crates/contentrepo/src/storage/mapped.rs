//! Memory-mapped index files.
//!
//! Every index file is a fixed-layout little-endian byte array mapped into
//! memory. Mutations are written through the map and flushed for the touched
//! range only. Layout changes go through a temp file that replaces the
//! existing one, so a failed rewrite leaves the previous file in place.

use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use tempfile::NamedTempFile;

use crate::error::{file_error, RepositoryError, Result};

pub(crate) struct MappedFile {
    path: PathBuf,
    file: File,
    map: MmapMut,
}

impl std::fmt::Debug for MappedFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MappedFile")
            .field("path", &self.path)
            .field("len", &self.map.len())
            .finish()
    }
}

impl MappedFile {
    /// Opens `path`, creating it with `initial` contents when missing or empty.
    ///
    /// Returns the mapped file and whether it was created.
    pub fn open_or_create(
        path: &Path,
        initial: impl FnOnce() -> Result<Vec<u8>>,
    ) -> Result<(Self, bool)> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|error| file_error("open index file", path, error))?;
        let len = file
            .metadata()
            .map_err(|error| file_error("stat index file", path, error))?
            .len();

        let created = len == 0;
        if created {
            let bytes = initial()?;
            file.write_all(&bytes)
                .map_err(|error| file_error("initialize index file", path, error))?;
            file.sync_all()
                .map_err(|error| file_error("sync index file", path, error))?;
        }

        let map = Self::map_file(&file, path)?;
        Ok((
            Self {
                path: path.to_path_buf(),
                file,
                map,
            },
            created,
        ))
    }

    fn map_file(file: &File, path: &Path) -> Result<MmapMut> {
        // SAFETY: index files are owned exclusively by one repository root and
        // are only modified through this mapping.
        unsafe { MmapOptions::new().map_mut(file) }
            .map_err(|error| file_error("map index file", path, error))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> u64 {
        self.map.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.map
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.map
    }

    /// Flushes `len` bytes starting at `offset` to disk.
    pub fn flush_range(&self, offset: u64, len: u64) -> Result<()> {
        self.map
            .flush_range(offset as usize, len as usize)
            .map_err(|error| file_error("flush index file", &self.path, error))
    }

    pub fn flush(&self) -> Result<()> {
        self.map
            .flush()
            .map_err(|error| file_error("flush index file", &self.path, error))
    }

    /// Extends the file with zero bytes and remaps it.
    pub fn grow(&mut self, new_len: u64) -> Result<()> {
        if new_len <= self.len() {
            return Ok(());
        }
        self.map.flush().map_err(|error| file_error("flush index file", &self.path, error))?;
        self.file
            .set_len(new_len)
            .map_err(|error| file_error("grow index file", &self.path, error))?;
        self.map = Self::map_file(&self.file, &self.path)?;
        Ok(())
    }

    /// Atomically replaces the file contents with `bytes` and remaps it.
    pub fn replace_with(&mut self, bytes: &[u8]) -> Result<()> {
        let dir = self.path.parent().ok_or_else(|| {
            RepositoryError::Internal(format!(
                "index file {} has no parent directory",
                self.path.display()
            ))
        })?;
        let mut tmp = NamedTempFile::new_in(dir)
            .map_err(|error| file_error("create temp index file in", dir, error))?;
        tmp.write_all(bytes)
            .map_err(|error| file_error("write temp index file", tmp.path(), error))?;
        tmp.as_file()
            .sync_all()
            .map_err(|error| file_error("sync temp index file", tmp.path(), error))?;
        let file = tmp.persist(&self.path).map_err(|error| {
            RepositoryError::Internal(format!(
                "failed to finalize index file {}: {}",
                self.path.display(),
                error.error
            ))
        })?;

        let map = Self::map_file(&file, &self.path)?;
        self.file = file;
        self.map = map;
        Ok(())
    }
}

/// Reads the first `header_bytes` of an index file together with its length.
///
/// Returns `None` if the file is missing or shorter than the header.
pub(crate) fn read_file_header(path: &Path, header_bytes: u64) -> Option<(Vec<u8>, u64)> {
    let mut file = File::open(path).ok()?;
    let len = file.metadata().ok()?.len();
    let mut header = vec![0u8; usize::try_from(header_bytes).ok()?];
    file.read_exact(&mut header).ok()?;
    Some((header, len))
}

/// Allocates a zeroed buffer for a layout of `size` bytes.
pub(crate) fn zeroed(size: Option<u64>, what: &str) -> Result<Vec<u8>> {
    size.and_then(|size| usize::try_from(size).ok())
        .map(|size| vec![0u8; size])
        .ok_or_else(|| RepositoryError::InvalidInput(format!("{what} geometry is too large")))
}

pub(crate) fn read_u32(bytes: &[u8], offset: u64) -> u32 {
    let offset = offset as usize;
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[offset..offset + 4]);
    u32::from_le_bytes(buf)
}

pub(crate) fn read_u64(bytes: &[u8], offset: u64) -> u64 {
    let offset = offset as usize;
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[offset..offset + 8]);
    u64::from_le_bytes(buf)
}

pub(crate) fn write_u32(bytes: &mut [u8], offset: u64, value: u32) {
    let offset = offset as usize;
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn write_u64(bytes: &mut [u8], offset: u64, value: u64) {
    let offset = offset as usize;
    bytes[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_and_reopens() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("test.idx");

        let (mut file, created) =
            MappedFile::open_or_create(&path, || Ok(vec![0u8; 16])).expect("open");
        assert!(created);
        assert_eq!(file.len(), 16);
        write_u64(file.bytes_mut(), 8, 42);
        file.flush_range(8, 8).expect("flush");
        drop(file);

        let (file, created) =
            MappedFile::open_or_create(&path, || Ok(vec![0u8; 4])).expect("reopen");
        assert!(!created);
        assert_eq!(read_u64(file.bytes(), 8), 42);
    }

    #[test]
    fn grow_preserves_contents() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("grow.idx");
        let (mut file, _) = MappedFile::open_or_create(&path, || Ok(vec![0u8; 8])).expect("open");
        write_u32(file.bytes_mut(), 0, 7);
        file.grow(64).expect("grow");
        assert_eq!(file.len(), 64);
        assert_eq!(read_u32(file.bytes(), 0), 7);
        assert_eq!(read_u64(file.bytes(), 56), 0);
    }

    #[test]
    fn replace_swaps_contents() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("swap.idx");
        let (mut file, _) = MappedFile::open_or_create(&path, || Ok(vec![1u8; 8])).expect("open");
        file.replace_with(&[2u8; 12]).expect("replace");
        assert_eq!(file.len(), 12);
        assert!(file.bytes().iter().all(|b| *b == 2));
        assert_eq!(std::fs::metadata(&path).expect("stat").len(), 12);
    }

    #[test]
    fn header_of_missing_or_short_file_is_none() {
        let temp = TempDir::new().expect("tempdir");
        assert!(read_file_header(&temp.path().join("missing.idx"), 8).is_none());

        let path = temp.path().join("short.idx");
        std::fs::write(&path, [1u8; 4]).expect("write");
        assert!(read_file_header(&path, 8).is_none());
        let (header, len) = read_file_header(&path, 2).expect("header");
        assert_eq!((header, len), (vec![1u8, 1], 4));
    }

    #[test]
    fn oversized_layout_is_rejected() {
        assert!(matches!(
            zeroed(None, "hash index"),
            Err(RepositoryError::InvalidInput(_))
        ));
        assert_eq!(zeroed(Some(3), "hash index").expect("zeroed"), vec![0u8; 3]);
    }
}
