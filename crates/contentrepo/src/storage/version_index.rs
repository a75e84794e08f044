//! Sorted version lists addressed by the same positions as the uri index.
//!
//! File layout (little-endian):
//!
//! ```text
//! offset 0   magic               u32
//! offset 4   format version      u32
//! offset 8   capacity            u64
//! offset 16  versions per entry  u32
//! offset 20  reserved            u32
//! offset 24  entry[0] { count u32, version[0..versions per entry] u64 }
//! ```

use std::path::Path;

use super::mapped::{
    read_file_header, read_u32, read_u64, write_u32, write_u64, zeroed, MappedFile,
};
use crate::error::{RepositoryError, Result};

/// "VERX"
pub const VERSION_INDEX_MAGIC: u32 = 0x5852_4556;
pub const VERSION_INDEX_VERSION: u32 = 1;
pub const VERSION_HEADER_BYTES: u64 = 24;

const INITIAL_CAPACITY: u64 = 64;

fn entry_bytes(versions_per_entry: u32) -> u64 {
    4 + u64::from(versions_per_entry) * 8
}

fn file_size(capacity: u64, versions_per_entry: u32) -> Option<u64> {
    capacity
        .checked_mul(entry_bytes(versions_per_entry))
        .and_then(|entries| entries.checked_add(VERSION_HEADER_BYTES))
}

/// Capacity and entry width stored in `header` when it describes a valid
/// index of `len` bytes.
fn header_layout(header: &[u8], len: u64) -> Option<(u64, u32)> {
    if header.len() < VERSION_HEADER_BYTES as usize
        || read_u32(header, 0) != VERSION_INDEX_MAGIC
        || read_u32(header, 4) != VERSION_INDEX_VERSION
    {
        return None;
    }
    let capacity = read_u64(header, 8);
    let versions_per_entry = read_u32(header, 16);
    if versions_per_entry == 0 || file_size(capacity, versions_per_entry) != Some(len) {
        return None;
    }
    Some((capacity, versions_per_entry))
}

fn entry_offset(versions_per_entry: u32, address: u64) -> u64 {
    VERSION_HEADER_BYTES + address * entry_bytes(versions_per_entry)
}

fn layout(capacity: u64, versions_per_entry: u32, entries: &[(u64, Vec<u64>)]) -> Result<Vec<u8>> {
    let mut bytes = zeroed(file_size(capacity, versions_per_entry), "version index")?;
    write_u32(&mut bytes, 0, VERSION_INDEX_MAGIC);
    write_u32(&mut bytes, 4, VERSION_INDEX_VERSION);
    write_u64(&mut bytes, 8, capacity);
    write_u32(&mut bytes, 16, versions_per_entry);
    for (address, versions) in entries {
        encode_entry(&mut bytes, versions_per_entry, *address, versions);
    }
    Ok(bytes)
}

fn encode_entry(bytes: &mut [u8], versions_per_entry: u32, address: u64, versions: &[u64]) {
    let offset = entry_offset(versions_per_entry, address);
    let end = offset + entry_bytes(versions_per_entry);
    bytes[offset as usize..end as usize].fill(0);
    write_u32(bytes, offset, versions.len() as u32);
    for (i, version) in versions.iter().enumerate() {
        write_u64(bytes, offset + 4 + i as u64 * 8, *version);
    }
}

#[derive(Debug)]
pub struct VersionIndex {
    file: MappedFile,
    capacity: u64,
    versions_per_entry: u32,
}

impl VersionIndex {
    pub fn open(path: &Path, versions_per_entry: u32) -> Result<Self> {
        let versions_per_entry = versions_per_entry.max(1);
        let (file, _) =
            MappedFile::open_or_create(path, || layout(INITIAL_CAPACITY, versions_per_entry, &[]))?;

        let Some((capacity, versions_per_entry)) = header_layout(file.bytes(), file.len()) else {
            return Err(RepositoryError::CorruptIndex(format!(
                "{} is not a valid version {VERSION_INDEX_VERSION} version index",
                path.display()
            )));
        };

        Ok(Self {
            file,
            capacity,
            versions_per_entry,
        })
    }

    /// Versions stored at `address`, ascending.
    pub fn versions(&self, address: u64) -> Vec<u64> {
        if address >= self.capacity {
            return Vec::new();
        }
        let offset = entry_offset(self.versions_per_entry, address);
        let bytes = self.file.bytes();
        let count = u64::from(read_u32(bytes, offset)).min(u64::from(self.versions_per_entry));
        (0..count)
            .map(|i| read_u64(bytes, offset + 4 + i * 8))
            .collect()
    }

    pub fn has_version(&self, address: u64, version: u64) -> bool {
        self.versions(address).binary_search(&version).is_ok()
    }

    fn entries(&self) -> Vec<(u64, Vec<u64>)> {
        (0..self.capacity)
            .map(|address| (address, self.versions(address)))
            .filter(|(_, versions)| !versions.is_empty())
            .collect()
    }

    /// Makes sure `address` and `needed` versions per entry fit the layout.
    fn ensure_fits(&mut self, address: u64, needed: usize) -> Result<()> {
        let mut versions_per_entry = self.versions_per_entry;
        while (versions_per_entry as usize) < needed {
            versions_per_entry = versions_per_entry.saturating_mul(2);
        }
        let mut capacity = self.capacity.max(1);
        while capacity <= address {
            capacity = capacity.saturating_mul(2);
        }

        if versions_per_entry == self.versions_per_entry {
            if capacity > self.capacity {
                let size = file_size(capacity, versions_per_entry).ok_or_else(|| {
                    RepositoryError::InvalidInput(format!(
                        "version index capacity {capacity} is too large"
                    ))
                })?;
                self.file.grow(size)?;
                write_u64(self.file.bytes_mut(), 8, capacity);
                self.file.flush_range(8, 8)?;
                self.capacity = capacity;
            }
            return Ok(());
        }

        let entries = self.entries();
        let bytes = layout(capacity, versions_per_entry, &entries)?;
        self.file.replace_with(&bytes)?;
        log::debug!(
            "resized version index {} to {} versions per entry, capacity {}",
            self.file.path().display(),
            versions_per_entry,
            capacity
        );
        self.capacity = capacity;
        self.versions_per_entry = versions_per_entry;
        Ok(())
    }

    fn write_entry(&mut self, address: u64, versions: &[u64]) -> Result<()> {
        self.ensure_fits(address, versions.len())?;
        let versions_per_entry = self.versions_per_entry;
        encode_entry(self.file.bytes_mut(), versions_per_entry, address, versions);
        self.file.flush_range(
            entry_offset(versions_per_entry, address),
            entry_bytes(versions_per_entry),
        )
    }

    /// Adds `version` at `address`. Returns false if it was already present.
    pub fn add_version(&mut self, address: u64, version: u64) -> Result<bool> {
        let mut versions = self.versions(address);
        match versions.binary_search(&version) {
            Ok(_) => Ok(false),
            Err(position) => {
                versions.insert(position, version);
                self.write_entry(address, &versions)?;
                Ok(true)
            }
        }
    }

    /// Removes `version` at `address`. Returns false if it was not present.
    pub fn remove_version(&mut self, address: u64, version: u64) -> Result<bool> {
        let mut versions = self.versions(address);
        match versions.binary_search(&version) {
            Ok(position) => {
                versions.remove(position);
                self.write_entry(address, &versions)?;
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    /// Drops every version stored at `address`.
    pub fn clear_entry(&mut self, address: u64) -> Result<()> {
        if address < self.capacity {
            self.write_entry(address, &[])?;
        }
        Ok(())
    }

    pub fn clear(&mut self) -> Result<()> {
        let bytes = layout(INITIAL_CAPACITY, self.versions_per_entry, &[])?;
        self.file.replace_with(&bytes)?;
        self.capacity = INITIAL_CAPACITY;
        Ok(())
    }

    pub fn versions_per_entry(&self) -> u32 {
        self.versions_per_entry
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    pub fn stored_version(path: &Path) -> i32 {
        match read_file_header(path, VERSION_HEADER_BYTES) {
            Some((header, len)) if header_layout(&header, len).is_some() => {
                VERSION_INDEX_VERSION as i32
            }
            _ => -1,
        }
    }
}
