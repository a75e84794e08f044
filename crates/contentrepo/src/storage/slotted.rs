//! On-disk open-addressing hash index with fixed-capacity slots.
//!
//! File layout (little-endian):
//!
//! ```text
//! offset 0   magic            u32
//! offset 4   format version   u32
//! offset 8   slot count       u64
//! offset 16  entries per slot u64
//! offset 24  slot[0] { entry count u32, entry[0..entries_per_slot] { address u64 } }
//!            ... repeated per slot
//! ```
//!
//! A key is hashed (FNV-1a) into a slot and the slot stores addresses only.
//! `locate` therefore yields candidates which callers verify against the
//! stored key.

use std::hash::Hasher;
use std::path::{Path, PathBuf};

use fnv::FnvHasher;
use parking_lot::RwLock;

use super::mapped::{
    read_file_header, read_u32, read_u64, write_u32, write_u64, zeroed, MappedFile,
};
use crate::error::{RepositoryError, Result};

/// "SHIX"
pub const SLOTTED_INDEX_MAGIC: u32 = 0x5849_4853;
pub const SLOTTED_INDEX_VERSION: u32 = 1;
pub const SLOTTED_HEADER_BYTES: u64 = 24;

const SLOT_COUNT_BYTES: u64 = 4;
const ENTRY_BYTES: u64 = 8;

/// Total file size for a geometry, or `None` if it does not fit in a `u64`.
pub fn slotted_file_size(slots: u64, entries_per_slot: u64) -> Option<u64> {
    entries_per_slot
        .checked_mul(ENTRY_BYTES)
        .and_then(|entries| entries.checked_add(SLOT_COUNT_BYTES))
        .and_then(|slot_bytes| slot_bytes.checked_mul(slots))
        .and_then(|body| body.checked_add(SLOTTED_HEADER_BYTES))
}

/// Geometry stored in `header` when it describes a valid index of `len` bytes.
fn header_geometry(header: &[u8], len: u64) -> Option<(u64, u64)> {
    if header.len() < SLOTTED_HEADER_BYTES as usize
        || read_u32(header, 0) != SLOTTED_INDEX_MAGIC
        || read_u32(header, 4) != SLOTTED_INDEX_VERSION
    {
        return None;
    }
    let slots = read_u64(header, 8);
    let entries_per_slot = read_u64(header, 16);
    if slots == 0 || entries_per_slot == 0 || slotted_file_size(slots, entries_per_slot) != Some(len) {
        return None;
    }
    Some((slots, entries_per_slot))
}

pub fn hash_key(key: &[u8]) -> u64 {
    let mut hasher = FnvHasher::default();
    hasher.write(key);
    hasher.finish()
}

#[derive(Debug)]
struct SlottedState {
    file: MappedFile,
    slots: u64,
    entries_per_slot: u64,
    entries: u64,
}

impl SlottedState {
    fn slot_for(&self, key: &[u8]) -> u64 {
        hash_key(key) % self.slots
    }

    fn slot_offset(&self, slot: u64) -> u64 {
        SLOTTED_HEADER_BYTES + slot * (SLOT_COUNT_BYTES + self.entries_per_slot * ENTRY_BYTES)
    }

    fn slot_len(&self, slot: u64) -> u64 {
        u64::from(read_u32(self.file.bytes(), self.slot_offset(slot)))
    }

    fn slot_entries(&self, slot: u64) -> Vec<u64> {
        let offset = self.slot_offset(slot);
        let len = self.slot_len(slot);
        (0..len)
            .map(|i| read_u64(self.file.bytes(), offset + SLOT_COUNT_BYTES + i * ENTRY_BYTES))
            .collect()
    }

    fn write_slot(&mut self, slot: u64, entries: &[u64]) -> Result<()> {
        let offset = self.slot_offset(slot);
        let bytes = self.file.bytes_mut();
        write_u32(bytes, offset, entries.len() as u32);
        for (i, address) in entries.iter().enumerate() {
            write_u64(bytes, offset + SLOT_COUNT_BYTES + i as u64 * ENTRY_BYTES, *address);
        }
        let written = SLOT_COUNT_BYTES + entries.len().max(1) as u64 * ENTRY_BYTES;
        self.file.flush_range(offset, written.min(self.slot_bytes()))
    }

    fn slot_bytes(&self) -> u64 {
        SLOT_COUNT_BYTES + self.entries_per_slot * ENTRY_BYTES
    }

    fn max_slot_len(&self) -> u64 {
        (0..self.slots).map(|slot| self.slot_len(slot)).max().unwrap_or(0)
    }
}

/// Builds the bytes of an index file with the given slot contents.
fn layout(slots: u64, entries_per_slot: u64, contents: &[Vec<u64>]) -> Result<Vec<u8>> {
    let mut bytes = zeroed(slotted_file_size(slots, entries_per_slot), "hash index")?;
    write_u32(&mut bytes, 0, SLOTTED_INDEX_MAGIC);
    write_u32(&mut bytes, 4, SLOTTED_INDEX_VERSION);
    write_u64(&mut bytes, 8, slots);
    write_u64(&mut bytes, 16, entries_per_slot);
    for (slot, entries) in contents.iter().enumerate() {
        let offset = SLOTTED_HEADER_BYTES
            + slot as u64 * (SLOT_COUNT_BYTES + entries_per_slot * ENTRY_BYTES);
        write_u32(&mut bytes, offset, entries.len() as u32);
        for (i, address) in entries.iter().enumerate() {
            write_u64(
                &mut bytes,
                offset + SLOT_COUNT_BYTES + i as u64 * ENTRY_BYTES,
                *address,
            );
        }
    }
    Ok(bytes)
}

/// A hash index file mapping keys to 8-byte addresses.
///
/// Mutations take an exclusive lock; `locate` calls share a read lock and
/// never observe a half-applied resize.
#[derive(Debug)]
pub struct SlottedHashIndex {
    path: PathBuf,
    state: RwLock<SlottedState>,
}

impl SlottedHashIndex {
    /// Opens the index at `path`, creating it with the given geometry if missing.
    ///
    /// An existing file keeps its stored geometry.
    pub fn open(path: &Path, slots: u64, entries_per_slot: u64) -> Result<Self> {
        if slots == 0 || entries_per_slot == 0 {
            return Err(RepositoryError::InvalidInput(format!(
                "invalid hash index geometry {slots}x{entries_per_slot}"
            )));
        }
        let (file, created) =
            MappedFile::open_or_create(path, || layout(slots, entries_per_slot, &[]))?;

        let Some((stored_slots, stored_entries_per_slot)) =
            header_geometry(file.bytes(), file.len())
        else {
            return Err(RepositoryError::CorruptIndex(format!(
                "{} ({} bytes) is not a valid version {SLOTTED_INDEX_VERSION} hash index",
                path.display(),
                file.len()
            )));
        };

        let mut state = SlottedState {
            file,
            slots: stored_slots,
            entries_per_slot: stored_entries_per_slot,
            entries: 0,
        };
        state.entries = (0..state.slots).map(|slot| state.slot_len(slot)).sum();
        if state.max_slot_len() > state.entries_per_slot {
            return Err(RepositoryError::CorruptIndex(format!(
                "{} has a slot holding more than {} entries",
                path.display(),
                state.entries_per_slot
            )));
        }

        log::debug!(
            "opened hash index {} created={} slots={} entries_per_slot={} entries={}",
            path.display(),
            created,
            state.slots,
            state.entries_per_slot,
            state.entries
        );

        Ok(Self {
            path: path.to_path_buf(),
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Stores `address` in the slot of `key`.
    ///
    /// Storing an address that is already present in the slot is a no-op.
    /// Fails with `IndexFull` when the slot has no free entry.
    pub fn set(&self, address: u64, key: &[u8]) -> Result<()> {
        let mut state = self.state.write();
        let slot = state.slot_for(key);
        let mut entries = state.slot_entries(slot);
        if entries.contains(&address) {
            return Ok(());
        }
        if entries.len() as u64 >= state.entries_per_slot {
            return Err(RepositoryError::IndexFull { slot });
        }
        entries.push(address);
        state.write_slot(slot, &entries)?;
        state.entries += 1;
        Ok(())
    }

    /// Returns every address stored in the slot of `key`.
    pub fn locate(&self, key: &[u8]) -> Vec<u64> {
        let state = self.state.read();
        let slot = state.slot_for(key);
        state.slot_entries(slot)
    }

    /// Removes `address` from the slot of `key`. Returns whether it was present.
    pub fn delete(&self, address: u64, key: &[u8]) -> Result<bool> {
        let mut state = self.state.write();
        let slot = state.slot_for(key);
        let mut entries = state.slot_entries(slot);
        let Some(position) = entries.iter().position(|candidate| *candidate == address) else {
            return Ok(false);
        };
        entries.remove(position);

        // Zero the freed tail entry so the file never carries stale addresses.
        let tail = state.slot_offset(slot) + SLOT_COUNT_BYTES + entries.len() as u64 * ENTRY_BYTES;
        write_u64(state.file.bytes_mut(), tail, 0);
        state.write_slot(slot, &entries)?;
        state.file.flush_range(tail, ENTRY_BYTES)?;
        state.entries -= 1;
        Ok(true)
    }

    /// Changes the geometry of the index.
    ///
    /// Entries per slot may grow at any time and shrink down to the fullest
    /// slot. The slot count can only change while the index is empty.
    pub fn resize(&self, slots: u64, entries_per_slot: u64) -> Result<()> {
        let mut state = self.state.write();
        if slots == 0 || entries_per_slot == 0 {
            return Err(RepositoryError::InvalidInput(format!(
                "invalid hash index geometry {slots}x{entries_per_slot}"
            )));
        }
        if slots == state.slots && entries_per_slot == state.entries_per_slot {
            return Ok(());
        }
        if slots != state.slots && state.entries > 0 {
            return Err(RepositoryError::IllegalState(format!(
                "cannot change slot count of {} from {} to {} while it holds {} entries",
                self.path.display(),
                state.slots,
                slots,
                state.entries
            )));
        }
        let fullest = state.max_slot_len();
        if entries_per_slot < fullest {
            return Err(RepositoryError::IllegalState(format!(
                "cannot shrink {} to {entries_per_slot} entries per slot, a slot holds {fullest}",
                self.path.display()
            )));
        }

        let contents = if slots == state.slots {
            (0..state.slots)
                .map(|slot| state.slot_entries(slot))
                .collect::<Vec<_>>()
        } else {
            Vec::new()
        };
        let bytes = layout(slots, entries_per_slot, &contents)?;
        state.file.replace_with(&bytes)?;

        log::debug!(
            "resized hash index {} from {}x{} to {}x{}",
            self.path.display(),
            state.slots,
            state.entries_per_slot,
            slots,
            entries_per_slot
        );
        state.slots = slots;
        state.entries_per_slot = entries_per_slot;
        Ok(())
    }

    /// Removes all entries, keeping the geometry.
    pub fn clear(&self) -> Result<()> {
        let mut state = self.state.write();
        let bytes = layout(state.slots, state.entries_per_slot, &[])?;
        state.file.replace_with(&bytes)?;
        state.entries = 0;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.state.read().entries
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn slots(&self) -> u64 {
        self.state.read().slots
    }

    pub fn entries_per_slot(&self) -> u64 {
        self.state.read().entries_per_slot
    }

    /// Fraction of total slot capacity in use.
    pub fn load_factor(&self) -> f64 {
        let state = self.state.read();
        state.entries as f64 / (state.slots * state.entries_per_slot) as f64
    }

    pub fn flush(&self) -> Result<()> {
        self.state.read().file.flush()
    }

    /// Returns the format version of the file at `path`, or `-1` when the
    /// file is missing, of another version, or its header geometry does not
    /// match the file length.
    pub fn stored_version(path: &Path) -> i32 {
        match read_file_header(path, SLOTTED_HEADER_BYTES) {
            Some((header, len)) if header_geometry(&header, len).is_some() => {
                SLOTTED_INDEX_VERSION as i32
            }
            _ => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn key(i: u64) -> String {
        format!("4bb19980-8f98-4873-a813-{i:012}")
    }

    /// Inserts with slot growth, the way the structural index does.
    fn set_growing(index: &SlottedHashIndex, address: u64, key: &[u8]) {
        loop {
            match index.set(address, key) {
                Ok(()) => return,
                Err(RepositoryError::IndexFull { .. }) => {
                    let grown = index.entries_per_slot() * 2;
                    index.resize(index.slots(), grown).expect("resize");
                }
                Err(error) => panic!("set failed: {error}"),
            }
        }
    }

    #[test]
    fn file_size_matches_geometry() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("id.idx");
        let index = SlottedHashIndex::open(&path, 16, 4).expect("open");
        assert_eq!(index.slots(), 16);
        assert_eq!(index.entries_per_slot(), 4);
        let size = std::fs::metadata(&path).expect("stat").len();
        assert_eq!(size, 24 + 16 * (4 + 4 * 8));
        assert_eq!(Some(size), slotted_file_size(16, 4));
    }

    #[test]
    fn locate_returns_set_address() {
        let temp = TempDir::new().expect("tempdir");
        let index = SlottedHashIndex::open(&temp.path().join("id.idx"), 8, 4).expect("open");
        index.set(17, b"/news").expect("set");
        assert!(index.locate(b"/news").contains(&17));
        assert_eq!(index.len(), 1);

        // Same address twice is stored once.
        index.set(17, b"/news").expect("set");
        assert_eq!(index.len(), 1);
    }

    #[test]
    fn round_trip_beyond_capacity_survives_reopen() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("id.idx");
        let (slots, entries_per_slot) = (4u64, 2u64);
        let total = 2 * slots * entries_per_slot;
        {
            let index = SlottedHashIndex::open(&path, slots, entries_per_slot).expect("open");
            for i in 0..total {
                set_growing(&index, i, key(i).as_bytes());
            }
            assert_eq!(index.len(), total);
        }

        let index = SlottedHashIndex::open(&path, slots, entries_per_slot).expect("reopen");
        assert_eq!(index.len(), total);
        for i in 0..total {
            let candidates = index.locate(key(i).as_bytes());
            assert!(candidates.contains(&i), "address {i} missing after reopen");
        }
    }

    #[test]
    fn set_fails_when_slot_is_full() {
        let temp = TempDir::new().expect("tempdir");
        let index = SlottedHashIndex::open(&temp.path().join("id.idx"), 1, 2).expect("open");
        index.set(1, b"a").expect("set");
        index.set(2, b"b").expect("set");
        let result = index.set(3, b"c");
        assert!(matches!(result, Err(RepositoryError::IndexFull { slot: 0 })));
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn load_factor_is_exact() {
        let temp = TempDir::new().expect("tempdir");
        let index = SlottedHashIndex::open(&temp.path().join("id.idx"), 4, 64).expect("open");
        for i in 0..10 {
            index.set(i, key(i).as_bytes()).expect("set");
        }
        assert_eq!(index.load_factor(), 10.0 / (4.0 * 64.0));
    }

    #[test]
    fn delete_removes_only_matching_address() {
        let temp = TempDir::new().expect("tempdir");
        let index = SlottedHashIndex::open(&temp.path().join("id.idx"), 1, 4).expect("open");
        index.set(1, b"a").expect("set");
        index.set(2, b"b").expect("set");
        index.set(3, b"c").expect("set");

        assert!(index.delete(2, b"b").expect("delete"));
        assert!(!index.delete(2, b"b").expect("delete twice"));
        assert!(!index.delete(9, b"zzz").expect("delete absent"));
        assert_eq!(index.locate(b"a"), vec![1, 3]);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn resize_refuses_slot_change_when_not_empty() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("id.idx");
        let index = SlottedHashIndex::open(&path, 8, 4).expect("open");
        index.set(5, b"key").expect("set");
        let size_before = std::fs::metadata(&path).expect("stat").len();

        let result = index.resize(7, 4);
        assert!(matches!(result, Err(RepositoryError::IllegalState(_))));
        assert_eq!(index.slots(), 8);
        assert_eq!(index.entries_per_slot(), 4);
        assert_eq!(std::fs::metadata(&path).expect("stat").len(), size_before);
        assert!(index.locate(b"key").contains(&5));
    }

    #[test]
    fn resize_grows_entries_and_keeps_addresses() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("id.idx");
        let index = SlottedHashIndex::open(&path, 2, 2).expect("open");
        for i in 0..3 {
            set_growing(&index, i, key(i).as_bytes());
        }
        index.resize(2, 16).expect("resize");
        assert_eq!(index.entries_per_slot(), 16);
        assert_eq!(
            Some(std::fs::metadata(&path).expect("stat").len()),
            slotted_file_size(2, 16)
        );
        for i in 0..3 {
            assert!(index.locate(key(i).as_bytes()).contains(&i));
        }
    }

    #[test]
    fn resize_changes_slots_when_empty() {
        let temp = TempDir::new().expect("tempdir");
        let index = SlottedHashIndex::open(&temp.path().join("id.idx"), 8, 4).expect("open");
        index.resize(32, 4).expect("resize");
        assert_eq!(index.slots(), 32);
    }

    #[test]
    fn clear_keeps_geometry() {
        let temp = TempDir::new().expect("tempdir");
        let index = SlottedHashIndex::open(&temp.path().join("id.idx"), 8, 4).expect("open");
        index.set(1, b"a").expect("set");
        index.clear().expect("clear");
        assert_eq!(index.len(), 0);
        assert!(index.locate(b"a").is_empty());
        assert_eq!((index.slots(), index.entries_per_slot()), (8, 4));
    }

    #[test]
    fn corrupt_header_is_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("id.idx");
        std::fs::write(&path, vec![7u8; 64]).expect("write");
        let result = SlottedHashIndex::open(&path, 8, 4);
        assert!(matches!(result, Err(RepositoryError::CorruptIndex(_))));
        assert_eq!(SlottedHashIndex::stored_version(&path), -1);
    }

    #[test]
    fn corrupt_slot_count_reports_unknown_version() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("path.idx");
        {
            let index = SlottedHashIndex::open(&path, 8, 4).expect("open");
            index.set(3, b"/news").expect("set");
        }
        assert_eq!(SlottedHashIndex::stored_version(&path), SLOTTED_INDEX_VERSION as i32);

        let mut bytes = std::fs::read(&path).expect("read");
        bytes[8] ^= 0x01;
        std::fs::write(&path, &bytes).expect("write");
        assert_eq!(SlottedHashIndex::stored_version(&path), -1);
        assert!(matches!(
            SlottedHashIndex::open(&path, 8, 4),
            Err(RepositoryError::CorruptIndex(_))
        ));

        // A slot count whose size overflows is rejected rather than computed.
        write_u64(&mut bytes, 8, u64::MAX);
        std::fs::write(&path, &bytes).expect("write");
        assert_eq!(SlottedHashIndex::stored_version(&path), -1);
        assert_eq!(slotted_file_size(u64::MAX, 4), None);
    }
}
