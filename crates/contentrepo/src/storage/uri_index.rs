//! Fixed-width resource records addressed by position.
//!
//! File layout (little-endian):
//!
//! ```text
//! offset 0   magic          u32
//! offset 4   format version u32
//! offset 8   capacity       u64   (number of record positions)
//! offset 16  id bytes       u32
//! offset 20  type bytes     u32
//! offset 24  path bytes     u32
//! offset 28  reserved       u32
//! offset 32  record[0] { used u8, id [id bytes], type [type bytes], path [path bytes] }
//! ```
//!
//! Strings are UTF-8 padded with zero bytes. A value wider than its column
//! rewrites the file with doubled column widths.

use std::collections::BTreeSet;
use std::path::Path;

use super::mapped::{
    read_file_header, read_u32, read_u64, write_u32, write_u64, zeroed, MappedFile,
};
use crate::error::{RepositoryError, Result};

/// "URIX"
pub const URI_INDEX_MAGIC: u32 = 0x5849_5255;
pub const URI_INDEX_VERSION: u32 = 1;
pub const URI_HEADER_BYTES: u64 = 32;

const INITIAL_CAPACITY: u64 = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UriRecord {
    pub id: String,
    pub resource_type: String,
    pub path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Widths {
    id: u32,
    resource_type: u32,
    path: u32,
}

impl Widths {
    fn record_bytes(self) -> u64 {
        1 + u64::from(self.id) + u64::from(self.resource_type) + u64::from(self.path)
    }

    fn fit(self, record: &UriRecord) -> Self {
        Self {
            id: grow_width(self.id, record.id.len()),
            resource_type: grow_width(self.resource_type, record.resource_type.len()),
            path: grow_width(self.path, record.path.as_deref().map_or(0, str::len)),
        }
    }
}

fn grow_width(current: u32, needed: usize) -> u32 {
    let mut width = current.max(1);
    while (width as usize) < needed {
        width = width.saturating_mul(2);
    }
    width
}

fn file_size(capacity: u64, widths: Widths) -> Option<u64> {
    capacity
        .checked_mul(widths.record_bytes())
        .and_then(|records| records.checked_add(URI_HEADER_BYTES))
}

/// Capacity and widths stored in `header` when it describes a valid index of
/// `len` bytes.
fn header_layout(header: &[u8], len: u64) -> Option<(u64, Widths)> {
    if header.len() < URI_HEADER_BYTES as usize
        || read_u32(header, 0) != URI_INDEX_MAGIC
        || read_u32(header, 4) != URI_INDEX_VERSION
    {
        return None;
    }
    let capacity = read_u64(header, 8);
    let widths = Widths {
        id: read_u32(header, 16),
        resource_type: read_u32(header, 20),
        path: read_u32(header, 24),
    };
    if widths.id == 0
        || widths.resource_type == 0
        || widths.path == 0
        || file_size(capacity, widths) != Some(len)
    {
        return None;
    }
    Some((capacity, widths))
}

fn layout(capacity: u64, widths: Widths, records: &[(u64, UriRecord)]) -> Result<Vec<u8>> {
    let mut bytes = zeroed(file_size(capacity, widths), "uri index")?;
    write_u32(&mut bytes, 0, URI_INDEX_MAGIC);
    write_u32(&mut bytes, 4, URI_INDEX_VERSION);
    write_u64(&mut bytes, 8, capacity);
    write_u32(&mut bytes, 16, widths.id);
    write_u32(&mut bytes, 20, widths.resource_type);
    write_u32(&mut bytes, 24, widths.path);
    for (address, record) in records {
        encode_record(&mut bytes, widths, *address, record);
    }
    Ok(bytes)
}

fn record_offset(widths: Widths, address: u64) -> u64 {
    URI_HEADER_BYTES + address * widths.record_bytes()
}

fn encode_record(bytes: &mut [u8], widths: Widths, address: u64, record: &UriRecord) {
    let mut offset = record_offset(widths, address) as usize;
    let end = offset + widths.record_bytes() as usize;
    bytes[offset..end].fill(0);
    bytes[offset] = 1;
    offset += 1;
    for (value, width) in [
        (record.id.as_str(), widths.id),
        (record.resource_type.as_str(), widths.resource_type),
        (record.path.as_deref().unwrap_or(""), widths.path),
    ] {
        bytes[offset..offset + value.len()].copy_from_slice(value.as_bytes());
        offset += width as usize;
    }
}

fn decode_field(bytes: &[u8]) -> Result<String> {
    let len = bytes.iter().position(|b| *b == 0).unwrap_or(bytes.len());
    String::from_utf8(bytes[..len].to_vec())
        .map_err(|error| RepositoryError::CorruptIndex(format!("invalid uri record text: {error}")))
}

fn validate_field(name: &str, value: &str) -> Result<()> {
    if value.contains('\0') {
        return Err(RepositoryError::InvalidInput(format!(
            "{name} must not contain NUL bytes: {value:?}"
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct UriIndex {
    file: MappedFile,
    capacity: u64,
    widths: Widths,
    free: BTreeSet<u64>,
    len: u64,
}

impl UriIndex {
    pub fn open(path: &Path, id_bytes: u32, type_bytes: u32, path_bytes: u32) -> Result<Self> {
        let widths = Widths {
            id: id_bytes.max(1),
            resource_type: type_bytes.max(1),
            path: path_bytes.max(1),
        };
        let (file, _) =
            MappedFile::open_or_create(path, || layout(INITIAL_CAPACITY, widths, &[]))?;

        let Some((capacity, widths)) = header_layout(file.bytes(), file.len()) else {
            return Err(RepositoryError::CorruptIndex(format!(
                "{} is not a valid version {URI_INDEX_VERSION} uri index",
                path.display()
            )));
        };

        let mut index = Self {
            file,
            capacity,
            widths,
            free: BTreeSet::new(),
            len: 0,
        };
        for address in 0..capacity {
            if index.is_used(address) {
                index.len += 1;
            } else {
                index.free.insert(address);
            }
        }
        Ok(index)
    }

    fn is_used(&self, address: u64) -> bool {
        address < self.capacity
            && self.file.bytes()[record_offset(self.widths, address) as usize] == 1
    }

    fn records(&self) -> Result<Vec<(u64, UriRecord)>> {
        let mut records = Vec::with_capacity(self.len as usize);
        for address in 0..self.capacity {
            if let Some(record) = self.get(address)? {
                records.push((address, record));
            }
        }
        Ok(records)
    }

    /// Rewrites the file so `record` fits and at least `capacity` positions exist.
    fn relayout(&mut self, capacity: u64, record: Option<&UriRecord>) -> Result<()> {
        let widths = record.map_or(self.widths, |record| self.widths.fit(record));
        if widths == self.widths {
            if capacity > self.capacity {
                let size = file_size(capacity, widths).ok_or_else(|| {
                    RepositoryError::InvalidInput(format!("uri index capacity {capacity} is too large"))
                })?;
                self.file.grow(size)?;
                write_u64(self.file.bytes_mut(), 8, capacity);
                self.file.flush_range(8, 8)?;
                self.free.extend(self.capacity..capacity);
                self.capacity = capacity;
            }
            return Ok(());
        }

        let capacity = capacity.max(self.capacity);
        let records = self.records()?;
        let bytes = layout(capacity, widths, &records)?;
        self.file.replace_with(&bytes)?;
        log::debug!(
            "widened uri index {} to id={} type={} path={} capacity={}",
            self.file.path().display(),
            widths.id,
            widths.resource_type,
            widths.path,
            capacity
        );
        self.free.extend(self.capacity..capacity);
        self.capacity = capacity;
        self.widths = widths;
        Ok(())
    }

    fn write_record(&mut self, address: u64, record: &UriRecord) -> Result<()> {
        validate_field("resource id", &record.id)?;
        validate_field("resource type", &record.resource_type)?;
        validate_field("resource path", record.path.as_deref().unwrap_or(""))?;
        if self.widths.fit(record) != self.widths {
            self.relayout(self.capacity, Some(record))?;
        }
        let widths = self.widths;
        encode_record(self.file.bytes_mut(), widths, address, record);
        self.file
            .flush_range(record_offset(widths, address), widths.record_bytes())
    }

    /// Stores `record` at a free position and returns that address.
    pub fn allocate(&mut self, record: &UriRecord) -> Result<u64> {
        if self.free.is_empty() {
            let grown = (self.capacity * 2).max(INITIAL_CAPACITY);
            self.relayout(grown, Some(record))?;
        }
        let address = self
            .free
            .first()
            .copied()
            .ok_or_else(|| RepositoryError::Internal("uri index has no free record".to_string()))?;
        self.write_record(address, record)?;
        self.free.remove(&address);
        self.len += 1;
        Ok(address)
    }

    pub fn get(&self, address: u64) -> Result<Option<UriRecord>> {
        if !self.is_used(address) {
            return Ok(None);
        }
        let bytes = self.file.bytes();
        let mut offset = record_offset(self.widths, address) as usize + 1;
        let mut fields = Vec::with_capacity(3);
        for width in [self.widths.id, self.widths.resource_type, self.widths.path] {
            fields.push(decode_field(&bytes[offset..offset + width as usize])?);
            offset += width as usize;
        }
        let path = fields.pop().filter(|path| !path.is_empty());
        let resource_type = fields.pop().unwrap_or_default();
        let id = fields.pop().unwrap_or_default();
        Ok(Some(UriRecord {
            id,
            resource_type,
            path,
        }))
    }

    /// Replaces the record stored at a used `address`.
    pub fn update(&mut self, address: u64, record: &UriRecord) -> Result<()> {
        if !self.is_used(address) {
            return Err(RepositoryError::NotFound(format!("uri record {address}")));
        }
        self.write_record(address, record)
    }

    /// Marks the record at `address` as free. Returns whether it was used.
    pub fn free(&mut self, address: u64) -> Result<bool> {
        if !self.is_used(address) {
            return Ok(false);
        }
        let offset = record_offset(self.widths, address);
        let len = self.widths.record_bytes();
        self.file.bytes_mut()[offset as usize..(offset + len) as usize].fill(0);
        self.file.flush_range(offset, len)?;
        self.free.insert(address);
        self.len -= 1;
        Ok(true)
    }

    pub fn iter(&self) -> Result<Vec<(u64, UriRecord)>> {
        self.records()
    }

    pub fn clear(&mut self) -> Result<()> {
        let bytes = layout(INITIAL_CAPACITY, self.widths, &[])?;
        self.file.replace_with(&bytes)?;
        self.capacity = INITIAL_CAPACITY;
        self.free = (0..INITIAL_CAPACITY).collect();
        self.len = 0;
        Ok(())
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    pub fn load_factor(&self) -> f64 {
        self.len as f64 / self.capacity.max(1) as f64
    }

    pub fn flush(&self) -> Result<()> {
        self.file.flush()
    }

    /// Format version of the file at `path`, or `-1` when it is missing or
    /// its header does not describe the file.
    pub fn stored_version(path: &Path) -> i32 {
        match read_file_header(path, URI_HEADER_BYTES) {
            Some((header, len)) if header_layout(&header, len).is_some() => {
                URI_INDEX_VERSION as i32
            }
            _ => -1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn record(id: &str, path: Option<&str>) -> UriRecord {
        UriRecord {
            id: id.to_string(),
            resource_type: "page".to_string(),
            path: path.map(str::to_string),
        }
    }

    #[test]
    fn allocate_get_and_reopen() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("uri.idx");
        let address = {
            let mut index = UriIndex::open(&path, 36, 16, 64).expect("open");
            let address = index.allocate(&record("a1", Some("/news"))).expect("allocate");
            assert_eq!(index.len(), 1);
            address
        };

        let index = UriIndex::open(&path, 36, 16, 64).expect("reopen");
        assert_eq!(index.len(), 1);
        assert_eq!(
            index.get(address).expect("get"),
            Some(record("a1", Some("/news")))
        );
    }

    #[test]
    fn missing_path_round_trips_as_none() {
        let temp = TempDir::new().expect("tempdir");
        let mut index = UriIndex::open(&temp.path().join("uri.idx"), 8, 8, 8).expect("open");
        let address = index.allocate(&record("a1", None)).expect("allocate");
        assert_eq!(index.get(address).expect("get"), Some(record("a1", None)));
    }

    #[test]
    fn long_values_widen_the_layout() {
        let temp = TempDir::new().expect("tempdir");
        let mut index = UriIndex::open(&temp.path().join("uri.idx"), 4, 4, 4).expect("open");
        let first = index.allocate(&record("a1", Some("/a"))).expect("allocate");
        let long_path = "/a/very/long/path/that/does/not/fit";
        let second = index
            .allocate(&record("4bb19980-8f98-4873-a813-000000000001", Some(long_path)))
            .expect("allocate");

        assert_eq!(index.get(first).expect("get"), Some(record("a1", Some("/a"))));
        assert_eq!(
            index.get(second).expect("get").and_then(|r| r.path),
            Some(long_path.to_string())
        );
    }

    #[test]
    fn free_positions_are_reused() {
        let temp = TempDir::new().expect("tempdir");
        let mut index = UriIndex::open(&temp.path().join("uri.idx"), 8, 8, 8).expect("open");
        let first = index.allocate(&record("a", None)).expect("allocate");
        index.allocate(&record("b", None)).expect("allocate");
        assert!(index.free(first).expect("free"));
        assert!(!index.free(first).expect("free twice"));
        let reused = index.allocate(&record("c", None)).expect("allocate");
        assert_eq!(reused, first);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn capacity_grows_past_initial_size() {
        let temp = TempDir::new().expect("tempdir");
        let mut index = UriIndex::open(&temp.path().join("uri.idx"), 8, 8, 8).expect("open");
        for i in 0..(INITIAL_CAPACITY + 5) {
            index.allocate(&record(&format!("id{i}"), None)).expect("allocate");
        }
        assert_eq!(index.len(), INITIAL_CAPACITY + 5);
        assert!(index.capacity() >= INITIAL_CAPACITY + 5);
        assert_eq!(index.iter().expect("iter").len() as u64, INITIAL_CAPACITY + 5);
    }

    #[test]
    fn nul_bytes_are_rejected() {
        let temp = TempDir::new().expect("tempdir");
        let mut index = UriIndex::open(&temp.path().join("uri.idx"), 8, 8, 8).expect("open");
        let result = index.allocate(&record("a\0b", None));
        assert!(matches!(result, Err(RepositoryError::InvalidInput(_))));
        assert_eq!(index.len(), 0);
    }

    #[test]
    fn clear_empties_the_file() {
        let temp = TempDir::new().expect("tempdir");
        let mut index = UriIndex::open(&temp.path().join("uri.idx"), 8, 8, 8).expect("open");
        let address = index.allocate(&record("a", None)).expect("allocate");
        index.clear().expect("clear");
        assert!(index.is_empty());
        assert_eq!(index.get(address).expect("get"), None);
    }

    #[test]
    fn corrupt_capacity_reports_unknown_version() {
        let temp = TempDir::new().expect("tempdir");
        let path = temp.path().join("uri.idx");
        UriIndex::open(&path, 8, 8, 8).expect("open");
        assert_eq!(UriIndex::stored_version(&path), URI_INDEX_VERSION as i32);

        let mut bytes = std::fs::read(&path).expect("read");
        write_u64(&mut bytes, 8, u64::MAX / 2);
        std::fs::write(&path, &bytes).expect("write");
        assert_eq!(UriIndex::stored_version(&path), -1);
        assert!(matches!(
            UriIndex::open(&path, 8, 8, 8),
            Err(RepositoryError::CorruptIndex(_))
        ));
    }
}
