//! Structural index: keeps the id, path, uri and version files consistent.

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use uuid::Uuid;

use crate::config::IndexGeometry;
use crate::error::{file_error, RepositoryError, Result};
use crate::resource::{normalize_path, path_depth, path_is_within, ResourceUri, PAGE_TYPE};
use crate::storage::{
    SlottedHashIndex, UriIndex, UriRecord, VersionIndex, SLOTTED_INDEX_VERSION, URI_INDEX_VERSION,
    VERSION_INDEX_VERSION,
};

/// Version of the structural index directory layout.
pub const STRUCTURAL_INDEX_VERSION: i32 = 1;

pub const STRUCTURE_DIR: &str = "structure";
pub const ID_INDEX_FILE: &str = "id.idx";
pub const PATH_INDEX_FILE: &str = "path.idx";
pub const URI_INDEX_FILE: &str = "uri.idx";
pub const VERSION_INDEX_FILE: &str = "version.idx";
pub const VERSION_STAMP_FILE: &str = "index.version";

/// Occupancy of the individual index files.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexLoad {
    pub id: f64,
    pub path: f64,
    pub uri: f64,
}

#[derive(Debug)]
struct Indexes {
    id: SlottedHashIndex,
    path: SlottedHashIndex,
    uri: UriIndex,
    versions: VersionIndex,
}

impl Indexes {
    fn find_by_id(&self, id: &str) -> Result<Option<(u64, UriRecord)>> {
        for address in self.id.locate(id.as_bytes()) {
            if let Some(record) = self.uri.get(address)? {
                if record.id == id {
                    return Ok(Some((address, record)));
                }
            }
        }
        Ok(None)
    }

    fn find_by_path(&self, path: &str) -> Result<Option<(u64, UriRecord)>> {
        for address in self.path.locate(path.as_bytes()) {
            if let Some(record) = self.uri.get(address)? {
                if record.path.as_deref() == Some(path) {
                    return Ok(Some((address, record)));
                }
            }
        }
        Ok(None)
    }

    /// Resolves a uri by id, falling back to its path.
    fn find(&self, uri: &ResourceUri) -> Result<Option<(u64, UriRecord)>> {
        if let Some(id) = uri.id() {
            return self.find_by_id(id);
        }
        if let Some(path) = uri.path() {
            return self.find_by_path(path);
        }
        Ok(None)
    }

    fn link(&mut self, address: u64, id: &str, path: Option<&str>, version: u64) -> Result<()> {
        self.versions.add_version(address, version)?;
        set_growing(&self.id, address, id.as_bytes())?;
        if let Some(path) = path {
            set_growing(&self.path, address, path.as_bytes())?;
        }
        Ok(())
    }

    /// Best-effort removal of everything `link` may have written.
    fn unlink(&mut self, address: u64, id: &str, path: Option<&str>) {
        let mut failures = Vec::new();
        if let Some(path) = path {
            if let Err(error) = self.path.delete(address, path.as_bytes()) {
                failures.push(error);
            }
        }
        if let Err(error) = self.id.delete(address, id.as_bytes()) {
            failures.push(error);
        }
        if let Err(error) = self.versions.clear_entry(address) {
            failures.push(error);
        }
        if let Err(error) = self.uri.free(address) {
            failures.push(error);
        }
        for error in failures {
            log::warn!("structural index rollback for {id} at {address} incomplete: {error}");
        }
    }

    fn clear(&mut self) -> Result<()> {
        self.id.clear()?;
        self.path.clear()?;
        self.uri.clear()?;
        self.versions.clear()
    }

    fn flush(&self) -> Result<()> {
        self.id.flush()?;
        self.path.flush()?;
        self.uri.flush()?;
        self.versions.flush()
    }
}

/// Inserts into a hash index, doubling entries per slot while the slot is full.
fn set_growing(index: &SlottedHashIndex, address: u64, key: &[u8]) -> Result<()> {
    loop {
        match index.set(address, key) {
            Err(RepositoryError::IndexFull { slot }) => {
                let grown = index.entries_per_slot() * 2;
                log::debug!(
                    "slot {slot} of {} is full, growing to {grown} entries per slot",
                    index.path().display()
                );
                index.resize(index.slots(), grown)?;
            }
            other => return other,
        }
    }
}

fn stamp_path(dir: &Path) -> PathBuf {
    dir.join(VERSION_STAMP_FILE)
}

fn read_stamp(dir: &Path) -> Option<i32> {
    fs::read_to_string(stamp_path(dir))
        .ok()
        .and_then(|value| value.trim().parse::<i32>().ok())
}

/// Maps resource identifiers, paths and versions of one site onto each other.
///
/// All four files change under one write lock per logical operation, reads
/// share the lock.
#[derive(Debug)]
pub struct StructuralIndex {
    dir: PathBuf,
    site: String,
    indexes: RwLock<Option<Indexes>>,
}

impl StructuralIndex {
    /// Opens (or creates) the structural index below `root`.
    pub fn open(root: &Path, site: &str, geometry: &IndexGeometry) -> Result<Self> {
        geometry.validate()?;
        let dir = root.join(STRUCTURE_DIR);
        fs::create_dir_all(&dir).map_err(|error| file_error("create index directory", &dir, error))?;

        match read_stamp(&dir) {
            Some(STRUCTURAL_INDEX_VERSION) => {}
            Some(other) => {
                return Err(RepositoryError::CorruptIndex(format!(
                    "structural index {} has version {other}, expected {STRUCTURAL_INDEX_VERSION}",
                    dir.display()
                )))
            }
            None => {
                fs::write(stamp_path(&dir), STRUCTURAL_INDEX_VERSION.to_string())
                    .map_err(|error| file_error("write index version", &stamp_path(&dir), error))?;
            }
        }

        let indexes = Indexes {
            id: SlottedHashIndex::open(
                &dir.join(ID_INDEX_FILE),
                geometry.id_index_slots,
                geometry.entries_per_slot,
            )?,
            path: SlottedHashIndex::open(
                &dir.join(PATH_INDEX_FILE),
                geometry.path_index_slots,
                geometry.entries_per_slot,
            )?,
            uri: UriIndex::open(
                &dir.join(URI_INDEX_FILE),
                geometry.id_bytes,
                geometry.type_bytes,
                geometry.path_bytes,
            )?,
            versions: VersionIndex::open(
                &dir.join(VERSION_INDEX_FILE),
                geometry.versions_per_entry,
            )?,
        };

        log::info!(
            "structural index open site={} dir={} resources={}",
            site,
            dir.display(),
            indexes.uri.len()
        );

        Ok(Self {
            dir,
            site: site.to_string(),
            indexes: RwLock::new(Some(indexes)),
        })
    }

    /// Version of the index stored below `root`, or `-1` if it is missing,
    /// corrupt or of another version.
    pub fn stored_version(root: &Path) -> i32 {
        let dir = root.join(STRUCTURE_DIR);
        if read_stamp(&dir) != Some(STRUCTURAL_INDEX_VERSION) {
            return -1;
        }
        let files_match = SlottedHashIndex::stored_version(&dir.join(ID_INDEX_FILE))
            == SLOTTED_INDEX_VERSION as i32
            && SlottedHashIndex::stored_version(&dir.join(PATH_INDEX_FILE))
                == SLOTTED_INDEX_VERSION as i32
            && UriIndex::stored_version(&dir.join(URI_INDEX_FILE)) == URI_INDEX_VERSION as i32
            && VersionIndex::stored_version(&dir.join(VERSION_INDEX_FILE))
                == VERSION_INDEX_VERSION as i32;
        if files_match {
            STRUCTURAL_INDEX_VERSION
        } else {
            -1
        }
    }

    /// Version of the files on disk, `-1` on mismatch or corruption.
    pub fn index_version(&self) -> i32 {
        match self.dir.parent() {
            Some(root) => Self::stored_version(root),
            None => -1,
        }
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    fn check_site(&self, uri: &ResourceUri) -> Result<()> {
        if uri.site() != self.site {
            return Err(RepositoryError::InvalidInput(format!(
                "uri {uri} does not belong to site {}",
                self.site
            )));
        }
        Ok(())
    }

    fn read<T>(&self, f: impl FnOnce(&Indexes) -> Result<T>) -> Result<T> {
        let guard = self.indexes.read();
        let indexes = guard
            .as_ref()
            .ok_or_else(|| RepositoryError::Closed(format!("structural index {}", self.site)))?;
        f(indexes)
    }

    fn write<T>(&self, f: impl FnOnce(&mut Indexes) -> Result<T>) -> Result<T> {
        let mut guard = self.indexes.write();
        let indexes = guard
            .as_mut()
            .ok_or_else(|| RepositoryError::Closed(format!("structural index {}", self.site)))?;
        f(indexes)
    }

    /// Adds one version of a resource and returns its complete uri.
    ///
    /// A uri without an identifier gets a fresh one. Adding another version
    /// of a known id is allowed as long as the path matches.
    pub fn add(&self, uri: &ResourceUri) -> Result<ResourceUri> {
        self.check_site(uri)?;
        let version = uri.version();
        let resource_type = uri.resource_type().unwrap_or(PAGE_TYPE).to_string();

        self.write(|indexes| {
            if let Some(id) = uri.id() {
                if let Some((address, record)) = indexes.find_by_id(id)? {
                    if uri.path().is_some() && uri.path() != record.path.as_deref() {
                        return Err(RepositoryError::DuplicateId { id: id.to_string() });
                    }
                    if indexes.versions.has_version(address, version) {
                        return Err(RepositoryError::DuplicateId { id: id.to_string() });
                    }
                    indexes.versions.add_version(address, version)?;
                    let mut added = uri.clone();
                    if let Some(path) = &record.path {
                        added = added.with_path(path);
                    }
                    log::debug!("added version {version} of {id}");
                    return Ok(added.with_type(record.resource_type));
                }
            }

            let id = match uri.id() {
                Some(id) => id.to_string(),
                None => loop {
                    let candidate = Uuid::new_v4().to_string();
                    if indexes.find_by_id(&candidate)?.is_none() {
                        break candidate;
                    }
                },
            };

            if let Some(path) = uri.path() {
                if let Some((_, existing)) = indexes.find_by_path(path)? {
                    if existing.id != id {
                        return Err(RepositoryError::DuplicatePath {
                            path: path.to_string(),
                        });
                    }
                }
            }

            let record = UriRecord {
                id: id.clone(),
                resource_type: resource_type.clone(),
                path: uri.path().map(str::to_string),
            };
            let address = indexes.uri.allocate(&record)?;
            if let Err(error) = indexes.link(address, &id, uri.path(), version) {
                indexes.unlink(address, &id, uri.path());
                return Err(error);
            }

            log::debug!("added {} at address {address}", uri.clone().with_id(&id));
            Ok(uri.clone().with_id(id).with_type(resource_type))
        })
    }

    /// Refreshes the stored record of an existing resource version.
    ///
    /// The identifier never changes; a differing path has to go through
    /// [`StructuralIndex::move_to`].
    pub fn update(&self, uri: &ResourceUri) -> Result<ResourceUri> {
        self.check_site(uri)?;
        self.write(|indexes| {
            let (address, mut record) = indexes
                .find(uri)?
                .ok_or_else(|| RepositoryError::NotFound(uri.to_string()))?;
            if !indexes.versions.has_version(address, uri.version()) {
                return Err(RepositoryError::NotFound(uri.to_string()));
            }
            if uri.path().is_some() && uri.path() != record.path.as_deref() {
                return Err(RepositoryError::InvalidInput(format!(
                    "update of {uri} would change its path, use move instead"
                )));
            }
            if let Some(resource_type) = uri.resource_type() {
                if resource_type != record.resource_type {
                    record.resource_type = resource_type.to_string();
                    indexes.uri.update(address, &record)?;
                }
            }
            Ok(complete_uri(uri, &record))
        })
    }

    /// Removes one version. The last version takes the id and path with it.
    ///
    /// Returns false if the version was not in the index.
    pub fn delete(&self, uri: &ResourceUri) -> Result<bool> {
        self.check_site(uri)?;
        self.write(|indexes| {
            let Some((address, record)) = indexes.find(uri)? else {
                return Ok(false);
            };
            if !indexes.versions.remove_version(address, uri.version())? {
                return Ok(false);
            }
            if indexes.versions.versions(address).is_empty() {
                if let Some(path) = &record.path {
                    indexes.path.delete(address, path.as_bytes())?;
                }
                indexes.id.delete(address, record.id.as_bytes())?;
                indexes.uri.free(address)?;
                log::debug!("removed {} from structural index", record.id);
            }
            Ok(true)
        })
    }

    /// Points the resource at `new_path`, keeping its id and versions.
    pub fn move_to(&self, uri: &ResourceUri, new_path: &str) -> Result<ResourceUri> {
        self.check_site(uri)?;
        let new_path = normalize_path(new_path)?;
        self.write(|indexes| {
            let (address, mut record) = indexes
                .find(uri)?
                .ok_or_else(|| RepositoryError::NotFound(uri.to_string()))?;
            if record.path.as_deref() == Some(new_path.as_str()) {
                return Ok(complete_uri(uri, &record));
            }
            if let Some((_, existing)) = indexes.find_by_path(&new_path)? {
                if existing.id != record.id {
                    return Err(RepositoryError::DuplicatePath { path: new_path });
                }
            }

            set_growing(&indexes.path, address, new_path.as_bytes())?;
            let old_path = record.path.replace(new_path.clone());
            if let Err(error) = indexes.uri.update(address, &record) {
                indexes.path.delete(address, new_path.as_bytes())?;
                return Err(error);
            }
            if let Some(old_path) = &old_path {
                indexes.path.delete(address, old_path.as_bytes())?;
            }

            log::debug!(
                "moved {} from {} to {new_path}",
                record.id,
                old_path.as_deref().unwrap_or("<none>")
            );
            Ok(complete_uri(&uri.clone().with_path(&new_path), &record))
        })
    }

    /// Whether the version in `uri` is stored.
    ///
    /// When the uri carries an identifier, only the identifier is consulted,
    /// even if its path points elsewhere.
    pub fn exists(&self, uri: &ResourceUri) -> Result<bool> {
        self.read(|indexes| {
            Ok(indexes
                .find(uri)?
                .is_some_and(|(address, _)| indexes.versions.has_version(address, uri.version())))
        })
    }

    /// Whether any version of the resource is stored.
    pub fn exists_in_any_version(&self, uri: &ResourceUri) -> Result<bool> {
        self.read(|indexes| Ok(indexes.find(uri)?.is_some()))
    }

    /// Identifier of the resource the uri resolves to.
    pub fn get_identifier(&self, uri: &ResourceUri) -> Result<Option<String>> {
        self.read(|indexes| Ok(indexes.find(uri)?.map(|(_, record)| record.id)))
    }

    /// Path of the resource the uri resolves to.
    pub fn get_path(&self, uri: &ResourceUri) -> Result<Option<String>> {
        self.read(|indexes| Ok(indexes.find(uri)?.and_then(|(_, record)| record.path)))
    }

    /// The uri with id, path and type filled in from the index.
    pub fn lookup(&self, uri: &ResourceUri) -> Result<Option<ResourceUri>> {
        self.read(|indexes| Ok(indexes.find(uri)?.map(|(_, record)| complete_uri(uri, &record))))
    }

    /// Stored versions of the resource, ascending (`LIVE` before `WORK`).
    pub fn get_revisions(&self, uri: &ResourceUri) -> Result<Vec<u64>> {
        self.read(|indexes| {
            Ok(indexes
                .find(uri)?
                .map(|(address, _)| indexes.versions.versions(address))
                .unwrap_or_default())
        })
    }

    /// Every stored version of every resource below the uri's path.
    ///
    /// `level` limits how many path segments below the base are included;
    /// `None` lists the whole subtree. The base itself is not listed.
    pub fn list(&self, uri: &ResourceUri, level: Option<usize>) -> Result<Vec<ResourceUri>> {
        let base = uri.path().unwrap_or("/").to_string();
        let base_depth = path_depth(&base);
        self.read(|indexes| {
            let mut listed = Vec::new();
            for (address, record) in indexes.uri.iter()? {
                let Some(path) = record.path.as_deref() else {
                    continue;
                };
                if path == base || !path_is_within(path, &base) {
                    continue;
                }
                if level.is_some_and(|level| path_depth(path) - base_depth > level) {
                    continue;
                }
                for version in indexes.versions.versions(address) {
                    listed.push(
                        ResourceUri::new(self.site.as_str())
                            .with_id(&record.id)
                            .with_path(path)
                            .with_type(&record.resource_type)
                            .with_version(version),
                    );
                }
            }
            listed.sort_by(|a, b| (a.path(), a.version()).cmp(&(b.path(), b.version())));
            Ok(listed)
        })
    }

    /// Every stored resource version.
    pub fn uris(&self) -> Result<Vec<ResourceUri>> {
        self.read(|indexes| {
            let mut uris = Vec::new();
            for (address, record) in indexes.uri.iter()? {
                for version in indexes.versions.versions(address) {
                    let mut uri = ResourceUri::new(self.site.as_str())
                        .with_id(&record.id)
                        .with_type(&record.resource_type)
                        .with_version(version);
                    if let Some(path) = &record.path {
                        uri = uri.with_path(path);
                    }
                    uris.push(uri);
                }
            }
            Ok(uris)
        })
    }

    /// Number of resources (not versions).
    pub fn size(&self) -> Result<u64> {
        self.read(|indexes| Ok(indexes.uri.len()))
    }

    pub fn load(&self) -> Result<IndexLoad> {
        self.read(|indexes| {
            Ok(IndexLoad {
                id: indexes.id.load_factor(),
                path: indexes.path.load_factor(),
                uri: indexes.uri.load_factor(),
            })
        })
    }

    pub fn clear(&self) -> Result<()> {
        self.write(|indexes| {
            indexes.clear()?;
            log::info!("cleared structural index site={}", self.site);
            Ok(())
        })
    }

    /// Flushes and releases the index files. Later calls fail with `Closed`.
    pub fn close(&self) -> Result<()> {
        let mut guard = self.indexes.write();
        if let Some(indexes) = guard.take() {
            indexes.flush()?;
        }
        Ok(())
    }
}

fn complete_uri(uri: &ResourceUri, record: &UriRecord) -> ResourceUri {
    let mut complete = uri
        .clone()
        .with_id(&record.id)
        .with_type(&record.resource_type);
    if let Some(path) = &record.path {
        complete = complete.with_path(path);
    }
    complete
}
