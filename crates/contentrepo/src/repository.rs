//! ContentRepository - stores resources and keeps both indexes in step.

use std::collections::BTreeSet;
use std::fs;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::config::{load_or_create_repository_config, RepositoryConfig};
use crate::error::{file_error, RepositoryError, Result};
use crate::index::{StructuralIndex, STRUCTURAL_INDEX_VERSION, STRUCTURE_DIR};
use crate::query::SearchQuery;
use crate::resource::{Resource, ResourceUri, SiteContext};
use crate::search::{DocKey, SearchIndex, SearchResult};
use crate::serializer::SerializerRegistry;

pub const RESOURCES_DIR: &str = "resources";
const RESOURCE_EXTENSION: &str = "res";

/// Resources found in only one of the two indexes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// In the structural index but not searchable.
    pub missing_in_search: Vec<DocKey>,
    /// Searchable but unknown to the structural index.
    pub missing_in_structure: Vec<DocKey>,
}

impl ConsistencyReport {
    pub fn is_consistent(&self) -> bool {
        self.missing_in_search.is_empty() && self.missing_in_structure.is_empty()
    }
}

/// Content repository of one site.
///
/// Resource blobs live in `<root>/resources/<id>/<version>.<type>.res`, the
/// structural index in `<root>/structure/`, search documents in
/// `<root>/search/` and the configuration in `<root>/repository.json`.
#[derive(Debug)]
pub struct ContentRepository {
    root: PathBuf,
    site: String,
    config: RepositoryConfig,
    structure: StructuralIndex,
    search: SearchIndex,
    serializers: SerializerRegistry,
    writes: Mutex<()>,
}

impl ContentRepository {
    /// Opens the repository with the default serializers.
    pub fn open(root: &Path, site: &dyn SiteContext) -> Result<Self> {
        let config = load_or_create_repository_config(root)?;
        let serializers = SerializerRegistry::with_defaults(config.search.compression_level);
        Self::open_loaded(root, site, config, serializers)
    }

    /// Opens the repository, rebuilding indexes that are missing or stale.
    pub fn open_with(
        root: &Path,
        site: &dyn SiteContext,
        serializers: SerializerRegistry,
    ) -> Result<Self> {
        let config = load_or_create_repository_config(root)?;
        Self::open_loaded(root, site, config, serializers)
    }

    fn open_loaded(
        root: &Path,
        site: &dyn SiteContext,
        config: RepositoryConfig,
        serializers: SerializerRegistry,
    ) -> Result<Self> {
        let started = Instant::now();
        let site_id = site.identifier().to_string();

        let structure_stale = StructuralIndex::stored_version(root) != STRUCTURAL_INDEX_VERSION;
        let structure_dir = root.join(STRUCTURE_DIR);
        if structure_stale && structure_dir.exists() {
            log::warn!(
                "structural index {} is stale or corrupt, rebuilding",
                structure_dir.display()
            );
            fs::remove_dir_all(&structure_dir)
                .map_err(|error| file_error("remove stale index", &structure_dir, error))?;
        }

        let structure = StructuralIndex::open(root, &site_id, &config.index)?;
        let search = SearchIndex::open(root, &site_id, config.search.clone())?;
        let repository = Self {
            root: root.to_path_buf(),
            site: site_id,
            config,
            structure,
            search,
            serializers,
            writes: Mutex::new(()),
        };

        if structure_stale || repository.search.needs_rebuild() {
            repository.index()?;
        }

        log::info!(
            "content repository open site={} root={} resources={} open_ms={}",
            repository.site,
            repository.root.display(),
            repository.structure.size()?,
            started.elapsed().as_millis()
        );
        Ok(repository)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn site(&self) -> &str {
        &self.site
    }

    pub fn config(&self) -> &RepositoryConfig {
        &self.config
    }

    pub fn structure(&self) -> &StructuralIndex {
        &self.structure
    }

    pub fn search(&self) -> &SearchIndex {
        &self.search
    }

    pub fn serializers(&self) -> &SerializerRegistry {
        &self.serializers
    }

    fn resource_dir(&self, id: &str) -> PathBuf {
        self.root.join(RESOURCES_DIR).join(id)
    }

    fn blob_path(&self, uri: &ResourceUri) -> Result<PathBuf> {
        let id = uri.require_id()?;
        let resource_type = uri.resource_type().ok_or_else(|| {
            RepositoryError::InvalidInput(format!("uri {uri} has no resource type"))
        })?;
        Ok(self.resource_dir(id).join(format!(
            "{}.{resource_type}.{RESOURCE_EXTENSION}",
            uri.version()
        )))
    }

    fn write_blob(&self, resource: &Resource) -> Result<()> {
        let bytes = self
            .serializers
            .require(resource.resource_type())?
            .encode(resource)?;
        let path = self.blob_path(&resource.uri)?;
        let dir = self.resource_dir(resource.uri.require_id()?);
        fs::create_dir_all(&dir).map_err(|error| file_error("create resource directory", &dir, error))?;

        let mut tmp = NamedTempFile::new_in(&dir)
            .map_err(|error| file_error("create temp resource file in", &dir, error))?;
        tmp.write_all(&bytes)
            .map_err(|error| file_error("write resource", tmp.path(), error))?;
        tmp.persist(&path).map_err(|error| {
            RepositoryError::Internal(format!(
                "failed to finalize resource {}: {}",
                path.display(),
                error.error
            ))
        })?;
        Ok(())
    }

    fn read_blob(&self, uri: &ResourceUri) -> Result<Option<Resource>> {
        let path = self.blob_path(uri)?;
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
            Err(error) => return Err(file_error("read resource", &path, error)),
        };
        let resource_type = uri.resource_type().unwrap_or_default();
        let resource = self.serializers.require(resource_type)?.decode(&bytes)?;
        Ok(Some(resource))
    }

    fn remove_blob(&self, uri: &ResourceUri) -> Result<()> {
        let path = self.blob_path(uri)?;
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(file_error("remove resource", &path, error)),
        }
        // Drops the directory once its last version is gone.
        let dir = self.resource_dir(uri.require_id()?);
        if fs::read_dir(&dir).is_ok_and(|mut entries| entries.next().is_none()) {
            fs::remove_dir(&dir).map_err(|error| file_error("remove resource directory", &dir, error))?;
        }
        Ok(())
    }

    /// Stores a resource version, adding it to both indexes or updating it.
    ///
    /// A resource without an identifier gets one assigned; the returned uri
    /// carries it.
    pub fn put(&self, mut resource: Resource) -> Result<ResourceUri> {
        let _writes = self.writes.lock();
        // Blob names carry the type, so every version must share it.
        if let Some(existing) = self.structure.lookup(&resource.uri)? {
            if let Some(stored) = existing.resource_type() {
                if stored != resource.resource_type() {
                    return Err(RepositoryError::InvalidInput(format!(
                        "{existing} is a {stored}, not a {}; store it under a new id",
                        resource.resource_type()
                    )));
                }
            }
        }
        let known = self.structure.exists(&resource.uri)?;
        let uri = if known {
            self.structure
                .update(&resource.uri.clone().with_type(resource.resource_type()))?
        } else {
            self.structure
                .add(&resource.uri.clone().with_type(resource.resource_type()))?
        };
        resource.uri = uri.clone();

        if let Err(error) = self.write_blob(&resource) {
            if !known {
                if let Err(rollback) = self.structure.delete(&uri) {
                    log::warn!("failed to roll back structural entry for {uri}: {rollback}");
                }
            }
            return Err(error);
        }

        let indexed = if known {
            self.search.update(&resource)
        } else {
            self.search.add(&resource)
        };
        if let Err(error) = indexed {
            log::warn!("search index is behind the structural index for {uri}: {error}");
            return Err(error);
        }

        log::debug!("stored {uri}");
        Ok(uri)
    }

    /// Loads a resource version by id or path.
    pub fn get(&self, uri: &ResourceUri) -> Result<Option<Resource>> {
        let Some(uri) = self.structure.lookup(uri)? else {
            return Ok(None);
        };
        if !self.structure.exists(&uri)? {
            return Ok(None);
        }
        self.read_blob(&uri)
    }

    /// Removes one resource version. Returns false if it did not exist.
    pub fn delete(&self, uri: &ResourceUri) -> Result<bool> {
        let _writes = self.writes.lock();
        let Some(uri) = self.structure.lookup(uri)? else {
            return Ok(false);
        };
        if !self.structure.delete(&uri)? {
            return Ok(false);
        }
        self.remove_blob(&uri)?;
        if !self.search.delete(&uri)? {
            log::warn!("{uri} was not in the search index");
        }
        log::debug!("deleted {uri}");
        Ok(true)
    }

    /// Moves every version of a resource to `new_path`.
    pub fn move_to(&self, uri: &ResourceUri, new_path: &str) -> Result<ResourceUri> {
        let _writes = self.writes.lock();
        let moved = self.structure.move_to(uri, new_path)?;
        for version in self.structure.get_revisions(&moved)? {
            let versioned = moved.for_version(version);
            if let Some(mut resource) = self.read_blob(&versioned)? {
                resource.uri = versioned;
                self.write_blob(&resource)?;
            }
        }
        self.search.move_to(&moved, new_path)?;
        log::debug!("moved {uri} to {moved}");
        Ok(moved)
    }

    pub fn exists(&self, uri: &ResourceUri) -> Result<bool> {
        self.structure.exists(uri)
    }

    pub fn versions(&self, uri: &ResourceUri) -> Result<Vec<u64>> {
        self.structure.get_revisions(uri)
    }

    pub fn find(&self, query: &SearchQuery) -> Result<SearchResult> {
        self.search.get_by_query(query)
    }

    /// Number of resources (not versions).
    pub fn size(&self) -> Result<u64> {
        self.structure.size()
    }

    /// Removes every resource and empties both indexes.
    pub fn clear(&self) -> Result<()> {
        let _writes = self.writes.lock();
        self.structure.clear()?;
        self.search.clear()?;
        let dir = self.root.join(RESOURCES_DIR);
        match fs::remove_dir_all(&dir) {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {}
            Err(error) => return Err(file_error("remove resources", &dir, error)),
        }
        log::info!("cleared content repository site={}", self.site);
        Ok(())
    }

    fn stored_resources(&self) -> Result<Vec<Resource>> {
        let dir = self.root.join(RESOURCES_DIR);
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(file_error("list resources", &dir, error)),
        };

        let mut resources = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|error| file_error("list resources", &dir, error))?;
            let resource_dir = entry.path();
            if !resource_dir.is_dir() {
                continue;
            }
            let blobs = fs::read_dir(&resource_dir)
                .map_err(|error| file_error("list resource versions", &resource_dir, error))?;
            for blob in blobs {
                let blob = blob
                    .map_err(|error| file_error("list resource versions", &resource_dir, error))?
                    .path();
                let Some((_, resource_type)) = parse_blob_name(&blob) else {
                    continue;
                };
                match self.decode_blob(&blob, &resource_type) {
                    Ok(resource) if resource.uri.site() == self.site => resources.push(resource),
                    Ok(resource) => {
                        log::warn!("skipping {} from site {}", blob.display(), resource.uri.site());
                    }
                    Err(error) => log::warn!("skipping unreadable {}: {error}", blob.display()),
                }
            }
        }
        resources.sort_by(|a, b| {
            (a.uri.id(), a.uri.version()).cmp(&(b.uri.id(), b.uri.version()))
        });
        Ok(resources)
    }

    fn decode_blob(&self, path: &Path, resource_type: &str) -> Result<Resource> {
        let bytes = fs::read(path).map_err(|error| file_error("read resource", path, error))?;
        self.serializers.require(resource_type)?.decode(&bytes)
    }

    /// Rebuilds both indexes from the stored resource blobs.
    ///
    /// Returns the number of resource versions indexed.
    pub fn index(&self) -> Result<usize> {
        let _writes = self.writes.lock();
        let started = Instant::now();
        let resources = self.stored_resources()?;

        self.structure.clear()?;
        let mut indexed = Vec::with_capacity(resources.len());
        for resource in resources {
            match self.structure.add(&resource.uri) {
                Ok(_) => indexed.push(resource),
                Err(error) => log::warn!("not indexing {}: {error}", resource.uri),
            }
        }
        let count = self.search.rebuild(&indexed)?;
        self.search.flush()?;

        log::info!(
            "indexed content repository site={} versions={} index_ms={}",
            self.site,
            count,
            started.elapsed().as_millis()
        );
        Ok(count)
    }

    /// Compares the resource versions known to each index.
    pub fn check_consistency(&self) -> Result<ConsistencyReport> {
        let structural = self
            .structure
            .uris()?
            .into_iter()
            .filter_map(|uri| uri.id().map(|id| DocKey::new(id, uri.version())))
            .collect::<BTreeSet<_>>();
        let searchable = self.search.keys()?.into_iter().collect::<BTreeSet<_>>();

        let report = ConsistencyReport {
            missing_in_search: structural.difference(&searchable).cloned().collect(),
            missing_in_structure: searchable.difference(&structural).cloned().collect(),
        };
        if !report.is_consistent() {
            log::warn!(
                "index inconsistency site={} missing_in_search={} missing_in_structure={}",
                self.site,
                report.missing_in_search.len(),
                report.missing_in_structure.len()
            );
        }
        Ok(report)
    }

    pub fn close(&self) -> Result<()> {
        self.structure.close()?;
        self.search.close()
    }
}

/// Splits `<version>.<type>.res` into its version and type.
fn parse_blob_name(path: &Path) -> Option<(u64, String)> {
    let name = path.file_name()?.to_str()?;
    let stem = name.strip_suffix(&format!(".{RESOURCE_EXTENSION}"))?;
    let (version, resource_type) = stem.split_once('.')?;
    let version = version.parse().ok()?;
    if resource_type.is_empty() {
        return None;
    }
    Some((version, resource_type.to_string()))
}
