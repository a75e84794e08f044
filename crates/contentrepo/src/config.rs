//! Repository configuration stored as `repository.json` in the repository root.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{file_error, RepositoryError, Result};

pub const REPOSITORY_CONFIG_FILENAME: &str = "repository.json";
pub const REPOSITORY_CONFIG_VERSION: &str = "1.0.0";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RepositoryConfig {
    pub version: String,
    pub index: IndexGeometry,
    pub search: SearchConfig,
}

/// Initial shape of the structural index files.
///
/// Slot counts are fixed once a file holds entries; the per-entry widths
/// grow on demand.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexGeometry {
    pub id_index_slots: u64,
    pub path_index_slots: u64,
    pub entries_per_slot: u64,
    pub id_bytes: u32,
    pub type_bytes: u32,
    pub path_bytes: u32,
    pub versions_per_entry: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Write the document snapshot after every mutation.
    pub flush_on_write: bool,
    /// Zstd level used for the document snapshot.
    pub compression_level: i32,
    /// Age in days at which the recency boost has halved a score.
    pub recency_window_days: f64,
    /// Weight of title terms relative to body terms.
    pub title_boost: u32,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            version: REPOSITORY_CONFIG_VERSION.to_string(),
            index: IndexGeometry::default(),
            search: SearchConfig::default(),
        }
    }
}

impl Default for IndexGeometry {
    fn default() -> Self {
        Self {
            id_index_slots: 1024,
            path_index_slots: 1024,
            entries_per_slot: 8,
            id_bytes: 36,
            type_bytes: 16,
            path_bytes: 128,
            versions_per_entry: 4,
        }
    }
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            flush_on_write: true,
            compression_level: 6,
            recency_window_days: 30.0,
            title_boost: 2,
        }
    }
}

impl IndexGeometry {
    /// Rejects geometries that cannot back an index file.
    pub fn validate(&self) -> Result<()> {
        if self.id_index_slots == 0 || self.path_index_slots == 0 {
            return Err(RepositoryError::InvalidInput(
                "index slot counts must be positive".to_string(),
            ));
        }
        if self.entries_per_slot == 0 || self.versions_per_entry == 0 {
            return Err(RepositoryError::InvalidInput(
                "entries per slot and versions per entry must be positive".to_string(),
            ));
        }
        if self.id_bytes == 0 || self.type_bytes == 0 || self.path_bytes == 0 {
            return Err(RepositoryError::InvalidInput(
                "uri record widths must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

pub fn repository_config_path(dir: &Path) -> PathBuf {
    dir.join(REPOSITORY_CONFIG_FILENAME)
}

pub fn load_or_create_repository_config(dir: &Path) -> Result<RepositoryConfig> {
    fs::create_dir_all(dir).map_err(|error| file_error("create repository directory", dir, error))?;

    let path = repository_config_path(dir);
    if !path.exists() {
        let config = RepositoryConfig::default();
        write_repository_config(&path, &config)?;
        log::info!("created repository config at {}", path.display());
        return Ok(config);
    }

    let data = fs::read_to_string(&path)
        .map_err(|error| file_error("read repository config", &path, error))?;
    let mut config: RepositoryConfig = serde_json::from_str(&data).map_err(|error| {
        RepositoryError::Serialization(format!(
            "failed to parse repository config {}: {error}",
            path.display()
        ))
    })?;

    if config.version != REPOSITORY_CONFIG_VERSION {
        config = migrate_repository_config(config)?;
        write_repository_config(&path, &config)?;
    }
    config.index.validate()?;

    Ok(config)
}

pub fn write_repository_config(path: &Path, config: &RepositoryConfig) -> Result<()> {
    let data = serde_json::to_string_pretty(config).map_err(|error| {
        RepositoryError::Serialization(format!("failed to serialize repository config: {error}"))
    })?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, data)
        .map_err(|error| file_error("write repository config", &tmp_path, error))?;
    fs::rename(&tmp_path, path)
        .map_err(|error| file_error("finalize repository config", path, error))?;
    Ok(())
}

pub fn migrate_repository_config(config: RepositoryConfig) -> Result<RepositoryConfig> {
    Err(RepositoryError::NotImplemented(format!(
        "repository config migration from version {}",
        config.version
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn creates_default_config() {
        let temp = TempDir::new().expect("tempdir");
        let config = load_or_create_repository_config(temp.path()).expect("config");
        assert_eq!(config, RepositoryConfig::default());
        assert!(repository_config_path(temp.path()).exists());
    }

    #[test]
    fn reloads_written_config() {
        let temp = TempDir::new().expect("tempdir");
        let mut config = RepositoryConfig::default();
        config.index.entries_per_slot = 32;
        config.search.flush_on_write = false;
        write_repository_config(&repository_config_path(temp.path()), &config).expect("write");

        let loaded = load_or_create_repository_config(temp.path()).expect("config");
        assert_eq!(loaded.index.entries_per_slot, 32);
        assert!(!loaded.search.flush_on_write);
    }

    #[test]
    fn version_mismatch_is_not_migrated() {
        let temp = TempDir::new().expect("tempdir");
        let config = RepositoryConfig {
            version: "0.9.0".to_string(),
            ..RepositoryConfig::default()
        };
        write_repository_config(&repository_config_path(temp.path()), &config).expect("write");

        let result = load_or_create_repository_config(temp.path());
        assert!(matches!(result, Err(RepositoryError::NotImplemented(_))));
    }

    #[test]
    fn zero_geometry_is_rejected() {
        let geometry = IndexGeometry {
            entries_per_slot: 0,
            ..IndexGeometry::default()
        };
        assert!(geometry.validate().is_err());
    }
}
