//! Search document snapshot read/write.
//!
//! Documents are encoded with postcard, compressed with zstd and written
//! through a temp file that is renamed over the previous snapshot.

use std::fs::{self, File};
use std::io::{BufWriter, ErrorKind, Read};
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::document::SearchDocument;
use crate::error::{RepositoryError, Result};

/// Snapshot format version - increment when changing [`SearchDocument`].
pub const SEARCH_SNAPSHOT_VERSION: u32 = 1;

pub const SEARCH_DIR: &str = "search";
pub const SEARCH_SNAPSHOT_FILE: &str = "documents.bin.zst";

#[derive(Serialize, Deserialize)]
struct SearchSnapshot {
    version: u32,
    site: String,
    saved_at: i64,
    documents: Vec<SearchDocument>,
}

/// Outcome of reading a snapshot.
#[derive(Debug)]
pub(crate) enum SnapshotLoad {
    Missing,
    Loaded(Vec<SearchDocument>),
    /// Present but unusable (corrupt, other version or other site).
    Invalid,
}

pub(crate) fn write_snapshot<'a>(
    path: &Path,
    site: &str,
    documents: impl Iterator<Item = &'a SearchDocument>,
    compression_level: i32,
) -> Result<()> {
    let snapshot = SearchSnapshot {
        version: SEARCH_SNAPSHOT_VERSION,
        site: site.to_string(),
        saved_at: Utc::now().timestamp(),
        documents: documents.cloned().collect(),
    };

    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|error| {
            RepositoryError::Internal(format!(
                "failed to create search directory {}: {error}",
                parent.display()
            ))
        })?;
    }

    let tmp_path = path.with_extension("tmp");
    {
        let output = File::create(&tmp_path).map_err(|error| {
            RepositoryError::Internal(format!(
                "failed to create search snapshot {}: {error}",
                tmp_path.display()
            ))
        })?;
        let encoder = zstd::Encoder::new(output, compression_level).map_err(|error| {
            RepositoryError::Internal(format!("failed to create zstd encoder: {error}"))
        })?;
        let mut output = BufWriter::new(encoder.auto_finish());
        postcard::to_io(&snapshot, &mut output).map_err(|error| {
            RepositoryError::Serialization(format!(
                "failed to encode search snapshot with postcard: {error}"
            ))
        })?;
    }

    fs::rename(&tmp_path, path).map_err(|error| {
        RepositoryError::Internal(format!(
            "failed to finalize search snapshot {}: {error}",
            path.display()
        ))
    })?;

    log::debug!(
        "wrote search snapshot to {} ({} documents)",
        path.display(),
        snapshot.documents.len()
    );
    Ok(())
}

pub(crate) fn load_snapshot(path: &Path, site: &str) -> SnapshotLoad {
    let input = match File::open(path) {
        Ok(file) => file,
        Err(error) if error.kind() == ErrorKind::NotFound => return SnapshotLoad::Missing,
        Err(error) => {
            log::warn!("search snapshot read failed for {}: {error}", path.display());
            return SnapshotLoad::Invalid;
        }
    };

    let mut bytes = Vec::new();
    let decoded = zstd::Decoder::new(input).and_then(|mut decoder| decoder.read_to_end(&mut bytes));
    if let Err(error) = decoded {
        log::warn!(
            "search snapshot decompress failed for {}: {error}",
            path.display()
        );
        return SnapshotLoad::Invalid;
    }

    let snapshot: SearchSnapshot = match postcard::from_bytes(&bytes) {
        Ok(snapshot) => snapshot,
        Err(error) => {
            log::warn!("search snapshot decode failed for {}: {error}", path.display());
            return SnapshotLoad::Invalid;
        }
    };

    if snapshot.version != SEARCH_SNAPSHOT_VERSION {
        log::debug!(
            "search snapshot version mismatch: {} != {}",
            snapshot.version,
            SEARCH_SNAPSHOT_VERSION
        );
        return SnapshotLoad::Invalid;
    }
    if snapshot.site != site {
        log::debug!("search snapshot site mismatch: {} != {site}", snapshot.site);
        return SnapshotLoad::Invalid;
    }

    log::debug!(
        "loaded search snapshot {} ({} documents, saved at {})",
        path.display(),
        snapshot.documents.len(),
        snapshot.saved_at
    );
    SnapshotLoad::Loaded(snapshot.documents)
}
