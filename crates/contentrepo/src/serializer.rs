//! Resource serializers keyed by resource type.
//!
//! The repository stores each resource version as one blob. Which encoding a
//! blob uses is decided by the serializer registered for its type.

use std::fmt;
use std::io::BufReader;
use std::sync::Arc;

use fnv::FnvHashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{RepositoryError, Result};
use crate::resource::{Resource, FILE_TYPE, IMAGE_TYPE, PAGE_TYPE};

/// Blob format version - increment when changing [`StoredResource`].
pub const RESOURCE_BLOB_VERSION: u32 = 1;

/// Encodes and decodes resources of one type.
pub trait ResourceSerializer: Send + Sync {
    fn resource_type(&self) -> &str;

    fn encode(&self, resource: &Resource) -> Result<Vec<u8>>;

    fn decode(&self, bytes: &[u8]) -> Result<Resource>;
}

#[derive(Serialize, Deserialize)]
struct StoredResource {
    version: u32,
    resource: Resource,
}

/// Postcard encoding wrapped in a zstd frame.
#[derive(Debug, Clone)]
pub struct PostcardSerializer {
    resource_type: String,
    compression_level: i32,
}

impl PostcardSerializer {
    pub fn new(resource_type: impl Into<String>) -> Self {
        Self {
            resource_type: resource_type.into(),
            compression_level: 6,
        }
    }

    pub fn with_compression_level(mut self, level: i32) -> Self {
        self.compression_level = level;
        self
    }
}

impl ResourceSerializer for PostcardSerializer {
    fn resource_type(&self) -> &str {
        &self.resource_type
    }

    fn encode(&self, resource: &Resource) -> Result<Vec<u8>> {
        let stored = StoredResource {
            version: RESOURCE_BLOB_VERSION,
            resource: resource.clone(),
        };
        let encoded = postcard::to_allocvec(&stored).map_err(|error| {
            RepositoryError::Serialization(format!(
                "failed to encode {} with postcard: {error}",
                resource.uri
            ))
        })?;
        zstd::encode_all(encoded.as_slice(), self.compression_level).map_err(|error| {
            RepositoryError::Serialization(format!("failed to compress {}: {error}", resource.uri))
        })
    }

    fn decode(&self, bytes: &[u8]) -> Result<Resource> {
        let decoded = zstd::decode_all(BufReader::new(bytes)).map_err(|error| {
            RepositoryError::Serialization(format!("failed to decompress resource blob: {error}"))
        })?;
        let stored: StoredResource = postcard::from_bytes(&decoded).map_err(|error| {
            RepositoryError::Serialization(format!("failed to decode resource blob: {error}"))
        })?;
        if stored.version != RESOURCE_BLOB_VERSION {
            return Err(RepositoryError::Serialization(format!(
                "resource blob version {} != {RESOURCE_BLOB_VERSION}",
                stored.version
            )));
        }
        if stored.resource.resource_type() != self.resource_type {
            return Err(RepositoryError::Serialization(format!(
                "blob holds a {} resource, expected {}",
                stored.resource.resource_type(),
                self.resource_type
            )));
        }
        Ok(stored.resource)
    }
}

/// Serializers available to a repository, one per resource type.
#[derive(Default)]
pub struct SerializerRegistry {
    serializers: RwLock<FnvHashMap<String, Arc<dyn ResourceSerializer>>>,
}

impl fmt::Debug for SerializerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut types = self.types();
        types.sort();
        f.debug_struct("SerializerRegistry")
            .field("types", &types)
            .finish()
    }
}

impl SerializerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with postcard serializers for pages, files and images.
    pub fn with_defaults(compression_level: i32) -> Self {
        let registry = Self::new();
        for resource_type in [PAGE_TYPE, FILE_TYPE, IMAGE_TYPE] {
            registry.register(Arc::new(
                PostcardSerializer::new(resource_type).with_compression_level(compression_level),
            ));
        }
        registry
    }

    /// Registers `serializer`, replacing any earlier one for the same type.
    pub fn register(&self, serializer: Arc<dyn ResourceSerializer>) {
        let resource_type = serializer.resource_type().to_string();
        log::debug!("registered serializer for {resource_type}");
        self.serializers.write().insert(resource_type, serializer);
    }

    pub fn get(&self, resource_type: &str) -> Option<Arc<dyn ResourceSerializer>> {
        self.serializers.read().get(resource_type).cloned()
    }

    pub fn require(&self, resource_type: &str) -> Result<Arc<dyn ResourceSerializer>> {
        self.get(resource_type).ok_or_else(|| {
            RepositoryError::NotFound(format!("no serializer for resource type {resource_type}"))
        })
    }

    pub fn types(&self) -> Vec<String> {
        self.serializers.read().keys().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::{Pagelet, ResourceUri, User};
    use chrono::{TimeZone, Utc};

    fn page() -> Resource {
        let at = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).single().expect("date");
        Resource::page(ResourceUri::new("demo").with_id("p1").with_path("/news"))
            .with_title("en", "News")
            .with_subject("sports")
            .with_creator(User::new("amelie"), at)
            .with_pagelet(
                "main",
                Pagelet::new("text", "paragraph").with_element("body", "en", "Hello"),
            )
    }

    #[test]
    fn postcard_serializer_restores_resource() {
        let serializer = PostcardSerializer::new(PAGE_TYPE);
        let resource = page();
        let bytes = serializer.encode(&resource).expect("encode");
        assert_eq!(serializer.decode(&bytes).expect("decode"), resource);
    }

    #[test]
    fn decode_rejects_other_type_and_garbage() {
        let bytes = PostcardSerializer::new(PAGE_TYPE)
            .encode(&page())
            .expect("encode");
        let result = PostcardSerializer::new(FILE_TYPE).decode(&bytes);
        assert!(matches!(result, Err(RepositoryError::Serialization(_))));

        let result = PostcardSerializer::new(PAGE_TYPE).decode(b"not a blob");
        assert!(matches!(result, Err(RepositoryError::Serialization(_))));
    }

    #[test]
    fn registry_lookup() {
        let registry = SerializerRegistry::with_defaults(3);
        assert!(registry.get(PAGE_TYPE).is_some());
        assert!(registry.get(IMAGE_TYPE).is_some());
        assert!(matches!(
            registry.require("movie"),
            Err(RepositoryError::NotFound(_))
        ));

        registry.register(Arc::new(PostcardSerializer::new("movie")));
        assert_eq!(
            registry.require("movie").expect("movie").resource_type(),
            "movie"
        );
    }
}
