//! Content repository indexing and search library.
//!
//! This crate keeps the resources of one site findable:
//! - Memory-mapped slotted hash indexes resolving ids, paths and versions
//! - Full-text and field search with a fluent query builder
//! - Compressed resource blobs and search snapshots
//! - A repository facade that keeps both indexes in step

pub mod config;
pub mod error;
pub mod index;
pub mod query;
pub mod repository;
pub mod resource;
pub mod search;
pub mod serializer;
pub mod storage;

// Re-export main types
pub use config::{IndexGeometry, RepositoryConfig, SearchConfig};
pub use error::{RepositoryError, Result};
pub use index::StructuralIndex;
pub use query::{Order, SearchQuery};
pub use repository::{ConsistencyReport, ContentRepository};
pub use resource::{Resource, ResourceUri, Site, SiteContext};
pub use search::{SearchIndex, SearchResult, SearchResultItem};
pub use serializer::{PostcardSerializer, ResourceSerializer, SerializerRegistry};
