//! On-disk index files backing the structural index.
//!
//! - `slotted` - generic slotted hash index (key hash to addresses)
//! - `uri_index` - fixed-width resource records (address to id, type, path)
//! - `version_index` - sorted version lists per address
//! - `mapped` - memory-mapped file handling shared by all of the above

mod mapped;
mod slotted;
mod uri_index;
mod version_index;

pub use slotted::{
    hash_key, slotted_file_size, SlottedHashIndex, SLOTTED_HEADER_BYTES, SLOTTED_INDEX_MAGIC,
    SLOTTED_INDEX_VERSION,
};
pub use uri_index::{UriIndex, UriRecord, URI_INDEX_VERSION};
pub use version_index::{VersionIndex, VERSION_INDEX_VERSION};
