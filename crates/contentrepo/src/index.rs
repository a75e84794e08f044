//! Structural index of a content repository.
//!
//! Four files below `<root>/structure/` together answer "which resource is
//! this":
//!
//! - `id.idx` - slotted hash index from identifier to address
//! - `path.idx` - slotted hash index from path to address
//! - `uri.idx` - the record (id, type, path) stored at each address
//! - `version.idx` - the versions stored at each address
//!
//! Hash collisions are resolved by comparing candidates against `uri.idx`.

mod structural;

pub use structural::{
    IndexLoad, StructuralIndex, ID_INDEX_FILE, PATH_INDEX_FILE, STRUCTURAL_INDEX_VERSION,
    STRUCTURE_DIR, URI_INDEX_FILE, VERSION_INDEX_FILE, VERSION_STAMP_FILE,
};
