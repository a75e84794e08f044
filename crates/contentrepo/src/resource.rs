//! Resource model consumed by the structural and search indexes.
//!
//! Resources arrive here already parsed; this module only defines their
//! identity, searchable fields and access rules.

mod context;
mod model;
mod security;
mod uri;

pub use context::{Site, SiteContext, TemplateRef};
pub use model::{
    Language, LocalizedText, Pagelet, Resource, ResourceContent, ResourceFlags, User, FILE_TYPE,
    IMAGE_TYPE, PAGE_TYPE,
};
pub use security::{
    AccessRule, AccessRules, Precedence, Principal, RuleKind, SecurityPrincipal, SimplePrincipal,
    READ, WRITE,
};
pub use uri::{
    normalize_path, path_depth, path_is_within, version_name, ResourceUri, LIVE, WORK,
};
