//! Search query construction.
//!
//! - `builder` - the fluent [`SearchQuery`] and its call-order checks
//! - `criteria` - the individual filters it accumulates

mod builder;
mod criteria;

pub use builder::SearchQuery;
pub use criteria::{DateField, DateFilter, Order, PageletCriterion, SortField, TextQuery};
pub(crate) use criteria::text_matches;
