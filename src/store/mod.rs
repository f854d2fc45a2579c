//! Persistent record store for catalog items and reviews.
//!
//! Records are stored as serialized JSON in the shared database, with a
//! secondary index table maintained in the same transaction as every write:
//! - `catalog`: indexed by id, `neighborhood` and `cuisine_type`
//! - `reviews`: indexed by id and by owning `restaurant_id`
//!
//! Population markers record which collections have been filled from the
//! origin, so any context can tell an empty-but-populated set from one that
//! was never fetched.

mod models;
mod records;
mod traits;

pub use models::{CatalogRecord, ReviewDraft, ReviewId, ReviewRecord};
pub use records::{RecordStore, StoreTransaction};
pub(crate) use records::{delete_record, distinct, load_by_index, merge_favorite, store_record};
pub use traits::{Collection, Mode, PopulationKey, Record};
