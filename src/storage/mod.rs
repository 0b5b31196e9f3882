mod entries;
mod proxies;
mod schema;
mod sources;
mod types;

pub(crate) use entries::{
    assign_pending_indices, find_entry_id, insert_entry, lock_source, replace_enclosures,
    update_entry, update_source_metadata,
};
pub use schema::Database;
pub use types::{
    DatabaseError, Enclosure, Entry, EntryRecord, NewEnclosure, ProxyAddress, Source,
    DEFAULT_INTERVAL,
};
