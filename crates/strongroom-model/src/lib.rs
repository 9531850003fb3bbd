//! strongroom-model: the in-memory database tree and its lifecycle rules.
//!
//! A [`Database`] owns exactly one root [`Group`]; groups own ordered child
//! groups and [`Entry`] lists. Parent and database back-references are never
//! stored — parents are recovered by traversal, so ownership stays strictly
//! top-down and no link can extend a lifetime.
//!
//! All structural mutation (add, relocate, delete, recycle) is routed through
//! `Database` methods, which enforce the tree invariants, advance the
//! affected `location_changed` stamps, and emit change notifications.

pub mod custom_data;
pub mod database;
pub mod entry;
pub mod group;
pub mod metadata;
pub mod notify;
pub mod times;

pub use custom_data::{CustomData, CustomDataItem};
pub use database::{Compression, Database, DatabaseData, DeletedObject};
pub use entry::{
    Attribute, Attachments, AutoTypeAssociation, AutoTypeSettings, Entry, EntryAttributes,
    EntryCloneOptions, EntryReference, RefField, ATTR_NOTES, ATTR_PASSWORD, ATTR_TITLE,
    ATTR_URL, ATTR_USERNAME, CANONICAL_ATTRIBUTES,
};
pub use group::{Group, GroupCloneOptions, MergeMode, TriState};
pub use metadata::{CustomIcon, MemoryProtection, Metadata};
pub use notify::{DatabaseEvent, Notifier};
pub use times::TimeInfo;
