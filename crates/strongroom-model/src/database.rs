//! The database: one root group, metadata, tombstones, and the key state.
//!
//! Structural operations live here rather than on `Group` so every mutation
//! can enforce the tree invariants (no cycles, root stays put, UUIDs are
//! unique), advance `location_changed`, record tombstones, and emit change
//! notifications in one place.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use strongroom_core::{Error, Result, VariantDictionary};
use strongroom_crypto::composite::CompositeKey;
use strongroom_crypto::kdf::{Kdf, TransformedKey};
use strongroom_crypto::random::random_array;
use strongroom_crypto::symmetric::CipherKind;

use crate::entry::{Entry, EntryReference, RefField};
use crate::group::{Group, TriState, RECYCLE_BIN_ICON, ROOT_AUTO_TYPE_SEQUENCE};
use crate::metadata::Metadata;
use crate::notify::{DatabaseEvent, Notifier};
use crate::times::now_truncated;

/// `(UUID, deletionTime)` record of a permanent deletion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deletion_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Compression {
    None,
    #[default]
    Gzip,
}

impl Compression {
    pub fn as_u32(self) -> u32 {
        match self {
            Compression::None => 0,
            Compression::Gzip => 1,
        }
    }

    pub fn from_u32(value: u32) -> Result<Self> {
        match value {
            0 => Ok(Compression::None),
            1 => Ok(Compression::Gzip),
            other => Err(Error::format(format!(
                "unknown compression algorithm {other}"
            ))),
        }
    }
}

/// Cipher selection, KDF parameters, and key state for one database file.
#[derive(Clone)]
pub struct DatabaseData {
    pub cipher: CipherKind,
    pub compression: Compression,
    pub kdf: Kdf,
    pub key: Option<Arc<CompositeKey>>,
    /// KDF output, cached after unlock so re-saves skip the slow transform
    /// unless the seed changed.
    pub transformed_master_key: Option<TransformedKey>,
    /// Per-file random salt; regenerated on every save.
    pub master_seed: [u8; 32],
    pub public_custom_data: VariantDictionary,
}

impl Default for DatabaseData {
    fn default() -> Self {
        Self {
            cipher: CipherKind::Aes256Cbc,
            compression: Compression::Gzip,
            kdf: Kdf::default(),
            key: None,
            transformed_master_key: None,
            master_seed: random_array(),
            public_custom_data: VariantDictionary::new(),
        }
    }
}

impl std::fmt::Debug for DatabaseData {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DatabaseData")
            .field("cipher", &self.cipher)
            .field("compression", &self.compression)
            .field("has_key", &self.key.is_some())
            .field("unlocked", &self.transformed_master_key.is_some())
            .finish()
    }
}

pub struct Database {
    /// Process-unique identity; not persisted, distinguishes live instances.
    id: Uuid,
    root: Group,
    metadata: Metadata,
    deleted_objects: Vec<DeletedObject>,
    data: DatabaseData,
    notifier: Notifier,
    file_path: Option<PathBuf>,
}

impl Database {
    pub fn new() -> Self {
        Self {
            id: Uuid::new_v4(),
            root: Group::new("Root"),
            metadata: Metadata::default(),
            deleted_objects: Vec::new(),
            data: DatabaseData::default(),
            notifier: Notifier::new(),
            file_path: None,
        }
    }

    /// Rebuild from codec output: the parsed tree, metadata, and tombstones.
    pub fn from_parts(
        root: Group,
        metadata: Metadata,
        deleted_objects: Vec<DeletedObject>,
        data: DatabaseData,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            root,
            metadata,
            deleted_objects,
            data,
            notifier: Notifier::new(),
            file_path: None,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn root(&self) -> &Group {
        &self.root
    }

    /// Direct tree access for the codec and merge layers. Collaborators
    /// should prefer the invariant-checked operations on `Database`.
    pub fn root_mut(&mut self) -> &mut Group {
        &mut self.root
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn metadata_mut(&mut self) -> &mut Metadata {
        &mut self.metadata
    }

    pub fn data(&self) -> &DatabaseData {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut DatabaseData {
        &mut self.data
    }

    pub fn file_path(&self) -> Option<&Path> {
        self.file_path.as_deref()
    }

    pub fn set_file_path(&mut self, path: impl Into<PathBuf>) {
        self.file_path = Some(path.into());
    }

    // ── lookup ─────────────────────────────────────────────────────────────

    pub fn find_group(&self, uuid: Uuid) -> Option<&Group> {
        self.root.find_group(uuid)
    }

    pub fn find_group_mut(&mut self, uuid: Uuid) -> Option<&mut Group> {
        self.root.find_group_mut(uuid)
    }

    pub fn find_entry(&self, uuid: Uuid) -> Option<&Entry> {
        self.root.find_entry(uuid)
    }

    pub fn find_entry_mut(&mut self, uuid: Uuid) -> Option<&mut Entry> {
        self.root.find_entry_mut(uuid)
    }

    pub fn parent_of_group(&self, uuid: Uuid) -> Option<&Group> {
        self.root.parent_of_group(uuid)
    }

    pub fn parent_of_entry(&self, uuid: Uuid) -> Option<&Group> {
        self.root.parent_of_entry(uuid)
    }

    pub fn contains_uuid(&self, uuid: Uuid) -> bool {
        self.root.find_group(uuid).is_some() || self.root.find_entry(uuid).is_some()
    }

    /// Group names from the root down to `uuid`, root excluded.
    pub fn hierarchy(&self, uuid: Uuid) -> Option<Vec<String>> {
        let path = self.path_to_group(uuid)?;
        Some(path.iter().skip(1).map(|g| g.name.clone()).collect())
    }

    fn path_to_group(&self, uuid: Uuid) -> Option<Vec<&Group>> {
        fn walk<'a>(group: &'a Group, uuid: Uuid, acc: &mut Vec<&'a Group>) -> bool {
            acc.push(group);
            if group.uuid() == uuid {
                return true;
            }
            for child in group.children() {
                if walk(child, uuid, acc) {
                    return true;
                }
            }
            acc.pop();
            false
        }
        let mut acc = Vec::new();
        walk(&self.root, uuid, &mut acc).then_some(acc)
    }

    // ── tri-state resolution ───────────────────────────────────────────────

    pub fn resolve_searching_enabled(&self, group_uuid: Uuid) -> bool {
        self.resolve_tri_state(group_uuid, |g| g.searching_enabled)
    }

    pub fn resolve_auto_type_enabled(&self, group_uuid: Uuid) -> bool {
        self.resolve_tri_state(group_uuid, |g| g.auto_type_enabled)
    }

    fn resolve_tri_state(&self, group_uuid: Uuid, pick: impl Fn(&Group) -> TriState) -> bool {
        if let Some(path) = self.path_to_group(group_uuid) {
            for group in path.iter().rev() {
                match pick(group) {
                    TriState::Enable => return true,
                    TriState::Disable => return false,
                    TriState::Inherit => continue,
                }
            }
        }
        true
    }

    /// Nearest non-empty default sequence up the chain, else the root default.
    pub fn effective_auto_type_sequence(&self, group_uuid: Uuid) -> String {
        if let Some(path) = self.path_to_group(group_uuid) {
            for group in path.iter().rev() {
                if !group.default_auto_type_sequence.is_empty() {
                    return group.default_auto_type_sequence.clone();
                }
            }
        }
        ROOT_AUTO_TYPE_SEQUENCE.to_string()
    }

    // ── structural mutation ────────────────────────────────────────────────

    pub fn add_group(&mut self, parent: Uuid, mut group: Group) -> Result<Uuid> {
        self.assert_fresh_subtree(&group)?;
        let uuid = group.uuid();
        group.times_mut().update_location();
        let target = self
            .root
            .find_group_mut(parent)
            .ok_or_else(|| Error::invariant("parent group does not exist"))?;
        self.notifier.emit(DatabaseEvent::GroupAboutToAdd { parent });
        target.add_child(group);
        self.notifier.emit(DatabaseEvent::GroupAdded { uuid });
        self.notifier.mark_modified();
        Ok(uuid)
    }

    pub fn add_entry(&mut self, parent: Uuid, mut entry: Entry) -> Result<Uuid> {
        let uuid = entry.uuid();
        if self.contains_uuid(uuid) {
            return Err(Error::invariant("UUID already present in the tree"));
        }
        entry.times_mut().update_location();
        let target = self
            .root
            .find_group_mut(parent)
            .ok_or_else(|| Error::invariant("parent group does not exist"))?;
        self.notifier.emit(DatabaseEvent::EntryAboutToAdd { parent });
        target.add_entry(entry);
        self.notifier.emit(DatabaseEvent::EntryAdded { uuid });
        self.notifier.mark_modified();
        Ok(uuid)
    }

    /// Re-parent a group, updating its `location_changed`.
    pub fn relocate_group(&mut self, uuid: Uuid, new_parent: Uuid) -> Result<()> {
        if uuid == self.root.uuid() {
            return Err(Error::invariant("the root group cannot be re-parented"));
        }
        let moved = self
            .root
            .find_group(uuid)
            .ok_or_else(|| Error::invariant("group does not exist"))?;
        if moved.find_group(new_parent).is_some() {
            return Err(Error::invariant(
                "a group cannot become its own descendant",
            ));
        }
        if self.root.find_group(new_parent).is_none() {
            return Err(Error::invariant("destination group does not exist"));
        }
        if self
            .parent_of_group(uuid)
            .is_some_and(|p| p.uuid() == new_parent)
        {
            return Ok(());
        }

        self.notifier
            .emit(DatabaseEvent::GroupAboutToMove { uuid, to: new_parent });
        let mut group = self
            .root
            .take_group(uuid)
            .ok_or_else(|| Error::invariant("group does not exist"))?;
        group.times_mut().update_location();
        self.root
            .find_group_mut(new_parent)
            .expect("destination checked above")
            .add_child(group);
        self.notifier.emit(DatabaseEvent::GroupMoved { uuid });
        self.notifier.mark_modified();
        Ok(())
    }

    /// Re-parent an entry, updating its `location_changed`.
    pub fn relocate_entry(&mut self, uuid: Uuid, new_parent: Uuid) -> Result<()> {
        if self.root.find_group(new_parent).is_none() {
            return Err(Error::invariant("destination group does not exist"));
        }
        if self
            .parent_of_entry(uuid)
            .is_some_and(|p| p.uuid() == new_parent)
        {
            return Ok(());
        }
        let mut entry = self
            .root
            .take_entry(uuid)
            .ok_or_else(|| Error::invariant("entry does not exist"))?;
        entry.times_mut().update_location();
        self.root
            .find_group_mut(new_parent)
            .expect("destination checked above")
            .add_entry(entry);
        self.notifier.emit(DatabaseEvent::EntryAdded { uuid });
        self.notifier.mark_modified();
        Ok(())
    }

    /// Detach a group without recording tombstones.
    pub fn remove_group(&mut self, uuid: Uuid) -> Result<Group> {
        if uuid == self.root.uuid() {
            return Err(Error::invariant("the root group cannot be removed"));
        }
        self.notifier.emit(DatabaseEvent::GroupAboutToRemove { uuid });
        let group = self
            .root
            .take_group(uuid)
            .ok_or_else(|| Error::invariant("group does not exist"))?;
        self.notifier.emit(DatabaseEvent::GroupRemoved { uuid });
        self.notifier.mark_modified();
        Ok(group)
    }

    /// Detach an entry without recording a tombstone.
    pub fn remove_entry(&mut self, uuid: Uuid) -> Result<Entry> {
        self.notifier.emit(DatabaseEvent::EntryAboutToRemove { uuid });
        let entry = self
            .root
            .take_entry(uuid)
            .ok_or_else(|| Error::invariant("entry does not exist"))?;
        self.notifier.emit(DatabaseEvent::EntryRemoved { uuid });
        self.notifier.mark_modified();
        Ok(entry)
    }

    /// Permanently delete a group: the whole subtree is destroyed and a
    /// tombstone is recorded for every group and entry in it.
    pub fn delete_group_permanent(&mut self, uuid: Uuid) -> Result<()> {
        let group = self.remove_group(uuid)?;
        for g in group.iter_groups() {
            self.record_tombstone(g.uuid());
            for e in g.entries() {
                self.record_tombstone(e.uuid());
            }
        }
        Ok(())
    }

    pub fn delete_entry_permanent(&mut self, uuid: Uuid) -> Result<()> {
        let entry = self.remove_entry(uuid)?;
        self.record_tombstone(entry.uuid());
        Ok(())
    }

    // ── recycle bin ────────────────────────────────────────────────────────

    pub fn recycle_bin(&self) -> Option<&Group> {
        let uuid = self.metadata.recycle_bin_uuid;
        if uuid.is_nil() {
            return None;
        }
        self.root.find_group(uuid)
    }

    pub fn is_in_recycle_bin(&self, uuid: Uuid) -> bool {
        self.recycle_bin()
            .is_some_and(|bin| bin.find_group(uuid).is_some() || bin.find_entry(uuid).is_some())
    }

    fn ensure_recycle_bin(&mut self) -> Uuid {
        if let Some(bin) = self.recycle_bin() {
            return bin.uuid();
        }
        let mut bin = Group::new("Recycle Bin");
        bin.icon_number = RECYCLE_BIN_ICON;
        bin.searching_enabled = TriState::Disable;
        bin.auto_type_enabled = TriState::Disable;
        bin.is_expanded = false;
        let uuid = bin.uuid();
        let root_uuid = self.root.uuid();
        self.add_group(root_uuid, bin)
            .expect("fresh group under the root always attaches");
        self.metadata.recycle_bin_uuid = uuid;
        self.metadata.recycle_bin_changed = now_truncated();
        uuid
    }

    /// Move an entry to the recycle bin, creating the bin on demand.
    pub fn recycle_entry(&mut self, uuid: Uuid) -> Result<()> {
        let bin = self.ensure_recycle_bin();
        self.relocate_entry(uuid, bin)
    }

    /// Move a group and its contents to the recycle bin.
    pub fn recycle_group(&mut self, uuid: Uuid) -> Result<()> {
        let bin = self.ensure_recycle_bin();
        if uuid == bin {
            return Err(Error::invariant("the recycle bin cannot recycle itself"));
        }
        self.relocate_group(uuid, bin)
    }

    /// Delete an entry with recycle-bin semantics: first deletion recycles,
    /// deleting from inside the bin (or with the bin disabled) is permanent.
    pub fn delete_entry(&mut self, uuid: Uuid) -> Result<()> {
        if self.metadata.recycle_bin_enabled && !self.is_in_recycle_bin(uuid) {
            self.recycle_entry(uuid)
        } else {
            self.delete_entry_permanent(uuid)
        }
    }

    /// Delete a group with recycle-bin semantics.
    pub fn delete_group(&mut self, uuid: Uuid) -> Result<()> {
        if self.metadata.recycle_bin_enabled && !self.is_in_recycle_bin(uuid) {
            self.recycle_group(uuid)
        } else {
            self.delete_group_permanent(uuid)
        }
    }

    /// Permanently delete everything below the recycle bin, recording one
    /// tombstone per descendant. The bin group itself stays.
    pub fn empty_recycle_bin(&mut self) -> Result<()> {
        let Some(bin) = self.recycle_bin() else {
            return Ok(());
        };
        let group_uuids: Vec<Uuid> = bin.children().iter().map(|g| g.uuid()).collect();
        let entry_uuids: Vec<Uuid> = bin.entries().iter().map(|e| e.uuid()).collect();
        debug!(
            groups = group_uuids.len(),
            entries = entry_uuids.len(),
            "emptying recycle bin"
        );
        for uuid in group_uuids {
            self.delete_group_permanent(uuid)?;
        }
        for uuid in entry_uuids {
            self.delete_entry_permanent(uuid)?;
        }
        Ok(())
    }

    // ── tombstones ─────────────────────────────────────────────────────────

    pub fn deleted_objects(&self) -> &[DeletedObject] {
        &self.deleted_objects
    }

    pub fn set_deleted_objects(&mut self, objects: Vec<DeletedObject>) {
        self.deleted_objects = objects;
    }

    pub fn contains_deleted_object(&self, uuid: Uuid) -> bool {
        self.deleted_objects.iter().any(|d| d.uuid == uuid)
    }

    pub fn deleted_object(&self, uuid: Uuid) -> Option<&DeletedObject> {
        self.deleted_objects.iter().find(|d| d.uuid == uuid)
    }

    /// Record a tombstone. Never duplicated for the same UUID: the newest
    /// deletion time wins.
    pub fn add_deleted_object(&mut self, tombstone: DeletedObject) {
        match self
            .deleted_objects
            .iter_mut()
            .find(|d| d.uuid == tombstone.uuid)
        {
            Some(existing) => {
                if tombstone.deletion_time > existing.deletion_time {
                    existing.deletion_time = tombstone.deletion_time;
                }
            }
            None => self.deleted_objects.push(tombstone),
        }
    }

    pub fn remove_deleted_object(&mut self, uuid: Uuid) {
        self.deleted_objects.retain(|d| d.uuid != uuid);
    }

    fn record_tombstone(&mut self, uuid: Uuid) {
        self.add_deleted_object(DeletedObject {
            uuid,
            deletion_time: now_truncated(),
        });
    }

    // ── entry updates and references ───────────────────────────────────────

    /// Edit an entry in place: the pre-edit state is pushed to history, the
    /// modification time advances, and the history caps are enforced.
    pub fn update_entry(&mut self, uuid: Uuid, edit: impl FnOnce(&mut Entry)) -> Result<()> {
        let max_items = self.metadata.history_max_items;
        let max_size = self.metadata.history_max_size;
        let entry = self
            .root
            .find_entry_mut(uuid)
            .ok_or_else(|| Error::invariant("entry does not exist"))?;
        entry.push_current_to_history();
        edit(entry);
        entry.times_mut().update_modification();
        entry.truncate_history(max_items, max_size);
        self.notifier.emit(DatabaseEvent::EntryDataChanged { uuid });
        self.notifier.mark_modified();
        Ok(())
    }

    /// Edit a group's data in place, advancing its modification time.
    pub fn update_group(&mut self, uuid: Uuid, edit: impl FnOnce(&mut Group)) -> Result<()> {
        let group = self
            .root
            .find_group_mut(uuid)
            .ok_or_else(|| Error::invariant("group does not exist"))?;
        edit(group);
        group.times_mut().update_modification();
        self.notifier.emit(DatabaseEvent::GroupDataChanged { uuid });
        self.notifier.mark_modified();
        Ok(())
    }

    /// Record that an entry was used: bumps usage count and access time
    /// without touching the modification time or history.
    pub fn touch_entry(&mut self, uuid: Uuid) -> Result<()> {
        let entry = self
            .root
            .find_entry_mut(uuid)
            .ok_or_else(|| Error::invariant("entry does not exist"))?;
        entry.times_mut().bump_usage();
        Ok(())
    }

    /// Find the entry a reference text names, searching the given field
    /// case-insensitively across the whole tree.
    pub fn resolve_entry(&self, text: &str, field: RefField) -> Option<&Entry> {
        match field {
            RefField::Uuid => {
                let uuid = Uuid::parse_str(text.trim()).ok()?;
                self.root.find_entry(uuid)
            }
            RefField::Other => self.root.iter_entries().find(|e| {
                e.attributes()
                    .iter()
                    .any(|a| a.value().eq_ignore_ascii_case(text))
            }),
            field => {
                let key = field.attribute_key()?;
                self.root.iter_entries().find(|e| {
                    e.attributes()
                        .get(key)
                        .is_some_and(|v| v.eq_ignore_ascii_case(text))
                })
            }
        }
    }

    /// Resolve an attribute value, following `{REF:X@I:...}` chains. Cycles
    /// are broken by remembering visited entries; on a cycle the raw
    /// reference text is returned.
    pub fn resolve_attribute_value(&self, entry_uuid: Uuid, key: &str) -> Option<String> {
        let entry = self.root.find_entry(entry_uuid)?;
        let mut visited = HashSet::new();
        Some(self.resolve_value_inner(entry, key, &mut visited))
    }

    fn resolve_value_inner(
        &self,
        entry: &Entry,
        key: &str,
        visited: &mut HashSet<Uuid>,
    ) -> String {
        let raw = entry.attributes().get(key).unwrap_or_default().to_string();
        let Some(reference) = EntryReference::parse(&raw) else {
            return raw;
        };
        if !visited.insert(entry.uuid()) {
            return raw;
        }
        let Some(target) = self.resolve_entry(&reference.text, reference.search_in) else {
            return raw;
        };
        let Some(wanted_key) = reference.wanted.attribute_key() else {
            return raw;
        };
        self.resolve_value_inner(target, wanted_key, visited)
    }

    // ── key management ─────────────────────────────────────────────────────

    pub fn key(&self) -> Option<&Arc<CompositeKey>> {
        self.data.key.as_ref()
    }

    pub fn has_key(&self) -> bool {
        self.data.key.is_some()
    }

    pub fn set_key(&mut self, key: Arc<CompositeKey>) {
        self.data.key = Some(key);
        self.data.transformed_master_key = None;
        self.metadata.master_key_changed = now_truncated();
        self.notifier.mark_modified();
    }

    /// Value comparison against the stored composite, constant time.
    pub fn verify_key(&self, candidate: &CompositeKey) -> bool {
        self.data
            .key
            .as_ref()
            .is_some_and(|key| key.as_ref() == candidate)
    }

    /// Swap KDF parameters, randomize a fresh seed, and force a rekey on the
    /// next save.
    pub fn change_kdf(&mut self, mut kdf: Kdf) {
        kdf.randomize_seed();
        self.data.kdf = kdf;
        self.data.transformed_master_key = None;
        self.notifier.mark_modified();
    }

    /// Run the KDF over the stored composite (challenging hardware tokens
    /// with the current master seed) and cache the result.
    pub fn transform_key(&mut self, abort: Option<&AtomicBool>) -> Result<()> {
        let key = self.data.key.as_ref().ok_or(Error::Key)?;
        let transformed = key.transform(&self.data.kdf, Some(&self.data.master_seed), abort)?;
        self.data.transformed_master_key = Some(transformed);
        Ok(())
    }

    // ── notifications ──────────────────────────────────────────────────────

    pub fn register_observer(
        &mut self,
        observer: impl Fn(&DatabaseEvent) + Send + 'static,
    ) {
        self.notifier.register(observer);
    }

    pub fn set_emit_modified(&mut self, enabled: bool) {
        self.notifier.set_emit_modified(enabled);
    }

    pub fn mark_modified(&mut self) {
        self.notifier.mark_modified();
    }

    pub fn flush_modified(&mut self) {
        self.notifier.flush_modified();
    }

    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    // ── invariants ─────────────────────────────────────────────────────────

    fn assert_fresh_subtree(&self, group: &Group) -> Result<()> {
        for g in group.iter_groups() {
            if self.contains_uuid(g.uuid()) {
                return Err(Error::invariant("UUID already present in the tree"));
            }
            for e in g.entries() {
                if self.contains_uuid(e.uuid()) {
                    return Err(Error::invariant("UUID already present in the tree"));
                }
            }
        }
        Ok(())
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl Clone for Database {
    /// A clone is a distinct live instance: same content, fresh identity,
    /// no observers.
    fn clone(&self) -> Self {
        Self {
            id: Uuid::new_v4(),
            root: self.root.clone(),
            metadata: self.metadata.clone(),
            deleted_objects: self.deleted_objects.clone(),
            data: self.data.clone(),
            notifier: Notifier::new(),
            file_path: self.file_path.clone(),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("id", &self.id)
            .field("groups", &self.root.group_count_recursive())
            .field("entries", &self.root.entry_count_recursive())
            .field("tombstones", &self.deleted_objects.len())
            .finish()
    }
}
