//! The merge algorithm.
//!
//! Four phases, in order:
//!   1. groups — create missing groups (ancestors first), adopt the newer
//!      side's data, re-parent by the newer `location_changed`;
//!   2. entries — clone missing entries, reconcile existing ones under the
//!      effective merge mode, re-parent by `location_changed`;
//!   3. tombstones — delete target objects that are tombstoned in the source
//!      and were not modified after the deletion, then union the tombstone
//!      lists keeping the newest deletion time per UUID;
//!   4. metadata — newer-stamp scalar fields and a per-key custom-data union.
//!
//! Timestamps written into the target always come from the winning replica,
//! never from the wall clock, which is what makes a re-merge idempotent.

use chrono::{DateTime, Utc};
use tracing::debug;
use uuid::Uuid;

use strongroom_core::Result;
use strongroom_model::{
    CustomData, Database, Entry, EntryCloneOptions, Group, MergeMode,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeSummary {
    pub groups_added: usize,
    pub groups_updated: usize,
    pub groups_relocated: usize,
    pub entries_added: usize,
    pub entries_merged: usize,
    pub entries_relocated: usize,
    pub entries_duplicated: usize,
    pub deletions_applied: usize,
    pub tombstones_kept: usize,
}

impl std::fmt::Display for MergeSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} groups added, {} updated, {} moved; {} entries added, {} merged, \
             {} moved, {} duplicated; {} deletions applied, {} tombstones",
            self.groups_added,
            self.groups_updated,
            self.groups_relocated,
            self.entries_added,
            self.entries_merged,
            self.entries_relocated,
            self.entries_duplicated,
            self.deletions_applied,
            self.tombstones_kept,
        )
    }
}

#[derive(Debug, Default)]
pub struct Merger {
    mode_override: Option<MergeMode>,
}

impl Merger {
    /// Merge using each target group's configured mode (default Synchronize).
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge forcing one strategy for every entry.
    pub fn with_mode(mode: MergeMode) -> Self {
        Self {
            mode_override: Some(mode),
        }
    }

    pub fn merge(&self, target: &mut Database, source: &Database) -> Result<MergeSummary> {
        let mut summary = MergeSummary::default();
        let emit_before = target.notifier().emit_modified_enabled();
        target.set_emit_modified(false);

        self.merge_root_data(target, source, &mut summary);
        self.merge_groups(target, source, &mut summary);
        self.merge_entries(target, source, &mut summary);
        self.apply_tombstones(target, source, &mut summary);
        self.merge_metadata(target, source);

        target.set_emit_modified(emit_before);
        target.mark_modified();
        debug!(%summary, "merge complete");
        Ok(summary)
    }

    fn db_mode(&self, target: &Database) -> MergeMode {
        self.effective_mode(target, target.root().uuid())
    }

    /// Walk the target parent chain for the first non-default mode.
    fn effective_mode(&self, target: &Database, group_uuid: Uuid) -> MergeMode {
        if let Some(mode) = self.mode_override {
            return mode;
        }
        let mut current = Some(group_uuid);
        while let Some(uuid) = current {
            let Some(group) = target.find_group(uuid) else {
                break;
            };
            if group.merge_mode != MergeMode::Default {
                return group.merge_mode;
            }
            current = target.parent_of_group(uuid).map(|g| g.uuid());
        }
        MergeMode::Synchronize
    }

    // ── phase 1: groups ────────────────────────────────────────────────────

    fn merge_root_data(&self, target: &mut Database, source: &Database, summary: &mut MergeSummary) {
        if source.root().uuid() != target.root().uuid() {
            return;
        }
        let source_precedence = self.source_precedence(target);
        if source.root().times().last_modification_time
            > target.root().times().last_modification_time
        {
            let src = shallow_group_copy(source.root());
            target.root_mut().copy_data_from(&src);
            summary.groups_updated += 1;
        }
        let src_custom = source.root().custom_data().clone();
        merge_custom_data(
            target.root_mut().custom_data_mut(),
            &src_custom,
            source_precedence,
        );
    }

    fn merge_groups(&self, target: &mut Database, source: &Database, summary: &mut MergeSummary) {
        for (mapped_parent, src_group) in source_groups(source, target.root().uuid()) {
            let uuid = src_group.uuid();
            if uuid == target.root().uuid() {
                continue;
            }
            if target.find_group(uuid).is_some() {
                self.update_existing_group(target, source, src_group, mapped_parent, summary);
                continue;
            }
            // honor tombstones unless the source side is newer than the
            // recorded deletion
            if let Some(tombstone) = target.deleted_object(uuid) {
                if src_group.times().last_modification_time <= tombstone.deletion_time {
                    continue;
                }
            }
            let Some(parent) = resolve_parent(target, mapped_parent) else {
                continue;
            };
            let copy = shallow_group_copy(src_group);
            target
                .root_mut()
                .find_group_mut(parent)
                .expect("parent resolved above")
                .add_child(copy);
            summary.groups_added += 1;
        }
    }

    fn update_existing_group(
        &self,
        target: &mut Database,
        _source: &Database,
        src_group: &Group,
        mapped_parent: Uuid,
        summary: &mut MergeSummary,
    ) {
        let uuid = src_group.uuid();
        let source_precedence = self.source_precedence(target);

        let (newer_data, tgt_loc) = {
            let tgt = target.find_group(uuid).expect("caller checked presence");
            (
                src_group.times().last_modification_time
                    > tgt.times().last_modification_time,
                tgt.times().location_changed,
            )
        };
        if newer_data {
            let copy = shallow_group_copy(src_group);
            target
                .root_mut()
                .find_group_mut(uuid)
                .expect("caller checked presence")
                .copy_data_from(&copy);
            summary.groups_updated += 1;
        }
        merge_custom_data(
            target
                .root_mut()
                .find_group_mut(uuid)
                .expect("caller checked presence")
                .custom_data_mut(),
            src_group.custom_data(),
            source_precedence,
        );

        // the newer location wins the parent
        let src_loc = src_group.times().location_changed;
        if src_loc > tgt_loc {
            let desired = match resolve_parent(target, mapped_parent) {
                Some(parent) => parent,
                None => return,
            };
            let current = target.parent_of_group(uuid).map(|g| g.uuid());
            if current != Some(desired) && !creates_cycle(target, uuid, desired) {
                if let Some(group) = target.root_mut().take_group(uuid) {
                    target
                        .root_mut()
                        .find_group_mut(desired)
                        .expect("destination resolved above")
                        .add_child(group);
                    summary.groups_relocated += 1;
                }
            }
        }
        if let Some(group) = target.root_mut().find_group_mut(uuid) {
            group.times_mut().location_changed = src_loc.max(tgt_loc);
        }
    }

    // ── phase 2: entries ───────────────────────────────────────────────────

    fn merge_entries(&self, target: &mut Database, source: &Database, summary: &mut MergeSummary) {
        let mut duplicates: Vec<(Uuid, Entry)> = Vec::new();

        for (mapped_parent, src_entry) in source_entries(source, target.root().uuid()) {
            let uuid = src_entry.uuid();
            if target.find_entry(uuid).is_some() {
                let group_uuid = target
                    .parent_of_entry(uuid)
                    .map(|g| g.uuid())
                    .unwrap_or_else(|| target.root().uuid());
                let mode = self.effective_mode(target, group_uuid);
                self.merge_existing_entry(
                    target,
                    src_entry,
                    mapped_parent,
                    mode,
                    &mut duplicates,
                    summary,
                );
                continue;
            }
            if let Some(tombstone) = target.deleted_object(uuid) {
                if src_entry.last_modified() <= tombstone.deletion_time {
                    continue;
                }
            }
            let Some(parent) = resolve_parent(target, mapped_parent) else {
                continue;
            };
            let clone = src_entry.clone_with(EntryCloneOptions::EXACT);
            target
                .root_mut()
                .find_group_mut(parent)
                .expect("parent resolved above")
                .add_entry(clone);
            summary.entries_added += 1;
        }

        for (parent, entry) in duplicates {
            if let Some(group) = target.root_mut().find_group_mut(parent) {
                group.add_entry(entry);
                summary.entries_duplicated += 1;
            }
        }
    }

    fn merge_existing_entry(
        &self,
        target: &mut Database,
        src_entry: &Entry,
        mapped_parent: Uuid,
        mode: MergeMode,
        duplicates: &mut Vec<(Uuid, Entry)>,
        summary: &mut MergeSummary,
    ) {
        let uuid = src_entry.uuid();
        let max_items = target.metadata().history_max_items;
        let max_size = target.metadata().history_max_size;

        let (tgt_loc, current_parent) = {
            let parent = target
                .parent_of_entry(uuid)
                .map(|g| g.uuid())
                .unwrap_or_else(|| target.root().uuid());
            let entry = target.find_entry(uuid).expect("caller checked presence");
            (entry.times().location_changed, parent)
        };
        let src_loc = src_entry.times().location_changed;

        {
            let entry = target
                .root_mut()
                .find_entry_mut(uuid)
                .expect("caller checked presence");
            match mode {
                MergeMode::KeepLocal => {
                    if !entry.equals_data(src_entry) {
                        let newest_history: Option<DateTime<Utc>> =
                            entry.history().iter().map(|h| h.last_modified()).max();
                        let newer_than_all = newest_history
                            .map_or(true, |stamp| src_entry.last_modified() > stamp);
                        if newer_than_all {
                            entry.add_history_snapshot(snapshot_of(src_entry));
                            summary.entries_merged += 1;
                        }
                    }
                }
                MergeMode::KeepRemote => {
                    if !entry.equals_data(src_entry) {
                        entry.push_current_to_history();
                        entry.copy_data_from(src_entry);
                        summary.entries_merged += 1;
                    }
                }
                MergeMode::KeepNewer | MergeMode::Synchronize | MergeMode::Default => {
                    if synchronize_histories(entry, src_entry) {
                        summary.entries_merged += 1;
                    }
                }
                MergeMode::Duplicate => {
                    if !entry.equals_data(src_entry) {
                        let dup = src_entry.clone_with(EntryCloneOptions {
                            new_uuid: true,
                            reset_times: false,
                            include_history: true,
                        });
                        duplicates.push((current_parent, dup));
                    }
                }
            }
            entry.truncate_history(max_items, max_size);
        }

        // parenting: newer location_changed wins (Duplicate keeps both sides
        // where they are)
        if mode != MergeMode::Duplicate {
            if src_loc > tgt_loc {
                if let Some(desired) = resolve_parent(target, mapped_parent) {
                    if desired != current_parent {
                        if let Some(entry) = target.root_mut().take_entry(uuid) {
                            target
                                .root_mut()
                                .find_group_mut(desired)
                                .expect("destination resolved above")
                                .add_entry(entry);
                            summary.entries_relocated += 1;
                        }
                    }
                }
            }
            // the winning stamp sticks even when the payload merge adopted
            // the other side's times
            if let Some(entry) = target.root_mut().find_entry_mut(uuid) {
                entry.times_mut().location_changed = src_loc.max(tgt_loc);
            }
        }
    }

    // ── phase 3: tombstones ────────────────────────────────────────────────

    fn apply_tombstones(
        &self,
        target: &mut Database,
        source: &Database,
        summary: &mut MergeSummary,
    ) {
        // entries first
        for tombstone in source.deleted_objects() {
            let dead = target
                .find_entry(tombstone.uuid)
                .is_some_and(|e| e.last_modified() < tombstone.deletion_time);
            if dead {
                let _ = target.root_mut().take_entry(tombstone.uuid);
                summary.deletions_applied += 1;
            }
        }
        // groups: only once empty, deepest-first via fixpoint
        loop {
            let mut removed = false;
            for tombstone in source.deleted_objects() {
                if tombstone.uuid == target.root().uuid() {
                    continue;
                }
                let dead = target.find_group(tombstone.uuid).is_some_and(|g| {
                    g.children().is_empty()
                        && g.entries().is_empty()
                        && g.times().last_modification_time < tombstone.deletion_time
                });
                if dead {
                    let _ = target.root_mut().take_group(tombstone.uuid);
                    summary.deletions_applied += 1;
                    removed = true;
                }
            }
            if !removed {
                break;
            }
        }

        // union the lists, newest deletion time per UUID
        for tombstone in source.deleted_objects() {
            target.add_deleted_object(*tombstone);
        }
        // an object that survived its tombstone (newer modification) wins;
        // drop the stale record so no live UUID stays tombstoned
        let stale: Vec<Uuid> = target
            .deleted_objects()
            .iter()
            .map(|d| d.uuid)
            .filter(|uuid| target.contains_uuid(*uuid))
            .collect();
        for uuid in stale {
            target.remove_deleted_object(uuid);
        }
        summary.tombstones_kept = target.deleted_objects().len();
    }

    // ── phase 4: metadata ──────────────────────────────────────────────────

    fn merge_metadata(&self, target: &mut Database, source: &Database) {
        let source_precedence = self.source_precedence(target);
        let meta = source.metadata();
        let t = target.metadata_mut();

        if meta.database_name_changed > t.database_name_changed {
            t.database_name = meta.database_name.clone();
            t.database_name_changed = meta.database_name_changed;
        }
        if meta.description_changed > t.description_changed {
            t.description = meta.description.clone();
            t.description_changed = meta.description_changed;
        }
        if meta.default_user_name_changed > t.default_user_name_changed {
            t.default_user_name = meta.default_user_name.clone();
            t.default_user_name_changed = meta.default_user_name_changed;
        }
        if meta.recycle_bin_changed > t.recycle_bin_changed {
            t.recycle_bin_enabled = meta.recycle_bin_enabled;
            t.recycle_bin_uuid = meta.recycle_bin_uuid;
            t.recycle_bin_changed = meta.recycle_bin_changed;
        }
        if meta.entry_templates_group_changed > t.entry_templates_group_changed {
            t.entry_templates_group = meta.entry_templates_group;
            t.entry_templates_group_changed = meta.entry_templates_group_changed;
        }
        if meta.master_key_changed > t.master_key_changed {
            t.master_key_changed = meta.master_key_changed;
        }
        if meta.settings_changed > t.settings_changed {
            t.memory_protection = meta.memory_protection.clone();
            t.history_max_items = meta.history_max_items;
            t.history_max_size = meta.history_max_size;
            t.maintenance_history_days = meta.maintenance_history_days;
            t.color = meta.color.clone();
            t.settings_changed = meta.settings_changed;
        }
        for icon in &meta.custom_icons {
            if t.custom_icon(icon.uuid).is_none() {
                t.custom_icons.push(icon.clone());
            }
        }
        merge_custom_data(&mut t.custom_data, &meta.custom_data, source_precedence);
    }

    fn source_precedence(&self, target: &Database) -> bool {
        matches!(
            self.db_mode(target),
            MergeMode::KeepRemote | MergeMode::Synchronize
        )
    }
}

// ── helpers ────────────────────────────────────────────────────────────────

/// Source groups in parents-first order, paired with the target parent UUID
/// (the source root maps onto the target root).
fn source_groups<'a>(source: &'a Database, target_root: Uuid) -> Vec<(Uuid, &'a Group)> {
    fn walk<'a>(
        group: &'a Group,
        mapped_uuid: Uuid,
        out: &mut Vec<(Uuid, &'a Group)>,
    ) {
        for child in group.children() {
            out.push((mapped_uuid, child));
            walk(child, child.uuid(), out);
        }
    }
    let mut out = Vec::new();
    walk(source.root(), target_root, &mut out);
    out
}

/// Source entries paired with the target group UUID they belong in.
fn source_entries<'a>(source: &'a Database, target_root: Uuid) -> Vec<(Uuid, &'a Entry)> {
    let mut out = Vec::new();
    for group in source.root().iter_groups() {
        let mapped = if group.uuid() == source.root().uuid() {
            target_root
        } else {
            group.uuid()
        };
        for entry in group.entries() {
            out.push((mapped, entry));
        }
    }
    out
}

/// A group's own data without children or entries.
fn shallow_group_copy(group: &Group) -> Group {
    let mut copy = Group::with_uuid(group.uuid(), group.name.clone());
    copy.copy_data_from(group);
    *copy.custom_data_mut() = group.custom_data().clone();
    copy.last_top_visible_entry = group.last_top_visible_entry;
    copy
}

fn resolve_parent(target: &Database, mapped_parent: Uuid) -> Option<Uuid> {
    target.find_group(mapped_parent).map(|g| g.uuid())
}

fn creates_cycle(target: &Database, moved: Uuid, destination: Uuid) -> bool {
    moved == destination
        || target
            .find_group(moved)
            .is_some_and(|g| g.find_group(destination).is_some())
}

/// Per-key union: a key present on both sides is resolved by item timestamps
/// when available, otherwise the target wins unless the strategy gives the
/// source precedence.
fn merge_custom_data(dst: &mut CustomData, src: &CustomData, source_precedence: bool) {
    for (key, item) in src.iter() {
        let take = match dst.item(key) {
            None => true,
            Some(existing) => match (existing.last_modified, item.last_modified) {
                (Some(ours), Some(theirs)) => theirs > ours,
                _ => source_precedence && existing.value != item.value,
            },
        };
        if take {
            dst.set_item(key, item.clone());
        }
    }
}

fn snapshot_of(entry: &Entry) -> Entry {
    entry.clone_with(EntryCloneOptions {
        new_uuid: false,
        reset_times: false,
        include_history: false,
    })
}

/// Merge both sides' histories and current states: snapshots are ordered by
/// modification time, identical ones collapse, and the newest becomes the
/// entry's current state. Returns whether anything changed.
fn synchronize_histories(entry: &mut Entry, source: &Entry) -> bool {
    let mut snapshots: Vec<Entry> = Vec::new();
    for item in entry.history() {
        snapshots.push(snapshot_of(item));
    }
    snapshots.push(snapshot_of(entry));
    for item in source.history() {
        snapshots.push(snapshot_of(item));
    }
    snapshots.push(snapshot_of(source));

    snapshots.sort_by_key(|e| e.last_modified());
    let mut kept: Vec<Entry> = Vec::new();
    for snapshot in snapshots {
        if !kept.iter().any(|k| k.equals_data(&snapshot)) {
            kept.push(snapshot);
        }
    }
    let current = kept.pop().expect("at least the two current states exist");

    let changed = !entry.equals_data(&current)
        || entry.history().len() != kept.len()
        || entry
            .history()
            .iter()
            .zip(kept.iter())
            .any(|(a, b)| !a.equals_data(b));

    entry.copy_data_from(&current);
    entry.clear_history();
    for snapshot in kept {
        entry.add_history_snapshot(snapshot);
    }
    changed
}
