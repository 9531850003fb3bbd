//! Groups: the hierarchical containers of the database tree.
//!
//! A group owns its child groups and entries outright. There is no parent
//! pointer; the database recovers parents by traversal, which keeps the tree
//! singly-owned and cycle-free by construction (cycles are still checked on
//! relocation because a detached subtree could be re-attached inside itself).

use uuid::Uuid;

use crate::custom_data::CustomData;
use crate::entry::{Entry, EntryCloneOptions};
use crate::times::TimeInfo;

/// Default icon index for new groups (folder).
pub const DEFAULT_GROUP_ICON: u32 = 48;
/// Icon index used when creating the recycle bin.
pub const RECYCLE_BIN_ICON: u32 = 43;
/// Auto-type sequence assumed at the root when nothing overrides it.
pub const ROOT_AUTO_TYPE_SEQUENCE: &str = "{USERNAME}{TAB}{PASSWORD}{ENTER}";

/// Toggles resolved up the parent chain when set to `Inherit`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TriState {
    #[default]
    Inherit,
    Enable,
    Disable,
}

/// Per-group preference for how the merge engine resolves entry conflicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MergeMode {
    /// Take the strategy from the parent chain, falling back to Synchronize.
    #[default]
    Default,
    /// Keep both sides, duplicating the older change as a new entry.
    Duplicate,
    /// Merge history forcing the local state on top regardless of age.
    KeepLocal,
    /// Merge history forcing the remote state on top regardless of age.
    KeepRemote,
    /// Newest modification wins the top slot.
    KeepNewer,
    /// Merge histories keeping the most recent on top and applying deletions.
    Synchronize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GroupCloneOptions {
    pub new_uuid: bool,
    pub reset_times: bool,
    pub include_entries: bool,
}

impl GroupCloneOptions {
    pub const FRESH: Self = Self {
        new_uuid: true,
        reset_times: true,
        include_entries: true,
    };

    pub const EXACT: Self = Self {
        new_uuid: false,
        reset_times: false,
        include_entries: true,
    };
}

#[derive(Debug, Clone)]
pub struct Group {
    uuid: Uuid,
    pub name: String,
    pub notes: String,
    pub icon_number: u32,
    pub custom_icon: Uuid,
    times: TimeInfo,
    pub is_expanded: bool,
    pub default_auto_type_sequence: String,
    pub auto_type_enabled: TriState,
    pub searching_enabled: TriState,
    pub merge_mode: MergeMode,
    custom_data: CustomData,
    /// Weak pointer to a child entry; never extends a lifetime.
    pub last_top_visible_entry: Option<Uuid>,
    children: Vec<Group>,
    entries: Vec<Entry>,
}

impl Group {
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_uuid(Uuid::new_v4(), name)
    }

    pub fn with_uuid(uuid: Uuid, name: impl Into<String>) -> Self {
        Self {
            uuid,
            name: name.into(),
            notes: String::new(),
            icon_number: DEFAULT_GROUP_ICON,
            custom_icon: Uuid::nil(),
            times: TimeInfo::now(),
            is_expanded: true,
            default_auto_type_sequence: String::new(),
            auto_type_enabled: TriState::Inherit,
            searching_enabled: TriState::Inherit,
            merge_mode: MergeMode::Default,
            custom_data: CustomData::new(),
            last_top_visible_entry: None,
            children: Vec::new(),
            entries: Vec::new(),
        }
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn set_uuid(&mut self, uuid: Uuid) {
        self.uuid = uuid;
    }

    pub fn times(&self) -> &TimeInfo {
        &self.times
    }

    pub fn times_mut(&mut self) -> &mut TimeInfo {
        &mut self.times
    }

    pub fn custom_data(&self) -> &CustomData {
        &self.custom_data
    }

    pub fn custom_data_mut(&mut self) -> &mut CustomData {
        &mut self.custom_data
    }

    pub fn is_expired(&self) -> bool {
        self.times.is_expired()
    }

    pub fn children(&self) -> &[Group] {
        &self.children
    }

    pub fn children_mut(&mut self) -> &mut Vec<Group> {
        &mut self.children
    }

    pub fn entries(&self) -> &[Entry] {
        &self.entries
    }

    pub fn entries_mut(&mut self) -> &mut Vec<Entry> {
        &mut self.entries
    }

    pub fn add_child(&mut self, group: Group) {
        self.children.push(group);
    }

    pub fn add_entry(&mut self, entry: Entry) {
        self.entries.push(entry);
    }

    // ── lookup ─────────────────────────────────────────────────────────────

    /// Find a group by UUID in this subtree, including this group itself.
    pub fn find_group(&self, uuid: Uuid) -> Option<&Group> {
        if self.uuid == uuid {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.find_group(uuid))
    }

    pub fn find_group_mut(&mut self, uuid: Uuid) -> Option<&mut Group> {
        if self.uuid == uuid {
            return Some(self);
        }
        self.children
            .iter_mut()
            .find_map(|c| c.find_group_mut(uuid))
    }

    pub fn find_entry(&self, uuid: Uuid) -> Option<&Entry> {
        self.entries
            .iter()
            .find(|e| e.uuid() == uuid)
            .or_else(|| self.children.iter().find_map(|c| c.find_entry(uuid)))
    }

    pub fn find_entry_mut(&mut self, uuid: Uuid) -> Option<&mut Entry> {
        if let Some(index) = self.entries.iter().position(|e| e.uuid() == uuid) {
            return Some(&mut self.entries[index]);
        }
        self.children
            .iter_mut()
            .find_map(|c| c.find_entry_mut(uuid))
    }

    /// The group (within this subtree) whose direct children contain `uuid`.
    pub fn parent_of_group(&self, uuid: Uuid) -> Option<&Group> {
        if self.children.iter().any(|c| c.uuid == uuid) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.parent_of_group(uuid))
    }

    /// The group (within this subtree) directly holding entry `uuid`.
    pub fn parent_of_entry(&self, uuid: Uuid) -> Option<&Group> {
        if self.entries.iter().any(|e| e.uuid() == uuid) {
            return Some(self);
        }
        self.children.iter().find_map(|c| c.parent_of_entry(uuid))
    }

    pub fn find_child_by_name(&self, name: &str) -> Option<&Group> {
        self.children.iter().find(|c| c.name == name)
    }

    /// Resolve `/A/B` style paths relative to this group. An empty or `/`
    /// path resolves to this group.
    pub fn find_group_by_path(&self, path: &str) -> Option<&Group> {
        let mut current = self;
        for part in path.split('/').filter(|p| !p.is_empty()) {
            current = current.find_child_by_name(part)?;
        }
        Some(current)
    }

    /// Resolve `/A/B/Title` style paths: the last component is an entry
    /// title inside the group named by the rest.
    pub fn find_entry_by_path(&self, path: &str) -> Option<&Entry> {
        let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
        let (title, group_parts) = parts.split_last()?;
        let mut current = self;
        for part in group_parts {
            current = current.find_child_by_name(part)?;
        }
        current.entries.iter().find(|e| e.title() == *title)
    }

    /// Case-insensitive substring search over full entry paths, returning
    /// the matching paths.
    pub fn locate(&self, term: &str) -> Vec<String> {
        let mut results = Vec::new();
        let needle = term.to_lowercase();
        self.locate_into(&needle, "", &mut results);
        results
    }

    fn locate_into(&self, needle: &str, base: &str, results: &mut Vec<String>) {
        for entry in &self.entries {
            let path = format!("{base}/{}", entry.title());
            if path.to_lowercase().contains(needle) {
                results.push(path);
            }
        }
        for child in &self.children {
            let child_base = format!("{base}/{}", child.name);
            child.locate_into(needle, &child_base, results);
        }
    }

    // ── traversal ──────────────────────────────────────────────────────────

    /// Depth-first over this group and every descendant group.
    pub fn iter_groups(&self) -> GroupIter<'_> {
        GroupIter { stack: vec![self] }
    }

    /// Every entry in this subtree, in depth-first group order.
    pub fn iter_entries(&self) -> impl Iterator<Item = &Entry> {
        self.iter_groups().flat_map(|g| g.entries.iter())
    }

    pub fn group_count_recursive(&self) -> usize {
        self.iter_groups().count()
    }

    pub fn entry_count_recursive(&self) -> usize {
        self.iter_entries().count()
    }

    // ── detachment ─────────────────────────────────────────────────────────

    /// Detach a descendant group, transferring ownership to the caller.
    pub fn take_group(&mut self, uuid: Uuid) -> Option<Group> {
        if let Some(index) = self.children.iter().position(|c| c.uuid == uuid) {
            return Some(self.children.remove(index));
        }
        self.children.iter_mut().find_map(|c| c.take_group(uuid))
    }

    /// Detach a descendant entry, transferring ownership to the caller.
    pub fn take_entry(&mut self, uuid: Uuid) -> Option<Entry> {
        if let Some(index) = self.entries.iter().position(|e| e.uuid() == uuid) {
            return Some(self.entries.remove(index));
        }
        self.children.iter_mut().find_map(|c| c.take_entry(uuid))
    }

    // ── cloning ────────────────────────────────────────────────────────────

    pub fn clone_with(
        &self,
        entry_options: EntryCloneOptions,
        group_options: GroupCloneOptions,
    ) -> Group {
        let mut clone = Group {
            uuid: if group_options.new_uuid {
                Uuid::new_v4()
            } else {
                self.uuid
            },
            name: self.name.clone(),
            notes: self.notes.clone(),
            icon_number: self.icon_number,
            custom_icon: self.custom_icon,
            times: if group_options.reset_times {
                TimeInfo::now()
            } else {
                self.times
            },
            is_expanded: self.is_expanded,
            default_auto_type_sequence: self.default_auto_type_sequence.clone(),
            auto_type_enabled: self.auto_type_enabled,
            searching_enabled: self.searching_enabled,
            merge_mode: self.merge_mode,
            custom_data: self.custom_data.clone(),
            last_top_visible_entry: self.last_top_visible_entry,
            children: Vec::new(),
            entries: Vec::new(),
        };
        if group_options.include_entries {
            clone.entries = self
                .entries
                .iter()
                .map(|e| e.clone_with(entry_options))
                .collect();
        }
        clone.children = self
            .children
            .iter()
            .map(|c| c.clone_with(entry_options, group_options))
            .collect();
        clone
    }

    /// Copy scalar fields from another group, leaving identity, children,
    /// and entries untouched. Used when the merge engine adopts the newer
    /// side's data.
    pub fn copy_data_from(&mut self, other: &Group) {
        self.name = other.name.clone();
        self.notes = other.notes.clone();
        self.icon_number = other.icon_number;
        self.custom_icon = other.custom_icon;
        self.times = *other.times();
        self.is_expanded = other.is_expanded;
        self.default_auto_type_sequence = other.default_auto_type_sequence.clone();
        self.auto_type_enabled = other.auto_type_enabled;
        self.searching_enabled = other.searching_enabled;
        self.merge_mode = other.merge_mode;
    }
}

pub struct GroupIter<'a> {
    stack: Vec<&'a Group>,
}

impl<'a> Iterator for GroupIter<'a> {
    type Item = &'a Group;

    fn next(&mut self) -> Option<Self::Item> {
        let group = self.stack.pop()?;
        // push in reverse so iteration visits children in list order
        self.stack.extend(group.children.iter().rev());
        Some(group)
    }
}
