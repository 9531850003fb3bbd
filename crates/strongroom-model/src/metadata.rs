//! Database metadata: naming, recycle-bin state, history caps, memory
//! protection flags, and custom icons.

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::custom_data::CustomData;
use crate::entry::{ATTR_NOTES, ATTR_PASSWORD, ATTR_TITLE, ATTR_URL, ATTR_USERNAME};
use crate::times::now_truncated;

/// Which canonical attributes are stream-protected on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryProtection {
    pub protect_title: bool,
    pub protect_user_name: bool,
    pub protect_password: bool,
    pub protect_url: bool,
    pub protect_notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            protect_title: false,
            protect_user_name: false,
            protect_password: true,
            protect_url: false,
            protect_notes: false,
        }
    }
}

impl MemoryProtection {
    /// Whether a canonical attribute key defaults to protected. Custom keys
    /// carry their own per-value flag.
    pub fn is_protected(&self, key: &str) -> bool {
        match key {
            ATTR_TITLE => self.protect_title,
            ATTR_USERNAME => self.protect_user_name,
            ATTR_PASSWORD => self.protect_password,
            ATTR_URL => self.protect_url,
            ATTR_NOTES => self.protect_notes,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomIcon {
    pub uuid: Uuid,
    /// PNG bytes.
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub generator: String,
    pub database_name: String,
    pub database_name_changed: DateTime<Utc>,
    pub description: String,
    pub description_changed: DateTime<Utc>,
    pub default_user_name: String,
    pub default_user_name_changed: DateTime<Utc>,
    pub maintenance_history_days: u32,
    pub color: String,
    pub master_key_changed: DateTime<Utc>,
    pub master_key_change_rec: i64,
    pub master_key_change_force: i64,
    pub memory_protection: MemoryProtection,
    pub custom_icons: Vec<CustomIcon>,
    pub recycle_bin_enabled: bool,
    /// Nil when no recycle bin has been created yet.
    pub recycle_bin_uuid: Uuid,
    pub recycle_bin_changed: DateTime<Utc>,
    pub entry_templates_group: Uuid,
    pub entry_templates_group_changed: DateTime<Utc>,
    pub last_selected_group: Uuid,
    pub last_top_visible_group: Uuid,
    /// Per-entry history caps; negative disables the bound.
    pub history_max_items: i32,
    pub history_max_size: i64,
    pub settings_changed: DateTime<Utc>,
    pub custom_data: CustomData,
}

pub const DEFAULT_HISTORY_MAX_ITEMS: i32 = 10;
pub const DEFAULT_HISTORY_MAX_SIZE: i64 = 6 * 1024 * 1024;

impl Default for Metadata {
    fn default() -> Self {
        let now = now_truncated();
        Self {
            generator: "strongroom".to_string(),
            database_name: String::new(),
            database_name_changed: now,
            description: String::new(),
            description_changed: now,
            default_user_name: String::new(),
            default_user_name_changed: now,
            maintenance_history_days: 365,
            color: String::new(),
            master_key_changed: now,
            master_key_change_rec: -1,
            master_key_change_force: -1,
            memory_protection: MemoryProtection::default(),
            custom_icons: Vec::new(),
            recycle_bin_enabled: true,
            recycle_bin_uuid: Uuid::nil(),
            recycle_bin_changed: now,
            entry_templates_group: Uuid::nil(),
            entry_templates_group_changed: now,
            last_selected_group: Uuid::nil(),
            last_top_visible_group: Uuid::nil(),
            history_max_items: DEFAULT_HISTORY_MAX_ITEMS,
            history_max_size: DEFAULT_HISTORY_MAX_SIZE,
            settings_changed: now,
            custom_data: CustomData::new(),
        }
    }
}

impl Metadata {
    pub fn custom_icon(&self, uuid: Uuid) -> Option<&CustomIcon> {
        self.custom_icons.iter().find(|icon| icon.uuid == uuid)
    }

    pub fn add_custom_icon(&mut self, icon: CustomIcon) {
        match self.custom_icons.iter_mut().find(|i| i.uuid == icon.uuid) {
            Some(slot) => *slot = icon,
            None => self.custom_icons.push(icon),
        }
        self.settings_changed = now_truncated();
    }

    pub fn remove_custom_icon(&mut self, uuid: Uuid) -> bool {
        let before = self.custom_icons.len();
        self.custom_icons.retain(|i| i.uuid != uuid);
        if self.custom_icons.len() != before {
            self.settings_changed = now_truncated();
            true
        } else {
            false
        }
    }
}
