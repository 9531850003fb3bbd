//! Entries: credential records with attributes, attachments, and history.
//!
//! Attribute values live in zero-on-drop buffers. The insertion order of
//! attributes is preserved because the container format enciphers protected
//! values in document order.

use chrono::{DateTime, Utc};
use uuid::Uuid;
use zeroize::Zeroizing;

use crate::custom_data::CustomData;
use crate::times::TimeInfo;

pub const ATTR_TITLE: &str = "Title";
pub const ATTR_USERNAME: &str = "UserName";
pub const ATTR_PASSWORD: &str = "Password";
pub const ATTR_URL: &str = "URL";
pub const ATTR_NOTES: &str = "Notes";

pub const CANONICAL_ATTRIBUTES: [&str; 5] = [
    ATTR_TITLE,
    ATTR_USERNAME,
    ATTR_PASSWORD,
    ATTR_URL,
    ATTR_NOTES,
];

/// One key/value attribute. `protected` means the value is stream-enciphered
/// on disk and kept in a wiped-on-drop buffer in memory.
#[derive(Clone)]
pub struct Attribute {
    pub key: String,
    value: Zeroizing<String>,
    pub protected: bool,
}

impl Attribute {
    pub fn new(key: impl Into<String>, value: impl Into<String>, protected: bool) -> Self {
        Self {
            key: key.into(),
            value: Zeroizing::new(value.into()),
            protected,
        }
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn set_value(&mut self, value: impl Into<String>) {
        self.value = Zeroizing::new(value.into());
    }
}

impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key
            && *self.value == *other.value
            && self.protected == other.protected
    }
}

impl Eq for Attribute {}

impl std::fmt::Debug for Attribute {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Attribute")
            .field("key", &self.key)
            .field(
                "value",
                if self.protected { &"[PROTECTED]" } else { &"..." },
            )
            .field("protected", &self.protected)
            .finish()
    }
}

/// Ordered attribute map with linear lookup; entries carry a handful of keys.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EntryAttributes {
    items: Vec<Attribute>,
}

impl EntryAttributes {
    /// The canonical keys, empty, with Password protected.
    pub fn with_canonical_defaults() -> Self {
        let mut attrs = Self::default();
        for key in CANONICAL_ATTRIBUTES {
            attrs.set(key, "", key == ATTR_PASSWORD);
        }
        attrs
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.items
            .iter()
            .find(|a| a.key == key)
            .map(|a| a.value())
    }

    pub fn is_protected(&self, key: &str) -> bool {
        self.items
            .iter()
            .find(|a| a.key == key)
            .is_some_and(|a| a.protected)
    }

    /// Insert or update, keeping position on update.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>, protected: bool) {
        let key = key.into();
        match self.items.iter_mut().find(|a| a.key == key) {
            Some(attr) => {
                attr.set_value(value);
                attr.protected = protected;
            }
            None => self.items.push(Attribute::new(key, value, protected)),
        }
    }

    /// Update a value, preserving the existing protected flag.
    pub fn set_value(&mut self, key: &str, value: impl Into<String>) {
        let protected = self.is_protected(key);
        self.set(key.to_string(), value, protected);
    }

    pub fn remove(&mut self, key: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|a| a.key != key);
        self.items.len() != before
    }

    pub fn contains(&self, key: &str) -> bool {
        self.items.iter().any(|a| a.key == key)
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Attribute> {
        self.items.iter()
    }

    pub fn byte_size(&self) -> usize {
        self.items
            .iter()
            .map(|a| a.key.len() + a.value().len())
            .sum()
    }
}

/// Named binary attachments, order-preserving. Deduplication by content
/// happens in the container codec's binary pool, not here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Attachments {
    items: Vec<(String, Vec<u8>)>,
}

impl Attachments {
    pub fn get(&self, name: &str) -> Option<&[u8]> {
        self.items
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d.as_slice())
    }

    pub fn set(&mut self, name: impl Into<String>, data: Vec<u8>) {
        let name = name.into();
        match self.items.iter_mut().find(|(n, _)| *n == name) {
            Some(slot) => slot.1 = data,
            None => self.items.push((name, data)),
        }
    }

    pub fn remove(&mut self, name: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|(n, _)| n != name);
        self.items.len() != before
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[u8])> {
        self.items.iter().map(|(n, d)| (n.as_str(), d.as_slice()))
    }

    pub fn byte_size(&self) -> usize {
        self.items.iter().map(|(n, d)| n.len() + d.len()).sum()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AutoTypeAssociation {
    pub window: String,
    pub sequence: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AutoTypeSettings {
    pub enabled: bool,
    pub data_transfer_obfuscation: u32,
    pub default_sequence: String,
    pub associations: Vec<AutoTypeAssociation>,
}

impl Default for AutoTypeSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            data_transfer_obfuscation: 0,
            default_sequence: String::new(),
            associations: Vec::new(),
        }
    }
}

/// Which entry field a `{REF:...}` placeholder names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefField {
    Title,
    UserName,
    Password,
    Url,
    Notes,
    Uuid,
    Other,
}

impl RefField {
    pub fn from_code(code: char) -> Option<Self> {
        match code.to_ascii_uppercase() {
            'T' => Some(RefField::Title),
            'U' => Some(RefField::UserName),
            'P' => Some(RefField::Password),
            'A' => Some(RefField::Url),
            'N' => Some(RefField::Notes),
            'I' => Some(RefField::Uuid),
            'O' => Some(RefField::Other),
            _ => None,
        }
    }

    pub fn attribute_key(self) -> Option<&'static str> {
        match self {
            RefField::Title => Some(ATTR_TITLE),
            RefField::UserName => Some(ATTR_USERNAME),
            RefField::Password => Some(ATTR_PASSWORD),
            RefField::Url => Some(ATTR_URL),
            RefField::Notes => Some(ATTR_NOTES),
            RefField::Uuid | RefField::Other => None,
        }
    }
}

/// A parsed `{REF:X@I:text}` placeholder.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryReference {
    pub wanted: RefField,
    pub search_in: RefField,
    pub text: String,
}

impl EntryReference {
    /// Parse the first reference placeholder in `text`, case-insensitively.
    pub fn parse(text: &str) -> Option<Self> {
        let upper = text.to_ascii_uppercase();
        let start = upper.find("{REF:")?;
        let body = &text[start + 5..];
        let mut chars = body.chars();
        let wanted = RefField::from_code(chars.next()?)?;
        if chars.next()? != '@' {
            return None;
        }
        let search_in = RefField::from_code(chars.next()?)?;
        if chars.next()? != ':' {
            return None;
        }
        let rest: String = chars.collect();
        let end = rest.find('}')?;
        Some(Self {
            wanted,
            search_in,
            text: rest[..end].to_string(),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryCloneOptions {
    pub new_uuid: bool,
    pub reset_times: bool,
    pub include_history: bool,
}

impl EntryCloneOptions {
    /// Fresh copy: new identity, new times, no history.
    pub const FRESH: Self = Self {
        new_uuid: true,
        reset_times: true,
        include_history: false,
    };

    /// Exact replica, identity included.
    pub const EXACT: Self = Self {
        new_uuid: false,
        reset_times: false,
        include_history: true,
    };
}

#[derive(Debug, Clone)]
pub struct Entry {
    uuid: Uuid,
    pub icon_number: u32,
    pub custom_icon: Uuid,
    pub foreground_color: String,
    pub background_color: String,
    pub override_url: String,
    pub tags: String,
    times: TimeInfo,
    attributes: EntryAttributes,
    attachments: Attachments,
    pub auto_type: AutoTypeSettings,
    custom_data: CustomData,
    history: Vec<Entry>,
}

impl Entry {
    pub fn new() -> Self {
        Self::with_uuid(Uuid::new_v4())
    }

    pub fn with_uuid(uuid: Uuid) -> Self {
        Self {
            uuid,
            icon_number: 0,
            custom_icon: Uuid::nil(),
            foreground_color: String::new(),
            background_color: String::new(),
            override_url: String::new(),
            tags: String::new(),
            times: TimeInfo::now(),
            attributes: EntryAttributes::with_canonical_defaults(),
            attachments: Attachments::default(),
            auto_type: AutoTypeSettings::default(),
            custom_data: CustomData::new(),
            history: Vec::new(),
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

    pub fn attributes(&self) -> &EntryAttributes {
        &self.attributes
    }

    pub fn attributes_mut(&mut self) -> &mut EntryAttributes {
        &mut self.attributes
    }

    pub fn attachments(&self) -> &Attachments {
        &self.attachments
    }

    pub fn attachments_mut(&mut self) -> &mut Attachments {
        &mut self.attachments
    }

    pub fn custom_data(&self) -> &CustomData {
        &self.custom_data
    }

    pub fn custom_data_mut(&mut self) -> &mut CustomData {
        &mut self.custom_data
    }

    pub fn title(&self) -> &str {
        self.attributes.get(ATTR_TITLE).unwrap_or_default()
    }

    pub fn username(&self) -> &str {
        self.attributes.get(ATTR_USERNAME).unwrap_or_default()
    }

    pub fn password(&self) -> &str {
        self.attributes.get(ATTR_PASSWORD).unwrap_or_default()
    }

    pub fn url(&self) -> &str {
        self.attributes.get(ATTR_URL).unwrap_or_default()
    }

    pub fn notes(&self) -> &str {
        self.attributes.get(ATTR_NOTES).unwrap_or_default()
    }

    pub fn set_title(&mut self, value: impl Into<String>) {
        self.attributes.set_value(ATTR_TITLE, value);
    }

    pub fn set_username(&mut self, value: impl Into<String>) {
        self.attributes.set_value(ATTR_USERNAME, value);
    }

    pub fn set_password(&mut self, value: impl Into<String>) {
        self.attributes.set_value(ATTR_PASSWORD, value);
    }

    pub fn set_url(&mut self, value: impl Into<String>) {
        self.attributes.set_value(ATTR_URL, value);
    }

    pub fn set_notes(&mut self, value: impl Into<String>) {
        self.attributes.set_value(ATTR_NOTES, value);
    }

    pub fn is_expired(&self) -> bool {
        self.times.is_expired()
    }

    /// Attribute values matching [`EntryReference::parse`] reference another
    /// entry; the database resolves them.
    pub fn reference_in(&self, key: &str) -> Option<EntryReference> {
        self.attributes.get(key).and_then(EntryReference::parse)
    }

    // ── history ────────────────────────────────────────────────────────────

    /// Oldest first; snapshots never carry history of their own.
    pub fn history(&self) -> &[Entry] {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut Vec<Entry> {
        &mut self.history
    }

    pub fn clear_history(&mut self) {
        self.history.clear();
    }

    /// Append a prior state; nested history is stripped.
    pub fn add_history_snapshot(&mut self, mut snapshot: Entry) {
        snapshot.history.clear();
        self.history.push(snapshot);
    }

    /// Snapshot the current payload onto the history list. Called before an
    /// in-place edit so the pre-edit state is preserved.
    pub fn push_current_to_history(&mut self) {
        let snapshot = self.clone_with(EntryCloneOptions {
            new_uuid: false,
            reset_times: false,
            include_history: false,
        });
        self.history.push(snapshot);
    }

    /// Enforce the metadata history caps. Negative values mean unbounded;
    /// zero items disables history entirely. Oldest snapshots go first.
    pub fn truncate_history(&mut self, max_items: i32, max_size: i64) {
        if max_items == 0 {
            self.history.clear();
            return;
        }
        if max_items > 0 {
            while self.history.len() > max_items as usize {
                self.history.remove(0);
            }
        }
        if max_size >= 0 {
            let mut total: i64 = self
                .history
                .iter()
                .map(|e| e.approximate_size() as i64)
                .sum();
            while total > max_size && !self.history.is_empty() {
                let removed = self.history.remove(0);
                total -= removed.approximate_size() as i64;
            }
        }
    }

    /// Rough in-memory footprint used by the history size cap.
    pub fn approximate_size(&self) -> usize {
        self.attributes.byte_size()
            + self.attachments.byte_size()
            + self.tags.len()
            + self.override_url.len()
            + self.foreground_color.len()
            + self.background_color.len()
            + self.auto_type.default_sequence.len()
            + self
                .auto_type
                .associations
                .iter()
                .map(|a| a.window.len() + a.sequence.len())
                .sum::<usize>()
    }

    // ── cloning and comparison ─────────────────────────────────────────────

    pub fn clone_with(&self, options: EntryCloneOptions) -> Entry {
        let mut clone = self.clone();
        if options.new_uuid {
            clone.uuid = Uuid::new_v4();
        }
        if options.reset_times {
            clone.times = TimeInfo::now();
        }
        if !options.include_history {
            clone.history.clear();
        }
        clone
    }

    /// Adopt another entry's payload, leaving identity and history alone.
    /// The counterpart of [`Entry::equals_data`].
    pub fn copy_data_from(&mut self, other: &Entry) {
        self.icon_number = other.icon_number;
        self.custom_icon = other.custom_icon;
        self.foreground_color = other.foreground_color.clone();
        self.background_color = other.background_color.clone();
        self.override_url = other.override_url.clone();
        self.tags = other.tags.clone();
        self.times = other.times;
        self.attributes = other.attributes.clone();
        self.attachments = other.attachments.clone();
        self.auto_type = other.auto_type.clone();
        self.custom_data = other.custom_data.clone();
    }

    /// Payload equality: everything except the history list. Location,
    /// access, and usage stamps are excluded so a pure relocation or read
    /// does not register as a divergent state. Used by merge to deduplicate
    /// identical snapshots.
    pub fn equals_data(&self, other: &Entry) -> bool {
        self.uuid == other.uuid
            && self.icon_number == other.icon_number
            && self.custom_icon == other.custom_icon
            && self.foreground_color == other.foreground_color
            && self.background_color == other.background_color
            && self.override_url == other.override_url
            && self.tags == other.tags
            && self.times.creation_time == other.times.creation_time
            && self.times.last_modification_time == other.times.last_modification_time
            && self.times.expiry_time == other.times.expiry_time
            && self.times.expires == other.times.expires
            && self.attributes == other.attributes
            && self.attachments == other.attachments
            && self.auto_type == other.auto_type
            && self.custom_data == other.custom_data
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.times.last_modification_time
    }
}

impl Default for Entry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_with_size(fill: usize) -> Entry {
        let mut e = Entry::new();
        e.set_notes("x".repeat(fill));
        e
    }

    #[test]
    fn canonical_defaults_present_and_password_protected() {
        let e = Entry::new();
        for key in CANONICAL_ATTRIBUTES {
            assert!(e.attributes().contains(key), "missing {key}");
        }
        assert!(e.attributes().is_protected(ATTR_PASSWORD));
        assert!(!e.attributes().is_protected(ATTR_TITLE));
    }

    #[test]
    fn set_value_preserves_protected_flag() {
        let mut e = Entry::new();
        e.set_password("hunter2");
        assert!(e.attributes().is_protected(ATTR_PASSWORD));
        assert_eq!(e.password(), "hunter2");
    }

    #[test]
    fn attribute_order_is_insertion_order() {
        let mut e = Entry::new();
        e.attributes_mut().set("zzz", "1", false);
        e.attributes_mut().set("aaa", "2", true);
        let keys: Vec<&str> = e.attributes().iter().map(|a| a.key.as_str()).collect();
        assert_eq!(
            keys,
            ["Title", "UserName", "Password", "URL", "Notes", "zzz", "aaa"]
        );
    }

    #[test]
    fn history_count_cap_evicts_oldest() {
        let mut e = Entry::new();
        for i in 0..20 {
            e.set_title(format!("rev {i}"));
            e.push_current_to_history();
        }
        e.truncate_history(5, -1);
        assert_eq!(e.history().len(), 5);
        // oldest remaining is revision 15
        assert_eq!(e.history()[0].title(), "rev 15");
        assert_eq!(e.history()[4].title(), "rev 19");
    }

    #[test]
    fn history_size_cap_evicts_oldest() {
        let mut e = Entry::new();
        for _ in 0..4 {
            e.add_history_snapshot(entry_with_size(1000));
        }
        e.truncate_history(-1, 2500);
        assert!(e.history().len() <= 2);
    }

    #[test]
    fn zero_max_items_disables_history() {
        let mut e = Entry::new();
        e.push_current_to_history();
        e.truncate_history(0, -1);
        assert!(e.history().is_empty());
    }

    #[test]
    fn snapshots_carry_no_nested_history() {
        let mut e = Entry::new();
        e.push_current_to_history();
        e.push_current_to_history();
        for item in e.history() {
            assert!(item.history().is_empty());
        }
    }

    #[test]
    fn clone_fresh_changes_identity() {
        let mut e = Entry::new();
        e.set_title("original");
        e.push_current_to_history();
        let clone = e.clone_with(EntryCloneOptions::FRESH);
        assert_ne!(clone.uuid(), e.uuid());
        assert_eq!(clone.title(), "original");
        assert!(clone.history().is_empty());
    }

    #[test]
    fn reference_parsing() {
        let r = EntryReference::parse("{REF:P@I:46C9B1FF-BD4A-BC4B-BB26-0323E086A149}").unwrap();
        assert_eq!(r.wanted, RefField::Password);
        assert_eq!(r.search_in, RefField::Uuid);
        assert_eq!(r.text, "46C9B1FF-BD4A-BC4B-BB26-0323E086A149");

        let r = EntryReference::parse("prefix {ref:u@t:Bank Account} suffix").unwrap();
        assert_eq!(r.wanted, RefField::UserName);
        assert_eq!(r.search_in, RefField::Title);
        assert_eq!(r.text, "Bank Account");

        assert_eq!(EntryReference::parse("no reference here"), None);
        assert_eq!(EntryReference::parse("{REF:X@T:bad field}"), None);
        assert_eq!(EntryReference::parse("{REF:P@T:unterminated"), None);
    }

    #[test]
    fn equals_data_ignores_history() {
        let mut a = Entry::new();
        a.set_title("same");
        let mut b = a.clone();
        b.push_current_to_history();
        assert!(a.equals_data(&b));
        b.set_title("different");
        assert!(!a.equals_data(&b));
    }

    #[test]
    fn protected_attribute_hidden_from_debug() {
        let mut e = Entry::new();
        e.set_password("topsecret");
        let dump = format!("{:?}", e.attributes());
        assert!(!dump.contains("topsecret"), "password leaked: {dump}");
    }
}
