//! Domain model → XML document tree.
//!
//! Attachment bodies are pooled and deduplicated by content hash; entries
//! reference pool indices. Protected values are written in plaintext here
//! and enciphered afterwards by [`super::protect_values`], in the same
//! document order this writer emits.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha2::{Digest, Sha256};

use strongroom_core::Result;
use strongroom_model::{
    CustomData, Database, Entry, Group, MemoryProtection, Metadata, TimeInfo,
    CANONICAL_ATTRIBUTES,
};

use crate::xml::{encode_bool, encode_time, encode_tri_state, encode_uuid, XmlElement};

/// Content-addressed attachment pool built while writing the tree.
#[derive(Default)]
pub struct BinaryPool {
    by_hash: HashMap<[u8; 32], usize>,
    items: Vec<Vec<u8>>,
}

impl BinaryPool {
    pub fn index_for(&mut self, data: &[u8]) -> usize {
        let hash: [u8; 32] = Sha256::digest(data).into();
        if let Some(&index) = self.by_hash.get(&hash) {
            return index;
        }
        let index = self.items.len();
        self.items.push(data.to_vec());
        self.by_hash.insert(hash, index);
        index
    }

    pub fn into_items(self) -> Vec<Vec<u8>> {
        self.items
    }
}

/// Serialize the database into a document tree plus the attachment pool the
/// inner header must carry.
pub fn write_document(db: &Database) -> Result<(XmlElement, Vec<Vec<u8>>)> {
    let mut pool = BinaryPool::default();

    let mut doc = XmlElement::new("KeePassFile");
    doc.add_child(write_meta(db.metadata()));

    let mut root = XmlElement::new("Root");
    root.add_child(write_group(
        db.root(),
        &mut pool,
        &db.metadata().memory_protection,
    ));

    let mut deleted = XmlElement::new("DeletedObjects");
    for tombstone in db.deleted_objects() {
        let mut elem = XmlElement::new("DeletedObject");
        elem.add_text_child("UUID", encode_uuid(tombstone.uuid));
        elem.add_text_child("DeletionTime", encode_time(tombstone.deletion_time));
        deleted.add_child(elem);
    }
    root.add_child(deleted);
    doc.add_child(root);

    Ok((doc, pool.into_items()))
}

fn write_meta(meta: &Metadata) -> XmlElement {
    let mut elem = XmlElement::new("Meta");
    elem.add_text_child("Generator", meta.generator.clone());
    elem.add_text_child("DatabaseName", meta.database_name.clone());
    elem.add_text_child("DatabaseNameChanged", encode_time(meta.database_name_changed));
    elem.add_text_child("DatabaseDescription", meta.description.clone());
    elem.add_text_child(
        "DatabaseDescriptionChanged",
        encode_time(meta.description_changed),
    );
    elem.add_text_child("DefaultUserName", meta.default_user_name.clone());
    elem.add_text_child(
        "DefaultUserNameChanged",
        encode_time(meta.default_user_name_changed),
    );
    elem.add_text_child(
        "MaintenanceHistoryDays",
        meta.maintenance_history_days.to_string(),
    );
    elem.add_text_child("Color", meta.color.clone());
    elem.add_text_child("MasterKeyChanged", encode_time(meta.master_key_changed));
    elem.add_text_child("MasterKeyChangeRec", meta.master_key_change_rec.to_string());
    elem.add_text_child(
        "MasterKeyChangeForce",
        meta.master_key_change_force.to_string(),
    );

    let mut protection = XmlElement::new("MemoryProtection");
    let mp = &meta.memory_protection;
    protection.add_text_child("ProtectTitle", encode_bool(mp.protect_title));
    protection.add_text_child("ProtectUserName", encode_bool(mp.protect_user_name));
    protection.add_text_child("ProtectPassword", encode_bool(mp.protect_password));
    protection.add_text_child("ProtectURL", encode_bool(mp.protect_url));
    protection.add_text_child("ProtectNotes", encode_bool(mp.protect_notes));
    elem.add_child(protection);

    if !meta.custom_icons.is_empty() {
        let mut icons = XmlElement::new("CustomIcons");
        for icon in &meta.custom_icons {
            let mut item = XmlElement::new("Icon");
            item.add_text_child("UUID", encode_uuid(icon.uuid));
            item.add_text_child("Data", BASE64.encode(&icon.data));
            icons.add_child(item);
        }
        elem.add_child(icons);
    }

    elem.add_text_child("RecycleBinEnabled", encode_bool(meta.recycle_bin_enabled));
    elem.add_text_child("RecycleBinUUID", encode_uuid(meta.recycle_bin_uuid));
    elem.add_text_child("RecycleBinChanged", encode_time(meta.recycle_bin_changed));
    elem.add_text_child("EntryTemplatesGroup", encode_uuid(meta.entry_templates_group));
    elem.add_text_child(
        "EntryTemplatesGroupChanged",
        encode_time(meta.entry_templates_group_changed),
    );
    elem.add_text_child("LastSelectedGroup", encode_uuid(meta.last_selected_group));
    elem.add_text_child(
        "LastTopVisibleGroup",
        encode_uuid(meta.last_top_visible_group),
    );
    elem.add_text_child("HistoryMaxItems", meta.history_max_items.to_string());
    elem.add_text_child("HistoryMaxSize", meta.history_max_size.to_string());
    elem.add_text_child("SettingsChanged", encode_time(meta.settings_changed));
    if !meta.custom_data.is_empty() {
        elem.add_child(write_custom_data(&meta.custom_data));
    }
    elem
}

fn write_custom_data(data: &CustomData) -> XmlElement {
    let mut elem = XmlElement::new("CustomData");
    for (key, item) in data.iter() {
        let mut entry = XmlElement::new("Item");
        entry.add_text_child("Key", key);
        entry.add_text_child("Value", item.value.clone());
        if let Some(time) = item.last_modified {
            entry.add_text_child("LastModificationTime", encode_time(time));
        }
        elem.add_child(entry);
    }
    elem
}

fn write_group(group: &Group, pool: &mut BinaryPool, protection: &MemoryProtection) -> XmlElement {
    let mut elem = XmlElement::new("Group");
    elem.add_text_child("UUID", encode_uuid(group.uuid()));
    elem.add_text_child("Name", group.name.clone());
    elem.add_text_child("Notes", group.notes.clone());
    elem.add_text_child("IconID", group.icon_number.to_string());
    if !group.custom_icon.is_nil() {
        elem.add_text_child("CustomIconUUID", encode_uuid(group.custom_icon));
    }
    elem.add_child(write_times(group.times()));
    elem.add_text_child("IsExpanded", encode_bool(group.is_expanded));
    elem.add_text_child(
        "DefaultAutoTypeSequence",
        group.default_auto_type_sequence.clone(),
    );
    elem.add_text_child("EnableAutoType", encode_tri_state(group.auto_type_enabled));
    elem.add_text_child("EnableSearching", encode_tri_state(group.searching_enabled));
    if let Some(last) = group.last_top_visible_entry {
        elem.add_text_child("LastTopVisibleEntry", encode_uuid(last));
    }
    if !group.custom_data().is_empty() {
        elem.add_child(write_custom_data(group.custom_data()));
    }
    for entry in group.entries() {
        elem.add_child(write_entry(entry, pool, protection, true));
    }
    for child in group.children() {
        elem.add_child(write_group(child, pool, protection));
    }
    elem
}

fn write_entry(
    entry: &Entry,
    pool: &mut BinaryPool,
    protection: &MemoryProtection,
    with_history: bool,
) -> XmlElement {
    let mut elem = XmlElement::new("Entry");
    elem.add_text_child("UUID", encode_uuid(entry.uuid()));
    elem.add_text_child("IconID", entry.icon_number.to_string());
    if !entry.custom_icon.is_nil() {
        elem.add_text_child("CustomIconUUID", encode_uuid(entry.custom_icon));
    }
    elem.add_text_child("ForegroundColor", entry.foreground_color.clone());
    elem.add_text_child("BackgroundColor", entry.background_color.clone());
    elem.add_text_child("OverrideURL", entry.override_url.clone());
    elem.add_text_child("Tags", entry.tags.clone());
    elem.add_child(write_times(entry.times()));

    for attribute in entry.attributes().iter() {
        // canonical attributes follow the metadata protection flags; custom
        // ones carry their own
        let protected = if CANONICAL_ATTRIBUTES.contains(&attribute.key.as_str()) {
            protection.is_protected(&attribute.key)
        } else {
            attribute.protected
        };
        let mut string = XmlElement::new("String");
        string.add_text_child("Key", attribute.key.clone());
        let mut value = XmlElement::with_text("Value", attribute.value());
        if protected {
            value.set_attr("Protected", "True");
        }
        string.add_child(value);
        elem.add_child(string);
    }

    for (name, data) in entry.attachments().iter() {
        let index = pool.index_for(data);
        let mut binary = XmlElement::new("Binary");
        binary.add_text_child("Key", name);
        let mut value = XmlElement::new("Value");
        value.set_attr("Ref", index.to_string());
        binary.add_child(value);
        elem.add_child(binary);
    }

    let mut auto = XmlElement::new("AutoType");
    auto.add_text_child("Enabled", encode_bool(entry.auto_type.enabled));
    auto.add_text_child(
        "DataTransferObfuscation",
        entry.auto_type.data_transfer_obfuscation.to_string(),
    );
    auto.add_text_child("DefaultSequence", entry.auto_type.default_sequence.clone());
    for association in &entry.auto_type.associations {
        let mut assoc = XmlElement::new("Association");
        assoc.add_text_child("Window", association.window.clone());
        assoc.add_text_child("KeystrokeSequence", association.sequence.clone());
        auto.add_child(assoc);
    }
    elem.add_child(auto);

    if !entry.custom_data().is_empty() {
        elem.add_child(write_custom_data(entry.custom_data()));
    }

    if with_history && !entry.history().is_empty() {
        let mut history = XmlElement::new("History");
        for item in entry.history() {
            history.add_child(write_entry(item, pool, protection, false));
        }
        elem.add_child(history);
    }
    elem
}

fn write_times(times: &TimeInfo) -> XmlElement {
    let mut elem = XmlElement::new("Times");
    elem.add_text_child("CreationTime", encode_time(times.creation_time));
    elem.add_text_child(
        "LastModificationTime",
        encode_time(times.last_modification_time),
    );
    elem.add_text_child("LastAccessTime", encode_time(times.last_access_time));
    elem.add_text_child("ExpiryTime", encode_time(times.expiry_time));
    elem.add_text_child("Expires", encode_bool(times.expires));
    elem.add_text_child("UsageCount", times.usage_count.to_string());
    elem.add_text_child("LocationChanged", encode_time(times.location_changed));
    elem
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use strongroom_model::Group as ModelGroup;

    use crate::xml::read::read_document;

    fn sample_database() -> Database {
        let mut db = Database::new();
        db.set_emit_modified(false);
        db.metadata_mut().database_name = "Test Vault".into();
        let root = db.root().uuid();

        let group = db.add_group(root, ModelGroup::new("Web")).unwrap();
        let mut entry = Entry::new();
        entry.set_title("Forum");
        entry.set_username("alice");
        entry.set_password("s3cret");
        entry
            .attachments_mut()
            .set("note.txt", b"attached bytes".to_vec());
        let uuid = db.add_entry(group, entry).unwrap();
        db.update_entry(uuid, |e| e.set_password("s3cret-v2")).unwrap();

        // a second entry sharing the same attachment content
        let mut twin = Entry::new();
        twin.set_title("Twin");
        twin.attachments_mut()
            .set("copy.txt", b"attached bytes".to_vec());
        db.add_entry(root, twin).unwrap();
        db
    }

    #[test]
    fn document_roundtrips_through_reader() {
        let db = sample_database();
        let (doc, pool) = write_document(&db).unwrap();

        let pool_map: HashMap<usize, Vec<u8>> =
            pool.iter().cloned().enumerate().collect();
        let parsed = read_document(&doc, &pool_map).unwrap();

        assert_eq!(parsed.metadata.database_name, "Test Vault");
        assert_eq!(
            parsed.root.entry_count_recursive(),
            db.root().entry_count_recursive()
        );
        let entry = parsed.root.find_entry_by_path("/Web/Forum").unwrap();
        assert_eq!(entry.password(), "s3cret-v2");
        assert_eq!(entry.history().len(), 1);
        assert_eq!(entry.history()[0].password(), "s3cret");
        assert_eq!(entry.attachments().get("note.txt"), Some(&b"attached bytes"[..]));
    }

    #[test]
    fn identical_attachments_share_one_pool_slot() {
        let db = sample_database();
        let (_, pool) = write_document(&db).unwrap();
        assert_eq!(pool.len(), 1, "duplicate content must be pooled once");
    }

    #[test]
    fn history_entries_write_no_nested_history() {
        let db = sample_database();
        let (doc, _) = write_document(&db).unwrap();
        let root = doc.child("Root").unwrap();

        fn assert_no_nested(elem: &XmlElement, inside_history: bool) {
            for child in &elem.children {
                if child.name == "History" {
                    assert!(!inside_history, "nested History element");
                    assert_no_nested(child, true);
                } else {
                    assert_no_nested(child, inside_history);
                }
            }
        }
        assert_no_nested(root, false);
    }
}
