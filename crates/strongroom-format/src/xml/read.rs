//! XML document tree → domain model.
//!
//! Unknown elements are skipped so minor-version additions from other
//! implementations survive a read-modify-write cycle of everything we do
//! understand.

use std::collections::HashMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use tracing::warn;

use strongroom_core::{Error, Result};
use strongroom_model::{
    AutoTypeAssociation, CustomData, CustomDataItem, CustomIcon, DeletedObject, Entry, Group,
    Metadata, TimeInfo,
};

use crate::compress::gunzip;
use crate::xml::{decode_bool, decode_time, decode_tri_state, decode_uuid, XmlElement};

pub struct ParsedDocument {
    pub metadata: Metadata,
    pub root: Group,
    pub deleted_objects: Vec<DeletedObject>,
    /// `Meta/HeaderHash`, present in KDBX3 files.
    pub header_hash: Option<Vec<u8>>,
}

/// Map a decrypted, decompressed document. `pool` holds attachment bodies by
/// reference index (from the KDBX4 inner header); KDBX3 files carry their
/// pool in `Meta/Binaries` instead, which is parsed here.
pub fn read_document(
    doc: &XmlElement,
    pool: &HashMap<usize, Vec<u8>>,
) -> Result<ParsedDocument> {
    if doc.name != "KeePassFile" {
        return Err(Error::format(format!(
            "unexpected document root <{}>",
            doc.name
        )));
    }

    let meta_elem = doc
        .child("Meta")
        .ok_or_else(|| Error::format("document missing <Meta>"))?;
    let (metadata, legacy_pool, header_hash) = read_meta(meta_elem)?;

    let mut binaries = legacy_pool;
    for (index, data) in pool {
        binaries.insert(*index, data.clone());
    }

    let root_elem = doc
        .child("Root")
        .ok_or_else(|| Error::format("document missing <Root>"))?;
    let group_elem = root_elem
        .child("Group")
        .ok_or_else(|| Error::format("document missing the root group"))?;
    let root = read_group(group_elem, &binaries)?;

    let mut deleted_objects = Vec::new();
    if let Some(deleted) = root_elem.child("DeletedObjects") {
        for elem in deleted.children_named("DeletedObject") {
            let uuid = decode_uuid(elem.child_text("UUID").unwrap_or_default())?;
            let deletion_time = decode_time(elem.child_text("DeletionTime").unwrap_or_default())?;
            deleted_objects.push(DeletedObject {
                uuid,
                deletion_time,
            });
        }
    }

    Ok(ParsedDocument {
        metadata,
        root,
        deleted_objects,
        header_hash,
    })
}

type MetaParts = (Metadata, HashMap<usize, Vec<u8>>, Option<Vec<u8>>);

fn read_meta(elem: &XmlElement) -> Result<MetaParts> {
    let mut meta = Metadata::default();
    let mut pool = HashMap::new();
    let mut header_hash = None;

    for child in &elem.children {
        let text = child.text.as_str();
        match child.name.as_str() {
            "Generator" => meta.generator = text.to_string(),
            "HeaderHash" => {
                header_hash = Some(
                    BASE64
                        .decode(text.trim())
                        .map_err(|_| Error::format("header hash is not base64"))?,
                );
            }
            "DatabaseName" => meta.database_name = text.to_string(),
            "DatabaseNameChanged" => meta.database_name_changed = decode_time(text)?,
            "DatabaseDescription" => meta.description = text.to_string(),
            "DatabaseDescriptionChanged" => meta.description_changed = decode_time(text)?,
            "DefaultUserName" => meta.default_user_name = text.to_string(),
            "DefaultUserNameChanged" => meta.default_user_name_changed = decode_time(text)?,
            "MaintenanceHistoryDays" => {
                meta.maintenance_history_days = text.trim().parse().unwrap_or(365)
            }
            "Color" => meta.color = text.to_string(),
            "MasterKeyChanged" => meta.master_key_changed = decode_time(text)?,
            "MasterKeyChangeRec" => meta.master_key_change_rec = text.trim().parse().unwrap_or(-1),
            "MasterKeyChangeForce" => {
                meta.master_key_change_force = text.trim().parse().unwrap_or(-1)
            }
            "MemoryProtection" => {
                let mp = &mut meta.memory_protection;
                if let Some(v) = child.child_text("ProtectTitle") {
                    mp.protect_title = decode_bool(v);
                }
                if let Some(v) = child.child_text("ProtectUserName") {
                    mp.protect_user_name = decode_bool(v);
                }
                if let Some(v) = child.child_text("ProtectPassword") {
                    mp.protect_password = decode_bool(v);
                }
                if let Some(v) = child.child_text("ProtectURL") {
                    mp.protect_url = decode_bool(v);
                }
                if let Some(v) = child.child_text("ProtectNotes") {
                    mp.protect_notes = decode_bool(v);
                }
            }
            "CustomIcons" => {
                for icon in child.children_named("Icon") {
                    let uuid = decode_uuid(icon.child_text("UUID").unwrap_or_default())?;
                    let data = BASE64
                        .decode(icon.child_text("Data").unwrap_or_default().trim())
                        .map_err(|_| Error::format("custom icon is not base64"))?;
                    meta.custom_icons.push(CustomIcon { uuid, data });
                }
            }
            "Binaries" => {
                // KDBX3 keeps the attachment pool here
                for binary in child.children_named("Binary") {
                    let id: usize = binary
                        .attr("ID")
                        .and_then(|v| v.trim().parse().ok())
                        .ok_or_else(|| Error::format("legacy binary missing ID"))?;
                    let raw = BASE64
                        .decode(binary.text.trim())
                        .map_err(|_| Error::format("legacy binary is not base64"))?;
                    let data = if binary
                        .attr("Compressed")
                        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
                    {
                        gunzip(&raw)?
                    } else {
                        raw
                    };
                    pool.insert(id, data);
                }
            }
            "RecycleBinEnabled" => meta.recycle_bin_enabled = decode_bool(text),
            "RecycleBinUUID" => meta.recycle_bin_uuid = decode_uuid(text)?,
            "RecycleBinChanged" => meta.recycle_bin_changed = decode_time(text)?,
            "EntryTemplatesGroup" => meta.entry_templates_group = decode_uuid(text)?,
            "EntryTemplatesGroupChanged" => {
                meta.entry_templates_group_changed = decode_time(text)?
            }
            "LastSelectedGroup" => meta.last_selected_group = decode_uuid(text)?,
            "LastTopVisibleGroup" => meta.last_top_visible_group = decode_uuid(text)?,
            "HistoryMaxItems" => meta.history_max_items = text.trim().parse().unwrap_or(-1),
            "HistoryMaxSize" => meta.history_max_size = text.trim().parse().unwrap_or(-1),
            "SettingsChanged" => meta.settings_changed = decode_time(text)?,
            "CustomData" => meta.custom_data = read_custom_data(child)?,
            other => warn!(element = other, "skipping unknown metadata element"),
        }
    }
    Ok((meta, pool, header_hash))
}

fn read_custom_data(elem: &XmlElement) -> Result<CustomData> {
    let mut data = CustomData::new();
    for item in elem.children_named("Item") {
        let key = item
            .child_text("Key")
            .ok_or_else(|| Error::format("custom data item missing key"))?;
        let value = item.child_text("Value").unwrap_or_default();
        let last_modified = match item.child_text("LastModificationTime") {
            Some(text) => Some(decode_time(text)?),
            None => None,
        };
        data.set_item(
            key,
            CustomDataItem {
                value: value.to_string(),
                last_modified,
            },
        );
    }
    Ok(data)
}

pub fn read_group(elem: &XmlElement, pool: &HashMap<usize, Vec<u8>>) -> Result<Group> {
    let uuid = decode_uuid(elem.child_text("UUID").unwrap_or_default())?;
    let mut group = Group::with_uuid(uuid, elem.child_text("Name").unwrap_or_default());
    group.notes = elem.child_text("Notes").unwrap_or_default().to_string();
    if let Some(text) = elem.child_text("IconID") {
        group.icon_number = text.trim().parse().unwrap_or(0);
    }
    if let Some(text) = elem.child_text("CustomIconUUID") {
        group.custom_icon = decode_uuid(text)?;
    }
    if let Some(times) = elem.child("Times") {
        *group.times_mut() = read_times(times)?;
    }
    if let Some(text) = elem.child_text("IsExpanded") {
        group.is_expanded = decode_bool(text);
    }
    group.default_auto_type_sequence = elem
        .child_text("DefaultAutoTypeSequence")
        .unwrap_or_default()
        .to_string();
    if let Some(text) = elem.child_text("EnableAutoType") {
        group.auto_type_enabled = decode_tri_state(text);
    }
    if let Some(text) = elem.child_text("EnableSearching") {
        group.searching_enabled = decode_tri_state(text);
    }
    if let Some(text) = elem.child_text("LastTopVisibleEntry") {
        let last = decode_uuid(text)?;
        group.last_top_visible_entry = (!last.is_nil()).then_some(last);
    }
    if let Some(custom) = elem.child("CustomData") {
        *group.custom_data_mut() = read_custom_data(custom)?;
    }

    for child in &elem.children {
        match child.name.as_str() {
            "Entry" => group.add_entry(read_entry(child, pool)?),
            "Group" => group.add_child(read_group(child, pool)?),
            _ => {}
        }
    }
    Ok(group)
}

pub fn read_entry(elem: &XmlElement, pool: &HashMap<usize, Vec<u8>>) -> Result<Entry> {
    let uuid = decode_uuid(elem.child_text("UUID").unwrap_or_default())?;
    let mut entry = Entry::with_uuid(uuid);
    // the file dictates the attribute set; drop the constructor defaults
    *entry.attributes_mut() = Default::default();

    for child in &elem.children {
        let text = child.text.as_str();
        match child.name.as_str() {
            "UUID" => {}
            "IconID" => entry.icon_number = text.trim().parse().unwrap_or(0),
            "CustomIconUUID" => entry.custom_icon = decode_uuid(text)?,
            "ForegroundColor" => entry.foreground_color = text.to_string(),
            "BackgroundColor" => entry.background_color = text.to_string(),
            "OverrideURL" => entry.override_url = text.to_string(),
            "Tags" => entry.tags = text.to_string(),
            "Times" => *entry.times_mut() = read_times(child)?,
            "String" => {
                let key = child
                    .child_text("Key")
                    .ok_or_else(|| Error::format("entry attribute missing key"))?;
                let value_elem = child
                    .child("Value")
                    .cloned()
                    .unwrap_or_else(|| XmlElement::new("Value"));
                let protected = value_elem
                    .attr("Protected")
                    .is_some_and(|v| v.eq_ignore_ascii_case("true"));
                entry
                    .attributes_mut()
                    .set(key, value_elem.text.as_str(), protected);
            }
            "Binary" => {
                let key = child
                    .child_text("Key")
                    .ok_or_else(|| Error::format("attachment missing name"))?;
                let Some(value) = child.child("Value") else {
                    continue;
                };
                let data = if let Some(reference) = value.attr("Ref") {
                    let index: usize = reference
                        .trim()
                        .parse()
                        .map_err(|_| Error::format("attachment reference is not a number"))?;
                    pool.get(&index)
                        .cloned()
                        .ok_or_else(|| {
                            Error::format(format!("attachment references missing binary {index}"))
                        })?
                } else {
                    let raw = BASE64
                        .decode(value.text.trim())
                        .map_err(|_| Error::format("attachment is not base64"))?;
                    if value
                        .attr("Compressed")
                        .is_some_and(|v| v.eq_ignore_ascii_case("true"))
                    {
                        gunzip(&raw)?
                    } else {
                        raw
                    }
                };
                entry.attachments_mut().set(key, data);
            }
            "AutoType" => {
                let auto = &mut entry.auto_type;
                if let Some(v) = child.child_text("Enabled") {
                    auto.enabled = decode_bool(v);
                }
                if let Some(v) = child.child_text("DataTransferObfuscation") {
                    auto.data_transfer_obfuscation = v.trim().parse().unwrap_or(0);
                }
                if let Some(v) = child.child_text("DefaultSequence") {
                    auto.default_sequence = v.to_string();
                }
                for assoc in child.children_named("Association") {
                    auto.associations.push(AutoTypeAssociation {
                        window: assoc.child_text("Window").unwrap_or_default().to_string(),
                        sequence: assoc
                            .child_text("KeystrokeSequence")
                            .unwrap_or_default()
                            .to_string(),
                    });
                }
            }
            "CustomData" => *entry.custom_data_mut() = read_custom_data(child)?,
            "History" => {
                for item in child.children_named("Entry") {
                    entry.add_history_snapshot(read_entry(item, pool)?);
                }
            }
            _ => {}
        }
    }
    Ok(entry)
}

fn read_times(elem: &XmlElement) -> Result<TimeInfo> {
    let mut times = TimeInfo::now();
    for child in &elem.children {
        let text = child.text.as_str();
        match child.name.as_str() {
            "CreationTime" => times.creation_time = decode_time(text)?,
            "LastModificationTime" => times.last_modification_time = decode_time(text)?,
            "LastAccessTime" => times.last_access_time = decode_time(text)?,
            "ExpiryTime" => times.expiry_time = decode_time(text)?,
            "Expires" => times.expires = decode_bool(text),
            "UsageCount" => times.usage_count = text.trim().parse().unwrap_or(0),
            "LocationChanged" => times.location_changed = decode_time(text)?,
            _ => {}
        }
    }
    Ok(times)
}
