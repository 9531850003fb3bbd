//! XML document layer: a small element tree, the quick-xml bridge, and the
//! protected-value stream passes.
//!
//! Protected values are XOR'd against the inner random stream in document
//! order. Both passes below walk the tree in exactly the order elements
//! appear in the serialized document, and each codec pass constructs exactly
//! one stream instance, so encode and decode always consume the keystream
//! identically.

pub mod read;
pub mod write;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use quick_xml::{Reader, Writer};
use uuid::Uuid;

use strongroom_core::{Error, Result};
use strongroom_crypto::innerstream::InnerStream;
use strongroom_model::TriState;

/// Seconds between 0001-01-01 and the Unix epoch; the container stores
/// timestamps relative to year 1.
const EPOCH_OFFSET_SECONDS: i64 = 62_135_596_800;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct XmlElement {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub children: Vec<XmlElement>,
    pub text: String,
}

impl XmlElement {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_text(name: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            text: text.into(),
            ..Default::default()
        }
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn set_attr(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.attributes.push((name.into(), value.into()));
    }

    pub fn child(&self, name: &str) -> Option<&XmlElement> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(
        &'a self,
        name: &'a str,
    ) -> impl Iterator<Item = &'a XmlElement> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name).map(|c| c.text.as_str())
    }

    pub fn add_child(&mut self, child: XmlElement) -> &mut Self {
        self.children.push(child);
        self
    }

    pub fn add_text_child(&mut self, name: impl Into<String>, text: impl Into<String>) {
        self.children.push(XmlElement::with_text(name, text));
    }
}

// ── quick-xml bridge ───────────────────────────────────────────────────────

pub fn parse_document(bytes: &[u8]) -> Result<XmlElement> {
    // no text trimming: whitespace inside attribute values is significant
    let mut reader = Reader::from_reader(bytes);

    let mut buf = Vec::new();
    let mut stack: Vec<XmlElement> = Vec::new();
    let mut root: Option<XmlElement> = None;

    loop {
        match reader
            .read_event_into(&mut buf)
            .map_err(|e| Error::format(format!("XML parse: {e}")))?
        {
            Event::Start(e) => stack.push(element_from_start(&e)?),
            Event::Empty(e) => {
                let elem = element_from_start(&e)?;
                attach(&mut stack, &mut root, elem)?;
            }
            Event::Text(t) => {
                if let Some(top) = stack.last_mut() {
                    let text = t
                        .unescape()
                        .map_err(|e| Error::format(format!("XML text: {e}")))?;
                    top.text.push_str(&text);
                }
            }
            Event::CData(c) => {
                if let Some(top) = stack.last_mut() {
                    top.text.push_str(&String::from_utf8_lossy(&c));
                }
            }
            Event::End(_) => {
                let elem = stack
                    .pop()
                    .ok_or_else(|| Error::format("unbalanced XML end tag"))?;
                attach(&mut stack, &mut root, elem)?;
            }
            Event::Eof => break,
            Event::Decl(_) | Event::Comment(_) | Event::PI(_) | Event::DocType(_) => {}
        }
        buf.clear();
    }

    if !stack.is_empty() {
        return Err(Error::format("unclosed XML element"));
    }
    root.ok_or_else(|| Error::format("empty XML document"))
}

fn element_from_start(e: &BytesStart<'_>) -> Result<XmlElement> {
    let mut elem = XmlElement::new(String::from_utf8_lossy(e.name().as_ref()).into_owned());
    for attr in e.attributes() {
        let attr = attr.map_err(|e| Error::format(format!("XML attribute: {e}")))?;
        elem.set_attr(
            String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
            attr.unescape_value()
                .map_err(|e| Error::format(format!("XML attribute: {e}")))?
                .into_owned(),
        );
    }
    Ok(elem)
}

fn attach(
    stack: &mut [XmlElement],
    root: &mut Option<XmlElement>,
    elem: XmlElement,
) -> Result<()> {
    match stack.last_mut() {
        Some(parent) => {
            parent.children.push(elem);
            Ok(())
        }
        None if root.is_none() => {
            *root = Some(elem);
            Ok(())
        }
        None => Err(Error::format("multiple XML root elements")),
    }
}

pub fn serialize_document(root: &XmlElement) -> Result<Vec<u8>> {
    let mut writer = Writer::new(Vec::new());
    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(|e| Error::format(format!("XML write: {e}")))?;
    write_element(&mut writer, root)?;
    Ok(writer.into_inner())
}

fn write_element(writer: &mut Writer<Vec<u8>>, elem: &XmlElement) -> Result<()> {
    let mut start = BytesStart::new(elem.name.as_str());
    for (key, value) in &elem.attributes {
        start.push_attribute((key.as_str(), value.as_str()));
    }
    let map_err = |e: quick_xml::Error| Error::format(format!("XML write: {e}"));

    if elem.children.is_empty() && elem.text.is_empty() {
        writer.write_event(Event::Empty(start)).map_err(map_err)?;
        return Ok(());
    }
    writer.write_event(Event::Start(start)).map_err(map_err)?;
    if !elem.text.is_empty() {
        writer
            .write_event(Event::Text(BytesText::new(&elem.text)))
            .map_err(map_err)?;
    }
    for child in &elem.children {
        write_element(writer, child)?;
    }
    writer
        .write_event(Event::End(BytesEnd::new(elem.name.as_str())))
        .map_err(map_err)?;
    Ok(())
}

// ── protected value passes ─────────────────────────────────────────────────

fn is_protected_value(elem: &XmlElement) -> bool {
    elem.name == "Value"
        && elem
            .attr("Protected")
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
}

/// Decrypt every protected value in document order: base64 → keystream XOR →
/// UTF-8 plaintext. The `Protected` attribute is kept so the writer knows to
/// re-protect the value.
pub fn unprotect_values(elem: &mut XmlElement, stream: &mut InnerStream) -> Result<()> {
    if is_protected_value(elem) {
        if !elem.text.is_empty() {
            let mut data = BASE64
                .decode(elem.text.trim())
                .map_err(|_| Error::corruption("protected value is not base64"))?;
            stream.apply(&mut data);
            elem.text = String::from_utf8(data)
                .map_err(|_| Error::corruption("protected value is not valid UTF-8"))?;
        }
        return Ok(());
    }
    for child in &mut elem.children {
        unprotect_values(child, stream)?;
    }
    Ok(())
}

/// Encrypt every protected value in document order: keystream XOR → base64.
pub fn protect_values(elem: &mut XmlElement, stream: &mut InnerStream) -> Result<()> {
    if is_protected_value(elem) {
        if !elem.text.is_empty() {
            let mut data = std::mem::take(&mut elem.text).into_bytes();
            stream.apply(&mut data);
            elem.text = BASE64.encode(&data);
        }
        return Ok(());
    }
    for child in &mut elem.children {
        protect_values(child, stream)?;
    }
    Ok(())
}

// ── value codecs ───────────────────────────────────────────────────────────

pub fn encode_time(time: DateTime<Utc>) -> String {
    let since_year_one = time.timestamp() + EPOCH_OFFSET_SECONDS;
    BASE64.encode((since_year_one as u64).to_le_bytes())
}

/// Accepts the KDBX4 base64 form and the KDBX3 ISO-8601 form.
pub fn decode_time(text: &str) -> Result<DateTime<Utc>> {
    let trimmed = text.trim();
    if let Ok(bytes) = BASE64.decode(trimmed) {
        if bytes.len() == 8 {
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&bytes);
            let unix = u64::from_le_bytes(raw) as i64 - EPOCH_OFFSET_SECONDS;
            return Utc
                .timestamp_opt(unix, 0)
                .single()
                .ok_or_else(|| Error::format("timestamp out of range"));
        }
    }
    DateTime::parse_from_rfc3339(trimmed)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| Error::format(format!("unparseable timestamp '{trimmed}'")))
}

pub fn encode_uuid(uuid: Uuid) -> String {
    BASE64.encode(uuid.as_bytes())
}

/// Empty text decodes to the nil UUID (absent references are serialized as
/// empty elements).
pub fn decode_uuid(text: &str) -> Result<Uuid> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Ok(Uuid::nil());
    }
    let bytes = BASE64
        .decode(trimmed)
        .map_err(|_| Error::format("UUID is not base64"))?;
    Uuid::from_slice(&bytes).map_err(|_| Error::format("UUID is not 16 bytes"))
}

pub fn encode_bool(value: bool) -> &'static str {
    if value {
        "True"
    } else {
        "False"
    }
}

pub fn decode_bool(text: &str) -> bool {
    text.trim().eq_ignore_ascii_case("true")
}

pub fn encode_tri_state(value: TriState) -> &'static str {
    match value {
        TriState::Inherit => "null",
        TriState::Enable => "true",
        TriState::Disable => "false",
    }
}

pub fn decode_tri_state(text: &str) -> TriState {
    let trimmed = text.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        TriState::Enable
    } else if trimmed.eq_ignore_ascii_case("false") {
        TriState::Disable
    } else {
        TriState::Inherit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strongroom_crypto::innerstream::InnerStreamId;

    #[test]
    fn dom_roundtrip() {
        let mut root = XmlElement::new("KeePassFile");
        let mut meta = XmlElement::new("Meta");
        meta.add_text_child("Generator", "strongroom");
        meta.add_text_child("DatabaseName", "Family & Friends <vault>");
        root.add_child(meta);
        root.add_child(XmlElement::new("Root"));

        let bytes = serialize_document(&root).unwrap();
        let parsed = parse_document(&bytes).unwrap();
        assert_eq!(parsed, root);
    }

    #[test]
    fn escaping_survives_roundtrip() {
        let mut root = XmlElement::new("Doc");
        root.add_text_child("V", "a<b&c>\"d\"");
        let bytes = serialize_document(&root).unwrap();
        let parsed = parse_document(&bytes).unwrap();
        assert_eq!(parsed.child_text("V"), Some("a<b&c>\"d\""));
    }

    #[test]
    fn protect_unprotect_roundtrip_in_document_order() {
        let mut root = XmlElement::new("Doc");
        for (i, secret) in ["first", "second", "third"].iter().enumerate() {
            let mut string = XmlElement::new("String");
            string.add_text_child("Key", format!("k{i}"));
            let mut value = XmlElement::with_text("Value", *secret);
            value.set_attr("Protected", "True");
            string.add_child(value);
            root.add_child(string);
        }
        // one unprotected value mixed in must be left alone
        root.add_child(XmlElement::with_text("Value", "plain"));

        let key = [1u8; 64];
        let mut enc = InnerStream::new(InnerStreamId::ChaCha20, &key).unwrap();
        protect_values(&mut root, &mut enc).unwrap();
        assert_ne!(root.children[0].child_text("Value"), Some("first"));
        assert_eq!(root.children[3].text, "plain");

        let mut dec = InnerStream::new(InnerStreamId::ChaCha20, &key).unwrap();
        unprotect_values(&mut root, &mut dec).unwrap();
        assert_eq!(root.children[0].child_text("Value"), Some("first"));
        assert_eq!(root.children[1].child_text("Value"), Some("second"));
        assert_eq!(root.children[2].child_text("Value"), Some("third"));
    }

    #[test]
    fn time_roundtrip_and_legacy_form() {
        let now = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let encoded = encode_time(now);
        assert_eq!(decode_time(&encoded).unwrap(), now);
        assert_eq!(
            decode_time("2023-11-14T22:13:20Z").unwrap(),
            Utc.timestamp_opt(1_700_000_000, 0).unwrap()
        );
        assert!(decode_time("not a time").is_err());
    }

    #[test]
    fn uuid_roundtrip() {
        let uuid = Uuid::new_v4();
        assert_eq!(decode_uuid(&encode_uuid(uuid)).unwrap(), uuid);
        assert_eq!(decode_uuid("").unwrap(), Uuid::nil());
        assert!(decode_uuid("@@@").is_err());
    }

    #[test]
    fn tri_state_mapping() {
        for tri in [TriState::Inherit, TriState::Enable, TriState::Disable] {
            assert_eq!(decode_tri_state(encode_tri_state(tri)), tri);
        }
        assert_eq!(decode_tri_state("anything"), TriState::Inherit);
    }
}
