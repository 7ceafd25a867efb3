//! The asset layer: moving node graphs and entities between memory and the
//! filesystem.
//!
//! File types are chosen by extension: `.syl` native code, `.metadata`
//! native metadata, `.json` translated JSON, `.csyl` compressed native code,
//! anything else a raw string. An entity stored at `base.syl` keeps its
//! children in `base/`, one file per child named by its escaped id, and its
//! metadata (at least `rand_seed` and `version`) in `base.metadata`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::entity::Entity;
use crate::intern;
use crate::node::{NodeId, NodeKind};
use crate::node_manager::NodeManager;
use crate::parser;

pub const EXT_CODE: &str = "syl";
pub const EXT_METADATA: &str = "metadata";
pub const EXT_JSON: &str = "json";
pub const EXT_COMPRESSED: &str = "csyl";

/// Outcome of a load: success flag, diagnostic, and the version the asset
/// declared (empty when none).
#[derive(Debug, Clone)]
pub struct LoadStatus {
    pub loaded: bool,
    pub message: String,
    pub version: String,
}

impl LoadStatus {
    pub fn ok() -> LoadStatus {
        LoadStatus {
            loaded: true,
            message: String::new(),
            version: String::new(),
        }
    }

    pub fn failed(message: impl Into<String>) -> LoadStatus {
        LoadStatus {
            loaded: false,
            message: message.into(),
            version: String::new(),
        }
    }
}

/// Storage failure with a plain message.
#[derive(Debug)]
pub struct AssetError {
    pub message: String,
}

impl std::fmt::Display for AssetError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

impl From<std::io::Error> for AssetError {
    fn from(err: std::io::Error) -> Self {
        AssetError {
            message: err.to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Resource load/store
// ---------------------------------------------------------------------------

/// Loads one file into `manager` as a root node, dispatching on extension.
pub fn load_resource(path: &Path, manager: &Arc<NodeManager>) -> (Option<NodeId>, LoadStatus) {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match extension.as_str() {
        EXT_CODE | EXT_METADATA => {
            let text = match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) => return (None, LoadStatus::failed(err.to_string())),
            };
            // Strip a UTF-8 byte-order mark if one is present.
            let text = text.strip_prefix('\u{feff}').unwrap_or(&text);
            match parser::parse(text, manager, &path.display().to_string(), false) {
                Ok(node) => (Some(node), LoadStatus::ok()),
                Err(err) => (None, LoadStatus::failed(err.to_string())),
            }
        }
        EXT_JSON => {
            let text = match std::fs::read_to_string(path) {
                Ok(text) => text,
                Err(err) => return (None, LoadStatus::failed(err.to_string())),
            };
            match json_to_node(&text, manager) {
                Ok(node) => (Some(node), LoadStatus::ok()),
                Err(err) => (None, LoadStatus::failed(err)),
            }
        }
        EXT_COMPRESSED => {
            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(err) => return (None, LoadStatus::failed(err.to_string())),
            };
            let (text, version) = match decode_compressed(&bytes) {
                Ok(decoded) => decoded,
                Err(err) => return (None, LoadStatus::failed(err)),
            };
            if let Err(message) = validate_version(&version) {
                let mut status = LoadStatus::failed(message);
                status.version = version;
                return (None, status);
            }
            match parser::parse(&text, manager, &path.display().to_string(), false) {
                Ok(node) => {
                    let mut status = LoadStatus::ok();
                    status.version = version;
                    (Some(node), status)
                }
                Err(err) => (None, LoadStatus::failed(err.to_string())),
            }
        }
        _ => match std::fs::read_to_string(path) {
            Ok(text) => (Some(manager.alloc_string(&text)), LoadStatus::ok()),
            Err(err) => (None, LoadStatus::failed(err.to_string())),
        },
    }
}

/// Stores a node graph to one file, dispatching on extension.
pub fn store_resource(
    manager: &Arc<NodeManager>,
    node: NodeId,
    path: &Path,
    sort_keys: bool,
) -> Result<(), AssetError> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_ascii_lowercase();
    match extension.as_str() {
        EXT_CODE | EXT_METADATA => {
            let text = parser::unparse(manager, node, true, true, sort_keys);
            std::fs::write(path, text)?;
            Ok(())
        }
        EXT_JSON => {
            let text = node_to_json(manager, node).map_err(|message| AssetError { message })?;
            std::fs::write(path, text)?;
            Ok(())
        }
        EXT_COMPRESSED => {
            let text = parser::unparse(manager, node, false, true, sort_keys);
            std::fs::write(path, encode_compressed(&text))?;
            Ok(())
        }
        _ => {
            let text = parser::unparse(manager, node, false, false, sort_keys);
            std::fs::write(path, text)?;
            Ok(())
        }
    }
}

// ---------------------------------------------------------------------------
// Entity persistence
// ---------------------------------------------------------------------------

/// Loads an entity (and, recursively, its children) from `path`.
///
/// Metadata supplies the random seed and the version gate; a version
/// mismatch fails the whole load with no partial entity left behind.
pub fn load_entity(
    path: &Path,
    default_seed: &str,
    persistent: bool,
) -> Result<Arc<Entity>, LoadStatus> {
    let id = path
        .file_stem()
        .and_then(|s| s.to_str())
        .map(unescape_filename)
        .unwrap_or_default();
    let entity = Entity::with_seed(&id, default_seed);

    let (code, status) = load_resource(path, entity.manager());
    if !status.loaded {
        return Err(status);
    }
    entity.set_root(code);

    // Metadata: rand_seed and version.
    let base = path.with_extension("");
    let metadata_path = base.with_extension(EXT_METADATA);
    if metadata_path.exists() {
        let (metadata, metadata_status) = load_resource(&metadata_path, entity.manager());
        if metadata_status.loaded {
            if let Some(metadata) = metadata {
                let manager = entity.manager();
                if manager.kind_of(metadata) == NodeKind::Assoc {
                    if let Some(seed_id) = lookup_text(manager, metadata, "rand_seed") {
                        entity.set_rand_seed(&seed_id);
                    }
                    if let Some(version) = lookup_text(manager, metadata, "version") {
                        if let Err(message) = validate_version(&version) {
                            let mut status = LoadStatus::failed(message);
                            status.version = version;
                            return Err(status);
                        }
                    }
                }
                manager.free_node_tree(metadata);
            }
        }
    }

    // Contained entities live in the sibling directory.
    if base.is_dir() {
        let mut names: Vec<PathBuf> = std::fs::read_dir(&base)
            .map_err(|err| LoadStatus::failed(err.to_string()))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().and_then(|e| e.to_str()) == Some(EXT_CODE))
            .collect();
        names.sort();
        for child_path in names {
            let escaped = child_path
                .file_stem()
                .and_then(|s| s.to_str())
                .unwrap_or_default();
            let child_name = unescape_filename(escaped);
            let child_seed = entity.fork_child_seed(&child_name);
            let child = load_entity(&child_path, &child_seed, false)?;
            entity.add_child(&child_name, child);
        }
    }

    if persistent {
        entity.set_persist_path(Some(path.to_path_buf()));
    }
    Ok(entity)
}

/// Stores an entity at `path`, its metadata alongside, and its children in
/// the sibling directory.
pub fn store_entity(entity: &Arc<Entity>, path: &Path) -> Result<(), AssetError> {
    let manager = entity.manager();
    match entity.root() {
        Some(root) => store_resource(manager, root, path, true)?,
        None => {
            let null_root = manager.alloc(NodeKind::Null);
            store_resource(manager, null_root, path, true)?;
            manager.free_node(null_root);
        }
    }

    let base = path.with_extension("");
    let metadata_path = base.with_extension(EXT_METADATA);
    let metadata = build_metadata(manager, entity);
    store_resource(manager, metadata, &metadata_path, true)?;
    manager.free_node_tree(metadata);

    let children = entity.child_names();
    if !children.is_empty() {
        std::fs::create_dir_all(&base)?;
        for name in children {
            if let Some(child) = entity.child(&name) {
                let child_path = base.join(format!("{}.{}", escape_filename(&name), EXT_CODE));
                store_entity(&child, &child_path)?;
            }
        }
    }
    Ok(())
}

/// Removes an entity's files: code, metadata, and the child directory.
pub fn destroy_stored_entity(path: &Path) -> Result<(), AssetError> {
    let base = path.with_extension("");
    if path.exists() {
        std::fs::remove_file(path)?;
    }
    let metadata_path = base.with_extension(EXT_METADATA);
    if metadata_path.exists() {
        std::fs::remove_file(metadata_path)?;
    }
    if base.is_dir() {
        std::fs::remove_dir_all(base)?;
    }
    Ok(())
}

fn build_metadata(manager: &Arc<NodeManager>, entity: &Arc<Entity>) -> NodeId {
    let metadata = manager.alloc(NodeKind::Assoc);
    let seed = manager.alloc_string(&entity.rand_seed());
    manager.set_mapped_child(metadata, intern::intern("rand_seed"), seed);
    let (major, minor, patch) = crate::engine_version();
    let version = manager.alloc_string(&format!("{}.{}.{}", major, minor, patch));
    manager.set_mapped_child(metadata, intern::intern("version"), version);
    metadata
}

fn lookup_text(manager: &Arc<NodeManager>, assoc: NodeId, key: &str) -> Option<String> {
    let sid = intern::pool().id_if_exists(key)?;
    let node = manager.mapped_get(assoc, sid)?;
    match manager.kind_of(node) {
        NodeKind::String | NodeKind::Symbol => Some(intern::text(manager.symbol_of(node))),
        NodeKind::Number => Some(parser::format_number(manager.number_of(node))),
        _ => None,
    }
}

// ---------------------------------------------------------------------------
// Version gate
// ---------------------------------------------------------------------------

/// Checks a loaded asset's version against the engine.
///
/// Loading fails when the major version differs or the asset is strictly
/// newer. Development builds skip the check entirely: a build with a version
/// suffix, or with any version field equal to zero, accepts everything.
pub fn validate_version(version: &str) -> Result<(), String> {
    if version.is_empty() {
        return Ok(());
    }
    let (engine_major, engine_minor, engine_patch) = crate::engine_version();
    if !crate::engine_version_suffix().is_empty()
        || engine_major == 0
        || engine_minor == 0
        || engine_patch == 0
    {
        return Ok(());
    }

    let semver = version.split('-').next().unwrap_or(version);
    let mut parts = semver.split('.');
    let mut next = || {
        parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| format!("invalid version number {:?}", version))
    };
    let (major, minor, patch) = (next()?, next()?, next()?);

    if major > engine_major
        || (major == engine_major && minor > engine_minor)
        || (major == engine_major && minor == engine_minor && patch > engine_patch)
    {
        return Err(format!(
            "asset version {} is more recent than engine {}.{}.{}",
            version, engine_major, engine_minor, engine_patch
        ));
    }
    if major < engine_major {
        return Err(format!(
            "asset version {} is older than the engine's major version {}",
            version, engine_major
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Filename escaping
// ---------------------------------------------------------------------------

/// Reversible escape safe for all target filesystems: alphanumerics, `.`,
/// and `-` pass through, everything else becomes `_XX` hex (so `_` itself
/// is escaped).
pub fn escape_filename(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    for byte in name.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' => out.push(byte as char),
            _ => out.push_str(&format!("_{:02X}", byte)),
        }
    }
    out
}

pub fn unescape_filename(escaped: &str) -> String {
    let bytes = escaped.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'_'
            && i + 2 < bytes.len()
            && bytes[i + 1].is_ascii_hexdigit()
            && bytes[i + 2].is_ascii_hexdigit()
        {
            if let Ok(byte) = u8::from_str_radix(&escaped[i + 1..i + 3], 16) {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

// ---------------------------------------------------------------------------
// Compressed native code
// ---------------------------------------------------------------------------

const COMPRESSED_MAGIC: &[u8; 4] = b"SYLC";
const COMPRESSED_FORMAT_VERSION: u8 = 1;

/// Self-describing compressed code: magic, format version, engine version
/// triple, a dictionary of unique lines, and a payload of varint-encoded
/// dictionary indices (one per source line).
pub fn encode_compressed(text: &str) -> Vec<u8> {
    let lines: Vec<&str> = text.lines().collect();
    let mut dictionary: Vec<&str> = Vec::new();
    let mut index_of: HashMap<&str, u64> = HashMap::new();
    let mut payload: Vec<u64> = Vec::with_capacity(lines.len());
    for line in &lines {
        let index = *index_of.entry(line).or_insert_with(|| {
            dictionary.push(line);
            (dictionary.len() - 1) as u64
        });
        payload.push(index);
    }

    let mut out = Vec::new();
    out.extend_from_slice(COMPRESSED_MAGIC);
    out.push(COMPRESSED_FORMAT_VERSION);
    let (major, minor, patch) = crate::engine_version();
    write_uleb128(&mut out, major as u64);
    write_uleb128(&mut out, minor as u64);
    write_uleb128(&mut out, patch as u64);
    write_uleb128(&mut out, dictionary.len() as u64);
    for entry in &dictionary {
        write_uleb128(&mut out, entry.len() as u64);
        out.extend_from_slice(entry.as_bytes());
    }
    write_uleb128(&mut out, payload.len() as u64);
    for index in payload {
        write_uleb128(&mut out, index);
    }
    out
}

/// Decodes the compressed format back to `(text, version)`.
pub fn decode_compressed(bytes: &[u8]) -> Result<(String, String), String> {
    if bytes.len() < 5 || &bytes[..4] != COMPRESSED_MAGIC {
        return Err("not a compressed code file".to_string());
    }
    if bytes[4] != COMPRESSED_FORMAT_VERSION {
        return Err(format!("unsupported compressed format {}", bytes[4]));
    }
    let mut offset = 5;
    let major = read_uleb128(bytes, &mut offset)?;
    let minor = read_uleb128(bytes, &mut offset)?;
    let patch = read_uleb128(bytes, &mut offset)?;
    let version = format!("{}.{}.{}", major, minor, patch);

    let dict_len = read_uleb128(bytes, &mut offset)? as usize;
    let mut dictionary: Vec<String> = Vec::with_capacity(dict_len);
    for _ in 0..dict_len {
        let len = read_uleb128(bytes, &mut offset)? as usize;
        let end = offset
            .checked_add(len)
            .filter(|&e| e <= bytes.len())
            .ok_or_else(|| "truncated dictionary".to_string())?;
        let entry = std::str::from_utf8(&bytes[offset..end])
            .map_err(|_| "dictionary entry is not UTF-8".to_string())?;
        dictionary.push(entry.to_string());
        offset = end;
    }

    let payload_len = read_uleb128(bytes, &mut offset)? as usize;
    let mut lines: Vec<&str> = Vec::with_capacity(payload_len);
    for _ in 0..payload_len {
        let index = read_uleb128(bytes, &mut offset)? as usize;
        let entry = dictionary
            .get(index)
            .ok_or_else(|| format!("dictionary index {} out of range", index))?;
        lines.push(entry);
    }
    Ok((lines.join("\n"), version))
}

fn write_uleb128(out: &mut Vec<u8>, mut value: u64) {
    loop {
        let mut byte = (value & 0x7f) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if value == 0 {
            break;
        }
    }
}

fn read_uleb128(bytes: &[u8], offset: &mut usize) -> Result<u64, String> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;
    for i in 0..10 {
        let byte = *bytes
            .get(*offset)
            .ok_or_else(|| "unexpected end of input".to_string())?;
        *offset += 1;
        let payload = byte & 0x7f;
        if i == 9 && payload > 1 {
            return Err("varint overflows u64".to_string());
        }
        value |= u64::from(payload) << shift;
        if byte & 0x80 == 0 {
            return Ok(value);
        }
        shift += 7;
    }
    Err("varint too long".to_string())
}

// ---------------------------------------------------------------------------
// JSON translation
// ---------------------------------------------------------------------------

/// Decodes JSON text into nodes: objects become assocs, arrays lists,
/// scalars their leaf kinds.
pub fn json_to_node(text: &str, manager: &Arc<NodeManager>) -> Result<NodeId, String> {
    let value: serde_json::Value = serde_json::from_str(text).map_err(|e| e.to_string())?;
    Ok(json_value_to_node(&value, manager))
}

fn json_value_to_node(value: &serde_json::Value, manager: &Arc<NodeManager>) -> NodeId {
    match value {
        serde_json::Value::Null => manager.alloc(NodeKind::Null),
        serde_json::Value::Bool(b) => manager.alloc_boolean(*b),
        serde_json::Value::Number(number) => {
            manager.alloc_number(number.as_f64().unwrap_or(f64::NAN))
        }
        serde_json::Value::String(s) => manager.alloc_string(s),
        serde_json::Value::Array(items) => {
            let list = manager.alloc(NodeKind::List);
            for item in items {
                let child = json_value_to_node(item, manager);
                manager.push_child(list, child);
            }
            list
        }
        serde_json::Value::Object(fields) => {
            let assoc = manager.alloc(NodeKind::Assoc);
            for (key, item) in fields {
                let child = json_value_to_node(item, manager);
                manager.set_mapped_child(assoc, intern::intern(key), child);
            }
            assoc
        }
    }
}

/// Encodes a node graph as JSON. Code kinds have no JSON form and error.
pub fn node_to_json(manager: &Arc<NodeManager>, node: NodeId) -> Result<String, String> {
    let value = node_to_json_value(manager, node)?;
    serde_json::to_string_pretty(&value).map_err(|e| e.to_string())
}

fn node_to_json_value(
    manager: &Arc<NodeManager>,
    node: NodeId,
) -> Result<serde_json::Value, String> {
    match manager.kind_of(node) {
        NodeKind::Null => Ok(serde_json::Value::Null),
        NodeKind::True => Ok(serde_json::Value::Bool(true)),
        NodeKind::False => Ok(serde_json::Value::Bool(false)),
        NodeKind::Number => {
            let v = manager.number_of(node);
            serde_json::Number::from_f64(v)
                .map(serde_json::Value::Number)
                .ok_or_else(|| format!("number {} has no JSON form", v))
        }
        NodeKind::String | NodeKind::Symbol => Ok(serde_json::Value::String(intern::text(
            manager.symbol_of(node),
        ))),
        NodeKind::List => {
            let mut items = Vec::new();
            for child in manager.children_of(node) {
                items.push(node_to_json_value(manager, child)?);
            }
            Ok(serde_json::Value::Array(items))
        }
        NodeKind::Assoc => {
            let mut fields = serde_json::Map::new();
            for (key, child) in manager.mapped_entries_sorted(node) {
                fields.insert(intern::text(key), node_to_json_value(manager, child)?);
            }
            Ok(serde_json::Value::Object(fields))
        }
        other => Err(format!("kind {:?} has no JSON form", other)),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filename_escape_roundtrip() {
        for name in ["plain", "with space", "дом", "a/b\\c", "under_score", "dot."] {
            let escaped = escape_filename(name);
            assert!(
                escaped
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-' || c == '_'),
                "unsafe char survived in {:?}",
                escaped
            );
            assert_eq!(unescape_filename(&escaped), name, "roundtrip of {:?}", name);
        }
    }

    #[test]
    fn compressed_roundtrip() {
        let source = "(seq\n  (print \"a\")\n  (print \"a\")\n  (print \"b\"))";
        let encoded = encode_compressed(source);
        let (decoded, version) = decode_compressed(&encoded).unwrap();
        assert_eq!(decoded, source);
        let (major, minor, patch) = crate::engine_version();
        assert_eq!(version, format!("{}.{}.{}", major, minor, patch));
    }

    #[test]
    fn compressed_rejects_garbage() {
        assert!(decode_compressed(b"nope").is_err());
        assert!(decode_compressed(b"SYLC\x02").is_err());
    }

    #[test]
    fn version_gate() {
        // Engine version has no zero field and no suffix, so the gate is
        // active.
        let (major, minor, patch) = crate::engine_version();
        assert!(validate_version(&format!("{}.{}.{}", major, minor, patch)).is_ok());
        assert!(validate_version(&format!("{}.{}.{}", major, minor, patch + 1)).is_err());
        assert!(validate_version(&format!("{}.0.0", major + 1)).is_err());
        assert!(validate_version(&format!("{}.9.9", major - 1)).is_err());
        assert!(validate_version("").is_ok());
        assert!(validate_version("not-a-version").is_err());
    }

    #[test]
    fn json_translation_roundtrip() {
        let manager = Arc::new(NodeManager::new());
        let node = json_to_node(r#"{"xs": [1, 2.5, "s", true, null]}"#, &manager).unwrap();
        assert_eq!(manager.kind_of(node), NodeKind::Assoc);
        let text = node_to_json(&manager, node).unwrap();
        let back = json_to_node(&text, &manager).unwrap();
        assert!(crate::tree::deep_equal(&manager, node, &manager, back));
    }
}
