//! Identifier classification.
//!
//! The console hands the writer a mix of store-assigned UUIDs and
//! client-side placeholders (timestamp-derived temp ids, human product
//! codes). Every foreign-key column must end up a genuine identifier or
//! null - never a placeholder string - so a bad reference degrades to a
//! dropped link instead of a rejected save.

use serde_json::Value;

/// Canonical UUID shape: 8-4-4-4-12 hex groups, case-insensitive.
/// Accepts ids from both generators in play (store-assigned and
/// client-generated), so no version check here.
pub fn is_identifier(value: &str) -> bool {
    let groups: Vec<&str> = value.split('-').collect();
    if groups.len() != 5 {
        return false;
    }
    const LENGTHS: [usize; 5] = [8, 4, 4, 4, 12];
    groups
        .iter()
        .zip(LENGTHS.iter())
        .all(|(group, len)| group.len() == *len && group.bytes().all(|b| b.is_ascii_hexdigit()))
}

/// Stricter variant for ids that must have come from the store's
/// generator: random (version 4) UUIDs with an RFC variant nibble.
pub fn is_store_identifier(value: &str) -> bool {
    if !is_identifier(value) {
        return false;
    }
    // Safe to index: shape is validated above.
    let version = value.as_bytes()[14];
    let variant = value.as_bytes()[19].to_ascii_lowercase();
    version == b'4' && matches!(variant, b'8' | b'9' | b'a' | b'b')
}

/// Unwrap an id-or-object reference to a validated identifier.
///
/// Accepts a bare string or an object carrying an `id` field. Returns
/// `None` for placeholders, blanks and anything else - never errors, so
/// callers can silently null stale foreign keys.
pub fn resolve_reference(value: &Value) -> Option<String> {
    let id = match value {
        Value::String(s) => s.trim(),
        Value::Object(obj) => obj.get("id").and_then(Value::as_str).unwrap_or("").trim(),
        _ => return None,
    };
    if is_identifier(id) {
        Some(id.to_string())
    } else {
        None
    }
}

/// Convenience for payload builders: resolve the first field under any of
/// `keys` that yields a valid identifier.
pub(crate) fn resolve_field(v: &Value, keys: &[&str]) -> Option<String> {
    keys.iter()
        .filter_map(|key| v.get(*key))
        .find_map(resolve_reference)
}
