//! Signature upload handling.
//!
//! Payment entries arrive from the console with inline base64 signature
//! payloads (canvas data URLs). Before the payment rows are written, each
//! payload is uploaded to object storage and replaced by its public URL.
//! Payloads that are already URLs pass through untouched so a re-save
//! never loses a previously uploaded signature. Upload failures degrade
//! to a missing URL rather than aborting the save.

use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use chrono::Utc;
use tracing::warn;

use crate::store::ObjectStore;

const SIGNATURE_BUCKET: &str = "signatures";

/// Decode an inline signature payload: a `data:image/...;base64,` URL or
/// a bare base64 string. `None` when the payload is not decodable.
pub(crate) fn decode_signature_payload(payload: &str) -> Option<Vec<u8>> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return None;
    }
    let encoded = match trimmed.split_once(";base64,") {
        Some((prefix, rest)) if prefix.starts_with("data:") => rest,
        Some(_) => return None,
        None => trimmed,
    };
    BASE64_STANDARD.decode(encoded).ok()
}

/// Upload one signature payload, returning its public URL.
///
/// `order_ref` scopes the object path; `index` and `role`
/// (`"receiver"`/`"payer"`) keep entries on the same order distinct.
pub async fn upload_signature<B: ObjectStore>(
    objects: &B,
    payload: &str,
    order_ref: &str,
    index: usize,
    role: &str,
) -> Option<String> {
    let trimmed = payload.trim();
    if trimmed.is_empty() {
        return None;
    }
    // Already uploaded on a previous save.
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        return Some(trimmed.to_string());
    }

    let bytes = match decode_signature_payload(trimmed) {
        Some(bytes) => bytes,
        None => {
            warn!(order_ref, index, role, "signature payload is not decodable, dropping");
            return None;
        }
    };

    let timestamp = Utc::now().timestamp_millis();
    let path = format!("{order_ref}/{role}-signature-{index}-{timestamp}.png");

    match objects
        .upload(SIGNATURE_BUCKET, &path, bytes, "image/png")
        .await
    {
        Ok(url) => Some(url),
        Err(err) => {
            warn!(order_ref, index, role, error = %err, "signature upload failed");
            None
        }
    }
}
