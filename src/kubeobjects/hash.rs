//! Stable content hashing
//!
//! Two consumers:
//! - the object query kit stamps a template-hash annotation onto desired
//!   objects so unchanged reconcile cycles are O(1) comparisons,
//! - the job installer derives content-addressed Job names so retries for
//!   the same (image, node) pair never create duplicates.

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::{Error, Result, TEMPLATE_HASH_ANNOTATION};

/// Number of hex characters kept from the SHA-256 digest.
///
/// 16 hex chars (64 bits) keep `codemodule-download-<hash>` well under the
/// 63-character Kubernetes name limit while making collisions across
/// (image, node) pairs practically impossible.
const HASH_LEN: usize = 16;

/// Hash an arbitrary byte string to the truncated hex form
pub fn hash_bytes(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    let mut out = String::with_capacity(HASH_LEN);
    for byte in digest.iter().take(HASH_LEN / 2) {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

/// Compute the template hash of a serializable object.
///
/// The object's own template-hash annotation is stripped before hashing so
/// that stamping the annotation does not change the hash it carries. Two
/// objects with identical content (data, labels, owner references) produce
/// identical hashes regardless of annotation stamping order.
pub fn template_hash<T: Serialize>(obj: &T) -> Result<String> {
    let mut value =
        serde_json::to_value(obj).map_err(|err| Error::serialization(err.to_string()))?;

    if let Some(annotations) = value
        .pointer_mut("/metadata/annotations")
        .and_then(|v| v.as_object_mut())
    {
        annotations.remove(TEMPLATE_HASH_ANNOTATION);
    }

    let canonical =
        serde_json::to_vec(&value).map_err(|err| Error::serialization(err.to_string()))?;

    Ok(hash_bytes(&canonical))
}
