//! Hashing helpers for content digests and identifiers.

use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Length of generated identifiers (reference ids, session ids).
const ID_LEN: usize = 25;

/// OCI digest (`sha256:<hex>`) of a byte slice.
pub fn sha256_digest(bytes: &[u8]) -> String {
  format!("sha256:{}", hex::encode(Sha256::digest(bytes)))
}

/// A fresh random identifier made of lowercase hex digits.
pub fn unique_id() -> String {
  let mut id = Uuid::new_v4().simple().to_string();
  id.truncate(ID_LEN);
  id
}
