//! AES-256-GCM authenticated encryption
//!
//! All field and document ciphertext goes through `seal`/`open`. A blob is a
//! single byte string laid out as:
//!
//! ```text
//! [format: 1][key_version: 4 BE][org fingerprint: 8][salt: 32][nonce: 12][tag: 16][ciphertext]
//! ```
//!
//! The header (format, version, fingerprint) is covered by the AEAD as
//! associated data, so it cannot be swapped without failing verification.
//! A fresh salt is drawn per seal and a per-blob subkey is expanded from the
//! working key, so nonces never repeat under the same AEAD key.

use crate::crypto::{
    expand_subkey, BLOB_FORMAT_V1, FINGERPRINT_SIZE, HEADER_SIZE, KEY_SIZE, MIN_BLOB_SIZE,
    NONCE_SIZE, SALT_SIZE, TAG_SIZE,
};
use crate::error::{Error, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use rand::RngCore;
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM};
use ring::digest;

/// HKDF info string for the per-blob AEAD subkey
const BLOB_SUBKEY_INFO: &[u8] = b"tenantseal-blob-v1";

/// Parsed encrypted blob
#[derive(Debug, Clone)]
pub struct EncryptedBlob {
    /// Key version the ciphertext was produced under
    pub key_version: u32,
    /// Truncated SHA-256 of the owning organization id
    pub org_fingerprint: [u8; FINGERPRINT_SIZE],
    /// Per-blob subkey derivation salt
    pub salt: [u8; SALT_SIZE],
    /// Nonce used for encryption (unique per blob)
    pub nonce: [u8; NONCE_SIZE],
    /// Authentication tag
    pub tag: [u8; TAG_SIZE],
    /// Raw ciphertext (may be empty for empty plaintext)
    pub ciphertext: Vec<u8>,
}

impl EncryptedBlob {
    /// Authenticated header bytes: format ‖ key version ‖ fingerprint
    pub fn header(&self) -> [u8; HEADER_SIZE] {
        let mut header = [0u8; HEADER_SIZE];
        header[0] = BLOB_FORMAT_V1;
        header[1..5].copy_from_slice(&self.key_version.to_be_bytes());
        header[5..].copy_from_slice(&self.org_fingerprint);
        header
    }

    /// Serialize to bytes for storage
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(MIN_BLOB_SIZE + self.ciphertext.len());
        bytes.extend_from_slice(&self.header());
        bytes.extend_from_slice(&self.salt);
        bytes.extend_from_slice(&self.nonce);
        bytes.extend_from_slice(&self.tag);
        bytes.extend_from_slice(&self.ciphertext);
        bytes
    }

    /// Deserialize from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < MIN_BLOB_SIZE {
            return Err(Error::InvalidCiphertext(format!(
                "blob too short: {} bytes",
                bytes.len()
            )));
        }

        if bytes[0] != BLOB_FORMAT_V1 {
            return Err(Error::InvalidCiphertext(format!(
                "unsupported blob format: {:#04x}",
                bytes[0]
            )));
        }

        let key_version = u32::from_be_bytes(bytes[1..5].try_into().unwrap());

        let mut org_fingerprint = [0u8; FINGERPRINT_SIZE];
        org_fingerprint.copy_from_slice(&bytes[5..HEADER_SIZE]);

        let mut offset = HEADER_SIZE;
        let mut salt = [0u8; SALT_SIZE];
        salt.copy_from_slice(&bytes[offset..offset + SALT_SIZE]);
        offset += SALT_SIZE;

        let mut nonce = [0u8; NONCE_SIZE];
        nonce.copy_from_slice(&bytes[offset..offset + NONCE_SIZE]);
        offset += NONCE_SIZE;

        let mut tag = [0u8; TAG_SIZE];
        tag.copy_from_slice(&bytes[offset..offset + TAG_SIZE]);
        offset += TAG_SIZE;

        Ok(EncryptedBlob {
            key_version,
            org_fingerprint,
            salt,
            nonce,
            tag,
            ciphertext: bytes[offset..].to_vec(),
        })
    }

    /// Encode to base64 for storage as an opaque string
    pub fn encode(&self) -> String {
        BASE64.encode(self.to_bytes())
    }

    /// Decode from a base64 storage string
    pub fn decode(encoded: &str) -> Result<Self> {
        let bytes = BASE64
            .decode(encoded.trim())
            .map_err(|e| Error::InvalidCiphertext(format!("invalid base64: {}", e)))?;
        Self::from_bytes(&bytes)
    }

    /// Total size of the serialized blob
    pub fn size(&self) -> usize {
        MIN_BLOB_SIZE + self.ciphertext.len()
    }
}

/// Compute the non-secret organization fingerprint embedded in blob headers.
///
/// Truncated SHA-256 of the organization id. Used to classify wrong-tenant
/// decrypt attempts before AEAD verification; the AEAD remains the actual
/// isolation boundary.
pub fn org_fingerprint(organization_id: &str) -> [u8; FINGERPRINT_SIZE] {
    let hash = digest::digest(&digest::SHA256, organization_id.as_bytes());
    let mut fp = [0u8; FINGERPRINT_SIZE];
    fp.copy_from_slice(&hash.as_ref()[..FINGERPRINT_SIZE]);
    fp
}

/// Encrypt plaintext under a working key.
///
/// # Arguments
/// * `key` - 256-bit working key for (organization, key_version)
/// * `key_version` - version tag embedded in the blob header
/// * `fingerprint` - organization fingerprint embedded in the blob header
/// * `plaintext` - data to encrypt (empty input is valid)
/// * `aad` - extra associated data bound into the tag (e.g. document binding)
pub fn seal(
    key: &[u8; KEY_SIZE],
    key_version: u32,
    fingerprint: [u8; FINGERPRINT_SIZE],
    plaintext: &[u8],
    aad: &[u8],
) -> Result<EncryptedBlob> {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);

    let mut nonce_bytes = [0u8; NONCE_SIZE];
    rand::thread_rng().fill_bytes(&mut nonce_bytes);

    let subkey = expand_subkey(key, &salt, BLOB_SUBKEY_INFO)?;
    let unbound_key = UnboundKey::new(&AES_256_GCM, &subkey)
        .map_err(|_| Error::Encryption("Failed to create sealing key".to_string()))?;
    let sealing_key = LessSafeKey::new(unbound_key);

    let mut blob = EncryptedBlob {
        key_version,
        org_fingerprint: fingerprint,
        salt,
        nonce: nonce_bytes,
        tag: [0u8; TAG_SIZE],
        ciphertext: Vec::new(),
    };

    let full_aad = [&blob.header()[..], aad].concat();
    let nonce = Nonce::assume_unique_for_key(nonce_bytes);

    let mut in_out = plaintext.to_vec();
    in_out.reserve(TAG_SIZE);
    sealing_key
        .seal_in_place_append_tag(nonce, Aad::from(&full_aad), &mut in_out)
        .map_err(|_| Error::Encryption("Encryption failed".to_string()))?;

    // ring appends the tag; the wire layout carries it ahead of the ciphertext
    let tag_start = in_out.len() - TAG_SIZE;
    blob.tag.copy_from_slice(&in_out[tag_start..]);
    in_out.truncate(tag_start);
    blob.ciphertext = in_out;

    Ok(blob)
}

/// Decrypt a blob under a working key.
///
/// The authentication tag is verified before any plaintext is returned;
/// failure surfaces as `IntegrityViolation`. The caller is responsible for
/// resolving the working key from the blob's embedded version and for
/// checking the fingerprint first to classify wrong-tenant attempts.
pub fn open(key: &[u8; KEY_SIZE], blob: &EncryptedBlob, aad: &[u8]) -> Result<Vec<u8>> {
    let subkey = expand_subkey(key, &blob.salt, BLOB_SUBKEY_INFO)?;
    let unbound_key = UnboundKey::new(&AES_256_GCM, &subkey)
        .map_err(|_| Error::Encryption("Failed to create opening key".to_string()))?;
    let opening_key = LessSafeKey::new(unbound_key);

    let full_aad = [&blob.header()[..], aad].concat();
    let nonce = Nonce::assume_unique_for_key(blob.nonce);

    let mut in_out = Vec::with_capacity(blob.ciphertext.len() + TAG_SIZE);
    in_out.extend_from_slice(&blob.ciphertext);
    in_out.extend_from_slice(&blob.tag);

    let plaintext = opening_key
        .open_in_place(nonce, Aad::from(&full_aad), &mut in_out)
        .map_err(|_| Error::IntegrityViolation)?;

    Ok(plaintext.to_vec())
}
