//! Stable fingerprint generation.
//!
//! A fingerprint identifies the client a rate limit applies to. It is derived
//! from the request characteristics a rule is keyed on, sorted by name, and
//! the site salt, so that the same inputs always produce the same key
//! regardless of the order they were supplied in.

use base64::Engine;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

const FINGERPRINT_PREFIX: &str = "fp::1::";

const TAG_BOOL: u8 = 0x01;
const TAG_UINT: u8 = 0x02;
const TAG_STRING: u8 = 0x03;
const TAG_STRING_SLICE: u8 = 0x04;

/// A typed value fed into the [`StableHasher`].
#[derive(Debug, Clone, Copy)]
pub enum FieldValue<'a> {
    Bool(bool),
    Uint(u64),
    Str(&'a str),
    StrSlice(&'a [String]),
}

/// Incremental hasher with an unambiguous field encoding.
///
/// Every field is written as its length-prefixed name, a type tag and a
/// length-prefixed payload, so adjacent fields can never run together
/// (`["ab", "c"]` and `["a", "bc"]` hash differently).
pub struct StableHasher {
    digest: Sha256,
}

impl StableHasher {
    pub fn new() -> Self {
        Self {
            digest: Sha256::new(),
        }
    }

    pub fn bool(&mut self, name: &str, value: bool) {
        self.name(name, TAG_BOOL);
        self.digest.update([value as u8]);
    }

    pub fn uint(&mut self, name: &str, value: u64) {
        self.name(name, TAG_UINT);
        self.digest.update(value.to_be_bytes());
    }

    pub fn string(&mut self, name: &str, value: &str) {
        self.name(name, TAG_STRING);
        self.bytes(value.as_bytes());
    }

    pub fn string_slice<S: AsRef<str>>(&mut self, name: &str, values: &[S]) {
        self.name(name, TAG_STRING_SLICE);
        self.digest.update((values.len() as u64).to_be_bytes());
        for value in values {
            self.bytes(value.as_ref().as_bytes());
        }
    }

    pub fn field(&mut self, name: &str, value: FieldValue<'_>) {
        match value {
            FieldValue::Bool(v) => self.bool(name, v),
            FieldValue::Uint(v) => self.uint(name, v),
            FieldValue::Str(v) => self.string(name, v),
            FieldValue::StrSlice(v) => self.string_slice(name, v),
        }
    }

    /// Finish hashing and return the URL-safe base64 digest.
    pub fn finish(self) -> String {
        base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(self.digest.finalize())
    }

    fn name(&mut self, name: &str, tag: u8) {
        self.bytes(name.as_bytes());
        self.digest.update([tag]);
    }

    fn bytes(&mut self, data: &[u8]) {
        self.digest.update((data.len() as u64).to_be_bytes());
        self.digest.update(data);
    }
}

impl Default for StableHasher {
    fn default() -> Self {
        Self::new()
    }
}

/// Hash an ordered list of fields.
pub fn hash(fields: &[(&str, FieldValue<'_>)]) -> String {
    let mut hasher = StableHasher::new();
    for (name, value) in fields {
        hasher.field(name, *value);
    }
    hasher.finish()
}

/// Opaque key identifying a client for rate limiting purposes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for Fingerprint {
    fn from(value: String) -> Self {
        Fingerprint(value)
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Derives fingerprints from characteristics, salted with the site identity.
#[derive(Debug, Clone)]
pub struct Fingerprinter {
    salt: String,
}

impl Fingerprinter {
    pub fn new(salt: impl Into<String>) -> Self {
        Self { salt: salt.into() }
    }

    /// Compute the fingerprint for a set of `(name, value)` characteristics.
    ///
    /// The pairs are sorted by name before hashing, so supply order is
    /// irrelevant.
    pub fn fingerprint<'a, I>(&self, characteristics: I) -> Fingerprint
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut pairs: Vec<(&str, &str)> = characteristics.into_iter().collect();
        pairs.sort_unstable();

        let mut hasher = StableHasher::new();
        hasher.string("site", &self.salt);
        for (name, value) in pairs {
            hasher.string(name, value);
        }

        Fingerprint(format!("{}{}", FINGERPRINT_PREFIX, hasher.finish()))
    }
}
