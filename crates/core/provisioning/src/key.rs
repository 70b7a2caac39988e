//! Content key new-type for template databases
//!
//! A [`ContentKey`] identifies one template: two requests carrying the same schema text share a
//! key and therefore a template. The key is a 32 character lowercase hex string, which is the
//! width the template service expects.
//!
//! ## Derivation
//!
//! The key is derived from a 32-bit polynomial hash (`h = 31 * h + unit`, wrapping) over the
//! UTF-16 code units of the schema text. The 8 hex digit rendering of that word is repeated four
//! times to fill 32 characters. A request without a schema maps to [`NO_SCHEMA_KEY`].
//!
//! The derivation is stable across processes and platforms, which is what lets a remote template
//! service deduplicate templates between test runs. It is **not** collision resistant: only 32
//! bits of the key carry information, so two different schemas collide with probability of
//! roughly `n² / 2³³` for `n` distinct schemas. For the few dozen schemas a test suite uses this is
//! negligible; a colliding pair would silently share one template.

/// Length of a content key in characters.
pub const KEY_LEN: usize = 32;

/// Key shared by every request that carries no schema.
pub const NO_SCHEMA_KEY: &str = "1234567890abcdef1234567890abcdef";

/// Error type for content key validation failures
#[derive(Debug, thiserror::Error)]
pub enum KeyError {
    /// Key string must be exactly 32 characters
    #[error("content key must be exactly {KEY_LEN} characters, got {0} characters")]
    InvalidLength(usize),

    /// Key string contains something other than lowercase hex digits
    #[error("content key contains invalid character {character:?} at index {index}")]
    InvalidCharacter { character: char, index: usize },
}

/// Deterministic identifier of a template database.
///
/// Stores the ASCII hex digits inline, so the type is `Copy` and cheap to pass around as a map
/// key.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ContentKey([u8; KEY_LEN]);

impl ContentKey {
    /// Derives the key of a schema. `None` yields the shared no-schema key.
    pub fn derive(schema: Option<&str>) -> Self {
        let Some(schema) = schema else {
            return Self::no_schema();
        };

        let word = format!("{:08x}", schema_hash(schema));
        let mut bytes = [0u8; KEY_LEN];
        for chunk in bytes.chunks_exact_mut(word.len()) {
            chunk.copy_from_slice(word.as_bytes());
        }
        Self(bytes)
    }

    /// The key of requests without a schema.
    pub fn no_schema() -> Self {
        let mut bytes = [0u8; KEY_LEN];
        bytes.copy_from_slice(NO_SCHEMA_KEY.as_bytes());
        Self(bytes)
    }

    /// Parses a key received from outside, e.g. echoed back by a template service.
    ///
    /// # Errors
    /// Returns an error if the string is not exactly 32 lowercase hex digits.
    pub fn from_hex(key: impl AsRef<str>) -> Result<Self, KeyError> {
        let key = key.as_ref();
        if key.len() != KEY_LEN {
            return Err(KeyError::InvalidLength(key.len()));
        }

        let mut bytes = [0u8; KEY_LEN];
        for (index, character) in key.chars().enumerate() {
            if !matches!(character, '0'..='9' | 'a'..='f') {
                return Err(KeyError::InvalidCharacter { character, index });
            }
            bytes[index] = character as u8;
        }
        Ok(Self(bytes))
    }

    pub fn as_str(&self) -> &str {
        // Only ever constructed from ASCII hex digits
        std::str::from_utf8(&self.0).expect("content key bytes are ASCII")
    }

    /// The first 8 characters; enough to tell templates apart in database names.
    pub fn short(&self) -> &str {
        &self.as_str()[..8]
    }
}

/// 32-bit polynomial hash over UTF-16 code units.
///
/// Matches the string hash used by the JVM, so keys agree with other clients of the same
/// template service.
fn schema_hash(schema: &str) -> u32 {
    schema
        .encode_utf16()
        .fold(0u32, |hash, unit| hash.wrapping_mul(31).wrapping_add(u32::from(unit)))
}

impl AsRef<str> for ContentKey {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl std::str::FromStr for ContentKey {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl std::fmt::Display for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::fmt::Debug for ContentKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("ContentKey").field(&self.as_str()).finish()
    }
}

impl PartialEq<&str> for ContentKey {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl PartialEq<str> for ContentKey {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}
