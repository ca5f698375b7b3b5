//! Session id generation.
//!
//! Ids carry a stable prefix so the validator (and the credential backend)
//! can recognise them, followed by a random alphanumeric suffix.

use rand::Rng;
use rand::distributions::Alphanumeric;

/// Stable prefix shared by every session and credential id.
pub const SESSION_ID_PREFIX: &str = "teranxmd~";

/// Default total id length, prefix included.
pub const DEFAULT_ID_LENGTH: usize = 22;

/// Shortest random suffix ever produced, whatever length is requested.
pub const MIN_SUFFIX_LENGTH: usize = 8;

/// Produces opaque, prefixed random identifiers.
///
/// Stateless and cheap to clone; safe to share across concurrent sessions.
#[derive(Debug, Clone)]
pub struct SessionIdGenerator {
    prefix: String,
    length: usize,
}

impl SessionIdGenerator {
    pub fn new() -> Self {
        Self {
            prefix: SESSION_ID_PREFIX.to_string(),
            length: DEFAULT_ID_LENGTH,
        }
    }

    /// Generate an id of the default length.
    pub fn generate(&self) -> String {
        self.generate_with_length(self.length)
    }

    /// Generate an id of (at least) `length` characters.
    ///
    /// The suffix is `length - prefix.len()` characters long, floored at
    /// [`MIN_SUFFIX_LENGTH`].
    pub fn generate_with_length(&self, length: usize) -> String {
        let suffix_len = length
            .saturating_sub(self.prefix.len())
            .max(MIN_SUFFIX_LENGTH);
        let suffix: String = rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(suffix_len)
            .map(char::from)
            .collect();
        format!("{}{}", self.prefix, suffix)
    }

    /// The prefix every generated id starts with.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Whether `id` looks like something this generator produced.
    pub fn recognizes(&self, id: &str) -> bool {
        id.strip_prefix(self.prefix.as_str()).is_some_and(|suffix| {
            suffix.len() >= MIN_SUFFIX_LENGTH && suffix.chars().all(|c| c.is_ascii_alphanumeric())
        })
    }
}

impl Default for SessionIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
