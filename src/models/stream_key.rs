// StreamKey Model
// Opaque secret that never reaches logs

use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Platform stream key
///
/// Cleared from memory on drop. `Debug` and `Display` print a mask.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize, Zeroize, ZeroizeOnDrop)]
#[serde(transparent)]
pub struct StreamKey(String);

impl StreamKey {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Raw key, for building destination URLs only
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.trim().is_empty()
    }

    /// Length in characters
    pub fn len(&self) -> usize {
        self.0.chars().count()
    }
}

impl From<&str> for StreamKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for StreamKey {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl fmt::Debug for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            f.write_str("StreamKey(<empty>)")
        } else {
            f.write_str("StreamKey(***)")
        }
    }
}

impl fmt::Display for StreamKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_masks_key() {
        let key = StreamKey::new("live_123_secret");
        assert_eq!(format!("{key:?}"), "StreamKey(***)");
        assert_eq!(key.to_string(), "***");
        assert_eq!(key.expose(), "live_123_secret");
    }

    #[test]
    fn test_whitespace_key_is_empty() {
        assert!(StreamKey::new("   ").is_empty());
        assert!(!StreamKey::new("abc").is_empty());
    }

    #[test]
    fn test_serializes_transparently() {
        let key = StreamKey::new("abc");
        assert_eq!(serde_json::to_string(&key).unwrap(), "\"abc\"");
    }
}
