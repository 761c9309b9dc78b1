//! Provisioning policy toggles.

use serde::{Deserialize, Serialize};

use crate::device::DEFAULT_FS_TYPE;

/// Policies applied while provisioning.
///
/// Both checks default to the lenient behaviour: an existing image of a
/// different size is reused unchanged, and a device holding a different
/// filesystem is reformatted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Fail when an existing image's size differs from the request.
    pub strict_size_check: bool,

    /// Fail instead of reformatting a device that holds another filesystem.
    pub strict_fs_check: bool,

    /// Filesystem used when a request names none.
    pub default_fs_type: String,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            strict_size_check: false,
            strict_fs_check: false,
            default_fs_type: DEFAULT_FS_TYPE.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_lenient() {
        let settings = Settings::default();
        assert!(!settings.strict_size_check);
        assert!(!settings.strict_fs_check);
        assert_eq!(settings.default_fs_type, "xfs");
    }

    #[test]
    fn test_partial_deserialization() {
        let settings: Settings = serde_json::from_str(r#"{"strict_fs_check": true}"#).unwrap();
        assert!(settings.strict_fs_check);
        assert!(!settings.strict_size_check);
        assert_eq!(settings.default_fs_type, "xfs");
    }
}
