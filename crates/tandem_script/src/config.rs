//! Engine configuration

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Options recognized when an engine is created.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Root directory handed to the module resolver for `import()`.
    pub module_path: Option<PathBuf>,
    /// Evaluate every source as strict code, whatever it declares.
    pub force_strict: bool,
    /// Heap limit in bytes.
    pub memory_limit: Option<usize>,
    /// Native stack budget for script execution, in bytes.
    pub max_stack_size: Option<usize>,
    /// Allocation volume that triggers an automatic collection.
    pub gc_threshold: Option<usize>,
}

impl Config {
    pub fn from_json_str(source: &str) -> Result<Self> {
        serde_json::from_str(source).map_err(|err| Error::Config(err.to_string()))
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path).map_err(|source| Error::Io {
            path: path.to_path_buf(),
            source: source.into(),
        })?;
        Self::from_json_str(&source)
    }

    /// Strict mode for one evaluation.
    pub(crate) fn strict(&self, requested: bool) -> bool {
        self.force_strict || requested
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_fill_missing_fields() {
        let config = Config::from_json_str(r#"{ "force_strict": true }"#).unwrap();
        assert!(config.force_strict);
        assert_eq!(config.module_path, None);
        assert_eq!(config.memory_limit, None);
    }

    #[test]
    fn test_invalid_json_is_config_error() {
        let err = Config::from_json_str("{ nope").unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_force_strict_wins() {
        let config = Config {
            force_strict: true,
            ..Config::default()
        };
        assert!(config.strict(false));
        assert!(!Config::default().strict(false));
        assert!(Config::default().strict(true));
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tandem.json");
        std::fs::write(&path, r#"{ "module_path": "/srv/scripts", "gc_threshold": 4096 }"#)
            .unwrap();

        let config = Config::from_json_file(&path).unwrap();
        assert_eq!(config.module_path, Some(PathBuf::from("/srv/scripts")));
        assert_eq!(config.gc_threshold, Some(4096));

        let missing = Config::from_json_file(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, Error::Io { .. }));
    }
}
