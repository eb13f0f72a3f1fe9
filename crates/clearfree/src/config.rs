//! Tunables for a clearing request.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{ClearError, ClearResult};

/// Configuration for a clearing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearConfig {
    /// Clear a range of the realtime device instead of the data device.
    pub realtime: bool,
    /// Force (`Some(true)`) or forbid (`Some(false)`) the dedupe strategy.
    /// `None` picks it whenever the filesystem supports reflink.
    pub use_dedupe: Option<bool>,
    /// Ask online repair to rebuild metadata still living in the range.
    pub evacuate_metadata: bool,
    /// Records per space-map query.
    pub fsmap_batch: usize,
    /// Records per refcount query.
    pub refcount_batch: usize,
    /// Records per block-map query.
    pub bmap_batch: usize,
    /// Upper bound on grab/freeze rounds while waiting for the capture file to stop growing.
    pub max_freeze_rounds: usize,
    /// Upper bound on metadata relocation rounds.
    pub max_metadata_rounds: usize,
}

impl Default for ClearConfig {
    fn default() -> Self {
        Self {
            realtime: false,
            use_dedupe: None,
            evacuate_metadata: true,
            fsmap_batch: 128,
            refcount_batch: 128,
            bmap_batch: 128,
            max_freeze_rounds: 64,
            max_metadata_rounds: 16,
        }
    }
}

impl ClearConfig {
    /// Loads a configuration from a `.toml` or `.json` file.
    pub fn from_file(path: &Path) -> ClearResult<Self> {
        let contents =
            std::fs::read_to_string(path).map_err(|e| ClearError::io("read config", e))?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let config: ClearConfig = match ext.to_lowercase().as_str() {
            "toml" => toml::from_str(&contents).map_err(|e| ClearError::Config {
                reason: e.to_string(),
            })?,
            "json" => serde_json::from_str(&contents).map_err(|e| ClearError::Config {
                reason: e.to_string(),
            })?,
            _ => {
                return Err(ClearError::Config {
                    reason: format!("Unsupported config file extension: {}", ext),
                })
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the engine cannot work with.
    pub fn validate(&self) -> ClearResult<()> {
        if self.fsmap_batch == 0 || self.refcount_batch == 0 || self.bmap_batch == 0 {
            return Err(ClearError::Config {
                reason: "query batch sizes must be nonzero".to_string(),
            });
        }
        if self.max_freeze_rounds == 0 {
            return Err(ClearError::Config {
                reason: "max_freeze_rounds must be nonzero".to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_default_values() {
        let config = ClearConfig::default();
        assert!(!config.realtime);
        assert_eq!(config.use_dedupe, None);
        assert!(config.evacuate_metadata);
        assert_eq!(config.fsmap_batch, 128);
        assert_eq!(config.max_freeze_rounds, 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_from_file_toml() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(
            file,
            r#"
realtime = true
use_dedupe = false
fsmap_batch = 16
"#
        )
        .unwrap();

        let config = ClearConfig::from_file(file.path()).unwrap();
        assert!(config.realtime);
        assert_eq!(config.use_dedupe, Some(false));
        assert_eq!(config.fsmap_batch, 16);
        assert_eq!(config.refcount_batch, 128);
    }

    #[test]
    fn test_from_file_json() {
        let mut file = NamedTempFile::with_suffix(".json").unwrap();
        writeln!(file, r#"{{"evacuate_metadata": false, "bmap_batch": 4}}"#).unwrap();

        let config = ClearConfig::from_file(file.path()).unwrap();
        assert!(!config.evacuate_metadata);
        assert_eq!(config.bmap_batch, 4);
    }

    #[test]
    fn test_from_file_unsupported_extension() {
        let file = NamedTempFile::with_suffix(".yaml").unwrap();
        let err = ClearConfig::from_file(file.path()).unwrap_err();
        assert!(format!("{}", err).contains("Unsupported config file extension"));
    }

    #[test]
    fn test_zero_batch_rejected() {
        let mut file = NamedTempFile::with_suffix(".toml").unwrap();
        writeln!(file, "refcount_batch = 0").unwrap();
        assert!(matches!(
            ClearConfig::from_file(file.path()),
            Err(ClearError::Config { .. })
        ));
    }
}
