#[cfg(feature = "serde")]
use serde::Deserialize;
#[cfg(feature = "serde")]
use serde::Serialize;
use std::time::Duration;

/// Loader settings in a form suitable for configuration files.
///
/// See [`BatchLoader::from_config()`](crate::BatchLoader::from_config).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default, deny_unknown_fields))]
pub struct LoaderConfig {
    pub name:         Option<String>,
    /// Batch wait window, milliseconds.
    pub wait_ms:      u64,
    /// 0 = unbounded batches.
    pub max_batch:    usize,
    /// 0 = unbounded cache.
    pub max_capacity: u64,
}

impl LoaderConfig {
    pub fn wait(&self) -> Duration {
        Duration::from_millis(self.wait_ms)
    }
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            name:         None,
            wait_ms:      1,
            max_batch:    0,
            max_capacity: 0,
        }
    }
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use super::*;

    #[test]
    fn partial_config_uses_defaults() {
        let config: LoaderConfig = serde_json::from_str(r#"{ "name": "users", "max_batch": 100 }"#).unwrap();
        assert_eq!(config.name.as_deref(), Some("users"));
        assert_eq!(config.max_batch, 100);
        assert_eq!(config.wait(), Duration::from_millis(1));
        assert_eq!(config.max_capacity, 0);
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(serde_json::from_str::<LoaderConfig>(r#"{ "wait": 10 }"#).is_err());
    }
}
