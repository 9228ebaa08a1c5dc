use crate::{env_optional, ConfigError, FromEnv};
use std::path::PathBuf;

/// Where subscribers keep their replay watermarks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PersistenceConfig {
    pub state_dir: PathBuf,
}

impl PersistenceConfig {
    pub fn new(state_dir: impl Into<PathBuf>) -> Self {
        Self {
            state_dir: state_dir.into(),
        }
    }
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            state_dir: std::env::temp_dir().join("courier"),
        }
    }
}

impl FromEnv for PersistenceConfig {
    /// COURIER_STATE_DIR, defaults to `<temp>/courier`
    fn from_env() -> Result<Self, ConfigError> {
        Ok(env_optional("COURIER_STATE_DIR")
            .map(Self::new)
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_state_dir() {
        temp_env::with_var_unset("COURIER_STATE_DIR", || {
            let config = PersistenceConfig::from_env().unwrap();
            assert_eq!(config.state_dir, std::env::temp_dir().join("courier"));
        });
    }

    #[test]
    fn test_state_dir_from_env() {
        temp_env::with_var("COURIER_STATE_DIR", Some("/var/lib/agent"), || {
            let config = PersistenceConfig::from_env().unwrap();
            assert_eq!(config.state_dir, PathBuf::from("/var/lib/agent"));
        });
    }
}
