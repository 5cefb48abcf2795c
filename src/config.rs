//! Runtime configuration.
//!
//! Settings are read from an optional JSON file and then overridden by
//! environment variables with the `CGOV_` prefix.

use std::fmt;
use std::fs;
use std::num::NonZeroU64;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Affirmative votes needed to verify a project.
pub const DEFAULT_QUORUM: NonZeroU64 = match NonZeroU64::new(3) {
    Some(quorum) => quorum,
    None => panic!("default quorum must be positive"),
};

pub const DEFAULT_STATE_PATH: &str = "cgov-state.json";
pub const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid value {value:?} for {key}: {reason}")]
    InvalidValue {
        key: String,
        value: String,
        reason: &'static str,
    },
}

/// What happens to a vote cast on a project that is already verified.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum PostVerificationPolicy {
    /// The vote is recorded like any other but never re-triggers verification.
    /// The tally keeps counting after the project is verified.
    #[default]
    Accept,
    /// The vote is rejected with `AlreadyVerified`.
    Reject,
}

impl FromStr for PostVerificationPolicy {
    type Err = &'static str;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "accept" => Ok(Self::Accept),
            "reject" => Ok(Self::Reject),
            _ => Err("expected \"accept\" or \"reject\""),
        }
    }
}

impl fmt::Display for PostVerificationPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PostVerificationPolicy::Accept => write!(f, "accept"),
            PostVerificationPolicy::Reject => write!(f, "reject"),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct GovernanceConfig {
    #[serde(default = "default_quorum")]
    pub quorum: NonZeroU64,
    #[serde(default)]
    pub post_verification: PostVerificationPolicy,
}

fn default_quorum() -> NonZeroU64 {
    DEFAULT_QUORUM
}

impl Default for GovernanceConfig {
    fn default() -> Self {
        Self {
            quorum: DEFAULT_QUORUM,
            post_verification: PostVerificationPolicy::default(),
        }
    }
}

impl GovernanceConfig {
    pub fn with_quorum(quorum: u64) -> Result<Self, ConfigError> {
        let quorum = NonZeroU64::new(quorum).ok_or_else(|| ConfigError::InvalidValue {
            key: "quorum".into(),
            value: quorum.to_string(),
            reason: "quorum must be a positive integer",
        })?;
        Ok(Self {
            quorum,
            ..Self::default()
        })
    }

    pub fn post_verification(mut self, policy: PostVerificationPolicy) -> Self {
        self.post_verification = policy;
        self
    }

    pub fn quorum(&self) -> u64 {
        self.quorum.get()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
pub struct Settings {
    /// Used when a deployment is created (`cgov init`, `cgov demo`). An
    /// existing state file keeps the config it was created with.
    #[serde(default)]
    pub governance: GovernanceConfig,
    #[serde(default = "default_state_path")]
    pub state_path: PathBuf,
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_state_path() -> PathBuf {
    PathBuf::from(DEFAULT_STATE_PATH)
}

fn default_log_filter() -> String {
    DEFAULT_LOG_FILTER.to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            governance: GovernanceConfig::default(),
            state_path: default_state_path(),
            log_filter: default_log_filter(),
        }
    }
}

impl Settings {
    /// Load settings from `path` (if given) and apply `CGOV_*` environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut settings = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        settings.apply_overrides(std::env::vars())?;
        Ok(settings)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        serde_json::from_str(&raw).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    pub fn apply_overrides<I>(&mut self, vars: I) -> Result<(), ConfigError>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        for (key, value) in vars {
            match key.as_str() {
                "CGOV_QUORUM" => {
                    let parsed = value
                        .trim()
                        .parse::<NonZeroU64>()
                        .map_err(|_| ConfigError::InvalidValue {
                            key: key.clone(),
                            value: value.clone(),
                            reason: "quorum must be a positive integer",
                        })?;
                    self.governance.quorum = parsed;
                }
                "CGOV_POST_VERIFICATION" => {
                    self.governance.post_verification =
                        value.parse().map_err(|reason| ConfigError::InvalidValue {
                            key: key.clone(),
                            value: value.clone(),
                            reason,
                        })?;
                }
                "CGOV_STATE" => self.state_path = PathBuf::from(value),
                "CGOV_LOG" => self.log_filter = value,
                _ => {}
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn defaults_match_observed_quorum() {
        let settings = Settings::default();
        assert_eq!(settings.governance.quorum(), 3);
        assert_eq!(
            settings.governance.post_verification,
            PostVerificationPolicy::Accept
        );
        assert_eq!(settings.state_path, PathBuf::from(DEFAULT_STATE_PATH));
    }

    #[test]
    fn partial_json_falls_back_to_defaults() {
        let settings: Settings =
            serde_json::from_str(r#"{"governance":{"post_verification":"reject"}}"#).unwrap();
        assert_eq!(settings.governance.quorum(), 3);
        assert_eq!(
            settings.governance.post_verification,
            PostVerificationPolicy::Reject
        );
        assert_eq!(settings.log_filter, "info");
    }

    #[test]
    fn zero_quorum_is_rejected() {
        assert!(GovernanceConfig::with_quorum(0).is_err());
        assert!(serde_json::from_str::<Settings>(r#"{"governance":{"quorum":0}}"#).is_err());

        let mut settings = Settings::default();
        let err = settings
            .apply_overrides(vars(&[("CGOV_QUORUM", "0")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { .. }));
        assert_eq!(settings.governance.quorum(), 3);
    }

    #[test]
    fn environment_overrides_apply() {
        let mut settings = Settings::default();
        settings
            .apply_overrides(vars(&[
                ("CGOV_QUORUM", "5"),
                ("CGOV_POST_VERIFICATION", "Reject"),
                ("CGOV_STATE", "/tmp/state.json"),
                ("CGOV_LOG", "debug"),
                ("UNRELATED", "x"),
            ]))
            .unwrap();
        assert_eq!(settings.governance.quorum(), 5);
        assert_eq!(
            settings.governance.post_verification,
            PostVerificationPolicy::Reject
        );
        assert_eq!(settings.state_path, PathBuf::from("/tmp/state.json"));
        assert_eq!(settings.log_filter, "debug");
    }

    #[test]
    fn config_file_is_read() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cgov.json");
        fs::write(&path, r#"{"governance":{"quorum":2},"log_filter":"warn"}"#).unwrap();
        let settings = Settings::from_file(&path).unwrap();
        assert_eq!(settings.governance.quorum(), 2);
        assert_eq!(settings.log_filter, "warn");

        let missing = Settings::from_file(&dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(missing, ConfigError::Io { .. }));
    }
}
