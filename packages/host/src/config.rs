use std::{str::FromStr as _, time::Duration};

use portunnel_models::DEFAULT_PREFIX;
use strum_macros::{AsRefStr, EnumString};
use thiserror::Error;

/// Frame and body cap used when `PORTUNNEL_MAXIMUM_MESSAGE_SIZE` is unset.
pub const DEFAULT_MESSAGE_SIZE_LIMIT: usize = 16 * 1024 * 1024;

/// Room for the JSON envelope around a base64 encoded payload.
const ENVELOPE_OVERHEAD: usize = 64 * 1024;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("PORTUNNEL_SECRET_KEY must be set")]
    MissingSecretKey,
    #[error("Invalid prefix '{0}': must start with '/' and name at least one segment")]
    InvalidPrefix(String),
    #[error("Invalid value for {name}: '{value}'")]
    InvalidNumber { name: &'static str, value: String },
    #[error("Invalid failure policy '{0}': expected 'empty' or 'status'")]
    InvalidFailurePolicy(String),
}

/// What an external caller sees when the relay cannot produce a real response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, EnumString, AsRefStr)]
#[strum(serialize_all = "snake_case", ascii_case_insensitive)]
pub enum FailurePolicy {
    /// Empty `200` response.
    #[default]
    Empty,
    /// `404` for an unknown service, `502` for a failed target and `504` on timeout.
    Status,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostConfig {
    pub prefix: String,
    pub secret_key: String,
    pub maximum_message_size: Option<usize>,
    pub failure_policy: FailurePolicy,
    pub forward_timeout: Option<Duration>,
}

impl HostConfig {
    #[must_use]
    pub fn new(secret_key: impl Into<String>) -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            secret_key: secret_key.into(),
            maximum_message_size: None,
            failure_policy: FailurePolicy::default(),
            forward_timeout: None,
        }
    }

    /// # Errors
    ///
    /// * If any `PORTUNNEL_*` variable is missing or malformed
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// # Errors
    ///
    /// * If the secret key is missing or empty
    /// * If the prefix, size, policy or timeout values are malformed
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let secret_key = lookup("PORTUNNEL_SECRET_KEY")
            .filter(|key| !key.is_empty())
            .ok_or(ConfigError::MissingSecretKey)?;

        let prefix = lookup("PORTUNNEL_PREFIX").map_or_else(
            || Ok(DEFAULT_PREFIX.to_string()),
            |prefix| normalize_prefix(&prefix),
        )?;

        let maximum_message_size =
            parse_number::<usize>(&lookup, "PORTUNNEL_MAXIMUM_MESSAGE_SIZE")?;

        let failure_policy = lookup("PORTUNNEL_FAILURE_POLICY")
            .map(|policy| {
                FailurePolicy::from_str(policy.trim())
                    .map_err(|_| ConfigError::InvalidFailurePolicy(policy))
            })
            .transpose()?
            .unwrap_or_default();

        let forward_timeout = parse_number::<u64>(&lookup, "PORTUNNEL_FORWARD_TIMEOUT_SECS")?
            .map(Duration::from_secs);

        Ok(Self {
            prefix,
            secret_key,
            maximum_message_size,
            failure_policy,
            forward_timeout,
        })
    }

    /// # Errors
    ///
    /// * If `prefix` is not a valid path prefix
    pub fn with_prefix(mut self, prefix: &str) -> Result<Self, ConfigError> {
        self.prefix = normalize_prefix(prefix)?;
        Ok(self)
    }

    #[must_use]
    pub const fn with_failure_policy(mut self, policy: FailurePolicy) -> Self {
        self.failure_policy = policy;
        self
    }

    #[must_use]
    pub const fn with_forward_timeout(mut self, timeout: Duration) -> Self {
        self.forward_timeout = Some(timeout);
        self
    }

    #[must_use]
    pub const fn with_maximum_message_size(mut self, size: usize) -> Self {
        self.maximum_message_size = Some(size);
        self
    }

    /// Largest buffered ingress body or single caller WebSocket frame.
    #[must_use]
    pub fn message_size_limit(&self) -> usize {
        self.maximum_message_size
            .unwrap_or(DEFAULT_MESSAGE_SIZE_LIMIT)
    }

    /// Largest control-channel frame, which carries one message as base64 inside JSON.
    #[must_use]
    pub fn control_frame_size_limit(&self) -> usize {
        self.message_size_limit()
            .saturating_add(2)
            .saturating_div(3)
            .saturating_mul(4)
            .saturating_add(ENVELOPE_OVERHEAD)
    }
}

/// Ensures a leading `/`, trims trailing ones and rejects the bare root.
///
/// # Errors
///
/// * If `prefix` does not start with `/` or is empty once trimmed
pub fn normalize_prefix(prefix: &str) -> Result<String, ConfigError> {
    let trimmed = prefix.trim();

    if !trimmed.starts_with('/') {
        return Err(ConfigError::InvalidPrefix(prefix.to_string()));
    }

    let trimmed = trimmed.trim_end_matches('/');

    if trimmed.is_empty() {
        return Err(ConfigError::InvalidPrefix(prefix.to_string()));
    }

    Ok(trimmed.to_string())
}

fn parse_number<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<Option<T>, ConfigError> {
    lookup(name)
        .filter(|value| !value.trim().is_empty())
        .map(|value| {
            value
                .trim()
                .parse::<T>()
                .map_err(|_| ConfigError::InvalidNumber { name, value })
        })
        .transpose()
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use pretty_assertions::assert_eq;

    use super::*;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars = vars
            .iter()
            .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
            .collect::<BTreeMap<_, _>>();
        move |name| vars.get(name).cloned()
    }

    #[test_log::test]
    fn defaults_apply_when_only_secret_is_set() {
        let config = HostConfig::from_lookup(lookup(&[("PORTUNNEL_SECRET_KEY", "s3cret")])).unwrap();

        assert_eq!(config, HostConfig::new("s3cret"));
        assert_eq!(config.prefix, "/portunnel");
        assert_eq!(config.message_size_limit(), DEFAULT_MESSAGE_SIZE_LIMIT);
    }

    #[test_log::test]
    fn missing_or_empty_secret_is_rejected() {
        assert!(matches!(
            HostConfig::from_lookup(lookup(&[])),
            Err(ConfigError::MissingSecretKey)
        ));
        assert!(matches!(
            HostConfig::from_lookup(lookup(&[("PORTUNNEL_SECRET_KEY", "")])),
            Err(ConfigError::MissingSecretKey)
        ));
    }

    #[test_log::test]
    fn all_settings_are_read() {
        let config = HostConfig::from_lookup(lookup(&[
            ("PORTUNNEL_SECRET_KEY", "k"),
            ("PORTUNNEL_PREFIX", "/relay/"),
            ("PORTUNNEL_MAXIMUM_MESSAGE_SIZE", "1024"),
            ("PORTUNNEL_FAILURE_POLICY", "Status"),
            ("PORTUNNEL_FORWARD_TIMEOUT_SECS", "30"),
        ]))
        .unwrap();

        assert_eq!(config.prefix, "/relay");
        assert_eq!(config.maximum_message_size, Some(1024));
        assert_eq!(config.failure_policy, FailurePolicy::Status);
        assert_eq!(config.forward_timeout, Some(Duration::from_secs(30)));
    }

    #[test_log::test]
    fn malformed_values_are_rejected() {
        assert!(matches!(
            HostConfig::from_lookup(lookup(&[
                ("PORTUNNEL_SECRET_KEY", "k"),
                ("PORTUNNEL_MAXIMUM_MESSAGE_SIZE", "lots"),
            ])),
            Err(ConfigError::InvalidNumber { name: "PORTUNNEL_MAXIMUM_MESSAGE_SIZE", .. })
        ));
        assert!(matches!(
            HostConfig::from_lookup(lookup(&[
                ("PORTUNNEL_SECRET_KEY", "k"),
                ("PORTUNNEL_FAILURE_POLICY", "retry"),
            ])),
            Err(ConfigError::InvalidFailurePolicy(_))
        ));
    }

    #[test_log::test]
    fn prefix_normalization() {
        assert_eq!(normalize_prefix("/portunnel").unwrap(), "/portunnel");
        assert_eq!(normalize_prefix("/a/b//").unwrap(), "/a/b");
        assert!(normalize_prefix("/").is_err());
        assert!(normalize_prefix("portunnel").is_err());
    }

    #[test_log::test]
    fn control_frames_fit_a_base64_encoded_message() {
        let config = HostConfig::new("k").with_maximum_message_size(3);

        assert_eq!(config.control_frame_size_limit(), 4 + ENVELOPE_OVERHEAD);
    }
}
