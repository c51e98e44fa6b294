//! Session limits and behavior switches.
//!
//! Values come from defaults, an optional JSON file named by
//! `AGENT_SESSION_CONFIG_PATH`, then per-field environment overrides.

use std::env;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

pub const CONFIG_PATH_ENV_VAR: &str = "AGENT_SESSION_CONFIG_PATH";

const MAX_ACTIVITIES_ENV: &str = "AGENT_SESSION_MAX_ACTIVITIES";
const OUTPUT_CAP_ENV: &str = "AGENT_SESSION_OUTPUT_CAP";
const MAX_HEAL_ATTEMPTS_ENV: &str = "AGENT_SESSION_MAX_HEAL_ATTEMPTS";
const ERROR_PREVIEW_ENV: &str = "AGENT_SESSION_ERROR_PREVIEW";
const STILL_WORKING_ENV: &str = "AGENT_SESSION_STILL_WORKING_MS";
const EXECUTE_LOCALLY_ENV: &str = "AGENT_SESSION_EXECUTE_LOCALLY";
const COMMAND_TIMEOUT_ENV: &str = "AGENT_SESSION_COMMAND_TIMEOUT_SEC";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields, rename_all = "camelCase")]
pub struct SessionConfig {
    /// Timeline entries kept per turn; the oldest are evicted beyond this.
    pub max_activities: usize,
    /// Characters of output retained per command.
    pub output_cap_chars: usize,
    pub max_heal_attempts: u32,
    /// Tail of captured output quoted in corrective prompts.
    pub error_preview_chars: usize,
    pub still_working_after_ms: u64,
    pub execute_actions_locally: bool,
    pub command_timeout_sec: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_activities: 500,
            output_cap_chars: 20_000,
            max_heal_attempts: 5,
            error_preview_chars: 2_000,
            still_working_after_ms: 30_000,
            execute_actions_locally: true,
            command_timeout_sec: 120,
        }
    }
}

impl SessionConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::io(path, source))?;
        let config: Self =
            serde_json::from_str(&raw).map_err(|source| ConfigError::json(path, source))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = match env_string_opt(CONFIG_PATH_ENV_VAR) {
            Some(path) => Self::from_json_file(path)?,
            None => Self::default(),
        };

        override_from_env(MAX_ACTIVITIES_ENV, "maxActivities", &mut config.max_activities)?;
        override_from_env(OUTPUT_CAP_ENV, "outputCapChars", &mut config.output_cap_chars)?;
        override_from_env(
            MAX_HEAL_ATTEMPTS_ENV,
            "maxHealAttempts",
            &mut config.max_heal_attempts,
        )?;
        override_from_env(
            ERROR_PREVIEW_ENV,
            "errorPreviewChars",
            &mut config.error_preview_chars,
        )?;
        override_from_env(
            STILL_WORKING_ENV,
            "stillWorkingAfterMs",
            &mut config.still_working_after_ms,
        )?;
        override_from_env(
            COMMAND_TIMEOUT_ENV,
            "commandTimeoutSec",
            &mut config.command_timeout_sec,
        )?;
        if let Some(flag) = env_flag_opt(EXECUTE_LOCALLY_ENV) {
            config.execute_actions_locally = flag;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits: [(&'static str, u64); 5] = [
            ("maxActivities", self.max_activities as u64),
            ("outputCapChars", self.output_cap_chars as u64),
            ("maxHealAttempts", u64::from(self.max_heal_attempts)),
            ("errorPreviewChars", self.error_preview_chars as u64),
            ("commandTimeoutSec", self.command_timeout_sec),
        ];
        for (field, value) in limits {
            if value == 0 {
                return Err(ConfigError::invalid(field, "must be greater than zero"));
            }
        }
        Ok(())
    }
}

fn override_from_env<T: FromStr>(
    key: &str,
    field: &'static str,
    slot: &mut T,
) -> Result<(), ConfigError> {
    let Some(raw) = env_string_opt(key) else {
        return Ok(());
    };
    *slot = raw
        .trim()
        .parse()
        .map_err(|_| ConfigError::invalid(field, format!("{key}={raw} is not a number")))?;
    Ok(())
}

fn env_flag_opt(key: &str) -> Option<bool> {
    env_string_opt(key).map(|value| matches!(value.trim(), "1" | "true" | "yes"))
}

fn env_string_opt(key: &str) -> Option<String> {
    env::var(key).ok().and_then(|value| {
        if value.trim().is_empty() {
            None
        } else {
            Some(value)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::{Mutex, OnceLock};

    struct EnvGuard {
        key: &'static str,
        previous: Option<String>,
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            if let Some(value) = &self.previous {
                env::set_var(self.key, value);
            } else {
                env::remove_var(self.key);
            }
        }
    }

    fn env_lock() -> std::sync::MutexGuard<'static, ()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
            .lock()
            .expect("env lock poisoned")
    }

    fn set_env_guard(key: &'static str, value: Option<&str>) -> EnvGuard {
        let previous = env::var(key).ok();
        if let Some(value) = value {
            env::set_var(key, value);
        } else {
            env::remove_var(key);
        }
        EnvGuard { key, previous }
    }

    fn clear_all() -> Vec<EnvGuard> {
        [
            CONFIG_PATH_ENV_VAR,
            MAX_ACTIVITIES_ENV,
            OUTPUT_CAP_ENV,
            MAX_HEAL_ATTEMPTS_ENV,
            ERROR_PREVIEW_ENV,
            STILL_WORKING_ENV,
            EXECUTE_LOCALLY_ENV,
            COMMAND_TIMEOUT_ENV,
        ]
        .into_iter()
        .map(|key| set_env_guard(key, None))
        .collect()
    }

    #[test]
    fn env_defaults_match_documented_limits() {
        let _lock = env_lock();
        let _guards = clear_all();

        let config = SessionConfig::from_env().expect("defaults are valid");
        assert_eq!(config, SessionConfig::default());
        assert_eq!(config.max_activities, 500);
        assert_eq!(config.output_cap_chars, 20_000);
        assert_eq!(config.max_heal_attempts, 5);
        assert!(config.execute_actions_locally);
    }

    #[test]
    fn env_overrides_apply_per_field() {
        let _lock = env_lock();
        let _guards = clear_all();
        let _g1 = set_env_guard(MAX_HEAL_ATTEMPTS_ENV, Some("3"));
        let _g2 = set_env_guard(OUTPUT_CAP_ENV, Some(" 64 "));
        let _g3 = set_env_guard(EXECUTE_LOCALLY_ENV, Some("0"));

        let config = SessionConfig::from_env().expect("overrides are valid");
        assert_eq!(config.max_heal_attempts, 3);
        assert_eq!(config.output_cap_chars, 64);
        assert!(!config.execute_actions_locally);
    }

    #[test]
    fn non_numeric_override_is_rejected() {
        let _lock = env_lock();
        let _guards = clear_all();
        let _g = set_env_guard(MAX_ACTIVITIES_ENV, Some("lots"));

        assert_matches!(
            SessionConfig::from_env(),
            Err(ConfigError::Invalid {
                field: "maxActivities",
                ..
            })
        );
    }

    #[test]
    fn json_file_fills_missing_fields_with_defaults() {
        let _lock = env_lock();
        let _guards = clear_all();
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        fs::write(&path, r#"{ "maxHealAttempts": 2, "stillWorkingAfterMs": 5 }"#)
            .expect("write config");
        let _g = set_env_guard(CONFIG_PATH_ENV_VAR, path.to_str());

        let config = SessionConfig::from_env().expect("file config loads");
        assert_eq!(config.max_heal_attempts, 2);
        assert_eq!(config.still_working_after_ms, 5);
        assert_eq!(config.max_activities, 500);
    }

    #[test]
    fn json_file_rejects_unknown_fields() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("session.json");
        fs::write(&path, r#"{ "maxActivites": 10 }"#).expect("write config");

        assert_matches!(
            SessionConfig::from_json_file(&path),
            Err(ConfigError::Json { .. })
        );
    }

    #[test]
    fn zero_limits_fail_validation() {
        let config = SessionConfig {
            output_cap_chars: 0,
            ..SessionConfig::default()
        };
        assert_matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "outputCapChars",
                ..
            })
        );
    }
}
