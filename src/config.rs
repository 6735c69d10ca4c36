//! Runtime configuration loading from environment variables.
//!
//! All configuration values are loaded from `GG_CTRL_*` environment variables
//! with sensible defaults. Invalid values fall back to defaults without crashing.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `GG_CTRL_GPU_PROBE_TTL_S` | 5 | GPU inventory cache TTL (seconds) |
//! | `GG_CTRL_HTTP_TIMEOUT_S` | 30 | Outbound HTTP client timeout (seconds) |
//! | `GG_CTRL_STATE_FILE` | `state/scheduler.json` | Scheduler state persistence path |
//! | `GG_CTRL_MIN_PRIORITY_GAP` | 1 | Minimum preemptor/victim priority gap |
//! | `GG_CTRL_MAX_PREEMPTIONS_PER_HOUR` | 10 | Preemption rate limit |
//! | `GG_CTRL_RECOVERY_CHECK_INTERVAL_S` | 60 | Recovery sweep interval |
//! | `GG_CTRL_MAX_RECOVERY_ATTEMPTS` | 3 | Hourly recovery attempt budget per model |
//! | `GG_CTRL_MIN_RECOVERY_INTERVAL_S` | 30 | Recovery backoff floor |
//! | `GG_CTRL_MAX_RECOVERY_INTERVAL_S` | 300 | Recovery backoff ceiling |
//! | `GG_CTRL_FAILURE_DETECTION_TIMEOUT_S` | 120 | Stuck-running detection window |
//! | `GG_CTRL_SHUTDOWN_TIMEOUT_S` | 30 | Graceful shutdown drain timeout |
//! | `GG_CTRL_LISTEN_ADDR` | `0.0.0.0:8080` | Router HTTP listen address |
//! | `GG_CTRL_POLICY_FILE` | (unset) | TOML file with `SchedulerPolicy` field overrides |
//!
//! `GG_CTRL_POLICY_FILE`, if set, is read first and its fields layered over
//! the defaults; individual `GG_CTRL_*` policy env vars then override
//! whatever the file set, so a deploy manifest can ship coarse tuning while
//! an operator still overrides a single field at the environment layer.

use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::scheduler::SchedulerPolicy;

/// Partial `SchedulerPolicy` as read from a TOML deploy manifest - every
/// field optional, unset fields leave the default (or env-supplied) value
/// untouched.
#[derive(Debug, Default, Deserialize)]
struct PolicyFileOverrides {
    min_priority_gap: Option<u8>,
    max_preemptions_per_hour: Option<u32>,
    recovery_check_interval_s: Option<u64>,
    max_recovery_attempts: Option<u32>,
    min_recovery_interval_s: Option<u64>,
    max_recovery_interval_s: Option<u64>,
    recovery_backoff_factor: Option<f64>,
    failure_detection_timeout_s: Option<u64>,
    decision_history_size: Option<usize>,
    recovery_history_size: Option<usize>,
}

/// Read and parse `GG_CTRL_POLICY_FILE` if set. Missing file, unreadable
/// file, or malformed TOML are all treated as "no overrides" - a bad manifest
/// must never prevent boot.
fn load_policy_file() -> PolicyFileOverrides {
    let Ok(path) = std::env::var("GG_CTRL_POLICY_FILE") else {
        return PolicyFileOverrides::default();
    };
    match std::fs::read_to_string(&path) {
        Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
            tracing::warn!(path = %path, error = %e, "ignoring malformed policy file");
            PolicyFileOverrides::default()
        }),
        Err(e) => {
            tracing::warn!(path = %path, error = %e, "policy file not readable, ignoring");
            PolicyFileOverrides::default()
        }
    }
}

/// Effective runtime configuration summary (serializable).
#[derive(Debug, Clone)]
pub struct EffectiveConfig {
    pub gpu_probe_ttl_s: u64,
    pub http_timeout_s: u64,
    pub state_file: PathBuf,
    pub shutdown_timeout_secs: u64,
    pub listen_addr: String,
    pub policy: SchedulerPolicy,
}

/// All runtime configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct EnvConfig {
    pub gpu_probe_ttl: Duration,
    pub http_timeout: Duration,
    pub state_file: PathBuf,
    pub shutdown_timeout: Duration,
    pub listen_addr: String,
    pub policy: SchedulerPolicy,
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse an `f64` env var, returning `default` on missing or invalid.
fn parse_f64(key: &str, default: f64) -> f64 {
    match std::env::var(key) {
        Ok(val) => val.parse::<f64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Load scheduler policy tunables: defaults, layered with `GG_CTRL_POLICY_FILE`
/// (if set), layered with individual `GG_CTRL_*` env vars (highest precedence).
fn load_policy() -> SchedulerPolicy {
    let default = SchedulerPolicy::default();
    let file = load_policy_file();
    let base = SchedulerPolicy {
        min_priority_gap: file.min_priority_gap.unwrap_or(default.min_priority_gap),
        max_preemptions_per_hour: file.max_preemptions_per_hour.unwrap_or(default.max_preemptions_per_hour),
        recovery_check_interval_s: file.recovery_check_interval_s.unwrap_or(default.recovery_check_interval_s),
        max_recovery_attempts: file.max_recovery_attempts.unwrap_or(default.max_recovery_attempts),
        min_recovery_interval_s: file.min_recovery_interval_s.unwrap_or(default.min_recovery_interval_s),
        max_recovery_interval_s: file.max_recovery_interval_s.unwrap_or(default.max_recovery_interval_s),
        recovery_backoff_factor: file.recovery_backoff_factor.unwrap_or(default.recovery_backoff_factor),
        failure_detection_timeout_s: file.failure_detection_timeout_s.unwrap_or(default.failure_detection_timeout_s),
        decision_history_size: file.decision_history_size.unwrap_or(default.decision_history_size),
        recovery_history_size: file.recovery_history_size.unwrap_or(default.recovery_history_size),
    };

    let min_recovery = parse_u64("GG_CTRL_MIN_RECOVERY_INTERVAL_S", base.min_recovery_interval_s).max(1);
    let max_recovery = parse_u64("GG_CTRL_MAX_RECOVERY_INTERVAL_S", base.max_recovery_interval_s).max(min_recovery);
    SchedulerPolicy {
        min_priority_gap: parse_u32("GG_CTRL_MIN_PRIORITY_GAP", base.min_priority_gap as u32) as u8,
        max_preemptions_per_hour: parse_u32("GG_CTRL_MAX_PREEMPTIONS_PER_HOUR", base.max_preemptions_per_hour),
        recovery_check_interval_s: parse_u64("GG_CTRL_RECOVERY_CHECK_INTERVAL_S", base.recovery_check_interval_s).max(1),
        max_recovery_attempts: parse_u32("GG_CTRL_MAX_RECOVERY_ATTEMPTS", base.max_recovery_attempts),
        min_recovery_interval_s: min_recovery,
        max_recovery_interval_s: max_recovery,
        recovery_backoff_factor: parse_f64("GG_CTRL_RECOVERY_BACKOFF_FACTOR", base.recovery_backoff_factor).max(1.0),
        failure_detection_timeout_s: parse_u64("GG_CTRL_FAILURE_DETECTION_TIMEOUT_S", base.failure_detection_timeout_s).max(1),
        decision_history_size: parse_usize("GG_CTRL_DECISION_HISTORY_SIZE", base.decision_history_size).max(1),
        recovery_history_size: parse_usize("GG_CTRL_RECOVERY_HISTORY_SIZE", base.recovery_history_size).max(1),
    }
}

/// Load all configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> EnvConfig {
    let gpu_probe_ttl_s = parse_u64("GG_CTRL_GPU_PROBE_TTL_S", 5).max(1);
    let http_timeout_s = parse_u64("GG_CTRL_HTTP_TIMEOUT_S", 30).max(1);
    let shutdown_secs = parse_u64("GG_CTRL_SHUTDOWN_TIMEOUT_S", 30).max(1);
    let state_file = std::env::var("GG_CTRL_STATE_FILE")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("state/scheduler.json"));
    let listen_addr = std::env::var("GG_CTRL_LISTEN_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());

    EnvConfig {
        gpu_probe_ttl: Duration::from_secs(gpu_probe_ttl_s),
        http_timeout: Duration::from_secs(http_timeout_s),
        state_file,
        shutdown_timeout: Duration::from_secs(shutdown_secs),
        listen_addr,
        policy: load_policy(),
    }
}

impl EnvConfig {
    /// Return a serializable summary of all effective values.
    pub fn effective_config(&self) -> EffectiveConfig {
        EffectiveConfig {
            gpu_probe_ttl_s: self.gpu_probe_ttl.as_secs(),
            http_timeout_s: self.http_timeout.as_secs(),
            state_file: self.state_file.clone(),
            shutdown_timeout_secs: self.shutdown_timeout.as_secs(),
            listen_addr: self.listen_addr.clone(),
            policy: self.policy.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Serialize env-mutating tests to avoid cross-test pollution.
    static ENV_LOCK: Mutex<()> = Mutex::new(());

    const ENV_KEYS: &[&str] = &[
        "GG_CTRL_GPU_PROBE_TTL_S",
        "GG_CTRL_HTTP_TIMEOUT_S",
        "GG_CTRL_STATE_FILE",
        "GG_CTRL_SHUTDOWN_TIMEOUT_S",
        "GG_CTRL_LISTEN_ADDR",
        "GG_CTRL_POLICY_FILE",
        "GG_CTRL_MIN_PRIORITY_GAP",
        "GG_CTRL_MAX_PREEMPTIONS_PER_HOUR",
        "GG_CTRL_RECOVERY_CHECK_INTERVAL_S",
        "GG_CTRL_MAX_RECOVERY_ATTEMPTS",
        "GG_CTRL_MIN_RECOVERY_INTERVAL_S",
        "GG_CTRL_MAX_RECOVERY_INTERVAL_S",
        "GG_CTRL_RECOVERY_BACKOFF_FACTOR",
        "GG_CTRL_FAILURE_DETECTION_TIMEOUT_S",
        "GG_CTRL_DECISION_HISTORY_SIZE",
        "GG_CTRL_RECOVERY_HISTORY_SIZE",
    ];

    fn clear_env_vars() {
        for k in ENV_KEYS {
            std::env::remove_var(k);
        }
    }

    #[test]
    fn defaults_are_sensible() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        assert_eq!(cfg.gpu_probe_ttl.as_secs(), 5);
        assert_eq!(cfg.http_timeout.as_secs(), 30);
        assert_eq!(cfg.shutdown_timeout.as_secs(), 30);
        assert_eq!(cfg.listen_addr, "0.0.0.0:8080");
        assert_eq!(cfg.policy, SchedulerPolicy::default());
        clear_env_vars();
    }

    #[test]
    fn env_vars_override_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_CTRL_GPU_PROBE_TTL_S", "10");
        std::env::set_var("GG_CTRL_MAX_PREEMPTIONS_PER_HOUR", "20");
        std::env::set_var("GG_CTRL_LISTEN_ADDR", "127.0.0.1:9000");
        let cfg = load();
        assert_eq!(cfg.gpu_probe_ttl.as_secs(), 10);
        assert_eq!(cfg.policy.max_preemptions_per_hour, 20);
        assert_eq!(cfg.listen_addr, "127.0.0.1:9000");
        clear_env_vars();
    }

    #[test]
    fn invalid_env_falls_back_to_default() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_CTRL_GPU_PROBE_TTL_S", "not_a_number");
        let cfg = load();
        assert_eq!(cfg.gpu_probe_ttl.as_secs(), 5);
        clear_env_vars();
    }

    #[test]
    fn recovery_interval_floor_is_enforced_against_min() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::set_var("GG_CTRL_MIN_RECOVERY_INTERVAL_S", "500");
        std::env::set_var("GG_CTRL_MAX_RECOVERY_INTERVAL_S", "100");
        let cfg = load();
        assert!(cfg.policy.max_recovery_interval_s >= cfg.policy.min_recovery_interval_s);
        clear_env_vars();
    }

    #[test]
    fn policy_file_overrides_defaults_but_env_wins() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        std::env::remove_var("GG_CTRL_POLICY_FILE");

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, "max_preemptions_per_hour = 42\nmin_priority_gap = 3\n").unwrap();
        std::env::set_var("GG_CTRL_POLICY_FILE", path.to_str().unwrap());
        std::env::set_var("GG_CTRL_MIN_PRIORITY_GAP", "7");

        let cfg = load();
        assert_eq!(cfg.policy.max_preemptions_per_hour, 42);
        assert_eq!(cfg.policy.min_priority_gap, 7);

        std::env::remove_var("GG_CTRL_POLICY_FILE");
        clear_env_vars();
    }

    #[test]
    fn malformed_policy_file_falls_back_to_defaults() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        std::fs::write(&path, "not valid toml {{{").unwrap();
        std::env::set_var("GG_CTRL_POLICY_FILE", path.to_str().unwrap());

        let cfg = load();
        assert_eq!(cfg.policy, SchedulerPolicy::default());

        std::env::remove_var("GG_CTRL_POLICY_FILE");
        clear_env_vars();
    }

    #[test]
    fn effective_config_contains_all_fields() {
        let _lock = ENV_LOCK.lock().unwrap();
        clear_env_vars();
        let cfg = load();
        let eff = cfg.effective_config();
        assert!(eff.gpu_probe_ttl_s > 0);
        assert!(eff.http_timeout_s > 0);
        assert!(eff.shutdown_timeout_secs > 0);
        assert!(!eff.listen_addr.is_empty());
    }
}
