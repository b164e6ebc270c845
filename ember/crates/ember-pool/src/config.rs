//! Pool configuration.
//!
//! Sizing defaults scale with the host: zero means "pick for me"
//! (CPU count × 2 initial interpreters, × 8 cap). Most parameters have
//! sensible defaults; `validate()` catches the combinations that can't
//! work before any thread is spawned.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::PoolError;

/// Security policy applied by the pool around VM acquisition and
/// release.
///
/// # Examples
///
/// ```
/// use ember_pool::SecurityConfig;
///
/// let security = SecurityConfig {
///     clear_globals_on_release: true,
///     ..Default::default()
/// };
/// assert_eq!(security.max_vms_per_thread, 0);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// Wipe script-visible VM state (globals, modules, stack) when an
    /// interpreter is released back to the pool.
    pub clear_globals_on_release: bool,

    /// Maximum interpreters one OS thread may hold at once; 0 means
    /// unlimited.
    pub max_vms_per_thread: usize,

    /// Sliding window for request rate limiting.
    pub rate_limit_window: Duration,

    /// Maximum acquisitions inside one window; 0 disables rate
    /// limiting.
    pub rate_limit_max_requests: usize,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            clear_globals_on_release: false,
            max_vms_per_thread: 0,
            rate_limit_window: Duration::from_secs(1),
            rate_limit_max_requests: 0,
        }
    }
}

/// Configuration for a [`crate::VmPool`].
///
/// # Examples
///
/// ```
/// use ember_pool::PoolConfig;
///
/// // Defaults size to the host CPU count.
/// let config = PoolConfig::default();
/// assert!(config.validate().is_ok());
///
/// // Explicit small pool for tests.
/// let config = PoolConfig {
///     initial_vm_count: 1,
///     max_vm_count: 4,
///     ..Default::default()
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Interpreters created by `start()`; 0 ⇒ CPU count × 2.
    pub initial_vm_count: usize,

    /// Hard cap on interpreters; 0 ⇒ CPU count × 8.
    pub max_vm_count: usize,

    /// Idle entries older than this are eligible for teardown during
    /// maintenance.
    pub vm_idle_timeout: Duration,

    /// Reuse released interpreters. When false every release tears the
    /// instance down and the next acquisition builds a fresh one.
    pub enable_vm_reuse: bool,

    /// Consult and fill the bytecode cache around script execution.
    pub enable_bytecode_caching: bool,

    /// Start the filesystem watcher when `enable_hot_reload()` is
    /// called.
    pub enable_hot_reload: bool,

    /// Maximum cached scripts (≥ 1).
    pub max_script_cache_size: usize,

    /// Cached entries older than this are treated as stale.
    pub script_cache_ttl: Duration,

    /// Worker threads serving `submit`; 0 ⇒ CPU count.
    pub worker_threads: usize,

    /// Security policy.
    pub security: SecurityConfig,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_vm_count: 0,
            max_vm_count: 0,
            vm_idle_timeout: Duration::from_secs(300),
            enable_vm_reuse: true,
            enable_bytecode_caching: true,
            enable_hot_reload: false,
            max_script_cache_size: 128,
            script_cache_ttl: Duration::from_secs(3600),
            worker_threads: 0,
            security: SecurityConfig::default(),
        }
    }
}

impl PoolConfig {
    /// Checks parameter sanity (after default resolution).
    pub fn validate(&self) -> Result<(), PoolError> {
        let resolved = self.resolved();
        if resolved.max_vm_count == 0 {
            return Err(PoolError::InvalidConfig(
                "max_vm_count resolved to zero".to_string(),
            ));
        }
        if resolved.initial_vm_count > resolved.max_vm_count {
            return Err(PoolError::InvalidConfig(format!(
                "initial_vm_count ({}) exceeds max_vm_count ({})",
                resolved.initial_vm_count, resolved.max_vm_count
            )));
        }
        if resolved.max_script_cache_size == 0 {
            return Err(PoolError::InvalidConfig(
                "max_script_cache_size must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// A copy with the 0-means-default fields filled in from the host
    /// CPU count.
    pub fn resolved(&self) -> PoolConfig {
        let cpus = num_cpus::get().max(1);
        let mut resolved = self.clone();
        if resolved.initial_vm_count == 0 {
            resolved.initial_vm_count = cpus * 2;
        }
        if resolved.max_vm_count == 0 {
            resolved.max_vm_count = cpus * 8;
        }
        if resolved.worker_threads == 0 {
            resolved.worker_threads = cpus;
        }
        resolved
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_resolve_from_cpu_count() {
        let resolved = PoolConfig::default().resolved();
        assert!(resolved.initial_vm_count >= 2);
        assert!(resolved.max_vm_count >= resolved.initial_vm_count);
        assert!(resolved.worker_threads >= 1);
    }

    #[test]
    fn test_initial_above_max_is_invalid() {
        let config = PoolConfig {
            initial_vm_count: 10,
            max_vm_count: 4,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_cache_size_is_invalid() {
        let config = PoolConfig {
            max_script_cache_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_config_round_trips_through_json() {
        let config = PoolConfig {
            initial_vm_count: 2,
            max_vm_count: 8,
            ..Default::default()
        };
        let json = serde_json::to_string(&config).unwrap();
        let back: PoolConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.initial_vm_count, 2);
        assert_eq!(back.max_vm_count, 8);
    }
}
