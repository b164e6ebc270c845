//! GC configuration.
//!
//! Tuning parameters for the collector. Most embedders use the defaults;
//! tests use `stress` to force a collection at every allocation point,
//! which is the fastest way to surface a missing root.

/// Configuration for the tracing collector.
///
/// # Examples
///
/// ```
/// use ember_vm::gc::GcConfig;
///
/// // Defaults
/// let config = GcConfig::default();
/// assert!(config.validate().is_ok());
///
/// // Stress mode for tests
/// let config = GcConfig {
///     stress: true,
///     ..Default::default()
/// };
/// ```
#[derive(Debug, Clone)]
pub struct GcConfig {
    /// Heap growth before the first collection, in bytes.
    ///
    /// Default: 1 MiB.
    pub initial_next_gc: usize,

    /// After a collection, the next trigger is the live set times this
    /// factor.
    ///
    /// Default: 2.0. Must be greater than 1.0.
    pub heap_grow_factor: f64,

    /// Collect at every allocation point. Slow; for tests.
    pub stress: bool,

    /// Log a line per collection via the `log` facade.
    pub log: bool,
}

impl Default for GcConfig {
    fn default() -> Self {
        Self {
            initial_next_gc: 1024 * 1024,
            heap_grow_factor: 2.0,
            stress: false,
            log: false,
        }
    }
}

impl GcConfig {
    /// Checks parameter sanity.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_next_gc == 0 {
            return Err("initial_next_gc must be non-zero".to_string());
        }
        if !(self.heap_grow_factor > 1.0) {
            return Err(format!(
                "heap_grow_factor must be greater than 1.0, got {}",
                self.heap_grow_factor
            ));
        }
        Ok(())
    }
}
