//! Engine configuration.
//!
//! Every knob is read once when a [`crate::Screen`] is created and stays fixed for the lifetime of
//! the contexts created from it. Values come from `KILN_*` environment variables; tests use
//! [`EngineConfig::from_lookup`] so they never have to mutate the process environment.

use crate::error::{EngineError, EngineResult};

pub const DEFAULT_MAX_DRAWS_IN_FLIGHT: u32 = 256;
pub const DEFAULT_CLIENT_COPY_LIMIT: u64 = 8192;
/// Largest sample count the tile store path knows how to resolve.
pub const MAX_SAMPLE_COUNT: u32 = 16;

pub const ENV_MAX_DRAWS_IN_FLIGHT: &str = "KILN_MAX_DRAWS_IN_FLIGHT";
pub const ENV_CLIENT_COPY_LIMIT: &str = "KILN_CLIENT_COPY_LIMIT";
pub const ENV_MSAA_MAX_COUNT: &str = "KILN_MSAA_MAX_COUNT";
pub const ENV_MSAA_FORCE_ENABLE: &str = "KILN_MSAA_FORCE_ENABLE";
pub const ENV_SINGLE_THREADED: &str = "KILN_SINGLE_THREADED";
pub const ENV_MAX_WORKER_THREADS: &str = "KILN_MAX_WORKER_THREADS";
pub const ENV_MAX_THREADS_PER_CORE: &str = "KILN_MAX_THREADS_PER_CORE";
pub const ENV_HW_THREADS_PER_CORE: &str = "KILN_HW_THREADS_PER_CORE";
pub const ENV_MAX_NUMA_NODES: &str = "KILN_MAX_NUMA_NODES";

/// How the backend worker pool is laid out over the host.
///
/// The engine does not probe the CPU. The host is modeled as
/// `available_parallelism` hardware threads, grouped `hw_threads_per_core` to a
/// core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadTopology {
    /// Hard cap on worker threads. `0` means no cap.
    pub max_worker_threads: usize,
    /// Worker threads to place on each core. `0` means use every hardware thread.
    pub max_threads_per_core: u32,
    pub hw_threads_per_core: u32,
    /// Number of node groups workers are split into. `0` means a single group.
    pub max_numa_nodes: u32,
}

impl Default for ThreadTopology {
    fn default() -> Self {
        Self {
            max_worker_threads: 0,
            max_threads_per_core: 0,
            hw_threads_per_core: 1,
            max_numa_nodes: 0,
        }
    }
}

impl ThreadTopology {
    /// Number of workers to spawn on a host with `available` hardware threads.
    pub fn worker_count(&self, available: usize) -> usize {
        let hw_per_core = self.hw_threads_per_core.max(1) as usize;
        let cores = (available / hw_per_core).max(1);
        let per_core = match self.max_threads_per_core {
            0 => hw_per_core,
            n => (n as usize).min(hw_per_core),
        };

        let mut count = cores * per_core;
        if self.max_worker_threads > 0 {
            count = count.min(self.max_worker_threads);
        }
        count.max(1)
    }

    /// Node group a worker belongs to.
    pub fn node_of(&self, worker_index: usize, worker_count: usize) -> usize {
        let nodes = self.max_numa_nodes.max(1) as usize;
        if worker_count == 0 {
            return 0;
        }
        let per_node = worker_count.div_ceil(nodes).max(1);
        (worker_index / per_node).min(nodes - 1)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// Draws the backend may hold queued before the frontend blocks. Also the
    /// multiplier for scratch ring sizing.
    pub max_draws_in_flight: u32,
    pub topology: ThreadTopology,
    /// Execute all backend work inline on the frontend thread.
    pub single_threaded: bool,
    /// Client vertex data at or above this size is read in place by a blocking
    /// draw instead of being copied into scratch space.
    pub client_copy_limit: u64,
    pub msaa_max_samples: u32,
    /// Create render-target resources with `msaa_max_samples` samples and
    /// rasterize them multisampled even when not requested.
    pub msaa_force_enable: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_draws_in_flight: DEFAULT_MAX_DRAWS_IN_FLIGHT,
            topology: ThreadTopology::default(),
            single_threaded: false,
            client_copy_limit: DEFAULT_CLIENT_COPY_LIMIT,
            msaa_max_samples: 1,
            msaa_force_enable: false,
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> EngineResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a configuration from an arbitrary key lookup. Unset keys keep their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> EngineResult<Self> {
        let mut config = Self::default();

        if let Some(v) = parse_num::<u32>(&lookup, ENV_MAX_DRAWS_IN_FLIGHT)? {
            config.max_draws_in_flight = v;
        }
        if let Some(v) = parse_num::<u64>(&lookup, ENV_CLIENT_COPY_LIMIT)? {
            config.client_copy_limit = v;
        }
        if let Some(v) = parse_num::<u32>(&lookup, ENV_MSAA_MAX_COUNT)? {
            config.msaa_max_samples = v;
        }
        if let Some(v) = parse_flag(&lookup, ENV_MSAA_FORCE_ENABLE)? {
            config.msaa_force_enable = v;
        }
        if let Some(v) = parse_flag(&lookup, ENV_SINGLE_THREADED)? {
            config.single_threaded = v;
        }
        if let Some(v) = parse_num::<usize>(&lookup, ENV_MAX_WORKER_THREADS)? {
            config.topology.max_worker_threads = v;
        }
        if let Some(v) = parse_num::<u32>(&lookup, ENV_MAX_THREADS_PER_CORE)? {
            config.topology.max_threads_per_core = v;
        }
        if let Some(v) = parse_num::<u32>(&lookup, ENV_HW_THREADS_PER_CORE)? {
            config.topology.hw_threads_per_core = v;
        }
        if let Some(v) = parse_num::<u32>(&lookup, ENV_MAX_NUMA_NODES)? {
            config.topology.max_numa_nodes = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> EngineResult<()> {
        if self.max_draws_in_flight == 0 {
            return Err(EngineError::InvalidConfig {
                key: ENV_MAX_DRAWS_IN_FLIGHT,
                value: self.max_draws_in_flight.to_string(),
                reason: "must be at least 1",
            });
        }
        let samples = self.msaa_max_samples;
        if samples == 0 || !samples.is_power_of_two() || samples > MAX_SAMPLE_COUNT {
            return Err(EngineError::InvalidConfig {
                key: ENV_MSAA_MAX_COUNT,
                value: samples.to_string(),
                reason: "must be a power of two no larger than 16",
            });
        }
        if self.topology.hw_threads_per_core == 0 {
            return Err(EngineError::InvalidConfig {
                key: ENV_HW_THREADS_PER_CORE,
                value: "0".into(),
                reason: "must be at least 1",
            });
        }
        Ok(())
    }

    /// Worker threads the backend should spawn. `0` in single-threaded mode.
    pub fn worker_threads(&self) -> usize {
        if self.single_threaded {
            return 0;
        }
        let available = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        self.topology.worker_count(available)
    }
}

fn parse_num<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> EngineResult<Option<T>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }
    trimmed
        .parse::<T>()
        .map(Some)
        .map_err(|_| EngineError::InvalidConfig {
            key,
            value: raw.clone(),
            reason: "expected an unsigned integer",
        })
}

fn parse_flag(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &'static str,
) -> EngineResult<Option<bool>> {
    let Some(raw) = lookup(key) else {
        return Ok(None);
    };
    let v = raw.trim();
    if v.is_empty() {
        return Ok(None);
    }
    if v == "1"
        || v.eq_ignore_ascii_case("true")
        || v.eq_ignore_ascii_case("yes")
        || v.eq_ignore_ascii_case("on")
    {
        return Ok(Some(true));
    }
    if v == "0"
        || v.eq_ignore_ascii_case("false")
        || v.eq_ignore_ascii_case("no")
        || v.eq_ignore_ascii_case("off")
    {
        return Ok(Some(false));
    }
    Err(EngineError::InvalidConfig {
        key,
        value: raw.clone(),
        reason: "expected a boolean (1/0, true/false, yes/no, on/off)",
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn unset_keys_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn parses_every_knob() {
        let config = EngineConfig::from_lookup(lookup(&[
            (ENV_MAX_DRAWS_IN_FLIGHT, "2"),
            (ENV_CLIENT_COPY_LIMIT, " 4096 "),
            (ENV_MSAA_MAX_COUNT, "4"),
            (ENV_MSAA_FORCE_ENABLE, "on"),
            (ENV_SINGLE_THREADED, "YES"),
            (ENV_MAX_WORKER_THREADS, "3"),
            (ENV_MAX_THREADS_PER_CORE, "1"),
            (ENV_HW_THREADS_PER_CORE, "2"),
            (ENV_MAX_NUMA_NODES, "2"),
        ]))
        .unwrap();

        assert_eq!(config.max_draws_in_flight, 2);
        assert_eq!(config.client_copy_limit, 4096);
        assert_eq!(config.msaa_max_samples, 4);
        assert!(config.msaa_force_enable);
        assert!(config.single_threaded);
        assert_eq!(config.topology.max_worker_threads, 3);
        assert_eq!(config.worker_threads(), 0);
    }

    #[test]
    fn rejects_bad_values() {
        let err = EngineConfig::from_lookup(lookup(&[(ENV_MSAA_MAX_COUNT, "3")])).unwrap_err();
        assert!(matches!(
            err,
            EngineError::InvalidConfig {
                key: ENV_MSAA_MAX_COUNT,
                ..
            }
        ));

        let err = EngineConfig::from_lookup(lookup(&[(ENV_SINGLE_THREADED, "maybe")])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));

        let err = EngineConfig::from_lookup(lookup(&[(ENV_MAX_DRAWS_IN_FLIGHT, "0")])).unwrap_err();
        assert!(matches!(err, EngineError::InvalidConfig { .. }));
    }

    #[test]
    fn topology_limits_workers() {
        let topo = ThreadTopology {
            max_worker_threads: 0,
            max_threads_per_core: 1,
            hw_threads_per_core: 2,
            max_numa_nodes: 2,
        };
        // 16 hardware threads, 8 cores, one worker each.
        assert_eq!(topo.worker_count(16), 8);
        assert_eq!(topo.node_of(0, 8), 0);
        assert_eq!(topo.node_of(3, 8), 0);
        assert_eq!(topo.node_of(4, 8), 1);
        assert_eq!(topo.node_of(7, 8), 1);

        let capped = ThreadTopology {
            max_worker_threads: 3,
            ..ThreadTopology::default()
        };
        assert_eq!(capped.worker_count(16), 3);
        assert_eq!(ThreadTopology::default().worker_count(0), 1);
    }
}
