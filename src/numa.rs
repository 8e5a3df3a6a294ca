//! NUMA awareness: a global policy applied at pool kickoff.
//!
//! Grounded on the original library's `lm_ggml_numa_init` and
//! `struct lm_ggml_numa_nodes`. Topology discovery is Linux-only and
//! best-effort: a failure to read `/sys` never propagates past this module
//! (§7) — it just leaves NUMA awareness disabled, the same behavior as the
//! original falling back to a single implicit node.

use std::sync::OnceLock;

use thiserror::Error;

/// How the pool should place worker threads relative to NUMA nodes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NumaStrategy {
    #[default]
    Disabled,
    /// Spread workers round-robin across nodes.
    Distribute,
    /// Pin each worker's memory allocation to its own node (affinity only;
    /// this crate does not intercept allocation, §1 Non-goals).
    Isolate,
    /// Trust an externally configured `numactl`/cgroup affinity; this crate
    /// only records that NUMA awareness is active, it does not compute a
    /// mask itself.
    Numactl,
    /// Treat all nodes as one for allocation purposes but still avoid
    /// migrating a worker across nodes mid-run.
    Mirror,
}

#[derive(Debug, Error)]
pub enum NumaError {
    #[error("failed to read NUMA topology from {path}: {source}")]
    Topology { path: String, #[source] source: std::io::Error },
    #[error("no NUMA nodes discovered")]
    NoNodes,
}

#[derive(Debug, Clone)]
pub struct NumaNode {
    pub cpus: Vec<usize>,
}

#[derive(Debug, Clone, Default)]
pub struct NumaTopology {
    pub nodes: Vec<NumaNode>,
    pub strategy: NumaStrategy,
}

impl NumaTopology {
    pub fn is_numa(&self) -> bool {
        self.strategy != NumaStrategy::Disabled && self.nodes.len() > 1
    }
}

static TOPOLOGY: OnceLock<NumaTopology> = OnceLock::new();

/// Idempotently discovers NUMA topology and records `strategy` as the
/// active policy. Safe to call from multiple threads; only the first call
/// does any work.
pub fn numa_init(strategy: NumaStrategy) -> &'static NumaTopology {
    TOPOLOGY.get_or_init(|| match strategy {
        NumaStrategy::Disabled => NumaTopology { nodes: Vec::new(), strategy },
        _ => discover(strategy).unwrap_or_else(|err| {
            log::warn!("NUMA discovery failed, disabling NUMA awareness: {err}");
            NumaTopology { nodes: Vec::new(), strategy: NumaStrategy::Disabled }
        }),
    })
}

/// Returns the topology recorded by the first [`numa_init`] call, if any.
pub fn topology() -> Option<&'static NumaTopology> {
    TOPOLOGY.get()
}

#[cfg(target_os = "linux")]
fn discover(strategy: NumaStrategy) -> Result<NumaTopology, NumaError> {
    use std::fs;

    let base = "/sys/devices/system/node";
    let entries = fs::read_dir(base).map_err(|e| NumaError::Topology { path: base.to_string(), source: e })?;

    let mut nodes = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        if !name.starts_with("node") {
            continue;
        }
        let cpulist_path = entry.path().join("cpulist");
        if let Ok(contents) = fs::read_to_string(&cpulist_path) {
            nodes.push(NumaNode { cpus: parse_cpu_list(contents.trim()) });
        }
    }

    if nodes.is_empty() {
        return Err(NumaError::NoNodes);
    }
    Ok(NumaTopology { nodes, strategy })
}

#[cfg(not(target_os = "linux"))]
fn discover(_strategy: NumaStrategy) -> Result<NumaTopology, NumaError> {
    Err(NumaError::NoNodes)
}

/// Parses the kernel's `cpulist` format: comma-separated ranges, e.g.
/// `"0-3,8,10-11"`.
fn parse_cpu_list(s: &str) -> Vec<usize> {
    let mut cpus = Vec::new();
    if s.is_empty() {
        return cpus;
    }
    for part in s.split(',') {
        if let Some((lo, hi)) = part.split_once('-') {
            if let (Ok(lo), Ok(hi)) = (lo.parse::<usize>(), hi.parse::<usize>()) {
                cpus.extend(lo..=hi);
            }
        } else if let Ok(v) = part.parse::<usize>() {
            cpus.push(v);
        }
    }
    cpus
}
