//! # NUMA Topology
//!
//! Resolves NUMA nodes to the CPUs that belong to them.
//!
//! The OS query sits behind [`TopologySource`] so the cache in
//! [`NodeCpuTopology`] can be exercised without real hardware. The
//! production source, [`SysfsTopology`], reads
//! `/sys/devices/system/node/nodeN/cpulist` on Linux and reports
//! [`NumaError::NumaUnavailable`] everywhere else.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use super::{NumaError, NumaNodeId};

/// Default sysfs directory holding one `nodeN` entry per NUMA node.
pub const SYSFS_NODE_ROOT: &str = "/sys/devices/system/node";

/// Immutable set of CPU ids belonging to one NUMA node.
///
/// Sorted and de-duplicated. Cloning shares the underlying slice.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct CpuSet(Arc<[usize]>);

impl CpuSet {
    /// Build a set from any list of CPU ids.
    #[must_use]
    pub fn from_cpus(mut cpus: Vec<usize>) -> Self {
        cpus.sort_unstable();
        cpus.dedup();
        Self(cpus.into())
    }

    /// The CPU ids, ascending.
    #[must_use]
    pub fn cpus(&self) -> &[usize] {
        &self.0
    }

    /// Number of CPUs in the set.
    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// Returns true if the set has no CPUs.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Returns true if `cpu` is in the set.
    #[must_use]
    pub fn contains(&self, cpu: usize) -> bool {
        self.0.binary_search(&cpu).is_ok()
    }

    /// Iterate the CPU ids.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.0.iter().copied()
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.0.iter()).finish()
    }
}

impl fmt::Display for CpuSet {
    /// Formats in the kernel's range-list form, e.g. `0-3,8-11`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        let mut cpus = self.0.iter().copied().peekable();
        while let Some(start) = cpus.next() {
            let mut end = start;
            while cpus.peek() == Some(&(end + 1)) {
                end += 1;
                cpus.next();
            }
            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}

/// The OS-level node to CPU query.
pub trait TopologySource: Send + Sync {
    /// Whether the OS exposes NUMA information at all.
    fn numa_available(&self) -> bool;

    /// List the CPUs that belong to `node`.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::NumaQueryFailed`] if the node cannot be queried.
    fn node_to_cpus(&self, node: NumaNodeId) -> Result<Vec<usize>, NumaError>;

    /// List the nodes the OS reports, ascending.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::NumaUnavailable`] if NUMA is not supported.
    fn online_nodes(&self) -> Result<Vec<NumaNodeId>, NumaError>;
}

/// Reads topology from the Linux sysfs node directory.
#[derive(Debug, Clone)]
pub struct SysfsTopology {
    root: PathBuf,
}

impl SysfsTopology {
    /// Source backed by [`SYSFS_NODE_ROOT`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_root(SYSFS_NODE_ROOT)
    }

    /// Source backed by an arbitrary directory laid out like sysfs.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The directory this source reads.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }
}

impl Default for SysfsTopology {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologySource for SysfsTopology {
    fn numa_available(&self) -> bool {
        cfg!(target_os = "linux") && self.root.is_dir()
    }

    fn node_to_cpus(&self, node: NumaNodeId) -> Result<Vec<usize>, NumaError> {
        let path = self.root.join(format!("node{node}")).join("cpulist");
        let cpulist = fs::read_to_string(&path).map_err(|e| NumaError::NumaQueryFailed {
            node,
            reason: format!("{}: {e}", path.display()),
        })?;
        parse_cpulist(cpulist.trim()).map_err(|reason| NumaError::NumaQueryFailed { node, reason })
    }

    fn online_nodes(&self) -> Result<Vec<NumaNodeId>, NumaError> {
        if !self.numa_available() {
            return Err(NumaError::NumaUnavailable);
        }

        let mut nodes = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let name = entry?.file_name();
            let name = name.to_string_lossy();
            if let Some(id) = name.strip_prefix("node").and_then(|n| n.parse::<u16>().ok()) {
                nodes.push(NumaNodeId::new(id));
            }
        }
        nodes.sort_unstable();
        Ok(nodes)
    }
}

/// Parse a CPU list string like `0-7,16-23`.
///
/// An empty string parses to an empty list.
///
/// # Errors
///
/// Returns a description of the first malformed entry.
pub fn parse_cpulist(s: &str) -> Result<Vec<usize>, String> {
    let mut cpus = Vec::new();

    for part in s.split(',') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }

        if let Some((start, end)) = part.split_once('-') {
            let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) else {
                return Err(format!("malformed cpu range '{part}'"));
            };
            if start > end {
                return Err(format!("descending cpu range '{part}'"));
            }
            cpus.extend(start..=end);
        } else {
            let cpu = part
                .parse::<usize>()
                .map_err(|_| format!("malformed cpu id '{part}'"))?;
            cpus.push(cpu);
        }
    }

    Ok(cpus)
}

/// Per-node CPU sets, resolved lazily and cached for the owner's lifetime.
///
/// One mutex guards the cache and is held across the OS query, so each
/// node is queried at most once even when several threads resolve it
/// concurrently.
pub struct NodeCpuTopology<S = SysfsTopology> {
    source: S,
    cache: Mutex<HashMap<NumaNodeId, CpuSet>>,
}

impl NodeCpuTopology<SysfsTopology> {
    /// The process-wide topology backed by sysfs.
    pub fn global() -> &'static Self {
        static GLOBAL: OnceLock<NodeCpuTopology<SysfsTopology>> = OnceLock::new();
        GLOBAL.get_or_init(|| Self::new(SysfsTopology::new()))
    }
}

impl<S: TopologySource> NodeCpuTopology<S> {
    /// Create an empty cache over `source`.
    pub fn new(source: S) -> Self {
        Self {
            source,
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Resolve the CPUs for `node`, querying the OS on first use.
    ///
    /// # Errors
    ///
    /// Returns [`NumaError::NumaUnavailable`] if the OS has no NUMA support,
    /// or [`NumaError::NumaQueryFailed`] if the query fails or reports no CPUs.
    /// Failures are not cached.
    pub fn cpus_for_node(&self, node: NumaNodeId) -> Result<CpuSet, NumaError> {
        let mut cache = self.cache.lock();
        if let Some(set) = cache.get(&node) {
            return Ok(set.clone());
        }

        if !self.source.numa_available() {
            return Err(NumaError::NumaUnavailable);
        }

        let set = CpuSet::from_cpus(self.source.node_to_cpus(node)?);
        if set.is_empty() {
            return Err(NumaError::NumaQueryFailed {
                node,
                reason: "node has no CPUs".to_string(),
            });
        }

        tracing::debug!(%node, cpus = %set, "resolved NUMA node CPU set");
        cache.insert(node, set.clone());
        Ok(set)
    }

    /// Number of nodes the OS reports, or 0 when NUMA is unavailable.
    #[must_use]
    pub fn node_count(&self) -> usize {
        self.source.online_nodes().map_or(0, |nodes| nodes.len())
    }

    /// Returns true if the system has more than one NUMA node.
    #[must_use]
    pub fn is_numa(&self) -> bool {
        self.node_count() > 1
    }

    /// Access the underlying source.
    pub fn source(&self) -> &S {
        &self.source
    }

    /// One-line description of every node and its CPUs.
    #[must_use]
    pub fn summary(&self) -> String {
        let Ok(nodes) = self.source.online_nodes() else {
            return "NUMA unavailable".to_string();
        };

        let parts: Vec<String> = nodes
            .into_iter()
            .map(|node| match self.cpus_for_node(node) {
                Ok(set) => format!("node{node}: cpus {set}"),
                Err(e) => format!("node{node}: {e}"),
            })
            .collect();
        format!("{} NUMA node(s); {}", parts.len(), parts.join("; "))
    }

    /// Log the detected topology.
    pub fn log_topology(&self) {
        tracing::info!(
            logical_cpus = num_cpus::get(),
            physical_cpus = num_cpus::get_physical(),
            "NUMA topology: {}",
            self.summary()
        );
    }
}

impl<S> fmt::Debug for NodeCpuTopology<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NodeCpuTopology")
            .field("cached_nodes", &self.cache.lock().len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    /// Fake source that counts how often each query runs.
    struct SpySource {
        available: bool,
        calls: AtomicUsize,
    }

    impl SpySource {
        fn new(available: bool) -> Self {
            Self {
                available,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TopologySource for SpySource {
        fn numa_available(&self) -> bool {
            self.available
        }

        fn node_to_cpus(&self, node: NumaNodeId) -> Result<Vec<usize>, NumaError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match node.get() {
                0 => Ok(vec![3, 1, 2, 0, 1]),
                1 => Ok(vec![4, 5, 6, 7]),
                2 => Ok(Vec::new()),
                _ => Err(NumaError::NumaQueryFailed {
                    node,
                    reason: "no such node".to_string(),
                }),
            }
        }

        fn online_nodes(&self) -> Result<Vec<NumaNodeId>, NumaError> {
            Ok(vec![NumaNodeId::new(0), NumaNodeId::new(1)])
        }
    }

    fn write_node(root: &Path, node: u16, cpulist: &str) {
        let dir = root.join(format!("node{node}"));
        fs::create_dir_all(&dir).unwrap();
        fs::write(dir.join("cpulist"), cpulist).unwrap();
    }

    #[test]
    fn test_parse_cpulist() {
        assert_eq!(parse_cpulist("0-3").unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpulist("0,2,4").unwrap(), vec![0, 2, 4]);
        assert_eq!(parse_cpulist("0-1,4-5").unwrap(), vec![0, 1, 4, 5]);
        assert_eq!(parse_cpulist("0-3,8-11").unwrap(), vec![0, 1, 2, 3, 8, 9, 10, 11]);
        assert!(parse_cpulist("").unwrap().is_empty());
    }

    #[test]
    fn test_parse_cpulist_rejects_garbage() {
        assert!(parse_cpulist("a-b").is_err());
        assert!(parse_cpulist("7-3").is_err());
        assert!(parse_cpulist("1,x").is_err());
    }

    #[test]
    fn test_cpuset_sorted_and_displayed() {
        let set = CpuSet::from_cpus(vec![9, 0, 1, 2, 8, 2, 11]);
        assert_eq!(set.cpus(), &[0, 1, 2, 8, 9, 11]);
        assert!(set.contains(8));
        assert!(!set.contains(10));
        assert_eq!(set.to_string(), "0-2,8-9,11");
    }

    #[test]
    fn test_cpus_for_node_is_idempotent() {
        let topo = NodeCpuTopology::new(SpySource::new(true));
        let node = NumaNodeId::new(0);

        let first = topo.cpus_for_node(node).unwrap();
        let second = topo.cpus_for_node(node).unwrap();

        assert_eq!(first, second);
        assert_eq!(first.cpus(), &[0, 1, 2, 3]);
        assert_eq!(topo.source().calls.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_concurrent_first_resolution() {
        let topo = NodeCpuTopology::new(SpySource::new(true));

        thread::scope(|s| {
            for i in 0..16u16 {
                let topo = &topo;
                s.spawn(move || {
                    let node = NumaNodeId::new(i % 2);
                    let set = topo.cpus_for_node(node).unwrap();
                    assert_eq!(set.len(), 4);
                });
            }
        });

        // One query per node, no matter how many threads raced
        assert_eq!(topo.source().calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unavailable_is_reported() {
        let topo = NodeCpuTopology::new(SpySource::new(false));
        let err = topo.cpus_for_node(NumaNodeId::new(0)).unwrap_err();
        assert!(matches!(err, NumaError::NumaUnavailable));
        assert_eq!(topo.source().calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_query_failures_are_not_cached() {
        let topo = NodeCpuTopology::new(SpySource::new(true));

        let empty = topo.cpus_for_node(NumaNodeId::new(2)).unwrap_err();
        assert!(matches!(empty, NumaError::NumaQueryFailed { .. }));

        let missing = topo.cpus_for_node(NumaNodeId::new(9)).unwrap_err();
        assert!(missing.is_topology());

        topo.cpus_for_node(NumaNodeId::new(9)).unwrap_err();
        assert_eq!(topo.source().calls.load(Ordering::SeqCst), 3);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sysfs_fake_root() {
        let dir = tempfile::tempdir().unwrap();
        write_node(dir.path(), 0, "0-3\n");
        write_node(dir.path(), 1, "4-7,12\n");
        fs::create_dir_all(dir.path().join("power")).unwrap();

        let source = SysfsTopology::with_root(dir.path());
        assert!(source.numa_available());
        assert_eq!(
            source.online_nodes().unwrap(),
            vec![NumaNodeId::new(0), NumaNodeId::new(1)]
        );

        let topo = NodeCpuTopology::new(source);
        assert_eq!(topo.cpus_for_node(NumaNodeId::new(1)).unwrap().cpus(), &[4, 5, 6, 7, 12]);
        assert!(topo.is_numa());
        assert!(topo.summary().starts_with("2 NUMA node(s)"));
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_sysfs_missing_node() {
        let dir = tempfile::tempdir().unwrap();
        write_node(dir.path(), 0, "0");

        let topo = NodeCpuTopology::new(SysfsTopology::with_root(dir.path()));
        let err = topo.cpus_for_node(NumaNodeId::new(3)).unwrap_err();
        assert!(matches!(err, NumaError::NumaQueryFailed { node, .. } if node.get() == 3));
    }

    #[test]
    fn test_sysfs_missing_root_is_unavailable() {
        let topo = NodeCpuTopology::new(SysfsTopology::with_root("/nonexistent/nodebench/sysfs"));
        assert!(matches!(
            topo.cpus_for_node(NumaNodeId::new(0)),
            Err(NumaError::NumaUnavailable)
        ));
        assert_eq!(topo.node_count(), 0);
        assert_eq!(topo.summary(), "NUMA unavailable");
    }
}
