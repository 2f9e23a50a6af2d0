//! Static DRAM/NVRAM tier membership and on-demand node space queries.
//!
//! Tier membership is fixed at startup from the configuration. Free and total
//! byte counts are read from sysfs on every query so that the migration
//! engine always sees the kernel's current view; nothing here is cached
//! across an assignment loop iteration.

use std::{fs, io, path::PathBuf};

use lazy_static::lazy_static;
use thiserror::Error;

use crate::config::ControllerConfiguration;

/// A NUMA node number as the kernel names it.
pub type NodeId = u32;

/// The two memory tiers managed by the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Fast volatile tier.
    Dram,
    /// Slow persistent tier.
    Nvram,
}

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("could not read meminfo of node {0}: {1}")]
    Meminfo(NodeId, #[source] io::Error),
    #[error("meminfo of node {node} is missing the {field} field")]
    MissingField { node: NodeId, field: &'static str },
}

lazy_static! {
    static ref PAGE_SIZE: u64 = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
}

/// The process-wide page size in bytes, read once.
pub fn page_size() -> u64 {
    *PAGE_SIZE
}

/// Source of per-node memory sizes. The production implementation reads
/// sysfs; tests substitute fixed values.
pub trait SpaceProbe: Send + Sync {
    /// Returns `(free_bytes, total_bytes)` of the given node.
    fn node_space(&self, node: NodeId) -> Result<(u64, u64), TopologyError>;
}

/// Reads `/sys/devices/system/node/node<N>/meminfo`, the same source libnuma
/// consults for `numa_node_size64`.
pub struct SysfsProbe;

impl SpaceProbe for SysfsProbe {
    fn node_space(&self, node: NodeId) -> Result<(u64, u64), TopologyError> {
        let path = PathBuf::from(format!("/sys/devices/system/node/node{}/meminfo", node));
        let text = fs::read_to_string(&path).map_err(|e| TopologyError::Meminfo(node, e))?;
        parse_meminfo(node, &text)
    }
}

/// Extracts `(free_bytes, total_bytes)` from a node meminfo listing.
///
/// Lines look like `Node 0 MemTotal:       16315380 kB`.
fn parse_meminfo(node: NodeId, text: &str) -> Result<(u64, u64), TopologyError> {
    let mut total = None;
    let mut free = None;
    for line in text.lines() {
        let mut fields = line.split_whitespace();
        // skip the "Node <N>" prefix
        let _ = fields.next();
        let _ = fields.next();
        match (fields.next(), fields.next()) {
            (Some("MemTotal:"), Some(kb)) => total = kb.parse::<u64>().ok().map(|v| v * 1024),
            (Some("MemFree:"), Some(kb)) => free = kb.parse::<u64>().ok().map(|v| v * 1024),
            _ => {}
        }
    }
    let total = total.ok_or(TopologyError::MissingField {
        node,
        field: "MemTotal",
    })?;
    let free = free.ok_or(TopologyError::MissingField {
        node,
        field: "MemFree",
    })?;
    Ok((free, total))
}

/// The configured node sets of both tiers plus the space probe.
pub struct TierTopology {
    dram: Vec<NodeId>,
    nvram: Vec<NodeId>,
    probe: Box<dyn SpaceProbe>,
}

impl TierTopology {
    /// Builds the topology from the configured node lists. The lists must be
    /// non-empty and disjoint; `ControllerConfiguration::validate` enforces
    /// this before the controller is assembled.
    pub fn new(config: &ControllerConfiguration, probe: Box<dyn SpaceProbe>) -> Self {
        TierTopology {
            dram: config.dram_nodes.clone(),
            nvram: config.nvram_nodes.clone(),
            probe,
        }
    }

    /// Node ids of a tier, in configured order. Destination assignment fills
    /// nodes in this order.
    pub fn nodes(&self, tier: Tier) -> &[NodeId] {
        match tier {
            Tier::Dram => &self.dram,
            Tier::Nvram => &self.nvram,
        }
    }

    /// Free pages of a single node right now.
    pub fn node_free_pages(&self, node: NodeId) -> Result<u64, TopologyError> {
        let (free, _) = self.probe.node_space(node)?;
        Ok(free / page_size())
    }

    /// `(free_bytes, total_bytes)` summed over a tier.
    pub fn tier_space(&self, tier: Tier) -> Result<(u64, u64), TopologyError> {
        let mut free = 0;
        let mut total = 0;
        for &node in self.nodes(tier) {
            let (node_free, node_total) = self.probe.node_space(node)?;
            free += node_free;
            total += node_total;
        }
        Ok((free, total))
    }

    /// Used fraction of a tier in `[0, 1]`.
    pub fn tier_usage(&self, tier: Tier) -> Result<f64, TopologyError> {
        let (free, total) = self.tier_space(tier)?;
        Ok((total - free) as f64 / total as f64)
    }

    /// Free pages summed over a tier.
    pub fn tier_free_pages(&self, tier: Tier) -> Result<u64, TopologyError> {
        let (free, _) = self.tier_space(tier)?;
        Ok(free / page_size())
    }
}
