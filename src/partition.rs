//! Partition registry.
//!
//! Named subsets of nodes carrying scheduling policy: node-count and
//! time limits, access control, priority, and up/down state.

use std::collections::HashMap;

use tracing::info;

use crate::bitmap::Bitmap;
use crate::config::Config;
use crate::constants::INFINITE;
use crate::error::{SchedError, SchedResult};
use crate::node::NodeRegistry;
use crate::{now, UnixTime};

#[derive(Debug, Clone)]
pub struct PartRecord {
    pub name: String,
    /// Minutes; INFINITE = unlimited.
    pub max_time: u32,
    pub default_time: u32,
    pub max_nodes: u32,
    pub min_nodes: u32,
    pub total_nodes: u32,
    pub total_cpus: u32,
    pub priority: u16,
    pub hidden: bool,
    pub root_only: bool,
    pub disable_root_jobs: bool,
    pub shared: bool,
    pub state_up: bool,
    pub allow_groups: Vec<String>,
    pub node_names: String,
    pub node_bitmap: Bitmap,
}

impl PartRecord {
    /// True if `groups` (the submitting user's groups) intersect the
    /// partition's allow list; an empty allow list admits everyone.
    pub fn group_allowed(&self, groups: &[String]) -> bool {
        self.allow_groups.is_empty() || groups.iter().any(|g| self.allow_groups.contains(g))
    }
}

pub struct PartTable {
    parts: Vec<PartRecord>,
    by_name: HashMap<String, usize>,
    default_idx: Option<usize>,
    pub last_part_update: UnixTime,
}

impl PartTable {
    pub fn from_config(cfg: &Config, nodes: &NodeRegistry) -> SchedResult<PartTable> {
        let mut parts = Vec::new();
        let mut by_name = HashMap::new();
        let mut default_idx = None;
        for pc in &cfg.partitions {
            if by_name.contains_key(&pc.name) {
                return Err(SchedError::Internal(format!(
                    "duplicate partition {}",
                    pc.name
                )));
            }
            let node_bitmap = nodes.name_list_to_bitmap(&pc.nodes)?;
            let total_nodes = node_bitmap.count() as u32;
            let total_cpus = nodes.total_cpus(&node_bitmap, true);
            let idx = parts.len();
            if pc.default {
                default_idx = Some(idx);
            }
            by_name.insert(pc.name.clone(), idx);
            parts.push(PartRecord {
                name: pc.name.clone(),
                max_time: pc.max_time,
                default_time: pc.default_time,
                max_nodes: pc.max_nodes,
                min_nodes: pc.min_nodes,
                total_nodes,
                total_cpus,
                priority: pc.priority,
                hidden: pc.hidden,
                root_only: pc.root_only,
                disable_root_jobs: pc.disable_root_jobs,
                shared: pc.shared,
                state_up: pc.state_up,
                allow_groups: pc.allow_groups.clone(),
                node_names: pc.nodes.clone(),
                node_bitmap,
            });
        }
        if default_idx.is_none() && !parts.is_empty() {
            default_idx = Some(0);
        }
        Ok(PartTable {
            parts,
            by_name,
            default_idx,
            last_part_update: now(),
        })
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn get(&self, idx: usize) -> &PartRecord {
        &self.parts[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &PartRecord)> {
        self.parts.iter().enumerate()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    pub fn default_idx(&self) -> Option<usize> {
        self.default_idx
    }

    /// Resolve a requested partition name, falling back to the default.
    pub fn resolve(&self, name: Option<&str>) -> SchedResult<usize> {
        match name {
            Some(n) => self.find(n).ok_or(SchedError::InvalidPartitionName),
            None => self.default_idx.ok_or(SchedError::DefaultPartitionNotSet),
        }
    }

    /// Remove a partition; jobs pointing at it are the caller's problem
    /// (see the partition-deletion kill path in the lifecycle module).
    pub fn remove(&mut self, name: &str) -> Option<PartRecord> {
        let idx = self.by_name.remove(name)?;
        let rec = self.parts.remove(idx);
        info!("deleted partition {}", name);
        self.by_name.clear();
        for (i, p) in self.parts.iter().enumerate() {
            self.by_name.insert(p.name.clone(), i);
        }
        self.default_idx = match self.default_idx {
            Some(d) if d == idx => None,
            Some(d) if d > idx => Some(d - 1),
            other => other,
        };
        self.last_part_update = now();
        Some(rec)
    }

    /// Time limit a job gets in this partition when none was requested.
    pub fn effective_time_limit(&self, idx: usize, requested: u32) -> u32 {
        let p = &self.parts[idx];
        if requested != INFINITE && requested != crate::constants::NO_VAL {
            requested
        } else if p.default_time != INFINITE {
            p.default_time
        } else {
            p.max_time
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NodeConfig, PartitionConfig};

    fn setup() -> (NodeRegistry, PartTable) {
        let mut cfg = Config::default();
        cfg.nodes = vec![NodeConfig {
            names: "n[0-3]".into(),
            cpus: 2,
            sockets: 1,
            cores: 2,
            threads: 1,
            real_memory: 0,
            tmp_disk: 0,
            weight: 1,
            features: vec![],
            port: 6818,
            address: None,
        }];
        cfg.partitions = vec![
            PartitionConfig {
                name: "debug".into(),
                nodes: "n[0-1]".into(),
                default: true,
                max_time: 60,
                default_time: 30,
                max_nodes: 2,
                min_nodes: 1,
                hidden: false,
                root_only: false,
                disable_root_jobs: false,
                shared: false,
                priority: 10,
                state_up: true,
                allow_groups: vec![],
            },
            PartitionConfig {
                name: "batch".into(),
                nodes: "n[0-3]".into(),
                default: false,
                max_time: INFINITE,
                default_time: INFINITE,
                max_nodes: INFINITE,
                min_nodes: 1,
                hidden: false,
                root_only: false,
                disable_root_jobs: false,
                shared: true,
                priority: 1,
                state_up: true,
                allow_groups: vec!["hpc".into()],
            },
        ];
        let nodes = NodeRegistry::from_config(&cfg).unwrap();
        let parts = PartTable::from_config(&cfg, &nodes).unwrap();
        (nodes, parts)
    }

    #[test]
    fn test_resolve() {
        let (_, parts) = setup();
        assert_eq!(parts.resolve(Some("batch")).unwrap(), 1);
        assert_eq!(parts.resolve(None).unwrap(), 0);
        assert!(parts.resolve(Some("none")).is_err());
    }

    #[test]
    fn test_totals() {
        let (_, parts) = setup();
        assert_eq!(parts.get(0).total_nodes, 2);
        assert_eq!(parts.get(0).total_cpus, 4);
        assert_eq!(parts.get(1).total_nodes, 4);
    }

    #[test]
    fn test_group_access() {
        let (_, parts) = setup();
        assert!(parts.get(0).group_allowed(&["anything".into()]));
        assert!(!parts.get(1).group_allowed(&["users".into()]));
        assert!(parts.get(1).group_allowed(&["hpc".into()]));
    }

    #[test]
    fn test_effective_time_limit() {
        let (_, parts) = setup();
        assert_eq!(parts.effective_time_limit(0, 15), 15);
        assert_eq!(parts.effective_time_limit(0, crate::constants::NO_VAL), 30);
        assert_eq!(
            parts.effective_time_limit(1, crate::constants::NO_VAL),
            INFINITE
        );
    }

    #[test]
    fn test_remove_reindexes() {
        let (_, mut parts) = setup();
        parts.remove("debug").unwrap();
        assert_eq!(parts.len(), 1);
        assert_eq!(parts.find("batch"), Some(0));
        assert_eq!(parts.default_idx(), None);
    }
}
