//! Node registry.
//!
//! Index-based table of node records; every bitmap in the system is
//! interpreted against this table. Job counters on each node and the
//! global idle/share bitmaps are kept in lockstep with job transitions:
//! a node is in the idle bitmap exactly when `run_job_cnt +
//! comp_job_cnt == 0` and it is neither DOWN nor DRAINED.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddrV4};

use tracing::{debug, error, info};

use crate::bitmap::Bitmap;
use crate::codec::msg::NodeRegistrationMsg;
use crate::config::Config;
use crate::error::{SchedError, SchedResult};
use crate::{hostlist, now, UnixTime};

/// Base node state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum NodeState {
    Unknown = 0,
    Idle = 1,
    Allocated = 2,
    Down = 3,
    Drained = 4,
    Failed = 5,
}

/// Orthogonal node flag bits.
pub const NODE_COMPLETING: u16 = 0x0100;
pub const NODE_NO_RESPOND: u16 = 0x0200;
pub const NODE_POWER_SAVE: u16 = 0x0400;
pub const NODE_DRAINING: u16 = 0x0800;

#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub name: String,
    pub addr: SocketAddrV4,
    pub state: NodeState,
    pub flags: u16,
    /// Configured resources.
    pub config_cpus: u16,
    pub sockets: u16,
    pub cores: u16,
    pub threads: u16,
    pub config_memory: u32,
    pub config_tmp_disk: u32,
    /// Resources last reported by the node agent.
    pub cpus: u16,
    pub real_memory: u32,
    pub tmp_disk: u32,
    pub weight: u32,
    pub features: Vec<String>,
    pub reason: Option<String>,
    pub run_job_cnt: u32,
    pub no_share_job_cnt: u32,
    pub comp_job_cnt: u32,
    pub last_response: UnixTime,
    pub up_time: u32,
}

impl NodeRecord {
    /// CPU count the scheduler should trust, per `fast_schedule`.
    pub fn sched_cpus(&self, fast_schedule: bool) -> u16 {
        if fast_schedule || self.cpus == 0 {
            self.config_cpus
        } else {
            self.cpus
        }
    }

    pub fn is_down(&self) -> bool {
        matches!(self.state, NodeState::Down | NodeState::Failed)
    }

    pub fn is_drained(&self) -> bool {
        self.state == NodeState::Drained
    }

    /// State word for client views: base state plus flags.
    pub fn state_word(&self) -> u16 {
        self.state as u16 | self.flags
    }
}

pub struct NodeRegistry {
    nodes: Vec<NodeRecord>,
    by_name: HashMap<String, usize>,
    /// Nodes usable for new work (not DOWN/DRAINED/unresponsive).
    pub avail_bitmap: Bitmap,
    /// Nodes with no running or completing jobs.
    pub idle_bitmap: Bitmap,
    /// Nodes with no exclusive job (sharable).
    pub share_bitmap: Bitmap,
    /// Nodes in power-save state.
    pub power_bitmap: Bitmap,
    pub last_node_update: UnixTime,
}

impl NodeRegistry {
    /// Build the table from configuration, expanding hostlist ranges.
    pub fn from_config(cfg: &Config) -> SchedResult<NodeRegistry> {
        let mut nodes = Vec::new();
        let mut by_name = HashMap::new();
        for nc in &cfg.nodes {
            let names = hostlist::expand(&nc.names)
                .ok_or_else(|| SchedError::Internal(format!("bad node list: {}", nc.names)))?;
            for name in names {
                if by_name.contains_key(&name) {
                    return Err(SchedError::Internal(format!("duplicate node {}", name)));
                }
                let ip = nc
                    .address
                    .as_deref()
                    .and_then(|a| a.parse::<Ipv4Addr>().ok())
                    .unwrap_or(Ipv4Addr::LOCALHOST);
                let idx = nodes.len();
                by_name.insert(name.clone(), idx);
                nodes.push(NodeRecord {
                    name,
                    addr: SocketAddrV4::new(ip, nc.port),
                    state: NodeState::Unknown,
                    flags: 0,
                    config_cpus: nc.cpus,
                    sockets: nc.sockets,
                    cores: nc.cores,
                    threads: nc.threads,
                    config_memory: nc.real_memory,
                    config_tmp_disk: nc.tmp_disk,
                    cpus: 0,
                    real_memory: 0,
                    tmp_disk: 0,
                    weight: nc.weight,
                    features: nc.features.clone(),
                    reason: None,
                    run_job_cnt: 0,
                    no_share_job_cnt: 0,
                    comp_job_cnt: 0,
                    last_response: 0,
                    up_time: 0,
                });
            }
        }
        let len = nodes.len();
        Ok(NodeRegistry {
            nodes,
            by_name,
            avail_bitmap: Bitmap::new(len),
            idle_bitmap: Bitmap::new(len),
            share_bitmap: Bitmap::full(len),
            power_bitmap: Bitmap::new(len),
            last_node_update: now(),
        })
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, idx: usize) -> &NodeRecord {
        &self.nodes[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut NodeRecord {
        self.last_node_update = now();
        &mut self.nodes[idx]
    }

    pub fn iter(&self) -> impl Iterator<Item = (usize, &NodeRecord)> {
        self.nodes.iter().enumerate()
    }

    pub fn find(&self, name: &str) -> Option<usize> {
        self.by_name.get(name).copied()
    }

    /// Parse a hostlist into a bitmap over this table.
    pub fn name_list_to_bitmap(&self, spec: &str) -> SchedResult<Bitmap> {
        let names = hostlist::expand(spec).ok_or(SchedError::InvalidNodeName)?;
        let mut bitmap = Bitmap::new(self.len());
        for name in names {
            let idx = self.find(&name).ok_or(SchedError::InvalidNodeName)?;
            bitmap.set(idx);
        }
        Ok(bitmap)
    }

    /// Compact string form of a bitmap.
    pub fn bitmap_to_names(&self, bitmap: &Bitmap) -> String {
        let names: Vec<&str> = bitmap.iter_set().map(|i| self.nodes[i].name.as_str()).collect();
        hostlist::compress(&names)
    }

    /// Total schedulable CPUs across a bitmap.
    pub fn total_cpus(&self, bitmap: &Bitmap, fast_schedule: bool) -> u32 {
        bitmap
            .iter_set()
            .map(|i| self.nodes[i].sched_cpus(fast_schedule) as u32)
            .sum()
    }

    /// True if every feature in `wanted` exists somewhere in the table.
    pub fn features_known(&self, wanted: &[&str]) -> bool {
        wanted.iter().all(|w| {
            self.nodes
                .iter()
                .any(|n| n.features.iter().any(|f| f == w))
        })
    }

    /// Nodes carrying every feature of `wanted`.
    pub fn feature_bitmap(&self, wanted: &[&str]) -> Bitmap {
        let mut b = Bitmap::new(self.len());
        for (i, n) in self.nodes.iter().enumerate() {
            if wanted.iter().all(|w| n.features.iter().any(|f| f == w)) {
                b.set(i);
            }
        }
        b
    }

    fn refresh_idle_bit(&mut self, idx: usize) {
        let n = &self.nodes[idx];
        if n.run_job_cnt + n.comp_job_cnt == 0 && !n.is_down() && !n.is_drained() {
            self.idle_bitmap.set(idx);
        } else {
            self.idle_bitmap.clear(idx);
        }
    }

    /// Claim nodes for a starting job.
    pub fn allocate(&mut self, bitmap: &Bitmap, exclusive: bool) {
        for idx in bitmap.iter_set() {
            let n = &mut self.nodes[idx];
            n.run_job_cnt += 1;
            n.state = NodeState::Allocated;
            if exclusive {
                n.no_share_job_cnt += 1;
                self.share_bitmap.clear(idx);
            }
            self.idle_bitmap.clear(idx);
        }
        self.last_node_update = now();
    }

    /// Move a terminating job's nodes from running to completing.
    pub fn begin_completing(&mut self, bitmap: &Bitmap, exclusive: bool) {
        for idx in bitmap.iter_set() {
            let n = &mut self.nodes[idx];
            if n.run_job_cnt > 0 {
                n.run_job_cnt -= 1;
            } else {
                error!("node {} run_job_cnt underflow", n.name);
            }
            n.comp_job_cnt += 1;
            n.flags |= NODE_COMPLETING;
            if exclusive {
                if n.no_share_job_cnt > 0 {
                    n.no_share_job_cnt -= 1;
                } else {
                    error!("node {} no_share_job_cnt underflow", n.name);
                }
                if n.no_share_job_cnt == 0 {
                    self.share_bitmap.set(idx);
                }
            }
        }
        self.last_node_update = now();
    }

    /// A suspended job is terminating: its run counts were already
    /// released at suspend time, only the completing side is entered.
    pub fn mark_completing_only(&mut self, bitmap: &Bitmap) {
        for idx in bitmap.iter_set() {
            let n = &mut self.nodes[idx];
            n.comp_job_cnt += 1;
            n.flags |= NODE_COMPLETING;
            self.idle_bitmap.clear(idx);
        }
        self.last_node_update = now();
    }

    /// Drop one running-job claim from a single node (a node excised
    /// from a live multi-node job).
    pub fn release_one(&mut self, idx: usize, exclusive: bool) {
        let n = &mut self.nodes[idx];
        if n.run_job_cnt > 0 {
            n.run_job_cnt -= 1;
        } else {
            error!("node {} run_job_cnt underflow", n.name);
        }
        if exclusive {
            if n.no_share_job_cnt > 0 {
                n.no_share_job_cnt -= 1;
            }
            if n.no_share_job_cnt == 0 {
                self.share_bitmap.set(idx);
            }
        }
        self.refresh_idle_bit(idx);
        self.last_node_update = now();
    }

    /// A node finished its epilog for some job; make it idle if no
    /// other work remains.
    pub fn make_idle(&mut self, idx: usize) {
        {
            let n = &mut self.nodes[idx];
            if n.comp_job_cnt > 0 {
                n.comp_job_cnt -= 1;
            } else {
                error!("node {} comp_job_cnt underflow", n.name);
            }
            if n.comp_job_cnt == 0 {
                n.flags &= !NODE_COMPLETING;
            }
            if !n.is_down() && !n.is_drained() {
                n.state = if n.run_job_cnt > 0 {
                    NodeState::Allocated
                } else {
                    NodeState::Idle
                };
            }
        }
        self.refresh_idle_bit(idx);
        self.last_node_update = now();
    }

    /// Release a suspended job's claim on its nodes.
    pub fn suspend_release(&mut self, bitmap: &Bitmap, exclusive: bool) {
        for idx in bitmap.iter_set() {
            let n = &mut self.nodes[idx];
            if n.run_job_cnt > 0 {
                n.run_job_cnt -= 1;
            } else {
                error!("node {} run_job_cnt underflow", n.name);
            }
            if exclusive {
                if n.no_share_job_cnt > 0 {
                    n.no_share_job_cnt -= 1;
                }
                if n.no_share_job_cnt == 0 {
                    self.share_bitmap.set(idx);
                }
            }
            if !n.is_down() {
                n.state = if n.run_job_cnt > 0 {
                    NodeState::Allocated
                } else {
                    NodeState::Idle
                };
            }
            self.refresh_idle_bit(idx);
        }
        self.last_node_update = now();
    }

    /// Re-acquire nodes on resume. Fails without side effects if any
    /// allocated node is DOWN.
    pub fn resume_reacquire(&mut self, bitmap: &Bitmap, exclusive: bool) -> SchedResult<()> {
        for idx in bitmap.iter_set() {
            if self.nodes[idx].is_down() {
                return Err(SchedError::NodeConfigUnavailable);
            }
        }
        for idx in bitmap.iter_set() {
            let n = &mut self.nodes[idx];
            n.run_job_cnt += 1;
            n.state = NodeState::Allocated;
            if exclusive {
                n.no_share_job_cnt += 1;
                self.share_bitmap.clear(idx);
            }
            self.idle_bitmap.clear(idx);
        }
        self.last_node_update = now();
        Ok(())
    }

    /// Take a node out of service.
    pub fn set_down(&mut self, name: &str, reason: &str) -> Option<usize> {
        let idx = self.find(name)?;
        let n = &mut self.nodes[idx];
        info!("setting node {} DOWN: {}", name, reason);
        n.state = NodeState::Down;
        n.reason = Some(reason.to_string());
        self.avail_bitmap.clear(idx);
        self.idle_bitmap.clear(idx);
        self.last_node_update = now();
        Some(idx)
    }

    /// Record a response from a node; clears the unresponsive flag and
    /// returns it to the available pool if healthy.
    pub fn node_did_resp(&mut self, name: &str) {
        let Some(idx) = self.find(name) else { return };
        let n = &mut self.nodes[idx];
        n.last_response = now();
        if n.flags & NODE_NO_RESPOND != 0 {
            debug!("node {} responding again", name);
            n.flags &= !NODE_NO_RESPOND;
        }
        if !n.is_down() && !n.is_drained() {
            self.avail_bitmap.set(idx);
        }
        self.refresh_idle_bit(idx);
    }

    /// Record a communication failure with a node.
    pub fn node_not_resp(&mut self, name: &str) {
        let Some(idx) = self.find(name) else { return };
        let n = &mut self.nodes[idx];
        if n.flags & NODE_NO_RESPOND == 0 {
            info!("node {} not responding", name);
            n.flags |= NODE_NO_RESPOND;
            self.avail_bitmap.clear(idx);
            self.last_node_update = now();
        }
    }

    pub fn is_node_resp(&self, name: &str) -> bool {
        self.find(name)
            .map(|i| self.nodes[i].flags & NODE_NO_RESPOND == 0)
            .unwrap_or(false)
    }

    /// Apply a registration report. Returns the node index.
    pub fn register(&mut self, reg: &NodeRegistrationMsg, fast_schedule: bool) -> SchedResult<usize> {
        let idx = self.find(&reg.node_name).ok_or(SchedError::InvalidNodeName)?;
        let was_unknown;
        {
            let n = &mut self.nodes[idx];
            was_unknown = n.state == NodeState::Unknown;
            n.cpus = reg.cpus;
            n.real_memory = reg.real_memory;
            n.tmp_disk = reg.tmp_disk;
            n.up_time = reg.up_time;
            n.last_response = now();
            n.flags &= !NODE_NO_RESPOND;
            if !fast_schedule && reg.cpus < n.config_cpus {
                info!(
                    "node {} registered with low cpu count ({} < {})",
                    n.name, reg.cpus, n.config_cpus
                );
            }
            if n.state == NodeState::Unknown || n.state == NodeState::Down {
                n.state = if n.run_job_cnt > 0 {
                    NodeState::Allocated
                } else {
                    NodeState::Idle
                };
                n.reason = None;
            }
        }
        self.avail_bitmap.set(idx);
        self.refresh_idle_bit(idx);
        if was_unknown {
            debug!("node {} registered", reg.node_name);
        }
        self.last_node_update = now();
        Ok(idx)
    }

    /// Nodes whose last response is older than `cutoff` and which are
    /// not already marked unresponsive.
    pub fn stale_nodes(&self, cutoff: UnixTime) -> Vec<usize> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(_, n)| {
                !n.is_down() && n.last_response < cutoff && n.flags & NODE_NO_RESPOND == 0
            })
            .map(|(i, _)| i)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::NodeConfig;

    fn registry(n: usize) -> NodeRegistry {
        let mut cfg = Config::default();
        cfg.nodes = vec![NodeConfig {
            names: format!("n[0-{}]", n - 1),
            cpus: 2,
            sockets: 1,
            cores: 2,
            threads: 1,
            real_memory: 1024,
            tmp_disk: 0,
            weight: 1,
            features: vec!["fast".into()],
            port: 6818,
            address: None,
        }];
        let mut reg = NodeRegistry::from_config(&cfg).unwrap();
        for i in 0..n {
            let msg = NodeRegistrationMsg {
                node_name: format!("n{}", i),
                cpus: 2,
                ..Default::default()
            };
            reg.register(&msg, true).unwrap();
        }
        reg
    }

    #[test]
    fn test_build_and_lookup() {
        let reg = registry(4);
        assert_eq!(reg.len(), 4);
        assert_eq!(reg.find("n2"), Some(2));
        assert_eq!(reg.find("zz"), None);
        assert_eq!(reg.idle_bitmap.count(), 4);
        assert_eq!(reg.avail_bitmap.count(), 4);
    }

    #[test]
    fn test_allocate_complete_idle_cycle() {
        let mut reg = registry(3);
        let mut bm = Bitmap::new(3);
        bm.set(0);
        bm.set(1);

        reg.allocate(&bm, true);
        assert_eq!(reg.get(0).run_job_cnt, 1);
        assert!(!reg.idle_bitmap.test(0));
        assert!(!reg.share_bitmap.test(0));

        reg.begin_completing(&bm, true);
        assert_eq!(reg.get(0).run_job_cnt, 0);
        assert_eq!(reg.get(0).comp_job_cnt, 1);
        // still not idle while completing
        assert!(!reg.idle_bitmap.test(0));
        assert!(reg.share_bitmap.test(0));

        reg.make_idle(0);
        reg.make_idle(1);
        assert!(reg.idle_bitmap.test(0));
        assert!(reg.idle_bitmap.test(1));
        assert_eq!(reg.get(0).state, NodeState::Idle);
    }

    #[test]
    fn test_down_node_never_idle() {
        let mut reg = registry(2);
        reg.set_down("n1", "test");
        assert!(!reg.idle_bitmap.test(1));
        assert!(!reg.avail_bitmap.test(1));
        assert!(reg.get(1).is_down());
    }

    #[test]
    fn test_suspend_resume_counts() {
        let mut reg = registry(2);
        let mut bm = Bitmap::new(2);
        bm.set(0);
        reg.allocate(&bm, false);
        reg.suspend_release(&bm, false);
        assert_eq!(reg.get(0).run_job_cnt, 0);
        assert!(reg.idle_bitmap.test(0));
        reg.resume_reacquire(&bm, false).unwrap();
        assert_eq!(reg.get(0).run_job_cnt, 1);
        assert!(!reg.idle_bitmap.test(0));
    }

    #[test]
    fn test_resume_fails_on_down_node() {
        let mut reg = registry(2);
        let mut bm = Bitmap::new(2);
        bm.set(0);
        bm.set(1);
        reg.allocate(&bm, false);
        reg.suspend_release(&bm, false);
        reg.set_down("n1", "dead");
        assert!(reg.resume_reacquire(&bm, false).is_err());
        // no partial acquisition
        assert_eq!(reg.get(0).run_job_cnt, 0);
    }

    #[test]
    fn test_features() {
        let reg = registry(2);
        assert!(reg.features_known(&["fast"]));
        assert!(!reg.features_known(&["gpu"]));
        assert_eq!(reg.feature_bitmap(&["fast"]).count(), 2);
    }

    #[test]
    fn test_responsiveness() {
        let mut reg = registry(2);
        reg.node_not_resp("n0");
        assert!(!reg.is_node_resp("n0"));
        assert!(!reg.avail_bitmap.test(0));
        reg.node_did_resp("n0");
        assert!(reg.is_node_resp("n0"));
        assert!(reg.avail_bitmap.test(0));
    }
}
