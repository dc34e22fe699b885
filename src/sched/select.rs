//! Node selection oracle.
//!
//! Selection is a pure function over node/partition state: given a job
//! and the nodes it may use, choose an allocation or say why one does
//! not exist. The oracle never takes controller locks itself; callers
//! hand it the registries they already hold. `WillRun` and `Test`
//! modes must not mutate anything — only the caller applies a chosen
//! allocation in `Run` mode.

use serde::{Deserialize, Serialize};

use crate::bitmap::Bitmap;
use crate::error::{SchedError, SchedResult};
use crate::job::{JobDetails, JobRecord};
use crate::node::NodeRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectMode {
    /// Choose an allocation the caller will commit.
    Run,
    /// Feasibility only, ignoring current load.
    Test,
    /// Like Run but with no side effects on live state.
    WillRun,
}

/// A chosen allocation.
#[derive(Debug, Clone)]
pub struct Allocation {
    pub node_bitmap: Bitmap,
    /// Run-length encoded CPU counts: `cpus_per_node[i]` repeated
    /// `cpu_count_reps[i]` times across the allocation, in node order.
    pub cpus_per_node: Vec<u32>,
    pub cpu_count_reps: Vec<u32>,
    pub total_procs: u32,
}

/// The selection plugin seam.
pub trait Selector: Send + Sync {
    /// `avail` is already reduced to the nodes the job may consider
    /// (partition members, not down, features satisfied, exclusions
    /// applied). `req_bitmap` nodes must be part of any allocation.
    fn select(
        &self,
        job: &JobRecord,
        details: &JobDetails,
        nodes: &NodeRegistry,
        avail: &Bitmap,
        req_bitmap: Option<&Bitmap>,
        min_nodes: u32,
        max_nodes: u32,
        mode: SelectMode,
        fast_schedule: bool,
    ) -> SchedResult<Allocation>;
}

/// Opaque per-job blob of the built-in selector, carried through the
/// wire and the state file without interpretation elsewhere.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LinearJobInfo {
    pub node_cnt: u32,
    pub total_procs: u32,
}

impl LinearJobInfo {
    pub fn to_blob(&self) -> Vec<u8> {
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_blob(blob: &[u8]) -> Option<LinearJobInfo> {
        if blob.is_empty() {
            return None;
        }
        bincode::deserialize(blob).ok()
    }
}

/// Whole-node selector: allocates complete nodes in weight order,
/// preferring lighter (cheaper) nodes, never sharing a node between
/// jobs.
#[derive(Default)]
pub struct LinearSelector;

impl LinearSelector {
    fn node_usable(
        details: &JobDetails,
        nodes: &NodeRegistry,
        idx: usize,
        fast_schedule: bool,
    ) -> bool {
        let n = nodes.get(idx);
        if details.job_min_memory > 0 {
            let mem = if fast_schedule { n.config_memory } else { n.real_memory };
            if mem < details.job_min_memory {
                return false;
            }
        }
        if details.job_min_tmp_disk > 0 {
            let disk = if fast_schedule { n.config_tmp_disk } else { n.tmp_disk };
            if disk < details.job_min_tmp_disk {
                return false;
            }
        }
        if details.job_min_procs > 0
            && (n.sched_cpus(fast_schedule) as u32) < details.job_min_procs
        {
            return false;
        }
        true
    }

    fn build_allocation(
        nodes: &NodeRegistry,
        picked: &[usize],
        fast_schedule: bool,
    ) -> Allocation {
        let mut bitmap = Bitmap::new(nodes.len());
        for &i in picked {
            bitmap.set(i);
        }
        // run-length encode CPU counts in node-index order
        let mut ordered: Vec<usize> = bitmap.iter_set().collect();
        ordered.sort_unstable();
        let mut cpus_per_node = Vec::new();
        let mut cpu_count_reps = Vec::new();
        let mut total = 0u32;
        for i in ordered {
            let cpus = nodes.get(i).sched_cpus(fast_schedule) as u32;
            total += cpus;
            match cpus_per_node.last() {
                Some(&last) if last == cpus => {
                    *cpu_count_reps.last_mut().expect("parallel arrays") += 1;
                }
                _ => {
                    cpus_per_node.push(cpus);
                    cpu_count_reps.push(1);
                }
            }
        }
        Allocation {
            node_bitmap: bitmap,
            cpus_per_node,
            cpu_count_reps,
            total_procs: total,
        }
    }
}

impl Selector for LinearSelector {
    fn select(
        &self,
        job: &JobRecord,
        details: &JobDetails,
        nodes: &NodeRegistry,
        avail: &Bitmap,
        req_bitmap: Option<&Bitmap>,
        min_nodes: u32,
        max_nodes: u32,
        mode: SelectMode,
        fast_schedule: bool,
    ) -> SchedResult<Allocation> {
        let max_nodes = if max_nodes == 0 { u32::MAX } else { max_nodes };
        if min_nodes > max_nodes {
            return Err(SchedError::TooManyRequestedNodes);
        }

        // feasibility against the full candidate set (load ignored)
        let feasible: Vec<usize> = avail
            .iter_set()
            .filter(|&i| Self::node_usable(details, nodes, i, fast_schedule))
            .collect();
        let feasible_cpus: u32 = feasible
            .iter()
            .map(|&i| nodes.get(i).sched_cpus(fast_schedule) as u32)
            .sum();
        if (feasible.len() as u32) < min_nodes || feasible_cpus < job.num_procs {
            return Err(SchedError::NodeConfigUnavailable);
        }
        if let Some(req) = req_bitmap {
            let mut missing = req.clone();
            missing.and_not(avail);
            if !missing.is_empty() {
                return Err(SchedError::NodeConfigUnavailable);
            }
        }
        if mode == SelectMode::Test {
            return Ok(Self::build_allocation(
                nodes,
                &feasible[..min_nodes.max(1) as usize],
                fast_schedule,
            ));
        }

        // now respect current load: whole-node allocation wants nodes
        // with nothing running or completing on them
        let mut candidates: Vec<usize> = feasible
            .iter()
            .copied()
            .filter(|&i| {
                let n = nodes.get(i);
                n.run_job_cnt == 0 && n.comp_job_cnt == 0
            })
            .collect();
        candidates.sort_by_key(|&i| (nodes.get(i).weight, i));

        let mut picked: Vec<usize> = Vec::new();
        let mut cpus = 0u32;

        if let Some(req) = req_bitmap {
            for i in req.iter_set() {
                if !candidates.contains(&i) {
                    return Err(SchedError::NodesBusy);
                }
                picked.push(i);
                cpus += nodes.get(i).sched_cpus(fast_schedule) as u32;
            }
        }

        for i in candidates {
            if picked.len() as u32 >= max_nodes {
                break;
            }
            if picked.contains(&i) {
                continue;
            }
            if picked.len() as u32 >= min_nodes && cpus >= job.num_procs {
                break;
            }
            picked.push(i);
            cpus += nodes.get(i).sched_cpus(fast_schedule) as u32;
        }

        if (picked.len() as u32) < min_nodes || cpus < job.num_procs {
            return Err(SchedError::NodesBusy);
        }
        Ok(Self::build_allocation(nodes, &picked, fast_schedule))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::msg::NodeRegistrationMsg;
    use crate::config::{Config, NodeConfig};

    fn registry() -> NodeRegistry {
        let mut cfg = Config::default();
        cfg.nodes = vec![NodeConfig {
            names: "n[0-3]".into(),
            cpus: 2,
            sockets: 1,
            cores: 2,
            threads: 1,
            real_memory: 1024,
            tmp_disk: 100,
            weight: 1,
            features: vec![],
            port: 6818,
            address: None,
        }];
        let mut reg = NodeRegistry::from_config(&cfg).unwrap();
        for i in 0..4 {
            reg.register(
                &NodeRegistrationMsg {
                    node_name: format!("n{}", i),
                    cpus: 2,
                    real_memory: 1024,
                    tmp_disk: 100,
                    ..Default::default()
                },
                true,
            )
            .unwrap();
        }
        reg
    }

    fn job(num_procs: u32) -> (JobRecord, JobDetails) {
        let mut j = JobRecord::new(1);
        j.num_procs = num_procs;
        (j, JobDetails::default())
    }

    #[test]
    fn test_selects_enough_cpus() {
        let reg = registry();
        let (job, details) = job(4);
        let avail = Bitmap::full(4);
        let alloc = LinearSelector
            .select(&job, &details, &reg, &avail, None, 2, 0, SelectMode::Run, true)
            .unwrap();
        assert_eq!(alloc.node_bitmap.count(), 2);
        assert_eq!(alloc.total_procs, 4);
        assert_eq!(alloc.cpus_per_node, vec![2]);
        assert_eq!(alloc.cpu_count_reps, vec![2]);
    }

    #[test]
    fn test_busy_nodes_yield_nodes_busy() {
        let mut reg = registry();
        let mut bm = Bitmap::new(4);
        for i in 0..3 {
            bm.set(i);
        }
        reg.allocate(&bm, true);
        let (job, details) = job(4);
        let avail = Bitmap::full(4);
        let err = LinearSelector
            .select(&job, &details, &reg, &avail, None, 2, 0, SelectMode::Run, true)
            .unwrap_err();
        assert_eq!(err, SchedError::NodesBusy);
    }

    #[test]
    fn test_infeasible_yields_config_unavailable() {
        let reg = registry();
        let (job, details) = job(64);
        let avail = Bitmap::full(4);
        let err = LinearSelector
            .select(&job, &details, &reg, &avail, None, 2, 0, SelectMode::Run, true)
            .unwrap_err();
        assert_eq!(err, SchedError::NodeConfigUnavailable);
    }

    #[test]
    fn test_test_mode_ignores_load() {
        let mut reg = registry();
        let all = Bitmap::full(4);
        reg.allocate(&all, true);
        let (job, details) = job(4);
        let alloc = LinearSelector
            .select(&job, &details, &reg, &all, None, 2, 0, SelectMode::Test, true)
            .unwrap();
        assert_eq!(alloc.node_bitmap.count(), 2);
    }

    #[test]
    fn test_required_nodes_are_included() {
        let reg = registry();
        let (job, details) = job(2);
        let avail = Bitmap::full(4);
        let mut req = Bitmap::new(4);
        req.set(3);
        let alloc = LinearSelector
            .select(
                &job,
                &details,
                &reg,
                &avail,
                Some(&req),
                1,
                0,
                SelectMode::Run,
                true,
            )
            .unwrap();
        assert!(alloc.node_bitmap.test(3));
    }

    #[test]
    fn test_memory_minimum_filters_nodes() {
        let reg = registry();
        let (job, mut details) = job(2);
        details.job_min_memory = 4096;
        let avail = Bitmap::full(4);
        let err = LinearSelector
            .select(&job, &details, &reg, &avail, None, 1, 0, SelectMode::Run, true)
            .unwrap_err();
        assert_eq!(err, SchedError::NodeConfigUnavailable);
    }

    #[test]
    fn test_jobinfo_blob_round_trip() {
        let info = LinearJobInfo {
            node_cnt: 3,
            total_procs: 6,
        };
        let blob = info.to_blob();
        let back = LinearJobInfo::from_blob(&blob).unwrap();
        assert_eq!(back.node_cnt, 3);
        assert_eq!(back.total_procs, 6);
        assert!(LinearJobInfo::from_blob(&[]).is_none());
    }
}
