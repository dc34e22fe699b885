//! Association cache.
//!
//! A tree of `(user, account, partition)` records carrying hierarchical
//! limits and running usage, with parent links toward the root (the
//! cluster). Jobs hold an association id; the cache resolves it back to
//! a record on every use, tolerating deletion out from under the job.
//!
//! The cache has its own mutex, acquired innermost relative to the four
//! named controller locks.

use std::collections::HashMap;

use tracing::info;

use crate::codec::msg::JobDescMsg;
use crate::constants::{INFINITE, NO_VAL, NO_VAL64};
use crate::error::{SchedError, SchedResult};

const INFINITE64: u64 = NO_VAL64 - 1;

fn limit64_set(v: u64) -> bool {
    v != NO_VAL64 && v != INFINITE64
}

fn limit32_set(v: u32) -> bool {
    v != NO_VAL && v != INFINITE
}

#[derive(Debug, Clone)]
pub struct AssocRecord {
    pub id: u32,
    /// None for account-level (non-user) records.
    pub uid: Option<u32>,
    pub user: Option<String>,
    pub acct: String,
    pub partition: Option<String>,
    pub parent_id: Option<u32>,

    // Hierarchical (group) limits, applying to the whole subtree.
    pub grp_cpu_mins: u64,
    pub grp_wall: u32,
    pub grp_nodes: u32,
    pub grp_submit_jobs: u32,

    // Per-job limits on this association.
    pub max_cpu_mins_pj: u64,
    pub max_wall_pj: u32,
    pub max_nodes_pj: u32,
    pub max_submit_jobs: u32,

    // Running usage.
    pub used_submit_jobs: u32,
    /// CPU-seconds consumed by the subtree.
    pub usage_raw: u64,
    /// Wall-seconds consumed by the subtree.
    pub grp_used_wall: u64,
}

impl AssocRecord {
    fn unlimited(id: u32, parent_id: Option<u32>, acct: &str) -> AssocRecord {
        AssocRecord {
            id,
            uid: None,
            user: None,
            acct: acct.to_string(),
            partition: None,
            parent_id,
            grp_cpu_mins: NO_VAL64,
            grp_wall: NO_VAL,
            grp_nodes: NO_VAL,
            grp_submit_jobs: NO_VAL,
            max_cpu_mins_pj: NO_VAL64,
            max_wall_pj: NO_VAL,
            max_nodes_pj: NO_VAL,
            max_submit_jobs: NO_VAL,
            used_submit_jobs: 0,
            usage_raw: 0,
            grp_used_wall: 0,
        }
    }
}

/// Why a running job tripped an association limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UsageBreach {
    GrpCpuMins,
    GrpWall,
    MaxCpuMinsPerJob,
    MaxWallPerJob,
}

pub struct AssocCache {
    records: HashMap<u32, AssocRecord>,
    next_id: u32,
    root_id: u32,
}

impl Default for AssocCache {
    fn default() -> Self {
        AssocCache::new()
    }
}

impl AssocCache {
    pub fn new() -> AssocCache {
        let root = AssocRecord::unlimited(1, None, "root");
        let mut records = HashMap::new();
        records.insert(1, root);
        AssocCache {
            records,
            next_id: 1,
            root_id: 1,
        }
    }

    pub fn root_id(&self) -> u32 {
        self.root_id
    }

    pub fn get(&self, id: u32) -> Option<&AssocRecord> {
        self.records.get(&id)
    }

    /// Insert a record; parent defaults to the root.
    pub fn insert(&mut self, mut rec: AssocRecord) -> u32 {
        self.next_id += 1;
        rec.id = self.next_id;
        if rec.parent_id.is_none() {
            rec.parent_id = Some(self.root_id);
        }
        let id = rec.id;
        self.records.insert(id, rec);
        id
    }

    /// Convenience: add a user association under a fresh or existing
    /// account record.
    pub fn add_user_assoc(
        &mut self,
        uid: u32,
        user: &str,
        acct: &str,
        partition: Option<&str>,
    ) -> u32 {
        let acct_id = match self
            .records
            .values()
            .find(|r| r.uid.is_none() && r.acct == acct)
            .map(|r| r.id)
        {
            Some(id) => id,
            None => {
                let rec = AssocRecord::unlimited(0, Some(self.root_id), acct);
                self.insert(rec)
            }
        };
        let mut rec = AssocRecord::unlimited(0, Some(acct_id), acct);
        rec.uid = Some(uid);
        rec.user = Some(user.to_string());
        rec.partition = partition.map(|p| p.to_string());
        self.insert(rec)
    }

    pub fn delete(&mut self, id: u32) -> Option<AssocRecord> {
        if id == self.root_id {
            return None;
        }
        self.records.remove(&id)
    }

    /// Resolve an association for a job: by explicit id first, then by
    /// `(uid, account, partition)`. A record with no partition matches
    /// any partition. With `enforce` clear, a missing account falls
    /// back to any association the user has.
    pub fn fill_in(
        &self,
        id: u32,
        uid: u32,
        account: Option<&str>,
        partition: Option<&str>,
        enforce: bool,
    ) -> Option<u32> {
        if id != 0 {
            if self.records.contains_key(&id) {
                return Some(id);
            }
            // stale id; fall through to a fresh lookup
        }
        let by_part = |r: &AssocRecord| match (&r.partition, partition) {
            (None, _) => true,
            (Some(p), Some(want)) => p == want,
            (Some(_), None) => false,
        };
        let exact = self.records.values().find(|r| {
            r.uid == Some(uid) && account.is_some_and(|a| a == r.acct) && by_part(r)
        });
        if let Some(r) = exact {
            return Some(r.id);
        }
        if !enforce {
            return self
                .records
                .values()
                .find(|r| r.uid == Some(uid) && by_part(r))
                .map(|r| r.id);
        }
        None
    }

    fn chain(&self, id: u32) -> Vec<u32> {
        let mut out = Vec::new();
        let mut cur = Some(id);
        while let Some(c) = cur {
            if out.contains(&c) {
                break; // corrupted parent link; stop rather than spin
            }
            out.push(c);
            cur = self.records.get(&c).and_then(|r| r.parent_id);
        }
        out
    }

    /// Submit-time admission per accounting policy. May clamp the
    /// descriptor's `max_nodes` and `time_limit` downward; returns an
    /// error when a hard limit is already exceeded.
    pub fn validate_policy(
        &self,
        desc: &mut JobDescMsg,
        part_max_time: u32,
        assoc_id: u32,
    ) -> SchedResult<()> {
        let mut parent = false;
        let mut max_nodes_set = false;
        let mut timelimit_set = false;

        for id in self.chain(assoc_id) {
            let Some(rec) = self.records.get(&id) else { break };

            if limit32_set(rec.grp_nodes) {
                if desc.min_nodes > rec.grp_nodes {
                    info!(
                        "submit for uid {}: min nodes {} exceeds group node limit {} (account {})",
                        desc.user_id, desc.min_nodes, rec.grp_nodes, rec.acct
                    );
                    return Err(SchedError::AccountingPolicy);
                }
                if desc.max_nodes == NO_VAL || desc.max_nodes > rec.grp_nodes {
                    desc.max_nodes = rec.grp_nodes;
                    max_nodes_set = true;
                }
            }

            if limit32_set(rec.grp_submit_jobs) && rec.used_submit_jobs >= rec.grp_submit_jobs {
                info!(
                    "submit for uid {}: group submit limit {} reached (account {})",
                    desc.user_id, rec.grp_submit_jobs, rec.acct
                );
                return Err(SchedError::AccountingPolicy);
            }

            // Per-association limits only apply to the job's own record;
            // parents were pre-propagated.
            if parent {
                continue;
            }

            if limit32_set(rec.max_nodes_pj) {
                if desc.min_nodes > rec.max_nodes_pj {
                    info!(
                        "submit for uid {}: min nodes {} exceeds per-job max {}",
                        desc.user_id, desc.min_nodes, rec.max_nodes_pj
                    );
                    return Err(SchedError::AccountingPolicy);
                }
                if desc.max_nodes == NO_VAL
                    || (max_nodes_set && desc.max_nodes > rec.max_nodes_pj)
                {
                    desc.max_nodes = rec.max_nodes_pj;
                    max_nodes_set = true;
                }
            }

            if limit32_set(rec.max_submit_jobs) && rec.used_submit_jobs >= rec.max_submit_jobs {
                info!(
                    "submit for uid {}: max submit limit {} reached",
                    desc.user_id, rec.max_submit_jobs
                );
                return Err(SchedError::AccountingPolicy);
            }

            if limit32_set(rec.max_wall_pj) {
                let limit = rec.max_wall_pj;
                if desc.time_limit == NO_VAL {
                    desc.time_limit = if part_max_time == INFINITE {
                        limit
                    } else {
                        limit.min(part_max_time)
                    };
                    timelimit_set = true;
                } else if timelimit_set && desc.time_limit > limit {
                    desc.time_limit = limit;
                } else if desc.time_limit > limit {
                    info!(
                        "submit for uid {}: time limit {} exceeds per-job max {}",
                        desc.user_id, desc.time_limit, limit
                    );
                    return Err(SchedError::AccountingPolicy);
                }
            }

            parent = true;
        }
        Ok(())
    }

    /// Count a submission against the chain (the group counters on
    /// every ancestor).
    pub fn add_job_submit(&mut self, assoc_id: u32) {
        for id in self.chain(assoc_id) {
            if let Some(r) = self.records.get_mut(&id) {
                r.used_submit_jobs += 1;
            }
        }
    }

    /// Undo one submission count; paired with every completion log.
    pub fn remove_job_submit(&mut self, assoc_id: u32) {
        for id in self.chain(assoc_id) {
            if let Some(r) = self.records.get_mut(&id) {
                r.used_submit_jobs = r.used_submit_jobs.saturating_sub(1);
            }
        }
    }

    /// Accrue running usage onto the chain (cpu-seconds and wall
    /// seconds since the last tick).
    pub fn accrue_usage(&mut self, assoc_id: u32, cpu_secs: u64, wall_secs: u64) {
        for id in self.chain(assoc_id) {
            if let Some(r) = self.records.get_mut(&id) {
                r.usage_raw += cpu_secs;
                r.grp_used_wall += wall_secs;
            }
        }
    }

    /// Walk the chain upward applying the running-usage limits for a
    /// job that has consumed `job_cpu_mins` so far. Root limits do not
    /// apply. Returns the first breach found.
    pub fn check_usage(&self, assoc_id: u32, job_cpu_mins: u64) -> Option<UsageBreach> {
        let mut first = true;
        for id in self.chain(assoc_id) {
            if id == self.root_id {
                break;
            }
            let Some(rec) = self.records.get(&id) else { break };
            let usage_mins = rec.usage_raw / 60;
            let wall_mins = (rec.grp_used_wall / 60) as u32;

            if limit64_set(rec.grp_cpu_mins) && usage_mins >= rec.grp_cpu_mins {
                return Some(UsageBreach::GrpCpuMins);
            }
            if limit32_set(rec.grp_wall) && wall_mins >= rec.grp_wall {
                return Some(UsageBreach::GrpWall);
            }
            if first {
                if limit64_set(rec.max_cpu_mins_pj) && job_cpu_mins >= rec.max_cpu_mins_pj {
                    return Some(UsageBreach::MaxCpuMinsPerJob);
                }
                first = false;
            }
        }
        None
    }

    /// Per-job wall limit on the association, if any (applied as an
    /// implicit time limit by the health loop).
    pub fn max_wall_pj(&self, assoc_id: u32) -> Option<u32> {
        self.records
            .get(&assoc_id)
            .map(|r| r.max_wall_pj)
            .filter(|v| limit32_set(*v))
    }

    /// Parent of a record, for re-homing jobs whose association was
    /// deleted.
    pub fn parent_of(&self, id: u32) -> Option<u32> {
        self.records.get(&id).and_then(|r| r.parent_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cache_with_user() -> (AssocCache, u32) {
        let mut c = AssocCache::new();
        let id = c.add_user_assoc(500, "alice", "science", None);
        (c, id)
    }

    #[test]
    fn test_fill_in_by_tuple_and_id() {
        let (c, id) = cache_with_user();
        assert_eq!(c.fill_in(0, 500, Some("science"), None, true), Some(id));
        assert_eq!(c.fill_in(id, 0, None, None, true), Some(id));
        assert_eq!(c.fill_in(0, 500, Some("wrong"), None, true), None);
        // non-enforcing falls back to any association of the user
        assert_eq!(c.fill_in(0, 500, Some("wrong"), None, false), Some(id));
        assert_eq!(c.fill_in(0, 999, None, None, false), None);
    }

    #[test]
    fn test_submit_counters_walk_chain() {
        let (mut c, id) = cache_with_user();
        let parent = c.parent_of(id).unwrap();
        c.add_job_submit(id);
        assert_eq!(c.get(id).unwrap().used_submit_jobs, 1);
        assert_eq!(c.get(parent).unwrap().used_submit_jobs, 1);
        c.remove_job_submit(id);
        assert_eq!(c.get(id).unwrap().used_submit_jobs, 0);
        assert_eq!(c.get(parent).unwrap().used_submit_jobs, 0);
    }

    #[test]
    fn test_policy_clamps_and_rejects() {
        let (mut c, id) = cache_with_user();
        {
            let rec = c.records.get_mut(&id).unwrap();
            rec.max_nodes_pj = 4;
            rec.max_wall_pj = 60;
        }
        let mut desc = JobDescMsg::default();
        desc.min_nodes = 2;
        desc.max_nodes = NO_VAL;
        desc.time_limit = NO_VAL;
        c.validate_policy(&mut desc, INFINITE, id).unwrap();
        assert_eq!(desc.max_nodes, 4);
        assert_eq!(desc.time_limit, 60);

        let mut desc2 = JobDescMsg::default();
        desc2.min_nodes = 8;
        assert_eq!(
            c.validate_policy(&mut desc2, INFINITE, id),
            Err(SchedError::AccountingPolicy)
        );

        let mut desc3 = JobDescMsg::default();
        desc3.time_limit = 120;
        assert_eq!(
            c.validate_policy(&mut desc3, INFINITE, id),
            Err(SchedError::AccountingPolicy)
        );
    }

    #[test]
    fn test_submit_limit_enforced() {
        let (mut c, id) = cache_with_user();
        c.records.get_mut(&id).unwrap().max_submit_jobs = 1;
        c.add_job_submit(id);
        let mut desc = JobDescMsg::default();
        assert_eq!(
            c.validate_policy(&mut desc, INFINITE, id),
            Err(SchedError::AccountingPolicy)
        );
    }

    #[test]
    fn test_usage_breach_detection() {
        let (mut c, id) = cache_with_user();
        c.records.get_mut(&id).unwrap().grp_cpu_mins = 10;
        assert_eq!(c.check_usage(id, 0), None);
        c.accrue_usage(id, 10 * 60, 60);
        assert_eq!(c.check_usage(id, 0), Some(UsageBreach::GrpCpuMins));
    }

    #[test]
    fn test_per_job_cpu_mins() {
        let (mut c, id) = cache_with_user();
        c.records.get_mut(&id).unwrap().max_cpu_mins_pj = 5;
        assert_eq!(c.check_usage(id, 4), None);
        assert_eq!(c.check_usage(id, 5), Some(UsageBreach::MaxCpuMinsPerJob));
    }

    #[test]
    fn test_deleted_assoc_rehomes_to_parent() {
        let (mut c, id) = cache_with_user();
        let parent = c.parent_of(id).unwrap();
        c.delete(id);
        assert_eq!(c.fill_in(id, 500, Some("science"), None, true), None);
        assert!(c.get(parent).is_some());
    }
}
