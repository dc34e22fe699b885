//! The job table: authoritative owner of job records.
//!
//! Records are reachable from the insertion-ordered list exactly once;
//! the open hash table keyed `job_id % size` provides O(1) lookup and
//! its chains are kept exactly consistent with the record set. The job
//! id sequence survives restarts through the state file and skips the
//! reserved high band.

use std::collections::HashMap;

use tracing::debug;

use crate::constants::MIN_NOALLOC_JOB_ID;
use crate::error::{SchedError, SchedResult};
use crate::job::{JobId, JobRecord};
use crate::{now, UnixTime};

pub struct JobTable {
    records: HashMap<JobId, JobRecord>,
    /// Insertion order; drives every full-table walk.
    order: Vec<JobId>,
    /// Open hash: chain `h` holds exactly the ids with `id % size == h`.
    hash: Vec<Vec<JobId>>,
    /// Last job id handed out.
    sequence: u32,
    first_job_id: u32,
    max_job_cnt: u32,
    /// Decreasing default-priority watermark.
    maximum_prio: u32,
    pub last_job_update: UnixTime,
}

const DEFAULT_PRIO_START: u32 = 100_000_000;

impl JobTable {
    pub fn new(first_job_id: u32, max_job_cnt: u32) -> JobTable {
        let size = max_job_cnt.max(16) as usize;
        JobTable {
            records: HashMap::new(),
            order: Vec::new(),
            hash: vec![Vec::new(); size],
            sequence: first_job_id.saturating_sub(1),
            first_job_id: first_job_id.max(1),
            max_job_cnt,
            maximum_prio: DEFAULT_PRIO_START,
            last_job_update: now(),
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn hash_size(&self) -> usize {
        self.hash.len()
    }

    /// Last assigned job id (what the state file persists).
    pub fn sequence(&self) -> u32 {
        self.sequence
    }

    /// Restore the sequence from a recovered state file; the persisted
    /// counter wins over the configured floor.
    pub fn restore_sequence(&mut self, saved: u32) {
        self.sequence = self.sequence.max(saved);
    }

    /// Advance the floor on reconfigure.
    pub fn reset_first_job_id(&mut self, first_job_id: u32) {
        self.first_job_id = first_job_id.max(1);
        self.sequence = self.sequence.max(self.first_job_id.saturating_sub(1));
    }

    fn chain(&self, job_id: JobId) -> usize {
        job_id as usize % self.hash.len()
    }

    pub fn find(&self, job_id: JobId) -> Option<&JobRecord> {
        let chain = self.chain(job_id);
        self.hash[chain]
            .iter()
            .find(|&&id| id == job_id)
            .and_then(|id| self.records.get(id))
    }

    pub fn find_mut(&mut self, job_id: JobId) -> Option<&mut JobRecord> {
        let chain = self.chain(job_id);
        if !self.hash[chain].contains(&job_id) {
            return None;
        }
        self.last_job_update = now();
        self.records.get_mut(&job_id)
    }

    /// Snapshot of ids in insertion order; the standard iteration
    /// pattern for walks that mutate records.
    pub fn ids(&self) -> Vec<JobId> {
        self.order.clone()
    }

    pub fn iter(&self) -> impl Iterator<Item = &JobRecord> {
        self.order.iter().filter_map(move |id| self.records.get(id))
    }

    /// Allocate the next job id: monotonic, wrapping below the reserved
    /// high band back to the configured floor, skipping live ids.
    fn next_job_id(&mut self) -> SchedResult<JobId> {
        for _ in 0..=(MIN_NOALLOC_JOB_ID - self.first_job_id) {
            self.sequence = self.sequence.wrapping_add(1);
            if self.sequence >= MIN_NOALLOC_JOB_ID || self.sequence < self.first_job_id {
                self.sequence = self.first_job_id;
            }
            if self.find(self.sequence).is_none() {
                return Ok(self.sequence);
            }
        }
        Err(SchedError::JobTableFull)
    }

    /// Create an empty record with a fresh id. Fails with
    /// `JobTableFull` at the configured cap, leaving nothing behind.
    pub fn create(&mut self) -> SchedResult<&mut JobRecord> {
        if self.records.len() >= self.max_job_cnt as usize {
            return Err(SchedError::JobTableFull);
        }
        let job_id = self.next_job_id()?;
        self.insert(JobRecord::new(job_id))?;
        Ok(self.records.get_mut(&job_id).expect("just inserted"))
    }

    /// Insert a fully formed record (state recovery, forced-id
    /// restart). Rejects duplicates.
    pub fn insert(&mut self, record: JobRecord) -> SchedResult<()> {
        let job_id = record.job_id;
        if self.find(job_id).is_some() {
            return Err(SchedError::Internal(format!("duplicate job id {}", job_id)));
        }
        if self.records.len() >= self.max_job_cnt as usize {
            return Err(SchedError::JobTableFull);
        }
        let chain = self.chain(job_id);
        self.hash[chain].push(job_id);
        self.order.push(job_id);
        self.records.insert(job_id, record);
        if job_id >= self.first_job_id && job_id < MIN_NOALLOC_JOB_ID {
            self.sequence = self.sequence.max(job_id);
        }
        self.last_job_update = now();
        Ok(())
    }

    /// Remove a record everywhere. Returns it for final logging.
    pub fn purge(&mut self, job_id: JobId) -> Option<JobRecord> {
        let rec = self.records.remove(&job_id)?;
        let chain = self.chain(job_id);
        self.hash[chain].retain(|&id| id != job_id);
        self.order.retain(|&id| id != job_id);
        debug!("purged job {}", job_id);
        self.last_job_update = now();
        Some(rec)
    }

    /// Default priority assignment: strictly decreasing from a high
    /// watermark so earlier submissions win ties. Held jobs, sticky
    /// priorities, and nice'd jobs do not move the watermark.
    pub fn set_default_priority(&mut self, job_id: JobId) {
        let Some(rec) = self.records.get_mut(&job_id) else {
            return;
        };
        if rec.is_finished() || rec.direct_set_prio {
            return;
        }
        let nice = rec
            .details
            .as_ref()
            .map(|d| d.nice)
            .unwrap_or(crate::constants::NICE_OFFSET);
        let base = self.maximum_prio.saturating_sub(1);
        let adjusted = (base as i64) + (crate::constants::NICE_OFFSET as i64 - nice as i64);
        rec.priority = adjusted.clamp(2, u32::MAX as i64) as u32;
        if rec.priority > 1 && nice == crate::constants::NICE_OFFSET {
            self.maximum_prio = self.maximum_prio.min(rec.priority);
        }
        self.last_job_update = now();
    }

    /// Recovery hook: keep the watermark below every restored priority.
    pub fn observe_priority(&mut self, priority: u32) {
        if priority > 1 && priority < self.maximum_prio {
            self.maximum_prio = priority;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{BaseState, JobState};

    fn table() -> JobTable {
        JobTable::new(42, 100)
    }

    #[test]
    fn test_create_assigns_sequential_ids() {
        let mut t = table();
        let a = t.create().unwrap().job_id;
        let b = t.create().unwrap().job_id;
        assert_eq!(a, 42);
        assert_eq!(b, 43);
        assert_eq!(t.sequence(), 43);
    }

    #[test]
    fn test_hash_integrity() {
        let mut t = table();
        let mut ids = Vec::new();
        for _ in 0..20 {
            ids.push(t.create().unwrap().job_id);
        }
        for id in ids {
            assert_eq!(t.find(id).unwrap().job_id, id);
        }
        assert!(t.find(9999).is_none());
    }

    #[test]
    fn test_table_full_leaves_no_partial_record() {
        let mut t = JobTable::new(1, 2);
        t.create().unwrap();
        t.create().unwrap();
        assert_eq!(t.create().unwrap_err(), SchedError::JobTableFull);
        assert_eq!(t.len(), 2);
    }

    #[test]
    fn test_purge_removes_everywhere() {
        let mut t = table();
        let id = t.create().unwrap().job_id;
        assert!(t.purge(id).is_some());
        assert!(t.find(id).is_none());
        assert!(t.ids().is_empty());
        assert!(t.purge(id).is_none());
    }

    #[test]
    fn test_id_wrap_skips_reserved_band() {
        let mut t = JobTable::new(10, 100);
        t.restore_sequence(MIN_NOALLOC_JOB_ID - 2);
        let a = t.create().unwrap().job_id;
        assert_eq!(a, MIN_NOALLOC_JOB_ID - 1);
        let b = t.create().unwrap().job_id;
        // wrapped back to the floor instead of the reserved band
        assert_eq!(b, 10);
    }

    #[test]
    fn test_sequence_restore_prefers_saved() {
        let mut t = table();
        t.restore_sequence(1000);
        assert_eq!(t.create().unwrap().job_id, 1001);
    }

    #[test]
    fn test_priority_decreases_by_submit_order() {
        let mut t = table();
        let a = t.create().unwrap().job_id;
        let b = t.create().unwrap().job_id;
        t.set_default_priority(a);
        t.set_default_priority(b);
        let pa = t.find(a).unwrap().priority;
        let pb = t.find(b).unwrap().priority;
        assert!(pa > pb, "{} should outrank {}", pa, pb);
    }

    #[test]
    fn test_sticky_priority_not_recomputed() {
        let mut t = table();
        let id = t.create().unwrap().job_id;
        {
            let rec = t.find_mut(id).unwrap();
            rec.direct_set_prio = true;
            rec.priority = 7;
        }
        t.set_default_priority(id);
        assert_eq!(t.find(id).unwrap().priority, 7);
    }

    #[test]
    fn test_insertion_order_preserved() {
        let mut t = table();
        let a = t.create().unwrap().job_id;
        {
            let rec = t.find_mut(a).unwrap();
            rec.state = JobState::new(BaseState::Running);
        }
        let b = t.create().unwrap().job_id;
        assert_eq!(t.ids(), vec![a, b]);
    }
}
