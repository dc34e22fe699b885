//! Reservation ledger.
//!
//! A reservation is a time-bounded claim on a set of nodes, restricted
//! to named users or accounts. Jobs naming a reservation are gated on
//! it being active; jobs running inside one are timed out when it ends.

use tracing::info;

use crate::bitmap::Bitmap;
use crate::error::{SchedError, SchedResult};
use crate::{now, UnixTime};

#[derive(Debug, Clone)]
pub struct ResvRecord {
    pub id: u32,
    pub name: String,
    pub start_time: UnixTime,
    pub end_time: UnixTime,
    pub node_bitmap: Bitmap,
    pub node_list: String,
    /// Admitted uids; empty means any user.
    pub users: Vec<u32>,
    /// Admitted accounts; empty means any account.
    pub accounts: Vec<String>,
}

impl ResvRecord {
    pub fn active_at(&self, t: UnixTime) -> bool {
        self.start_time <= t && t < self.end_time
    }

    pub fn admits(&self, uid: u32, account: Option<&str>) -> bool {
        let user_ok = self.users.is_empty() || self.users.contains(&uid);
        let acct_ok = self.accounts.is_empty()
            || account.is_some_and(|a| self.accounts.iter().any(|x| x == a));
        user_ok && acct_ok
    }
}

#[derive(Default)]
pub struct ResvLedger {
    resvs: Vec<ResvRecord>,
    next_id: u32,
    pub last_resv_update: UnixTime,
}

impl ResvLedger {
    pub fn create(
        &mut self,
        name: &str,
        start_time: UnixTime,
        end_time: UnixTime,
        node_bitmap: Bitmap,
        node_list: String,
        users: Vec<u32>,
        accounts: Vec<String>,
    ) -> SchedResult<u32> {
        if self.find_by_name(name).is_some() {
            return Err(SchedError::ReservationNotUsable);
        }
        self.next_id += 1;
        let id = self.next_id;
        info!("created reservation {} ({})", name, id);
        self.resvs.push(ResvRecord {
            id,
            name: name.to_string(),
            start_time,
            end_time,
            node_bitmap,
            node_list,
            users,
            accounts,
        });
        self.last_resv_update = now();
        Ok(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &ResvRecord> {
        self.resvs.iter()
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ResvRecord> {
        self.resvs.iter().find(|r| r.name == name)
    }

    pub fn find_by_id(&self, id: u32) -> Option<&ResvRecord> {
        self.resvs.iter().find(|r| r.id == id)
    }

    pub fn delete(&mut self, name: &str) -> bool {
        let before = self.resvs.len();
        self.resvs.retain(|r| r.name != name);
        if self.resvs.len() != before {
            self.last_resv_update = now();
            true
        } else {
            false
        }
    }

    /// Validate a job's reservation request at submit time; returns the
    /// reservation id.
    pub fn validate_job_resv(
        &self,
        name: &str,
        uid: u32,
        account: Option<&str>,
    ) -> SchedResult<u32> {
        let resv = self
            .find_by_name(name)
            .ok_or(SchedError::ReservationNotUsable)?;
        if !resv.admits(uid, account) {
            return Err(SchedError::AccessDenied);
        }
        if resv.end_time <= now() {
            return Err(SchedError::ReservationNotUsable);
        }
        Ok(resv.id)
    }

    /// Is the named reservation active right now? Jobs bound to an
    /// inactive reservation stay pending with reason RESERVATION.
    pub fn active_now(&self, resv_id: u32) -> bool {
        match self.find_by_id(resv_id) {
            Some(r) => r.active_at(now()),
            // reservation deleted out from under the job: not active
            None => false,
        }
    }

    /// Has the job's reservation ended? A RUNNING job whose reservation
    /// expired is timed out by the health loop.
    pub fn ended(&self, resv_id: u32) -> bool {
        match self.find_by_id(resv_id) {
            Some(r) => r.end_time <= now(),
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger_with(start_off: i64, end_off: i64) -> (ResvLedger, u32) {
        let mut l = ResvLedger::default();
        let t = now();
        let id = l
            .create(
                "maint",
                (t as i64 + start_off) as UnixTime,
                (t as i64 + end_off) as UnixTime,
                Bitmap::new(4),
                "n[0-3]".into(),
                vec![100],
                vec![],
            )
            .unwrap();
        (l, id)
    }

    #[test]
    fn test_admission() {
        let (l, id) = ledger_with(-10, 3600);
        let r = l.find_by_id(id).unwrap();
        assert!(r.admits(100, None));
        assert!(!r.admits(200, None));
    }

    #[test]
    fn test_active_window() {
        let (l, id) = ledger_with(-10, 3600);
        assert!(l.active_now(id));
        assert!(!l.ended(id));

        let (l2, id2) = ledger_with(3600, 7200);
        assert!(!l2.active_now(id2));
        assert!(!l2.ended(id2));

        let (l3, id3) = ledger_with(-7200, -3600);
        assert!(!l3.active_now(id3));
        assert!(l3.ended(id3));
    }

    #[test]
    fn test_validate_job_resv() {
        let (l, _) = ledger_with(-10, 3600);
        assert!(l.validate_job_resv("maint", 100, None).is_ok());
        assert_eq!(
            l.validate_job_resv("maint", 999, None),
            Err(SchedError::AccessDenied)
        );
        assert!(l.validate_job_resv("nope", 100, None).is_err());
    }

    #[test]
    fn test_deleted_reservation_reads_ended() {
        let (mut l, id) = ledger_with(-10, 3600);
        assert!(l.delete("maint"));
        assert!(!l.active_now(id));
        assert!(l.ended(id));
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let (mut l, _) = ledger_with(-10, 3600);
        assert!(l
            .create("maint", 0, 10, Bitmap::new(4), "n0".into(), vec![], vec![])
            .is_err());
    }
}
