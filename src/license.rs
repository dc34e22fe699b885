//! Counted license ledger.
//!
//! Licenses are cluster-wide consumable counters. A job names the
//! licenses it needs as `name:count,name2` at submit; the scheduler
//! only starts the job when every named license has enough free units.

use std::collections::HashMap;

use crate::config::Config;
use crate::error::{SchedError, SchedResult};

#[derive(Debug, Clone)]
pub struct License {
    pub total: u32,
    pub used: u32,
}

#[derive(Default)]
pub struct LicenseLedger {
    licenses: HashMap<String, License>,
}

/// Parse a job's license specification. `None`/empty means no licenses.
pub fn parse_spec(spec: Option<&str>) -> SchedResult<Vec<(String, u32)>> {
    let Some(spec) = spec else {
        return Ok(Vec::new());
    };
    let mut out = Vec::new();
    for item in spec.split(',').filter(|s| !s.is_empty()) {
        let (name, cnt) = match item.split_once(':') {
            Some((n, c)) => (n, c.parse::<u32>().map_err(|_| SchedError::InvalidLicenses)?),
            None => (item, 1),
        };
        if name.is_empty() || cnt == 0 {
            return Err(SchedError::InvalidLicenses);
        }
        out.push((name.to_string(), cnt));
    }
    Ok(out)
}

impl LicenseLedger {
    pub fn from_config(cfg: &Config) -> LicenseLedger {
        let licenses = cfg
            .licenses
            .iter()
            .map(|l| {
                (
                    l.name.clone(),
                    License {
                        total: l.total,
                        used: 0,
                    },
                )
            })
            .collect();
        LicenseLedger { licenses }
    }

    /// Validate that every license named in `spec` exists and its count
    /// never exceeds the configured total.
    pub fn validate(&self, spec: Option<&str>) -> SchedResult<Vec<(String, u32)>> {
        let wanted = parse_spec(spec)?;
        for (name, cnt) in &wanted {
            match self.licenses.get(name) {
                Some(l) if *cnt <= l.total => {}
                _ => return Err(SchedError::InvalidLicenses),
            }
        }
        Ok(wanted)
    }

    /// Can the job's licenses be satisfied right now?
    pub fn test(&self, wanted: &[(String, u32)]) -> bool {
        wanted.iter().all(|(name, cnt)| {
            self.licenses
                .get(name)
                .map(|l| l.used + cnt <= l.total)
                .unwrap_or(false)
        })
    }

    pub fn acquire(&mut self, wanted: &[(String, u32)]) {
        for (name, cnt) in wanted {
            if let Some(l) = self.licenses.get_mut(name) {
                l.used += cnt;
            }
        }
    }

    pub fn release(&mut self, wanted: &[(String, u32)]) {
        for (name, cnt) in wanted {
            if let Some(l) = self.licenses.get_mut(name) {
                l.used = l.used.saturating_sub(*cnt);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LicenseConfig;

    fn ledger() -> LicenseLedger {
        let mut cfg = Config::default();
        cfg.licenses = vec![LicenseConfig {
            name: "matlab".into(),
            total: 2,
        }];
        LicenseLedger::from_config(&cfg)
    }

    #[test]
    fn test_parse() {
        assert_eq!(parse_spec(None).unwrap(), vec![]);
        assert_eq!(
            parse_spec(Some("matlab:2,abaqus")).unwrap(),
            vec![("matlab".into(), 2), ("abaqus".into(), 1)]
        );
        assert!(parse_spec(Some("bad:x")).is_err());
        assert!(parse_spec(Some(":1")).is_err());
    }

    #[test]
    fn test_validate_unknown() {
        let l = ledger();
        assert!(l.validate(Some("matlab:1")).is_ok());
        assert!(l.validate(Some("matlab:3")).is_err());
        assert!(l.validate(Some("gaussian")).is_err());
    }

    #[test]
    fn test_acquire_release_cycle() {
        let mut l = ledger();
        let want = l.validate(Some("matlab:2")).unwrap();
        assert!(l.test(&want));
        l.acquire(&want);
        assert!(!l.test(&want));
        l.release(&want);
        assert!(l.test(&want));
    }
}
