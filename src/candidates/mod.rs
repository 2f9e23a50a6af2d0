//! Sentinel interpretation of reassembled discovery replies.
//!
//! A record's `pid_retval` field is overloaded: positive values are owning
//! pids of real candidates, zero delimits sections of a switch reply, and
//! negative values carry the collaborator's return code. Every well-formed
//! reply ends with a retval record; parsing tolerates replies that do not,
//! and never looks at more than the wire cap of records.

use crate::channel::{RawRecord, MAX_N_FIND, MAX_N_SWITCH};

/// A migratable page discovered by the collaborator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Candidate {
    pub addr: u64,
    pub pid: i32,
}

/// Parsed single-direction reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateBatch {
    pub candidates: Vec<Candidate>,
    pub retval: i32,
}

/// Parsed switch reply: the NVRAM→DRAM movers, then the DRAM→NVRAM movers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwitchBatch {
    pub to_dram: Vec<Candidate>,
    pub to_nvram: Vec<Candidate>,
    pub retval: i32,
}

/// Consumes one section: candidates up to `cap`, then the terminating
/// sentinel if present. Returns the section and the sentinel value.
fn take_section(records: &mut std::slice::Iter<'_, RawRecord>, cap: usize) -> (Vec<Candidate>, i32) {
    let mut section = Vec::new();
    for record in records {
        if record.pid_retval > 0 {
            if section.len() == cap {
                // overfull reply; drop the overflow but keep the batch
                continue;
            }
            section.push(Candidate {
                addr: record.addr,
                pid: record.pid_retval,
            });
        } else {
            return (section, record.pid_retval);
        }
    }
    (section, 0)
}

/// Parses a reply of a `DRAM_PULL`, `NVRAM_PULL`, `NVRAM_INTENSIVE`,
/// `NVRAM_WRITE` or `NVRAM_CLEAR` request.
pub fn parse_batch(records: &[RawRecord]) -> CandidateBatch {
    let mut iter = records.iter();
    let (candidates, retval) = take_section(&mut iter, MAX_N_FIND);
    CandidateBatch { candidates, retval }
}

/// Parses a `SWITCH` reply. The first section holds the NVRAM→DRAM movers,
/// a zero sentinel separates it from the DRAM→NVRAM movers, and the final
/// sentinel carries the retval.
pub fn parse_switch_batch(records: &[RawRecord]) -> SwitchBatch {
    let mut iter = records.iter();
    let (to_dram, sep) = take_section(&mut iter, MAX_N_SWITCH);
    if sep < 0 {
        // retval before any separator; there is no second section
        return SwitchBatch {
            to_dram,
            to_nvram: Vec::new(),
            retval: sep,
        };
    }
    let (to_nvram, retval) = take_section(&mut iter, MAX_N_SWITCH);
    SwitchBatch {
        to_dram,
        to_nvram,
        retval,
    }
}
