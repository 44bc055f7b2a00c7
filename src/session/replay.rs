//! Transaction recording and replay bookkeeping.
//!
//! While a transaction runs, every statement and a rolling checksum of its
//! replies are recorded. After a mid-transaction backend failure the
//! recorded statements are re-executed on a fresh master connection and
//! the replayed reply checksum is compared against the original; only a
//! matching replay lets the session carry on as if nothing happened.

use std::collections::VecDeque;
use std::time::Duration;

use sha1::{Digest, Sha1};

use crate::config::{RouterConfig, TrxChecksum};
use crate::protocol::{Packet, ReplyTracker};
use crate::worker::clock::Stopwatch;

/// A recorded transaction
#[derive(Debug, Clone, Default)]
pub struct Trx {
    stmts: VecDeque<RecordedStmt>,
    size: u64,
    checksum: Option<Sha1>,
}

#[derive(Debug, Clone)]
pub struct RecordedStmt {
    pub packet: Packet,
    /// The reply to this statement is part of the checksum
    pub checksummed: bool,
}

impl Trx {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn have_stmts(&self) -> bool {
        !self.stmts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.stmts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stmts.is_empty() && self.checksum.is_none()
    }

    /// Total bytes of recorded statements
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn add_stmt(&mut self, packet: Packet, checksummed: bool) {
        self.size += packet.wire_len() as u64;
        self.stmts.push_back(RecordedStmt { packet, checksummed });
    }

    /// Fold one reply packet into the rolling checksum
    pub fn add_result(&mut self, payload: &[u8]) {
        self.checksum
            .get_or_insert_with(Sha1::new)
            .update(payload);
    }

    pub fn pop_stmt(&mut self) -> Option<RecordedStmt> {
        self.stmts.pop_front()
    }

    /// Digest of all checksummed replies so far
    pub fn checksum(&self) -> [u8; 20] {
        match &self.checksum {
            Some(hasher) => hasher.clone().finalize().into(),
            None => [0; 20],
        }
    }

    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

/// Whether a completed reply participates in the transaction checksum
pub fn include_in_checksum(
    mode: TrxChecksum,
    tracker: &ReplyTracker,
    uses_last_insert_id: bool,
) -> bool {
    match mode {
        TrxChecksum::Full => true,
        TrxChecksum::ResultOnly => !tracker.is_ok(),
        TrxChecksum::NoInsertId => !tracker.is_ok() && !uses_last_insert_id,
    }
}

/// Replay attempt accounting: bounded by the attempt cap and the time cap,
/// whichever exhausts first
#[derive(Debug)]
pub struct ReplayBudget {
    attempts: u64,
    max_attempts: u64,
    timeout: Option<Duration>,
    timer: Option<Stopwatch>,
}

impl ReplayBudget {
    pub fn new(config: &RouterConfig) -> Self {
        Self {
            attempts: 0,
            max_attempts: config.trx_max_attempts,
            timeout: config.trx_timeout(),
            timer: None,
        }
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    /// May another replay attempt start?
    pub fn can_retry(&self) -> bool {
        if self.attempts >= self.max_attempts {
            return false;
        }
        match (self.timeout, &self.timer) {
            (Some(timeout), Some(timer)) => timer.split() < timeout,
            _ => true,
        }
    }

    /// Account the start of an attempt; the timer runs from the first one
    pub fn start_attempt(&mut self) {
        self.attempts += 1;
        if self.timer.is_none() {
            self.timer = Some(Stopwatch::start());
        }
    }

    pub fn reset(&mut self) {
        self.attempts = 0;
        self.timer = None;
    }
}
