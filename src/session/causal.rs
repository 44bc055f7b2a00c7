//! Causal reads.
//!
//! A causal read must observe the effects of the session's (or service's)
//! most recent write. Local/Global/Universal modes prepend a GTID wait to
//! the read and hide its result from the client; Fast mode instead only
//! routes to replicas already known to be caught up.
//!
//! The wait and the user statement travel in one multi-statement packet,
//! so a timed-out wait also prevents the read from executing:
//! the CASE either yields 1 (synced) or an error from the nested
//! single-row-subquery SELECT against INFORMATION_SCHEMA.ENGINES.

use bytes::{BufMut, BytesMut};

use crate::config::CausalReadsMode;
use crate::protocol::{Command, Packet};
use crate::router::{Gtid, RouterShared};

/// Hidden session variable the wait result is assigned to; never visible
/// to the client
const SYNC_MARKER: &str = "@hermes_gtid_sync";

/// State of the GTID bookkeeping across one causal read
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitGtidState {
    #[default]
    None,
    /// The GTID probe for universal mode is in flight
    ReadingGtid,
    /// The probe completed; local-style waits may proceed
    GtidReadDone,
}

#[derive(Debug, Default)]
pub struct CausalState {
    mode: CausalReadsMode,
    /// Session-local position, updated from master OK packets
    gtid_pos: Option<Gtid>,
    wait_state: WaitGtidState,
}

impl CausalState {
    pub fn new(mode: CausalReadsMode) -> Self {
        Self {
            mode,
            gtid_pos: None,
            wait_state: WaitGtidState::None,
        }
    }

    pub fn mode(&self) -> CausalReadsMode {
        self.mode
    }

    pub fn gtid_pos(&self) -> Option<Gtid> {
        self.gtid_pos
    }

    /// Record the GTID a master write reached, from the OK packet's
    /// tracked `last_gtid`
    pub fn record_write_gtid(&mut self, gtid: Gtid, shared: &RouterShared) {
        if self.mode == CausalReadsMode::Global {
            shared.set_last_gtid(gtid);
        } else {
            self.gtid_pos = Some(gtid);
        }
    }

    /// The position a slave read must wait for, if any
    pub fn wait_position(&self, shared: &RouterShared) -> Option<Gtid> {
        match self.mode {
            CausalReadsMode::None | CausalReadsMode::Fast => None,
            CausalReadsMode::Local => self.gtid_pos,
            CausalReadsMode::Global => shared.last_gtid(),
            CausalReadsMode::Universal => match self.wait_state {
                WaitGtidState::GtidReadDone => self.gtid_pos,
                _ => None,
            },
        }
    }

    /// Whether the next slave read needs a GTID-wait prefix
    pub fn should_do_causal_read(&self, shared: &RouterShared) -> bool {
        match self.mode {
            CausalReadsMode::Local => self.gtid_pos.is_some(),
            CausalReadsMode::Global => shared.last_gtid().is_some(),
            CausalReadsMode::Universal => {
                self.wait_state == WaitGtidState::GtidReadDone && self.gtid_pos.is_some()
            }
            CausalReadsMode::None | CausalReadsMode::Fast => false,
        }
    }

    /// Universal mode: a one-time probe of the master's position is needed
    /// before the first causal read
    pub fn needs_gtid_probe(&self) -> bool {
        self.mode == CausalReadsMode::Universal && self.wait_state == WaitGtidState::None
    }

    pub fn probe_packet(&mut self) -> Packet {
        self.wait_state = WaitGtidState::ReadingGtid;
        Packet::query("SELECT @@gtid_current_pos")
    }

    /// Consume the probe's single-row result
    pub fn complete_probe(&mut self, row: &[u8]) {
        let mut buf = row;
        if let Some(value) = crate::protocol::reply::get_lenenc_int(&mut buf)
            .and_then(|len| buf.get(..len as usize))
        {
            self.gtid_pos = Gtid::parse(&String::from_utf8_lossy(value));
        }
        self.wait_state = WaitGtidState::GtidReadDone;
    }

    /// Fast mode routes to caught-up replicas only; the required position
    /// is the session's last write
    pub fn fast_required_gtid(&self) -> Option<Gtid> {
        (self.mode == CausalReadsMode::Fast)
            .then_some(self.gtid_pos)
            .flatten()
    }

    /// Fast mode still tracks the write position from master OKs
    pub fn record_fast_gtid(&mut self, gtid: Gtid) {
        self.gtid_pos = Some(gtid);
    }
}

/// Prepend the GTID wait to a COM_QUERY packet. Returns None when the
/// packet is not a query or the combined statement would exceed the
/// protocol packet limit (the read then goes out unmodified).
pub fn add_prefix_wait_gtid(
    packet: &Packet,
    gtid: &Gtid,
    timeout_secs: u64,
) -> Option<Packet> {
    if packet.command() != Some(Command::Query) {
        return None;
    }

    let prefix = format!(
        "SET {SYNC_MARKER}=(SELECT CASE WHEN MASTER_GTID_WAIT('{gtid}', {timeout_secs}) = 0 \
         THEN 1 ELSE (SELECT 1 FROM INFORMATION_SCHEMA.ENGINES) END);"
    );

    let original_sql = &packet.payload[1..];
    if prefix.len() + original_sql.len() + 1 >= crate::protocol::MAX_PACKET_SIZE {
        return None;
    }

    let mut buf = BytesMut::with_capacity(1 + prefix.len() + original_sql.len());
    buf.put_u8(Command::Query as u8);
    buf.extend_from_slice(prefix.as_bytes());
    buf.extend_from_slice(original_sql);
    Some(Packet::new(packet.sequence_id, buf.freeze()))
}
