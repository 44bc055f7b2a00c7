//! Session-command history.
//!
//! Statements that change session state (SET, USE, prepared-statement
//! management) are recorded in order and replayed onto every freshly
//! opened backend connection before it sees user queries. Each backend
//! that executes a command acknowledges it; once every server that could
//! still need a command has acknowledged it, the list is trimmed to the
//! oldest unacked entry, so the history stays bounded for long-lived
//! sessions. The log also remembers the kind of reply each command
//! produced originally; a backend whose replay acknowledgements diverge
//! is evicted.

use crate::protocol::Packet;
use crate::topology::ServerId;

#[derive(Debug, Clone)]
pub struct HistoryEntry {
    pub position: u64,
    pub packet: Packet,
    /// Backends that have executed this command
    pub acked_by: Vec<ServerId>,
    /// First byte of the original reply (0x00 OK, 0xFF ERR), once known
    pub reply_kind: Option<u8>,
}

impl HistoryEntry {
    fn is_acked_by_all(&self, required: &[ServerId]) -> bool {
        required.iter().all(|s| self.acked_by.contains(s))
    }
}

#[derive(Debug, Default)]
pub struct SessionCommandHistory {
    entries: Vec<HistoryEntry>,
    next_position: u64,
    checksum: u32,
}

impl SessionCommandHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a session command; returns its position
    pub fn add(&mut self, packet: Packet) -> u64 {
        let position = self.next_position;
        self.next_position += 1;

        // The checksum is incremental over the appended payloads; trimming
        // does not rewind it
        let mut hasher = crc32fast::Hasher::new_with_initial(self.checksum);
        hasher.update(&packet.payload);
        self.checksum = hasher.finalize();

        self.entries.push(HistoryEntry {
            position,
            packet,
            acked_by: Vec::new(),
            reply_kind: None,
        });
        position
    }

    /// A backend executed the command successfully
    pub fn ack(&mut self, position: u64, server: ServerId, reply_kind: u8) {
        if let Some(entry) = self.entries.iter_mut().find(|e| e.position == position) {
            if entry.reply_kind.is_none() {
                entry.reply_kind = Some(reply_kind);
            }
            if !entry.acked_by.contains(&server) {
                entry.acked_by.push(server);
            }
        }
    }

    /// Trim the list to the oldest entry not yet acknowledged by every
    /// server in `required`. Everything before it has been executed
    /// wherever it could still be needed and is dropped.
    pub fn trim(&mut self, required: &[ServerId]) {
        let cut = self
            .entries
            .iter()
            .position(|e| !e.is_acked_by_all(required))
            .unwrap_or(self.entries.len());
        self.entries.drain(..cut);
    }

    /// Position of the oldest entry some server in `required` has not
    /// acknowledged yet
    pub fn oldest_unacked(&self, required: &[ServerId]) -> Option<u64> {
        self.entries
            .iter()
            .find(|e| !e.is_acked_by_all(required))
            .map(|e| e.position)
    }

    pub fn checksum(&self) -> u32 {
        self.checksum
    }

    /// Entries after `position` (exclusive), in original order; pass None
    /// for the full history
    pub fn entries_after(&self, position: Option<u64>) -> impl Iterator<Item = &HistoryEntry> {
        self.entries
            .iter()
            .filter(move |e| position.map(|p| e.position > p).unwrap_or(true))
    }

    pub fn last_position(&self) -> Option<u64> {
        self.entries.last().map(|e| e.position)
    }

    /// The retained reply kinds in order, as the replay comparison baseline
    pub fn ack_checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        for entry in &self.entries {
            hasher.update(&[entry.reply_kind.unwrap_or(0x00)]);
        }
        hasher.finalize()
    }
}
