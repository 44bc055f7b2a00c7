//! Reply packets and response reassembly.
//!
//! The proxy forwards backend responses packet by packet but still has to
//! know where one response ends: the router correlates replies with
//! statements, the transaction recorder checksums them and the causal-read
//! path strips a hidden leading result. `ReplyTracker` is that state
//! machine.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::packet::{capabilities::*, Packet};

/// Server status flag: a transaction is open
pub const SERVER_STATUS_IN_TRANS: u16 = 0x0001;
/// Server status flag: autocommit is enabled
pub const SERVER_STATUS_AUTOCOMMIT: u16 = 0x0002;
/// Server status flag: more result sets follow
pub const SERVER_MORE_RESULTS_EXISTS: u16 = 0x0008;
/// Server status flag: session state change information is present
pub const SERVER_SESSION_STATE_CHANGED: u16 = 0x4000;

/// Session-track entry type for system variable changes
const SESSION_TRACK_SYSTEM_VARIABLES: u8 = 0x00;

/// OK packet
#[derive(Debug, Clone, Default)]
pub struct OkPacket {
    pub affected_rows: u64,
    pub last_insert_id: u64,
    pub status_flags: u16,
    pub warnings: u16,
    /// Tracked system-variable changes (name, value), present when the
    /// server reports session state changes
    pub tracked_vars: Vec<(String, String)>,
}

impl OkPacket {
    pub fn new() -> Self {
        Self {
            status_flags: SERVER_STATUS_AUTOCOMMIT,
            ..Self::default()
        }
    }

    /// Value of a tracked system variable, e.g. `last_gtid`
    pub fn tracked_var(&self, name: &str) -> Option<&str> {
        self.tracked_vars
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0x00);
        put_lenenc_int(&mut buf, self.affected_rows);
        put_lenenc_int(&mut buf, self.last_insert_id);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u16_le(self.status_flags);
            buf.put_u16_le(self.warnings);
        }

        if capabilities & CLIENT_SESSION_TRACK != 0 && !self.tracked_vars.is_empty() {
            // Human-readable info string is empty
            put_lenenc_int(&mut buf, 0);

            let mut track = BytesMut::new();
            for (name, value) in &self.tracked_vars {
                let mut entry = BytesMut::new();
                put_lenenc_str(&mut entry, name.as_bytes());
                put_lenenc_str(&mut entry, value.as_bytes());

                track.put_u8(SESSION_TRACK_SYSTEM_VARIABLES);
                put_lenenc_str(&mut track, &entry);
            }
            put_lenenc_str(&mut buf, &track);
        }

        Packet::new(sequence_id, buf.freeze())
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8], capabilities: u32) -> Option<Self> {
        if payload.first() != Some(&0x00) {
            return None;
        }

        let mut buf = &payload[1..];
        let affected_rows = get_lenenc_int(&mut buf)?;
        let last_insert_id = get_lenenc_int(&mut buf)?;

        let (status_flags, warnings) = if capabilities & CLIENT_PROTOCOL_41 != 0 {
            if buf.len() < 4 {
                return None;
            }
            (buf.get_u16_le(), buf.get_u16_le())
        } else {
            (0, 0)
        };

        let mut tracked_vars = Vec::new();
        if capabilities & CLIENT_SESSION_TRACK != 0 && !buf.is_empty() {
            // Info string
            let _info = get_lenenc_str(&mut buf)?;

            if status_flags & SERVER_SESSION_STATE_CHANGED != 0 {
                let mut track = get_lenenc_str(&mut buf)?;
                while !track.is_empty() {
                    let entry_type = track.get_u8();
                    let mut entry = get_lenenc_str(&mut track)?;
                    if entry_type == SESSION_TRACK_SYSTEM_VARIABLES {
                        let name = get_lenenc_str(&mut entry)?;
                        let value = get_lenenc_str(&mut entry)?;
                        tracked_vars.push((
                            String::from_utf8_lossy(name).to_string(),
                            String::from_utf8_lossy(value).to_string(),
                        ));
                    }
                }
            }
        }

        Some(Self {
            affected_rows,
            last_insert_id,
            status_flags,
            warnings,
            tracked_vars,
        })
    }
}

/// ERR packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrPacket {
    pub error_code: u16,
    pub sql_state: String,
    pub error_message: String,
}

impl ErrPacket {
    pub fn new(error_code: u16, sql_state: &str, error_message: &str) -> Self {
        Self {
            error_code,
            sql_state: sql_state.to_string(),
            error_message: error_message.to_string(),
        }
    }

    /// ER_LOCK_DEADLOCK: the statement was rolled back by the server
    pub fn is_deadlock(&self) -> bool {
        self.error_code == 1213
    }

    pub fn encode(&self, sequence_id: u8, capabilities: u32) -> Packet {
        let mut buf = BytesMut::new();

        buf.put_u8(0xFF);
        buf.put_u16_le(self.error_code);

        if capabilities & CLIENT_PROTOCOL_41 != 0 {
            buf.put_u8(b'#');
            buf.extend_from_slice(self.sql_state.as_bytes());
        }

        buf.extend_from_slice(self.error_message.as_bytes());

        Packet::new(sequence_id, buf.freeze())
    }

    /// Parse from packet payload
    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFF) {
            return None;
        }

        let mut buf = &payload[1..];
        if buf.len() < 2 {
            return None;
        }

        let error_code = buf.get_u16_le();

        let (sql_state, error_message) = if !buf.is_empty() && buf[0] == b'#' && buf.len() >= 6 {
            let sql_state = String::from_utf8_lossy(&buf[1..6]).to_string();
            let error_message = String::from_utf8_lossy(&buf[6..]).to_string();
            (sql_state, error_message)
        } else {
            ("HY000".to_string(), String::from_utf8_lossy(buf).to_string())
        };

        Some(Self {
            error_code,
            sql_state,
            error_message,
        })
    }
}

/// EOF packet (non-DEPRECATE_EOF mode)
#[derive(Debug, Clone, Copy, Default)]
pub struct EofPacket {
    pub warnings: u16,
    pub status_flags: u16,
}

impl EofPacket {
    pub fn encode(&self, sequence_id: u8) -> Packet {
        let mut buf = BytesMut::with_capacity(5);
        buf.put_u8(0xFE);
        buf.put_u16_le(self.warnings);
        buf.put_u16_le(self.status_flags);
        Packet::new(sequence_id, buf.freeze())
    }

    pub fn parse(payload: &[u8]) -> Option<Self> {
        if payload.first() != Some(&0xFE) || payload.len() >= 9 {
            return None;
        }
        let mut buf = &payload[1..];
        if buf.len() < 4 {
            return Some(Self::default());
        }
        Some(Self {
            warnings: buf.get_u16_le(),
            status_flags: buf.get_u16_le(),
        })
    }
}

/// Build a protocol error packet
pub fn make_error(code: u16, sqlstate: &str, msg: &str) -> Packet {
    ErrPacket::new(code, sqlstate, msg).encode(1, CLIENT_PROTOCOL_41)
}

/// Build a plain OK packet
pub fn make_ok() -> Packet {
    OkPacket::new().encode(1, CLIENT_PROTOCOL_41)
}

pub fn is_ok_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0x00
}

pub fn is_err_packet(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0xFF
}

pub fn is_eof_packet(payload: &Bytes, capabilities: u32) -> bool {
    if capabilities & CLIENT_DEPRECATE_EOF != 0 {
        false
    } else {
        !payload.is_empty() && payload[0] == 0xFE && payload.len() < 9
    }
}

/// LOCAL INFILE request (backend asks the client for file contents)
pub fn is_local_infile_request(payload: &Bytes) -> bool {
    !payload.is_empty() && payload[0] == 0xFB
}

/// Reassembly state of one backend response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReplyState {
    /// Expecting OK/ERR/LOCAL-INFILE or a column count
    Command,
    /// Expecting a COM_STMT_PREPARE response header
    PrepareHeader,
    /// Parameter definitions of a prepared statement
    PrepareParamDefs { remaining: u16, columns: u16 },
    /// EOF terminating the parameter definitions
    PrepareParamEof { columns: u16 },
    /// Column definitions of a prepared statement
    PrepareColDefs { remaining: u16 },
    PrepareColEof,
    /// Reading column definitions
    ColumnDefs { remaining: u64 },
    /// Expecting the EOF that terminates column definitions
    ColumnEof,
    /// Reading result rows
    Rows,
    Complete,
}

/// Tracks the packets of a single statement's response and reports when it
/// is complete. One tracker is used per in-flight statement per backend.
#[derive(Debug)]
pub struct ReplyTracker {
    capabilities: u32,
    state: ReplyState,
    collect_rows: bool,
    rows: Vec<Bytes>,
    ok: Option<OkPacket>,
    error: Option<ErrPacket>,
    server_status: u16,
    local_infile: bool,
}

impl ReplyTracker {
    pub fn new(capabilities: u32) -> Self {
        Self {
            capabilities,
            state: ReplyState::Command,
            collect_rows: false,
            rows: Vec::new(),
            ok: None,
            error: None,
            server_status: 0,
            local_infile: false,
        }
    }

    /// A tracker aware of command-specific reply shapes: COM_STMT_PREPARE
    /// answers with a header plus definition packets, COM_FIELD_LIST with
    /// bare column definitions up to an EOF.
    pub fn for_command(capabilities: u32, command: Option<super::packet::Command>) -> Self {
        let mut tracker = Self::new(capabilities);
        match command {
            Some(super::packet::Command::StmtPrepare) => {
                tracker.state = ReplyState::PrepareHeader;
            }
            Some(super::packet::Command::FieldList) => {
                tracker.state = ReplyState::Rows;
            }
            _ => {}
        }
        tracker
    }

    /// Collect raw row payloads (used by the GTID probe)
    pub fn collecting_rows(mut self) -> Self {
        self.collect_rows = true;
        self
    }

    pub fn is_complete(&self) -> bool {
        self.state == ReplyState::Complete
    }

    pub fn error(&self) -> Option<&ErrPacket> {
        self.error.as_ref()
    }

    pub fn ok(&self) -> Option<&OkPacket> {
        self.ok.as_ref()
    }

    /// The reply was a plain OK (no result set, no error)
    pub fn is_ok(&self) -> bool {
        self.ok.is_some() && self.error.is_none()
    }

    pub fn server_status(&self) -> u16 {
        self.server_status
    }

    pub fn is_local_infile(&self) -> bool {
        self.local_infile
    }

    pub fn rows(&self) -> &[Bytes] {
        &self.rows
    }

    fn after_prepare_header(params: u16, columns: u16) -> ReplyState {
        if params > 0 {
            ReplyState::PrepareParamDefs {
                remaining: params,
                columns,
            }
        } else {
            Self::after_prepare_params(columns)
        }
    }

    fn after_prepare_params(columns: u16) -> ReplyState {
        if columns > 0 {
            ReplyState::PrepareColDefs { remaining: columns }
        } else {
            ReplyState::Complete
        }
    }

    /// Feed the next reply packet. Returns true when the response is
    /// complete after this packet.
    pub fn observe(&mut self, packet: &Packet) -> bool {
        let payload = &packet.payload;

        match self.state {
            ReplyState::Command => {
                if is_err_packet(payload) {
                    self.error = ErrPacket::parse(payload);
                    self.state = ReplyState::Complete;
                } else if is_ok_packet(payload) {
                    let ok = OkPacket::parse(payload, self.capabilities).unwrap_or_default();
                    self.server_status = ok.status_flags;
                    let more = ok.status_flags & SERVER_MORE_RESULTS_EXISTS != 0;
                    self.ok = Some(ok);
                    self.state = if more {
                        ReplyState::Command
                    } else {
                        ReplyState::Complete
                    };
                } else if is_local_infile_request(payload) {
                    self.local_infile = true;
                    self.state = ReplyState::Complete;
                } else {
                    let mut buf = payload.as_ref();
                    let columns = get_lenenc_int(&mut buf).unwrap_or(0);
                    self.state = ReplyState::ColumnDefs { remaining: columns };
                }
            }
            ReplyState::PrepareHeader => {
                if is_err_packet(payload) {
                    self.error = ErrPacket::parse(payload);
                    self.state = ReplyState::Complete;
                } else if payload.len() >= 9 {
                    // [0x00][stmt_id:4][columns:2][params:2]...
                    let columns = u16::from_le_bytes([payload[5], payload[6]]);
                    let params = u16::from_le_bytes([payload[7], payload[8]]);
                    self.state = Self::after_prepare_header(params, columns);
                } else {
                    self.state = ReplyState::Complete;
                }
            }
            ReplyState::PrepareParamDefs { remaining, columns } => {
                let remaining = remaining.saturating_sub(1);
                self.state = if remaining > 0 {
                    ReplyState::PrepareParamDefs { remaining, columns }
                } else if self.capabilities & CLIENT_DEPRECATE_EOF == 0 {
                    ReplyState::PrepareParamEof { columns }
                } else {
                    Self::after_prepare_params(columns)
                };
            }
            ReplyState::PrepareParamEof { columns } => {
                self.state = Self::after_prepare_params(columns);
            }
            ReplyState::PrepareColDefs { remaining } => {
                let remaining = remaining.saturating_sub(1);
                self.state = if remaining > 0 {
                    ReplyState::PrepareColDefs { remaining }
                } else if self.capabilities & CLIENT_DEPRECATE_EOF == 0 {
                    ReplyState::PrepareColEof
                } else {
                    ReplyState::Complete
                };
            }
            ReplyState::PrepareColEof => {
                self.state = ReplyState::Complete;
            }
            ReplyState::ColumnDefs { remaining } => {
                let remaining = remaining.saturating_sub(1);
                if remaining == 0 {
                    self.state = if self.capabilities & CLIENT_DEPRECATE_EOF != 0 {
                        ReplyState::Rows
                    } else {
                        ReplyState::ColumnEof
                    };
                } else {
                    self.state = ReplyState::ColumnDefs { remaining };
                }
            }
            ReplyState::ColumnEof => {
                self.state = ReplyState::Rows;
            }
            ReplyState::Rows => {
                if is_err_packet(payload) {
                    self.error = ErrPacket::parse(payload);
                    self.state = ReplyState::Complete;
                } else if let Some(eof) = EofPacket::parse(payload) {
                    self.server_status = eof.status_flags;
                    self.state = if eof.status_flags & SERVER_MORE_RESULTS_EXISTS != 0 {
                        ReplyState::Command
                    } else {
                        ReplyState::Complete
                    };
                } else if self.collect_rows {
                    self.rows.push(payload.clone());
                }
            }
            ReplyState::Complete => {}
        }

        self.is_complete()
    }
}

/// Read a length-encoded integer, advancing the buffer
pub fn get_lenenc_int(buf: &mut &[u8]) -> Option<u64> {
    if buf.is_empty() {
        return None;
    }
    let first = buf[0];
    match first {
        0..=0xFA => {
            buf.advance(1);
            Some(first as u64)
        }
        0xFC if buf.len() >= 3 => {
            buf.advance(1);
            Some(buf.get_u16_le() as u64)
        }
        0xFD if buf.len() >= 4 => {
            buf.advance(1);
            let v = buf[0] as u64 | ((buf[1] as u64) << 8) | ((buf[2] as u64) << 16);
            buf.advance(3);
            Some(v)
        }
        0xFE if buf.len() >= 9 => {
            buf.advance(1);
            Some(buf.get_u64_le())
        }
        _ => None,
    }
}

/// Read a length-encoded string, advancing the buffer
fn get_lenenc_str<'a>(buf: &mut &'a [u8]) -> Option<&'a [u8]> {
    let len = get_lenenc_int(buf)? as usize;
    if buf.len() < len {
        return None;
    }
    let (head, tail) = buf.split_at(len);
    *buf = tail;
    Some(head)
}

/// Write a length-encoded integer
pub fn put_lenenc_int(buf: &mut BytesMut, value: u64) {
    if value < 251 {
        buf.put_u8(value as u8);
    } else if value < 65_536 {
        buf.put_u8(0xFC);
        buf.put_u16_le(value as u16);
    } else if value < 16_777_216 {
        buf.put_u8(0xFD);
        buf.put_u8((value & 0xFF) as u8);
        buf.put_u8(((value >> 8) & 0xFF) as u8);
        buf.put_u8(((value >> 16) & 0xFF) as u8);
    } else {
        buf.put_u8(0xFE);
        buf.put_u64_le(value);
    }
}

/// Write a length-encoded string
pub fn put_lenenc_str(buf: &mut BytesMut, value: &[u8]) {
    put_lenenc_int(buf, value.len() as u64);
    buf.extend_from_slice(value);
}
