use std::collections::{HashMap, HashSet};

use crate::classifier::TypeMask;
use crate::protocol::SERVER_STATUS_IN_TRANS;
use crate::topology::ServerId;

/// What a statement does to the transaction state, decided at routing time
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrxEvent {
    None,
    Starting,
    Ending,
}

/// A prepared statement the session knows about
#[derive(Debug, Clone)]
pub struct PreparedInfo {
    /// The prepared statement is a pure read and may execute on a slave
    pub read_only: bool,
}

/// Per-session protocol and transaction state
#[derive(Debug, Default)]
pub struct SessionState {
    pub username: String,
    pub database: Option<String>,
    pub capability_flags: u32,
    pub character_set: u8,

    /// Autocommit as the session sees it; MySQL defaults to on
    pub autocommit: bool,
    pub trx_open: bool,
    pub trx_read_only: bool,
    /// Access mode set by an unscoped SET TRANSACTION, consumed by the
    /// next transaction only
    pub next_trx_read_only: Option<bool>,
    /// Session default from SET SESSION TRANSACTION READ ONLY/WRITE
    pub default_trx_read_only: bool,
    /// Backend the open transaction is pinned to
    pub trx_target: Option<ServerId>,

    /// Permanently routed to the master (strict multi-statement or
    /// stored-procedure lock)
    pub locked_to_master: bool,

    /// Tables created with CREATE TEMPORARY TABLE; they exist only on the
    /// server that created them
    pub tmp_tables: HashSet<String>,
    /// Text-protocol prepared statements by name
    pub prepared: HashMap<String, PreparedInfo>,

    /// Backend used by the previous statement
    pub last_used: Option<ServerId>,
    /// A LOAD DATA LOCAL INFILE transfer is in progress
    pub load_data_active: bool,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            autocommit: true,
            ..Self::default()
        }
    }

    pub fn set_from_handshake(
        &mut self,
        username: String,
        database: Option<String>,
        capabilities: u32,
        charset: u8,
    ) {
        self.username = username;
        self.database = database;
        self.capability_flags = capabilities;
        self.character_set = charset;
    }

    /// Apply the transaction-relevant bits of a statement at routing time.
    /// Returns what the statement does to the transaction.
    pub fn on_route(&mut self, mask: TypeMask) -> TrxEvent {
        if mask.contains(TypeMask::ENABLE_AUTOCOMMIT) {
            self.autocommit = true;
            if self.trx_open {
                return self.trx_ending();
            }
            return TrxEvent::None;
        }
        if mask.contains(TypeMask::DISABLE_AUTOCOMMIT) {
            self.autocommit = false;
            if !self.trx_open {
                return self.trx_starting(mask);
            }
            return TrxEvent::None;
        }

        if mask.contains(TypeMask::NEXT_TRX) {
            self.next_trx_read_only = Some(mask.contains(TypeMask::READONLY));
            return TrxEvent::None;
        }
        if mask.contains(TypeMask::SESSION_WRITE)
            && mask.intersects(TypeMask::READONLY | TypeMask::READWRITE)
        {
            self.default_trx_read_only = mask.contains(TypeMask::READONLY);
            return TrxEvent::None;
        }

        if mask.contains(TypeMask::BEGIN_TRX) {
            return self.trx_starting(mask);
        }
        if mask.intersects(TypeMask::COMMIT | TypeMask::ROLLBACK) && self.trx_open {
            return self.trx_ending();
        }

        TrxEvent::None
    }

    fn trx_starting(&mut self, mask: TypeMask) -> TrxEvent {
        self.trx_open = true;
        self.trx_read_only = if mask.contains(TypeMask::READONLY) {
            true
        } else if mask.contains(TypeMask::READWRITE) {
            false
        } else {
            self.next_trx_read_only
                .take()
                .unwrap_or(self.default_trx_read_only)
        };
        self.trx_target = None;
        TrxEvent::Starting
    }

    fn trx_ending(&mut self) -> TrxEvent {
        TrxEvent::Ending
    }

    /// A COMMIT/ROLLBACK (or autocommit re-enable) completed successfully
    pub fn finish_trx(&mut self) {
        self.trx_open = false;
        self.trx_read_only = false;
        self.trx_target = None;
    }

    /// Reconcile with the transaction flag the server reports in OK
    /// packets. With autocommit off the server only raises the flag once
    /// a statement has run, so its absence does not end the transaction.
    pub fn on_server_status(&mut self, status: u16) {
        let server_in_trx = status & SERVER_STATUS_IN_TRANS != 0;
        if server_in_trx {
            self.trx_open = true;
        } else if self.trx_open && self.autocommit {
            self.finish_trx();
        }
    }

    pub fn change_database(&mut self, db: String) {
        self.database = Some(db);
    }

    /// Does the statement read any table known to be temporary?
    pub fn reads_tmp_table(&self, tables: &[String]) -> bool {
        !self.tmp_tables.is_empty()
            && tables
                .iter()
                .any(|t| self.tmp_tables.contains(&normalize_table(t)))
    }

    pub fn add_tmp_table(&mut self, table: &str) {
        self.tmp_tables.insert(normalize_table(table));
    }

    pub fn drop_tmp_tables(&mut self, tables: &[String]) {
        for table in tables {
            self.tmp_tables.remove(&normalize_table(table));
        }
    }

    /// The master moved: temporary tables lived on the old one
    pub fn master_replaced(&mut self) {
        self.tmp_tables.clear();
    }
}

fn normalize_table(table: &str) -> String {
    table.trim_matches('`').to_ascii_lowercase()
}
