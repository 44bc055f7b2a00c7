//! Statement classification.
//!
//! Every packet the router sees is turned into a `ClassifiedStmt`: the
//! operation, a bitmask describing how the statement interacts with session
//! and server state, and optionally the referenced fields and functions.
//! Classification is a pure function of `(packet, sql_mode, options)` and
//! the results are memoised per worker (see `cache`).

pub mod analyzer;
pub mod cache;
pub mod canonical;
pub mod trx;

pub use analyzer::Analyzer;
pub use cache::{CacheProbe, CacheStats, StmtCache};
pub use canonical::canonicalize;

use bitflags::bitflags;

use crate::protocol::Packet;

bitflags! {
    /// Statement type mask: how a statement interacts with data, session
    /// state and transaction boundaries. A statement usually carries
    /// several bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct TypeMask: u32 {
        const READ               = 1 << 0;
        const WRITE              = 1 << 1;
        /// Read that can be answered without a backend round trip
        const LOCAL_READ         = 1 << 2;
        /// Changes session state and must be replayed on new connections
        const SESSION_WRITE      = 1 << 3;
        const USERVAR_READ       = 1 << 4;
        const USERVAR_WRITE      = 1 << 5;
        const SYSVAR_READ        = 1 << 6;
        const GSYSVAR_READ       = 1 << 7;
        const GSYSVAR_WRITE      = 1 << 8;
        const BEGIN_TRX          = 1 << 9;
        const COMMIT             = 1 << 10;
        const ROLLBACK           = 1 << 11;
        const ENABLE_AUTOCOMMIT  = 1 << 12;
        const DISABLE_AUTOCOMMIT = 1 << 13;
        const PREPARE_STMT       = 1 << 14;
        const PREPARE_NAMED_STMT = 1 << 15;
        const EXEC_STMT          = 1 << 16;
        const DEALLOC_PREPARE    = 1 << 17;
        const CREATE_TMP_TABLE   = 1 << 18;
        const READ_TMP_TABLE     = 1 << 19;
        /// Transaction is declared READ ONLY
        const READONLY           = 1 << 20;
        /// Transaction is declared READ WRITE
        const READWRITE          = 1 << 21;
        /// SET TRANSACTION that affects only the next transaction
        const NEXT_TRX           = 1 << 22;
        const SHOW_DATABASES     = 1 << 23;
        const SHOW_TABLES        = 1 << 24;
    }
}

bitflags! {
    /// Optional pieces the caller wants collected during classification.
    /// An implementation may skip collecting anything not requested.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct CollectFlags: u32 {
        const FIELDS    = 1 << 0;
        const FUNCTIONS = 1 << 1;
        const TABLES    = 1 << 2;
        const DATABASES = 1 << 3;
    }
}

bitflags! {
    /// Classifier tuning options; part of the cache key context
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct ParserOptions: u32 {
        /// Treat string arguments to functions as field references
        const STRING_ARG_AS_FIELD = 1 << 0;
        /// Classify `SELECT ... INTO OUTFILE` as a write
        const SELECT_INTO_IS_WRITE = 1 << 1;
    }
}

impl TypeMask {
    /// Bits that toggle autocommit; results carrying them are session state
    /// and must never enter the classification cache
    pub fn toggles_autocommit(self) -> bool {
        self.intersects(TypeMask::ENABLE_AUTOCOMMIT | TypeMask::DISABLE_AUTOCOMMIT)
    }

    /// Only read bits are set (eligible for slave routing)
    pub fn is_read_only(self) -> bool {
        !self.is_empty()
            && (self
                & !(TypeMask::READ
                    | TypeMask::LOCAL_READ
                    | TypeMask::USERVAR_READ
                    | TypeMask::SYSVAR_READ
                    | TypeMask::GSYSVAR_READ
                    | TypeMask::SHOW_DATABASES
                    | TypeMask::SHOW_TABLES))
                .is_empty()
    }
}

/// SQL mode in effect; changes canonicalisation and classification of a few
/// constructs, so it is part of the cache key context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SqlMode {
    #[default]
    Default,
    Oracle,
}

/// How far classification got
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParseStatus {
    /// The statement could not be interpreted at all
    Invalid,
    /// Only keyword-level tokenisation succeeded
    Tokenised,
    /// The statement parsed partially (e.g. unsupported tail clauses)
    PartiallyParsed,
    #[default]
    Parsed,
}

/// The statement operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StmtOp {
    Select,
    Insert,
    Update,
    Delete,
    Create,
    Drop,
    Alter,
    Grant,
    Revoke,
    Set,
    SetTransaction,
    Show,
    Kill,
    Call,
    Explain,
    ChangeDb,
    Load,
    LoadLocal,
    Truncate,
    #[default]
    Undefined,
}

/// Target of a KILL statement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KillTarget {
    pub thread_id: u64,
    /// KILL QUERY terminates the statement only, not the connection
    pub query_only: bool,
}

/// The result of classifying one packet
#[derive(Debug, Clone, Default)]
pub struct ClassifiedStmt {
    pub parse_status: ParseStatus,
    pub op: StmtOp,
    pub type_mask: TypeMask,
    pub fields: Vec<String>,
    pub functions: Vec<String>,
    pub tables: Vec<String>,
    /// Name of a text-protocol prepared statement (PREPARE/EXECUTE/DEALLOCATE)
    pub prepared_name: Option<String>,
    pub kill_target: Option<KillTarget>,
    /// The packet contains more than one statement
    pub multi_stmt: bool,
}

impl ClassifiedStmt {
    pub fn invalid() -> Self {
        Self {
            parse_status: ParseStatus::Invalid,
            ..Self::default()
        }
    }

    pub fn uses_function(&self, name: &str) -> bool {
        self.functions.iter().any(|f| f.eq_ignore_ascii_case(name))
    }
}

/// The classifier contract. Implementations must be deterministic: for a
/// fixed `(sql_mode, options)` the same packet always yields the same
/// result.
pub trait SqlParser {
    fn parse(&self, packet: &Packet, collect: CollectFlags) -> ClassifiedStmt;

    /// Canonical form of the statement: comments and literal values
    /// removed, whitespace collapsed. Stable across the process lifetime.
    fn canonical(&self, packet: &Packet) -> String;

    /// For PREPARE statements, the statement being prepared as a packet of
    /// its own
    fn get_preparable_stmt(&self, packet: &Packet) -> Option<Packet>;

    fn set_sql_mode(&mut self, mode: SqlMode);
    fn set_options(&mut self, options: ParserOptions);
    fn set_server_version(&mut self, version: u32);
}
