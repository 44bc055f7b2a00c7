//! The default `SqlParser` implementation, built on the `sqlparser` crate
//! with a keyword pre-pass for the MySQL constructs the generic grammar
//! does not cover (PREPARE ... FROM, LOAD DATA, KILL, SHOW).
//!
//! Classification never fails: statements the parser rejects degrade to
//! `Tokenised` (keyword-level result) or `Invalid`, which the router treats
//! as "route to master".

use sqlparser::ast::{
    Expr, FunctionArg, FunctionArgExpr, Query, Select, SelectItem, SetExpr, Statement,
    TableFactor, TableWithJoins,
};
use sqlparser::dialect::MySqlDialect;
use sqlparser::parser::Parser;

use crate::protocol::{Command, Packet};

use super::canonical::canonicalize;
use super::trx::trx_type_mask;
use super::{
    ClassifiedStmt, CollectFlags, KillTarget, ParseStatus, ParserOptions, SqlMode, SqlParser,
    StmtOp, TypeMask,
};

/// sqlparser-backed classifier
pub struct Analyzer {
    dialect: MySqlDialect,
    sql_mode: SqlMode,
    options: ParserOptions,
    server_version: u32,
}

impl Default for Analyzer {
    fn default() -> Self {
        Self::new()
    }
}

impl Analyzer {
    pub fn new() -> Self {
        Self {
            dialect: MySqlDialect {},
            sql_mode: SqlMode::Default,
            options: ParserOptions::default(),
            server_version: 0,
        }
    }

    pub fn sql_mode(&self) -> SqlMode {
        self.sql_mode
    }

    pub fn options(&self) -> ParserOptions {
        self.options
    }

    fn classify_sql(&self, sql: &str, collect: CollectFlags) -> ClassifiedStmt {
        let trimmed = sql.trim();
        if trimmed.is_empty() {
            return ClassifiedStmt::invalid();
        }

        let mut stmt = ClassifiedStmt {
            multi_stmt: has_multiple_statements(trimmed),
            ..ClassifiedStmt::default()
        };

        // Transaction boundaries first: the boundary tokenizer is
        // authoritative for these and the full parse adds nothing
        let trx_mask = trx_type_mask(trimmed);
        if !trx_mask.is_empty() {
            stmt.type_mask = trx_mask;
            stmt.parse_status = ParseStatus::Parsed;
            let first = first_keyword(trimmed);
            if first.eq_ignore_ascii_case("set") {
                stmt.type_mask |= TypeMask::SESSION_WRITE;
                stmt.op = if trx_mask.contains(TypeMask::NEXT_TRX)
                    || trx_mask.contains(TypeMask::GSYSVAR_WRITE)
                {
                    StmtOp::SetTransaction
                } else {
                    StmtOp::Set
                };
            }
            return stmt;
        }

        // Keyword pre-pass for statements sqlparser cannot represent for
        // MySQL, or where a token scan is all that is needed
        if let Some(pre) = self.keyword_prepass(trimmed, &mut stmt) {
            return pre;
        }

        match Parser::parse_sql(&self.dialect, trimmed) {
            Ok(statements) if !statements.is_empty() => {
                if statements.len() > 1 {
                    stmt.multi_stmt = true;
                }
                self.classify_statement(&statements[0], collect, &mut stmt);
                self.scan_variables(trimmed, &mut stmt);
                stmt
            }
            _ => {
                self.tokenised_fallback(trimmed, &mut stmt);
                self.scan_variables(trimmed, &mut stmt);
                stmt
            }
        }
    }

    /// Statements recognised from leading keywords alone. Returns None when
    /// the statement should go through the full parser.
    fn keyword_prepass(&self, sql: &str, stmt: &mut ClassifiedStmt) -> Option<ClassifiedStmt> {
        let mut words = sql.split_whitespace();
        let first = words.next()?.to_ascii_lowercase();
        let first = first.trim_end_matches(';');

        let done = |mut s: ClassifiedStmt| {
            s.parse_status = ParseStatus::Parsed;
            Some(s)
        };

        match first {
            "show" => {
                stmt.op = StmtOp::Show;
                stmt.type_mask = TypeMask::READ;
                match words.next().map(|w| w.to_ascii_lowercase()) {
                    Some(w) if w.starts_with("database") || w.starts_with("schema") => {
                        stmt.type_mask |= TypeMask::SHOW_DATABASES;
                    }
                    Some(w) if w.starts_with("table") => {
                        stmt.type_mask |= TypeMask::SHOW_TABLES;
                    }
                    _ => {}
                }
                done(stmt.clone())
            }
            "use" => {
                stmt.op = StmtOp::ChangeDb;
                stmt.type_mask = TypeMask::SESSION_WRITE;
                done(stmt.clone())
            }
            "kill" => {
                stmt.op = StmtOp::Kill;
                let mut next = words.next()?.to_string();
                let mut query_only = false;
                if next.eq_ignore_ascii_case("query") {
                    query_only = true;
                    next = words.next()?.to_string();
                } else if next.eq_ignore_ascii_case("connection") {
                    next = words.next()?.to_string();
                }
                let thread_id = next.trim_end_matches(';').parse().ok()?;
                stmt.kill_target = Some(KillTarget {
                    thread_id,
                    query_only,
                });
                done(stmt.clone())
            }
            "explain" | "describe" | "desc" => {
                stmt.op = StmtOp::Explain;
                stmt.type_mask = TypeMask::READ;
                done(stmt.clone())
            }
            "call" => {
                stmt.op = StmtOp::Call;
                stmt.type_mask = TypeMask::WRITE;
                done(stmt.clone())
            }
            "prepare" => {
                stmt.type_mask = TypeMask::PREPARE_NAMED_STMT;
                stmt.prepared_name = words.next().map(|w| w.to_string());
                done(stmt.clone())
            }
            "execute" => {
                stmt.type_mask = TypeMask::EXEC_STMT;
                stmt.prepared_name = words
                    .next()
                    .map(|w| w.trim_end_matches(';').to_string());
                done(stmt.clone())
            }
            "deallocate" => {
                stmt.type_mask = TypeMask::DEALLOC_PREPARE;
                // DEALLOCATE PREPARE <name>
                let mut name = words.next()?.to_string();
                if name.eq_ignore_ascii_case("prepare") {
                    name = words.next()?.to_string();
                }
                stmt.prepared_name = Some(name.trim_end_matches(';').to_string());
                done(stmt.clone())
            }
            "load" => {
                // LOAD DATA [LOW_PRIORITY | CONCURRENT] [LOCAL] INFILE ...
                let local = sql
                    .split_whitespace()
                    .take(4)
                    .any(|w| w.eq_ignore_ascii_case("local"));
                stmt.op = if local { StmtOp::LoadLocal } else { StmtOp::Load };
                stmt.type_mask = TypeMask::WRITE;
                done(stmt.clone())
            }
            "grant" => {
                stmt.op = StmtOp::Grant;
                stmt.type_mask = TypeMask::WRITE;
                done(stmt.clone())
            }
            "revoke" => {
                stmt.op = StmtOp::Revoke;
                stmt.type_mask = TypeMask::WRITE;
                done(stmt.clone())
            }
            "truncate" => {
                stmt.op = StmtOp::Truncate;
                stmt.type_mask = TypeMask::WRITE;
                done(stmt.clone())
            }
            _ => None,
        }
    }

    fn classify_statement(
        &self,
        statement: &Statement,
        collect: CollectFlags,
        stmt: &mut ClassifiedStmt,
    ) {
        stmt.parse_status = ParseStatus::Parsed;

        match statement {
            Statement::Query(query) => {
                stmt.op = StmtOp::Select;
                stmt.type_mask |= TypeMask::READ;
                self.classify_query(query, collect, stmt);
            }
            Statement::Insert {
                table_name,
                columns,
                source,
                ..
            } => {
                stmt.op = StmtOp::Insert;
                stmt.type_mask |= TypeMask::WRITE;
                if collect.contains(CollectFlags::TABLES) {
                    push_unique(&mut stmt.tables, table_name.to_string());
                }
                if collect.contains(CollectFlags::FIELDS) {
                    for col in columns {
                        push_unique(&mut stmt.fields, col.value.clone());
                    }
                }
                self.collect_query(source, collect, stmt);
            }
            Statement::Update {
                table,
                assignments,
                selection,
                ..
            } => {
                stmt.op = StmtOp::Update;
                stmt.type_mask |= TypeMask::WRITE;
                self.collect_table(table, collect, stmt);
                if collect.contains(CollectFlags::FIELDS) {
                    for assignment in assignments {
                        let field = assignment
                            .id
                            .iter()
                            .map(|i| i.value.clone())
                            .collect::<Vec<_>>()
                            .join(".");
                        push_unique(&mut stmt.fields, field);
                    }
                }
                if let Some(expr) = selection {
                    self.collect_expr(expr, collect, stmt);
                }
            }
            Statement::Delete {
                from, selection, ..
            } => {
                stmt.op = StmtOp::Delete;
                stmt.type_mask |= TypeMask::WRITE;
                for table in from {
                    self.collect_table(table, collect, stmt);
                }
                if let Some(expr) = selection {
                    self.collect_expr(expr, collect, stmt);
                }
            }
            Statement::CreateTable {
                temporary, name, ..
            } => {
                stmt.op = StmtOp::Create;
                stmt.type_mask |= TypeMask::WRITE;
                if *temporary {
                    stmt.type_mask |= TypeMask::CREATE_TMP_TABLE;
                }
                if collect.contains(CollectFlags::TABLES) {
                    push_unique(&mut stmt.tables, name.to_string());
                }
            }
            Statement::CreateIndex { .. }
            | Statement::CreateView { .. }
            | Statement::CreateDatabase { .. } => {
                stmt.op = StmtOp::Create;
                stmt.type_mask |= TypeMask::WRITE;
            }
            Statement::Drop { names, .. } => {
                stmt.op = StmtOp::Drop;
                stmt.type_mask |= TypeMask::WRITE;
                if collect.contains(CollectFlags::TABLES) {
                    for name in names {
                        push_unique(&mut stmt.tables, name.to_string());
                    }
                }
            }
            Statement::AlterTable { .. } | Statement::AlterIndex { .. } => {
                stmt.op = StmtOp::Alter;
                stmt.type_mask |= TypeMask::WRITE;
            }
            Statement::SetVariable {
                variable, value, ..
            } => {
                stmt.op = StmtOp::Set;
                let name = variable.to_string();
                stmt.type_mask |= set_variable_mask(&name);
                for expr in value {
                    self.collect_expr(expr, collect, stmt);
                }
            }
            Statement::SetNames { .. }
            | Statement::SetNamesDefault {}
            | Statement::SetTimeZone { .. } => {
                stmt.op = StmtOp::Set;
                stmt.type_mask |= TypeMask::SESSION_WRITE;
            }
            Statement::Use { db_name } => {
                stmt.op = StmtOp::ChangeDb;
                stmt.type_mask |= TypeMask::SESSION_WRITE;
                if collect.contains(CollectFlags::DATABASES) {
                    push_unique(&mut stmt.tables, db_name.value.clone());
                }
            }
            Statement::Truncate { .. } => {
                stmt.op = StmtOp::Truncate;
                stmt.type_mask |= TypeMask::WRITE;
            }
            _ => {
                // Parsed but not specifically mapped; conservatively a write
                stmt.op = StmtOp::Undefined;
                stmt.type_mask |= TypeMask::WRITE;
                stmt.parse_status = ParseStatus::PartiallyParsed;
            }
        }
    }

    fn classify_query(&self, query: &Query, collect: CollectFlags, stmt: &mut ClassifiedStmt) {
        if !query.locks.is_empty() {
            // SELECT ... FOR UPDATE / LOCK IN SHARE MODE must see current
            // data and takes locks
            stmt.type_mask |= TypeMask::WRITE;
        }

        if let SetExpr::Select(select) = query.body.as_ref() {
            if select.from.is_empty() {
                stmt.type_mask |= TypeMask::LOCAL_READ;
            }
            self.collect_select(select, collect, stmt);
        }
    }

    fn collect_query(&self, query: &Query, collect: CollectFlags, stmt: &mut ClassifiedStmt) {
        if let SetExpr::Select(select) = query.body.as_ref() {
            self.collect_select(select, collect, stmt);
        }
    }

    fn collect_select(&self, select: &Select, collect: CollectFlags, stmt: &mut ClassifiedStmt) {
        for table in &select.from {
            self.collect_table(table, collect, stmt);
        }
        for item in &select.projection {
            match item {
                SelectItem::UnnamedExpr(expr) | SelectItem::ExprWithAlias { expr, .. } => {
                    self.collect_expr(expr, collect, stmt)
                }
                _ => {}
            }
        }
        if let Some(selection) = &select.selection {
            self.collect_expr(selection, collect, stmt);
        }
    }

    fn collect_table(&self, table: &TableWithJoins, collect: CollectFlags, stmt: &mut ClassifiedStmt) {
        let mut add = |factor: &TableFactor| {
            if let TableFactor::Table { name, .. } = factor {
                if collect.contains(CollectFlags::TABLES) {
                    push_unique(&mut stmt.tables, name.to_string());
                }
            }
        };
        add(&table.relation);
        for join in &table.joins {
            add(&join.relation);
        }
    }

    fn collect_expr(&self, expr: &Expr, collect: CollectFlags, stmt: &mut ClassifiedStmt) {
        match expr {
            Expr::Identifier(ident) => {
                if collect.contains(CollectFlags::FIELDS) && !ident.value.starts_with('@') {
                    push_unique(&mut stmt.fields, ident.value.clone());
                }
            }
            Expr::CompoundIdentifier(parts) => {
                if collect.contains(CollectFlags::FIELDS) {
                    let field = parts
                        .iter()
                        .map(|i| i.value.clone())
                        .collect::<Vec<_>>()
                        .join(".");
                    if !field.starts_with('@') {
                        push_unique(&mut stmt.fields, field);
                    }
                }
            }
            Expr::Function(func) => {
                if collect.contains(CollectFlags::FUNCTIONS) {
                    push_unique(&mut stmt.functions, func.name.to_string().to_lowercase());
                }
                for arg in &func.args {
                    let (FunctionArg::Unnamed(FunctionArgExpr::Expr(inner))
                    | FunctionArg::Named {
                        arg: FunctionArgExpr::Expr(inner),
                        ..
                    }) = arg
                    else {
                        continue;
                    };
                    self.collect_expr(inner, collect, stmt);
                }
            }
            Expr::BinaryOp { left, right, .. } => {
                self.collect_expr(left, collect, stmt);
                self.collect_expr(right, collect, stmt);
            }
            Expr::UnaryOp { expr, .. } | Expr::Nested(expr) => {
                self.collect_expr(expr, collect, stmt)
            }
            Expr::InList { expr, list, .. } => {
                self.collect_expr(expr, collect, stmt);
                for item in list {
                    self.collect_expr(item, collect, stmt);
                }
            }
            Expr::Between {
                expr, low, high, ..
            } => {
                self.collect_expr(expr, collect, stmt);
                self.collect_expr(low, collect, stmt);
                self.collect_expr(high, collect, stmt);
            }
            Expr::Subquery(query) | Expr::Exists { subquery: query, .. } => {
                self.collect_query(query, collect, stmt)
            }
            _ => {}
        }
    }

    /// Keyword-level classification when the full parse fails
    fn tokenised_fallback(&self, sql: &str, stmt: &mut ClassifiedStmt) {
        let first = first_keyword(sql).to_ascii_lowercase();

        let (op, mask) = match first.as_str() {
            "select" => (StmtOp::Select, TypeMask::READ),
            "insert" | "replace" => (StmtOp::Insert, TypeMask::WRITE),
            "update" => (StmtOp::Update, TypeMask::WRITE),
            "delete" => (StmtOp::Delete, TypeMask::WRITE),
            "create" => (StmtOp::Create, TypeMask::WRITE),
            "drop" => (StmtOp::Drop, TypeMask::WRITE),
            "alter" => (StmtOp::Alter, TypeMask::WRITE),
            "set" => (StmtOp::Set, TypeMask::SESSION_WRITE),
            "" => {
                stmt.parse_status = ParseStatus::Invalid;
                return;
            }
            _ => {
                stmt.parse_status = ParseStatus::Invalid;
                stmt.op = StmtOp::Undefined;
                return;
            }
        };

        stmt.parse_status = ParseStatus::Tokenised;
        stmt.op = op;
        stmt.type_mask |= mask;
    }

    /// Detect user and system variable references from the canonical text.
    /// Only SELECT and SET statements can carry them meaningfully.
    fn scan_variables(&self, sql: &str, stmt: &mut ClassifiedStmt) {
        if !matches!(stmt.op, StmtOp::Select | StmtOp::Set) {
            return;
        }

        let canonical = canonicalize(sql).to_ascii_lowercase();

        if canonical.contains("@@global.") {
            stmt.type_mask |= if stmt.op == StmtOp::Set {
                TypeMask::GSYSVAR_WRITE
            } else {
                TypeMask::GSYSVAR_READ
            };
        } else if canonical.contains("@@") {
            if stmt.op == StmtOp::Select {
                stmt.type_mask |= TypeMask::SYSVAR_READ;
            }
        } else if canonical.contains('@') {
            stmt.type_mask |= if stmt.op == StmtOp::Set {
                TypeMask::USERVAR_WRITE
            } else {
                TypeMask::USERVAR_READ
            };
        }
    }
}

impl SqlParser for Analyzer {
    fn parse(&self, packet: &Packet, collect: CollectFlags) -> ClassifiedStmt {
        let command = match packet.command() {
            Some(c) => c,
            None => return ClassifiedStmt::invalid(),
        };

        match command {
            Command::Query => match packet.sql() {
                Some(sql) => self.classify_sql(sql, collect),
                None => ClassifiedStmt::invalid(),
            },
            Command::StmtPrepare => {
                let mut stmt = match packet.sql() {
                    Some(sql) => self.classify_sql(sql, collect),
                    None => ClassifiedStmt::invalid(),
                };
                stmt.type_mask |= TypeMask::PREPARE_STMT;
                stmt
            }
            Command::StmtExecute | Command::StmtFetch => ClassifiedStmt {
                type_mask: TypeMask::EXEC_STMT,
                ..ClassifiedStmt::default()
            },
            Command::StmtClose | Command::StmtReset | Command::StmtSendLongData => {
                ClassifiedStmt {
                    type_mask: TypeMask::WRITE,
                    ..ClassifiedStmt::default()
                }
            }
            Command::InitDb => ClassifiedStmt {
                op: StmtOp::ChangeDb,
                type_mask: TypeMask::SESSION_WRITE,
                ..ClassifiedStmt::default()
            },
            Command::CreateDb => ClassifiedStmt {
                op: StmtOp::Create,
                type_mask: TypeMask::WRITE,
                ..ClassifiedStmt::default()
            },
            Command::DropDb => ClassifiedStmt {
                op: StmtOp::Drop,
                type_mask: TypeMask::WRITE,
                ..ClassifiedStmt::default()
            },
            Command::Ping
            | Command::Refresh
            | Command::Debug
            | Command::ChangeUser
            | Command::SetOption
            | Command::ResetConnection => ClassifiedStmt {
                type_mask: TypeMask::SESSION_WRITE,
                ..ClassifiedStmt::default()
            },
            Command::FieldList => ClassifiedStmt {
                type_mask: TypeMask::READ,
                ..ClassifiedStmt::default()
            },
            Command::ProcessKill => {
                let mut stmt = ClassifiedStmt {
                    op: StmtOp::Kill,
                    ..ClassifiedStmt::default()
                };
                if packet.payload.len() >= 5 {
                    let id = u32::from_le_bytes([
                        packet.payload[1],
                        packet.payload[2],
                        packet.payload[3],
                        packet.payload[4],
                    ]);
                    stmt.kill_target = Some(KillTarget {
                        thread_id: id as u64,
                        query_only: false,
                    });
                }
                stmt
            }
            _ => ClassifiedStmt::default(),
        }
    }

    fn canonical(&self, packet: &Packet) -> String {
        packet.sql().map(canonicalize).unwrap_or_default()
    }

    fn get_preparable_stmt(&self, packet: &Packet) -> Option<Packet> {
        match packet.command()? {
            Command::StmtPrepare => Some(Packet::query(packet.sql()?)),
            Command::Query => {
                let sql = packet.sql()?;
                let mut words = sql.split_whitespace();
                if !words.next()?.eq_ignore_ascii_case("prepare") {
                    return None;
                }
                // PREPARE <name> FROM '<stmt>'
                let start = sql.find('\'')?;
                let end = sql.rfind('\'')?;
                if end <= start {
                    return None;
                }
                Some(Packet::query(&sql[start + 1..end]))
            }
            _ => None,
        }
    }

    fn set_sql_mode(&mut self, mode: SqlMode) {
        self.sql_mode = mode;
    }

    fn set_options(&mut self, options: ParserOptions) {
        self.options = options;
    }

    fn set_server_version(&mut self, version: u32) {
        self.server_version = version;
    }
}

/// SET target name to type mask
fn set_variable_mask(name: &str) -> TypeMask {
    let lower = name.to_ascii_lowercase();
    if lower.starts_with("@@global.") || lower.starts_with("global.") {
        TypeMask::GSYSVAR_WRITE
    } else if lower.starts_with('@') && !lower.starts_with("@@") {
        TypeMask::USERVAR_WRITE
    } else {
        TypeMask::SESSION_WRITE
    }
}

fn first_keyword(sql: &str) -> &str {
    sql.split_whitespace().next().unwrap_or_default()
}

/// A `;` followed by anything but trailing whitespace means the packet
/// carries more than one statement. Scanned on the canonical form so
/// literals and comments cannot confuse it.
fn has_multiple_statements(sql: &str) -> bool {
    let canonical = canonicalize(sql);
    match canonical.find(';') {
        Some(pos) => !canonical[pos + 1..].trim().is_empty(),
        None => false,
    }
}

fn push_unique(list: &mut Vec<String>, value: String) {
    if !list.contains(&value) {
        list.push(value);
    }
}
