//! Column lineage for relational routines.
//!
//! A routine body is split into top-level statements. Each statement gets
//! its own alias scope built from `FROM`/`JOIN` items, and the columns it
//! selects, updates or inserts are resolved against table shapes already
//! in the store. Ambiguity is reported, never broken by a priority rule.

use super::languages::Language;
use super::scan::{Scanner, Syntax};
use super::sql::{IDENT, normalize_name, routine_body};
use crate::db::Db;
use crate::db::models::{
    ChunkBody, ColumnShape, EntityDetail, EntityKind, LinkType, NewIdentity, SourceBody,
    TableShape,
};
use crate::error::StoreError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ops::Range;
use std::sync::LazyLock;
use tracing::{debug, info};

/// Placeholder table for columns that could not be attributed.
pub const UNKNOWN_TABLE: &str = "unknown";

static FROM_JOIN_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\b(from|join)\b").unwrap());

static SELECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\bselect\b(?:\s+distinct\b(?:\s+on\b)?|\s+all\b)?").unwrap()
});

static UPDATE_SET_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bupdate\s+(?:only\s+)?((?:{IDENT}\s*\.\s*)?{IDENT})(?:\s+(?:as\s+)?({IDENT}))??\s+set\b"
    ))
    .unwrap()
});

static CONFLICT_SET_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bdo\s+update\s+set\b").unwrap());

static INSERT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\binsert\s+into\s+((?:{IDENT}\s*\.\s*)?{IDENT})(?:\s+as\s+{IDENT})?\s*\("
    ))
    .unwrap()
});

static TABLE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^(?:{IDENT}\s*\.\s*)?{IDENT}")).unwrap());

static ALIAS_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"^\s+(?:(?i:as)\s+)?({IDENT})")).unwrap());

static QUALIFIED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(&format!(r"({IDENT})\s*\.\s*({IDENT})")).unwrap());

static BARE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^({IDENT})(?:\s+(?:(?i:as)\s+)?{IDENT})?$")).unwrap()
});

static SET_ITEM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"^(?:{IDENT}\s*\.\s*)?({IDENT})\s*=")).unwrap()
});

/// Words that end a FROM item or can never be an alias.
const RESERVED: &[&str] = &[
    "on", "using", "where", "and", "or", "order", "group", "having", "limit", "offset", "join",
    "left", "right", "inner", "outer", "cross", "full", "natural", "lateral", "union",
    "intersect", "except", "returning", "set", "window", "for", "into", "values", "select",
    "when", "then", "else", "end", "loop", "as", "fetch", "do", "with", "not", "is",
];

const SELECT_STOPS: &[&str] = &[
    "from", "into", "where", "group", "order", "having", "limit", "offset", "union", "intersect",
    "except", "window", "fetch", "for",
];

const SET_STOPS: &[&str] = &["where", "from", "returning"];

/// Bare select items that are values, not columns.
const NOT_COLUMNS: &[&str] = &[
    "null", "true", "false", "default", "current_date", "current_time", "current_timestamp",
    "current_user", "session_user", "localtime", "localtimestamp", "found",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Select,
    Update,
    Insert,
}

impl Operation {
    pub fn link_type(self) -> LinkType {
        match self {
            Operation::Select => LinkType::ReadsColumn,
            Operation::Update => LinkType::UpdatesColumn,
            Operation::Insert => LinkType::InsertsColumn,
        }
    }
}

/// One column reference found in a statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ColumnUsage {
    pub column: String,
    /// Alias or table name written before the column, lowercased.
    pub qualifier: Option<String>,
    pub operation: Operation,
    /// Index of the statement in the body.
    pub statement: usize,
}

/// Alias scope and write target of one statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementScope {
    /// Lowercased alias (or short table name) to table name as written.
    pub aliases: BTreeMap<String, String>,
    /// Table of `UPDATE t` or `INSERT INTO t`.
    pub target: Option<String>,
}

impl StatementScope {
    fn add(&mut self, key: &str, table: &str) {
        self.aliases
            .insert(key.to_ascii_lowercase(), table.to_string());
    }

    fn tables(&self) -> Vec<&str> {
        let unique: BTreeSet<&str> = self.aliases.values().map(String::as_str).collect();
        unique.into_iter().collect()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    Resolved(String),
    Ambiguous(Vec<String>),
    Unresolved,
}

/// Schema access needed to attribute columns to tables.
pub trait SchemaLookup {
    /// Full names of the tables matching `name`, full or short.
    fn tables_named(&self, name: &str) -> Result<Vec<String>, StoreError>;

    fn table_shape(&self, full_name: &str) -> Result<Option<TableShape>, StoreError>;
}

/// [`SchemaLookup`] over the tables stored for one context.
pub struct StoreSchema<'a> {
    pub db: &'a Db,
    pub context: &'a str,
}

impl SchemaLookup for StoreSchema<'_> {
    fn tables_named(&self, name: &str) -> Result<Vec<String>, StoreError> {
        Ok(self.db.find_tables(self.context, name)?)
    }

    fn table_shape(&self, full_name: &str) -> Result<Option<TableShape>, StoreError> {
        Ok(self.db.table_shape(self.context, full_name)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AmbiguousColumn {
    pub column: String,
    pub candidates: Vec<String>,
}

/// Outcome of one routine's lineage pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageReport {
    pub function: String,
    pub columns_found: usize,
    pub resolved: Vec<String>,
    pub ambiguous: Vec<AmbiguousColumn>,
    pub unresolved: Vec<String>,
    pub links_written: usize,
}

/// Totals of a whole-context lineage pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineageSummary {
    pub routines: usize,
    pub columns: usize,
    pub links: usize,
    pub ambiguous: usize,
    pub unresolved: usize,
    pub removed_columns: usize,
    pub collected_identities: usize,
}

struct Body<'a> {
    scanner: Scanner<'a>,
    code: String,
}

impl<'a> Body<'a> {
    fn new(text: &'a str, syntax: &'a Syntax) -> Self {
        let scanner = Scanner::new(text, syntax);
        let code = scanner.mask_with(|region, opener| region.is_comment() || opener != b'"');
        Self { scanner, code }
    }

    fn statements(&self) -> Vec<Range<usize>> {
        self.scanner
            .split_top_level(0..self.code.len(), b';')
            .into_iter()
            .filter(|r| !self.code[r.clone()].trim().is_empty())
            .collect()
    }

    fn scope(&self, range: Range<usize>) -> StatementScope {
        let mut scope = StatementScope::default();
        let code = &self.code[range.clone()];

        for m in FROM_JOIN_RE.find_iter(code) {
            let is_join = m.as_str().eq_ignore_ascii_case("join");
            let mut pos = range.start + m.end();
            loop {
                pos = self.skip_word(skip_ws(&self.code, pos), &["only", "lateral"]);
                match self.from_item(pos, range.end) {
                    Some((next, item)) => {
                        if let Some((key, table)) = item {
                            scope.add(&key, &table);
                        }
                        pos = skip_ws(&self.code, next);
                    }
                    None => break,
                }
                if is_join || self.code.as_bytes().get(pos) != Some(&b',') {
                    break;
                }
                pos += 1;
            }
        }

        if let Some(caps) = UPDATE_SET_RE.captures(code) {
            let table = normalize_name(&caps[1]);
            scope.add(short_name(&table), &table);
            if let Some(alias) = caps.get(2) {
                scope.add(&normalize_name(alias.as_str()), &table);
            }
            scope.target = Some(table);
        } else if let Some(caps) = INSERT_RE.captures(code) {
            scope.target = Some(normalize_name(&caps[1]));
        }
        scope
    }

    /// Parses one FROM item at `pos`: a table with optional alias, or a
    /// skipped subquery / function call. Returns the position after it.
    fn from_item(&self, pos: usize, end: usize) -> Option<(usize, Option<(String, String)>)> {
        if pos >= end {
            return None;
        }
        if self.code.as_bytes()[pos] == b'(' {
            let close = self.scanner.matching(pos)?.min(end);
            return Some((self.skip_alias(close, end).0, None));
        }
        let m = TABLE_NAME_RE.find(&self.code[pos..end])?;
        let table = normalize_name(m.as_str());
        if RESERVED.contains(&table.to_ascii_lowercase().as_str()) {
            return None;
        }
        let after = pos + m.end();
        let next = skip_ws(&self.code, after);
        if self.code.as_bytes().get(next) == Some(&b'(') {
            // set-returning function
            let close = self.scanner.matching(next)?.min(end);
            return Some((self.skip_alias(close, end).0, None));
        }
        let (after_alias, alias) = self.skip_alias(after, end);
        let key = alias.unwrap_or_else(|| short_name(&table).to_string());
        Some((after_alias, Some((key, table))))
    }

    fn skip_alias(&self, pos: usize, end: usize) -> (usize, Option<String>) {
        match ALIAS_RE.captures(&self.code[pos..end]) {
            Some(caps) => {
                let (Some(whole), Some(alias)) = (caps.get(0), caps.get(1)) else {
                    return (pos, None);
                };
                let alias = normalize_name(alias.as_str());
                if RESERVED.contains(&alias.to_ascii_lowercase().as_str()) {
                    (pos, None)
                } else {
                    (pos + whole.end(), Some(alias))
                }
            }
            None => (pos, None),
        }
    }

    fn skip_word(&self, pos: usize, words: &[&str]) -> usize {
        let rest = &self.code.as_bytes()[pos..];
        for word in words {
            if rest
                .get(..word.len())
                .is_some_and(|head| head.eq_ignore_ascii_case(word.as_bytes()))
                && rest.get(word.len()).is_some_and(u8::is_ascii_whitespace)
            {
                return skip_ws(&self.code, pos + word.len());
            }
        }
        pos
    }

    fn usages(&self, index: usize, range: Range<usize>) -> Vec<ColumnUsage> {
        let mut found = Vec::new();
        let code = &self.code[range.clone()];
        let mut push = |column: &str, qualifier: Option<&str>, operation| {
            let usage = ColumnUsage {
                column: normalize_name(column).to_ascii_lowercase(),
                qualifier: qualifier.map(|q| normalize_name(q).to_ascii_lowercase()),
                operation,
                statement: index,
            };
            if !found.contains(&usage) {
                found.push(usage);
            }
        };

        for m in SELECT_RE.find_iter(code) {
            let start = range.start + m.end();
            let end = clause_end(&self.code, start, range.end, SELECT_STOPS);
            for item in self.scanner.split_top_level(start..end, b',') {
                let text = self.code[item].trim();
                if text.is_empty() || text == "*" {
                    continue;
                }
                let qualified = qualified_refs(text);
                if !qualified.is_empty() {
                    for (qualifier, column) in qualified {
                        push(&column, Some(&qualifier), Operation::Select);
                    }
                } else if let Some(caps) = BARE_RE.captures(text) {
                    let name = caps[1].to_ascii_lowercase();
                    if !NOT_COLUMNS.contains(&name.as_str()) && !RESERVED.contains(&name.as_str()) {
                        push(&caps[1], None, Operation::Select);
                    }
                }
            }
        }

        let set_clause = UPDATE_SET_RE
            .find(code)
            .or_else(|| CONFLICT_SET_RE.find(code));
        if let Some(m) = set_clause {
            let start = range.start + m.end();
            let end = clause_end(&self.code, start, range.end, SET_STOPS);
            for item in self.scanner.split_top_level(start..end, b',') {
                let text = self.code[item].trim();
                if let Some(caps) = SET_ITEM_RE.captures(text) {
                    push(&caps[1], None, Operation::Update);
                } else if text.starts_with('(') {
                    // (a, b) = (...)
                    let list = text[1..].split(')').next().unwrap_or("");
                    for column in list.split(',').map(str::trim).filter(|c| !c.is_empty()) {
                        push(column, None, Operation::Update);
                    }
                }
            }
        }

        if let Some(m) = INSERT_RE.find(code) {
            let open = range.start + m.end() - 1;
            if let Some(close) = self.scanner.matching(open) {
                for item in self.scanner.split_top_level(open + 1..close - 1, b',') {
                    let column = self.code[item].trim();
                    if TABLE_NAME_RE.find(column).is_some_and(|m| m.end() == column.len()) {
                        push(column, None, Operation::Insert);
                    }
                }
            }
        }

        found
    }
}

/// Alias map of every statement in `body`, merged.
pub fn resolve_table_aliases(body: &str) -> BTreeMap<String, String> {
    let syntax = Language::Sql.config().syntax;
    let parsed = Body::new(body, &syntax);
    let mut aliases = BTreeMap::new();
    for range in parsed.statements() {
        aliases.extend(parsed.scope(range).aliases);
    }
    aliases
}

/// Column references of `body` with the alias scope of each statement.
pub fn extract_column_usages(body: &str) -> (Vec<ColumnUsage>, Vec<StatementScope>) {
    let syntax = Language::Sql.config().syntax;
    let parsed = Body::new(body, &syntax);
    let mut usages = Vec::new();
    let mut scopes = Vec::new();
    for (index, range) in parsed.statements().into_iter().enumerate() {
        scopes.push(parsed.scope(range.clone()));
        usages.extend(parsed.usages(index, range));
    }
    (usages, scopes)
}

/// Attributes one usage to a table.
pub fn resolve_column(
    usage: &ColumnUsage,
    scope: &StatementScope,
    schema: &dyn SchemaLookup,
) -> Result<Resolution, StoreError> {
    if let Some(qualifier) = &usage.qualifier {
        let Some(table) = scope.aliases.get(qualifier) else {
            return Ok(Resolution::Unresolved);
        };
        let tables = schema.tables_named(table)?;
        return Ok(match tables.len() {
            0 => Resolution::Unresolved,
            1 => Resolution::Resolved(tables.into_iter().next().unwrap_or_default()),
            _ => Resolution::Ambiguous(tables),
        });
    }

    let written: Vec<&str> = match (&scope.target, usage.operation) {
        (Some(target), Operation::Update | Operation::Insert) => vec![target.as_str()],
        _ => scope.tables(),
    };
    let mut candidates = BTreeSet::new();
    for name in written {
        for table in schema.tables_named(name)? {
            let has_column = schema
                .table_shape(&table)?
                .is_some_and(|shape| shape.column(&usage.column).is_some());
            if has_column {
                candidates.insert(table);
            }
        }
    }
    let mut candidates: Vec<String> = candidates.into_iter().collect();
    Ok(match candidates.len() {
        0 => Resolution::Unresolved,
        1 => Resolution::Resolved(candidates.remove(0)),
        _ => Resolution::Ambiguous(candidates),
    })
}

/// Resolves the columns of one routine and replaces its column links.
pub fn apply_lineage(
    db: &mut Db,
    context: &str,
    function: &str,
    body: &str,
    file_id: i64,
) -> Result<LineageReport, StoreError> {
    let (usages, scopes) = extract_column_usages(body);
    let mut report = LineageReport {
        function: function.to_string(),
        columns_found: usages.len(),
        ..Default::default()
    };

    let mut edges: BTreeSet<(LinkType, String)> = BTreeSet::new();
    {
        let schema = StoreSchema { db: &*db, context };
        for usage in &usages {
            let Some(scope) = scopes.get(usage.statement) else {
                continue;
            };
            let table = match resolve_column(usage, scope, &schema)? {
                Resolution::Resolved(table) => {
                    report.resolved.push(format!("{table}.{}", usage.column));
                    table
                }
                Resolution::Ambiguous(candidates) => {
                    debug!("{function}: column {} is ambiguous between {candidates:?}", usage.column);
                    report.ambiguous.push(AmbiguousColumn {
                        column: usage.column.clone(),
                        candidates,
                    });
                    UNKNOWN_TABLE.to_string()
                }
                Resolution::Unresolved => {
                    report.unresolved.push(usage.column.clone());
                    UNKNOWN_TABLE.to_string()
                }
            };
            edges.insert((usage.operation.link_type(), format!("{table}.{}", usage.column)));
        }
    }

    for target in edges.iter().map(|(_, t)| t).collect::<BTreeSet<_>>() {
        db.upsert_identity(
            context,
            &NewIdentity {
                full_name: target,
                kind: EntityKind::Column.as_str(),
                short_name: Some(short_name(target)),
                display_name: None,
                file_id: Some(file_id),
            },
        )?;
    }

    let edges: Vec<(LinkType, String)> = edges.into_iter().collect();
    report.links_written =
        db.replace_links(context, function, LinkType::COLUMN_TYPES, &edges, Some(file_id))?;
    Ok(report)
}

/// Rebuilds every column chunk from the current column links, removes
/// column chunks nothing links to, and collects orphaned identities.
pub fn consolidate_columns(db: &mut Db, context: &str) -> Result<LineageSummary, StoreError> {
    let mut summary = LineageSummary::default();
    let existing = db.source_chunks_of_kind(context, EntityKind::Column.as_str(), None)?;
    let mut by_name: HashMap<String, Vec<(i64, i64)>> = HashMap::new();
    for chunk in &existing {
        if let Some(name) = &chunk.full_name {
            by_name
                .entry(name.clone())
                .or_default()
                .push((chunk.id, chunk.file_id));
        }
    }

    let mut live = HashSet::new();
    let mut moved = Vec::new();
    for target in db.link_targets(context, LinkType::COLUMN_TYPES)? {
        let mut sources = BTreeSet::new();
        let mut owner: Option<i64> = None;
        for link_type in LinkType::COLUMN_TYPES {
            for link in db.links_to(context, &target, Some(*link_type))? {
                if let Some(file_id) = link.file_id {
                    owner = Some(owner.map_or(file_id, |o| o.min(file_id)));
                }
                sources.insert(link.source);
            }
        }
        let Some(file_id) = owner else {
            continue;
        };

        let (table, column) = match target.rsplit_once('.') {
            Some((table, column)) if table != UNKNOWN_TABLE => (Some(table.to_string()), column),
            Some((_, column)) => (None, column),
            None => (None, target.as_str()),
        };
        let def = match &table {
            Some(table) => db
                .table_shape(context, table)?
                .and_then(|shape| shape.column(column).cloned()),
            None => None,
        };

        let body = ChunkBody::Source(SourceBody {
            full_name: target.clone(),
            short_name: column.to_string(),
            kind: EntityKind::Column,
            signature: def.as_ref().map(|d| format!("{column} {}", d.data_type)),
            comment: def.as_ref().and_then(|d| d.comment.clone()),
            body: String::new(),
            parent: table.clone(),
            start_line: None,
            end_line: None,
            detail: Some(EntityDetail::Column(ColumnShape {
                table,
                column: column.to_string(),
                data_type: def.as_ref().map(|d| d.data_type.clone()),
                nullable: def.as_ref().map(|d| d.nullable),
                sources: sources.into_iter().collect(),
            })),
        });

        if let Some(chunks) = by_name.get(&target) {
            moved.extend(chunks.iter().filter(|(_, f)| *f != file_id).map(|(id, _)| *id));
        }
        let write = db.upsert_chunk(file_id, Some(target.as_str()), &body, EntityKind::Column.as_str(), None)?;
        let identity = db.upsert_identity(
            context,
            &NewIdentity {
                full_name: &target,
                kind: EntityKind::Column.as_str(),
                short_name: Some(column),
                display_name: None,
                file_id: Some(file_id),
            },
        )?;
        db.attach_identity(write.id, identity)?;
        live.insert(target);
        summary.columns += 1;
    }

    let mut stale: Vec<i64> = existing
        .iter()
        .filter(|c| c.full_name.as_ref().is_none_or(|n| !live.contains(n)))
        .map(|c| c.id)
        .collect();
    summary.removed_columns = stale.len();
    stale.extend(moved);
    db.delete_chunks(&stale)?;
    summary.collected_identities = db.gc_identities(context)?.len();
    Ok(summary)
}

/// Lineage for every relational routine of a context, then consolidation.
pub fn run_lineage_pass(db: &mut Db, context: &str) -> Result<(LineageSummary, Vec<LineageReport>), StoreError> {
    let routines = db.routines(context)?;
    let mut reports = Vec::with_capacity(routines.len());
    for chunk in routines {
        let (Some(name), Some(source)) = (chunk.full_name.as_deref(), chunk.body.as_source()) else {
            continue;
        };
        let report = apply_lineage(db, context, name, routine_body(&source.body), chunk.file_id)?;
        reports.push(report);
    }

    let mut summary = consolidate_columns(db, context)?;
    summary.routines = reports.len();
    summary.links = reports.iter().map(|r| r.links_written).sum();
    summary.ambiguous = reports.iter().map(|r| r.ambiguous.len()).sum();
    summary.unresolved = reports.iter().map(|r| r.unresolved.len()).sum();
    info!(
        "Lineage for {context}: {} routines, {} columns, {} ambiguous, {} unresolved",
        summary.routines, summary.columns, summary.ambiguous, summary.unresolved
    );
    Ok((summary, reports))
}

/// End of a clause starting at `from`: the first stop word, `;` or
/// unbalanced `)` at bracket depth zero.
fn clause_end(code: &str, from: usize, limit: usize, stops: &[&str]) -> usize {
    let bytes = code.as_bytes();
    let mut depth = 0usize;
    let mut i = from;
    while i < limit {
        match bytes[i] {
            b'(' => depth += 1,
            b')' if depth == 0 => return i,
            b')' => depth -= 1,
            b';' if depth == 0 => return i,
            b if depth == 0 && is_word_byte(b) && (i == 0 || !is_word_byte(bytes[i - 1])) => {
                let mut end = i;
                while end < limit && is_word_byte(bytes[end]) {
                    end += 1;
                }
                if stops.iter().any(|s| code[i..end].eq_ignore_ascii_case(s)) {
                    return i;
                }
                i = end;
                continue;
            }
            _ => {}
        }
        i += 1;
    }
    limit
}

/// `alias.column` references not followed by `(` or another `.`.
fn qualified_refs(text: &str) -> Vec<(String, String)> {
    let mut refs = Vec::new();
    for caps in QUALIFIED_RE.captures_iter(text) {
        let (Some(whole), Some(q), Some(c)) = (caps.get(0), caps.get(1), caps.get(2)) else {
            continue;
        };
        let before = text[..whole.start()].trim_end();
        let after = text[whole.end()..].trim_start();
        if before.ends_with('.') || after.starts_with('(') || after.starts_with('.') {
            continue;
        }
        refs.push((q.as_str().to_string(), c.as_str().to_string()));
    }
    refs
}

/// Non-ASCII bytes count as word bytes so a word never ends inside a
/// multibyte character.
fn is_word_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || !b.is_ascii()
}

fn skip_ws(code: &str, mut pos: usize) -> usize {
    let bytes = code.as_bytes();
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

fn short_name(full_name: &str) -> &str {
    full_name.rsplit('.').next().unwrap_or(full_name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::ColumnDef;

    struct FakeSchema(Vec<(&'static str, Vec<&'static str>)>);

    impl SchemaLookup for FakeSchema {
        fn tables_named(&self, name: &str) -> Result<Vec<String>, StoreError> {
            Ok(self
                .0
                .iter()
                .map(|(t, _)| *t)
                .filter(|t| t.eq_ignore_ascii_case(name) || short_name(t).eq_ignore_ascii_case(name))
                .map(str::to_string)
                .collect())
        }

        fn table_shape(&self, full_name: &str) -> Result<Option<TableShape>, StoreError> {
            Ok(self.0.iter().find(|(t, _)| *t == full_name).map(|(_, cols)| TableShape {
                schema: "public".into(),
                columns: cols.iter().map(|c| column(c)).collect(),
                ..Default::default()
            }))
        }
    }

    fn column(name: &str) -> ColumnDef {
        ColumnDef {
            name: name.into(),
            data_type: "int".into(),
            nullable: false,
            primary_key: false,
            unique: false,
            default: None,
            references: None,
            comment: None,
        }
    }

    fn shop() -> FakeSchema {
        FakeSchema(vec![
            ("public.orders", vec!["id", "customer_id", "amount", "status"]),
            ("public.customers", vec!["id", "name", "email"]),
        ])
    }

    fn resolve_all(body: &str, schema: &FakeSchema) -> Vec<(String, Resolution)> {
        let (usages, scopes) = extract_column_usages(body);
        usages
            .iter()
            .map(|u| {
                let r = resolve_column(u, &scopes[u.statement], schema).unwrap();
                (u.column.clone(), r)
            })
            .collect()
    }

    #[test]
    fn test_aliases_from_list_and_joins() {
        let aliases = resolve_table_aliases(
            "SELECT 1 FROM orders o, public.customers AS c LEFT JOIN geo.regions r ON r.id = c.region_id \
             JOIN (SELECT 1) sub ON true JOIN items USING (order_id);",
        );
        let expected: BTreeMap<String, String> = [
            ("o", "orders"),
            ("c", "public.customers"),
            ("r", "geo.regions"),
            ("items", "items"),
        ]
        .into_iter()
        .map(|(a, t)| (a.to_string(), t.to_string()))
        .collect();
        assert_eq!(aliases, expected);
    }

    #[test]
    fn test_bare_column_resolves_to_single_owner() {
        let results = resolve_all(
            "SELECT name, status FROM orders o JOIN customers c ON c.id = o.customer_id;",
            &shop(),
        );
        assert_eq!(
            results,
            vec![
                ("name".to_string(), Resolution::Resolved("public.customers".into())),
                ("status".to_string(), Resolution::Resolved("public.orders".into())),
            ]
        );
    }

    #[test]
    fn test_shared_column_is_ambiguous_without_tie_break() {
        let results = resolve_all(
            "SELECT id FROM orders o JOIN customers c ON c.id = o.customer_id;",
            &shop(),
        );
        assert_eq!(
            results,
            vec![(
                "id".to_string(),
                Resolution::Ambiguous(vec!["public.customers".into(), "public.orders".into()])
            )]
        );
    }

    #[test]
    fn test_id_only_in_customers_resolves() {
        let schema = FakeSchema(vec![
            ("public.orders", vec!["customer_id", "amount"]),
            ("public.customers", vec!["id", "name"]),
        ]);
        let results = resolve_all(
            "SELECT id FROM orders o JOIN customers c ON c.id = o.customer_id",
            &schema,
        );
        assert_eq!(
            results,
            vec![("id".to_string(), Resolution::Resolved("public.customers".into()))]
        );
    }

    #[test]
    fn test_qualified_and_unknown_columns() {
        let results = resolve_all(
            "SELECT o.amount, sum(c.id) AS n, x.y, ghost FROM orders o JOIN customers c ON true GROUP BY o.amount;",
            &shop(),
        );
        assert_eq!(
            results,
            vec![
                ("amount".to_string(), Resolution::Resolved("public.orders".into())),
                ("id".to_string(), Resolution::Resolved("public.customers".into())),
                ("y".to_string(), Resolution::Unresolved),
                ("ghost".to_string(), Resolution::Unresolved),
            ]
        );
    }

    #[test]
    fn test_update_and_insert_use_target_table() {
        let body = r#"
BEGIN
    UPDATE orders SET status = 'paid', amount = amount * 2 WHERE id = p_id;
    INSERT INTO customers (name, email, missing) VALUES ('a', 'b', 1);
END;
"#;
        let (usages, _) = extract_column_usages(body);
        let ops: Vec<(&str, Operation)> = usages
            .iter()
            .map(|u| (u.column.as_str(), u.operation))
            .collect();
        assert_eq!(
            ops,
            vec![
                ("status", Operation::Update),
                ("amount", Operation::Update),
                ("name", Operation::Insert),
                ("email", Operation::Insert),
                ("missing", Operation::Insert),
            ]
        );

        let results = resolve_all(body, &shop());
        assert_eq!(results[0].1, Resolution::Resolved("public.orders".into()));
        assert_eq!(results[2].1, Resolution::Resolved("public.customers".into()));
        assert_eq!(results[4].1, Resolution::Unresolved);
    }

    #[test]
    fn test_select_into_list_stops_at_into() {
        let (usages, _) =
            extract_column_usages("SELECT o.amount INTO v_amount FROM orders o WHERE o.id = 1;");
        assert_eq!(usages.len(), 1);
        assert_eq!(usages[0].qualifier.as_deref(), Some("o"));
    }

    #[test]
    fn test_cyrillic_tables_and_columns() {
        let (_, scopes) = extract_column_usages("SELECT id FROM заказы z;");
        assert_eq!(scopes[0].aliases.get("z").map(String::as_str), Some("заказы"));

        let schema = FakeSchema(vec![("public.заказы", vec!["id", "сумма"])]);
        let results = resolve_all(
            "-- итоги по заказам\nSELECT z.сумма, id, 'ё' AS метка FROM ONLY заказы z WHERE z.id = 1;",
            &schema,
        );
        assert_eq!(
            results,
            vec![
                ("сумма".to_string(), Resolution::Resolved("public.заказы".into())),
                ("id".to_string(), Resolution::Resolved("public.заказы".into())),
            ]
        );
    }

    #[test]
    fn test_comments_and_strings_are_ignored() {
        let (usages, _) = extract_column_usages(
            "-- SELECT secret FROM vault\nSELECT 'x.y' AS label, c.name FROM customers c;",
        );
        let columns: Vec<&str> = usages.iter().map(|u| u.column.as_str()).collect();
        assert_eq!(columns, vec!["name"]);
    }
}
