//! Relational schema and routine extraction.
//!
//! Anchors are matched against a masked copy of the unit in which comments,
//! single-quoted literals and dollar-quoted bodies are blanked, so a
//! `CREATE` inside a routine body or a comment never starts a new entity.
//! Double-quoted identifiers stay visible.

use super::code_parser::{Entity, EntityBuilder, EntityExtractor, Extraction};
use super::languages::Language;
use super::scan::{self, ClaimedSpans, Region, Scanner, Syntax};
use crate::db::models::{
    ColumnDef, ColumnRef, ConstraintKind, EntityDetail, EntityKind, ForeignKey, IndexDef,
    TableConstraint, TableShape,
};
use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;

pub(crate) const IDENT: &str = r#"(?:"[^"\n]+"|[\p{L}_][\w$]*)"#;

static ROUTINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bcreate\s+(?:or\s+replace\s+)?(function|procedure)\s+((?:{IDENT}\s*\.\s*)?{IDENT})\s*\("
    ))
    .unwrap()
});

static TABLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bcreate\s+(?:(?:global|local)\s+)?(?:(?:temporary|temp|unlogged)\s+)?table\s+(?:if\s+not\s+exists\s+)?((?:{IDENT}\s*\.\s*)?{IDENT})\s*\("
    ))
    .unwrap()
});

static VIEW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bcreate\s+(?:or\s+replace\s+)?(?:(?:temporary|temp)\s+)?(?:materialized\s+)?view\s+(?:if\s+not\s+exists\s+)?((?:{IDENT}\s*\.\s*)?{IDENT})"
    ))
    .unwrap()
});

static INDEX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bcreate\s+(unique\s+)?index\s+(?:concurrently\s+)?(?:if\s+not\s+exists\s+)?(?:({IDENT})\s+)?on\s+(?:only\s+)?((?:{IDENT}\s*\.\s*)?{IDENT})\s*(?:using\s+(\w+)\s*)?\("
    ))
    .unwrap()
});

static COMMENT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bcomment\s+on\s+(table|column)\s+((?:{IDENT}\s*\.\s*){{0,2}}{IDENT})\s+is\s+'((?:[^']|'')*)'"
    ))
    .unwrap()
});

static RETURNS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)^\s*returns\s+(.+?)\s*(?:\blanguage\b|\bas\b|\bimmutable\b|\bstable\b|\bvolatile\b|\bstrict\b|\bsecurity\b|$)")
        .unwrap()
});

static VIEW_AS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bas\b").unwrap());

static COLUMN_ATTR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\s(?:not\s+null|null|primary\s+key|unique|default|references|check|constraint|generated|collate)\b")
        .unwrap()
});

static DEFAULT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)\bdefault\s+(.+?)(?:\s+(?:not\s+null|null|primary\s+key|unique|references|check|constraint|generated)\b|$)")
        .unwrap()
});

static REFERENCES_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\breferences\s+((?:{IDENT}\s*\.\s*)?{IDENT})(?:\s*\(\s*({IDENT})\s*\))?"
    ))
    .unwrap()
});

static CONSTRAINT_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"(?is)^constraint\s+({IDENT})\s+(.*)$")).unwrap()
});

static FOREIGN_KEY_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?is)^foreign\s+key\s*\(([^)]*)\)\s*references\s+((?:{IDENT}\s*\.\s*)?{IDENT})\s*(?:\(([^)]*)\))?"
    ))
    .unwrap()
});

static NOT_NULL_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bnot\s+null\b").unwrap());
static PRIMARY_KEY_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bprimary\s+key\b").unwrap());
static UNIQUE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"(?i)\bunique\b").unwrap());

pub struct SqlExtractor;

impl EntityExtractor for SqlExtractor {
    fn language(&self) -> Language {
        Language::Sql
    }

    fn extract(&self, source: &str) -> Extraction {
        let syntax = Language::Sql.config().syntax;
        let scanner = Scanner::new(source, &syntax);
        let masked = scanner.mask_with(|region, opener| {
            region.is_comment() || region == Region::DollarQuoted || opener == b'\''
        });

        let mut anchors: Vec<Anchor> = Vec::new();
        for caps in ROUTINE_RE.captures_iter(&masked) {
            let kind = if caps[1].eq_ignore_ascii_case("procedure") {
                EntityKind::Procedure
            } else {
                EntityKind::Function
            };
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            let name = caps.get(2).map_or(0..0, |m| m.range());
            anchors.push(Anchor { kind, whole, name });
        }
        for caps in TABLE_RE.captures_iter(&masked) {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            let name = caps.get(1).map_or(0..0, |m| m.range());
            anchors.push(Anchor { kind: EntityKind::Table, whole, name });
        }
        for caps in VIEW_RE.captures_iter(&masked) {
            let whole = caps.get(0).map_or(0..0, |m| m.range());
            let name = caps.get(1).map_or(0..0, |m| m.range());
            anchors.push(Anchor { kind: EntityKind::View, whole, name });
        }
        anchors.sort_by_key(|a| a.whole.start);

        let mut out = Extraction::default();
        let mut claimed = ClaimedSpans::default();

        for (i, anchor) in anchors.iter().enumerate() {
            let limit = anchors
                .get(i + 1)
                .map_or(source.len(), |next| next.whole.start);
            if claimed.covers(&anchor.whole) {
                continue;
            }
            let entity = match anchor.kind {
                EntityKind::Table => table(&scanner, &syntax, anchor, limit, &mut out),
                EntityKind::View => view(&scanner, &masked, &syntax, anchor, limit, &mut out),
                _ => routine(&scanner, &syntax, anchor, limit, &mut out),
            };
            if let Some(entity) = entity {
                claimed.claim(anchor.whole.start..anchor.whole.start + entity.body.len());
                out.entities.push(entity);
            }
        }

        attach_indexes(&masked, &mut out.entities);
        attach_comments(&scanner, &mut out.entities);
        out
    }
}

struct Anchor {
    kind: EntityKind,
    whole: Range<usize>,
    name: Range<usize>,
}

fn routine(
    scanner: &Scanner<'_>,
    syntax: &Syntax,
    anchor: &Anchor,
    limit: usize,
    out: &mut Extraction,
) -> Option<Entity> {
    let text = scanner.text();
    let full_name = normalize_name(&text[anchor.name.clone()]);
    let start = anchor.whole.start;
    let open = anchor.whole.end - 1;

    let Some(params_end) = scanner.matching(open) else {
        out.push_issue(text, start, anchor.kind, Some(&full_name), "unterminated parameter list");
        return None;
    };

    let terminator = scanner
        .statement_end(params_end, b';')
        .filter(|end| *end <= limit);
    let body = find_body(scanner, params_end, terminator.unwrap_or(limit));

    let end = match (terminator, &body) {
        (Some(end), _) => end,
        (None, Some(body)) => body.outer_end,
        (None, None) => {
            out.push_issue(text, start, anchor.kind, Some(&full_name), "missing statement terminator");
            return None;
        }
    };
    if body.as_ref().is_some_and(|b| !b.terminated) {
        out.push_issue(text, start, anchor.kind, Some(&full_name), "unterminated routine body");
        return None;
    }

    let inner = match &body {
        Some(b) => b.inner.clone(),
        None => params_end..end,
    };

    let head_end = body.as_ref().map_or(end, |b| b.inner.start);
    let mut signature = scan::squash_whitespace(&text[anchor.name.start..params_end]);
    if let Some(ret) = RETURNS_RE.captures(&text[params_end..head_end]) {
        signature.push_str(" RETURNS ");
        signature.push_str(&scan::squash_whitespace(&ret[1]));
    }

    let short_name = short_of(&full_name);
    Some(
        EntityBuilder {
            text,
            span: start..end,
            inner,
        }
        .build(
            anchor.kind,
            full_name,
            short_name,
            Some(signature),
            scan::leading_comment(text, start, syntax),
        ),
    )
}

fn table(
    scanner: &Scanner<'_>,
    syntax: &Syntax,
    anchor: &Anchor,
    limit: usize,
    out: &mut Extraction,
) -> Option<Entity> {
    let text = scanner.text();
    let full_name = normalize_name(&text[anchor.name.clone()]);
    let start = anchor.whole.start;
    let open = anchor.whole.end - 1;

    let Some(close) = scanner.matching(open) else {
        out.push_issue(text, start, EntityKind::Table, Some(&full_name), "unterminated column list");
        return None;
    };
    let end = scanner
        .statement_end(close, b';')
        .filter(|end| *end <= limit)
        .unwrap_or(close);

    let schema = match full_name.rsplit_once('.') {
        Some((schema, _)) => schema.to_string(),
        None => "public".to_string(),
    };
    let shape = parse_table_body(scanner, open + 1..close - 1, schema);

    let short_name = short_of(&full_name);
    let mut entity = EntityBuilder {
        text,
        span: start..end,
        inner: open + 1..close - 1,
    }
    .build(
        EntityKind::Table,
        full_name.clone(),
        short_name,
        Some(format!("TABLE {full_name}")),
        scan::leading_comment(text, start, syntax),
    );
    entity.detail = Some(EntityDetail::Table(shape));
    Some(entity)
}

fn view(
    scanner: &Scanner<'_>,
    masked: &str,
    syntax: &Syntax,
    anchor: &Anchor,
    limit: usize,
    out: &mut Extraction,
) -> Option<Entity> {
    let text = scanner.text();
    let full_name = normalize_name(&text[anchor.name.clone()]);
    let start = anchor.whole.start;

    let Some(end) = scanner
        .statement_end(anchor.whole.end, b';')
        .filter(|end| *end <= limit)
    else {
        out.push_issue(text, start, EntityKind::View, Some(&full_name), "missing statement terminator");
        return None;
    };

    let query_start = VIEW_AS_RE
        .find(&masked[anchor.whole.end..end])
        .map_or(anchor.whole.end, |m| anchor.whole.end + m.end());
    let query_end = if text[..end].ends_with(';') { end - 1 } else { end };

    let short_name = short_of(&full_name);
    Some(
        EntityBuilder {
            text,
            span: start..end,
            inner: query_start..query_end,
        }
        .build(
            EntityKind::View,
            full_name.clone(),
            short_name,
            Some(format!("VIEW {full_name}")),
            scan::leading_comment(text, start, syntax),
        ),
    )
}

/// Located routine body: the quoted text after `AS`.
struct RoutineBody {
    inner: Range<usize>,
    outer_end: usize,
    terminated: bool,
}

fn find_body(scanner: &Scanner<'_>, from: usize, limit: usize) -> Option<RoutineBody> {
    let text = scanner.text();
    let bytes = text.as_bytes();
    let mut i = from;
    while i < limit {
        match scanner.opaque_at(i) {
            Some((Region::DollarQuoted, end)) => {
                let tag_len = text[i + 1..].find('$').map_or(1, |p| p + 2);
                let terminated = end - i >= 2 * tag_len && text[i..end].ends_with(&text[i..i + tag_len]);
                let inner_end = if terminated { end - tag_len } else { end };
                return Some(RoutineBody {
                    inner: i + tag_len..inner_end,
                    outer_end: end,
                    terminated,
                });
            }
            Some((Region::Quoted, end)) if bytes[i] == b'\'' && preceded_by_as(text, i) => {
                let terminated = end - i >= 2 && bytes[end - 1] == b'\'';
                return Some(RoutineBody {
                    inner: i + 1..if terminated { end - 1 } else { end },
                    outer_end: end,
                    terminated,
                });
            }
            Some((_, end)) => i = end,
            None => i += 1,
        }
    }
    None
}

fn preceded_by_as(text: &str, pos: usize) -> bool {
    let head = text[..pos].trim_end();
    let Some(before) = head
        .len()
        .checked_sub(2)
        .filter(|n| head.as_bytes()[*n..].eq_ignore_ascii_case(b"as"))
    else {
        return false;
    };
    !head[..before]
        .chars()
        .next_back()
        .is_some_and(|c| c.is_alphanumeric() || c == '_')
}

/// Executable body of a stored routine definition: the dollar- or
/// single-quoted text after `AS`, or the whole text when there is none.
pub fn routine_body(definition: &str) -> &str {
    let syntax = Language::Sql.config().syntax;
    let scanner = Scanner::new(definition, &syntax);
    match find_body(&scanner, 0, definition.len()) {
        Some(body) => &definition[body.inner],
        None => definition,
    }
}

fn parse_table_body(scanner: &Scanner<'_>, range: Range<usize>, schema: String) -> TableShape {
    let text = scanner.text();
    let mut shape = TableShape {
        schema,
        ..TableShape::default()
    };

    for part in scanner.split_top_level(range, b',') {
        let segment = scan::squash_whitespace(text[part].trim());
        if segment.is_empty() {
            continue;
        }
        if let Some(constraint) = parse_constraint(&segment) {
            for column in &constraint.columns {
                let target = shape
                    .columns
                    .iter_mut()
                    .find(|c| c.name.eq_ignore_ascii_case(column));
                if let Some(col) = target {
                    match constraint.kind {
                        ConstraintKind::PrimaryKey => {
                            col.primary_key = true;
                            col.nullable = false;
                        }
                        ConstraintKind::Unique if constraint.columns.len() == 1 => col.unique = true,
                        _ => {}
                    }
                }
            }
            shape.constraints.push(constraint);
            continue;
        }
        let lower = segment.to_ascii_lowercase();
        if lower.starts_with("like ") {
            continue;
        }
        if let Some(column) = parse_column(&segment) {
            shape.columns.push(column);
        }
    }
    shape
}

fn parse_constraint(segment: &str) -> Option<TableConstraint> {
    let (name, rest) = match CONSTRAINT_NAME_RE.captures(segment) {
        Some(caps) => (
            Some(normalize_name(&caps[1])),
            caps.get(2).map_or("", |m| m.as_str()).to_string(),
        ),
        None => (None, segment.to_string()),
    };
    let lower = rest.to_ascii_lowercase();

    let mut constraint = TableConstraint {
        kind: ConstraintKind::Check,
        name,
        columns: Vec::new(),
        references: None,
        expression: None,
    };

    if lower.starts_with("primary key") {
        constraint.kind = ConstraintKind::PrimaryKey;
        constraint.columns = paren_list(&rest);
    } else if let Some(caps) = FOREIGN_KEY_RE.captures(&rest) {
        let columns = split_names(&caps[1]);
        let ref_columns = caps.get(3).map_or_else(Vec::new, |m| split_names(m.as_str()));
        constraint.kind = ConstraintKind::ForeignKey;
        constraint.columns = columns.clone();
        constraint.references = Some(ForeignKey {
            columns,
            table: normalize_name(&caps[2]),
            ref_columns,
        });
    } else if keyword_then_paren(&lower, "unique") {
        constraint.kind = ConstraintKind::Unique;
        constraint.columns = paren_list(&rest);
    } else if keyword_then_paren(&lower, "check") {
        constraint.expression = Some(rest[5..].trim().to_string());
    } else if keyword_then_paren(&lower, "exclude") {
        constraint.kind = ConstraintKind::Exclude;
        constraint.expression = Some(rest[7..].trim().to_string());
    } else {
        return None;
    }
    Some(constraint)
}

/// `keyword` followed by an opening parenthesis, possibly after
/// whitespace or an `USING method` clause.
fn keyword_then_paren(lower: &str, keyword: &str) -> bool {
    match lower.strip_prefix(keyword) {
        Some(rest) => {
            let rest = rest.trim_start();
            rest.starts_with('(') || (keyword == "exclude" && rest.starts_with("using "))
        }
        None => false,
    }
}

fn parse_column(segment: &str) -> Option<ColumnDef> {
    let (name, rest) = split_first_ident(segment)?;
    let rest = format!(" {rest}");
    let type_end = COLUMN_ATTR_RE.find(&rest).map_or(rest.len(), |m| m.start());
    let data_type = rest[..type_end].trim().to_string();

    let primary_key = PRIMARY_KEY_RE.is_match(&rest);
    let references = REFERENCES_RE.captures(&rest).map(|caps| ColumnRef {
        table: normalize_name(&caps[1]),
        column: caps
            .get(2)
            .map_or_else(|| "id".to_string(), |m| normalize_name(m.as_str())),
    });

    Some(ColumnDef {
        name,
        data_type,
        nullable: !primary_key && !NOT_NULL_RE.is_match(&rest),
        primary_key,
        unique: UNIQUE_RE.is_match(&rest[type_end..]),
        default: DEFAULT_RE
            .captures(&rest)
            .map(|caps| caps[1].trim().to_string()),
        references,
        comment: None,
    })
}

/// First identifier of a column definition and the text after it.
fn split_first_ident(segment: &str) -> Option<(String, &str)> {
    if let Some(quoted) = segment.strip_prefix('"') {
        let close = quoted.find('"')?;
        return Some((quoted[..close].to_string(), quoted[close + 1..].trim_start()));
    }
    let end = segment
        .find(|c: char| c.is_whitespace())
        .unwrap_or(segment.len());
    if end == 0 {
        return None;
    }
    Some((segment[..end].to_string(), segment[end..].trim_start()))
}

fn paren_list(text: &str) -> Vec<String> {
    match (text.find('('), text.rfind(')')) {
        (Some(open), Some(close)) if open < close => split_names(&text[open + 1..close]),
        _ => Vec::new(),
    }
}

fn split_names(list: &str) -> Vec<String> {
    list.split(',')
        .map(|s| normalize_name(s.trim()))
        .filter(|s| !s.is_empty())
        .collect()
}

fn attach_indexes(masked: &str, entities: &mut [Entity]) {
    for caps in INDEX_RE.captures_iter(masked) {
        let Some(whole) = caps.get(0) else { continue };
        let open = whole.end() - 1;
        let Some(close) = masked[open..].find(')').map(|p| open + p) else {
            continue;
        };
        let table = normalize_name(&caps[3]);
        let index = IndexDef {
            name: caps
                .get(2)
                .map_or_else(String::new, |m| normalize_name(m.as_str())),
            unique: caps.get(1).is_some(),
            method: caps
                .get(4)
                .map_or_else(|| "btree".to_string(), |m| m.as_str().to_ascii_lowercase()),
            columns: split_names(&masked[open + 1..close]),
        };
        if let Some(shape) = find_table_shape(entities, &table) {
            shape.indexes.push(index);
        }
    }
}

fn attach_comments(scanner: &Scanner<'_>, entities: &mut [Entity]) {
    let visible = scanner.mask_with(|region, _| region.is_comment() || region == Region::DollarQuoted);
    for caps in COMMENT_RE.captures_iter(&visible) {
        let target = normalize_name(&caps[2]);
        let comment = caps[3].replace("''", "'");
        if caps[1].eq_ignore_ascii_case("table") {
            if let Some(entity) = find_table(entities, &target) {
                entity.comment = Some(comment);
            }
            continue;
        }
        let Some((table, column)) = target.rsplit_once('.') else {
            continue;
        };
        if let Some(shape) = find_table_shape(entities, table) {
            if let Some(col) = shape
                .columns
                .iter_mut()
                .find(|c| c.name.eq_ignore_ascii_case(column))
            {
                col.comment = Some(comment);
            }
        }
    }
}

/// Table entity named `name`: exact case-insensitive match first, then by
/// short name when either side is unqualified.
fn find_table<'e>(entities: &'e mut [Entity], name: &str) -> Option<&'e mut Entity> {
    let short = short_of(name);
    let qualified = name.contains('.');
    let idx = entities
        .iter()
        .position(|e| e.kind == EntityKind::Table && e.full_name.eq_ignore_ascii_case(name))
        .or_else(|| {
            entities.iter().position(|e| {
                e.kind == EntityKind::Table
                    && (!qualified || !e.full_name.contains('.'))
                    && e.short_name.eq_ignore_ascii_case(&short)
            })
        })?;
    entities.get_mut(idx)
}

fn find_table_shape<'e>(entities: &'e mut [Entity], name: &str) -> Option<&'e mut TableShape> {
    match find_table(entities, name)?.detail.as_mut()? {
        EntityDetail::Table(shape) => Some(shape),
        EntityDetail::Column(_) => None,
    }
}

/// Strips identifier quotes and whitespace around dots.
pub fn normalize_name(raw: &str) -> String {
    raw.split('.')
        .map(|part| part.trim().trim_matches('"'))
        .collect::<Vec<_>>()
        .join(".")
}

fn short_of(full_name: &str) -> String {
    full_name
        .rsplit('.')
        .next()
        .unwrap_or(full_name)
        .to_string()
}
