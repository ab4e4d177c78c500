//! Level-1 dependency analysis.
//!
//! Every entity is reduced to a [`RelationSet`]: the functions it calls, the
//! modules it imports, the classes it instantiates and, for relational code,
//! the tables it reads and writes. Matching runs on masked copies of the
//! entity's executable part, so names inside comments and string literals
//! never show up as dependencies.

use super::code_parser::Entity;
use super::languages::{Denylists, Language};
use super::scan::Scanner;
use super::sql::{IDENT, normalize_name};
use crate::db::models::{EntityDetail, EntityKind, ForeignKey, RelationKind, RelationSet};
use regex::Regex;
use std::collections::HashSet;
use std::sync::LazyLock;

// ── relational patterns ──────────────────────────────────────────────

static SQL_EXECUTE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?is)\bexecute\b[^;]*;?").unwrap());

static SQL_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(r"((?:{IDENT}\s*\.\s*)?{IDENT})\s*\(")).unwrap()
});

static SQL_READ_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\b(?:from|join)\s+(?:only\s+)?((?:{IDENT}\s*\.\s*)?{IDENT})"
    ))
    .unwrap()
});

static SQL_UPDATE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bupdate\s+(?:only\s+)?((?:{IDENT}\s*\.\s*)?{IDENT})"
    ))
    .unwrap()
});

static SQL_INSERT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\binsert\s+into\s+((?:{IDENT}\s*\.\s*)?{IDENT})"
    ))
    .unwrap()
});

static SQL_DELETE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)\bdelete\s+from\s+(?:only\s+)?((?:{IDENT}\s*\.\s*)?{IDENT})"
    ))
    .unwrap()
});

static SQL_CTE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(&format!(
        r"(?i)(?:\bwith(?:\s+recursive)?|,)\s*({IDENT})\s+as\s*(?:(?:not\s+)?materialized\s*)?\("
    ))
    .unwrap()
});

/// Words that make a following `FROM x` something other than a table read.
const NON_TABLE_FROM: &[&str] = &[
    "delete", "distinct", "year", "month", "day", "hour", "minute", "second", "epoch", "dow",
    "doy", "week", "quarter", "both", "leading", "trailing",
];

/// Words after which `name (` is a column list or a table, not a call.
const NON_CALL_PRECEDERS: &[&str] = &[
    "into", "table", "from", "join", "update", "references", "only", "function", "procedure",
];

// ── script patterns ──────────────────────────────────────────────────

static JS_IMPORT_RES: LazyLock<[Regex; 4]> = LazyLock::new(|| {
    [
        Regex::new(r#"\bimport\s+(?:type\s+)?[\w$*{}\s,]+?\s+from\s*['"]([^'"]+)['"]"#).unwrap(),
        Regex::new(r#"\bimport\s*['"]([^'"]+)['"]"#).unwrap(),
        Regex::new(r#"\bimport\s*\(\s*['"`]([^'"`]+)['"`]\s*\)"#).unwrap(),
        Regex::new(
            r#"\bexport\s+(?:type\s+)?(?:\*(?:\s+as\s+[\w$]+)?|\{[^}]*\})\s*from\s*['"]([^'"]+)['"]"#,
        )
        .unwrap(),
    ]
});

static JS_REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"\brequire\s*\(\s*['"`]([^'"`]+)['"`]\s*\)"#).unwrap()
});

static JS_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"([A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)*)\s*\(").unwrap()
});

static JS_NEW_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\bnew\s+([A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)*)").unwrap()
});

static PHP_USE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?im)^\s*use\s+(?:function\s+|const\s+)?(\\?[A-Za-z_][\w\\]*)(?:\s+as\s+\w+)?\s*;")
        .unwrap()
});

static PHP_REQUIRE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r#"(?i)\b(?:require|include)(?:_once)?\s*\(?\s*(?:__DIR__\s*\.\s*)?['"]([^'"]+)['"]"#,
    )
    .unwrap()
});

static PHP_STATIC_CALL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(\\?[A-Za-z_][\w\\]*)\s*::\s*([A-Za-z_]\w*)\s*\(").unwrap()
});

static PHP_METHOD_CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\??->\s*([A-Za-z_]\w*)\s*\(").unwrap());

static PHP_CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(\\?[A-Za-z_][\w\\]*)\s*\(").unwrap());

static PHP_NEW_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bnew\s+(\\?[A-Za-z_][\w\\]*)").unwrap());

/// Derives level-1 relations from extracted entities.
pub struct DependencyAnalyzer {
    denylists: Denylists,
}

impl Default for DependencyAnalyzer {
    fn default() -> Self {
        Self::new(Denylists::defaults())
    }
}

impl DependencyAnalyzer {
    pub fn new(denylists: Denylists) -> Self {
        Self { denylists }
    }

    pub fn analyze(&self, entity: &Entity, language: Language) -> RelationSet {
        match (language, entity.kind) {
            (Language::Sql, EntityKind::Table) => table_relations(entity),
            (Language::Sql, _) => self.sql_relations(entity.inner_text()),
            // Declarations only; nothing executes.
            (_, EntityKind::Interface | EntityKind::Type | EntityKind::Enum) => {
                RelationSet::default()
            }
            (Language::JavaScript | Language::TypeScript, _) => {
                self.script_relations(entity.inner_text(), language)
            }
            (Language::Php, _) => self.php_relations(entity.inner_text()),
        }
    }

    fn denied(&self, language: Language, name: &str, separator: &str) -> bool {
        let simple = name.rsplit(separator).next().unwrap_or(name);
        self.denylists.contains(language, simple) || self.denylists.contains(language, name)
    }

    fn sql_relations(&self, text: &str) -> RelationSet {
        let syntax = Language::Sql.config().syntax;
        let scanner = Scanner::new(text, &syntax);
        // Quoted identifiers stay visible.
        let masked = scanner.mask_with(|region, opener| region.is_comment() || opener != b'"');
        let code = blank_matches(&masked, &SQL_EXECUTE_RE);
        let mut set = RelationSet::default();

        let ctes: HashSet<String> = SQL_CTE_RE
            .captures_iter(&code)
            .filter_map(|c| c.get(1))
            .map(|m| normalize_name(m.as_str()).to_ascii_lowercase())
            .collect();
        let is_table = |name: &str| {
            !ctes.contains(&name.to_ascii_lowercase())
                && !self.denylists.contains(Language::Sql, name)
        };

        for m in SQL_CALL_RE.captures_iter(&code).filter_map(|c| c.get(1)) {
            if matches!(prev_byte(&code, m.start()), Some(b'.' | b':' | b'"' | b'$'))
                || NON_CALL_PRECEDERS.contains(&word_before(&code, m.start()).as_str())
            {
                continue;
            }
            let name = normalize_name(m.as_str());
            if !self.denied(Language::Sql, &name, ".") {
                set.insert(RelationKind::Calls, name);
            }
        }

        for caps in SQL_READ_RE.captures_iter(&code) {
            let (Some(keyword), Some(m)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if NON_TABLE_FROM.contains(&word_before(&code, keyword.start()).as_str())
                || next_byte(&code, m.end()) == Some(b'(')
            {
                continue;
            }
            let name = normalize_name(m.as_str());
            if is_table(&name) {
                set.insert(RelationKind::SelectFrom, name);
            }
        }

        for caps in SQL_UPDATE_RE.captures_iter(&code) {
            let (Some(keyword), Some(m)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if matches!(word_before(&code, keyword.start()).as_str(), "for" | "key" | "on" | "do") {
                continue;
            }
            let name = normalize_name(m.as_str());
            if is_table(&name) {
                set.insert(RelationKind::UpdateTables, name);
            }
        }

        let writes: [(&Regex, RelationKind); 2] = [
            (&SQL_INSERT_RE, RelationKind::InsertTables),
            (&SQL_DELETE_RE, RelationKind::DeleteTables),
        ];
        for (re, kind) in writes {
            for m in re.captures_iter(&code).filter_map(|c| c.get(1)) {
                let name = normalize_name(m.as_str());
                if is_table(&name) {
                    set.insert(kind, name);
                }
            }
        }
        set
    }

    fn script_relations(&self, text: &str, language: Language) -> RelationSet {
        let syntax = language.config().syntax;
        let scanner = Scanner::new(text, &syntax);
        let stripped = scanner.mask(true, false);
        let code = scanner.mask(true, true);
        let mut set = RelationSet::default();

        for re in JS_IMPORT_RES.iter() {
            for m in re.captures_iter(&stripped).filter_map(|c| c.get(1)) {
                set.insert(RelationKind::Imports, m.as_str());
            }
        }
        for m in JS_REQUIRE_RE.captures_iter(&stripped).filter_map(|c| c.get(1)) {
            set.insert(RelationKind::Requires, m.as_str());
        }

        for caps in JS_CALL_RE.captures_iter(&code) {
            let (Some(whole), Some(m)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if matches!(prev_byte(&code, m.start()), Some(b'.' | b'#'))
                || matches!(word_before(&code, m.start()).as_str(), "new" | "function")
                || is_definition(&scanner, whole.end() - 1)
            {
                continue;
            }
            let name = m.as_str().strip_prefix("this.").unwrap_or(m.as_str());
            if !self.denied(language, name, ".") {
                set.insert(RelationKind::Calls, name);
            }
        }

        for m in JS_NEW_RE.captures_iter(&code).filter_map(|c| c.get(1)) {
            if !self.denied(language, m.as_str(), ".") {
                set.insert(RelationKind::Instantiations, m.as_str());
            }
        }
        set
    }

    fn php_relations(&self, text: &str) -> RelationSet {
        let syntax = Language::Php.config().syntax;
        let scanner = Scanner::new(text, &syntax);
        let stripped = scanner.mask(true, false);
        let code = scanner.mask(true, true);
        let mut set = RelationSet::default();

        for m in PHP_USE_RE.captures_iter(&code).filter_map(|c| c.get(1)) {
            set.insert(RelationKind::Imports, m.as_str().trim_start_matches('\\'));
        }
        for m in PHP_REQUIRE_RE.captures_iter(&stripped).filter_map(|c| c.get(1)) {
            set.insert(RelationKind::Requires, m.as_str());
        }

        for caps in PHP_STATIC_CALL_RE.captures_iter(&code) {
            let (Some(class), Some(method)) = (caps.get(1), caps.get(2)) else {
                continue;
            };
            if prev_byte(&code, class.start()) == Some(b'$') {
                continue;
            }
            let class = class.as_str().trim_start_matches('\\');
            let target = if ["self", "static", "parent"]
                .iter()
                .any(|k| class.eq_ignore_ascii_case(k))
            {
                method.as_str().to_string()
            } else {
                format!("{class}::{}", method.as_str())
            };
            if !self.denylists.contains(Language::Php, method.as_str()) {
                set.insert(RelationKind::Calls, target);
            }
        }

        for m in PHP_METHOD_CALL_RE.captures_iter(&code).filter_map(|c| c.get(1)) {
            if !self.denylists.contains(Language::Php, m.as_str()) {
                set.insert(RelationKind::Calls, m.as_str());
            }
        }

        for m in PHP_CALL_RE.captures_iter(&code).filter_map(|c| c.get(1)) {
            if matches!(prev_byte(&code, m.start()), Some(b'>' | b':' | b'$'))
                || matches!(word_before(&code, m.start()).as_str(), "new" | "function" | "fn")
            {
                continue;
            }
            let name = m.as_str().trim_start_matches('\\');
            if !self.denied(Language::Php, name, "\\") {
                set.insert(RelationKind::Calls, name);
            }
        }

        for m in PHP_NEW_RE.captures_iter(&code).filter_map(|c| c.get(1)) {
            let name = m.as_str().trim_start_matches('\\');
            if !name.eq_ignore_ascii_case("class") && !self.denylists.contains(Language::Php, name) {
                set.insert(RelationKind::Instantiations, name);
            }
        }
        set
    }
}

/// Foreign-key targets of a table, from column `REFERENCES` and table constraints.
fn table_relations(entity: &Entity) -> RelationSet {
    let mut set = RelationSet::default();
    let Some(EntityDetail::Table(shape)) = entity.detail.as_ref() else {
        return set;
    };
    for column in &shape.columns {
        if let Some(r) = &column.references {
            set.insert(RelationKind::ReferencedTables, r.table.clone());
            set.foreign_keys.push(ForeignKey {
                columns: vec![column.name.clone()],
                table: r.table.clone(),
                ref_columns: vec![r.column.clone()],
            });
        }
    }
    for constraint in &shape.constraints {
        if let Some(fk) = &constraint.references {
            set.insert(RelationKind::ReferencedTables, fk.table.clone());
            set.foreign_keys.push(fk.clone());
        }
    }
    set
}

/// `name(...) {` opens a method or function definition, not a call.
fn is_definition(scanner: &Scanner<'_>, open: usize) -> bool {
    scanner
        .matching(open)
        .map(|close| scanner.skip_trivia(close))
        .is_some_and(|pos| scanner.text().as_bytes().get(pos) == Some(&b'{'))
}

fn blank_matches(text: &str, re: &Regex) -> String {
    re.replace_all(text, |caps: &regex::Captures<'_>| " ".repeat(caps[0].len()))
        .into_owned()
}

fn prev_byte(text: &str, pos: usize) -> Option<u8> {
    text[..pos].trim_end().bytes().last()
}

fn next_byte(text: &str, pos: usize) -> Option<u8> {
    text[pos..].trim_start().bytes().next()
}

/// The identifier-like word directly before `pos`, lowercased.
fn word_before(text: &str, pos: usize) -> String {
    let head = text[..pos].trim_end();
    let start = head
        .char_indices()
        .rev()
        .find(|(_, c)| !(c.is_ascii_alphanumeric() || *c == '_'))
        .map_or(0, |(i, c)| i + c.len_utf8());
    head[start..].to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::code_parser::CodeParser;
    use std::collections::BTreeMap;

    fn targets(set: &RelationSet, kind: RelationKind) -> Vec<&str> {
        set.targets(kind).collect()
    }

    fn first_entity(source: &str, language: Language) -> Entity {
        let out = CodeParser::new().parse_code(source, language);
        out.entities.into_iter().next().expect("one entity")
    }

    const ROUTINE: &str = r#"
CREATE OR REPLACE FUNCTION billing.close_order(p_id integer) RETURNS void AS $$
DECLARE
    v_total numeric;
BEGIN
    -- SELECT * FROM secret_table
    WITH recent AS (
        SELECT e.order_id FROM events e WHERE e.created_at > now() - interval '1 day'
    )
    SELECT coalesce(sum(o.amount), 0)::numeric(12,2) INTO v_total
      FROM orders o
      JOIN customers c ON c.id = o.customer_id
     WHERE o.id = p_id AND o.id IN (SELECT order_id FROM recent);
    PERFORM audit.log_change('orders', p_id);
    v_total := calc_discount(v_total);
    UPDATE inventory SET reserved = reserved - 1 WHERE order_id = p_id;
    INSERT INTO billing.invoices (order_id, total) VALUES (p_id, v_total);
    DELETE FROM carts WHERE order_id = p_id;
    EXECUTE format('TRUNCATE %I', 'tmp_' || p_id);
    RAISE NOTICE 'moved FROM staging';
END;
$$ LANGUAGE plpgsql;
"#;

    #[test]
    fn test_sql_routine_relations() {
        let entity = first_entity(ROUTINE, Language::Sql);
        let set = DependencyAnalyzer::default().analyze(&entity, Language::Sql);

        assert_eq!(
            targets(&set, RelationKind::Calls),
            vec!["audit.log_change", "calc_discount"]
        );
        assert_eq!(
            targets(&set, RelationKind::SelectFrom),
            vec!["customers", "events", "orders"]
        );
        assert_eq!(targets(&set, RelationKind::UpdateTables), vec!["inventory"]);
        assert_eq!(targets(&set, RelationKind::InsertTables), vec!["billing.invoices"]);
        assert_eq!(targets(&set, RelationKind::DeleteTables), vec!["carts"]);
    }

    #[test]
    fn test_sql_routine_with_cyrillic_names() {
        let src = r#"
CREATE FUNCTION отчёты.итог(p_id integer) RETURNS numeric AS $$
DECLARE
    v numeric;
BEGIN
    -- считаем «сумму» FROM черновик
    SELECT з.сумма FROM заказы з WHERE з.id = p_id INTO v;
    PERFORM журнал.записать('итог: FROM архив', p_id);
    UPDATE остатки SET кол = кол - 1 WHERE id = p_id;
    RETURN v;
END;
$$ LANGUAGE plpgsql;
"#;
        let entity = first_entity(src, Language::Sql);
        assert_eq!(entity.full_name, "отчёты.итог");
        let set = DependencyAnalyzer::default().analyze(&entity, Language::Sql);
        assert!(targets(&set, RelationKind::Calls).contains(&"журнал.записать"));
        assert_eq!(targets(&set, RelationKind::SelectFrom), vec!["заказы"]);
        assert_eq!(targets(&set, RelationKind::UpdateTables), vec!["остатки"]);
    }

    #[test]
    fn test_identical_bodies_serialize_identically() {
        let analyzer = DependencyAnalyzer::default();
        let a = analyzer.analyze(&first_entity(ROUTINE, Language::Sql), Language::Sql);
        let b = analyzer.analyze(&first_entity(ROUTINE, Language::Sql), Language::Sql);
        assert_eq!(serde_json::to_string(&a).unwrap(), serde_json::to_string(&b).unwrap());
    }

    #[test]
    fn test_extra_builtins_filter_calls() {
        let mut extras = BTreeMap::new();
        extras.insert("sql".to_string(), vec!["log_change".to_string()]);
        let analyzer = DependencyAnalyzer::new(Denylists::with_extras(&extras));
        let set = analyzer.analyze(&first_entity(ROUTINE, Language::Sql), Language::Sql);
        assert_eq!(targets(&set, RelationKind::Calls), vec!["calc_discount"]);
    }

    #[test]
    fn test_table_foreign_keys() {
        let entity = first_entity(
            "CREATE TABLE public.orders (\n  id serial PRIMARY KEY,\n  customer_id int REFERENCES customers(id),\n  region_code text,\n  FOREIGN KEY (region_code) REFERENCES geo.regions (code)\n);",
            Language::Sql,
        );
        let set = DependencyAnalyzer::default().analyze(&entity, Language::Sql);
        assert_eq!(
            targets(&set, RelationKind::ReferencedTables),
            vec!["customers", "geo.regions"]
        );
        assert_eq!(set.foreign_keys.len(), 2);
        assert_eq!(set.foreign_keys[0].columns, vec!["customer_id".to_string()]);
        assert_eq!(set.foreign_keys[0].ref_columns, vec!["id".to_string()]);
        assert_eq!(set.foreign_keys[1].table, "geo.regions");
    }

    #[test]
    fn test_view_reads_and_calls() {
        let entity = first_entity(
            "CREATE VIEW active_orders AS\n  SELECT o.id, price_of(o.id) FROM orders o JOIN customers c ON c.id = o.customer_id;",
            Language::Sql,
        );
        let set = DependencyAnalyzer::default().analyze(&entity, Language::Sql);
        assert_eq!(targets(&set, RelationKind::Calls), vec!["price_of"]);
        assert_eq!(targets(&set, RelationKind::SelectFrom), vec!["customers", "orders"]);
    }

    #[test]
    fn test_script_function_relations() {
        let src = r#"
async function loadReport(id) {
  const { format } = require('./format');
  const mod = await import('./lazy.js');
  // fetchLegacy(id)
  const label = "render(x)";
  const report = new ReportBuilder(id);
  const rows = await db.query(sql, [id]);
  rows.forEach(r => report.add(r));
  return formatRows(rows).map(String);
}
"#;
        let entity = first_entity(src, Language::JavaScript);
        let set = DependencyAnalyzer::default().analyze(&entity, Language::JavaScript);
        assert_eq!(targets(&set, RelationKind::Calls), vec!["db.query", "formatRows"]);
        assert_eq!(targets(&set, RelationKind::Requires), vec!["./format"]);
        assert_eq!(targets(&set, RelationKind::Imports), vec!["./lazy.js"]);
        assert_eq!(targets(&set, RelationKind::Instantiations), vec!["ReportBuilder"]);
    }

    #[test]
    fn test_script_import_forms() {
        let src = "import fs from 'node:fs';\nimport { a, b } from \"./ab\";\nimport './side-effect';\nexport * from './reexport';\n";
        let set = DependencyAnalyzer::default().script_relations(src, Language::TypeScript);
        assert_eq!(
            targets(&set, RelationKind::Imports),
            vec!["./ab", "./reexport", "./side-effect", "node:fs"]
        );
    }

    #[test]
    fn test_class_member_heads_are_not_calls() {
        let src = "class Cart {\n  total() {\n    return sumLines(this.lines);\n  }\n  clear() { this.reset(); }\n}\n";
        let entity = first_entity(src, Language::JavaScript);
        let set = DependencyAnalyzer::default().analyze(&entity, Language::JavaScript);
        assert_eq!(targets(&set, RelationKind::Calls), vec!["reset", "sumLines"]);
    }

    #[test]
    fn test_type_declarations_have_no_relations() {
        let entity = first_entity(
            "interface Api {\n  fetchAll(): Promise<void>;\n}\n",
            Language::TypeScript,
        );
        assert!(DependencyAnalyzer::default()
            .analyze(&entity, Language::TypeScript)
            .is_empty());
    }

    #[test]
    fn test_php_relations() {
        let src = r#"<?php
function sync(array $ids) {
    require_once __DIR__ . '/bootstrap.php';
    $repo = new \App\Repo\SkillRepository();
    $repo->load($ids);
    self::notify(count($ids));
    Cache::forget('skills');
    return normalize_ids($ids);
}
"#;
        let entity = first_entity(src, Language::Php);
        let set = DependencyAnalyzer::default().analyze(&entity, Language::Php);
        assert_eq!(
            targets(&set, RelationKind::Calls),
            vec!["Cache::forget", "load", "normalize_ids", "notify"]
        );
        assert_eq!(targets(&set, RelationKind::Requires), vec!["/bootstrap.php"]);
        assert_eq!(
            targets(&set, RelationKind::Instantiations),
            vec!["App\\Repo\\SkillRepository"]
        );
    }

    #[test]
    fn test_php_trait_use() {
        let set = DependencyAnalyzer::default()
            .php_relations("\n    use \\App\\Concerns\\Loggable;\n    use Cacheable;\n");
        assert_eq!(
            targets(&set, RelationKind::Imports),
            vec!["App\\Concerns\\Loggable", "Cacheable"]
        );
    }
}
