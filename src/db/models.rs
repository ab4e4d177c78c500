use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

// ── Entity kinds and levels ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityKind {
    Function,
    Procedure,
    Table,
    View,
    #[serde(rename = "table_column")]
    Column,
    Class,
    Interface,
    Trait,
    Type,
    Enum,
    Method,
    Arrow,
}

impl EntityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Function => "function",
            EntityKind::Procedure => "procedure",
            EntityKind::Table => "table",
            EntityKind::View => "view",
            EntityKind::Column => "table_column",
            EntityKind::Class => "class",
            EntityKind::Interface => "interface",
            EntityKind::Trait => "trait",
            EntityKind::Type => "type",
            EntityKind::Enum => "enum",
            EntityKind::Method => "method",
            EntityKind::Arrow => "arrow",
        }
    }

    /// Relational routines get a column-lineage pass.
    pub fn is_routine(&self) -> bool {
        matches!(self, EntityKind::Function | EntityKind::Procedure)
    }
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s {
            "function" => EntityKind::Function,
            "procedure" => EntityKind::Procedure,
            "table" => EntityKind::Table,
            "view" => EntityKind::View,
            "table_column" => EntityKind::Column,
            "class" => EntityKind::Class,
            "interface" => EntityKind::Interface,
            "trait" => EntityKind::Trait,
            "type" => EntityKind::Type,
            "enum" => EntityKind::Enum,
            "method" => EntityKind::Method,
            "arrow" => EntityKind::Arrow,
            other => return Err(format!("unknown entity kind: {other}")),
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ChunkLevel {
    Source = 0,
    Relations = 1,
    Enrichment = 2,
}

impl ChunkLevel {
    pub fn as_i64(self) -> i64 {
        self as i64
    }

    pub fn from_i64(level: i64) -> Option<Self> {
        match level {
            0 => Some(ChunkLevel::Source),
            1 => Some(ChunkLevel::Relations),
            2 => Some(ChunkLevel::Enrichment),
            _ => None,
        }
    }
}

// ── Level 0: source bodies ───────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceBody {
    pub full_name: String,
    pub short_name: String,
    pub kind: EntityKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub body: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub start_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_line: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<EntityDetail>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum EntityDetail {
    Table(TableShape),
    Column(ColumnShape),
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableShape {
    pub schema: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub constraints: Vec<TableConstraint>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub indexes: Vec<IndexDef>,
}

impl TableShape {
    pub fn column(&self, name: &str) -> Option<&ColumnDef> {
        self.columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(name))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: String,
    pub nullable: bool,
    #[serde(default)]
    pub primary_key: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ColumnRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnRef {
    pub table: String,
    pub column: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConstraintKind {
    PrimaryKey,
    ForeignKey,
    Unique,
    Check,
    Exclude,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableConstraint {
    pub kind: ConstraintKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub columns: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub references: Option<ForeignKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub unique: bool,
    pub method: String,
    pub columns: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ColumnShape {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,
    pub column: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nullable: Option<bool>,
    /// Routines that read or write this column, sorted.
    pub sources: Vec<String>,
}

// ── Level 1: relations ───────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum RelationKind {
    #[serde(rename = "called_functions")]
    Calls,
    #[serde(rename = "imports")]
    Imports,
    #[serde(rename = "requires")]
    Requires,
    #[serde(rename = "instantiations")]
    Instantiations,
    #[serde(rename = "select_from")]
    SelectFrom,
    #[serde(rename = "update_tables")]
    UpdateTables,
    #[serde(rename = "insert_tables")]
    InsertTables,
    #[serde(rename = "delete_tables")]
    DeleteTables,
    #[serde(rename = "referenced_tables")]
    ReferencedTables,
}

impl RelationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::Calls => "called_functions",
            RelationKind::Imports => "imports",
            RelationKind::Requires => "requires",
            RelationKind::Instantiations => "instantiations",
            RelationKind::SelectFrom => "select_from",
            RelationKind::UpdateTables => "update_tables",
            RelationKind::InsertTables => "insert_tables",
            RelationKind::DeleteTables => "delete_tables",
            RelationKind::ReferencedTables => "referenced_tables",
        }
    }

    pub fn link_type(&self) -> LinkType {
        match self {
            RelationKind::Calls => LinkType::Calls,
            RelationKind::Imports => LinkType::Imports,
            RelationKind::Requires => LinkType::Requires,
            RelationKind::Instantiations => LinkType::Instantiates,
            RelationKind::SelectFrom => LinkType::ReadsTable,
            RelationKind::UpdateTables => LinkType::UpdatesTable,
            RelationKind::InsertTables => LinkType::InsertsTable,
            RelationKind::DeleteTables => LinkType::DeletesTable,
            RelationKind::ReferencedTables => LinkType::ReferencesTable,
        }
    }

    /// Whether the fix-links step tries to qualify short names of this kind.
    /// Module paths from `require`/`include` are file references, not identities.
    pub fn is_resolvable(&self) -> bool {
        !matches!(self, RelationKind::Requires)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ForeignKey {
    pub columns: Vec<String>,
    pub table: String,
    pub ref_columns: Vec<String>,
}

/// Sorted, de-duplicated dependency targets of one entity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationSet {
    pub relations: BTreeMap<RelationKind, BTreeSet<String>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub foreign_keys: Vec<ForeignKey>,
}

impl RelationSet {
    pub fn insert(&mut self, kind: RelationKind, target: impl Into<String>) {
        let target = target.into();
        if target.is_empty() {
            return;
        }
        self.relations.entry(kind).or_default().insert(target);
    }

    pub fn targets(&self, kind: RelationKind) -> impl Iterator<Item = &str> {
        self.relations
            .get(&kind)
            .into_iter()
            .flat_map(|set| set.iter().map(String::as_str))
    }

    /// Replaces `old` with `new` under `kind`; returns whether anything changed.
    pub fn rewrite(&mut self, kind: RelationKind, old: &str, new: &str) -> bool {
        match self.relations.get_mut(&kind) {
            Some(set) => {
                if set.remove(old) {
                    set.insert(new.to_string());
                    true
                } else {
                    false
                }
            }
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.relations.values().all(BTreeSet::is_empty) && self.foreign_keys.is_empty()
    }

    /// Every `(link type, target)` edge this set implies, in stable order.
    pub fn edges(&self) -> Vec<(LinkType, String)> {
        self.relations
            .iter()
            .flat_map(|(kind, set)| set.iter().map(move |t| (kind.link_type(), t.clone())))
            .collect()
    }
}

// ── Level 2: enrichment ──────────────────────────────────────────────

/// Derived analysis attached by downstream tooling; stored verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnrichmentGraph {
    pub logic: String,
    #[serde(default)]
    pub graph: serde_json::Value,
}

// ── Chunk payloads ───────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub enum ChunkBody {
    Source(SourceBody),
    Relations(RelationSet),
    Enrichment(EnrichmentGraph),
}

impl ChunkBody {
    pub fn level(&self) -> ChunkLevel {
        match self {
            ChunkBody::Source(_) => ChunkLevel::Source,
            ChunkBody::Relations(_) => ChunkLevel::Relations,
            ChunkBody::Enrichment(_) => ChunkLevel::Enrichment,
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        match self {
            ChunkBody::Source(b) => serde_json::to_string(b),
            ChunkBody::Relations(r) => serde_json::to_string(r),
            ChunkBody::Enrichment(e) => serde_json::to_string(e),
        }
    }

    pub fn from_json(level: ChunkLevel, content: &str) -> serde_json::Result<Self> {
        Ok(match level {
            ChunkLevel::Source => ChunkBody::Source(serde_json::from_str(content)?),
            ChunkLevel::Relations => ChunkBody::Relations(serde_json::from_str(content)?),
            ChunkLevel::Enrichment => ChunkBody::Enrichment(serde_json::from_str(content)?),
        })
    }

    pub fn as_source(&self) -> Option<&SourceBody> {
        match self {
            ChunkBody::Source(b) => Some(b),
            _ => None,
        }
    }

    pub fn as_relations(&self) -> Option<&RelationSet> {
        match self {
            ChunkBody::Relations(r) => Some(r),
            _ => None,
        }
    }
}

// ── Links ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum LinkType {
    Calls,
    Imports,
    Requires,
    Instantiates,
    ReadsTable,
    UpdatesTable,
    InsertsTable,
    DeletesTable,
    ReferencesTable,
    ReadsColumn,
    UpdatesColumn,
    InsertsColumn,
}

impl LinkType {
    /// Edge types written from level-1 relation sets.
    pub const RELATION_TYPES: &'static [LinkType] = &[
        LinkType::Calls,
        LinkType::Imports,
        LinkType::Requires,
        LinkType::Instantiates,
        LinkType::ReadsTable,
        LinkType::UpdatesTable,
        LinkType::InsertsTable,
        LinkType::DeletesTable,
        LinkType::ReferencesTable,
    ];

    /// Edge types written by column lineage.
    pub const COLUMN_TYPES: &'static [LinkType] = &[
        LinkType::ReadsColumn,
        LinkType::UpdatesColumn,
        LinkType::InsertsColumn,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::Calls => "calls",
            LinkType::Imports => "imports",
            LinkType::Requires => "requires",
            LinkType::Instantiates => "instantiates",
            LinkType::ReadsTable => "reads_table",
            LinkType::UpdatesTable => "updates_table",
            LinkType::InsertsTable => "inserts_table",
            LinkType::DeletesTable => "deletes_table",
            LinkType::ReferencesTable => "references_table",
            LinkType::ReadsColumn => "reads_column",
            LinkType::UpdatesColumn => "updates_column",
            LinkType::InsertsColumn => "inserts_column",
        }
    }
}

impl fmt::Display for LinkType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Rows ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FileRecord {
    pub id: i64,
    pub name: String,
    pub context: String,
    pub language: String,
    pub indexed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub id: i64,
    pub full_name: String,
    pub context: String,
    pub kind: String,
    pub short_name: Option<String>,
    pub display_name: Option<String>,
    pub file_id: Option<i64>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy)]
pub struct NewIdentity<'a> {
    pub full_name: &'a str,
    pub kind: &'a str,
    pub short_name: Option<&'a str>,
    pub display_name: Option<&'a str>,
    pub file_id: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct StoredChunk {
    pub id: i64,
    pub file_id: i64,
    pub full_name: Option<String>,
    pub level: ChunkLevel,
    pub kind: String,
    pub parent_chunk_id: Option<i64>,
    pub identity_id: Option<i64>,
    pub body: ChunkBody,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteStatus {
    Created,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkWrite {
    pub id: i64,
    pub status: WriteStatus,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Link {
    pub id: i64,
    pub context: String,
    pub source: String,
    pub target: String,
    pub link_type: String,
    pub file_id: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_relation_set_is_sorted_and_deduplicated() {
        let mut a = RelationSet::default();
        a.insert(RelationKind::Calls, "zeta");
        a.insert(RelationKind::Calls, "alpha");
        a.insert(RelationKind::Calls, "zeta");
        a.insert(RelationKind::SelectFrom, "orders");

        let mut b = RelationSet::default();
        b.insert(RelationKind::SelectFrom, "orders");
        b.insert(RelationKind::Calls, "alpha");
        b.insert(RelationKind::Calls, "zeta");

        let ja = ChunkBody::Relations(a).to_json().unwrap();
        let jb = ChunkBody::Relations(b).to_json().unwrap();
        assert_eq!(ja, jb);
        assert_eq!(
            ja,
            r#"{"relations":{"called_functions":["alpha","zeta"],"select_from":["orders"]}}"#
        );
    }

    #[test]
    fn test_relation_rewrite() {
        let mut set = RelationSet::default();
        set.insert(RelationKind::Calls, "calc");
        assert!(set.rewrite(RelationKind::Calls, "calc", "billing.calc"));
        assert!(!set.rewrite(RelationKind::Calls, "calc", "billing.calc"));
        assert_eq!(
            set.targets(RelationKind::Calls).collect::<Vec<_>>(),
            vec!["billing.calc"]
        );
        // A kind with no targets is left alone.
        assert!(!set.rewrite(RelationKind::Instantiations, "calc", "billing.calc"));
        assert_eq!(set.targets(RelationKind::Instantiations).count(), 0);
    }

    #[test]
    fn test_chunk_body_level_selects_variant() {
        let body = ChunkBody::Source(SourceBody {
            full_name: "public.orders.id".into(),
            short_name: "id".into(),
            kind: EntityKind::Column,
            signature: None,
            comment: None,
            body: String::new(),
            parent: None,
            start_line: None,
            end_line: None,
            detail: Some(EntityDetail::Column(ColumnShape {
                table: Some("public.orders".into()),
                column: "id".into(),
                data_type: Some("int".into()),
                nullable: Some(false),
                sources: vec!["public.f".into()],
            })),
        });
        let json = body.to_json().unwrap();
        assert!(json.contains(r#""kind":"table_column""#));
        assert!(json.contains(r#""shape":"column""#));
        let back = ChunkBody::from_json(ChunkLevel::Source, &json).unwrap();
        assert_eq!(back, body);
        assert!(ChunkBody::from_json(ChunkLevel::Relations, "[1]").is_err());
    }

    #[test]
    fn test_kind_names() {
        assert_eq!("table_column".parse::<EntityKind>(), Ok(EntityKind::Column));
        assert_eq!(EntityKind::Procedure.as_str(), "procedure");
        assert!(EntityKind::Procedure.is_routine());
        assert!(!EntityKind::View.is_routine());
    }
}
