use super::javascript::JavaScriptExtractor;
use super::languages::Language;
use super::php::PhpExtractor;
use super::scan;
use super::sql::SqlExtractor;
use super::typescript::TypeScriptExtractor;
use crate::db::models::{EntityDetail, EntityKind, SourceBody};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::ops::Range;
use tracing::warn;

/// One code construct found in a source unit.
#[derive(Debug, Clone, PartialEq)]
pub struct Entity {
    pub kind: EntityKind,
    pub full_name: String,
    pub short_name: String,
    pub signature: Option<String>,
    pub comment: Option<String>,
    /// Full source span of the construct.
    pub body: String,
    /// Executable part of `body` (block contents, routine body).
    pub inner: Range<usize>,
    pub start_line: usize,
    pub end_line: usize,
    pub parent: Option<String>,
    pub detail: Option<EntityDetail>,
}

impl Entity {
    pub fn inner_text(&self) -> &str {
        self.body.get(self.inner.clone()).unwrap_or(&self.body)
    }

    pub fn to_source_body(&self) -> SourceBody {
        SourceBody {
            full_name: self.full_name.clone(),
            short_name: self.short_name.clone(),
            kind: self.kind,
            signature: self.signature.clone(),
            comment: self.comment.clone(),
            body: self.body.clone(),
            parent: self.parent.clone(),
            start_line: Some(self.start_line),
            end_line: Some(self.end_line),
            detail: self.detail.clone(),
        }
    }
}

/// An anchor that could not be turned into an entity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExtractionIssue {
    pub kind: EntityKind,
    pub name: Option<String>,
    pub line: usize,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Extraction {
    pub entities: Vec<Entity>,
    pub issues: Vec<ExtractionIssue>,
}

impl Extraction {
    pub(crate) fn push_issue(
        &mut self,
        text: &str,
        pos: usize,
        kind: EntityKind,
        name: Option<&str>,
        message: &str,
    ) {
        let line = scan::line_of(text, pos);
        warn!(
            "Dropped {kind} {} at line {line}: {message}",
            name.unwrap_or("<anonymous>")
        );
        self.issues.push(ExtractionIssue {
            kind,
            name: name.map(str::to_string),
            line,
            message: message.to_string(),
        });
    }
}

/// Pattern-anchored extractor for one language.
///
/// Implementations are pure: the same text always yields the same entities
/// in the same order.
pub trait EntityExtractor: Send + Sync {
    fn language(&self) -> Language;

    fn extract(&self, source: &str) -> Extraction;
}

/// Dispatches source text to the extractor of its language.
pub struct CodeParser {
    extractors: HashMap<Language, Box<dyn EntityExtractor>>,
}

impl Default for CodeParser {
    fn default() -> Self {
        Self::new()
    }
}

impl CodeParser {
    pub fn new() -> Self {
        let all: Vec<Box<dyn EntityExtractor>> = vec![
            Box::new(SqlExtractor),
            Box::new(JavaScriptExtractor),
            Box::new(TypeScriptExtractor),
            Box::new(PhpExtractor),
        ];
        Self {
            extractors: all.into_iter().map(|e| (e.language(), e)).collect(),
        }
    }

    pub fn parse_code(&self, source: &str, language: Language) -> Extraction {
        match self.extractors.get(&language) {
            Some(extractor) => extractor.extract(source),
            None => Extraction::default(),
        }
    }
}

/// Builds an entity from a byte span of `text`.
pub(crate) struct EntityBuilder<'a> {
    pub text: &'a str,
    pub span: Range<usize>,
    pub inner: Range<usize>,
}

impl EntityBuilder<'_> {
    pub fn build(
        self,
        kind: EntityKind,
        full_name: String,
        short_name: String,
        signature: Option<String>,
        comment: Option<String>,
    ) -> Entity {
        let body = self.text[self.span.clone()].to_string();
        let inner = self.inner.start.saturating_sub(self.span.start)
            ..self.inner.end.saturating_sub(self.span.start).min(body.len());
        Entity {
            kind,
            full_name,
            short_name,
            signature,
            comment,
            body,
            inner,
            start_line: scan::line_of(self.text, self.span.start),
            end_line: scan::line_of(self.text, self.span.end.saturating_sub(1)),
            parent: None,
            detail: None,
        }
    }
}

/// Text between the header start and the block opening, whitespace-squashed.
pub(crate) fn header_signature(text: &str, start: usize, open: usize) -> String {
    scan::squash_whitespace(text[start..open].trim())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dispatch_by_language() {
        let parser = CodeParser::new();
        let js = parser.parse_code("function hello() { return 1; }", Language::JavaScript);
        assert_eq!(js.entities.len(), 1);
        assert_eq!(js.entities[0].full_name, "hello");
        assert_eq!(js.entities[0].inner_text(), " return 1; ");

        let sql = parser.parse_code(
            "CREATE FUNCTION public.one() RETURNS int AS $$ SELECT 1 $$ LANGUAGE sql;",
            Language::Sql,
        );
        assert_eq!(sql.entities.len(), 1);
        assert_eq!(sql.entities[0].full_name, "public.one");
    }

    #[test]
    fn test_source_body_carries_lines() {
        let parser = CodeParser::new();
        let out = parser.parse_code("\n\nfunction a() {\n}\n", Language::JavaScript);
        let body = out.entities[0].to_source_body();
        assert_eq!(body.start_line, Some(3));
        assert_eq!(body.end_line, Some(4));
    }
}
