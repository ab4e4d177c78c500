//! JavaScript extraction, plus the script engine TypeScript builds on.
//!
//! Anchors are matched on a copy of the unit with comments and string
//! literals blanked. Classes, functions and arrow bindings claim their
//! spans; class members are found by walking the class body at depth zero.

use super::code_parser::{Entity, EntityBuilder, EntityExtractor, Extraction};
use super::languages::Language;
use super::scan::{self, BlockSpan, ClaimedSpans, Scanner, Syntax};
use crate::db::models::EntityKind;
use regex::Regex;
use std::ops::Range;
use std::sync::LazyLock;
use tracing::debug;

static CLASS_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:\bexport\s+(?:default\s+)?)?(?:\bdeclare\s+)?(?:\babstract\s+)?\bclass\s+([A-Za-z_$][\w$]*)(?:\s*<[^{}]*?>)?(?:\s+extends\s+([A-Za-z_$][\w$.]*))?",
    )
    .unwrap()
});

static FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?:\bexport\s+(?:default\s+)?)?(?:\bdeclare\s+)?(?:\basync\s+)?\bfunction\b\s*\*?\s*([A-Za-z_$][\w$]*)\s*(?:<[^(]*?>)?\s*\(",
    )
    .unwrap()
});

static BINDING_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\bexport\s+)?\b(?:const|let|var)\s+([A-Za-z_$][\w$]*)\s*(?::[^=;]+?)?=")
        .unwrap()
});

static MEMBER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?m)(?:^|[;}\s])((?:(?:static|async|public|private|protected|readonly|override|abstract|declare|get|set)\s+)*(?:\*\s*)?(#?[A-Za-z_$][\w$]*))\s*(?:<[^<>(){}]*>\s*)?(?:\?\s*)?(?::[^=;(){}]*)?(\(|=)",
    )
    .unwrap()
});

/// Words that can look like a member head but never name one.
const CONTROL_WORDS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "return", "function", "new", "typeof", "await",
    "yield", "super", "this", "do", "else",
];

pub struct JavaScriptExtractor;

impl EntityExtractor for JavaScriptExtractor {
    fn language(&self) -> Language {
        Language::JavaScript
    }

    fn extract(&self, source: &str) -> Extraction {
        extract_script(source, Language::JavaScript, |_, _| Vec::new())
    }
}

/// How the span of an anchored construct is found.
#[derive(Debug, Clone)]
pub(crate) enum Shape {
    Class { extends: Option<String> },
    /// `head_end` is just past the opening parenthesis of the parameters.
    Function,
    Arrow { params: Range<usize>, body_start: usize },
    /// A braced block after the header (interfaces, enums).
    Block,
    /// Header-only construct ending at the next top-level `;`.
    Statement,
}

#[derive(Debug, Clone)]
pub(crate) struct ScriptAnchor {
    pub kind: EntityKind,
    pub shape: Shape,
    /// Entity start, including `export` and modifiers.
    pub start: usize,
    pub head_end: usize,
    pub name: String,
}

/// Shared extraction loop for JavaScript-family languages. `extra` adds
/// language-specific anchors found on the masked text.
pub(crate) fn extract_script(
    source: &str,
    language: Language,
    extra: impl Fn(&Scanner<'_>, &str) -> Vec<ScriptAnchor>,
) -> Extraction {
    let syntax = language.config().syntax;
    let scanner = Scanner::new(source, &syntax);
    let masked = scanner.mask(true, true);

    let mut anchors = script_anchors(&scanner, &masked);
    anchors.extend(extra(&scanner, &masked));
    anchors.sort_by_key(|a| a.start);

    let mut out = Extraction::default();
    let mut claimed = ClaimedSpans::default();

    for (i, anchor) in anchors.iter().enumerate() {
        if claimed.covers(&(anchor.start..anchor.head_end)) {
            continue;
        }
        let limit = anchors
            .get(i + 1)
            .map_or(source.len(), |next| next.start);
        let ctx = BuildContext {
            scanner: &scanner,
            masked: &masked,
            syntax: &syntax,
        };
        let issues_before = out.issues.len();
        let built = match &anchor.shape {
            Shape::Class { extends } => ctx.class(anchor, extends.as_deref(), &mut out),
            Shape::Function => ctx.function(anchor, &mut out).map(|e| (e, Vec::new())),
            Shape::Arrow { params, body_start } => ctx
                .arrow(anchor, params.clone(), *body_start, &mut out)
                .map(|e| (e, Vec::new())),
            Shape::Block => ctx.block(anchor, &mut out).map(|e| (e, Vec::new())),
            Shape::Statement => ctx.statement(anchor, limit, &mut out).map(|e| (e, Vec::new())),
        };
        match built {
            Some((entity, members)) => {
                claimed.claim(anchor.start..anchor.start + entity.body.len());
                out.entities.push(entity);
                out.entities.extend(members);
            }
            None if out.issues.len() > issues_before => {
                claimed.claim(anchor.start..scan::next_top_level_line(&masked, anchor.head_end));
            }
            None => {}
        }
    }
    out
}

fn script_anchors(scanner: &Scanner<'_>, masked: &str) -> Vec<ScriptAnchor> {
    let mut anchors = Vec::new();

    for caps in CLASS_RE.captures_iter(masked) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if preceded_by_dot(masked, whole.start()) {
            continue;
        }
        anchors.push(ScriptAnchor {
            kind: EntityKind::Class,
            shape: Shape::Class {
                extends: caps.get(2).map(|m| m.as_str().to_string()),
            },
            start: whole.start(),
            head_end: whole.end(),
            name: name.as_str().to_string(),
        });
    }

    for caps in FUNCTION_RE.captures_iter(masked) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        if preceded_by_dot(masked, whole.start()) {
            continue;
        }
        anchors.push(ScriptAnchor {
            kind: EntityKind::Function,
            shape: Shape::Function,
            start: whole.start(),
            head_end: whole.end(),
            name: name.as_str().to_string(),
        });
    }

    for caps in BINDING_RE.captures_iter(masked) {
        let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let Some((params, body_start)) = arrow_after(scanner, masked, whole.end()) else {
            continue;
        };
        anchors.push(ScriptAnchor {
            kind: EntityKind::Arrow,
            shape: Shape::Arrow { params, body_start },
            start: whole.start(),
            head_end: body_start,
            name: name.as_str().to_string(),
        });
    }

    anchors
}

fn preceded_by_dot(text: &str, pos: usize) -> bool {
    text[..pos].trim_end().ends_with('.')
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$'
}

fn skip_ws(bytes: &[u8], mut pos: usize) -> usize {
    while pos < bytes.len() && bytes[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

/// Recognizes `[async] (params) [: Type] =>` or `ident =>` starting at
/// `pos`. Returns the parameter range and the index just past `=>`.
pub(crate) fn arrow_after(
    scanner: &Scanner<'_>,
    masked: &str,
    pos: usize,
) -> Option<(Range<usize>, usize)> {
    let bytes = masked.as_bytes();
    let mut p = skip_ws(bytes, pos);
    if masked[p..].starts_with("async") && !bytes.get(p + 5).is_some_and(|b| is_ident_byte(*b)) {
        p = skip_ws(bytes, p + 5);
    }
    if bytes.get(p) == Some(&b'<') {
        p = skip_ws(bytes, p + masked[p..].find('>')? + 1);
    }

    let (params, after) = match *bytes.get(p)? {
        b'(' => {
            let close = scanner.matching(p)?;
            (p + 1..close - 1, close)
        }
        b if is_ident_byte(b) && !b.is_ascii_digit() => {
            let mut e = p;
            while e < bytes.len() && is_ident_byte(bytes[e]) {
                e += 1;
            }
            (p..e, e)
        }
        _ => return None,
    };

    let mut r = skip_ws(bytes, after);
    if bytes.get(r) == Some(&b':') {
        let stop = scanner.expression_end(r + 1).max(r + 1);
        r += masked[r..stop.min(masked.len())].find("=>")?;
    }
    if masked[r..].starts_with("=>") {
        Some((params, r + 2))
    } else {
        None
    }
}

struct BuildContext<'s> {
    scanner: &'s Scanner<'s>,
    masked: &'s str,
    syntax: &'s Syntax,
}

impl BuildContext<'_> {
    fn text(&self) -> &str {
        self.scanner.text()
    }

    fn comment(&self, pos: usize) -> Option<String> {
        scan::leading_comment(self.text(), pos, self.syntax)
    }

    fn class(
        &self,
        anchor: &ScriptAnchor,
        extends: Option<&str>,
        out: &mut Extraction,
    ) -> Option<(Entity, Vec<Entity>)> {
        let text = self.text();
        let Some(block) = self.scanner.block_end(anchor.head_end, b'{') else {
            out.push_issue(text, anchor.start, anchor.kind, Some(&anchor.name), "unterminated class body");
            return None;
        };
        let signature = match extends {
            Some(base) => format!("class {} extends {base}", anchor.name),
            None => format!("class {}", anchor.name),
        };
        let entity = EntityBuilder {
            text,
            span: anchor.start..block.end,
            inner: block.open + 1..block.end - 1,
        }
        .build(
            anchor.kind,
            anchor.name.clone(),
            anchor.name.clone(),
            Some(signature),
            self.comment(anchor.start),
        );
        let members = self.members(&anchor.name, block, out);
        Some((entity, members))
    }

    fn function(&self, anchor: &ScriptAnchor, out: &mut Extraction) -> Option<Entity> {
        let text = self.text();
        let open = anchor.head_end - 1;
        let Some(params_end) = self.scanner.matching(open) else {
            out.push_issue(text, anchor.start, anchor.kind, Some(&anchor.name), "unterminated parameter list");
            return None;
        };
        let Some(block) = self.scanner.block_end(params_end, b'{') else {
            if self.scanner.statement_end(params_end, b';').is_some() {
                debug!("Skipping body-less declaration of {}", anchor.name);
            } else {
                out.push_issue(text, anchor.start, anchor.kind, Some(&anchor.name), "unterminated function body");
            }
            return None;
        };
        let params = scan::squash_whitespace(&text[open + 1..params_end - 1]);
        Some(
            EntityBuilder {
                text,
                span: anchor.start..block.end,
                inner: block.open + 1..block.end - 1,
            }
            .build(
                anchor.kind,
                anchor.name.clone(),
                anchor.name.clone(),
                Some(format!("function {}({params})", anchor.name)),
                self.comment(anchor.start),
            ),
        )
    }

    fn arrow(
        &self,
        anchor: &ScriptAnchor,
        params: Range<usize>,
        body_start: usize,
        out: &mut Extraction,
    ) -> Option<Entity> {
        let text = self.text();
        let (end, inner) = self.arrow_body(body_start, anchor, out)?;
        let params = scan::squash_whitespace(&text[params]);
        Some(
            EntityBuilder {
                text,
                span: anchor.start..end,
                inner,
            }
            .build(
                anchor.kind,
                anchor.name.clone(),
                anchor.name.clone(),
                Some(format!("{}({params}) =>", anchor.name)),
                self.comment(anchor.start),
            ),
        )
    }

    /// Span end and executable range of an arrow body starting after `=>`.
    fn arrow_body(
        &self,
        body_start: usize,
        anchor: &ScriptAnchor,
        out: &mut Extraction,
    ) -> Option<(usize, Range<usize>)> {
        let text = self.text();
        let s = skip_ws(self.masked.as_bytes(), body_start);
        if self.masked.as_bytes().get(s) == Some(&b'{') {
            let Some(end) = self.scanner.matching(s) else {
                out.push_issue(text, anchor.start, anchor.kind, Some(&anchor.name), "unterminated arrow body");
                return None;
            };
            return Some((end, s + 1..end - 1));
        }
        let end = self.scanner.expression_end(s);
        let inner_end = if text[..end].ends_with(';') { end - 1 } else { end };
        Some((end, s..inner_end.max(s)))
    }

    fn block(&self, anchor: &ScriptAnchor, out: &mut Extraction) -> Option<Entity> {
        let text = self.text();
        let Some(block) = self.scanner.block_end(anchor.head_end, b'{') else {
            out.push_issue(text, anchor.start, anchor.kind, Some(&anchor.name), "unterminated body");
            return None;
        };
        let header = scan::squash_whitespace(text[anchor.start..block.open].trim());
        Some(
            EntityBuilder {
                text,
                span: anchor.start..block.end,
                inner: block.open + 1..block.end - 1,
            }
            .build(
                anchor.kind,
                anchor.name.clone(),
                anchor.name.clone(),
                Some(header),
                self.comment(anchor.start),
            ),
        )
    }

    fn statement(&self, anchor: &ScriptAnchor, limit: usize, out: &mut Extraction) -> Option<Entity> {
        let text = self.text();
        let end = match self
            .scanner
            .statement_end(anchor.head_end, b';')
            .filter(|end| *end <= limit)
        {
            Some(end) => end,
            None => {
                let s = skip_ws(self.masked.as_bytes(), anchor.head_end);
                let end = self.scanner.expression_end(s);
                if end <= s {
                    out.push_issue(text, anchor.start, anchor.kind, Some(&anchor.name), "missing statement terminator");
                    return None;
                }
                end
            }
        };
        let inner_end = if text[..end].ends_with(';') { end - 1 } else { end };
        let header = scan::squash_whitespace(text[anchor.start..anchor.head_end].trim());
        Some(
            EntityBuilder {
                text,
                span: anchor.start..end,
                inner: anchor.head_end..inner_end.max(anchor.head_end),
            }
            .build(
                anchor.kind,
                anchor.name.clone(),
                anchor.name.clone(),
                Some(header.trim_end_matches('=').trim_end().to_string()),
                self.comment(anchor.start),
            ),
        )
    }

    /// Methods and arrow-valued fields declared directly in a class body.
    fn members(&self, owner: &str, block: BlockSpan, out: &mut Extraction) -> Vec<Entity> {
        let text = self.text();
        let body = block.open + 1..block.end - 1;
        let view = self.scanner.top_level_view(body.clone());
        let mut members = Vec::new();
        let mut cursor = body.start;

        for caps in MEMBER_RE.captures_iter(&view) {
            let (Some(head), Some(name), Some(op)) = (caps.get(1), caps.get(2), caps.get(3)) else {
                continue;
            };
            let start = body.start + head.start();
            if start < cursor || CONTROL_WORDS.contains(&name.as_str()) {
                continue;
            }
            let name = name.as_str();
            let full_name = format!("{owner}.{name}");
            let op_pos = body.start + op.start();

            if op.as_str() == "(" {
                let Some(params_end) = self.scanner.matching(op_pos) else {
                    out.push_issue(text, start, EntityKind::Method, Some(&full_name), "unterminated parameter list");
                    break;
                };
                let Some(method) = self
                    .scanner
                    .block_end(params_end, b'{')
                    .filter(|m| m.end <= body.end)
                else {
                    cursor = params_end;
                    continue;
                };
                let params = scan::squash_whitespace(&text[op_pos + 1..params_end - 1]);
                let mut entity = EntityBuilder {
                    text,
                    span: start..method.end,
                    inner: method.open + 1..method.end - 1,
                }
                .build(
                    EntityKind::Method,
                    full_name.clone(),
                    name.to_string(),
                    Some(format!("{full_name}({params})")),
                    self.comment(start),
                );
                entity.parent = Some(owner.to_string());
                members.push(entity);
                cursor = method.end;
                continue;
            }

            match arrow_after(self.scanner, self.masked, op_pos + 1) {
                Some((params, body_start)) => {
                    let anchor = ScriptAnchor {
                        kind: EntityKind::Method,
                        shape: Shape::Arrow {
                            params: params.clone(),
                            body_start,
                        },
                        start,
                        head_end: body_start,
                        name: full_name.clone(),
                    };
                    let Some((end, inner)) = self.arrow_body(body_start, &anchor, out) else {
                        break;
                    };
                    let params = scan::squash_whitespace(&text[params]);
                    let mut entity = EntityBuilder {
                        text,
                        span: start..end,
                        inner,
                    }
                    .build(
                        EntityKind::Method,
                        full_name.clone(),
                        name.to_string(),
                        Some(format!("{full_name}({params}) =>")),
                        self.comment(start),
                    );
                    entity.parent = Some(owner.to_string());
                    members.push(entity);
                    cursor = end;
                }
                None => cursor = self.scanner.expression_end(op_pos + 1),
            }
        }
        members
    }
}
