use super::code_parser::{Entity, EntityBuilder, EntityExtractor, Extraction, header_signature};
use super::languages::Language;
use super::scan::{self, BlockSpan, ClaimedSpans, Scanner, Syntax};
use crate::db::models::EntityKind;
use regex::Regex;
use std::sync::LazyLock;
use tracing::debug;

static TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(?:\b(?:abstract|final|readonly)\s+)*\b(class|interface|trait|enum)\s+([A-Za-z_]\w*)")
        .unwrap()
});

static FUNCTION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\bfunction\s+&?\s*([A-Za-z_]\w*)\s*\(").unwrap());

static METHOD_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"(?im)(?:^|[;}\s])((?:(?:public|protected|private|static|abstract|final)\s+)*function\s+&?\s*([A-Za-z_]\w*))\s*\(",
    )
    .unwrap()
});

/// PHP interfaces, traits, classes, enums and functions.
///
/// Methods are taken from type bodies only; magic methods other than
/// `__construct` are skipped.
pub struct PhpExtractor;

impl EntityExtractor for PhpExtractor {
    fn language(&self) -> Language {
        Language::Php
    }

    fn extract(&self, source: &str) -> Extraction {
        let syntax = Language::Php.config().syntax;
        let scanner = Scanner::new(source, &syntax);
        let masked = scanner.mask(true, true);

        let mut anchors: Vec<(usize, usize, EntityKind, String)> = Vec::new();
        for caps in TYPE_RE.captures_iter(&masked) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(2)) else {
                continue;
            };
            // `Foo::class` and `$x->class`
            let before = masked[..whole.start()].trim_end();
            if before.ends_with("::") || before.ends_with("->") || before.ends_with('$') {
                continue;
            }
            let kind = match caps[1].to_ascii_lowercase().as_str() {
                "interface" => EntityKind::Interface,
                "trait" => EntityKind::Trait,
                "enum" => EntityKind::Enum,
                _ => EntityKind::Class,
            };
            anchors.push((whole.start(), whole.end(), kind, name.as_str().to_string()));
        }
        for caps in FUNCTION_RE.captures_iter(&masked) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            anchors.push((whole.start(), whole.end(), EntityKind::Function, name.as_str().to_string()));
        }
        anchors.sort_by_key(|a| a.0);

        let mut out = Extraction::default();
        let mut claimed = ClaimedSpans::default();

        for (start, head_end, kind, name) in anchors {
            if claimed.covers(&(start..head_end)) {
                continue;
            }
            if kind == EntityKind::Function {
                match function(&scanner, &syntax, start, head_end, &name, &mut out) {
                    Some(entity) => {
                        claimed.claim(start..start + entity.body.len());
                        out.entities.push(entity);
                    }
                    None => claimed.claim(start..scan::next_top_level_line(&masked, head_end)),
                }
                continue;
            }

            let Some(block) = scanner.block_end(head_end, b'{') else {
                out.push_issue(source, start, kind, Some(&name), "unterminated body");
                claimed.claim(start..scan::next_top_level_line(&masked, head_end));
                continue;
            };
            let entity = EntityBuilder {
                text: source,
                span: start..block.end,
                inner: block.open + 1..block.end - 1,
            }
            .build(
                kind,
                name.clone(),
                name.clone(),
                Some(header_signature(source, start, block.open)),
                scan::leading_comment(source, start, &syntax),
            );
            claimed.claim(start..block.end);
            out.entities.push(entity);
            let members = methods(&scanner, &syntax, &name, block, &mut out);
            out.entities.extend(members);
        }
        out
    }
}

fn function(
    scanner: &Scanner<'_>,
    syntax: &Syntax,
    start: usize,
    head_end: usize,
    name: &str,
    out: &mut Extraction,
) -> Option<Entity> {
    let text = scanner.text();
    let open = head_end - 1;
    let Some(params_end) = scanner.matching(open) else {
        out.push_issue(text, start, EntityKind::Function, Some(name), "unterminated parameter list");
        return None;
    };
    let Some(block) = scanner.block_end(params_end, b'{') else {
        out.push_issue(text, start, EntityKind::Function, Some(name), "unterminated function body");
        return None;
    };
    let params = scan::squash_whitespace(&text[open + 1..params_end - 1]);
    Some(
        EntityBuilder {
            text,
            span: start..block.end,
            inner: block.open + 1..block.end - 1,
        }
        .build(
            EntityKind::Function,
            name.to_string(),
            name.to_string(),
            Some(format!("function {name}({params})")),
            scan::leading_comment(text, start, syntax),
        ),
    )
}

fn methods(
    scanner: &Scanner<'_>,
    syntax: &Syntax,
    owner: &str,
    block: BlockSpan,
    out: &mut Extraction,
) -> Vec<Entity> {
    let text = scanner.text();
    let body = block.open + 1..block.end - 1;
    let view = scanner.top_level_view(body.clone());
    let mut members = Vec::new();
    let mut cursor = body.start;

    for caps in METHOD_RE.captures_iter(&view) {
        let (Some(head), Some(name)) = (caps.get(1), caps.get(2)) else {
            continue;
        };
        let start = body.start + head.start();
        if start < cursor {
            continue;
        }
        let name = name.as_str();
        let full_name = format!("{owner}.{name}");
        let Some(open) = caps.get(0).map(|m| body.start + m.end() - 1) else {
            continue;
        };
        let Some(params_end) = scanner.matching(open) else {
            out.push_issue(text, start, EntityKind::Method, Some(&full_name), "unterminated parameter list");
            break;
        };
        let Some(method) = scanner
            .block_end(params_end, b'{')
            .filter(|m| m.end <= body.end)
        else {
            // abstract or interface method
            cursor = params_end;
            continue;
        };
        cursor = method.end;
        if name.starts_with("__") && name != "__construct" {
            debug!("Skipping magic method {full_name}");
            continue;
        }

        let params = scan::squash_whitespace(&text[open + 1..params_end - 1]);
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
            scan::leading_comment(text, start, syntax),
        );
        entity.parent = Some(owner.to_string());
        members.push(entity);
    }
    members
}

#[cfg(test)]
mod tests {
    use super::*;

    fn extract(src: &str) -> Extraction {
        PhpExtractor.extract(src)
    }

    #[test]
    fn test_class_methods_and_magic() {
        let src = r#"<?php
namespace App\Services;

use App\Models\Skill;

interface Rates {
    public function rate(int $level): float;
}

/**
 * Skill catalogue.
 */
final class SkillService extends BaseService implements Rates
{
    private $repo;

    public function __construct(SkillRepository $repo)
    {
        $this->repo = $repo;
    }

    public function __toString(): string
    {
        return 'SkillService {';
    }

    # Level multiplier.
    public static function rate(int $level): float
    {
        return $level * 1.5;
    }

    protected function load(): array
    {
        return array_map(function ($s) { return new Skill($s); }, $this->repo->all());
    }
}

function helper($x) { return $x; }
"#;
        let out = extract(src);
        assert!(out.issues.is_empty());
        let names: Vec<&str> = out.entities.iter().map(|e| e.full_name.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "Rates",
                "SkillService",
                "SkillService.__construct",
                "SkillService.rate",
                "SkillService.load",
                "helper"
            ]
        );

        assert_eq!(out.entities[0].kind, EntityKind::Interface);
        let class = &out.entities[1];
        assert_eq!(class.kind, EntityKind::Class);
        assert_eq!(class.comment.as_deref(), Some("Skill catalogue."));
        assert_eq!(
            class.signature.as_deref(),
            Some("final class SkillService extends BaseService implements Rates")
        );

        let rate = &out.entities[3];
        assert_eq!(rate.kind, EntityKind::Method);
        assert_eq!(rate.parent.as_deref(), Some("SkillService"));
        assert_eq!(rate.comment.as_deref(), Some("Level multiplier."));
        assert_eq!(rate.signature.as_deref(), Some("SkillService.rate(int $level)"));
        assert!(rate.body.starts_with("public static function rate"));
    }

    #[test]
    fn test_trait_and_class_constant_reference() {
        let src = "<?php\ntrait Loggable {\n    public function log($m) { echo $m; }\n}\n$name = Foo::class;\n";
        let out = extract(src);
        let names: Vec<&str> = out.entities.iter().map(|e| e.full_name.as_str()).collect();
        assert_eq!(names, vec!["Loggable", "Loggable.log"]);
        assert_eq!(out.entities[0].kind, EntityKind::Trait);
    }

    #[test]
    fn test_extraction_resumes_after_unterminated_function() {
        let src = "<?php\nfunction broken($a {\n    return $a;\n}\nfunction ok() { return 1; }\nclass Later {\n    public function m() {}\n}\n";
        let out = extract(src);
        let names: Vec<&str> = out.entities.iter().map(|e| e.full_name.as_str()).collect();
        assert_eq!(names, vec!["ok", "Later", "Later.m"]);
        assert_eq!(out.issues.len(), 1);
        assert_eq!(out.issues[0].name.as_deref(), Some("broken"));
    }

    #[test]
    fn test_unterminated_class() {
        let out = extract("<?php\nclass Broken {\n    public function a() {\n");
        assert!(out.entities.is_empty());
        assert_eq!(out.issues.len(), 1);
        assert_eq!(out.issues[0].kind, EntityKind::Class);
    }
}
