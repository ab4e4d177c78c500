use super::code_parser::{EntityExtractor, Extraction};
use super::javascript::{ScriptAnchor, Shape, extract_script};
use super::languages::Language;
use super::scan::Scanner;
use crate::db::models::EntityKind;
use regex::Regex;
use std::sync::LazyLock;

static INTERFACE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\bexport\s+(?:default\s+)?)?(?:\bdeclare\s+)?\binterface\s+([A-Za-z_$][\w$]*)")
        .unwrap()
});

static TYPE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\bexport\s+)?(?:\bdeclare\s+)?\btype\s+([A-Za-z_$][\w$]*)\s*(?:<[^=;]*?>)?\s*=")
        .unwrap()
});

static ENUM_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:\bexport\s+)?(?:\bdeclare\s+)?(?:\bconst\s+)?\benum\s+([A-Za-z_$][\w$]*)")
        .unwrap()
});

/// JavaScript constructs plus interfaces, type aliases and enums.
pub struct TypeScriptExtractor;

impl EntityExtractor for TypeScriptExtractor {
    fn language(&self) -> Language {
        Language::TypeScript
    }

    fn extract(&self, source: &str) -> Extraction {
        extract_script(source, Language::TypeScript, type_anchors)
    }
}

fn type_anchors(_scanner: &Scanner<'_>, masked: &str) -> Vec<ScriptAnchor> {
    let patterns: [(&Regex, EntityKind, Shape); 3] = [
        (&INTERFACE_RE, EntityKind::Interface, Shape::Block),
        (&TYPE_RE, EntityKind::Type, Shape::Statement),
        (&ENUM_RE, EntityKind::Enum, Shape::Block),
    ];

    let mut anchors = Vec::new();
    for (re, kind, shape) in patterns {
        for caps in re.captures_iter(masked) {
            let (Some(whole), Some(name)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            if masked[..whole.start()].trim_end().ends_with('.') {
                continue;
            }
            anchors.push(ScriptAnchor {
                kind,
                shape: shape.clone(),
                start: whole.start(),
                head_end: whole.end(),
                name: name.as_str().to_string(),
            });
        }
    }
    anchors
}
