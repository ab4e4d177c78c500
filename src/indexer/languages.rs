use super::scan::Syntax;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Sql,
    JavaScript,
    TypeScript,
    Php,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Sql => "sql",
            Language::JavaScript => "javascript",
            Language::TypeScript => "typescript",
            Language::Php => "php",
        }
    }

    pub fn all() -> [Language; 4] {
        [
            Language::Sql,
            Language::JavaScript,
            Language::TypeScript,
            Language::Php,
        ]
    }

    pub fn config(&self) -> LanguageConfig {
        match self {
            Language::Sql => sql_config(),
            Language::JavaScript => javascript_config(),
            Language::TypeScript => typescript_config(),
            Language::Php => php_config(),
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LanguageConfig::get_by_name(s)
            .map(|c| c.language)
            .ok_or_else(|| format!("unsupported language: {s}"))
    }
}

pub struct LanguageConfig {
    pub name: &'static str,
    pub language: Language,
    pub extensions: &'static [&'static str],
    pub syntax: Syntax,
    /// Identifiers never reported as call targets or tables.
    pub builtins: &'static [&'static str],
}

impl LanguageConfig {
    pub fn get_all() -> Vec<LanguageConfig> {
        vec![
            sql_config(),
            javascript_config(),
            typescript_config(),
            php_config(),
        ]
    }

    pub fn get_by_extension(ext: &str) -> Option<LanguageConfig> {
        let ext = ext.to_ascii_lowercase();
        Self::get_all()
            .into_iter()
            .find(|c| c.extensions.contains(&ext.as_str()))
    }

    pub fn get_by_name(name: &str) -> Option<LanguageConfig> {
        let name = name.to_ascii_lowercase();
        Self::get_all().into_iter().find(|c| {
            c.name == name
                || match c.language {
                    Language::JavaScript => name == "js",
                    Language::TypeScript => name == "ts",
                    _ => false,
                }
        })
    }
}

/// Per-language denylists handed to the dependency analyzer.
///
/// Lookups are case-insensitive; entries are stored lowercased.
#[derive(Debug, Clone, Default)]
pub struct Denylists {
    words: HashMap<Language, HashSet<String>>,
}

impl Denylists {
    /// Built-in tables for every supported language.
    pub fn defaults() -> Self {
        let mut lists = Self::default();
        for config in LanguageConfig::get_all() {
            lists.extend(config.language, config.builtins.iter().copied());
        }
        lists
    }

    /// Defaults plus user-supplied words keyed by language name.
    pub fn with_extras(extras: &BTreeMap<String, Vec<String>>) -> Self {
        let mut lists = Self::defaults();
        for (name, words) in extras {
            if let Ok(lang) = name.parse::<Language>() {
                lists.extend(lang, words.iter().map(String::as_str));
            }
        }
        lists
    }

    pub fn extend<'a>(&mut self, lang: Language, words: impl IntoIterator<Item = &'a str>) {
        let set = self.words.entry(lang).or_default();
        for w in words {
            set.insert(w.to_ascii_lowercase());
        }
    }

    pub fn contains(&self, lang: Language, word: &str) -> bool {
        self.words
            .get(&lang)
            .is_some_and(|set| set.contains(&word.to_ascii_lowercase()))
    }
}

fn sql_config() -> LanguageConfig {
    LanguageConfig {
        name: "sql",
        language: Language::Sql,
        extensions: &["sql", "psql", "pgsql"],
        syntax: Syntax {
            line_comments: &["--"],
            block_comment: Some(("/*", "*/")),
            quotes: b"'\"",
            backslash_escapes: false,
            doubled_quote_escapes: true,
            dollar_quotes: true,
        },
        builtins: SQL_BUILTINS,
    }
}

fn javascript_config() -> LanguageConfig {
    LanguageConfig {
        name: "javascript",
        language: Language::JavaScript,
        extensions: &["js", "jsx", "mjs", "cjs"],
        syntax: C_LIKE_SYNTAX,
        builtins: JS_BUILTINS,
    }
}

fn typescript_config() -> LanguageConfig {
    LanguageConfig {
        name: "typescript",
        language: Language::TypeScript,
        extensions: &["ts", "tsx", "mts", "cts"],
        syntax: C_LIKE_SYNTAX,
        builtins: TS_BUILTINS,
    }
}

fn php_config() -> LanguageConfig {
    LanguageConfig {
        name: "php",
        language: Language::Php,
        extensions: &["php", "phtml", "inc"],
        syntax: Syntax {
            line_comments: &["//", "#"],
            block_comment: Some(("/*", "*/")),
            quotes: b"'\"",
            backslash_escapes: true,
            doubled_quote_escapes: false,
            dollar_quotes: false,
        },
        builtins: PHP_BUILTINS,
    }
}

const C_LIKE_SYNTAX: Syntax = Syntax {
    line_comments: &["//"],
    block_comment: Some(("/*", "*/")),
    quotes: b"'\"`",
    backslash_escapes: true,
    doubled_quote_escapes: false,
    dollar_quotes: false,
};

const SQL_BUILTINS: &[&str] = &[
    // keywords that can precede `(`
    "select", "from", "where", "join", "on", "and", "or", "not", "in", "exists", "as", "into",
    "values", "table", "returns", "return", "returning", "using", "over", "filter", "within",
    "partition", "by", "when", "then", "else", "case", "if", "elsif", "loop", "while", "for",
    "foreach", "perform", "execute", "raise", "declare", "begin", "end", "set", "update",
    "insert", "delete", "with", "recursive", "union", "all", "any", "some", "array", "row",
    "lateral", "unnest", "generate_series", "interval", "distinct", "limit", "offset", "group",
    "order", "having", "window", "cast", "extract", "position", "substring", "overlay", "trim",
    "exception", "function", "procedure", "language", "setof", "default", "check", "references",
    "primary", "key", "unique", "constraint", "index", "conflict", "do", "nothing", "excluded",
    "exclude", "strict", "immutable", "stable", "volatile", "security", "definer", "invoker",
    // aggregate and scalar functions
    "count", "sum", "avg", "min", "max", "coalesce", "nullif", "greatest", "least", "now",
    "format", "concat", "concat_ws", "lower", "upper", "length", "replace", "split_part",
    "to_char", "to_date", "to_timestamp", "to_number", "date_trunc", "date_part", "age", "abs",
    "round", "ceil", "floor", "random", "string_agg", "array_agg", "array_length", "array_to_string",
    "string_to_array", "json_build_object", "jsonb_build_object", "json_agg", "jsonb_agg",
    "json_object_agg", "jsonb_object_agg", "row_to_json", "to_json", "to_jsonb",
    "jsonb_set", "jsonb_array_elements", "json_array_elements", "jsonb_each", "json_each",
    "jsonb_array_length", "json_array_length", "jsonb_strip_nulls", "jsonb_typeof",
    "bool_and", "bool_or", "regexp_replace", "regexp_matches", "left", "right", "md5",
    "gen_random_uuid", "uuid_generate_v4", "current_date", "current_timestamp", "clock_timestamp",
    "nextval", "currval", "setval", "found", "notice", "quote_ident", "quote_literal", "quote_nullable",
    // types
    "varchar", "char", "character", "numeric", "decimal", "int", "integer", "bigint", "smallint",
    "text", "boolean", "bool", "date", "time", "timestamp", "timestamptz", "json", "jsonb",
    "uuid", "bytea", "real", "double", "precision", "float", "serial", "bigserial", "record",
    "void", "trigger",
];

const JS_BUILTINS: &[&str] = &[
    // control flow and declarations
    "if", "for", "while", "switch", "catch", "function", "return", "typeof", "instanceof",
    "new", "delete", "void", "do", "else", "try", "finally", "throw", "await", "async", "yield",
    "super", "this", "import", "export", "class", "extends", "constructor", "with",
    // globals
    "console", "log", "warn", "error", "info", "debug", "trace", "require", "parseInt",
    "parseFloat", "isNaN", "isFinite", "setTimeout", "setInterval", "clearTimeout",
    "clearInterval", "setImmediate", "encodeURIComponent", "decodeURIComponent", "encodeURI",
    "decodeURI", "fetch", "alert", "Symbol", "BigInt", "Boolean", "Number", "String", "Object",
    "Array", "Date", "Promise", "Error", "TypeError", "RegExp", "Map", "Set", "WeakMap",
    "WeakSet", "JSON", "Math", "Reflect", "Proxy",
    // common methods
    "push", "pop", "shift", "unshift", "slice", "splice", "concat", "join", "split", "map",
    "filter", "reduce", "forEach", "find", "findIndex", "some", "every", "includes", "indexOf",
    "lastIndexOf", "sort", "reverse", "flat", "flatMap", "fill", "keys", "values", "entries",
    "assign", "freeze", "stringify", "parse", "toString", "toFixed", "valueOf", "trim",
    "trimStart", "trimEnd", "replace", "replaceAll", "match", "matchAll", "test", "exec",
    "startsWith", "endsWith", "padStart", "padEnd", "toLowerCase", "toUpperCase", "charAt",
    "charCodeAt", "substring", "substr", "then", "catch", "finally", "resolve", "reject",
    "all", "allSettled", "race", "bind", "call", "apply", "get", "set", "has", "add", "clear",
    "floor", "ceil", "round", "abs", "max", "min", "random", "now", "getTime", "toISOString",
    "isArray", "from", "of", "hasOwnProperty",
];

const TS_BUILTINS: &[&str] = &[
    "if", "for", "while", "switch", "catch", "function", "return", "typeof", "instanceof",
    "new", "delete", "void", "do", "else", "try", "finally", "throw", "await", "async", "yield",
    "super", "this", "import", "export", "class", "extends", "implements", "constructor",
    "keyof", "as", "satisfies", "infer", "readonly", "declare", "namespace", "module",
    "console", "log", "warn", "error", "info", "debug", "require", "parseInt", "parseFloat",
    "isNaN", "setTimeout", "setInterval", "clearTimeout", "clearInterval", "fetch", "Symbol",
    "Boolean", "Number", "String", "Object", "Array", "Date", "Promise", "Error", "RegExp",
    "Map", "Set", "JSON", "Math", "Record", "Partial", "Required", "Readonly", "Pick", "Omit",
    "Exclude", "Extract", "NonNullable", "ReturnType", "Parameters", "Awaited",
    "push", "pop", "shift", "unshift", "slice", "splice", "concat", "join", "split", "map",
    "filter", "reduce", "forEach", "find", "findIndex", "some", "every", "includes", "indexOf",
    "sort", "reverse", "flat", "flatMap", "keys", "values", "entries", "assign", "freeze",
    "stringify", "parse", "toString", "toFixed", "trim", "replace", "match", "test", "exec",
    "startsWith", "endsWith", "toLowerCase", "toUpperCase", "substring", "then", "resolve",
    "reject", "all", "allSettled", "race", "bind", "call", "apply", "get", "set", "has", "add",
    "clear", "floor", "ceil", "round", "abs", "max", "min", "random", "now", "isArray", "from",
    "of",
];

const PHP_BUILTINS: &[&str] = &[
    "if", "elseif", "for", "foreach", "while", "switch", "match", "catch", "function", "fn",
    "return", "array", "list", "isset", "unset", "empty", "echo", "print", "die", "exit",
    "new", "clone", "include", "include_once", "require", "require_once", "use", "declare",
    "self", "static", "parent", "and", "or", "not",
    "count", "sizeof", "strlen", "strtolower", "strtoupper", "str_replace", "substr",
    "strpos", "sprintf", "printf", "implode", "explode", "trim", "ltrim", "rtrim",
    "in_array", "array_map", "array_filter", "array_merge", "array_keys", "array_values",
    "array_key_exists", "array_push", "array_pop", "array_shift", "array_slice", "array_search",
    "is_array", "is_null", "is_string", "is_int", "is_numeric", "intval", "floatval", "strval",
    "json_encode", "json_decode", "var_dump", "print_r", "date", "time", "strtotime",
    "preg_match", "preg_replace", "preg_split", "htmlspecialchars", "compact", "extract",
    "func_get_args", "call_user_func", "call_user_func_array", "method_exists", "property_exists",
    "class_exists", "function_exists", "get_class", "sleep", "min", "max", "abs", "round",
    "floor", "ceil", "rand", "mt_rand", "uniqid", "md5", "sha1",
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lookup_by_extension_and_name() {
        assert_eq!(
            LanguageConfig::get_by_extension("SQL").map(|c| c.language),
            Some(Language::Sql)
        );
        assert_eq!(
            LanguageConfig::get_by_extension("tsx").map(|c| c.language),
            Some(Language::TypeScript)
        );
        assert!(LanguageConfig::get_by_extension("md").is_none());
        assert_eq!("js".parse::<Language>(), Ok(Language::JavaScript));
        assert_eq!("php".parse::<Language>(), Ok(Language::Php));
        assert!("cobol".parse::<Language>().is_err());
    }

    #[test]
    fn test_denylist_extras() {
        let mut extras = BTreeMap::new();
        extras.insert("sql".to_string(), vec!["audit_log".to_string()]);
        extras.insert("unknown".to_string(), vec!["x".to_string()]);

        let lists = Denylists::with_extras(&extras);
        assert!(lists.contains(Language::Sql, "COALESCE"));
        assert!(lists.contains(Language::Sql, "audit_log"));
        assert!(!lists.contains(Language::JavaScript, "audit_log"));
        assert!(lists.contains(Language::JavaScript, "forEach"));
    }
}
