//! Quote- and comment-aware scanning primitives shared by every extractor.
//!
//! All functions take an explicit byte position and return the position to
//! continue from; nothing here keeps a cursor between calls. Every delimiter
//! the scanner reacts to is ASCII, so returned offsets are always valid char
//! boundaries of the input.

use std::ops::Range;

/// Lexical conventions of one language, as far as span scanning cares.
#[derive(Debug, Clone, Copy)]
pub struct Syntax {
    pub line_comments: &'static [&'static str],
    pub block_comment: Option<(&'static str, &'static str)>,
    pub quotes: &'static [u8],
    pub backslash_escapes: bool,
    /// `''` inside a quoted region is an escaped quote (SQL).
    pub doubled_quote_escapes: bool,
    /// `$tag$ … $tag$` regions with arbitrary tags (PostgreSQL).
    pub dollar_quotes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    LineComment,
    BlockComment,
    Quoted,
    DollarQuoted,
}

impl Region {
    pub fn is_comment(&self) -> bool {
        matches!(self, Region::LineComment | Region::BlockComment)
    }
}

/// Byte range of a bracketed block: `open` is the opening bracket, `end`
/// is one past the matching close.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSpan {
    pub open: usize,
    pub end: usize,
}

pub struct Scanner<'a> {
    text: &'a str,
    bytes: &'a [u8],
    syntax: &'a Syntax,
}

impl<'a> Scanner<'a> {
    pub fn new(text: &'a str, syntax: &'a Syntax) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            syntax,
        }
    }

    pub fn text(&self) -> &'a str {
        self.text
    }

    /// If an opaque region (comment, quoted or dollar-quoted text) starts at
    /// `pos`, returns its kind and the index just past it. Unterminated
    /// regions run to the end of the text.
    pub fn opaque_at(&self, pos: usize) -> Option<(Region, usize)> {
        let len = self.bytes.len();
        if pos >= len {
            return None;
        }
        let rest = &self.bytes[pos..];

        for marker in self.syntax.line_comments {
            if rest.starts_with(marker.as_bytes()) {
                // PHP 8 attributes share the `#` marker
                if *marker == "#" && rest.get(1) == Some(&b'[') {
                    continue;
                }
                let end = self.text[pos..].find('\n').map_or(len, |i| pos + i);
                return Some((Region::LineComment, end));
            }
        }

        if let Some((open, close)) = self.syntax.block_comment {
            if rest.starts_with(open.as_bytes()) {
                let body = pos + open.len();
                let end = self.text[body..]
                    .find(close)
                    .map_or(len, |i| body + i + close.len());
                return Some((Region::BlockComment, end));
            }
        }

        let c = rest[0];
        if self.syntax.quotes.contains(&c) {
            return Some((Region::Quoted, self.quoted_end(pos, c)));
        }

        if c == b'$' && self.syntax.dollar_quotes {
            if let Some(tag_end) = self.dollar_tag_end(pos) {
                let tag = &self.text[pos..tag_end];
                let end = self.text[tag_end..]
                    .find(tag)
                    .map_or(len, |i| tag_end + i + tag.len());
                return Some((Region::DollarQuoted, end));
            }
        }

        None
    }

    fn quoted_end(&self, pos: usize, quote: u8) -> usize {
        let len = self.bytes.len();
        let mut i = pos + 1;
        while i < len {
            let c = self.bytes[i];
            if c == b'\\' && self.syntax.backslash_escapes {
                i += 2;
                continue;
            }
            if c == quote {
                if self.syntax.doubled_quote_escapes && self.bytes.get(i + 1) == Some(&quote) {
                    i += 2;
                    continue;
                }
                return i + 1;
            }
            i += 1;
        }
        len
    }

    /// `$$` or `$tag$` starting at `pos`; returns the index past the tag.
    /// Positional parameters such as `$1` are not tags.
    fn dollar_tag_end(&self, pos: usize) -> Option<usize> {
        let mut j = pos + 1;
        while j < self.bytes.len() && (self.bytes[j].is_ascii_alphanumeric() || self.bytes[j] == b'_')
        {
            j += 1;
        }
        if j >= self.bytes.len() || self.bytes[j] != b'$' {
            return None;
        }
        if j > pos + 1 && self.bytes[pos + 1].is_ascii_digit() {
            return None;
        }
        Some(j + 1)
    }

    /// Skips whitespace and comments starting at `pos`.
    pub fn skip_trivia(&self, mut pos: usize) -> usize {
        loop {
            while pos < self.bytes.len() && self.bytes[pos].is_ascii_whitespace() {
                pos += 1;
            }
            match self.opaque_at(pos) {
                Some((region, end)) if region.is_comment() => pos = end,
                _ => return pos,
            }
        }
    }

    /// Index one past the bracket matching the one at `open`.
    pub fn matching(&self, open: usize) -> Option<usize> {
        let (o, c) = match self.bytes.get(open)? {
            b'(' => (b'(', b')'),
            b'[' => (b'[', b']'),
            b'{' => (b'{', b'}'),
            _ => return None,
        };
        let mut depth = 0usize;
        let mut i = open;
        while i < self.bytes.len() {
            if let Some((_, end)) = self.opaque_at(i) {
                i = end;
                continue;
            }
            let b = self.bytes[i];
            if b == o {
                depth += 1;
            } else if b == c {
                depth -= 1;
                if depth == 0 {
                    return Some(i + 1);
                }
            }
            i += 1;
        }
        None
    }

    /// Finds the first `open` bracket at bracket depth zero after `from`
    /// and returns the span up to its matching close.
    ///
    /// A top-level `;` (or an unbalanced closing bracket) seen before the
    /// block opens means the construct has no body and yields `None`.
    pub fn block_end(&self, from: usize, open: u8) -> Option<BlockSpan> {
        let mut depth = 0usize;
        let mut i = from;
        while i < self.bytes.len() {
            if let Some((_, end)) = self.opaque_at(i) {
                i = end;
                continue;
            }
            let b = self.bytes[i];
            if b == open && depth == 0 {
                let end = self.matching(i)?;
                return Some(BlockSpan { open: i, end });
            }
            match b {
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => {
                    if depth == 0 {
                        return None;
                    }
                    depth -= 1;
                }
                b';' if depth == 0 => return None,
                _ => {}
            }
            i += 1;
        }
        None
    }

    /// Index one past the first `terminator` at bracket depth zero.
    pub fn statement_end(&self, from: usize, terminator: u8) -> Option<usize> {
        let mut depth = 0usize;
        let mut i = from;
        while i < self.bytes.len() {
            if let Some((_, end)) = self.opaque_at(i) {
                i = end;
                continue;
            }
            let b = self.bytes[i];
            if b == terminator && depth == 0 {
                return Some(i + 1);
            }
            match b {
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => {
                    if depth == 0 {
                        return None;
                    }
                    depth -= 1;
                }
                _ => {}
            }
            i += 1;
        }
        None
    }

    /// End of an expression starting at `from`: a top-level `;` (included),
    /// a top-level newline, an unbalanced closing bracket, or end of text.
    pub fn expression_end(&self, from: usize) -> usize {
        let mut depth = 0usize;
        let mut i = from;
        while i < self.bytes.len() {
            if let Some((_, end)) = self.opaque_at(i) {
                i = end;
                continue;
            }
            match self.bytes[i] {
                b';' if depth == 0 => return i + 1,
                b'\n' if depth == 0 => return i,
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => {
                    if depth == 0 {
                        return i;
                    }
                    depth -= 1;
                }
                _ => {}
            }
            i += 1;
        }
        self.bytes.len()
    }

    /// Splits `range` on `sep` at bracket depth zero, skipping opaque
    /// regions. Empty segments are kept; callers trim.
    pub fn split_top_level(&self, range: Range<usize>, sep: u8) -> Vec<Range<usize>> {
        let mut parts = Vec::new();
        let mut depth = 0usize;
        let mut start = range.start;
        let mut i = range.start;
        let end = range.end.min(self.bytes.len());
        while i < end {
            if let Some((_, stop)) = self.opaque_at(i) {
                i = stop.min(end);
                continue;
            }
            match self.bytes[i] {
                b'(' | b'[' | b'{' => depth += 1,
                b')' | b']' | b'}' => depth = depth.saturating_sub(1),
                b if b == sep && depth == 0 => {
                    parts.push(start..i);
                    start = i + 1;
                }
                _ => {}
            }
            i += 1;
        }
        parts.push(start..end);
        parts
    }

    /// Copy of `range` in which opaque regions and everything nested inside
    /// a bracket pair are blanked. Brackets at depth zero stay visible, so
    /// member heads of a class body can be matched without seeing bodies.
    /// Offsets are relative to `range.start`.
    pub fn top_level_view(&self, range: Range<usize>) -> String {
        let end = range.end.min(self.bytes.len());
        let start = range.start.min(end);
        let mut out = self.bytes[start..end].to_vec();
        let blank = |out: &mut Vec<u8>, from: usize, to: usize| {
            for b in &mut out[from - start..to - start] {
                if *b != b'\n' {
                    *b = b' ';
                }
            }
        };

        let mut depth = 0usize;
        let mut i = start;
        while i < end {
            if let Some((_, stop)) = self.opaque_at(i) {
                let stop = stop.min(end);
                blank(&mut out, i, stop);
                i = stop;
                continue;
            }
            match self.bytes[i] {
                b'(' | b'[' | b'{' => {
                    if depth > 0 {
                        blank(&mut out, i, i + 1);
                    }
                    depth += 1;
                }
                b')' | b']' | b'}' => {
                    depth = depth.saturating_sub(1);
                    if depth > 0 {
                        blank(&mut out, i, i + 1);
                    }
                }
                _ if depth > 0 => blank(&mut out, i, i + 1),
                _ => {}
            }
            i += 1;
        }
        String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
    }

    /// Copy of the text with the selected regions replaced by spaces.
    /// Newlines are kept so byte offsets and line numbers are preserved.
    pub fn mask(&self, comments: bool, strings: bool) -> String {
        self.mask_with(|region, _| if region.is_comment() { comments } else { strings })
    }

    /// Like [`Scanner::mask`], choosing per region; `opener` is the first
    /// byte of the region (the quote character for quoted text).
    pub fn mask_with(&self, blank: impl Fn(Region, u8) -> bool) -> String {
        let mut out = self.bytes.to_vec();
        let mut i = 0;
        while i < self.bytes.len() {
            match self.opaque_at(i) {
                Some((region, end)) => {
                    if blank(region, self.bytes[i]) {
                        for b in &mut out[i..end] {
                            if *b != b'\n' {
                                *b = b' ';
                            }
                        }
                    }
                    i = end;
                }
                None => i += 1,
            }
        }
        String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
    }
}

/// 1-based line number of byte offset `pos`.
pub fn line_of(text: &str, pos: usize) -> usize {
    text.as_bytes()[..pos.min(text.len())]
        .iter()
        .filter(|&&b| b == b'\n')
        .count()
        + 1
}

/// Comment block attached to the construct starting at `anchor`.
///
/// Blank lines directly above the anchor line are skipped; then either a
/// contiguous run of line comments or a single block comment is taken.
pub fn leading_comment(text: &str, anchor: usize, syntax: &Syntax) -> Option<String> {
    let line_start = text[..anchor].rfind('\n').map_or(0, |i| i + 1);
    if line_start == 0 {
        return None;
    }
    let lines: Vec<&str> = text[..line_start - 1].split('\n').collect();
    let mut collected: Vec<String> = Vec::new();
    let mut idx = lines.len();

    while idx > 0 {
        idx -= 1;
        let line = lines[idx].trim();

        if line.is_empty() {
            if collected.is_empty() {
                continue;
            }
            break;
        }

        if let Some(marker) = syntax
            .line_comments
            .iter()
            .find(|m| line.starts_with(**m) && !(**m == "#" && line.starts_with("#[")))
        {
            collected.push(line[marker.len()..].trim().to_string());
            continue;
        }

        if let Some((open, close)) = syntax.block_comment {
            if collected.is_empty() && line.ends_with(close) {
                let mut block = vec![line];
                let mut j = idx;
                while !block.last().is_some_and(|l| l.contains(open)) && j > 0 {
                    j -= 1;
                    block.push(lines[j].trim());
                }
                if !block.last().is_some_and(|l| l.contains(open)) {
                    break;
                }
                // The opening line may carry code before the comment.
                if let Some(first) = block.last_mut() {
                    if let Some(p) = first.find(open) {
                        *first = &first[p..];
                    }
                }
                for l in block {
                    let cleaned = l
                        .trim_end_matches(close)
                        .trim_start_matches(open)
                        .trim_start_matches('*')
                        .trim();
                    collected.push(cleaned.to_string());
                }
                break;
            }
        }
        break;
    }

    collected.reverse();
    while collected.first().is_some_and(|l| l.is_empty()) {
        collected.remove(0);
    }
    while collected.last().is_some_and(|l| l.is_empty()) {
        collected.pop();
    }
    if collected.is_empty() {
        None
    } else {
        Some(collected.join("\n"))
    }
}

/// Start of the first line after `from` that begins at column zero with
/// anything but whitespace or a closing bracket; the end of the text if
/// there is none. Bounds a construct whose terminator is missing.
pub fn next_top_level_line(masked: &str, from: usize) -> usize {
    let bytes = masked.as_bytes();
    let mut pos = from.min(masked.len());
    while let Some(nl) = masked[pos..].find('\n') {
        let line = pos + nl + 1;
        match bytes.get(line) {
            Some(b) if !b.is_ascii_whitespace() && !matches!(b, b'}' | b')' | b']') => return line,
            Some(_) => pos = line,
            None => break,
        }
    }
    masked.len()
}

/// Spans already owned by an emitted entity.
#[derive(Debug, Default)]
pub struct ClaimedSpans(Vec<Range<usize>>);

impl ClaimedSpans {
    pub fn claim(&mut self, span: Range<usize>) {
        self.0.push(span);
    }

    /// True when `span` lies fully inside a claimed span.
    pub fn covers(&self, span: &Range<usize>) -> bool {
        self.0
            .iter()
            .any(|c| c.start <= span.start && span.end <= c.end)
    }
}

/// Collapses runs of whitespace into single spaces.
pub fn squash_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::indexer::languages::Language;

    #[test]
    fn test_block_end_ignores_braces_in_strings() {
        let syntax = Language::JavaScript.config().syntax;
        let src = r#"function f(){ if (x) { return "}"; } } trailing"#;
        let scanner = Scanner::new(src, &syntax);
        let span = scanner.block_end(0, b'{').unwrap();
        assert_eq!(&src[..span.end], r#"function f(){ if (x) { return "}"; } }"#);
    }

    #[test]
    fn test_block_end_without_body() {
        let syntax = Language::TypeScript.config().syntax;
        let src = "function f(a: string): void;\nfunction g() {}";
        let scanner = Scanner::new(src, &syntax);
        assert!(scanner.block_end(0, b'{').is_none());
    }

    #[test]
    fn test_block_end_skips_default_params() {
        let syntax = Language::JavaScript.config().syntax;
        let src = "function f(opts = {}) { return opts; }";
        let scanner = Scanner::new(src, &syntax);
        let span = scanner.block_end(0, b'{').unwrap();
        assert_eq!(&src[span.open..span.end], "{ return opts; }");
    }

    #[test]
    fn test_dollar_quote_with_nested_markers() {
        let syntax = Language::Sql.config().syntax;
        let src = "AS $body$ SELECT '$$'; SELECT $x$ ; $x$; $body$ LANGUAGE sql; next";
        let scanner = Scanner::new(src, &syntax);
        let (region, end) = scanner.opaque_at(3).unwrap();
        assert_eq!(region, Region::DollarQuoted);
        assert_eq!(&src[3..end], "$body$ SELECT '$$'; SELECT $x$ ; $x$; $body$");
        let stmt = scanner.statement_end(0, b';').unwrap();
        assert_eq!(&src[stmt..], " next");
    }

    #[test]
    fn test_positional_params_are_not_tags() {
        let syntax = Language::Sql.config().syntax;
        let src = "select $1, $2 from t;";
        let scanner = Scanner::new(src, &syntax);
        assert_eq!(scanner.statement_end(0, b';'), Some(src.len()));
    }

    #[test]
    fn test_sql_doubled_quotes() {
        let syntax = Language::Sql.config().syntax;
        let src = "'it''s (' ) x";
        let scanner = Scanner::new(src, &syntax);
        assert_eq!(scanner.opaque_at(0), Some((Region::Quoted, 9)));
    }

    #[test]
    fn test_split_top_level() {
        let syntax = Language::Sql.config().syntax;
        let src = "id int, price numeric(10, 2), note text default 'a,b'";
        let scanner = Scanner::new(src, &syntax);
        let parts: Vec<&str> = scanner
            .split_top_level(0..src.len(), b',')
            .into_iter()
            .map(|r| src[r].trim())
            .collect();
        assert_eq!(
            parts,
            vec!["id int", "price numeric(10, 2)", "note text default 'a,b'"]
        );
    }

    #[test]
    fn test_mask_keeps_offsets() {
        let syntax = Language::JavaScript.config().syntax;
        let src = "a('x') // c\nb()";
        let scanner = Scanner::new(src, &syntax);
        let masked = scanner.mask(true, true);
        assert_eq!(masked.len(), src.len());
        assert_eq!(masked, "a(   )     \nb()");
        let comments_only = scanner.mask(true, false);
        assert_eq!(comments_only, "a('x')     \nb()");
    }

    #[test]
    fn test_top_level_view_hides_nested_text() {
        let syntax = Language::JavaScript.config().syntax;
        let src = "a(x) { b('}') } c = 1";
        let scanner = Scanner::new(src, &syntax);
        assert_eq!(scanner.top_level_view(0..src.len()), format!("a( ) {{{}}} c = 1", " ".repeat(8)));
    }

    #[test]
    fn test_leading_comment_line_run() {
        let syntax = Language::Sql.config().syntax;
        let src = "select 1;\n-- Returns totals\n-- per customer\n\nCREATE FUNCTION f()";
        let anchor = src.find("CREATE").unwrap();
        assert_eq!(
            leading_comment(src, anchor, &syntax).as_deref(),
            Some("Returns totals\nper customer")
        );
    }

    #[test]
    fn test_leading_comment_block() {
        let syntax = Language::JavaScript.config().syntax;
        let src = "x();\n/**\n * Adds two numbers.\n */\nfunction add(a, b) {}";
        let anchor = src.find("function").unwrap();
        assert_eq!(
            leading_comment(src, anchor, &syntax).as_deref(),
            Some("Adds two numbers.")
        );
    }

    #[test]
    fn test_leading_comment_absent() {
        let syntax = Language::JavaScript.config().syntax;
        let src = "const a = 1;\nfunction f() {}";
        let anchor = src.find("function").unwrap();
        assert!(leading_comment(src, anchor, &syntax).is_none());
    }

    #[test]
    fn test_multibyte_text_in_opaque_regions() {
        let syntax = Language::Sql.config().syntax;
        let src = "SELECT 'заказ; (' AS метка -- итог; ) 注释\n; SELECT 2";
        let scanner = Scanner::new(src, &syntax);
        let parts: Vec<&str> = scanner
            .split_top_level(0..src.len(), b';')
            .into_iter()
            .map(|r| src[r].trim())
            .collect();
        assert_eq!(parts, vec!["SELECT 'заказ; (' AS метка -- итог; ) 注释", "SELECT 2"]);

        let masked = scanner.mask(true, true);
        assert_eq!(masked.len(), src.len());
        assert!(masked.starts_with("SELECT "));
        assert!(masked.contains("AS метка"));
        assert!(!masked.contains("заказ") && !masked.contains("注释"));

        let view = scanner.top_level_view(0..src.len());
        assert_eq!(view.len(), src.len());
    }

    #[test]
    fn test_top_level_view_blanks_nested_multibyte_text() {
        let syntax = Language::JavaScript.config().syntax;
        let src = "f(имя) { 'ё' } g";
        let scanner = Scanner::new(src, &syntax);
        let view = scanner.top_level_view(0..src.len());
        assert_eq!(view.len(), src.len());
        assert!(view.is_ascii());
        assert!(view.starts_with("f(") && view.ends_with("} g"));
    }

    #[test]
    fn test_next_top_level_line() {
        let src = "function broken(a {\n  return 1;\n}\n\nfunction ok() {}\n";
        let next = next_top_level_line(src, 0);
        assert_eq!(&src[next..], "function ok() {}\n");
        assert_eq!(next_top_level_line("class A {\n  m() {\n", 0), "class A {\n  m() {\n".len());
        assert_eq!(next_top_level_line("", 0), 0);
    }

    #[test]
    fn test_claimed_spans() {
        let mut claimed = ClaimedSpans::default();
        claimed.claim(10..50);
        assert!(claimed.covers(&(20..30)));
        assert!(!claimed.covers(&(40..60)));
    }
}
