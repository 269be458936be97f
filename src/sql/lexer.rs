//! Single-pass PostgreSQL lexer.
//!
//! [`Lexer`] walks the input bytes once and yields coarse [`Span`]s: plain
//! code, comments, string literals, quoted identifiers, dollar-quoted bodies
//! and statement terminators. Every delimiter PostgreSQL cares about is
//! ASCII, so scanning bytes never splits a UTF-8 sequence and every span
//! boundary is a valid `str` index.
//!
//! All lookahead is fixed-length except dollar-quote tags, which are bounded
//! by the 63-byte identifier limit, so the scan stays linear on adversarial
//! input.

/// PostgreSQL truncates identifiers (and therefore dollar-quote tags) here.
pub const MAX_IDENTIFIER_LEN: usize = 63;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpanKind {
    Code,
    /// `--` to end of line, or `/* ... */` (first `*/` closes, no nesting)
    Comment,
    /// `'...'` or `E'...'`
    StringLiteral,
    /// `"..."`
    QuotedIdent,
    /// `$tag$ ... $tag$`
    DollarString,
    /// A bare `;`
    Terminator,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Span {
    pub kind: SpanKind,
    pub start: usize,
    pub end: usize,
    /// False when the input ended inside a literal or comment.
    pub terminated: bool,
}

pub struct Lexer<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Lexer<'a> {
    pub fn new(sql: &'a str) -> Self {
        Self {
            bytes: sql.as_bytes(),
            pos: 0,
        }
    }

    fn peek(&self, at: usize) -> Option<u8> {
        self.bytes.get(at).copied()
    }

    /// Length of the `$tag$` opener at `at`, if one starts there.
    fn dollar_tag_len(&self, at: usize) -> Option<usize> {
        if self.peek(at) != Some(b'$') {
            return None;
        }
        // `a$b` is an identifier, not a quote opener
        if at > 0 && is_ident_byte(self.bytes[at - 1]) {
            return None;
        }
        let mut i = at + 1;
        match self.peek(i) {
            Some(b'$') => return Some(2),
            Some(b) if is_ident_start(b) => i += 1,
            // `$1` placeholders and stray dollars
            _ => return None,
        }
        while let Some(b) = self.peek(i) {
            if b == b'$' {
                return Some(i + 1 - at);
            }
            if !is_ident_byte(b) || i - at > MAX_IDENTIFIER_LEN {
                return None;
            }
            i += 1;
        }
        None
    }

    fn starts_special(&self, at: usize) -> bool {
        match self.bytes[at] {
            b';' | b'\'' | b'"' => true,
            b'-' => self.peek(at + 1) == Some(b'-'),
            b'/' => self.peek(at + 1) == Some(b'*'),
            b'$' => self.dollar_tag_len(at).is_some(),
            _ => false,
        }
    }

    /// `E'...'` strings honour backslash escapes.
    fn is_escape_string(&self, quote_at: usize) -> bool {
        if quote_at == 0 || !matches!(self.bytes[quote_at - 1], b'E' | b'e') {
            return false;
        }
        quote_at < 2 || !is_ident_byte(self.bytes[quote_at - 2])
    }

    fn scan_quoted(&mut self, start: usize, quote: u8, escapes: bool) -> (usize, bool) {
        let mut i = start + 1;
        while let Some(b) = self.peek(i) {
            if escapes && b == b'\\' {
                i += 2;
                continue;
            }
            if b == quote {
                if self.peek(i + 1) == Some(quote) {
                    i += 2;
                    continue;
                }
                return (i + 1, true);
            }
            i += 1;
        }
        (self.bytes.len(), false)
    }

    fn scan_block_comment(&self, start: usize) -> (usize, bool) {
        let mut i = start + 2;
        while i + 1 < self.bytes.len() {
            if self.bytes[i] == b'*' && self.bytes[i + 1] == b'/' {
                return (i + 2, true);
            }
            i += 1;
        }
        (self.bytes.len(), false)
    }

    fn scan_dollar(&self, start: usize, tag_len: usize) -> (usize, bool) {
        let tag = &self.bytes[start..start + tag_len];
        let mut i = start + tag_len;
        while i < self.bytes.len() {
            if self.bytes[i] == b'$' && self.bytes[i..].starts_with(tag) {
                return (i + tag_len, true);
            }
            i += 1;
        }
        (self.bytes.len(), false)
    }
}

impl Iterator for Lexer<'_> {
    type Item = Span;

    fn next(&mut self) -> Option<Span> {
        let start = self.pos;
        let b = self.peek(start)?;

        let (kind, end, terminated) = match b {
            b';' => (SpanKind::Terminator, start + 1, true),
            b'\'' => {
                let escapes = self.is_escape_string(start);
                let (end, ok) = self.scan_quoted(start, b'\'', escapes);
                (SpanKind::StringLiteral, end, ok)
            }
            b'"' => {
                let (end, ok) = self.scan_quoted(start, b'"', false);
                (SpanKind::QuotedIdent, end, ok)
            }
            b'-' if self.peek(start + 1) == Some(b'-') => {
                let end = self.bytes[start..]
                    .iter()
                    .position(|&c| c == b'\n')
                    .map_or(self.bytes.len(), |p| start + p);
                (SpanKind::Comment, end, true)
            }
            b'/' if self.peek(start + 1) == Some(b'*') => {
                let (end, ok) = self.scan_block_comment(start);
                (SpanKind::Comment, end, ok)
            }
            b'$' if self.dollar_tag_len(start).is_some() => {
                let tag_len = self.dollar_tag_len(start).unwrap_or(1);
                let (end, ok) = self.scan_dollar(start, tag_len);
                (SpanKind::DollarString, end, ok)
            }
            _ => {
                let mut i = start + 1;
                while i < self.bytes.len() && !self.starts_special(i) {
                    i += 1;
                }
                (SpanKind::Code, i, true)
            }
        };

        self.pos = end;
        Some(Span {
            kind,
            start,
            end,
            terminated,
        })
    }
}

pub(crate) fn is_ident_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b >= 0x80
}

pub(crate) fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_' || b == b'$' || b >= 0x80
}

/// Length-preserving copy of `sql` with comments and literal bodies blanked.
///
/// Quotes around string literals survive so the literal is still visible as
/// a token; quoted identifiers are kept verbatim. Any byte offset into the
/// result is a valid offset into the original text.
pub fn mask_sql(sql: &str) -> String {
    let mut out = sql.as_bytes().to_vec();
    for span in Lexer::new(sql) {
        let range = match span.kind {
            SpanKind::Comment => span.start..span.end,
            SpanKind::StringLiteral | SpanKind::DollarString => {
                let inner_end = if span.terminated {
                    span.end - 1
                } else {
                    span.end
                };
                (span.start + 1)..inner_end.max(span.start + 1)
            }
            _ => continue,
        };
        for b in &mut out[range] {
            if *b != b'\n' {
                *b = b' ';
            }
        }
    }
    // Only whole spans were replaced with ASCII, so this never fails.
    String::from_utf8(out).unwrap_or_else(|e| String::from_utf8_lossy(e.as_bytes()).into_owned())
}

/// Remove comments, keeping literals intact. Each comment becomes one space.
pub fn strip_comments(sql: &str) -> String {
    let mut out = String::with_capacity(sql.len());
    for span in Lexer::new(sql) {
        match span.kind {
            SpanKind::Comment => out.push(' '),
            _ => out.push_str(&sql[span.start..span.end]),
        }
    }
    out
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Word,
    QuotedIdent,
    Literal,
    Number,
    Open,
    Close,
    Comma,
    Dot,
    Semicolon,
    Other,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Token {
    pub kind: TokenKind,
    pub start: usize,
    pub end: usize,
}

impl Token {
    pub fn text<'s>(&self, src: &'s str) -> &'s str {
        &src[self.start..self.end]
    }

    pub fn is_word(&self, src: &str, word: &str) -> bool {
        self.kind == TokenKind::Word && self.text(src).eq_ignore_ascii_case(word)
    }

    /// The identifier this token names, upper-cased for comparison with
    /// keyword and function tables.
    ///
    /// Bare words fold case. A quoted identifier is unquoted and only matches
    /// when it is entirely lower case: `"nextval"` is the built-in, while
    /// `"NEXTVAL"` names some other function.
    pub fn folded_name(&self, src: &str) -> Option<String> {
        match self.kind {
            TokenKind::Word => Some(self.text(src).to_ascii_uppercase()),
            TokenKind::QuotedIdent => {
                let text = self.text(src);
                let inner = text.strip_prefix('"')?;
                let inner = inner.strip_suffix('"').unwrap_or(inner).replace("\"\"", "\"");
                (!inner.bytes().any(|b| b.is_ascii_uppercase())).then(|| inner.to_ascii_uppercase())
            }
            _ => None,
        }
    }
}

/// Tokenize the output of [`mask_sql`].
///
/// Words are identifier-like runs; everything inside quotes collapses into a
/// single token so keywords in identifiers never match.
pub fn tokenize(masked: &str) -> Vec<Token> {
    let bytes = masked.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        let start = i;
        let kind = match b {
            b'(' => {
                i += 1;
                TokenKind::Open
            }
            b')' => {
                i += 1;
                TokenKind::Close
            }
            b',' => {
                i += 1;
                TokenKind::Comma
            }
            b'.' => {
                i += 1;
                TokenKind::Dot
            }
            b';' => {
                i += 1;
                TokenKind::Semicolon
            }
            b'"' | b'\'' => {
                i += 1;
                while i < bytes.len() {
                    if bytes[i] == b {
                        if bytes.get(i + 1) == Some(&b) {
                            i += 2;
                            continue;
                        }
                        i += 1;
                        break;
                    }
                    i += 1;
                }
                if b == b'"' {
                    TokenKind::QuotedIdent
                } else {
                    TokenKind::Literal
                }
            }
            _ if b.is_ascii_digit() => {
                while i < bytes.len() && (bytes[i].is_ascii_alphanumeric() || bytes[i] == b'.') {
                    i += 1;
                }
                TokenKind::Number
            }
            _ if is_ident_start(b) => {
                while i < bytes.len() && is_ident_byte(bytes[i]) {
                    i += 1;
                }
                TokenKind::Word
            }
            _ => {
                i += 1;
                TokenKind::Other
            }
        };
        tokens.push(Token {
            kind,
            start,
            end: i,
        });
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(sql: &str) -> Vec<SpanKind> {
        Lexer::new(sql).map(|s| s.kind).collect()
    }

    #[test]
    fn test_spans_cover_input() {
        let sql = "SELECT 'a;b', \"c\" -- x\n/* y */ $q$z$q$;";
        let spans: Vec<Span> = Lexer::new(sql).collect();
        assert_eq!(spans.first().unwrap().start, 0);
        assert_eq!(spans.last().unwrap().end, sql.len());
        for pair in spans.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
        }
    }

    #[test]
    fn test_folded_name() {
        let sql = r#"nextval "pg_read_file" "NextVal" "a""b" 'x'"#;
        let masked = mask_sql(sql);
        let names: Vec<Option<String>> = tokenize(&masked)
            .iter()
            .map(|t| t.folded_name(&masked))
            .collect();
        assert_eq!(
            names,
            vec![
                Some("NEXTVAL".to_string()),
                Some("PG_READ_FILE".to_string()),
                None,
                Some("A\"B".to_string()),
                None,
            ]
        );
    }

    #[test]
    fn test_doubled_quotes_stay_inside_literal() {
        assert_eq!(
            kinds("'it''s'"),
            vec![SpanKind::StringLiteral]
        );
        assert_eq!(kinds("\"a\"\"b\""), vec![SpanKind::QuotedIdent]);
    }

    #[test]
    fn test_escape_string_backslash() {
        let sql = r"E'it\'s;' ;";
        let spans: Vec<Span> = Lexer::new(sql).collect();
        assert_eq!(spans[1].kind, SpanKind::StringLiteral);
        assert_eq!(&sql[spans[1].start..spans[1].end], r"'it\'s;'");
        assert_eq!(spans.last().unwrap().kind, SpanKind::Terminator);
    }

    #[test]
    fn test_backslash_is_literal_in_standard_string() {
        let sql = r"'a\';";
        let spans: Vec<Span> = Lexer::new(sql).collect();
        assert_eq!(spans[0].kind, SpanKind::StringLiteral);
        assert_eq!(spans[1].kind, SpanKind::Terminator);
    }

    #[test]
    fn test_block_comment_does_not_nest() {
        let sql = "/* a /* b */ c */";
        let spans: Vec<Span> = Lexer::new(sql).collect();
        assert_eq!(spans[0].kind, SpanKind::Comment);
        assert_eq!(&sql[spans[0].start..spans[0].end], "/* a /* b */");
        assert_eq!(spans[1].kind, SpanKind::Code);
    }

    #[test]
    fn test_dollar_quote_variants() {
        assert_eq!(kinds("$$a;b$$"), vec![SpanKind::DollarString]);
        assert_eq!(kinds("$fn$ x $$ y $fn$"), vec![SpanKind::DollarString]);
        // placeholders and identifier dollars are code
        assert_eq!(kinds("$1"), vec![SpanKind::Code]);
        assert_eq!(kinds("a$b$"), vec![SpanKind::Code]);
    }

    #[test]
    fn test_overlong_dollar_tag_is_not_a_quote() {
        let tag = "t".repeat(MAX_IDENTIFIER_LEN + 5);
        let sql = format!("${tag}$ ; ${tag}$");
        assert!(kinds(&sql).contains(&SpanKind::Terminator));
    }

    #[test]
    fn test_unterminated_constructs() {
        let spans: Vec<Span> = Lexer::new("SELECT 'abc").collect();
        assert!(!spans.last().unwrap().terminated);
        let spans: Vec<Span> = Lexer::new("/* open").collect();
        assert!(!spans[0].terminated);
    }

    #[test]
    fn test_mask_preserves_length_and_newlines() {
        let sql = "SELECT 'drop' -- delete\n, $$x$$ /* é */";
        let masked = mask_sql(sql);
        assert_eq!(masked.len(), sql.len());
        assert!(!masked.to_lowercase().contains("drop"));
        assert!(!masked.to_lowercase().contains("delete"));
        assert_eq!(masked.matches('\n').count(), 1);
        assert!(masked.starts_with("SELECT '    '"));
    }

    #[test]
    fn test_strip_comments() {
        assert_eq!(strip_comments("SELECT/**/1 -- x"), "SELECT 1  ");
        assert_eq!(strip_comments("SELECT '--not'"), "SELECT '--not'");
    }

    #[test]
    fn test_tokenize_words_and_punct() {
        let masked = mask_sql("SELECT pg_catalog.now(), \"Weird Name\" FROM t;");
        let tokens = tokenize(&masked);
        let kinds: Vec<TokenKind> = tokens.iter().map(|t| t.kind).collect();
        assert_eq!(
            kinds,
            vec![
                TokenKind::Word,
                TokenKind::Word,
                TokenKind::Dot,
                TokenKind::Word,
                TokenKind::Open,
                TokenKind::Close,
                TokenKind::Comma,
                TokenKind::QuotedIdent,
                TokenKind::Word,
                TokenKind::Word,
                TokenKind::Semicolon,
            ]
        );
        assert!(tokens[0].is_word(&masked, "select"));
    }

    #[test]
    fn test_tokenize_non_ascii_identifier() {
        let src = "SELECT größe FROM maße + 1";
        let tokens = tokenize(src);
        assert_eq!(tokens[1].kind, TokenKind::Word);
        assert_eq!(tokens[1].text(src), "größe");
        assert_eq!(tokens[3].text(src), "maße");
        assert_eq!(tokens[4].kind, TokenKind::Other);
        assert_eq!(tokens[5].kind, TokenKind::Number);
    }
}
