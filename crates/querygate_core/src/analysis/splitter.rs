//! SQL statement splitting.
//!
//! Splits on `;` outside of quoted strings, quoted identifiers, dollar-quoted
//! bodies, `--` line comments, and (nestable) `/* */` block comments.

/// One statement of a submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlStatement {
    /// Statement text without the terminating `;`, leading comments stripped
    pub text: String,
    /// 1-based line where the statement's first token starts
    pub line: usize,
}

/// Construct left open at end of input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unterminated {
    /// `'...` or `E'...`
    String,
    /// `"...`
    Identifier,
    /// `$tag$...`
    DollarQuote,
    /// `/* ...`
    BlockComment,
}

impl Unterminated {
    /// Human-readable name.
    pub fn describe(&self) -> &'static str {
        match self {
            Self::String => "string literal",
            Self::Identifier => "quoted identifier",
            Self::DollarQuote => "dollar-quoted string",
            Self::BlockComment => "block comment",
        }
    }
}

/// Result of splitting a submission.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SplitResult {
    /// Non-empty statements in source order
    pub statements: Vec<SqlStatement>,
    /// Set when the input ended inside a quote or comment
    pub unterminated: Option<Unterminated>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum State {
    Normal,
    SingleQuote { escapes: bool },
    DoubleQuote,
    DollarQuote(String),
    LineComment,
    BlockComment(usize),
}

/// Split `sql` into statements.
pub fn split_statements(sql: &str) -> SplitResult {
    let mut result = SplitResult::default();
    let mut state = State::Normal;
    let mut start = 0usize;
    let mut line = 1usize;
    let mut start_line = 1usize;

    let bytes = sql.as_bytes();
    let mut i = 0usize;
    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        if b == b'\n' {
            line += 1;
        }

        match &mut state {
            State::Normal => match b {
                b';' => {
                    push_statement(&mut result, &sql[start..i], start_line);
                    start = i + 1;
                    start_line = line;
                }
                b'\'' => {
                    let escapes = i > 0 && matches!(bytes[i - 1], b'e' | b'E')
                        && (i < 2 || !is_ident_byte(bytes[i - 2]));
                    state = State::SingleQuote { escapes };
                }
                b'"' => state = State::DoubleQuote,
                b'-' if next == Some(b'-') => {
                    state = State::LineComment;
                    i += 1;
                }
                b'/' if next == Some(b'*') => {
                    state = State::BlockComment(1);
                    i += 1;
                }
                b'$' => {
                    if let Some(tag) = dollar_tag(&sql[i..]) {
                        if i == 0 || !is_ident_byte(bytes[i - 1]) {
                            i += tag.len() - 1;
                            state = State::DollarQuote(tag);
                        }
                    }
                }
                _ => {}
            },
            State::SingleQuote { escapes } => match b {
                b'\\' if *escapes => {
                    if next == Some(b'\n') {
                        line += 1;
                    }
                    i += 1;
                }
                b'\'' => state = State::Normal,
                _ => {}
            },
            State::DoubleQuote => {
                if b == b'"' {
                    state = State::Normal;
                }
            }
            State::DollarQuote(tag) => {
                if b == b'$' && sql[i..].starts_with(tag.as_str()) {
                    i += tag.len() - 1;
                    state = State::Normal;
                }
            }
            State::LineComment => {
                if b == b'\n' {
                    state = State::Normal;
                }
            }
            State::BlockComment(depth) => {
                if b == b'*' && next == Some(b'/') {
                    *depth -= 1;
                    i += 1;
                    if *depth == 0 {
                        state = State::Normal;
                    }
                } else if b == b'/' && next == Some(b'*') {
                    *depth += 1;
                    i += 1;
                }
            }
        }
        i += 1;
    }

    result.unterminated = match state {
        State::SingleQuote { .. } => Some(Unterminated::String),
        State::DoubleQuote => Some(Unterminated::Identifier),
        State::DollarQuote(_) => Some(Unterminated::DollarQuote),
        State::BlockComment(_) => Some(Unterminated::BlockComment),
        State::Normal | State::LineComment => None,
    };
    push_statement(&mut result, &sql[start..], start_line);
    result
}

fn push_statement(result: &mut SplitResult, raw: &str, raw_line: usize) {
    let (text, skipped_lines) = strip_leading_comments(raw);
    let text = text.trim_end();
    if text.is_empty() {
        return;
    }
    result.statements.push(SqlStatement { text: text.to_string(), line: raw_line + skipped_lines });
}

/// Strip leading whitespace and comments, returning the rest and the number
/// of newlines skipped.
pub fn strip_leading_comments(raw: &str) -> (&str, usize) {
    let mut rest = raw;
    let mut newlines = 0usize;
    loop {
        let trimmed = rest.trim_start();
        newlines += rest[..rest.len() - trimmed.len()].matches('\n').count();
        rest = trimmed;

        if let Some(after) = rest.strip_prefix("--") {
            match after.find('\n') {
                Some(pos) => {
                    rest = &after[pos..];
                }
                None => return ("", newlines),
            }
        } else if rest.starts_with("/*") {
            match block_comment_end(rest) {
                Some(end) => {
                    newlines += rest[..end].matches('\n').count();
                    rest = &rest[end..];
                }
                None => return ("", newlines),
            }
        } else {
            return (rest, newlines);
        }
    }
}

/// Byte offset just past the block comment opening `text`, honoring nesting.
fn block_comment_end(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut i = 0usize;
    while i + 1 < bytes.len() {
        match (bytes[i], bytes[i + 1]) {
            (b'/', b'*') => {
                depth += 1;
                i += 2;
            }
            (b'*', b'/') => {
                depth -= 1;
                i += 2;
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => i += 1,
        }
    }
    None
}

/// `$tag$` opener at the start of `text`, if any. Positional parameters
/// (`$1`) are not dollar quotes.
fn dollar_tag(text: &str) -> Option<String> {
    let bytes = text.as_bytes();
    let mut end = 1usize;
    while end < bytes.len() {
        let b = bytes[end];
        if b == b'$' {
            return Some(text[..=end].to_string());
        }
        let valid = if end == 1 { b.is_ascii_alphabetic() || b == b'_' } else { is_ident_byte(b) };
        if !valid {
            return None;
        }
        end += 1;
    }
    None
}

fn is_ident_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b == b'_'
}

/// Mask string literals, quoted identifiers, dollar-quoted bodies, and
/// comments with spaces so keyword searches only see SQL tokens. Byte
/// offsets are preserved.
pub fn mask_literals(sql: &str) -> String {
    let mut masked = String::with_capacity(sql.len());
    let mut state = State::Normal;
    let bytes = sql.as_bytes();
    let mut i = 0usize;

    let blank = |masked: &mut String, s: &str| {
        for c in s.chars() {
            if c == '\n' {
                masked.push('\n');
            } else {
                for _ in 0..c.len_utf8() {
                    masked.push(' ');
                }
            }
        }
    };

    while i < bytes.len() {
        let c = match sql[i..].chars().next() {
            Some(c) => c,
            None => break,
        };
        let width = c.len_utf8();
        let next = bytes.get(i + 1).copied();

        match &mut state {
            State::Normal => match c {
                '\'' => {
                    state = State::SingleQuote { escapes: false };
                    masked.push('\'');
                }
                '"' => {
                    state = State::DoubleQuote;
                    masked.push('"');
                }
                '-' if next == Some(b'-') => {
                    state = State::LineComment;
                    masked.push_str("  ");
                    i += 2;
                    continue;
                }
                '/' if next == Some(b'*') => {
                    state = State::BlockComment(1);
                    masked.push_str("  ");
                    i += 2;
                    continue;
                }
                '$' => match dollar_tag(&sql[i..]) {
                    Some(tag) if i == 0 || !is_ident_byte(bytes[i - 1]) => {
                        blank(&mut masked, &tag);
                        i += tag.len();
                        state = State::DollarQuote(tag);
                        continue;
                    }
                    _ => masked.push('$'),
                },
                _ => masked.push(c),
            },
            State::SingleQuote { .. } => {
                if c == '\'' {
                    state = State::Normal;
                    masked.push('\'');
                } else {
                    blank(&mut masked, &sql[i..i + width]);
                }
            }
            State::DoubleQuote => {
                if c == '"' {
                    state = State::Normal;
                    masked.push('"');
                } else {
                    blank(&mut masked, &sql[i..i + width]);
                }
            }
            State::DollarQuote(tag) => {
                if sql[i..].starts_with(tag.as_str()) {
                    let len = tag.len();
                    blank(&mut masked, &sql[i..i + len]);
                    i += len;
                    state = State::Normal;
                    continue;
                }
                blank(&mut masked, &sql[i..i + width]);
            }
            State::LineComment => {
                if c == '\n' {
                    state = State::Normal;
                }
                blank(&mut masked, &sql[i..i + width]);
            }
            State::BlockComment(depth) => {
                if c == '*' && next == Some(b'/') {
                    *depth -= 1;
                    masked.push_str("  ");
                    i += 2;
                    if *depth == 0 {
                        state = State::Normal;
                    }
                    continue;
                } else if c == '/' && next == Some(b'*') {
                    *depth += 1;
                    masked.push_str("  ");
                    i += 2;
                    continue;
                }
                blank(&mut masked, &sql[i..i + width]);
            }
        }
        i += width;
    }
    masked
}
