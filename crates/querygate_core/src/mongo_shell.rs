//! MongoDB shell syntax.
//!
//! A small lexer for `db.<collection>.<method>(...)` submissions: masking of
//! strings and comments, top-level statement splitting, method call
//! extraction, and a relaxed-JSON parser for shell argument literals
//! (unquoted keys, single quotes, trailing commas, `ObjectId(...)`,
//! `ISODate(...)`, regex literals). Values are produced as MongoDB Extended
//! JSON so they convert losslessly to BSON.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Map, Number, Value};

use crate::error::GateError;

static METHOD_CALL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.\s*([A-Za-z_$][\w$]*)\s*\(").expect("method call regex is valid")
});

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Lex {
    Code,
    Str(char),
    LineComment,
    BlockComment,
}

/// One top-level statement of a shell submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShellStatement {
    /// Statement text, leading comments stripped
    pub text: String,
    /// 1-based line of the statement's first token
    pub line: usize,
}

/// A `.name(args)` call found in a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodCall {
    pub name: String,
    /// Raw text between the parentheses, trimmed
    pub args: String,
    /// Byte offset of the call within the statement
    pub offset: usize,
}

impl MethodCall {
    /// Top-level arguments.
    pub fn arguments(&self) -> Vec<&str> {
        split_args(&self.args)
    }

    /// Whether the first argument is absent or an empty document.
    pub fn has_empty_filter(&self) -> bool {
        match self.arguments().first() {
            None => true,
            Some(first) => is_empty_document(first),
        }
    }
}

/// A parsed command ready for execution.
#[derive(Debug, Clone, PartialEq)]
pub struct ShellCommand {
    /// Database selected with `db.getSiblingDB(...)`
    pub database: Option<String>,
    /// Target collection; `None` for database-level commands
    pub collection: Option<String>,
    pub method: String,
    /// Arguments as Extended JSON values
    pub args: Vec<Value>,
    /// Chained cursor modifiers such as `.sort({...})` and `.limit(n)`
    pub modifiers: Vec<(String, Vec<Value>)>,
}

impl ShellCommand {
    /// Argument at `index`, if supplied.
    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    /// First argument of the named modifier.
    pub fn modifier(&self, name: &str) -> Option<&Value> {
        self.modifiers.iter().find(|(m, _)| m == name).and_then(|(_, args)| args.first())
    }
}

fn mask(src: &str) -> (String, Lex) {
    let mut out = String::with_capacity(src.len());
    let mut state = Lex::Code;
    let mut chars = src.chars().peekable();

    while let Some(c) = chars.next() {
        let next = chars.peek().copied();
        match state {
            Lex::Code => match c {
                '\'' | '"' | '`' => {
                    state = Lex::Str(c);
                    out.push(c);
                }
                '/' if next == Some('/') => {
                    state = Lex::LineComment;
                    out.push(' ');
                }
                '/' if next == Some('*') => {
                    chars.next();
                    state = Lex::BlockComment;
                    out.push_str("  ");
                }
                _ => out.push(c),
            },
            Lex::Str(quote) => {
                if c == '\\' {
                    blank(&mut out, c);
                    if let Some(escaped) = chars.next() {
                        blank(&mut out, escaped);
                    }
                } else if c == quote {
                    state = Lex::Code;
                    out.push(c);
                } else {
                    blank(&mut out, c);
                }
            }
            Lex::LineComment => {
                if c == '\n' {
                    state = Lex::Code;
                }
                blank(&mut out, c);
            }
            Lex::BlockComment => {
                if c == '*' && next == Some('/') {
                    chars.next();
                    state = Lex::Code;
                    out.push_str("  ");
                } else {
                    blank(&mut out, c);
                }
            }
        }
    }
    (out, state)
}

fn blank(out: &mut String, c: char) {
    if c == '\n' {
        out.push('\n');
    } else {
        out.extend(std::iter::repeat(' ').take(c.len_utf8()));
    }
}

/// Replace string contents and comments with spaces, preserving byte offsets
/// and newlines. Quote characters are kept.
pub fn mask_js(src: &str) -> String {
    mask(src).0
}

/// Name of the construct left open at end of input, if any.
pub fn unterminated(src: &str) -> Option<&'static str> {
    match mask(src).1 {
        Lex::Str(_) => Some("string literal"),
        Lex::BlockComment => Some("block comment"),
        Lex::Code | Lex::LineComment => None,
    }
}

/// Split a submission into top-level statements on `;` and on newlines
/// that do not continue a method chain.
pub fn split_statements(src: &str) -> Vec<ShellStatement> {
    let masked = mask_js(src);
    let bytes = masked.as_bytes();
    let mut statements = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;

    for (i, &b) in bytes.iter().enumerate() {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            b';' if depth == 0 => {
                push_statement(src, &masked, start, i, &mut statements);
                start = i + 1;
            }
            b'\n' if depth == 0 => {
                let before = masked[start..i].trim_end();
                let after = masked[i + 1..].trim_start();
                let continues = after.starts_with('.')
                    || before.ends_with('.')
                    || before.ends_with(',')
                    || before.ends_with('=');
                if !continues {
                    push_statement(src, &masked, start, i, &mut statements);
                    start = i + 1;
                }
            }
            _ => {}
        }
    }
    push_statement(src, &masked, start, src.len(), &mut statements);
    statements
}

fn push_statement(
    src: &str,
    masked: &str,
    start: usize,
    end: usize,
    statements: &mut Vec<ShellStatement>,
) {
    let segment = &masked[start..end];
    let Some(lead) = segment.find(|c: char| !c.is_whitespace()) else {
        return;
    };
    let begin = start + lead;
    let text = src[begin..end].trim_end();
    statements.push(ShellStatement {
        text: text.to_string(),
        line: 1 + src[..begin].matches('\n').count(),
    });
}

/// Every `.name(...)` call in a statement, in source order, including calls
/// nested inside arguments.
pub fn method_calls(statement: &str) -> Vec<MethodCall> {
    let masked = mask_js(statement);
    METHOD_CALL
        .captures_iter(&masked)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let name = caps.get(1)?;
            let open = whole.end() - 1;
            let close = matching_close(&masked, open).unwrap_or(masked.len());
            Some(MethodCall {
                name: statement[name.range()].to_string(),
                args: statement[open + 1..close].trim().to_string(),
                offset: whole.start(),
            })
        })
        .collect()
}

/// Byte offset of the bracket closing the one at `open` in masked text.
fn matching_close(masked: &str, open: usize) -> Option<usize> {
    let mut depth = 0usize;
    for (i, b) in masked.bytes().enumerate().skip(open) {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    return Some(i);
                }
            }
            _ => {}
        }
    }
    None
}

/// Split an argument list on top-level commas.
pub fn split_args(args: &str) -> Vec<&str> {
    let masked = mask_js(args);
    let mut parts = Vec::new();
    let mut depth = 0usize;
    let mut start = 0usize;
    for (i, b) in masked.bytes().enumerate() {
        match b {
            b'(' | b'[' | b'{' => depth += 1,
            b')' | b']' | b'}' => depth = depth.saturating_sub(1),
            b',' if depth == 0 => {
                parts.push(args[start..i].trim());
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(args[start..].trim());
    parts.retain(|part| !part.is_empty());
    parts
}

/// Whether an argument is an empty document, ignoring whitespace and comments.
pub fn is_empty_document(arg: &str) -> bool {
    let compact: String = mask_js(arg).chars().filter(|c| !c.is_whitespace()).collect();
    compact == "{}"
}

/// Parse a single shell command such as
/// `db.users.find({ active: true }).sort({ name: 1 }).limit(10)`.
///
/// A bare document (`{ "ping": 1 }`) is treated as `db.runCommand(...)`.
pub fn parse_command(src: &str) -> Result<ShellCommand, GateError> {
    let statements = split_statements(src);
    let statement = match statements.as_slice() {
        [] => return Err(GateError::syntax("MongoDB query is empty")),
        [one] => one,
        many => {
            return Err(GateError::syntax(format!(
                "Expected a single MongoDB command, found {}",
                many.len()
            )))
        }
    };
    let text = statement.text.as_str();

    if text.starts_with('{') {
        return Ok(ShellCommand {
            database: None,
            collection: None,
            method: "runCommand".to_string(),
            args: vec![parse_relaxed_json(text)?],
            modifiers: Vec::new(),
        });
    }

    let segments = chain_segments(text)?;
    let mut command = ShellCommand {
        database: None,
        collection: None,
        method: String::new(),
        args: Vec::new(),
        modifiers: Vec::new(),
    };

    for (name, args) in segments {
        match (command.method.is_empty(), args) {
            (true, Some(args)) if name == "getSiblingDB" => {
                command.database = Some(string_arg(&name, &args)?);
            }
            (true, Some(args)) if name == "getCollection" => {
                command.collection = Some(string_arg(&name, &args)?);
            }
            (true, Some(args)) => {
                command.method = name;
                command.args = parse_args(&args)?;
            }
            (true, None) => {
                command.collection = Some(match command.collection.take() {
                    Some(parent) => format!("{parent}.{name}"),
                    None => name,
                });
            }
            (false, Some(args)) => command.modifiers.push((name, parse_args(&args)?)),
            (false, None) => {
                return Err(GateError::syntax(format!("Unexpected property access `.{name}`")))
            }
        }
    }

    if command.method.is_empty() {
        return Err(GateError::syntax("No method call found in MongoDB command"));
    }
    Ok(command)
}

/// Split `db.a.b(...).c(...)` into `(name, raw_args)` segments after `db`.
fn chain_segments(text: &str) -> Result<Vec<(String, Option<String>)>, GateError> {
    let masked = mask_js(text);
    let rest = masked
        .strip_prefix("db")
        .filter(|r| !r.starts_with(|c: char| c.is_alphanumeric() || c == '_' || c == '$'))
        .ok_or_else(|| GateError::syntax("MongoDB commands must start with `db.`"))?;

    let mut segments = Vec::new();
    let mut pos = masked.len() - rest.len();
    let bytes = masked.as_bytes();

    let skip_ws = |mut p: usize| {
        while p < bytes.len() && bytes[p].is_ascii_whitespace() {
            p += 1;
        }
        p
    };

    loop {
        pos = skip_ws(pos);
        if pos >= bytes.len() {
            break;
        }
        let name = match bytes[pos] {
            b'.' => {
                pos = skip_ws(pos + 1);
                let end = masked[pos..]
                    .find(|c: char| !(c.is_alphanumeric() || c == '_' || c == '$'))
                    .map_or(masked.len(), |n| pos + n);
                if end == pos {
                    return Err(GateError::syntax("Expected a name after `.`"));
                }
                let name = text[pos..end].to_string();
                pos = end;
                name
            }
            b'[' => {
                let close = matching_close(&masked, pos)
                    .ok_or_else(|| GateError::syntax("Unbalanced `[` in MongoDB command"))?;
                let key = parse_relaxed_json(&text[pos + 1..close])?;
                pos = close + 1;
                match key {
                    Value::String(name) => name,
                    _ => return Err(GateError::syntax("Collection name must be a string")),
                }
            }
            other => {
                return Err(GateError::syntax(format!(
                    "Unexpected `{}` in MongoDB command",
                    other as char
                )))
            }
        };

        let after = skip_ws(pos);
        if after < bytes.len() && bytes[after] == b'(' {
            let close = matching_close(&masked, after)
                .ok_or_else(|| GateError::syntax(format!("Unbalanced `(` after `{name}`")))?;
            segments.push((name, Some(text[after + 1..close].to_string())));
            pos = close + 1;
        } else {
            segments.push((name, None));
        }
    }
    Ok(segments)
}

fn parse_args(args: &str) -> Result<Vec<Value>, GateError> {
    split_args(args).into_iter().map(parse_relaxed_json).collect()
}

fn string_arg(method: &str, args: &str) -> Result<String, GateError> {
    match parse_args(args)?.into_iter().next() {
        Some(Value::String(s)) => Ok(s),
        _ => Err(GateError::syntax(format!("{method}() expects a string argument"))),
    }
}

/// Parse a shell literal into Extended JSON.
pub fn parse_relaxed_json(text: &str) -> Result<Value, GateError> {
    let mut parser = RelaxedParser { src: text, pos: 0 };
    let value = parser.value()?;
    parser.skip_ws();
    if parser.pos < text.len() {
        return Err(parser.error("unexpected trailing input"));
    }
    Ok(value)
}

struct RelaxedParser<'a> {
    src: &'a str,
    pos: usize,
}

impl RelaxedParser<'_> {
    fn peek(&self) -> Option<char> {
        self.src[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn error(&self, message: &str) -> GateError {
        GateError::syntax(format!("Invalid MongoDB literal at offset {}: {message}", self.pos))
    }

    fn expect(&mut self, expected: char) -> Result<(), GateError> {
        self.skip_ws();
        match self.bump() {
            Some(c) if c == expected => Ok(()),
            _ => Err(self.error(&format!("expected `{expected}`"))),
        }
    }

    fn skip_ws(&mut self) {
        loop {
            let rest = &self.src[self.pos..];
            let trimmed = rest.trim_start();
            self.pos += rest.len() - trimmed.len();
            if let Some(after) = trimmed.strip_prefix("//") {
                self.pos += 2 + after.find('\n').unwrap_or(after.len());
            } else if let Some(after) = trimmed.strip_prefix("/*") {
                self.pos += 2 + after.find("*/").map_or(after.len(), |n| n + 2);
            } else {
                return;
            }
        }
    }

    fn value(&mut self) -> Result<Value, GateError> {
        self.skip_ws();
        match self.peek() {
            Some('{') => self.object(),
            Some('[') => self.array(),
            Some(q @ ('\'' | '"')) => self.string(q).map(Value::String),
            Some('/') => self.regex(),
            Some(c) if c == '-' || c == '.' || c.is_ascii_digit() => self.number(),
            Some(c) if is_ident_start(c) => self.identifier_value(),
            Some(c) => Err(self.error(&format!("unexpected `{c}`"))),
            None => Err(self.error("unexpected end of input")),
        }
    }

    fn object(&mut self) -> Result<Value, GateError> {
        self.expect('{')?;
        let mut map = Map::new();
        loop {
            self.skip_ws();
            match self.peek() {
                Some('}') => {
                    self.bump();
                    return Ok(Value::Object(map));
                }
                Some(q @ ('\'' | '"')) => {
                    let key = self.string(q)?;
                    self.expect(':')?;
                    map.insert(key, self.value()?);
                }
                Some(c) if is_ident_start(c) => {
                    let key = self.ident().to_string();
                    self.expect(':')?;
                    map.insert(key, self.value()?);
                }
                _ => return Err(self.error("expected a key")),
            }
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some('}') => return Ok(Value::Object(map)),
                _ => return Err(self.error("expected `,` or `}`")),
            }
        }
    }

    fn array(&mut self) -> Result<Value, GateError> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_ws();
            if self.peek() == Some(']') {
                self.bump();
                return Ok(Value::Array(items));
            }
            items.push(self.value()?);
            self.skip_ws();
            match self.bump() {
                Some(',') => continue,
                Some(']') => return Ok(Value::Array(items)),
                _ => return Err(self.error("expected `,` or `]`")),
            }
        }
    }

    fn string(&mut self, quote: char) -> Result<String, GateError> {
        self.bump();
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error("unterminated string")),
                Some(c) if c == quote => return Ok(out),
                Some('\\') => match self.bump() {
                    Some('n') => out.push('\n'),
                    Some('t') => out.push('\t'),
                    Some('r') => out.push('\r'),
                    Some('0') => out.push('\0'),
                    Some('u') => {
                        let hex = self.src.get(self.pos..self.pos + 4).unwrap_or_default();
                        let ch = u32::from_str_radix(hex, 16)
                            .ok()
                            .and_then(char::from_u32)
                            .ok_or_else(|| self.error("invalid unicode escape"))?;
                        self.pos += 4;
                        out.push(ch);
                    }
                    Some(other) => out.push(other),
                    None => return Err(self.error("unterminated string")),
                },
                Some(c) => out.push(c),
            }
        }
    }

    fn number(&mut self) -> Result<Value, GateError> {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
        {
            self.bump();
        }
        let literal = &self.src[start..self.pos];
        if let Ok(n) = literal.parse::<i64>() {
            return Ok(Value::from(n));
        }
        literal
            .parse::<f64>()
            .ok()
            .and_then(Number::from_f64)
            .map(Value::Number)
            .ok_or_else(|| self.error(&format!("invalid number `{literal}`")))
    }

    fn regex(&mut self) -> Result<Value, GateError> {
        self.bump();
        let mut pattern = String::new();
        loop {
            match self.bump() {
                None | Some('\n') => return Err(self.error("unterminated regex")),
                Some('/') => break,
                Some('\\') => {
                    pattern.push('\\');
                    if let Some(c) = self.bump() {
                        pattern.push(c);
                    }
                }
                Some(c) => pattern.push(c),
            }
        }
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_ascii_alphabetic()) {
            self.bump();
        }
        let mut options: Vec<char> = self.src[start..self.pos].chars().collect();
        options.sort_unstable();
        let options: String = options.into_iter().collect();
        Ok(json!({ "$regularExpression": { "pattern": pattern, "options": options } }))
    }

    fn ident(&mut self) -> &str {
        let start = self.pos;
        while matches!(self.peek(), Some(c) if c.is_alphanumeric() || c == '_' || c == '$') {
            self.bump();
        }
        &self.src[start..self.pos]
    }

    fn identifier_value(&mut self) -> Result<Value, GateError> {
        let mut name = self.ident().to_string();
        if name == "new" {
            self.skip_ws();
            name = self.ident().to_string();
        }
        match name.as_str() {
            "true" => return Ok(Value::Bool(true)),
            "false" => return Ok(Value::Bool(false)),
            "null" | "undefined" => return Ok(Value::Null),
            _ => {}
        }

        self.skip_ws();
        if self.peek() != Some('(') {
            return Err(self.error(&format!("unsupported expression `{name}`")));
        }
        self.bump();
        self.skip_ws();
        let arg = if self.peek() == Some(')') { None } else { Some(self.value()?) };
        self.expect(')')?;

        let text = |arg: Option<Value>| match arg {
            Some(Value::String(s)) => Some(s),
            Some(Value::Number(n)) => Some(n.to_string()),
            _ => None,
        };
        match (name.as_str(), arg) {
            ("ObjectId", Some(Value::String(id))) => Ok(json!({ "$oid": id })),
            ("ISODate" | "Date", Some(Value::String(date))) => Ok(json!({ "$date": date })),
            ("ISODate" | "Date", Some(Value::Number(ms))) => {
                Ok(json!({ "$date": { "$numberLong": ms.to_string() } }))
            }
            ("ISODate" | "Date", None) => Ok(json!({
                "$date": chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
            })),
            ("NumberInt", arg) => text(arg)
                .and_then(|s| s.parse::<i32>().ok())
                .map(Value::from)
                .ok_or_else(|| self.error("NumberInt() expects an integer")),
            ("NumberLong", arg) => text(arg)
                .filter(|s| s.parse::<i64>().is_ok())
                .map(|s| json!({ "$numberLong": s }))
                .ok_or_else(|| self.error("NumberLong() expects an integer")),
            ("NumberDecimal", arg) => text(arg)
                .map(|s| json!({ "$numberDecimal": s }))
                .ok_or_else(|| self.error("NumberDecimal() expects a number")),
            (other, _) => Err(self.error(&format!("unsupported constructor `{other}()`"))),
        }
    }
}

fn is_ident_start(c: char) -> bool {
    c.is_alphabetic() || c == '_' || c == '$'
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mask_hides_strings_and_comments() {
        let src = "db.a.find({n: 'x;y'}) // drop()\n";
        let masked = mask_js(src);
        assert_eq!(masked.len(), src.len());
        assert!(!masked.contains(';'));
        assert!(!masked.contains("drop"));
        assert_eq!(unterminated("db.a.find({n: 'x"), Some("string literal"));
        assert_eq!(unterminated(src), None);
    }

    #[test]
    fn test_split_statements_on_semicolons_and_lines() {
        let src = "db.a.find()\ndb.b.drop();\n\n// comment\ndb.c\n  .find()\n  .limit(1)";
        let statements = split_statements(src);
        assert_eq!(statements.len(), 3);
        assert_eq!(statements[0].text, "db.a.find()");
        assert_eq!(statements[1].line, 2);
        assert_eq!(statements[2].line, 5);
        assert!(statements[2].text.ends_with(".limit(1)"));
    }

    #[test]
    fn test_split_keeps_multiline_documents_together() {
        let src = "db.a.insertOne({\n  name: 'x',\n  n: 1\n})";
        assert_eq!(split_statements(src).len(), 1);
    }

    #[test]
    fn test_method_calls_and_filters() {
        let calls = method_calls("db.users.deleteMany({ })");
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].name, "deleteMany");
        assert!(calls[0].has_empty_filter());

        let calls = method_calls("db.users.find({name: 'a.b(c)'}).sort({a: 1})");
        let names: Vec<_> = calls.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["find", "sort"]);
        assert!(!calls[0].has_empty_filter());
        assert!(method_calls("db.users.remove()")[0].has_empty_filter());
    }

    #[test]
    fn test_split_args() {
        assert_eq!(split_args("{a: 1, b: [1, 2]}, {c: 'x,y'}"), vec!["{a: 1, b: [1, 2]}", "{c: 'x,y'}"]);
        assert!(split_args("  ").is_empty());
    }

    #[test]
    fn test_relaxed_json() {
        let value = parse_relaxed_json("{name: 'O\\'Brien', $or: [{age: {$gt: 30}},], active: true,}").unwrap();
        assert_eq!(value["name"], "O'Brien");
        assert_eq!(value["$or"][0]["age"]["$gt"], 30);
        assert_eq!(value["active"], true);

        let value = parse_relaxed_json(
            r#"{_id: ObjectId("507f1f77bcf86cd799439011"), at: ISODate("2024-01-01T00:00:00Z"), n: NumberLong(5), re: /ab+c/i}"#,
        )
        .unwrap();
        assert_eq!(value["_id"]["$oid"], "507f1f77bcf86cd799439011");
        assert_eq!(value["at"]["$date"], "2024-01-01T00:00:00Z");
        assert_eq!(value["n"]["$numberLong"], "5");
        assert_eq!(value["re"]["$regularExpression"]["options"], "i");
    }

    #[test]
    fn test_relaxed_json_rejects_code() {
        assert!(parse_relaxed_json("{a: function() { return 1 }}").is_err());
        assert!(parse_relaxed_json("{a: 1").is_err());
        assert!(parse_relaxed_json("{a: 1} extra").is_err());
    }

    #[test]
    fn test_parse_command_with_modifiers() {
        let command =
            parse_command("db.users.find({active: true}, {name: 1}).sort({name: -1}).limit(5);").unwrap();
        assert_eq!(command.collection.as_deref(), Some("users"));
        assert_eq!(command.method, "find");
        assert_eq!(command.args.len(), 2);
        assert_eq!(command.modifier("limit"), Some(&Value::from(5)));
        assert_eq!(command.modifier("sort").unwrap()["name"], -1);
    }

    #[test]
    fn test_parse_command_collection_forms() {
        let command = parse_command("db.getCollection('audit.log').countDocuments()").unwrap();
        assert_eq!(command.collection.as_deref(), Some("audit.log"));

        let command = parse_command("db.system.profile.find()").unwrap();
        assert_eq!(command.collection.as_deref(), Some("system.profile"));

        let command = parse_command("db['orders'].drop()").unwrap();
        assert_eq!(command.collection.as_deref(), Some("orders"));

        let command = parse_command("db.getSiblingDB('reports').dropDatabase()").unwrap();
        assert_eq!(command.database.as_deref(), Some("reports"));
        assert!(command.collection.is_none());
        assert_eq!(command.method, "dropDatabase");
    }

    #[test]
    fn test_parse_command_document_is_run_command() {
        let command = parse_command(r#"{ "ping": 1 }"#).unwrap();
        assert_eq!(command.method, "runCommand");
        assert_eq!(command.arg(0).unwrap()["ping"], 1);
    }

    #[test]
    fn test_parse_command_errors() {
        assert!(parse_command("").is_err());
        assert!(parse_command("db.a.find(); db.b.find()").is_err());
        assert!(parse_command("users.find()").is_err());
        assert!(parse_command("db.users").is_err());
        assert!(parse_command("database.users.find()").is_err());
    }
}
