//! Policy rule language.
//!
//! Two input forms are accepted:
//!
//! ```text
//! # HCL-style blocks
//! path "secret/data/*" {
//!     capabilities = ["read", "list"]
//! }
//! ```
//!
//! and the equivalent JSON document
//! `{"path": {"secret/data/*": {"capabilities": ["read", "list"]}}}`.
//!
//! The legacy `policy = "read" | "write" | "deny" | "sudo"` shorthand is
//! expanded into capability sets. Any other attribute is rejected.

use std::collections::BTreeSet;

use serde_json::Value;

use crate::acl::PathPattern;
use crate::error::PolicyError;
use crate::policy::{Capability, PolicyRule};

/// Parse policy text (HCL-style or JSON) into rules.
///
/// Rules sharing a pattern are merged. Declaration order of first occurrence
/// is preserved.
///
/// # Errors
///
/// Returns [`PolicyError::Invalid`] on syntax errors, unknown attributes,
/// unknown capabilities, or malformed path patterns.
pub fn parse_rules(text: &str) -> Result<Vec<PolicyRule>, PolicyError> {
    let raw_rules = if text.trim_start().starts_with('{') {
        parse_json(text)?
    } else {
        Parser::new(text).parse()?
    };

    let mut rules: Vec<PolicyRule> = Vec::with_capacity(raw_rules.len());
    for rule in raw_rules {
        let path = rule.path.trim_start_matches('/').to_owned();
        PathPattern::parse(&path).map_err(|reason| invalid(format!("path \"{path}\": {reason}")))?;
        if rule.capabilities.is_empty() {
            return Err(invalid(format!("path \"{path}\": no capabilities")));
        }
        match rules.iter_mut().find(|r| r.path == path) {
            Some(existing) => existing.capabilities.extend(rule.capabilities),
            None => rules.push(PolicyRule {
                path,
                capabilities: rule.capabilities,
            }),
        }
    }
    Ok(rules)
}

fn invalid(reason: impl Into<String>) -> PolicyError {
    PolicyError::Invalid {
        reason: reason.into(),
    }
}

fn capability(name: &str) -> Result<Capability, PolicyError> {
    name.trim().to_lowercase().parse()
}

/// Expand the legacy `policy = "..."` shorthand.
fn legacy_capabilities(value: &str) -> Result<BTreeSet<Capability>, PolicyError> {
    use Capability::{Create, Delete, Deny, List, Read, Sudo, Update};
    let caps: &[Capability] = match value {
        "read" => &[Read, List],
        "write" => &[Create, Read, Update, Delete, List],
        "sudo" => &[Create, Read, Update, Delete, List, Sudo],
        "deny" => &[Deny],
        other => return Err(invalid(format!("unknown policy shorthand '{other}'"))),
    };
    Ok(caps.iter().copied().collect())
}

// ---------------------------------------------------------------------------
// JSON form
// ---------------------------------------------------------------------------

fn parse_json(text: &str) -> Result<Vec<PolicyRule>, PolicyError> {
    let doc: Value =
        serde_json::from_str(text).map_err(|e| invalid(format!("malformed JSON policy: {e}")))?;
    let Value::Object(top) = doc else {
        return Err(invalid("JSON policy must be an object"));
    };

    let mut rules = Vec::new();
    for (key, value) in top {
        if key != "path" {
            return Err(invalid(format!("unknown top-level key '{key}'")));
        }
        let Value::Object(paths) = value else {
            return Err(invalid("'path' must map patterns to rule objects"));
        };
        for (pattern, body) in paths {
            let Value::Object(attrs) = body else {
                return Err(invalid(format!("path \"{pattern}\": rule must be an object")));
            };
            let mut capabilities = BTreeSet::new();
            for (attr, v) in attrs {
                match (attr.as_str(), v) {
                    ("capabilities", Value::Array(items)) => {
                        for item in items {
                            let Value::String(name) = item else {
                                return Err(invalid(format!(
                                    "path \"{pattern}\": capabilities must be strings"
                                )));
                            };
                            capabilities.insert(capability(&name)?);
                        }
                    }
                    ("policy", Value::String(s)) => capabilities.extend(legacy_capabilities(&s)?),
                    (other, _) => {
                        return Err(invalid(format!(
                            "path \"{pattern}\": invalid attribute '{other}'"
                        )));
                    }
                }
            }
            rules.push(PolicyRule {
                path: pattern,
                capabilities,
            });
        }
    }
    Ok(rules)
}

// ---------------------------------------------------------------------------
// HCL-style form
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Str(String),
    LBrace,
    RBrace,
    LBracket,
    RBracket,
    Equals,
    Comma,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Ident(s) => format!("identifier '{s}'"),
            Self::Str(s) => format!("string \"{s}\""),
            Self::LBrace => "'{'".to_owned(),
            Self::RBrace => "'}'".to_owned(),
            Self::LBracket => "'['".to_owned(),
            Self::RBracket => "']'".to_owned(),
            Self::Equals => "'='".to_owned(),
            Self::Comma => "','".to_owned(),
        }
    }
}

fn tokenize(text: &str) -> Result<Vec<(Token, usize)>, PolicyError> {
    let mut tokens = Vec::new();
    let mut chars = text.chars().peekable();
    let mut line = 1usize;

    while let Some(c) = chars.next() {
        match c {
            '\n' => line += 1,
            c if c.is_whitespace() => {}
            '#' => skip_line(&mut chars, &mut line),
            '/' => match chars.next() {
                Some('/') => skip_line(&mut chars, &mut line),
                Some('*') => {
                    let start = line;
                    let mut prev = '\0';
                    let mut closed = false;
                    for c in chars.by_ref() {
                        if c == '\n' {
                            line += 1;
                        }
                        if prev == '*' && c == '/' {
                            closed = true;
                            break;
                        }
                        prev = c;
                    }
                    if !closed {
                        return Err(invalid(format!("line {start}: unterminated block comment")));
                    }
                }
                _ => return Err(invalid(format!("line {line}: unexpected '/'"))),
            },
            '{' => tokens.push((Token::LBrace, line)),
            '}' => tokens.push((Token::RBrace, line)),
            '[' => tokens.push((Token::LBracket, line)),
            ']' => tokens.push((Token::RBracket, line)),
            '=' => tokens.push((Token::Equals, line)),
            ',' => tokens.push((Token::Comma, line)),
            '"' => {
                let start = line;
                let mut value = String::new();
                let mut closed = false;
                while let Some(c) = chars.next() {
                    match c {
                        '"' => {
                            closed = true;
                            break;
                        }
                        '\\' => match chars.next() {
                            Some('n') => value.push('\n'),
                            Some('t') => value.push('\t'),
                            Some(other) => value.push(other),
                            None => break,
                        },
                        '\n' => {
                            return Err(invalid(format!("line {start}: newline in string")));
                        }
                        other => value.push(other),
                    }
                }
                if !closed {
                    return Err(invalid(format!("line {start}: unterminated string")));
                }
                tokens.push((Token::Str(value), start));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let mut ident = String::from(c);
                while let Some(&next) = chars.peek() {
                    if next.is_ascii_alphanumeric() || next == '_' || next == '-' {
                        ident.push(next);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push((Token::Ident(ident), line));
            }
            other => return Err(invalid(format!("line {line}: unexpected character '{other}'"))),
        }
    }
    Ok(tokens)
}

fn skip_line(chars: &mut std::iter::Peekable<std::str::Chars<'_>>, line: &mut usize) {
    for c in chars.by_ref() {
        if c == '\n' {
            *line += 1;
            break;
        }
    }
}

struct Parser {
    tokens: Vec<(Token, usize)>,
    pos: usize,
    source: String,
}

impl Parser {
    fn new(text: &str) -> Self {
        Self {
            tokens: Vec::new(),
            pos: 0,
            source: text.to_owned(),
        }
    }

    fn parse(mut self) -> Result<Vec<PolicyRule>, PolicyError> {
        self.tokens = tokenize(&self.source)?;
        let mut rules = Vec::new();
        while self.pos < self.tokens.len() {
            rules.push(self.block()?);
        }
        Ok(rules)
    }

    fn next(&mut self) -> Result<(Token, usize), PolicyError> {
        let tok = self
            .tokens
            .get(self.pos)
            .cloned()
            .ok_or_else(|| invalid("unexpected end of policy"))?;
        self.pos += 1;
        Ok(tok)
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(t, _)| t)
    }

    fn expect(&mut self, want: &Token) -> Result<(), PolicyError> {
        let (tok, line) = self.next()?;
        if &tok == want {
            Ok(())
        } else {
            Err(invalid(format!(
                "line {line}: expected {}, found {}",
                want.describe(),
                tok.describe()
            )))
        }
    }

    /// `path "<pattern>" [=] { attr* }`
    fn block(&mut self) -> Result<PolicyRule, PolicyError> {
        let (tok, line) = self.next()?;
        match tok {
            Token::Ident(ref kw) if kw == "path" => {}
            other => {
                return Err(invalid(format!(
                    "line {line}: expected 'path', found {}",
                    other.describe()
                )));
            }
        }
        let (tok, line) = self.next()?;
        let Token::Str(pattern) = tok else {
            return Err(invalid(format!(
                "line {line}: expected path pattern string, found {}",
                tok.describe()
            )));
        };
        if self.peek() == Some(&Token::Equals) {
            self.pos += 1;
        }
        self.expect(&Token::LBrace)?;

        let mut capabilities = BTreeSet::new();
        loop {
            let (tok, line) = self.next()?;
            match tok {
                Token::RBrace => break,
                Token::Ident(attr) => {
                    self.expect(&Token::Equals)?;
                    match attr.as_str() {
                        "capabilities" => {
                            for name in self.string_list()? {
                                capabilities.insert(capability(&name)?);
                            }
                        }
                        "policy" => {
                            let (tok, line) = self.next()?;
                            let Token::Str(value) = tok else {
                                return Err(invalid(format!(
                                    "line {line}: 'policy' expects a string"
                                )));
                            };
                            capabilities.extend(legacy_capabilities(&value)?);
                        }
                        other => {
                            return Err(invalid(format!(
                                "line {line}: path \"{pattern}\": invalid attribute '{other}'"
                            )));
                        }
                    }
                }
                other => {
                    return Err(invalid(format!(
                        "line {line}: unexpected {} in path block",
                        other.describe()
                    )));
                }
            }
        }

        Ok(PolicyRule {
            path: pattern,
            capabilities,
        })
    }

    /// `[ "a", "b", ]`
    fn string_list(&mut self) -> Result<Vec<String>, PolicyError> {
        self.expect(&Token::LBracket)?;
        let mut items = Vec::new();
        loop {
            let (tok, line) = self.next()?;
            match tok {
                Token::RBracket => break,
                Token::Str(s) => {
                    items.push(s);
                    match self.next()? {
                        (Token::Comma, _) => {}
                        (Token::RBracket, _) => break,
                        (other, line) => {
                            return Err(invalid(format!(
                                "line {line}: expected ',' or ']', found {}",
                                other.describe()
                            )));
                        }
                    }
                }
                other => {
                    return Err(invalid(format!(
                        "line {line}: expected string, found {}",
                        other.describe()
                    )));
                }
            }
        }
        Ok(items)
    }
}
