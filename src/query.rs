//! Query-string parsing and offline evaluation.
//!
//! Generated rules carry an opaque Lucene-style query expression. Before a
//! query ever reaches the backend we parse the subset the generator actually
//! emits: `field:value` terms, quoted phrases, `*`/`?` wildcards, AND/OR/NOT
//! and parentheses. Parsing gives us three things: an early syntax check
//! (malformed queries are a generator problem, not a scoring problem), the
//! set of fields a query references (drives schema provisioning), and an AST
//! the in-memory backend can evaluate without a live search cluster.

use serde_json::{Map, Value};
use std::collections::BTreeSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueryError {
    #[error("empty query")]
    Empty,

    #[error("query syntax error: {0}")]
    Syntax(String),
}

/// Parsed query expression.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryAst {
    And(Vec<QueryAst>),
    Or(Vec<QueryAst>),
    Not(Box<QueryAst>),
    /// `field:pattern`, or a bare pattern matched against every field.
    Term {
        field: Option<String>,
        pattern: String,
    },
}

/// Parse a query string into an AST.
pub fn parse(query: &str) -> Result<QueryAst, QueryError> {
    let tokens = tokenize(query)?;
    if tokens.is_empty() {
        return Err(QueryError::Empty);
    }
    let mut parser = Parser { tokens, pos: 0 };
    let ast = parser.expr()?;
    if parser.pos != parser.tokens.len() {
        return Err(QueryError::Syntax(format!(
            "unexpected trailing input at token {}",
            parser.pos + 1
        )));
    }
    Ok(ast)
}

/// All field names the query references, in deterministic order.
pub fn fields(ast: &QueryAst) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_fields(ast, false, &mut out);
    out.into_iter().map(|(f, _)| f).collect()
}

/// Fields referenced with wildcard/substring patterns. These must be
/// provisioned with a pattern-capable type or the rule suffers systematic
/// false negatives unrelated to its logic.
pub fn wildcard_fields(ast: &QueryAst) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    collect_fields(ast, false, &mut out);
    out.into_iter()
        .filter(|(_, wild)| *wild)
        .map(|(f, _)| f)
        .collect()
}

fn collect_fields(ast: &QueryAst, _negated: bool, out: &mut BTreeSet<(String, bool)>) {
    match ast {
        QueryAst::And(items) | QueryAst::Or(items) => {
            for item in items {
                collect_fields(item, _negated, out);
            }
        }
        QueryAst::Not(inner) => collect_fields(inner, true, out),
        QueryAst::Term { field, pattern } => {
            if let Some(f) = field {
                out.insert((f.clone(), has_wildcard(pattern)));
            }
        }
    }
}

fn has_wildcard(pattern: &str) -> bool {
    pattern.contains('*') || pattern.contains('?')
}

/// Evaluate the AST against a flattened document. Values compare
/// case-insensitively; wildcard terms use glob semantics over the whole
/// string value.
pub fn eval(ast: &QueryAst, doc: &Map<String, Value>) -> bool {
    let flat = flatten(doc);
    eval_flat(ast, &flat)
}

fn eval_flat(ast: &QueryAst, flat: &Vec<(String, String)>) -> bool {
    match ast {
        QueryAst::And(items) => items.iter().all(|i| eval_flat(i, flat)),
        QueryAst::Or(items) => items.iter().any(|i| eval_flat(i, flat)),
        QueryAst::Not(inner) => !eval_flat(inner, flat),
        QueryAst::Term { field, pattern } => flat.iter().any(|(name, value)| {
            let field_ok = match field {
                Some(f) => name.eq_ignore_ascii_case(f),
                None => true,
            };
            field_ok && glob_match(pattern, value)
        }),
    }
}

/// Flatten nested JSON objects into dotted paths with stringified leaves.
/// ECS payloads usually arrive pre-flattened (`process.command_line` as a
/// literal key); both shapes end up identical here.
pub fn flatten(doc: &Map<String, Value>) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for (key, value) in doc {
        flatten_value(key, value, &mut out);
    }
    out
}

fn flatten_value(path: &str, value: &Value, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (key, inner) in map {
                flatten_value(&format!("{path}.{key}"), inner, out);
            }
        }
        Value::Array(items) => {
            for inner in items {
                flatten_value(path, inner, out);
            }
        }
        Value::String(s) => out.push((path.to_string(), s.clone())),
        Value::Number(n) => out.push((path.to_string(), n.to_string())),
        Value::Bool(b) => out.push((path.to_string(), b.to_string())),
        Value::Null => {}
    }
}

/// Case-insensitive glob match: `*` matches any run, `?` a single char.
pub fn glob_match(pattern: &str, value: &str) -> bool {
    let pat: Vec<char> = pattern.chars().flat_map(|c| c.to_lowercase()).collect();
    let val: Vec<char> = value.chars().flat_map(|c| c.to_lowercase()).collect();

    // Classic iterative matcher with star backtracking.
    let (mut p, mut v) = (0usize, 0usize);
    let (mut star, mut star_v) = (None::<usize>, 0usize);

    while v < val.len() {
        if p < pat.len() && (pat[p] == '?' || pat[p] == val[v]) {
            p += 1;
            v += 1;
        } else if p < pat.len() && pat[p] == '*' {
            star = Some(p);
            star_v = v;
            p += 1;
        } else if let Some(s) = star {
            p = s + 1;
            star_v += 1;
            v = star_v;
        } else {
            return false;
        }
    }
    while p < pat.len() && pat[p] == '*' {
        p += 1;
    }
    p == pat.len()
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    LParen,
    RParen,
    And,
    Or,
    Not,
    Term { field: Option<String>, pattern: String },
}

fn tokenize(query: &str) -> Result<Vec<Token>, QueryError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = query.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            ' ' | '\t' | '\n' | '\r' => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            _ => {
                let (word, next) = read_word(&chars, i)?;
                i = next;
                tokens.push(match word.as_str() {
                    "AND" | "&&" => Token::And,
                    "OR" | "||" => Token::Or,
                    "NOT" => Token::Not,
                    _ => split_term(&word)?,
                });
            }
        }
    }
    Ok(tokens)
}

/// Read one word: bare chars up to whitespace/paren, honoring quoted
/// sections so `process.command_line:"delete shadows"` is one token.
fn read_word(chars: &[char], start: usize) -> Result<(String, usize), QueryError> {
    let mut word = String::new();
    let mut i = start;
    while i < chars.len() {
        match chars[i] {
            '"' => {
                word.push('"');
                i += 1;
                loop {
                    if i >= chars.len() {
                        return Err(QueryError::Syntax("unterminated quote".into()));
                    }
                    let q = chars[i];
                    word.push(q);
                    i += 1;
                    if q == '"' {
                        break;
                    }
                }
            }
            ' ' | '\t' | '\n' | '\r' | '(' | ')' => break,
            c => {
                word.push(c);
                i += 1;
            }
        }
    }
    Ok((word, i))
}

fn split_term(word: &str) -> Result<Token, QueryError> {
    let (field, raw) = match word.find(':') {
        // `:` inside quotes is part of the value, not a separator
        Some(idx) if !word[..idx].contains('"') => {
            (Some(word[..idx].to_string()), &word[idx + 1..])
        }
        _ => (None, word),
    };

    if let Some(f) = &field {
        if f.is_empty() {
            return Err(QueryError::Syntax(format!("missing field name in '{word}'")));
        }
    }
    let pattern = raw.trim_matches('"').to_string();
    if pattern.is_empty() {
        return Err(QueryError::Syntax(format!("empty value in term '{word}'")));
    }
    Ok(Token::Term { field, pattern })
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn expr(&mut self) -> Result<QueryAst, QueryError> {
        let mut items = vec![self.and_expr()?];
        while matches!(self.peek(), Some(Token::Or)) {
            self.pos += 1;
            items.push(self.and_expr()?);
        }
        Ok(if items.len() == 1 {
            items.pop().unwrap()
        } else {
            QueryAst::Or(items)
        })
    }

    fn and_expr(&mut self) -> Result<QueryAst, QueryError> {
        let mut items = vec![self.unary()?];
        loop {
            match self.peek() {
                Some(Token::And) => {
                    self.pos += 1;
                    items.push(self.unary()?);
                }
                // Adjacent clauses bind as AND (strict default, safer for
                // detection queries than Lucene's default OR).
                Some(Token::LParen) | Some(Token::Not) | Some(Token::Term { .. }) => {
                    items.push(self.unary()?);
                }
                _ => break,
            }
        }
        Ok(if items.len() == 1 {
            items.pop().unwrap()
        } else {
            QueryAst::And(items)
        })
    }

    fn unary(&mut self) -> Result<QueryAst, QueryError> {
        match self.peek() {
            Some(Token::Not) => {
                self.pos += 1;
                Ok(QueryAst::Not(Box::new(self.unary()?)))
            }
            _ => self.primary(),
        }
    }

    fn primary(&mut self) -> Result<QueryAst, QueryError> {
        match self.peek().cloned() {
            Some(Token::LParen) => {
                self.pos += 1;
                let inner = self.expr()?;
                match self.peek() {
                    Some(Token::RParen) => {
                        self.pos += 1;
                        Ok(inner)
                    }
                    _ => Err(QueryError::Syntax("unbalanced parentheses".into())),
                }
            }
            Some(Token::Term { field, pattern }) => {
                self.pos += 1;
                Ok(QueryAst::Term { field, pattern })
            }
            Some(tok) => Err(QueryError::Syntax(format!("unexpected token {tok:?}"))),
            None => Err(QueryError::Syntax("unexpected end of query".into())),
        }
    }
}
