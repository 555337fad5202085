//! Row filtering with a small boolean expression language.
//!
//! ```text
//! expr  := or
//! or    := and ("or" and)*
//! and   := not ("and" not)*
//! not   := "not" not | cmp
//! cmp   := atom (("==" | "!=" | "<" | "<=" | ">" | ">=") atom)?
//! atom  := "(" expr ")" | column | number | 'string' | "string" | true | false
//! ```
//!
//! Bare words are column names. `True`/`False` are accepted as well as
//! `true`/`false`.

use crate::utils::keys;
use lex_flow::{FlowError, Inputs, Outputs, Result, RunContext, Stage, UObject};
use polars::prelude::*;
use std::collections::BTreeSet;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

impl CmpOp {
    fn symbol(self) -> &'static str {
        match self {
            Self::Eq => "==",
            Self::NotEq => "!=",
            Self::Lt => "<",
            Self::LtEq => "<=",
            Self::Gt => ">",
            Self::GtEq => ">=",
        }
    }
}

/// Parsed query expression.
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Column(String),
    Int(i64),
    Float(f64),
    Str(String),
    Bool(bool),
    Not(Box<Node>),
    And(Box<Node>, Box<Node>),
    Or(Box<Node>, Box<Node>),
    Cmp(CmpOp, Box<Node>, Box<Node>),
}

impl Node {
    fn to_expr(&self) -> Expr {
        match self {
            Self::Column(name) => col(name.as_str()),
            Self::Int(v) => lit(*v),
            Self::Float(v) => lit(*v),
            Self::Str(s) => lit(s.as_str()),
            Self::Bool(b) => lit(*b),
            Self::Not(inner) => inner.to_expr().not(),
            Self::And(a, b) => a.to_expr().and(b.to_expr()),
            Self::Or(a, b) => a.to_expr().or(b.to_expr()),
            Self::Cmp(op, a, b) => {
                let (a, b) = (a.to_expr(), b.to_expr());
                match op {
                    CmpOp::Eq => a.eq(b),
                    CmpOp::NotEq => a.neq(b),
                    CmpOp::Lt => a.lt(b),
                    CmpOp::LtEq => a.lt_eq(b),
                    CmpOp::Gt => a.gt(b),
                    CmpOp::GtEq => a.gt_eq(b),
                }
            }
        }
    }

    fn columns<'a>(&'a self, found: &mut BTreeSet<&'a str>) {
        match self {
            Self::Column(name) => {
                found.insert(name);
            }
            Self::Not(inner) => inner.columns(found),
            Self::And(a, b) | Self::Or(a, b) | Self::Cmp(_, a, b) => {
                a.columns(found);
                b.columns(found);
            }
            Self::Int(_) | Self::Float(_) | Self::Str(_) | Self::Bool(_) => {}
        }
    }
}

/// Fully parenthesized form, used in logs and error messages.
impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Column(name) => write!(f, "{name}"),
            Self::Int(v) => write!(f, "{v}"),
            Self::Float(v) => write!(f, "{v:?}"),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Not(inner) => write!(f, "(not {inner})"),
            Self::And(a, b) => write!(f, "({a} and {b})"),
            Self::Or(a, b) => write!(f, "({a} or {b})"),
            Self::Cmp(op, a, b) => write!(f, "({a} {} {b})", op.symbol()),
        }
    }
}

// =============================================================================
// Lexer
// =============================================================================

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Int(i64),
    Float(f64),
    Str(String),
    Op(CmpOp),
    LParen,
    RParen,
}

fn tokenize(text: &str) -> std::result::Result<Vec<Token>, String> {
    let chars: Vec<char> = text.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&ch| ch == c)
                    .ok_or_else(|| format!("unterminated string at offset {i}"))?;
                tokens.push(Token::Str(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            '=' | '!' | '<' | '>' => {
                let next_is_eq = chars.get(i + 1) == Some(&'=');
                let op = match (c, next_is_eq) {
                    ('=', true) => CmpOp::Eq,
                    ('!', true) => CmpOp::NotEq,
                    ('<', true) => CmpOp::LtEq,
                    ('>', true) => CmpOp::GtEq,
                    ('<', false) => CmpOp::Lt,
                    ('>', false) => CmpOp::Gt,
                    _ => return Err(format!("unexpected '{c}' at offset {i}")),
                };
                tokens.push(Token::Op(op));
                i += if next_is_eq { 2 } else { 1 };
            }
            c if c.is_ascii_digit() || (c == '-' && chars.get(i + 1).is_some_and(char::is_ascii_digit)) => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let literal: String = chars[start..i].iter().collect();
                let token = if literal.contains('.') {
                    literal.parse().map(Token::Float)
                        .map_err(|_| format!("bad number '{literal}'"))?
                } else {
                    literal.parse().map(Token::Int)
                        .map_err(|_| format!("bad number '{literal}'"))?
                };
                tokens.push(token);
            }
            c if c.is_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                tokens.push(Token::Word(chars[start..i].iter().collect()));
            }
            _ => return Err(format!("unexpected '{c}' at offset {i}")),
        }
    }
    Ok(tokens)
}

// =============================================================================
// Parser
// =============================================================================

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let token = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        token
    }

    fn eat_word(&mut self, word: &str) -> bool {
        if matches!(self.peek(), Some(Token::Word(w)) if w == word) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn or(&mut self) -> std::result::Result<Node, String> {
        let mut node = self.and()?;
        while self.eat_word("or") {
            node = Node::Or(Box::new(node), Box::new(self.and()?));
        }
        Ok(node)
    }

    fn and(&mut self) -> std::result::Result<Node, String> {
        let mut node = self.not()?;
        while self.eat_word("and") {
            node = Node::And(Box::new(node), Box::new(self.not()?));
        }
        Ok(node)
    }

    fn not(&mut self) -> std::result::Result<Node, String> {
        if self.eat_word("not") {
            return Ok(Node::Not(Box::new(self.not()?)));
        }
        self.cmp()
    }

    fn cmp(&mut self) -> std::result::Result<Node, String> {
        let left = self.atom()?;
        if let Some(Token::Op(op)) = self.peek() {
            let op = *op;
            self.pos += 1;
            let right = self.atom()?;
            return Ok(Node::Cmp(op, Box::new(left), Box::new(right)));
        }
        Ok(left)
    }

    fn atom(&mut self) -> std::result::Result<Node, String> {
        match self.next() {
            Some(Token::LParen) => {
                let inner = self.or()?;
                match self.next() {
                    Some(Token::RParen) => Ok(inner),
                    _ => Err("missing ')'".to_string()),
                }
            }
            Some(Token::Int(v)) => Ok(Node::Int(v)),
            Some(Token::Float(v)) => Ok(Node::Float(v)),
            Some(Token::Str(s)) => Ok(Node::Str(s)),
            Some(Token::Word(w)) => match w.as_str() {
                "true" | "True" => Ok(Node::Bool(true)),
                "false" | "False" => Ok(Node::Bool(false)),
                "and" | "or" | "not" => Err(format!("unexpected keyword '{w}'")),
                _ => Ok(Node::Column(w)),
            },
            Some(token) => Err(format!("unexpected token {token:?}")),
            None => Err("unexpected end of query".to_string()),
        }
    }
}

/// Parse a query expression.
pub fn parse(text: &str) -> std::result::Result<Node, String> {
    let mut parser = Parser {
        tokens: tokenize(text)?,
        pos: 0,
    };
    let node = parser.or()?;
    if let Some(token) = parser.peek() {
        return Err(format!("unexpected trailing {token:?}"));
    }
    Ok(node)
}

// =============================================================================
// Stage
// =============================================================================

/// Keeps the rows of `in` where the expression holds (`out`) and the rest
/// (`complement`). Rows where the expression is null go to `complement`.
#[derive(Debug, Clone)]
pub struct Query {
    text: String,
    node: Node,
}

impl Query {
    /// Parse `text`; a malformed expression is a configuration error.
    pub fn new(text: impl Into<String>) -> Result<Self> {
        let text = text.into();
        let node = parse(&text)
            .map_err(|e| FlowError::InvalidConfig(format!("Invalid query '{text}': {e}")))?;
        Ok(Self { text, node })
    }

    pub fn node(&self) -> &Node {
        &self.node
    }
}

impl Stage for Query {
    fn input_keys(&self) -> Vec<String> {
        keys(["in"])
    }

    fn output_keys(&self) -> Vec<String> {
        keys(["out", "complement"])
    }

    fn run(
        &self,
        ctx: &RunContext,
        outputs_requested: &BTreeSet<String>,
        mut inputs: Inputs,
    ) -> Result<Outputs> {
        let df = inputs.take("in")?.to_table(ctx.storage())?;

        let mut referenced = BTreeSet::new();
        self.node.columns(&mut referenced);
        if let Some(missing) = referenced
            .iter()
            .find(|name| df.get_column_index(name).is_none())
        {
            return Err(FlowError::stage_failed(
                self.name(),
                format!("query '{}' refers to unknown column '{}'", self.text, missing),
            ));
        }

        let mask = self.node.to_expr().fill_null(lit(false));
        let mut outputs = Outputs::new();
        if outputs_requested.contains("out") {
            let kept = df.clone().lazy().filter(mask.clone()).collect()?;
            outputs.insert("out".to_string(), UObject::table(kept));
        }
        if outputs_requested.contains("complement") {
            let dropped = df.lazy().filter(mask.not()).collect()?;
            outputs.insert("complement".to_string(), UObject::table(dropped));
        }
        Ok(outputs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn canonical(text: &str) -> String {
        parse(text).unwrap().to_string()
    }

    #[test]
    fn test_parse_simple_comparisons() {
        assert_eq!(canonical("id < 10"), "(id < 10)");
        assert_eq!(canonical("name == 'Bruce'"), "(name == 'Bruce')");
        assert_eq!(canonical("ratio >= -0.5"), "(ratio >= -0.5)");
    }

    #[test]
    fn test_parse_precedence() {
        assert_eq!(
            canonical("(id < 10) or (name == 'Bruce' and hired_dt != stop_dt)"),
            "((id < 10) or ((name == 'Bruce') and (hired_dt != stop_dt)))"
        );
        assert_eq!(
            canonical("id >= 5 and not (terminated or not salary < 10000)"),
            "((id >= 5) and (not (terminated or (not (salary < 10000)))))"
        );
    }

    #[test]
    fn test_parse_errors() {
        assert!(parse("id <").is_err());
        assert!(parse("(id < 3").is_err());
        assert!(parse("id < 3 )").is_err());
        assert!(parse("name == 'open").is_err());
        assert!(parse("a = b").is_err());
        assert!(Query::new("and").is_err());
    }
}
