//! Label expressions.
//!
//! Grammar, loosest binding first:
//!
//! ```text
//! expr    := implies ( "<->" implies )*
//! implies := or ( "->" implies )?
//! or      := and ( "||" and )*
//! and     := not ( "&&" not )*
//! not     := "!" not | primary
//! primary := "(" expr ")" | atom
//! atom    := bare-word | "quoted \"word\""
//! ```

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use crate::{Error, Result};

/// A boolean expression over node label atoms.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub enum LabelExpr {
    Atom(String),
    Not(Box<LabelExpr>),
    And(Box<LabelExpr>, Box<LabelExpr>),
    Or(Box<LabelExpr>, Box<LabelExpr>),
    Implies(Box<LabelExpr>, Box<LabelExpr>),
    Iff(Box<LabelExpr>, Box<LabelExpr>),
}

/// Binding strength, tightest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Precedence {
    Atom,
    Not,
    And,
    Or,
    Implies,
    Iff,
}

impl LabelExpr {
    pub fn atom(name: impl Into<String>) -> Self {
        LabelExpr::Atom(name.into())
    }

    pub fn parse(expr: &str) -> Result<Self> {
        let tokens = tokenize(expr)?;
        if tokens.is_empty() {
            return Err(Error::InvalidLabel("empty expression".to_string()));
        }
        let mut parser = Parser { tokens, pos: 0 };
        let parsed = parser.iff()?;
        if let Some(tok) = parser.peek() {
            return Err(Error::InvalidLabel(format!(
                "unexpected {} in '{}'",
                tok, expr
            )));
        }
        Ok(parsed)
    }

    /// Evaluate against the label set of one node.
    pub fn matches(&self, labels: &BTreeSet<String>) -> bool {
        match self {
            LabelExpr::Atom(name) => labels.contains(name),
            LabelExpr::Not(e) => !e.matches(labels),
            LabelExpr::And(a, b) => a.matches(labels) && b.matches(labels),
            LabelExpr::Or(a, b) => a.matches(labels) || b.matches(labels),
            LabelExpr::Implies(a, b) => !a.matches(labels) || b.matches(labels),
            LabelExpr::Iff(a, b) => a.matches(labels) == b.matches(labels),
        }
    }

    pub fn is_atom(&self) -> bool {
        matches!(self, LabelExpr::Atom(_))
    }

    /// Every atom the expression mentions.
    pub fn atoms(&self) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        self.collect_atoms(&mut out);
        out
    }

    fn collect_atoms(&self, out: &mut BTreeSet<String>) {
        match self {
            LabelExpr::Atom(name) => {
                out.insert(name.clone());
            }
            LabelExpr::Not(e) => e.collect_atoms(out),
            LabelExpr::And(a, b)
            | LabelExpr::Or(a, b)
            | LabelExpr::Implies(a, b)
            | LabelExpr::Iff(a, b) => {
                a.collect_atoms(out);
                b.collect_atoms(out);
            }
        }
    }

    fn precedence(&self) -> Precedence {
        match self {
            LabelExpr::Atom(_) => Precedence::Atom,
            LabelExpr::Not(_) => Precedence::Not,
            LabelExpr::And(..) => Precedence::And,
            LabelExpr::Or(..) => Precedence::Or,
            LabelExpr::Implies(..) => Precedence::Implies,
            LabelExpr::Iff(..) => Precedence::Iff,
        }
    }

    fn fmt_operand(&self, op: Precedence, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if op < self.precedence() {
            write!(f, "({})", self)
        } else {
            write!(f, "{}", self)
        }
    }
}

impl fmt::Display for LabelExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (op, a, b, sym) = match self {
            LabelExpr::Atom(name) => return f.write_str(&escape(name)),
            LabelExpr::Not(e) => {
                f.write_str("!")?;
                // `!!a` would be fine, but `!a&&b` must keep its parens.
                return e.fmt_operand(Precedence::Not, f);
            }
            LabelExpr::And(a, b) => (Precedence::And, a, b, "&&"),
            LabelExpr::Or(a, b) => (Precedence::Or, a, b, "||"),
            LabelExpr::Implies(a, b) => (Precedence::Implies, a, b, "->"),
            LabelExpr::Iff(a, b) => (Precedence::Iff, a, b, "<->"),
        };
        a.fmt_operand(op, f)?;
        f.write_str(sym)?;
        b.fmt_operand(op, f)
    }
}

impl FromStr for LabelExpr {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LabelExpr::parse(s)
    }
}

impl From<LabelExpr> for String {
    fn from(expr: LabelExpr) -> Self {
        expr.to_string()
    }
}

impl TryFrom<String> for LabelExpr {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        LabelExpr::parse(&s)
    }
}

/// Quote an atom when it would not survive re-parsing as a bare word.
pub fn escape(atom: &str) -> String {
    let bare = !atom.is_empty()
        && !atom.contains("->")
        && atom
            .chars()
            .all(|c| !c.is_whitespace() && !matches!(c, '!' | '&' | '|' | '(' | ')' | '"' | '<'));
    if bare {
        atom.to_string()
    } else {
        format!("\"{}\"", atom.replace('\\', "\\\\").replace('"', "\\\""))
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Atom(String),
    Not,
    And,
    Or,
    Implies,
    Iff,
    Open,
    Close,
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Token::Atom(a) => write!(f, "'{}'", a),
            Token::Not => f.write_str("'!'"),
            Token::And => f.write_str("'&&'"),
            Token::Or => f.write_str("'||'"),
            Token::Implies => f.write_str("'->'"),
            Token::Iff => f.write_str("'<->'"),
            Token::Open => f.write_str("'('"),
            Token::Close => f.write_str("')'"),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = input.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::Open);
                i += 1;
            }
            ')' => {
                tokens.push(Token::Close);
                i += 1;
            }
            '!' => {
                tokens.push(Token::Not);
                i += 1;
            }
            '&' if next == Some('&') => {
                tokens.push(Token::And);
                i += 2;
            }
            '|' if next == Some('|') => {
                tokens.push(Token::Or);
                i += 2;
            }
            '-' if next == Some('>') => {
                tokens.push(Token::Implies);
                i += 2;
            }
            '<' if next == Some('-') && chars.get(i + 2) == Some(&'>') => {
                tokens.push(Token::Iff);
                i += 3;
            }
            '"' => {
                let mut atom = String::new();
                i += 1;
                loop {
                    match chars.get(i) {
                        None => {
                            return Err(Error::InvalidLabel(format!(
                                "unterminated quote in '{}'",
                                input
                            )));
                        }
                        Some('"') => {
                            i += 1;
                            break;
                        }
                        Some('\\') if i + 1 < chars.len() => {
                            atom.push(chars[i + 1]);
                            i += 2;
                        }
                        Some(ch) => {
                            atom.push(*ch);
                            i += 1;
                        }
                    }
                }
                tokens.push(Token::Atom(atom));
            }
            '&' | '|' | '<' => {
                return Err(Error::InvalidLabel(format!(
                    "stray '{}' in '{}'",
                    c, input
                )));
            }
            _ => {
                let start = i;
                while i < chars.len() {
                    let ch = chars[i];
                    if ch.is_whitespace() || matches!(ch, '(' | ')' | '!' | '&' | '|' | '"' | '<')
                    {
                        break;
                    }
                    if ch == '-' && chars.get(i + 1) == Some(&'>') {
                        break;
                    }
                    i += 1;
                }
                tokens.push(Token::Atom(chars[start..i].iter().collect()));
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<Token>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek() == Some(tok) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn iff(&mut self) -> Result<LabelExpr> {
        let mut lhs = self.implies()?;
        while self.eat(&Token::Iff) {
            let rhs = self.implies()?;
            lhs = LabelExpr::Iff(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn implies(&mut self) -> Result<LabelExpr> {
        let lhs = self.or()?;
        if self.eat(&Token::Implies) {
            let rhs = self.implies()?;
            return Ok(LabelExpr::Implies(Box::new(lhs), Box::new(rhs)));
        }
        Ok(lhs)
    }

    fn or(&mut self) -> Result<LabelExpr> {
        let mut lhs = self.and()?;
        while self.eat(&Token::Or) {
            let rhs = self.and()?;
            lhs = LabelExpr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn and(&mut self) -> Result<LabelExpr> {
        let mut lhs = self.not()?;
        while self.eat(&Token::And) {
            let rhs = self.not()?;
            lhs = LabelExpr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn not(&mut self) -> Result<LabelExpr> {
        if self.eat(&Token::Not) {
            return Ok(LabelExpr::Not(Box::new(self.not()?)));
        }
        self.primary()
    }

    fn primary(&mut self) -> Result<LabelExpr> {
        match self.tokens.get(self.pos).cloned() {
            Some(Token::Open) => {
                self.pos += 1;
                let inner = self.iff()?;
                if !self.eat(&Token::Close) {
                    return Err(Error::InvalidLabel("missing ')'".to_string()));
                }
                Ok(inner)
            }
            Some(Token::Atom(name)) => {
                self.pos += 1;
                Ok(LabelExpr::Atom(name))
            }
            Some(tok) => Err(Error::InvalidLabel(format!("unexpected {}", tok))),
            None => Err(Error::InvalidLabel("unexpected end of expression".to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_parse_atom_with_dashes() {
        let expr = LabelExpr::parse("linux-x86_64").unwrap();
        assert_eq!(expr, LabelExpr::atom("linux-x86_64"));
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        let expr = LabelExpr::parse("a || b && c").unwrap();
        assert!(expr.matches(&labels(&["a"])));
        assert!(expr.matches(&labels(&["b", "c"])));
        assert!(!expr.matches(&labels(&["b"])));
        assert_eq!(expr.to_string(), "a||b&&c");
    }

    #[test]
    fn test_not_and_parens() {
        let expr = LabelExpr::parse("linux && !(docker || arm)").unwrap();
        assert!(expr.matches(&labels(&["linux"])));
        assert!(!expr.matches(&labels(&["linux", "arm"])));
        assert!(!expr.matches(&labels(&["windows"])));
        assert_eq!(expr.to_string(), "linux&&!(docker||arm)");
    }

    #[test]
    fn test_implies_and_iff() {
        let implies = LabelExpr::parse("gpu->cuda").unwrap();
        assert!(implies.matches(&labels(&["linux"])));
        assert!(implies.matches(&labels(&["gpu", "cuda"])));
        assert!(!implies.matches(&labels(&["gpu"])));

        let iff = LabelExpr::parse("a <-> b").unwrap();
        assert!(iff.matches(&labels(&[])));
        assert!(iff.matches(&labels(&["a", "b"])));
        assert!(!iff.matches(&labels(&["a"])));
    }

    #[test]
    fn test_quoted_atoms() {
        let expr = LabelExpr::parse("\"build farm\" && x").unwrap();
        assert!(expr.matches(&labels(&["build farm", "x"])));
        assert_eq!(expr.to_string(), "\"build farm\"&&x");
        assert_eq!(LabelExpr::parse(&expr.to_string()).unwrap(), expr);
    }

    #[test]
    fn test_rejects_malformed() {
        assert!(LabelExpr::parse("").is_err());
        assert!(LabelExpr::parse("a &&").is_err());
        assert!(LabelExpr::parse("(a || b").is_err());
        assert!(LabelExpr::parse("a b").is_err());
        assert!(LabelExpr::parse("a & b").is_err());
        assert!(LabelExpr::parse("\"open").is_err());
    }

    #[test]
    fn test_atoms_collected() {
        let expr = LabelExpr::parse("a && (b || !c)").unwrap();
        assert_eq!(expr.atoms(), labels(&["a", "b", "c"]));
    }
}
