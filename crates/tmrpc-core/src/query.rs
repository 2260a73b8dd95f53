//! Event filter expressions: `tm.event = 'Tx' AND tx.height > 5`.
//!
//! Grammar:
//! ```text
//! query     := condition ("AND" condition)*
//! condition := key op operand | key "EXISTS"
//! op        := "=" | "<" | "<=" | ">" | ">=" | "CONTAINS"
//! operand   := 'single quoted string' | number
//! ```
//!
//! A parsed [`Query`] renders back to one canonical string, which the
//! subscription registry uses as its key.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use crate::error::RpcError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Lt,
    Le,
    Gt,
    Ge,
    Contains,
    Exists,
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Eq => "=",
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Contains => "CONTAINS",
            Self::Exists => "EXISTS",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Operand {
    Str(String),
    /// Numeric literal, kept with its source spelling for rendering.
    Num { literal: String, value: f64 },
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Num { literal, .. } => f.write_str(literal),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Condition {
    pub key: String,
    pub op: Operator,
    /// `None` only for `EXISTS`.
    pub operand: Option<Operand>,
}

impl Condition {
    fn matches_value(&self, value: &str) -> bool {
        let Some(operand) = &self.operand else {
            return true;
        };
        match (self.op, operand) {
            (Operator::Contains, Operand::Str(s)) => value.contains(s.as_str()),
            (Operator::Contains, Operand::Num { literal, .. }) => value.contains(literal.as_str()),
            (op, Operand::Num { value: rhs, .. }) => match value.parse::<f64>() {
                Ok(lhs) => compare(op, lhs.partial_cmp(rhs)),
                Err(_) => false,
            },
            (op, Operand::Str(rhs)) => compare(op, Some(value.cmp(rhs.as_str()))),
        }
    }
}

fn compare(op: Operator, ord: Option<std::cmp::Ordering>) -> bool {
    use std::cmp::Ordering::*;
    match (op, ord) {
        (_, None) => false,
        (Operator::Eq, Some(o)) => o == Equal,
        (Operator::Lt, Some(o)) => o == Less,
        (Operator::Le, Some(o)) => o != Greater,
        (Operator::Gt, Some(o)) => o == Greater,
        (Operator::Ge, Some(o)) => o != Less,
        (Operator::Contains | Operator::Exists, _) => false,
    }
}

impl fmt::Display for Condition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.operand {
            Some(operand) => write!(f, "{} {} {}", self.key, self.op, operand),
            None => write!(f, "{} {}", self.key, self.op),
        }
    }
}

/// A parsed event filter.
#[derive(Debug, Clone, PartialEq)]
pub struct Query {
    conditions: Vec<Condition>,
}

impl Query {
    pub fn parse(input: &str) -> Result<Self, RpcError> {
        let invalid = |reason: String| RpcError::InvalidQuery {
            query: input.to_string(),
            reason,
        };

        let tokens = tokenize(input).map_err(invalid)?;
        let mut iter = tokens.into_iter();
        let mut conditions = Vec::new();

        loop {
            let key = match iter.next() {
                Some(Token::Word(w)) if !is_keyword(&w) => w,
                Some(t) => return Err(invalid(format!("expected key, found {t}"))),
                None => return Err(invalid("expected key, found end of input".into())),
            };

            let op = match iter.next() {
                Some(Token::Op(op)) => op,
                Some(Token::Word(w)) if w == "CONTAINS" => Operator::Contains,
                Some(Token::Word(w)) if w == "EXISTS" => Operator::Exists,
                Some(t) => return Err(invalid(format!("expected operator after {key}, found {t}"))),
                None => return Err(invalid(format!("expected operator after {key}"))),
            };

            let operand = if op == Operator::Exists {
                None
            } else {
                match iter.next() {
                    Some(Token::Str(s)) => Some(Operand::Str(s)),
                    Some(Token::Num(literal)) => {
                        let value = literal
                            .parse::<f64>()
                            .map_err(|_| invalid(format!("bad number {literal}")))?;
                        Some(Operand::Num { literal, value })
                    }
                    Some(t) => return Err(invalid(format!("expected operand, found {t}"))),
                    None => return Err(invalid(format!("expected operand after {key} {op}"))),
                }
            };

            conditions.push(Condition { key, op, operand });

            match iter.next() {
                None => break,
                Some(Token::Word(w)) if w == "AND" => continue,
                Some(t) => return Err(invalid(format!("expected AND, found {t}"))),
            }
        }

        Ok(Self { conditions })
    }

    pub fn conditions(&self) -> &[Condition] {
        &self.conditions
    }

    /// Canonical rendering; equal queries render identically.
    pub fn canonical(&self) -> String {
        self.to_string()
    }

    /// Does an event with these attributes satisfy every condition?
    pub fn matches(&self, events: &HashMap<String, Vec<String>>) -> bool {
        self.conditions.iter().all(|cond| match events.get(&cond.key) {
            Some(values) => values.iter().any(|v| cond.matches_value(v)),
            None => false,
        })
    }
}

impl FromStr for Query {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for Query {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, cond) in self.conditions.iter().enumerate() {
            if i > 0 {
                f.write_str(" AND ")?;
            }
            write!(f, "{cond}")?;
        }
        Ok(())
    }
}

// ─── Lexer ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Word(String),
    Op(Operator),
    Str(String),
    Num(String),
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Word(w) => write!(f, "{w:?}"),
            Self::Op(op) => write!(f, "{op:?}"),
            Self::Str(s) => write!(f, "'{s}'"),
            Self::Num(n) => f.write_str(n),
        }
    }
}

fn is_keyword(word: &str) -> bool {
    matches!(word, "AND" | "CONTAINS" | "EXISTS")
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

fn tokenize(input: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut chars = input.char_indices().peekable();

    while let Some(&(pos, c)) = chars.peek() {
        match c {
            c if c.is_whitespace() => {
                chars.next();
            }
            '\'' => {
                chars.next();
                let mut s = String::new();
                loop {
                    match chars.next() {
                        Some((_, '\'')) => break,
                        Some((_, ch)) => s.push(ch),
                        None => return Err(format!("unterminated string at {pos}")),
                    }
                }
                tokens.push(Token::Str(s));
            }
            '=' => {
                chars.next();
                tokens.push(Token::Op(Operator::Eq));
            }
            '<' | '>' => {
                chars.next();
                let or_equal = matches!(chars.peek(), Some((_, '=')));
                if or_equal {
                    chars.next();
                }
                let op = match (c, or_equal) {
                    ('<', false) => Operator::Lt,
                    ('<', true) => Operator::Le,
                    ('>', false) => Operator::Gt,
                    _ => Operator::Ge,
                };
                tokens.push(Token::Op(op));
            }
            c if c.is_ascii_digit() => {
                let mut n = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if ch.is_ascii_digit() || ch == '.' {
                        n.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Num(n));
            }
            c if is_key_char(c) => {
                let mut w = String::new();
                while let Some(&(_, ch)) = chars.peek() {
                    if is_key_char(ch) {
                        w.push(ch);
                        chars.next();
                    } else {
                        break;
                    }
                }
                tokens.push(Token::Word(w));
            }
            other => return Err(format!("unexpected character {other:?} at {pos}")),
        }
    }

    Ok(tokens)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs(pairs: &[(&str, &str)]) -> HashMap<String, Vec<String>> {
        let mut map: HashMap<String, Vec<String>> = HashMap::new();
        for (k, v) in pairs {
            map.entry(k.to_string()).or_default().push(v.to_string());
        }
        map
    }

    #[test]
    fn canonical_form_ignores_spacing() {
        let a = Query::parse("tm.event='CompleteProposal'").unwrap();
        let b = Query::parse("  tm.event =   'CompleteProposal' ").unwrap();
        assert_eq!(a.canonical(), "tm.event = 'CompleteProposal'");
        assert_eq!(a, b);
    }

    #[test]
    fn parse_compound_query() {
        let q = Query::parse("tm.event = 'Tx' AND tx.height >= 5 AND transfer.sender EXISTS").unwrap();
        assert_eq!(q.conditions().len(), 3);
        assert_eq!(q.conditions()[1].op, Operator::Ge);
        assert_eq!(q.conditions()[2].operand, None);
        assert_eq!(
            q.canonical(),
            "tm.event = 'Tx' AND tx.height >= 5 AND transfer.sender EXISTS"
        );
    }

    #[test]
    fn reject_malformed_queries() {
        for bad in ["", "tm.event", "tm.event =", "tm.event = 'x' OR a = 'b'", "a = 'open", "a ! 1"] {
            assert!(
                matches!(Query::parse(bad), Err(RpcError::InvalidQuery { .. })),
                "{bad:?} should be rejected"
            );
        }
    }

    #[test]
    fn match_against_event_attributes() {
        let q = Query::parse("tm.event = 'Tx' AND tx.height > 10").unwrap();
        assert!(q.matches(&attrs(&[("tm.event", "Tx"), ("tx.height", "11")])));
        assert!(!q.matches(&attrs(&[("tm.event", "Tx"), ("tx.height", "10")])));
        assert!(!q.matches(&attrs(&[("tm.event", "NewBlock"), ("tx.height", "11")])));
        assert!(!q.matches(&attrs(&[("tm.event", "Tx")])));
    }

    #[test]
    fn contains_and_exists() {
        let q = Query::parse("message.action CONTAINS 'order' AND message.sender EXISTS").unwrap();
        assert!(q.matches(&attrs(&[("message.action", "cancel_order"), ("message.sender", "x")])));
        assert!(q.matches(&attrs(&[("message.action", "neworder"), ("message.sender", "")])));
        assert!(!q.matches(&attrs(&[("message.action", "send"), ("message.sender", "x")])));
    }

    #[test]
    fn any_value_of_a_multi_valued_key_can_match() {
        let q = Query::parse("transfer.recipient = 'bob'").unwrap();
        assert!(q.matches(&attrs(&[("transfer.recipient", "alice"), ("transfer.recipient", "bob")])));
    }
}
