//! Label selectors.
//!
//! Selectors are boolean predicates over a label set, written in the policy selector syntax:
//!
//! ```text
//! all()                      global()
//! has(key)                   !has(key)
//! key == "value"             key != "value"
//! key in {"a", "b"}          key not in {"a", "b"}
//! key contains "s"           key starts with "s"          key ends with "s"
//! !expr                      expr && expr                 expr || expr         (expr)
//! ```
//!
//! Either quote character may be used for values. The empty string is equivalent to `all()`.

use crate::labels::LabelLookup;
use std::{collections::BTreeSet, fmt, str::FromStr};

/// The label every namespaced entity carries. `global()` selects entities without it.
pub const NAMESPACE_LABEL: &str = "projectcalico.org/namespace";

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Selector(Expr);

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Expr {
    All,
    Global,
    Has(String),
    Eq(String, String),
    Ne(String, String),
    In(String, BTreeSet<String>),
    NotIn(String, BTreeSet<String>),
    Contains(String, String),
    StartsWith(String, String),
    EndsWith(String, String),
    Not(Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
}

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    #[error("unexpected end of selector; expected {expected}")]
    UnexpectedEnd { expected: &'static str },

    #[error("unexpected character {ch:?} at offset {offset}")]
    UnexpectedChar { offset: usize, ch: char },

    #[error("unexpected {found:?} at offset {offset}; expected {expected}")]
    UnexpectedToken {
        offset: usize,
        found: String,
        expected: &'static str,
    },

    #[error("unterminated string starting at offset {offset}")]
    UnterminatedString { offset: usize },
}

#[derive(Clone, Debug, PartialEq, Eq)]
enum Token {
    LParen,
    RParen,
    LBrace,
    RBrace,
    Comma,
    Bang,
    And,
    Or,
    EqEq,
    NotEq,
    Word(String),
    Str(String),
}

// === impl Selector ===

impl Selector {
    pub fn all() -> Self {
        Self(Expr::All)
    }

    pub fn parse(s: &str) -> Result<Self, ParseError> {
        s.parse()
    }

    pub fn matches<L: LabelLookup + ?Sized>(&self, labels: &L) -> bool {
        self.0.matches(labels)
    }

    /// Rewrites every label key in the selector by prepending `prefix`.
    ///
    /// Used to evaluate a namespace selector against the namespace labels that are applied to
    /// endpoints through their namespace profile.
    pub fn with_key_prefix(&self, prefix: &str) -> Self {
        Self(self.0.with_key_prefix(prefix))
    }
}

impl FromStr for Selector {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let tokens = tokenize(s)?;
        if tokens.is_empty() {
            return Ok(Self::all());
        }
        let mut parser = Parser {
            tokens: &tokens,
            pos: 0,
        };
        let expr = parser.parse_or()?;
        if let Some((offset, tok)) = parser.peek() {
            return Err(ParseError::UnexpectedToken {
                offset: *offset,
                found: tok.to_string(),
                expected: "'&&', '||' or end of selector",
            });
        }
        Ok(Self(expr))
    }
}

impl fmt::Display for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

// === impl Expr ===

impl Expr {
    fn matches<L: LabelLookup + ?Sized>(&self, labels: &L) -> bool {
        match self {
            Self::All => true,
            Self::Global => labels.get_label(NAMESPACE_LABEL).is_none(),
            Self::Has(k) => labels.get_label(k).is_some(),
            Self::Eq(k, v) => labels.get_label(k) == Some(v.as_str()),
            Self::Ne(k, v) => labels.get_label(k) != Some(v.as_str()),
            Self::In(k, vs) => labels.get_label(k).is_some_and(|v| vs.contains(v)),
            Self::NotIn(k, vs) => !labels.get_label(k).is_some_and(|v| vs.contains(v)),
            Self::Contains(k, s) => labels.get_label(k).is_some_and(|v| v.contains(s.as_str())),
            Self::StartsWith(k, s) => labels
                .get_label(k)
                .is_some_and(|v| v.starts_with(s.as_str())),
            Self::EndsWith(k, s) => labels.get_label(k).is_some_and(|v| v.ends_with(s.as_str())),
            Self::Not(e) => !e.matches(labels),
            Self::And(a, b) => a.matches(labels) && b.matches(labels),
            Self::Or(a, b) => a.matches(labels) || b.matches(labels),
        }
    }

    fn with_key_prefix(&self, prefix: &str) -> Self {
        let p = |k: &String| format!("{prefix}{k}");
        match self {
            Self::All => Self::All,
            Self::Global => Self::Global,
            Self::Has(k) => Self::Has(p(k)),
            Self::Eq(k, v) => Self::Eq(p(k), v.clone()),
            Self::Ne(k, v) => Self::Ne(p(k), v.clone()),
            Self::In(k, vs) => Self::In(p(k), vs.clone()),
            Self::NotIn(k, vs) => Self::NotIn(p(k), vs.clone()),
            Self::Contains(k, v) => Self::Contains(p(k), v.clone()),
            Self::StartsWith(k, v) => Self::StartsWith(p(k), v.clone()),
            Self::EndsWith(k, v) => Self::EndsWith(p(k), v.clone()),
            Self::Not(e) => Self::Not(Box::new(e.with_key_prefix(prefix))),
            Self::And(a, b) => Self::And(
                Box::new(a.with_key_prefix(prefix)),
                Box::new(b.with_key_prefix(prefix)),
            ),
            Self::Or(a, b) => Self::Or(
                Box::new(a.with_key_prefix(prefix)),
                Box::new(b.with_key_prefix(prefix)),
            ),
        }
    }

    fn is_binary(&self) -> bool {
        matches!(self, Self::And(..) | Self::Or(..))
    }
}

impl fmt::Display for Expr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn set(f: &mut fmt::Formatter<'_>, vs: &BTreeSet<String>) -> fmt::Result {
            f.write_str("{")?;
            for (i, v) in vs.iter().enumerate() {
                if i > 0 {
                    f.write_str(", ")?;
                }
                write!(f, "{}", Quoted(v))?;
            }
            f.write_str("}")
        }

        match self {
            Self::All => f.write_str("all()"),
            Self::Global => f.write_str("global()"),
            Self::Has(k) => write!(f, "has({k})"),
            Self::Eq(k, v) => write!(f, "{k} == {}", Quoted(v)),
            Self::Ne(k, v) => write!(f, "{k} != {}", Quoted(v)),
            Self::In(k, vs) => {
                write!(f, "{k} in ")?;
                set(f, vs)
            }
            Self::NotIn(k, vs) => {
                write!(f, "{k} not in ")?;
                set(f, vs)
            }
            Self::Contains(k, v) => write!(f, "{k} contains {}", Quoted(v)),
            Self::StartsWith(k, v) => write!(f, "{k} starts with {}", Quoted(v)),
            Self::EndsWith(k, v) => write!(f, "{k} ends with {}", Quoted(v)),
            Self::Not(e) if e.is_binary() => write!(f, "!({e})"),
            Self::Not(e) => write!(f, "!{e}"),
            Self::And(a, b) => {
                for (i, e) in [a, b].into_iter().enumerate() {
                    if i > 0 {
                        f.write_str(" && ")?;
                    }
                    if matches!(**e, Self::Or(..)) {
                        write!(f, "({e})")?;
                    } else {
                        write!(f, "{e}")?;
                    }
                }
                Ok(())
            }
            Self::Or(a, b) => write!(f, "{a} || {b}"),
        }
    }
}

struct Quoted<'a>(&'a str);

impl fmt::Display for Quoted<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.contains('"') {
            write!(f, "'{}'", self.0)
        } else {
            write!(f, "\"{}\"", self.0)
        }
    }
}

// === Tokenizer ===

fn is_word_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '/' | '-')
}

fn tokenize(s: &str) -> Result<Vec<(usize, Token)>, ParseError> {
    let mut tokens = Vec::new();
    let mut chars = s.char_indices().peekable();
    while let Some((offset, c)) = chars.next() {
        let tok = match c {
            c if c.is_whitespace() => continue,
            '(' => Token::LParen,
            ')' => Token::RParen,
            '{' => Token::LBrace,
            '}' => Token::RBrace,
            ',' => Token::Comma,
            '!' => {
                if chars.next_if(|(_, c)| *c == '=').is_some() {
                    Token::NotEq
                } else {
                    Token::Bang
                }
            }
            '=' => match chars.next() {
                Some((_, '=')) => Token::EqEq,
                _ => return Err(ParseError::UnexpectedChar { offset, ch: c }),
            },
            '&' => match chars.next() {
                Some((_, '&')) => Token::And,
                _ => return Err(ParseError::UnexpectedChar { offset, ch: c }),
            },
            '|' => match chars.next() {
                Some((_, '|')) => Token::Or,
                _ => return Err(ParseError::UnexpectedChar { offset, ch: c }),
            },
            '"' | '\'' => {
                let mut value = String::new();
                loop {
                    match chars.next() {
                        Some((_, q)) if q == c => break,
                        Some((_, ch)) => value.push(ch),
                        None => return Err(ParseError::UnterminatedString { offset }),
                    }
                }
                Token::Str(value)
            }
            c if is_word_char(c) => {
                let mut word = c.to_string();
                while let Some((_, ch)) = chars.next_if(|(_, ch)| is_word_char(*ch)) {
                    word.push(ch);
                }
                Token::Word(word)
            }
            ch => return Err(ParseError::UnexpectedChar { offset, ch }),
        };
        tokens.push((offset, tok));
    }
    Ok(tokens)
}

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LParen => f.write_str("("),
            Self::RParen => f.write_str(")"),
            Self::LBrace => f.write_str("{"),
            Self::RBrace => f.write_str("}"),
            Self::Comma => f.write_str(","),
            Self::Bang => f.write_str("!"),
            Self::And => f.write_str("&&"),
            Self::Or => f.write_str("||"),
            Self::EqEq => f.write_str("=="),
            Self::NotEq => f.write_str("!="),
            Self::Word(w) => f.write_str(w),
            Self::Str(s) => write!(f, "{}", Quoted(s)),
        }
    }
}

// === Parser ===

struct Parser<'t> {
    tokens: &'t [(usize, Token)],
    pos: usize,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&(usize, Token)> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self, expected: &'static str) -> Result<&(usize, Token), ParseError> {
        let tok = self
            .tokens
            .get(self.pos)
            .ok_or(ParseError::UnexpectedEnd { expected })?;
        self.pos += 1;
        Ok(tok)
    }

    fn eat(&mut self, tok: &Token) -> bool {
        if self.peek().map(|(_, t)| t) == Some(tok) {
            self.pos += 1;
            return true;
        }
        false
    }

    fn expect(&mut self, tok: Token, expected: &'static str) -> Result<(), ParseError> {
        let (offset, found) = self.next(expected)?;
        if *found != tok {
            return Err(ParseError::UnexpectedToken {
                offset: *offset,
                found: found.to_string(),
                expected,
            });
        }
        Ok(())
    }

    fn expect_word(&mut self, word: &str, expected: &'static str) -> Result<(), ParseError> {
        self.expect(Token::Word(word.to_string()), expected)
    }

    fn string(&mut self) -> Result<String, ParseError> {
        const EXPECTED: &str = "a quoted value";
        match self.next(EXPECTED)? {
            (_, Token::Str(s)) => Ok(s.clone()),
            (offset, tok) => Err(ParseError::UnexpectedToken {
                offset: *offset,
                found: tok.to_string(),
                expected: EXPECTED,
            }),
        }
    }

    fn set(&mut self) -> Result<BTreeSet<String>, ParseError> {
        self.expect(Token::LBrace, "'{'")?;
        let mut values = BTreeSet::new();
        if self.eat(&Token::RBrace) {
            return Ok(values);
        }
        loop {
            values.insert(self.string()?);
            if self.eat(&Token::RBrace) {
                return Ok(values);
            }
            self.expect(Token::Comma, "',' or '}'")?;
        }
    }

    fn parse_or(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_and()?;
        while self.eat(&Token::Or) {
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, ParseError> {
        let mut lhs = self.parse_unary()?;
        while self.eat(&Token::And) {
            let rhs = self.parse_unary()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_unary(&mut self) -> Result<Expr, ParseError> {
        if self.eat(&Token::Bang) {
            return Ok(Expr::Not(Box::new(self.parse_unary()?)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, ParseError> {
        const EXPECTED: &str = "a label expression";
        let (offset, tok) = self.next(EXPECTED)?.clone();
        let word = match tok {
            Token::LParen => {
                let e = self.parse_or()?;
                self.expect(Token::RParen, "')'")?;
                return Ok(e);
            }
            Token::Word(w) => w,
            tok => {
                return Err(ParseError::UnexpectedToken {
                    offset,
                    found: tok.to_string(),
                    expected: EXPECTED,
                })
            }
        };

        // Function-style terms. A label may share a name with a function, so only treat the word as
        // a function when it is followed by '('.
        if matches!(self.peek(), Some((_, Token::LParen))) {
            match word.as_str() {
                "all" => {
                    self.pos += 1;
                    self.expect(Token::RParen, "')'")?;
                    return Ok(Expr::All);
                }
                "global" => {
                    self.pos += 1;
                    self.expect(Token::RParen, "')'")?;
                    return Ok(Expr::Global);
                }
                "has" => {
                    self.pos += 1;
                    let key = match self.next("a label key")? {
                        (_, Token::Word(k)) => k.clone(),
                        (offset, tok) => {
                            return Err(ParseError::UnexpectedToken {
                                offset: *offset,
                                found: tok.to_string(),
                                expected: "a label key",
                            })
                        }
                    };
                    self.expect(Token::RParen, "')'")?;
                    return Ok(Expr::Has(key));
                }
                _ => {}
            }
        }

        const OPERATOR: &str = "an operator";
        let (offset, op) = self.next(OPERATOR)?.clone();
        let expr = match op {
            Token::EqEq => Expr::Eq(word, self.string()?),
            Token::NotEq => Expr::Ne(word, self.string()?),
            Token::Word(op) => match op.as_str() {
                "in" => Expr::In(word, self.set()?),
                "not" => {
                    self.expect_word("in", "'in'")?;
                    Expr::NotIn(word, self.set()?)
                }
                "contains" => Expr::Contains(word, self.string()?),
                "starts" => {
                    self.expect_word("with", "'with'")?;
                    Expr::StartsWith(word, self.string()?)
                }
                "ends" => {
                    self.expect_word("with", "'with'")?;
                    Expr::EndsWith(word, self.string()?)
                }
                _ => {
                    return Err(ParseError::UnexpectedToken {
                        offset,
                        found: op,
                        expected: OPERATOR,
                    })
                }
            },
            tok => {
                return Err(ParseError::UnexpectedToken {
                    offset,
                    found: tok.to_string(),
                    expected: OPERATOR,
                })
            }
        };
        Ok(expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::Labels;

    fn labels(pairs: &[(&'static str, &'static str)]) -> Labels {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_matches() {
        let web = labels(&[("app", "web"), ("tier", "frontend"), ("version", "v1.2")]);
        for (selector, matches) in [
            ("", true),
            ("all()", true),
            ("global()", true),
            ("has(app)", true),
            ("!has(app)", false),
            ("has(db)", false),
            ("app == 'web'", true),
            ("app == \"db\"", false),
            ("app != 'db'", true),
            ("missing != 'db'", true),
            ("app in {'web', 'db'}", true),
            ("app in {}", false),
            ("app not in {'db'}", true),
            ("missing not in {'db'}", true),
            ("version contains '1.'", true),
            ("version starts with 'v1'", true),
            ("version ends with '.3'", false),
            ("app == 'web' && tier == 'backend'", false),
            ("app == 'web' || tier == 'backend'", true),
            ("!(app == 'web' && tier == 'frontend')", false),
            ("app == 'db' || app == 'x' && tier == 'frontend'", false),
            ("(app == 'db' || app == 'web') && tier == 'frontend'", true),
        ] {
            let sel = Selector::parse(selector).expect(selector);
            assert_eq!(sel.matches(&web), matches, "{selector}");
        }
    }

    #[test]
    fn global_excludes_namespaced_entities() {
        let sel = Selector::parse("global()").unwrap();
        assert!(!sel.matches(&labels(&[(NAMESPACE_LABEL, "ns-0")])));
    }

    #[test]
    fn parse_errors() {
        for (selector, expected) in [
            (
                "app ==",
                ParseError::UnexpectedEnd {
                    expected: "a quoted value",
                },
            ),
            ("app = 'web'", ParseError::UnexpectedChar { offset: 4, ch: '=' }),
            ("app == 'web", ParseError::UnterminatedString { offset: 7 }),
            (
                "app == 'web' tier",
                ParseError::UnexpectedToken {
                    offset: 13,
                    found: "tier".to_string(),
                    expected: "'&&', '||' or end of selector",
                },
            ),
            (
                "app is 'web'",
                ParseError::UnexpectedToken {
                    offset: 4,
                    found: "is".to_string(),
                    expected: "an operator",
                },
            ),
        ] {
            assert_eq!(Selector::parse(selector), Err(expected), "{selector}");
        }
    }

    #[test]
    fn display_round_trips_precedence() {
        for selector in [
            "(a == \"1\" || b == \"2\") && c == \"3\"",
            "!(a == \"1\" && b == \"2\")",
            "a in {\"x\", \"y\"} || !has(b)",
            "k starts with 'say \"hi\"'",
        ] {
            let sel = Selector::parse(selector).unwrap();
            let reparsed = Selector::parse(&sel.to_string()).unwrap();
            assert_eq!(sel, reparsed, "{selector} -> {sel}");
        }
    }

    #[test]
    fn key_prefix_rewrites_namespace_selectors() {
        let sel = Selector::parse("env == 'prod' && has(team)")
            .unwrap()
            .with_key_prefix("pcns.");
        assert_eq!(sel.to_string(), "pcns.env == \"prod\" && has(pcns.team)");
        assert!(sel.matches(&labels(&[("pcns.env", "prod"), ("pcns.team", "a")])));
        assert!(!sel.matches(&labels(&[("env", "prod"), ("team", "a")])));
    }
}
