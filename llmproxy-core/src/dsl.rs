//! # Rule Condition Expressions
//!
//! A small boolean expression language evaluated against the user message,
//! used as the `condition` field of routing rules:
//!
//! ```text
//! len(message) > 500 AND NOT contains(message, "翻译")
//! has_code_block(message) OR matches(message, "(?i)stack trace")
//! count(message, "?") >= 3
//! ```
//!
//! Grammar, lowest precedence first: `OR`, `AND`, `NOT`, primary. A primary
//! is a parenthesized expression or a function call, optionally followed by
//! a comparison. `len` and `count` produce integers and must be compared;
//! `contains`, `matches` and `has_code_block` are predicates and must not be.
//! Keywords are case-insensitive. A blank expression evaluates to true.
//!
//! Evaluation is deterministic and side-effect free; errors are only raised
//! for malformed expressions.

use regex::Regex;
use thiserror::Error;

/// Parse or evaluation failure for a condition expression.
#[derive(Error, Debug)]
pub enum DslError {
    #[error("unexpected end of expression")]
    UnexpectedEnd,
    #[error("unexpected input at offset {pos}: {found}")]
    Unexpected { pos: usize, found: String },
    #[error("unknown function: {name}")]
    UnknownFunction { name: String },
    #[error("unknown identifier: {name}")]
    UnknownIdentifier { name: String },
    #[error("function {name} must be followed by a comparison")]
    MissingComparison { name: String },
    #[error("function {name} cannot be compared")]
    UnexpectedComparison { name: String },
    #[error("invalid regex {pattern:?}: {source}")]
    BadRegex {
        pattern: String,
        source: regex::Error,
    },
    #[error("unterminated string literal at offset {pos}")]
    UnterminatedString { pos: usize },
}

/// Comparison operator in a numeric clause.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Gt,
    Lt,
    Ge,
    Le,
    Eq,
    Ne,
}

impl CmpOp {
    fn apply(self, lhs: i64, rhs: i64) -> bool {
        match self {
            CmpOp::Gt => lhs > rhs,
            CmpOp::Lt => lhs < rhs,
            CmpOp::Ge => lhs >= rhs,
            CmpOp::Le => lhs <= rhs,
            CmpOp::Eq => lhs == rhs,
            CmpOp::Ne => lhs != rhs,
        }
    }
}

/// Integer-valued message functions.
#[derive(Debug, Clone)]
enum NumericFn {
    /// `len(message)`: rune count
    Len,
    /// `count(message, "s")`: non-overlapping occurrences
    Count(String),
}

impl NumericFn {
    fn eval(&self, message: &str) -> i64 {
        match self {
            NumericFn::Len => message.chars().count() as i64,
            NumericFn::Count(needle) => {
                if needle.is_empty() {
                    0
                } else {
                    message.matches(needle.as_str()).count() as i64
                }
            }
        }
    }
}

/// Boolean-valued message functions.
#[derive(Debug, Clone)]
enum PredicateFn {
    Contains(String),
    Matches(Regex),
    HasCodeBlock,
}

impl PredicateFn {
    fn eval(&self, message: &str) -> bool {
        match self {
            PredicateFn::Contains(needle) => message.contains(needle.as_str()),
            PredicateFn::Matches(re) => re.is_match(message),
            PredicateFn::HasCodeBlock => message.matches("```").count() >= 2,
        }
    }
}

/// A parsed condition expression.
#[derive(Debug, Clone)]
pub enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Compare {
        func: NumericFnHolder,
        op: CmpOp,
        value: i64,
    },
    Predicate(PredicateFnHolder),
}

// Function payloads are private; wrap them so Expr stays public without
// exposing the internals.
#[derive(Debug, Clone)]
pub struct NumericFnHolder(NumericFn);
#[derive(Debug, Clone)]
pub struct PredicateFnHolder(PredicateFn);

impl Expr {
    /// Evaluate the expression against a message.
    pub fn eval(&self, message: &str) -> bool {
        match self {
            Expr::Or(a, b) => a.eval(message) || b.eval(message),
            Expr::And(a, b) => a.eval(message) && b.eval(message),
            Expr::Not(inner) => !inner.eval(message),
            Expr::Compare { func, op, value } => op.apply(func.0.eval(message), *value),
            Expr::Predicate(p) => p.0.eval(message),
        }
    }
}

/// Parse a condition expression. Returns `None` for blank input.
pub fn parse(input: &str) -> Result<Option<Expr>, DslError> {
    if input.trim().is_empty() {
        return Ok(None);
    }
    let tokens = tokenize(input)?;
    let mut parser = Parser { tokens, pos: 0 };
    let expr = parser.parse_or()?;
    if let Some((pos, tok)) = parser.peek_raw() {
        return Err(DslError::Unexpected {
            pos,
            found: tok.describe(),
        });
    }
    Ok(Some(expr))
}

/// Parse and evaluate in one step. Blank conditions evaluate to true.
pub fn evaluate(input: &str, message: &str) -> Result<bool, DslError> {
    match parse(input)? {
        Some(expr) => Ok(expr.eval(message)),
        None => Ok(true),
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Ident(String),
    Str(String),
    Int(i64),
    LParen,
    RParen,
    Comma,
    Cmp(CmpOp),
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Token::Ident(s) => s.clone(),
            Token::Str(s) => format!("{s:?}"),
            Token::Int(n) => n.to_string(),
            Token::LParen => "(".to_string(),
            Token::RParen => ")".to_string(),
            Token::Comma => ",".to_string(),
            Token::Cmp(_) => "comparison operator".to_string(),
        }
    }
}

fn tokenize(input: &str) -> Result<Vec<(usize, Token)>, DslError> {
    let mut tokens = Vec::new();
    let chars: Vec<(usize, char)> = input.char_indices().collect();
    let mut i = 0;

    while i < chars.len() {
        let (pos, c) = chars[i];
        match c {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((pos, Token::LParen));
                i += 1;
            }
            ')' => {
                tokens.push((pos, Token::RParen));
                i += 1;
            }
            ',' => {
                tokens.push((pos, Token::Comma));
                i += 1;
            }
            '>' | '<' | '=' | '!' => {
                let next_eq = chars.get(i + 1).map(|&(_, n)| n == '=').unwrap_or(false);
                let op = match (c, next_eq) {
                    ('>', true) => CmpOp::Ge,
                    ('>', false) => CmpOp::Gt,
                    ('<', true) => CmpOp::Le,
                    ('<', false) => CmpOp::Lt,
                    ('=', true) => CmpOp::Eq,
                    ('!', true) => CmpOp::Ne,
                    _ => {
                        return Err(DslError::Unexpected {
                            pos,
                            found: c.to_string(),
                        })
                    }
                };
                i += if next_eq { 2 } else { 1 };
                tokens.push((pos, Token::Cmp(op)));
            }
            '"' => {
                let mut value = String::new();
                let mut j = i + 1;
                let mut closed = false;
                while j < chars.len() {
                    let (_, sc) = chars[j];
                    if sc == '\\' {
                        if let Some(&(_, esc)) = chars.get(j + 1) {
                            value.push(esc);
                            j += 2;
                            continue;
                        }
                        break;
                    }
                    if sc == '"' {
                        closed = true;
                        j += 1;
                        break;
                    }
                    value.push(sc);
                    j += 1;
                }
                if !closed {
                    return Err(DslError::UnterminatedString { pos });
                }
                tokens.push((pos, Token::Str(value)));
                i = j;
            }
            c if c.is_ascii_digit() || c == '-' => {
                let mut j = i;
                if c == '-' {
                    j += 1;
                }
                let start = j;
                while j < chars.len() && chars[j].1.is_ascii_digit() {
                    j += 1;
                }
                if start == j {
                    return Err(DslError::Unexpected {
                        pos,
                        found: c.to_string(),
                    });
                }
                let end = chars.get(j).map(|&(p, _)| p).unwrap_or(input.len());
                let value: i64 = input[pos..end].parse().map_err(|_| DslError::Unexpected {
                    pos,
                    found: input[pos..end].to_string(),
                })?;
                tokens.push((pos, Token::Int(value)));
                i = j;
            }
            c if c.is_alphanumeric() || c == '_' => {
                let mut j = i;
                while j < chars.len() && (chars[j].1.is_alphanumeric() || chars[j].1 == '_') {
                    j += 1;
                }
                let end = chars.get(j).map(|&(p, _)| p).unwrap_or(input.len());
                tokens.push((pos, Token::Ident(input[pos..end].to_string())));
                i = j;
            }
            other => {
                return Err(DslError::Unexpected {
                    pos,
                    found: other.to_string(),
                })
            }
        }
    }

    Ok(tokens)
}

struct Parser {
    tokens: Vec<(usize, Token)>,
    pos: usize,
}

impl Parser {
    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos).map(|(_, t)| t)
    }

    fn peek_raw(&self) -> Option<(usize, &Token)> {
        self.tokens.get(self.pos).map(|(p, t)| (*p, t))
    }

    fn next(&mut self) -> Option<(usize, Token)> {
        let tok = self.tokens.get(self.pos).cloned();
        if tok.is_some() {
            self.pos += 1;
        }
        tok
    }

    fn peek_keyword(&self, word: &str) -> bool {
        matches!(self.peek(), Some(Token::Ident(s)) if s.eq_ignore_ascii_case(word))
    }

    fn parse_or(&mut self) -> Result<Expr, DslError> {
        let mut lhs = self.parse_and()?;
        while self.peek_keyword("or") {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Expr::Or(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Expr, DslError> {
        let mut lhs = self.parse_not()?;
        while self.peek_keyword("and") {
            self.next();
            let rhs = self.parse_not()?;
            lhs = Expr::And(Box::new(lhs), Box::new(rhs));
        }
        Ok(lhs)
    }

    fn parse_not(&mut self) -> Result<Expr, DslError> {
        if self.peek_keyword("not") {
            self.next();
            let inner = self.parse_not()?;
            return Ok(Expr::Not(Box::new(inner)));
        }
        self.parse_primary()
    }

    fn parse_primary(&mut self) -> Result<Expr, DslError> {
        match self.next() {
            Some((_, Token::LParen)) => {
                let inner = self.parse_or()?;
                match self.next() {
                    Some((_, Token::RParen)) => Ok(inner),
                    Some((pos, tok)) => Err(DslError::Unexpected {
                        pos,
                        found: tok.describe(),
                    }),
                    None => Err(DslError::UnexpectedEnd),
                }
            }
            Some((pos, Token::Ident(name))) => self.parse_call(pos, &name),
            Some((pos, tok)) => Err(DslError::Unexpected {
                pos,
                found: tok.describe(),
            }),
            None => Err(DslError::UnexpectedEnd),
        }
    }

    fn parse_call(&mut self, pos: usize, name: &str) -> Result<Expr, DslError> {
        let lowered = name.to_ascii_lowercase();
        let known = matches!(
            lowered.as_str(),
            "len" | "count" | "contains" | "matches" | "has_code_block"
        );
        if !known {
            // Bare identifiers are not values in this language.
            if self.peek() != Some(&Token::LParen) {
                return Err(DslError::UnknownIdentifier {
                    name: name.to_string(),
                });
            }
            return Err(DslError::UnknownFunction {
                name: name.to_string(),
            });
        }

        self.expect_lparen(pos)?;
        self.expect_message_arg()?;

        let expr = match lowered.as_str() {
            "len" => {
                self.expect_rparen()?;
                self.finish_numeric("len", NumericFn::Len)?
            }
            "count" => {
                let needle = self.expect_string_arg()?;
                self.expect_rparen()?;
                self.finish_numeric("count", NumericFn::Count(needle))?
            }
            "contains" => {
                let needle = self.expect_string_arg()?;
                self.expect_rparen()?;
                self.finish_predicate("contains", PredicateFn::Contains(needle))?
            }
            "matches" => {
                let pattern = self.expect_string_arg()?;
                self.expect_rparen()?;
                let re = Regex::new(&pattern).map_err(|source| DslError::BadRegex {
                    pattern: pattern.clone(),
                    source,
                })?;
                self.finish_predicate("matches", PredicateFn::Matches(re))?
            }
            "has_code_block" => {
                self.expect_rparen()?;
                self.finish_predicate("has_code_block", PredicateFn::HasCodeBlock)?
            }
            _ => unreachable!(),
        };
        Ok(expr)
    }

    fn finish_numeric(&mut self, name: &str, func: NumericFn) -> Result<Expr, DslError> {
        match self.next() {
            Some((_, Token::Cmp(op))) => match self.next() {
                Some((_, Token::Int(value))) => Ok(Expr::Compare {
                    func: NumericFnHolder(func),
                    op,
                    value,
                }),
                Some((pos, tok)) => Err(DslError::Unexpected {
                    pos,
                    found: tok.describe(),
                }),
                None => Err(DslError::UnexpectedEnd),
            },
            _ => {
                // Step back so callers report the right position; a numeric
                // function on its own has no boolean meaning.
                if self.pos > 0 {
                    self.pos -= 1;
                }
                Err(DslError::MissingComparison {
                    name: name.to_string(),
                })
            }
        }
    }

    fn finish_predicate(&mut self, name: &str, func: PredicateFn) -> Result<Expr, DslError> {
        if matches!(self.peek(), Some(Token::Cmp(_))) {
            return Err(DslError::UnexpectedComparison {
                name: name.to_string(),
            });
        }
        Ok(Expr::Predicate(PredicateFnHolder(func)))
    }

    fn expect_lparen(&mut self, call_pos: usize) -> Result<(), DslError> {
        match self.next() {
            Some((_, Token::LParen)) => Ok(()),
            Some((pos, tok)) => Err(DslError::Unexpected {
                pos,
                found: tok.describe(),
            }),
            None => Err(DslError::Unexpected {
                pos: call_pos,
                found: "missing argument list".to_string(),
            }),
        }
    }

    fn expect_message_arg(&mut self) -> Result<(), DslError> {
        match self.next() {
            Some((_, Token::Ident(s))) if s.eq_ignore_ascii_case("message") => Ok(()),
            Some((pos, tok)) => Err(DslError::Unexpected {
                pos,
                found: tok.describe(),
            }),
            None => Err(DslError::UnexpectedEnd),
        }
    }

    fn expect_string_arg(&mut self) -> Result<String, DslError> {
        match self.next() {
            Some((_, Token::Comma)) => {}
            Some((pos, tok)) => {
                return Err(DslError::Unexpected {
                    pos,
                    found: tok.describe(),
                })
            }
            None => return Err(DslError::UnexpectedEnd),
        }
        match self.next() {
            Some((_, Token::Str(s))) => Ok(s),
            Some((pos, tok)) => Err(DslError::Unexpected {
                pos,
                found: tok.describe(),
            }),
            None => Err(DslError::UnexpectedEnd),
        }
    }

    fn expect_rparen(&mut self) -> Result<(), DslError> {
        match self.next() {
            Some((_, Token::RParen)) => Ok(()),
            Some((pos, tok)) => Err(DslError::Unexpected {
                pos,
                found: tok.describe(),
            }),
            None => Err(DslError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn blank_condition_is_true() {
        assert!(evaluate("", "anything").unwrap());
        assert!(evaluate("   \t ", "anything").unwrap());
    }

    #[test]
    fn len_comparisons() {
        assert!(evaluate("len(message) > 3", "hello").unwrap());
        assert!(!evaluate("len(message) > 10", "hello").unwrap());
        assert!(evaluate("len(message) == 2", "你好").unwrap());
        assert!(evaluate("len(message) <= 5", "hello").unwrap());
        assert!(evaluate("len(message) != 4", "hello").unwrap());
    }

    #[test]
    fn len_counts_runes_not_bytes() {
        // Four CJK chars, twelve UTF-8 bytes.
        assert!(evaluate("len(message) == 4", "微服务架").unwrap());
    }

    #[test]
    fn contains_and_count() {
        assert!(evaluate(r#"contains(message, "micro")"#, "microservice").unwrap());
        assert!(!evaluate(r#"contains(message, "mono")"#, "microservice").unwrap());
        assert!(evaluate(r#"count(message, "?") >= 2"#, "why? how?").unwrap());
        assert!(!evaluate(r#"count(message, "?") > 2"#, "why? how?").unwrap());
    }

    #[test]
    fn matches_and_code_block() {
        assert!(evaluate(r#"matches(message, "^fix")"#, "fix the bug").unwrap());
        assert!(evaluate("has_code_block(message)", "```rust\nfn main(){}\n```").unwrap());
        assert!(!evaluate("has_code_block(message)", "``` only one fence").unwrap());
    }

    #[test]
    fn boolean_operators_and_precedence() {
        // AND binds tighter than OR.
        let expr = r#"contains(message, "a") OR contains(message, "b") AND contains(message, "c")"#;
        assert!(evaluate(expr, "a").unwrap());
        assert!(evaluate(expr, "b c").unwrap());
        assert!(!evaluate(expr, "b").unwrap());

        assert!(evaluate(r#"NOT contains(message, "x")"#, "abc").unwrap());
        assert!(evaluate(r#"(len(message) > 1 AND len(message) < 5)"#, "abc").unwrap());
    }

    #[test]
    fn keywords_are_case_insensitive() {
        assert!(evaluate(r#"contains(message, "a") and not contains(message, "z")"#, "a").unwrap());
        assert!(evaluate(r#"len(message) > 0 Or len(message) < 0"#, "x").unwrap());
    }

    #[test]
    fn malformed_expressions_error() {
        assert!(matches!(
            evaluate("frobnicate(message)", "x"),
            Err(DslError::UnknownFunction { .. })
        ));
        assert!(matches!(
            evaluate("message", "x"),
            Err(DslError::UnknownIdentifier { .. })
        ));
        assert!(matches!(
            evaluate("(len(message) > 1", "x"),
            Err(DslError::UnexpectedEnd)
        ));
        assert!(matches!(
            evaluate("len(message)", "x"),
            Err(DslError::MissingComparison { .. })
        ));
        assert!(matches!(
            evaluate(r#"contains(message, "a") > 3"#, "x"),
            Err(DslError::UnexpectedComparison { .. })
        ));
        assert!(matches!(
            evaluate(r#"matches(message, "[unclosed")"#, "x"),
            Err(DslError::BadRegex { .. })
        ));
        assert!(matches!(
            evaluate(r#"contains(message, "a"#, "x"),
            Err(DslError::UnterminatedString { .. })
        ));
    }

    #[test]
    fn evaluation_is_deterministic() {
        let expr = r#"len(message) > 2 AND contains(message, "q")"#;
        let first = evaluate(expr, "qqq").unwrap();
        for _ in 0..10 {
            assert_eq!(evaluate(expr, "qqq").unwrap(), first);
        }
    }
}
