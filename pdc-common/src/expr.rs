//! Restricted condition-expression evaluator.
//!
//! Custom trigger conditions and verification checks are strings like
//! `${error_rate} > 2 && ${availability} < 99.5`. They are evaluated by a
//! hand-written lexer and recursive-descent interpreter limited to numeric
//! literals, metric identifiers, arithmetic, comparison, and boolean
//! connectives. Identifiers resolve against the fixed metric vocabulary
//! plus the snapshot's custom map; anything else is an error. There is no
//! escape hatch into code execution.
//!
//! Both branches of `&&`/`||` are evaluated — expressions have no side
//! effects, and an unknown metric must surface even when the other operand
//! already decides the result.

use crate::metrics::DeploymentMetrics;
use thiserror::Error;

/// Errors raised while lexing, parsing, or evaluating a condition.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExprError {
    #[error("unexpected character '{ch}' at offset {pos}")]
    UnexpectedChar { ch: char, pos: usize },

    #[error("invalid number '{text}' at offset {pos}")]
    InvalidNumber { text: String, pos: usize },

    #[error("unterminated metric placeholder at offset {pos}")]
    UnterminatedPlaceholder { pos: usize },

    #[error("unexpected token '{found}' at offset {pos}")]
    UnexpectedToken { found: String, pos: usize },

    #[error("expression ended unexpectedly")]
    UnexpectedEnd,

    #[error("unknown metric '{0}'")]
    UnknownMetric(String),

    #[error("type mismatch: expected {expected}, found {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("condition did not evaluate to a boolean")]
    NotBoolean,
}

/// Result of evaluating an expression.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Num(f64),
    Bool(bool),
}

impl Value {
    fn kind(&self) -> &'static str {
        match self {
            Self::Num(_) => "number",
            Self::Bool(_) => "boolean",
        }
    }

    fn as_num(&self) -> Result<f64, ExprError> {
        match self {
            Self::Num(n) => Ok(*n),
            other => Err(ExprError::TypeMismatch {
                expected: "number",
                found: other.kind(),
            }),
        }
    }

    fn as_bool(&self) -> Result<bool, ExprError> {
        match self {
            Self::Bool(b) => Ok(*b),
            other => Err(ExprError::TypeMismatch {
                expected: "boolean",
                found: other.kind(),
            }),
        }
    }
}

/// Evaluate an expression against a metrics snapshot.
pub fn evaluate(src: &str, metrics: &DeploymentMetrics) -> Result<Value, ExprError> {
    let tokens = lex(src)?;
    let mut parser = Parser {
        tokens,
        idx: 0,
        metrics,
    };
    let value = parser.parse_or()?;
    if let Some((token, pos)) = parser.peek() {
        return Err(ExprError::UnexpectedToken {
            found: token.describe(),
            pos: *pos,
        });
    }
    Ok(value)
}

/// Evaluate a trigger/verification condition; the result must be boolean.
pub fn evaluate_condition(src: &str, metrics: &DeploymentMetrics) -> Result<bool, ExprError> {
    match evaluate(src, metrics)? {
        Value::Bool(b) => Ok(b),
        Value::Num(_) => Err(ExprError::NotBoolean),
    }
}

// ── Lexer ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
enum Token {
    Num(f64),
    Ident(String),
    LParen,
    RParen,
    Plus,
    Minus,
    Star,
    Slash,
    Lt,
    Le,
    Gt,
    Ge,
    EqEq,
    NotEq,
    AndAnd,
    OrOr,
    Not,
}

impl Token {
    fn describe(&self) -> String {
        match self {
            Self::Num(n) => n.to_string(),
            Self::Ident(name) => name.clone(),
            Self::LParen => "(".into(),
            Self::RParen => ")".into(),
            Self::Plus => "+".into(),
            Self::Minus => "-".into(),
            Self::Star => "*".into(),
            Self::Slash => "/".into(),
            Self::Lt => "<".into(),
            Self::Le => "<=".into(),
            Self::Gt => ">".into(),
            Self::Ge => ">=".into(),
            Self::EqEq => "==".into(),
            Self::NotEq => "!=".into(),
            Self::AndAnd => "&&".into(),
            Self::OrOr => "||".into(),
            Self::Not => "!".into(),
        }
    }
}

fn lex(src: &str) -> Result<Vec<(Token, usize)>, ExprError> {
    let mut tokens = Vec::new();
    let chars: Vec<char> = src.chars().collect();
    let mut i = 0;

    while i < chars.len() {
        let ch = chars[i];
        match ch {
            c if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push((Token::LParen, i));
                i += 1;
            }
            ')' => {
                tokens.push((Token::RParen, i));
                i += 1;
            }
            '+' => {
                tokens.push((Token::Plus, i));
                i += 1;
            }
            '-' => {
                tokens.push((Token::Minus, i));
                i += 1;
            }
            '*' => {
                tokens.push((Token::Star, i));
                i += 1;
            }
            '/' => {
                tokens.push((Token::Slash, i));
                i += 1;
            }
            '<' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((Token::Le, i));
                    i += 2;
                } else {
                    tokens.push((Token::Lt, i));
                    i += 1;
                }
            }
            '>' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((Token::Ge, i));
                    i += 2;
                } else {
                    tokens.push((Token::Gt, i));
                    i += 1;
                }
            }
            '=' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((Token::EqEq, i));
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar { ch, pos: i });
                }
            }
            '!' => {
                if chars.get(i + 1) == Some(&'=') {
                    tokens.push((Token::NotEq, i));
                    i += 2;
                } else {
                    tokens.push((Token::Not, i));
                    i += 1;
                }
            }
            '&' => {
                if chars.get(i + 1) == Some(&'&') {
                    tokens.push((Token::AndAnd, i));
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar { ch, pos: i });
                }
            }
            '|' => {
                if chars.get(i + 1) == Some(&'|') {
                    tokens.push((Token::OrOr, i));
                    i += 2;
                } else {
                    return Err(ExprError::UnexpectedChar { ch, pos: i });
                }
            }
            '$' => {
                // ${metric_name} placeholder, the shape the source format uses.
                let start = i;
                if chars.get(i + 1) != Some(&'{') {
                    return Err(ExprError::UnexpectedChar { ch, pos: i });
                }
                i += 2;
                let name_start = i;
                while i < chars.len() && chars[i] != '}' {
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(ExprError::UnterminatedPlaceholder { pos: start });
                }
                let name: String = chars[name_start..i].iter().collect();
                let name = name.trim().to_string();
                if name.is_empty() {
                    return Err(ExprError::UnterminatedPlaceholder { pos: start });
                }
                tokens.push((Token::Ident(name), start));
                i += 1;
            }
            c if c.is_ascii_digit() => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_digit() || chars[i] == '.') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                let value = text.parse::<f64>().map_err(|_| ExprError::InvalidNumber {
                    text: text.clone(),
                    pos: start,
                })?;
                tokens.push((Token::Num(value), start));
            }
            c if c.is_ascii_alphabetic() || c == '_' => {
                let start = i;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '_') {
                    i += 1;
                }
                let name: String = chars[start..i].iter().collect();
                tokens.push((Token::Ident(name), start));
            }
            other => return Err(ExprError::UnexpectedChar { ch: other, pos: i }),
        }
    }

    Ok(tokens)
}

// ── Parser / interpreter ───────────────────────────────────────────────────

struct Parser<'a> {
    tokens: Vec<(Token, usize)>,
    idx: usize,
    metrics: &'a DeploymentMetrics,
}

impl Parser<'_> {
    fn peek(&self) -> Option<&(Token, usize)> {
        self.tokens.get(self.idx)
    }

    fn next(&mut self) -> Option<(Token, usize)> {
        let token = self.tokens.get(self.idx).cloned();
        if token.is_some() {
            self.idx += 1;
        }
        token
    }

    fn parse_or(&mut self) -> Result<Value, ExprError> {
        let mut lhs = self.parse_and()?;
        while matches!(self.peek(), Some((Token::OrOr, _))) {
            self.next();
            let rhs = self.parse_and()?;
            lhs = Value::Bool(lhs.as_bool()? || rhs.as_bool()?);
        }
        Ok(lhs)
    }

    fn parse_and(&mut self) -> Result<Value, ExprError> {
        let mut lhs = self.parse_cmp()?;
        while matches!(self.peek(), Some((Token::AndAnd, _))) {
            self.next();
            let rhs = self.parse_cmp()?;
            lhs = Value::Bool(lhs.as_bool()? && rhs.as_bool()?);
        }
        Ok(lhs)
    }

    fn parse_cmp(&mut self) -> Result<Value, ExprError> {
        let lhs = self.parse_add()?;
        let op = match self.peek() {
            Some((Token::Lt, _))
            | Some((Token::Le, _))
            | Some((Token::Gt, _))
            | Some((Token::Ge, _))
            | Some((Token::EqEq, _))
            | Some((Token::NotEq, _)) => self.next().map(|(t, _)| t),
            _ => None,
        };
        let Some(op) = op else {
            return Ok(lhs);
        };
        let rhs = self.parse_add()?;
        let result = match op {
            Token::Lt => lhs.as_num()? < rhs.as_num()?,
            Token::Le => lhs.as_num()? <= rhs.as_num()?,
            Token::Gt => lhs.as_num()? > rhs.as_num()?,
            Token::Ge => lhs.as_num()? >= rhs.as_num()?,
            Token::EqEq => match (lhs, rhs) {
                (Value::Num(a), Value::Num(b)) => a == b,
                (Value::Bool(a), Value::Bool(b)) => a == b,
                (a, b) => {
                    return Err(ExprError::TypeMismatch {
                        expected: a.kind(),
                        found: b.kind(),
                    });
                }
            },
            Token::NotEq => match (lhs, rhs) {
                (Value::Num(a), Value::Num(b)) => a != b,
                (Value::Bool(a), Value::Bool(b)) => a != b,
                (a, b) => {
                    return Err(ExprError::TypeMismatch {
                        expected: a.kind(),
                        found: b.kind(),
                    });
                }
            },
            _ => unreachable!("comparison operator set is closed"),
        };
        Ok(Value::Bool(result))
    }

    fn parse_add(&mut self) -> Result<Value, ExprError> {
        let mut lhs = self.parse_mul()?;
        loop {
            let op = match self.peek() {
                Some((Token::Plus, _)) | Some((Token::Minus, _)) => {
                    self.next().map(|(t, _)| t)
                }
                _ => None,
            };
            let Some(op) = op else {
                return Ok(lhs);
            };
            let rhs = self.parse_mul()?;
            let result = match op {
                Token::Plus => lhs.as_num()? + rhs.as_num()?,
                Token::Minus => lhs.as_num()? - rhs.as_num()?,
                _ => unreachable!(),
            };
            lhs = Value::Num(result);
        }
    }

    fn parse_mul(&mut self) -> Result<Value, ExprError> {
        let mut lhs = self.parse_unary()?;
        loop {
            let op = match self.peek() {
                Some((Token::Star, _)) | Some((Token::Slash, _)) => {
                    self.next().map(|(t, _)| t)
                }
                _ => None,
            };
            let Some(op) = op else {
                return Ok(lhs);
            };
            let rhs = self.parse_unary()?;
            let result = match op {
                Token::Star => lhs.as_num()? * rhs.as_num()?,
                // IEEE semantics: division by zero yields an infinity.
                Token::Slash => lhs.as_num()? / rhs.as_num()?,
                _ => unreachable!(),
            };
            lhs = Value::Num(result);
        }
    }

    fn parse_unary(&mut self) -> Result<Value, ExprError> {
        match self.peek() {
            Some((Token::Not, _)) => {
                self.next();
                let value = self.parse_unary()?;
                Ok(Value::Bool(!value.as_bool()?))
            }
            Some((Token::Minus, _)) => {
                self.next();
                let value = self.parse_unary()?;
                Ok(Value::Num(-value.as_num()?))
            }
            _ => self.parse_primary(),
        }
    }

    fn parse_primary(&mut self) -> Result<Value, ExprError> {
        match self.next() {
            Some((Token::Num(n), _)) => Ok(Value::Num(n)),
            Some((Token::Ident(name), _)) => self
                .metrics
                .metric_value(&name)
                .map(Value::Num)
                .ok_or(ExprError::UnknownMetric(name)),
            Some((Token::LParen, _)) => {
                let value = self.parse_or()?;
                match self.next() {
                    Some((Token::RParen, _)) => Ok(value),
                    Some((token, pos)) => Err(ExprError::UnexpectedToken {
                        found: token.describe(),
                        pos,
                    }),
                    None => Err(ExprError::UnexpectedEnd),
                }
            }
            Some((token, pos)) => Err(ExprError::UnexpectedToken {
                found: token.describe(),
                pos,
            }),
            None => Err(ExprError::UnexpectedEnd),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot() -> DeploymentMetrics {
        let mut metrics = DeploymentMetrics::nominal();
        metrics.error_rate = 3.0;
        metrics.availability = 99.2;
        metrics.custom.insert("queue_depth".to_string(), 42.0);
        metrics
    }

    #[test]
    fn arithmetic_and_precedence() {
        let m = snapshot();
        assert_eq!(evaluate("1 + 2 * 3", &m).unwrap(), Value::Num(7.0));
        assert_eq!(evaluate("(1 + 2) * 3", &m).unwrap(), Value::Num(9.0));
        assert_eq!(evaluate("-2 + 5", &m).unwrap(), Value::Num(3.0));
    }

    #[test]
    fn placeholders_and_bare_identifiers_resolve() {
        let m = snapshot();
        assert_eq!(evaluate("${error_rate}", &m).unwrap(), Value::Num(3.0));
        assert_eq!(evaluate("error_rate", &m).unwrap(), Value::Num(3.0));
        assert_eq!(evaluate("${queue_depth}", &m).unwrap(), Value::Num(42.0));
    }

    #[test]
    fn boolean_conditions() {
        let m = snapshot();
        assert!(evaluate_condition("${error_rate} > 2", &m).unwrap());
        assert!(!evaluate_condition("${error_rate} > 5", &m).unwrap());
        assert!(evaluate_condition("${error_rate} > 2 && ${availability} < 99.5", &m).unwrap());
        assert!(evaluate_condition("${error_rate} > 5 || ${availability} < 99.5", &m).unwrap());
        assert!(evaluate_condition("!(${error_rate} > 5)", &m).unwrap());
    }

    #[test]
    fn unknown_metric_is_an_error_even_when_other_operand_decides() {
        let m = snapshot();
        assert_eq!(
            evaluate_condition("${error_rate} > 2 || ${bogus} > 1", &m),
            Err(ExprError::UnknownMetric("bogus".to_string()))
        );
    }

    #[test]
    fn numeric_result_is_rejected_as_condition() {
        let m = snapshot();
        assert_eq!(
            evaluate_condition("${error_rate} + 1", &m),
            Err(ExprError::NotBoolean)
        );
    }

    #[test]
    fn malformed_expressions_fail_fast() {
        let m = snapshot();
        assert!(matches!(
            evaluate("${error_rate", &m),
            Err(ExprError::UnterminatedPlaceholder { .. })
        ));
        assert!(matches!(
            evaluate("1 &", &m),
            Err(ExprError::UnexpectedChar { ch: '&', .. })
        ));
        assert!(matches!(
            evaluate("1 2", &m),
            Err(ExprError::UnexpectedToken { .. })
        ));
        assert!(matches!(evaluate("", &m), Err(ExprError::UnexpectedEnd)));
        assert!(matches!(
            evaluate("1.2.3", &m),
            Err(ExprError::InvalidNumber { .. })
        ));
    }

    #[test]
    fn type_mismatches_are_reported() {
        let m = snapshot();
        assert!(matches!(
            evaluate("(1 > 0) + 2", &m),
            Err(ExprError::TypeMismatch { .. })
        ));
        assert!(matches!(
            evaluate("!3", &m),
            Err(ExprError::TypeMismatch { .. })
        ));
    }
}
