//! Text form of [`Value`].
//!
//! ```text
//! value   := "invalid" | "true" | "false" | number | string | binary | array
//! number  := int | float            float always carries a '.', or is nan / inf / -inf
//! string  := '"' (char | '\' escape)* '"'
//! binary  := 'b64' string           base64 payload
//! array   := '[' (value (',' value)*)? ']'
//! ```

use std::fmt::Write as _;

use super::{Value, ValueKind};
use crate::{BrokerError, Result};

pub(super) fn write_value(value: &Value, out: &mut String) {
    match value {
        Value::Invalid => out.push_str("invalid"),
        Value::Bool(b) => out.push_str(if *b { "true" } else { "false" }),
        Value::Int(i) => {
            let _ = write!(out, "{}", i);
        }
        Value::Float(f) => write_float(*f, out),
        Value::String(s) => write_quoted(s, out),
        Value::Binary(_) => {
            out.push_str("b64");
            // binary_to_base64 cannot fail on a Binary value
            let encoded = value.binary_to_base64().unwrap_or_default();
            write_quoted(&encoded, out);
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_value(item, out);
            }
            out.push(']');
        }
    }
}

fn write_float(f: f32, out: &mut String) {
    if f.is_nan() {
        out.push_str("nan");
    } else if f.is_infinite() {
        out.push_str(if f > 0.0 { "inf" } else { "-inf" });
    } else {
        let text = format!("{:?}", f);
        match text.find(['e', 'E']) {
            Some(pos) if !text[..pos].contains('.') => {
                out.push_str(&text[..pos]);
                out.push_str(".0");
                out.push_str(&text[pos..]);
            }
            _ => out.push_str(&text),
        }
    }
}

fn write_quoted(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
}

/// Classifies the leading value of `input` without parsing it completely.
pub fn deduce_type(input: &str) -> Option<ValueKind> {
    let text = input.trim_start();
    let first = text.chars().next()?;
    match first {
        '[' => Some(ValueKind::Array),
        '"' => Some(ValueKind::String),
        _ if text.starts_with("b64\"") => Some(ValueKind::Binary),
        _ if text.starts_with("true") || text.starts_with("false") => Some(ValueKind::Bool),
        _ if text.starts_with("invalid") => Some(ValueKind::Invalid),
        _ if text.starts_with("nan") || text.starts_with("inf") || text.starts_with("-inf") => {
            Some(ValueKind::Float)
        }
        '-' | '+' | '0'..='9' | '.' => {
            let number: String = text
                .chars()
                .take_while(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'))
                .collect();
            if number.contains(['.', 'e', 'E']) {
                Some(ValueKind::Float)
            } else {
                Some(ValueKind::Int)
            }
        }
        _ => None,
    }
}

pub(super) fn parse(input: &str) -> Result<Value> {
    let mut parser = Parser { src: input, pos: 0 };
    let value = parser.value(0)?;
    parser.skip_ws();
    if parser.pos != input.len() {
        return Err(parser.error("trailing characters after value"));
    }
    Ok(value)
}

const MAX_DEPTH: usize = 128;

struct Parser<'a> {
    src: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn rest(&self) -> &'a str {
        &self.src[self.pos..]
    }

    fn peek(&self) -> Option<char> {
        self.rest().chars().next()
    }

    fn skip_ws(&mut self) {
        let trimmed = self.rest().trim_start();
        self.pos = self.src.len() - trimmed.len();
    }

    fn error(&self, msg: &str) -> BrokerError {
        BrokerError::Parse(format!("{} at offset {}", msg, self.pos))
    }

    fn eat_keyword(&mut self, word: &str) -> bool {
        if self.rest().starts_with(word) {
            self.pos += word.len();
            true
        } else {
            false
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.skip_ws();
        match deduce_type(self.rest()) {
            Some(ValueKind::Array) => self.array(depth),
            Some(ValueKind::String) => self.string().map(Value::String),
            Some(ValueKind::Binary) => {
                self.pos += "b64".len();
                let encoded = self.string()?;
                Value::binary_from_base64(&encoded)
            }
            Some(ValueKind::Bool) => {
                if self.eat_keyword("true") {
                    Ok(Value::Bool(true))
                } else {
                    self.eat_keyword("false");
                    Ok(Value::Bool(false))
                }
            }
            Some(ValueKind::Invalid) => {
                self.eat_keyword("invalid");
                Ok(Value::Invalid)
            }
            Some(ValueKind::Int) | Some(ValueKind::Float) => self.number(),
            None => Err(self.error("unexpected input")),
        }
    }

    fn array(&mut self, depth: usize) -> Result<Value> {
        self.pos += 1;
        let mut items = Vec::new();
        self.skip_ws();
        if self.peek() == Some(']') {
            self.pos += 1;
            return Ok(Value::Array(items));
        }
        loop {
            items.push(self.value(depth + 1)?);
            self.skip_ws();
            match self.peek() {
                Some(',') => self.pos += 1,
                Some(']') => {
                    self.pos += 1;
                    return Ok(Value::Array(items));
                }
                _ => return Err(self.error("expected ',' or ']'")),
            }
        }
    }

    fn string(&mut self) -> Result<String> {
        if self.peek() != Some('"') {
            return Err(self.error("expected '\"'"));
        }
        self.pos += 1;
        let mut out = String::new();
        let mut chars = self.rest().char_indices();
        while let Some((offset, c)) = chars.next() {
            match c {
                '"' => {
                    self.pos += offset + 1;
                    return Ok(out);
                }
                '\\' => {
                    let escaped = match chars.next() {
                        Some((_, '"')) => '"',
                        Some((_, '\\')) => '\\',
                        Some((_, 'n')) => '\n',
                        Some((_, 'r')) => '\r',
                        Some((_, 't')) => '\t',
                        _ => {
                            self.pos += offset;
                            return Err(self.error("invalid escape sequence"));
                        }
                    };
                    out.push(escaped);
                }
                c => out.push(c),
            }
        }
        self.pos = self.src.len();
        Err(self.error("unterminated string"))
    }

    fn number(&mut self) -> Result<Value> {
        for (word, f) in [("nan", f32::NAN), ("inf", f32::INFINITY), ("-inf", f32::NEG_INFINITY)] {
            if self.eat_keyword(word) {
                return Ok(Value::Float(f));
            }
        }
        let start = self.pos;
        let len = self
            .rest()
            .char_indices()
            .take_while(|&(i, c)| {
                c.is_ascii_digit()
                    || matches!(c, '.' | 'e' | 'E')
                    || (matches!(c, '-' | '+')
                        && (i == 0 || matches!(self.rest().as_bytes()[i - 1], b'e' | b'E')))
            })
            .count();
        let token = &self.src[start..start + len];
        self.pos += len;
        if token.contains(['.', 'e', 'E']) {
            token
                .parse::<f32>()
                .map(Value::Float)
                .map_err(|_| BrokerError::Parse(format!("invalid float '{}' at offset {}", token, start)))
        } else {
            token
                .parse::<i32>()
                .map(Value::Int)
                .map_err(|_| BrokerError::Parse(format!("invalid integer '{}' at offset {}", token, start)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_scalar_text() {
        assert_eq!(Value::Int(-12).to_text(), "-12");
        assert_eq!(Value::Float(2.0).to_text(), "2.0");
        assert_eq!(Value::Float(1e-7).to_text(), "1.0e-7");
        assert_eq!(Value::from("a\"b").to_text(), "\"a\\\"b\"");
        assert_eq!(Value::Invalid.to_text(), "invalid");
    }

    #[test]
    fn test_parse_nested() {
        let v = Value::from_text(" [1, 2.5, \"x\", [true, []], b64\"AAE=\"] ").unwrap();
        let expected = Value::from(vec![
            Value::Int(1),
            Value::Float(2.5),
            Value::from("x"),
            Value::from(vec![Value::Bool(true), Value::array()]),
            Value::binary(vec![0, 1]),
        ]);
        assert_eq!(v, expected);
    }

    #[test]
    fn test_parse_errors() {
        assert!(matches!(Value::from_text("[1, 2"), Err(BrokerError::Parse(_))));
        assert!(Value::from_text("\"open").is_err());
        assert!(Value::from_text("1 2").is_err());
        assert!(Value::from_text("what").is_err());
        assert!(Value::from_text("99999999999").is_err());
    }

    #[test]
    fn test_deduce_type() {
        assert_eq!(deduce_type("42"), Some(ValueKind::Int));
        assert_eq!(deduce_type("-4.0"), Some(ValueKind::Float));
        assert_eq!(deduce_type("3e4"), Some(ValueKind::Float));
        assert_eq!(deduce_type("  [1]"), Some(ValueKind::Array));
        assert_eq!(deduce_type("\"s\""), Some(ValueKind::String));
        assert_eq!(deduce_type("b64\"\""), Some(ValueKind::Binary));
        assert_eq!(deduce_type("false"), Some(ValueKind::Bool));
        assert_eq!(deduce_type("?"), None);
        assert_eq!(deduce_type(""), None);
    }

    fn leaf() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Invalid),
            any::<bool>().prop_map(Value::Bool),
            any::<i32>().prop_map(Value::Int),
            (-1.0e6f32..1.0e6f32).prop_map(Value::Float),
            ".*".prop_map(Value::String),
            proptest::collection::vec(any::<u8>(), 0..16).prop_map(Value::Binary),
        ]
    }

    fn nested() -> impl Strategy<Value = Value> {
        leaf().prop_recursive(3, 32, 6, |inner| {
            proptest::collection::vec(inner, 0..6).prop_map(Value::Array)
        })
    }

    proptest! {
        #[test]
        fn prop_text_round_trip(v in nested()) {
            let text = v.to_text();
            prop_assert_eq!(Value::from_text(&text).unwrap(), v);
        }
    }
}
