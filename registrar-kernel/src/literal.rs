//! Reader for the Python literal syntax external tooling writes into node
//! extras (`{u'macs': ['aa:bb:..'], 'boot': None}`).
//!
//! Accepts dicts, lists, tuples (read as arrays), strings with an optional
//! `u`/`b`/`r` prefix, integers, floats, `None`, `True` and `False`. Anything
//! else is an error, never a best guess.

use serde_json::{Map, Number, Value};

const MAX_DEPTH: usize = 64;

#[derive(Debug, PartialEq, thiserror::Error)]
#[error("{reason} at offset {offset}")]
pub struct LiteralError {
    pub offset: usize,
    pub reason: &'static str,
}

pub fn parse(text: &str) -> Result<Value, LiteralError> {
    let mut reader = Reader {
        chars: text.chars().collect(),
        pos: 0,
    };
    let value = reader.value(0)?;
    reader.skip_ws();
    if reader.pos != reader.chars.len() {
        return Err(reader.error("trailing characters"));
    }
    Ok(value)
}

struct Reader {
    chars: Vec<char>,
    pos: usize,
}

impl Reader {
    fn error(&self, reason: &'static str) -> LiteralError {
        LiteralError { offset: self.pos, reason }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn skip_ws(&mut self) {
        while self.peek().is_some_and(char::is_whitespace) {
            self.pos += 1;
        }
    }

    fn eat(&mut self, expected: char) -> bool {
        self.skip_ws();
        if self.peek() == Some(expected) {
            self.pos += 1;
            true
        } else {
            false
        }
    }

    fn value(&mut self, depth: usize) -> Result<Value, LiteralError> {
        if depth > MAX_DEPTH {
            return Err(self.error("nesting too deep"));
        }
        self.skip_ws();
        match self.peek() {
            None => Err(self.error("unexpected end of input")),
            Some('{') => self.dict(depth),
            Some('[') => {
                self.pos += 1;
                let (items, _) = self.sequence(']', depth)?;
                Ok(Value::Array(items))
            }
            Some('(') => {
                self.pos += 1;
                let (mut items, closed_after_comma) = self.sequence(')', depth)?;
                // `(x)` is only a parenthesised value, `(x,)` is a tuple
                if items.len() == 1 && !closed_after_comma {
                    Ok(items.remove(0))
                } else {
                    Ok(Value::Array(items))
                }
            }
            Some('\'' | '"') => self.strings(),
            Some(c) if c.is_ascii_digit() || matches!(c, '-' | '+' | '.') => self.number(),
            Some(c) if c.is_alphabetic() || c == '_' => self.word(),
            Some(_) => Err(self.error("unexpected character")),
        }
    }

    fn dict(&mut self, depth: usize) -> Result<Value, LiteralError> {
        self.pos += 1;
        let mut map = Map::new();
        loop {
            if self.eat('}') {
                return Ok(Value::Object(map));
            }
            let key_offset = self.pos;
            let key = match self.value(depth + 1)? {
                Value::String(s) => s,
                Value::Number(n) => n.to_string(),
                _ => {
                    return Err(LiteralError {
                        offset: key_offset,
                        reason: "unsupported dict key",
                    })
                }
            };
            if !self.eat(':') {
                return Err(self.error("expected ':'"));
            }
            let value = self.value(depth + 1)?;
            map.insert(key, value);
            if self.eat('}') {
                return Ok(Value::Object(map));
            }
            if !self.eat(',') {
                return Err(self.error("expected ',' or '}'"));
            }
        }
    }

    /// Items up to `close`; the flag is set when the sequence is empty or ends with a comma.
    fn sequence(&mut self, close: char, depth: usize) -> Result<(Vec<Value>, bool), LiteralError> {
        let mut items = Vec::new();
        loop {
            if self.eat(close) {
                return Ok((items, true));
            }
            items.push(self.value(depth + 1)?);
            if self.eat(close) {
                return Ok((items, false));
            }
            if !self.eat(',') {
                return Err(self.error("expected ',' or closing bracket"));
            }
        }
    }

    /// Prefix length and rawness when a string literal starts here.
    fn string_prefix(&self) -> Option<(usize, bool)> {
        let mut len = 0;
        let mut raw = false;
        while let Some(c) = self.chars.get(self.pos + len) {
            match c.to_ascii_lowercase() {
                'u' | 'b' if len < 2 => len += 1,
                'r' if len < 2 => {
                    raw = true;
                    len += 1;
                }
                '\'' | '"' => return Some((len, raw)),
                _ => return None,
            }
        }
        None
    }

    /// One string, or several adjacent ones concatenated.
    fn strings(&mut self) -> Result<Value, LiteralError> {
        let mut text = String::new();
        let mut parts = 0;
        loop {
            self.skip_ws();
            let Some((prefix, raw)) = self.string_prefix() else {
                break;
            };
            self.pos += prefix;
            self.string(raw, &mut text)?;
            parts += 1;
        }
        if parts == 0 {
            return Err(self.error("expected a string"));
        }
        Ok(Value::String(text))
    }

    fn at_triple(&self, quote: char) -> bool {
        self.chars
            .get(self.pos..self.pos + 3)
            .is_some_and(|s| s.iter().all(|&c| c == quote))
    }

    fn string(&mut self, raw: bool, out: &mut String) -> Result<(), LiteralError> {
        let Some(quote) = self.peek() else {
            return Err(self.error("expected a string"));
        };
        let triple = self.at_triple(quote);
        let width = if triple { 3 } else { 1 };
        self.pos += width;

        loop {
            let Some(c) = self.peek() else {
                return Err(self.error("unterminated string"));
            };
            if c == quote && (!triple || self.at_triple(quote)) {
                self.pos += width;
                return Ok(());
            }
            if c == '\n' && !triple {
                return Err(self.error("newline in string"));
            }
            self.pos += 1;
            if c != '\\' {
                out.push(c);
            } else if raw {
                out.push('\\');
                if let Some(next) = self.peek() {
                    out.push(next);
                    self.pos += 1;
                }
            } else {
                self.escape(out)?;
            }
        }
    }

    fn escape(&mut self, out: &mut String) -> Result<(), LiteralError> {
        let Some(c) = self.peek() else {
            return Err(self.error("unterminated string"));
        };
        self.pos += 1;
        match c {
            '\n' => {}
            '\\' | '\'' | '"' => out.push(c),
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            'x' => self.code_point(2, out)?,
            'u' => self.code_point(4, out)?,
            'U' => self.code_point(8, out)?,
            '0'..='7' => {
                let mut code = c.to_digit(8).unwrap_or_default();
                for _ in 0..2 {
                    match self.peek().and_then(|d| d.to_digit(8)) {
                        Some(d) => {
                            code = code * 8 + d;
                            self.pos += 1;
                        }
                        None => break,
                    }
                }
                out.push(char::from_u32(code).ok_or_else(|| self.error("invalid escape"))?);
            }
            // unknown escapes keep their backslash
            other => {
                out.push('\\');
                out.push(other);
            }
        }
        Ok(())
    }

    fn code_point(&mut self, digits: usize, out: &mut String) -> Result<(), LiteralError> {
        let hex: String = self
            .chars
            .get(self.pos..self.pos + digits)
            .ok_or_else(|| self.error("truncated escape"))?
            .iter()
            .collect();
        let c = u32::from_str_radix(&hex, 16)
            .ok()
            .and_then(char::from_u32)
            .ok_or_else(|| self.error("invalid escape"))?;
        self.pos += digits;
        out.push(c);
        Ok(())
    }

    fn number(&mut self) -> Result<Value, LiteralError> {
        let start = self.pos;
        let mut negative = false;
        if let Some(sign @ ('-' | '+')) = self.peek() {
            negative = sign == '-';
            self.pos += 1;
            self.skip_ws();
        }

        let body = self.pos;
        let radix_prefixed = self
            .chars
            .get(body + 1)
            .is_some_and(|c| matches!(c, 'x' | 'X' | 'o' | 'O' | 'b' | 'B'));
        while let Some(c) = self.peek() {
            let after_exponent = self.pos > body && matches!(self.chars[self.pos - 1], 'e' | 'E');
            let accepted = c.is_ascii_alphanumeric()
                || c == '.'
                || c == '_'
                || (matches!(c, '+' | '-') && after_exponent && !radix_prefixed);
            if !accepted {
                break;
            }
            self.pos += 1;
        }

        let token: String = self.chars[body..self.pos]
            .iter()
            .filter(|&&c| c != '_')
            .collect();
        parse_number(&token, negative)
            .map(Value::Number)
            .ok_or(LiteralError {
                offset: start,
                reason: "invalid number",
            })
    }

    fn word(&mut self) -> Result<Value, LiteralError> {
        if self.string_prefix().is_some() {
            return self.strings();
        }
        let start = self.pos;
        while self.peek().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.pos += 1;
        }
        let word: String = self.chars[start..self.pos].iter().collect();
        match word.as_str() {
            "None" => Ok(Value::Null),
            "True" => Ok(Value::Bool(true)),
            "False" => Ok(Value::Bool(false)),
            _ => Err(LiteralError {
                offset: start,
                reason: "unknown name",
            }),
        }
    }
}

fn parse_number(token: &str, negative: bool) -> Option<Number> {
    let lower = token.to_ascii_lowercase();
    let radix = match lower.get(..2) {
        Some("0x") => Some(16),
        Some("0o") => Some(8),
        Some("0b") => Some(2),
        _ => None,
    };
    if let Some(radix) = radix {
        let magnitude = i128::from_str_radix(&lower[2..], radix).ok()?;
        return integer(if negative { -magnitude } else { magnitude });
    }

    // python 2 longs carry an `L` suffix
    let digits = lower.strip_suffix('l').unwrap_or(&lower);
    if !digits.is_empty() && digits.chars().all(|c| c.is_ascii_digit()) {
        let magnitude: i128 = digits.parse().ok()?;
        return integer(if negative { -magnitude } else { magnitude });
    }

    let float: f64 = lower.parse().ok()?;
    Number::from_f64(if negative { -float } else { float })
}

fn integer(value: i128) -> Option<Number> {
    match i64::try_from(value) {
        Ok(v) => Some(v.into()),
        Err(_) => u64::try_from(value).ok().map(Number::from),
    }
}
