// Tokenizer for JSONata expressions
// Produces one token at a time; the parser tells it whether the next token
// sits in prefix position so `/` can be read as a regex literal.

use std::sync::Arc;

use crate::errors::{Error, Result};
use crate::value::RegexLiteral;

/// Operator symbols and their binding powers.
pub(crate) const OPERATORS: &[(&str, u8)] = &[
    (".", 75),
    ("[", 80),
    ("]", 0),
    ("{", 70),
    ("}", 0),
    ("(", 80),
    (")", 0),
    (",", 0),
    ("@", 80),
    ("#", 80),
    (";", 80),
    (":", 80),
    ("?", 20),
    ("+", 50),
    ("-", 50),
    ("*", 60),
    ("/", 60),
    ("%", 60),
    ("|", 20),
    ("=", 40),
    ("<", 40),
    (">", 40),
    ("^", 40),
    ("**", 60),
    ("..", 20),
    (":=", 10),
    ("!=", 40),
    ("<=", 40),
    (">=", 40),
    ("~>", 40),
    ("and", 30),
    ("or", 25),
    ("in", 40),
    ("&", 50),
    ("!", 0),
    ("~", 0),
];

const TWO_CHAR_OPERATORS: &[&str] = &["..", ":=", "!=", ">=", "<=", "**", "~>"];

/// Binding power of an operator symbol.
pub(crate) fn binding_power(symbol: &str) -> Option<u8> {
    OPERATORS.iter().find(|(s, _)| *s == symbol).map(|(_, bp)| *bp)
}

/// The interned form of an operator symbol.
fn operator(symbol: &str) -> Option<&'static str> {
    OPERATORS.iter().find(|(s, _)| *s == symbol).map(|(s, _)| *s)
}

fn is_operator_char(ch: char) -> bool {
    let mut buf = [0u8; 4];
    let s: &str = ch.encode_utf8(&mut buf);
    OPERATORS.iter().any(|(sym, _)| *sym == s)
}

fn is_whitespace(ch: char) -> bool {
    matches!(ch, ' ' | '\t' | '\n' | '\r' | '\u{0B}')
}

/// Token payloads
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValue {
    Name(String),
    /// `$name`, stored without the `$`
    Variable(String),
    Operator(&'static str),
    String(String),
    Number(f64),
    Bool(bool),
    Null,
    Regex(Arc<RegexLiteral>),
}

/// A token and the source offset just after it.
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub value: TokenValue,
    pub position: usize,
}

impl Token {
    /// Source-ish rendering used in error messages.
    pub fn text(&self) -> String {
        match &self.value {
            TokenValue::Name(s) => s.clone(),
            TokenValue::Variable(s) => format!("${}", s),
            TokenValue::Operator(op) => op.to_string(),
            TokenValue::String(s) => s.clone(),
            TokenValue::Number(n) => crate::utils::format_number(*n),
            TokenValue::Bool(b) => b.to_string(),
            TokenValue::Null => "null".to_string(),
            TokenValue::Regex(r) => format!("{:?}", r),
        }
    }
}

/// Tokenizer over a source expression
pub struct Tokenizer {
    input: Vec<char>,
    position: usize,
}

impl Tokenizer {
    pub fn new(source: &str) -> Self {
        Tokenizer {
            input: source.chars().collect(),
            position: 0,
        }
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn source_len(&self) -> usize {
        self.input.len()
    }

    fn current(&self) -> Option<char> {
        self.input.get(self.position).copied()
    }

    fn peek(&self, offset: usize) -> Option<char> {
        self.input.get(self.position + offset).copied()
    }

    fn create(&self, value: TokenValue) -> Token {
        Token {
            value,
            position: self.position,
        }
    }

    fn skip_whitespace(&mut self) {
        while self.current().is_some_and(is_whitespace) {
            self.position += 1;
        }
    }

    fn skip_comment(&mut self) -> Result<()> {
        let start = self.position;
        self.position += 2;
        loop {
            match self.current() {
                None => return Err(Error::at("S0106", start)),
                Some('*') if self.peek(1) == Some('/') => {
                    self.position += 2;
                    return Ok(());
                }
                Some(_) => self.position += 1,
            }
        }
    }

    /// Next token, or `None` at end of input. `prefix` is true when the
    /// parser expects an infix operator, which rules out regex literals.
    pub fn next(&mut self, prefix: bool) -> Result<Option<Token>> {
        loop {
            self.skip_whitespace();
            if self.current() == Some('/') && self.peek(1) == Some('*') {
                self.skip_comment()?;
                continue;
            }
            break;
        }

        let Some(ch) = self.current() else {
            return Ok(None);
        };

        if !prefix && ch == '/' {
            self.position += 1;
            return self.read_regex().map(Some);
        }

        // Two-character operators
        if let Some(next) = self.peek(1) {
            let pair: String = [ch, next].iter().collect();
            if TWO_CHAR_OPERATORS.contains(&pair.as_str()) {
                self.position += 2;
                if let Some(op) = operator(&pair) {
                    return Ok(Some(self.create(TokenValue::Operator(op))));
                }
            }
        }

        // Single-character operators
        if is_operator_char(ch) {
            self.position += 1;
            if let Some(op) = operator(&ch.to_string()) {
                return Ok(Some(self.create(TokenValue::Operator(op))));
            }
        }

        match ch {
            '"' | '\'' => {
                let s = self.read_string(ch)?;
                Ok(Some(self.create(TokenValue::String(s))))
            }
            '`' => {
                let name = self.read_backtick_name()?;
                Ok(Some(self.create(TokenValue::Name(name))))
            }
            c if c.is_ascii_digit() => self.read_number().map(Some),
            _ => Ok(Some(self.read_name())),
        }
    }

    fn read_string(&mut self, quote: char) -> Result<String> {
        let mut result = String::new();
        self.position += 1;
        loop {
            let Some(ch) = self.current() else {
                return Err(Error::at("S0101", self.position));
            };
            if ch == quote {
                self.position += 1;
                return Ok(result);
            }
            if ch == '\\' {
                self.position += 1;
                let Some(escaped) = self.current() else {
                    return Err(Error::at("S0101", self.position));
                };
                match escaped {
                    '"' => result.push('"'),
                    '\\' => result.push('\\'),
                    '/' => result.push('/'),
                    'b' => result.push('\u{0008}'),
                    'f' => result.push('\u{000C}'),
                    'n' => result.push('\n'),
                    'r' => result.push('\r'),
                    't' => result.push('\t'),
                    'u' => {
                        let ch = self.read_unicode_escape()?;
                        result.push(ch);
                    }
                    other => {
                        return Err(Error::at("S0103", self.position).with_token(other.to_string()));
                    }
                }
            } else {
                result.push(ch);
            }
            self.position += 1;
        }
    }

    /// Reads the four hex digits after `\u` (the cursor is on the `u`) and
    /// leaves the cursor on the last digit. A high surrogate followed by
    /// `\uXXXX` low surrogate is combined into one character.
    fn read_unicode_escape(&mut self) -> Result<char> {
        let high = self.hex_quad(self.position + 1)?;
        self.position += 4;
        if (0xD800..0xDC00).contains(&high)
            && self.peek(1) == Some('\\')
            && self.peek(2) == Some('u')
        {
            if let Ok(low) = self.hex_quad(self.position + 3) {
                if (0xDC00..0xE000).contains(&low) {
                    self.position += 6;
                    let combined = 0x10000 + ((high - 0xD800) << 10) + (low - 0xDC00);
                    return char::from_u32(combined).ok_or_else(|| Error::at("S0104", self.position));
                }
            }
        }
        char::from_u32(high).ok_or_else(|| Error::at("S0104", self.position))
    }

    fn hex_quad(&self, start: usize) -> Result<u32> {
        let digits: String = self.input.iter().skip(start).take(4).collect();
        if digits.len() == 4 && digits.chars().all(|c| c.is_ascii_hexdigit()) {
            u32::from_str_radix(&digits, 16).map_err(|_| Error::at("S0104", self.position))
        } else {
            Err(Error::at("S0104", self.position))
        }
    }

    /// Matches `(0|[1-9][0-9]*)(\.[0-9]+)?([Ee][-+]?[0-9]+)?` at the cursor.
    fn scan_number(&self) -> usize {
        let digits_from = |mut i: usize| {
            while self.input.get(i).is_some_and(|c| c.is_ascii_digit()) {
                i += 1;
            }
            i
        };
        let mut end = self.position;
        if self.input.get(end) == Some(&'0') {
            end += 1;
        } else {
            end = digits_from(end);
        }
        if self.input.get(end) == Some(&'.') && self.input.get(end + 1).is_some_and(|c| c.is_ascii_digit()) {
            end = digits_from(end + 1);
        }
        if matches!(self.input.get(end), Some('e') | Some('E')) {
            let mut exp = end + 1;
            if matches!(self.input.get(exp), Some('+') | Some('-')) {
                exp += 1;
            }
            if self.input.get(exp).is_some_and(|c| c.is_ascii_digit()) {
                end = digits_from(exp);
            }
        }
        end
    }

    fn read_number(&mut self) -> Result<Token> {
        let end = self.scan_number();
        let text: String = self.input[self.position..end].iter().collect();
        self.position = end;
        match text.parse::<f64>() {
            Ok(n) if n.is_finite() => Ok(self.create(TokenValue::Number(n))),
            _ => Err(Error::at("S0102", self.position).with_token(text)),
        }
    }

    fn read_backtick_name(&mut self) -> Result<String> {
        self.position += 1;
        let start = self.position;
        match self.input[start..].iter().position(|&c| c == '`') {
            Some(len) => {
                self.position = start + len + 1;
                Ok(self.input[start..start + len].iter().collect())
            }
            None => {
                self.position = self.input.len();
                Err(Error::at("S0105", self.position))
            }
        }
    }

    fn read_name(&mut self) -> Token {
        let start = self.position;
        while self
            .current()
            .is_some_and(|c| !is_whitespace(c) && !is_operator_char(c))
        {
            self.position += 1;
        }
        let name: String = self.input[start..self.position].iter().collect();
        if let Some(variable) = name.strip_prefix('$') {
            return self.create(TokenValue::Variable(variable.to_string()));
        }
        let value = match name.as_str() {
            "and" | "or" | "in" => match operator(&name) {
                Some(op) => TokenValue::Operator(op),
                None => TokenValue::Name(name),
            },
            "true" => TokenValue::Bool(true),
            "false" => TokenValue::Bool(false),
            "null" => TokenValue::Null,
            _ => TokenValue::Name(name),
        };
        self.create(value)
    }

    /// Scans a regex literal; the opening `/` is already consumed.
    fn read_regex(&mut self) -> Result<Token> {
        let start = self.position;
        let mut depth: i32 = 0;
        while let Some(ch) = self.current() {
            if ch == '/' && depth == 0 && self.preceding_backslashes() % 2 == 0 {
                let pattern: String = self.input[start..self.position].iter().collect();
                if pattern.is_empty() {
                    return Err(Error::at("S0301", self.position));
                }
                self.position += 1;
                let mut flags = String::new();
                while let Some(flag @ ('i' | 'm')) = self.current() {
                    flags.push(flag);
                    self.position += 1;
                }
                let literal = RegexLiteral::new(&pattern, &flags)
                    .map_err(|_| Error::at("S0303", self.position).with_token(pattern.clone()))?;
                return Ok(self.create(TokenValue::Regex(Arc::new(literal))));
            }
            let escaped = self.position > 0 && self.input[self.position - 1] == '\\';
            if matches!(ch, '(' | '[' | '{') && !escaped {
                depth += 1;
            }
            if matches!(ch, ')' | ']' | '}') && !escaped {
                depth -= 1;
            }
            self.position += 1;
        }
        Err(Error::at("S0302", self.position))
    }

    fn preceding_backslashes(&self) -> usize {
        self.input[..self.position]
            .iter()
            .rev()
            .take_while(|&&c| c == '\\')
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokens(source: &str) -> Vec<TokenValue> {
        let mut tokenizer = Tokenizer::new(source);
        let mut out = Vec::new();
        while let Some(token) = tokenizer.next(true).unwrap() {
            out.push(token.value);
        }
        out
    }

    #[test]
    fn test_lexer_numbers() {
        assert_eq!(tokens("42"), vec![TokenValue::Number(42.0)]);
        assert_eq!(tokens("3.14"), vec![TokenValue::Number(3.14)]);
        assert_eq!(tokens("1e3"), vec![TokenValue::Number(1000.0)]);
        assert_eq!(tokens("2.5E-1"), vec![TokenValue::Number(0.25)]);
    }

    #[test]
    fn test_lexer_number_before_range() {
        assert_eq!(
            tokens("1..5"),
            vec![
                TokenValue::Number(1.0),
                TokenValue::Operator(".."),
                TokenValue::Number(5.0)
            ]
        );
    }

    #[test]
    fn test_lexer_number_out_of_range() {
        let err = Tokenizer::new("1e999").next(false).unwrap_err();
        assert_eq!(err.code, "S0102");
        assert_eq!(err.token.as_deref(), Some("1e999"));
    }

    #[test]
    fn test_lexer_strings() {
        assert_eq!(tokens(r#""hello""#), vec![TokenValue::String("hello".into())]);
        assert_eq!(tokens("'world'"), vec![TokenValue::String("world".into())]);
        assert_eq!(
            tokens(r#""a\"b\nA\/""#),
            vec![TokenValue::String("a\"b\nA/".into())]
        );
        assert_eq!(
            tokens(r#""\uD83D\uDE00""#),
            vec![TokenValue::String("\u{1F600}".into())]
        );
    }

    #[test]
    fn test_lexer_string_errors() {
        assert_eq!(Tokenizer::new("\"abc").next(false).unwrap_err().code, "S0101");
        let err = Tokenizer::new(r#""\q""#).next(false).unwrap_err();
        assert_eq!(err.code, "S0103");
        assert_eq!(err.token.as_deref(), Some("q"));
        assert_eq!(Tokenizer::new(r#""\u12g4""#).next(false).unwrap_err().code, "S0104");
    }

    #[test]
    fn test_lexer_names_and_keywords() {
        assert_eq!(
            tokens("foo and $bar or in true false null"),
            vec![
                TokenValue::Name("foo".into()),
                TokenValue::Operator("and"),
                TokenValue::Variable("bar".into()),
                TokenValue::Operator("or"),
                TokenValue::Operator("in"),
                TokenValue::Bool(true),
                TokenValue::Bool(false),
                TokenValue::Null,
            ]
        );
        assert_eq!(tokens("$"), vec![TokenValue::Variable(String::new())]);
        assert_eq!(tokens("$$"), vec![TokenValue::Variable("$".into())]);
    }

    #[test]
    fn test_lexer_operators() {
        assert_eq!(
            tokens("a.b:=c~>d!=e**"),
            vec![
                TokenValue::Name("a".into()),
                TokenValue::Operator("."),
                TokenValue::Name("b".into()),
                TokenValue::Operator(":="),
                TokenValue::Name("c".into()),
                TokenValue::Operator("~>"),
                TokenValue::Name("d".into()),
                TokenValue::Operator("!="),
                TokenValue::Name("e".into()),
                TokenValue::Operator("**"),
            ]
        );
    }

    #[test]
    fn test_lexer_comments() {
        assert_eq!(tokens("/* note */ a /* more */"), vec![TokenValue::Name("a".into())]);
        let mut t = Tokenizer::new("a /* open");
        assert!(t.next(false).unwrap().is_some());
        let err = t.next(true).unwrap_err();
        assert_eq!(err.code, "S0106");
        assert_eq!(err.position, Some(2));
    }

    #[test]
    fn test_lexer_backtick_names() {
        assert_eq!(tokens("`first name`"), vec![TokenValue::Name("first name".into())]);
        assert_eq!(Tokenizer::new("`open").next(false).unwrap_err().code, "S0105");
    }

    #[test]
    fn test_lexer_regex_in_prefix_position() {
        let mut t = Tokenizer::new("/ab[/]c/i");
        match t.next(false).unwrap().map(|t| t.value) {
            Some(TokenValue::Regex(r)) => {
                assert_eq!(r.pattern, "ab[/]c");
                assert_eq!(r.flags, "i");
                assert!(!r.regex().is_match("ABXC"));
                assert!(r.regex().is_match("AB/C"));
            }
            other => panic!("Expected regex token, got {:?}", other),
        }
    }

    #[test]
    fn test_lexer_slash_in_infix_position_is_division() {
        let mut t = Tokenizer::new("/ 2");
        assert_eq!(t.next(true).unwrap().map(|t| t.value), Some(TokenValue::Operator("/")));
    }

    #[test]
    fn test_lexer_regex_errors() {
        assert_eq!(Tokenizer::new("//").next(false).unwrap_err().code, "S0301");
        assert_eq!(Tokenizer::new("/abc").next(false).unwrap_err().code, "S0302");
        assert_eq!(Tokenizer::new(r"/a\/").next(false).unwrap_err().code, "S0302");
    }

    #[test]
    fn test_token_position_is_after_token() {
        let mut t = Tokenizer::new("ab + 1");
        assert_eq!(t.next(false).unwrap().unwrap().position, 2);
        assert_eq!(t.next(true).unwrap().unwrap().position, 4);
    }
}
