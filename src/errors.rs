// Error type and message catalog
// Every failure raised by the tokenizer, parser, normalizer, signature
// validator and evaluator is an `Error` carrying a stable code.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// A failure with a stable code, an optional source position and up to two
/// detail values substituted into the catalog template.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{code}: {message}")]
pub struct Error {
    pub code: &'static str,
    pub position: Option<usize>,
    pub token: Option<String>,
    pub value: Option<String>,
    message: String,
}

impl Error {
    pub fn new(code: &'static str) -> Self {
        Error {
            code,
            position: None,
            token: None,
            value: None,
            message: render(code, None, None),
        }
    }

    /// Error at a source position (character offset).
    pub fn at(code: &'static str, position: usize) -> Self {
        Error::new(code).with_position(position)
    }

    pub fn with_position(mut self, position: usize) -> Self {
        self.position = Some(position);
        self
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self.message = render(self.code, self.token.as_deref(), self.value.as_deref());
        self
    }

    pub fn with_value(mut self, value: impl Into<String>) -> Self {
        self.value = Some(value.into());
        self.message = render(self.code, self.token.as_deref(), self.value.as_deref());
        self
    }

    /// Rendered message without the code prefix.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Fill in position and token if the raiser did not know them.
    pub(crate) fn locate(mut self, position: usize, token: Option<&str>) -> Self {
        if self.position.is_none() {
            self.position = Some(position);
        }
        if self.token.is_none() {
            if let Some(t) = token {
                self = self.with_token(t);
            }
        }
        self
    }
}

// ── Catalog ──────────────────────────────────────────────────────────────────

/// Message template for a code.
pub fn template(code: &str) -> Option<&'static str> {
    let t = match code {
        "S0101" => "String literal must be terminated by a matching quote",
        "S0102" => "Number out of range: {{token}}",
        "S0103" => "Unsupported escape sequence: \\{{token}}",
        "S0104" => "The escape sequence \\u must be followed by 4 hex digits",
        "S0105" => "Quoted property name must be terminated with a backquote (`)",
        "S0106" => "Comment has no closing tag",
        "S0201" => "Syntax error: {{token}}",
        "S0202" => "Expected {{value}}, got {{token}}",
        "S0203" => "Expected {{value}} before end of expression",
        "S0204" => "Unknown operator: {{token}}",
        "S0205" => "Unexpected token: {{token}}",
        "S0206" => "Unknown expression type: {{token}}",
        "S0207" => "Unexpected end of expression",
        "S0208" => "Parameter {{value}} of function definition must be a variable name (start with $)",
        "S0209" => "A predicate cannot follow a grouping expression in a step",
        "S0210" => "Each step can only have one grouping expression",
        "S0211" => "The symbol {{token}} cannot be used as a unary operator",
        "S0212" => "The left side of := must be a variable name (start with $)",
        "S0213" => "The literal value {{value}} cannot be used as a step within a path expression",
        "S0214" => "The right side of {{token}} must be a variable name (start with $)",
        "S0215" => "A context variable binding must precede any predicates on a step",
        "S0216" => "A context variable binding must precede the \"order-by\" clause on a step",
        "S0217" => "The object representing the \"parent\" cannot be derived from this expression",
        "S0301" => "Empty regular expressions are not allowed",
        "S0302" => "No terminating / in regular expression",
        "S0303" => "Invalid regular expression: {{token}}",
        "S0401" => "Type parameters can only be applied to functions and arrays",
        "S0402" => "Choice groups containing parameterized types are not supported",
        "S0500" => "Attempted to evaluate an expression containing syntax error(s)",
        "T0410" => "Argument {{index}} of function {{token}} does not match function signature",
        "T0411" => "Context value is not a compatible type with argument {{index}} of function {{token}}",
        "T0412" => "Argument {{index}} must be an array of {{type}}",
        "D1001" => "Number out of range: {{value}}",
        "D1002" => "Cannot negate a non-numeric value: {{value}}",
        "T1003" => "Key in object structure must evaluate to a string; got: {{value}}",
        "T1005" => "Attempted to invoke a non-function. Did you mean ${{token}}?",
        "T1006" => "Attempted to invoke a non-function",
        "T1007" => "Attempted to partially apply a non-function. Did you mean ${{token}}?",
        "T1008" => "Attempted to partially apply a non-function",
        "D1009" => "Multiple key definitions evaluate to same key: {{value}}",
        "T2001" => "The left side of the {{token}} operator must evaluate to a number",
        "T2002" => "The right side of the {{token}} operator must evaluate to a number",
        "T2003" => "The left side of the range operator (..) must evaluate to an integer",
        "T2004" => "The right side of the range operator (..) must evaluate to an integer",
        "T2006" => "The right side of the function application operator ~> must be a function",
        "T2007" => "Type mismatch when comparing values {{value}} and {{value2}} in order-by clause",
        "T2008" => "The expressions within an order-by clause must evaluate to numeric or string values",
        "T2009" => "The values {{value}} and {{value2}} either side of operator {{token}} must be of the same data type",
        "T2010" => "The expressions either side of operator {{token}} must evaluate to numeric or string values",
        "T2011" => "The insert/update clause of the transform expression must evaluate to an object: {{value}}",
        "T2012" => "The delete clause of the transform expression must evaluate to a string or array of strings: {{value}}",
        "D2014" => "The size of the sequence allocated by the range operator (..) must not exceed 1e7. Attempted to allocate {{value}}.",
        "D3001" => "Attempting to invoke string function on Infinity or NaN",
        "U1001" => "Stack overflow error: Check for non-terminating recursive function. Consider rewriting as tail-recursive.",
        "U1002" => "Expression evaluation timeout: Check for infinite loop",
        "J0001" => "Input is not valid JSON: {{token}}",
        _ => return None,
    };
    Some(t)
}

/// Substitute the first placeholder with `first` and the second with `second`.
fn render(code: &str, first: Option<&str>, second: Option<&str>) -> String {
    let Some(template) = template(code) else {
        return format!("Unknown error {}", code);
    };
    let mut out = String::with_capacity(template.len() + 16);
    let mut rest = template;
    let mut details = [first, second].into_iter();
    while let Some(start) = rest.find("{{") {
        let Some(len) = rest[start..].find("}}") else {
            break;
        };
        out.push_str(&rest[..start]);
        match details.next().flatten() {
            Some(detail) => out.push_str(detail),
            None => out.push_str(&rest[start..start + len + 2]),
        }
        rest = &rest[start + len + 2..];
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_render_fills_placeholders_in_order() {
        let err = Error::at("T2009", 4).with_token("1").with_value("\"a\"");
        assert_eq!(
            err.message(),
            "The values 1 and \"a\" either side of operator {{token}} must be of the same data type"
        );
        assert_eq!(err.position, Some(4));
    }

    #[test]
    fn test_display_prefixes_code() {
        let err = Error::new("T2002").with_token("+");
        assert_eq!(
            err.to_string(),
            "T2002: The right side of the + operator must evaluate to a number"
        );
    }

    #[test]
    fn test_locate_keeps_existing_position() {
        let err = Error::at("T0410", 3).locate(9, Some("sum"));
        assert_eq!(err.position, Some(3));
        assert_eq!(err.token.as_deref(), Some("sum"));
    }

    #[test]
    fn test_unknown_code() {
        assert!(template("X9999").is_none());
        assert_eq!(Error::new("X9999").message(), "Unknown error X9999");
    }
}
