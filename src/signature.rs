// Function signature parsing and argument validation
// A signature such as `<s-nn?:s>` is compiled into a regex over one-letter
// type symbols; validation matches the supplied arguments against it,
// substitutes the context value and wraps scalars passed to array params.

use regex::Regex;

use crate::errors::{Error, Result};
use crate::value::JValue;

/// Parameter type
#[derive(Debug, Clone, PartialEq)]
pub enum ParamType {
    String,
    Number,
    Boolean,
    Null,
    Object,
    Array,
    Function,
    /// Any JSON value (`j`)
    Json,
    /// Anything (`x`)
    Any,
    /// `(sn...)` alternation
    Choice(String),
}

impl ParamType {
    fn symbol_class(&self) -> String {
        match self {
            ParamType::String => "[sm]".into(),
            ParamType::Number => "[nm]".into(),
            ParamType::Boolean => "[bm]".into(),
            ParamType::Null => "[lm]".into(),
            ParamType::Object => "[om]".into(),
            ParamType::Array | ParamType::Any => "[asnblfom]".into(),
            ParamType::Function => "f".into(),
            ParamType::Json => "[asnblom]".into(),
            ParamType::Choice(choice) => format!("[{}m]", choice),
        }
    }
}

/// Function parameter definition
#[derive(Debug, Clone)]
pub struct Parameter {
    pub param_type: ParamType,
    /// Regex fragment including any `?`/`+` quantifier.
    regex: String,
    /// `-`: the context value is used when the argument is absent.
    pub context: bool,
    /// `a<n>` / `f<...>` type parameter
    pub subtype: Option<String>,
}

impl Parameter {
    pub fn optional(&self) -> bool {
        self.regex.ends_with('?')
    }
}

/// Compiled function signature
#[derive(Debug, Clone)]
pub struct Signature {
    source: String,
    function_name: String,
    params: Vec<Parameter>,
    pattern: Regex,
}

impl PartialEq for Signature {
    fn eq(&self, other: &Self) -> bool {
        self.source == other.source && self.function_name == other.function_name
    }
}

/// Position of the bracket closing the one at `start`.
fn find_closing_bracket(chars: &[char], start: usize, open: char, close: char) -> Option<usize> {
    let mut depth = 1;
    for (position, &symbol) in chars.iter().enumerate().skip(start + 1) {
        if symbol == close {
            depth -= 1;
            if depth == 0 {
                return Some(position);
            }
        } else if symbol == open {
            depth += 1;
        }
    }
    None
}

/// One-letter type symbol of a value.
pub fn type_symbol(value: &JValue) -> char {
    match value {
        JValue::Undefined => 'm',
        JValue::Null => 'l',
        JValue::Lambda(_) | JValue::Native(_) | JValue::Regex(_) => 'f',
        JValue::String(_) => 's',
        JValue::Number(_) => 'n',
        JValue::Bool(_) => 'b',
        JValue::Array(..) | JValue::Range(_) => 'a',
        JValue::Object(_) => 'o',
    }
}

fn array_item_description(subtype: &str) -> &'static str {
    match subtype.chars().next() {
        Some('a') => "arrays",
        Some('b') => "booleans",
        Some('f') => "functions",
        Some('n') => "numbers",
        Some('o') => "objects",
        Some('s') => "strings",
        _ => "values",
    }
}

impl Signature {
    /// Compile a signature string such as `<a<n>:n>`.
    pub fn parse(source: &str, function_name: &str) -> Result<Self> {
        let chars: Vec<char> = source.chars().collect();
        let mut params: Vec<Parameter> = Vec::new();
        let mut position = 1;

        while position < chars.len() {
            let symbol = chars[position];
            if symbol == ':' {
                // return type is not checked
                break;
            }
            let simple = match symbol {
                's' => Some(ParamType::String),
                'n' => Some(ParamType::Number),
                'b' => Some(ParamType::Boolean),
                'l' => Some(ParamType::Null),
                'o' => Some(ParamType::Object),
                'a' => Some(ParamType::Array),
                'f' => Some(ParamType::Function),
                'j' => Some(ParamType::Json),
                'x' => Some(ParamType::Any),
                _ => None,
            };
            if let Some(param_type) = simple {
                params.push(Parameter {
                    regex: param_type.symbol_class(),
                    param_type,
                    context: false,
                    subtype: None,
                });
            } else {
                match symbol {
                    '-' => {
                        if let Some(prev) = params.last_mut() {
                            prev.context = true;
                            prev.regex.push('?');
                        }
                    }
                    '?' | '+' => {
                        if let Some(prev) = params.last_mut() {
                            prev.regex.push(symbol);
                        }
                    }
                    '(' => {
                        let end = find_closing_bracket(&chars, position, '(', ')')
                            .ok_or_else(|| Error::at("S0401", position))?;
                        let choice: String = chars[position + 1..end].iter().collect();
                        if choice.contains('<') {
                            return Err(Error::at("S0402", position));
                        }
                        let param_type = ParamType::Choice(choice);
                        params.push(Parameter {
                            regex: param_type.symbol_class(),
                            param_type,
                            context: false,
                            subtype: None,
                        });
                        position = end;
                    }
                    '<' => {
                        let Some(prev) = params
                            .last_mut()
                            .filter(|p| matches!(p.param_type, ParamType::Array | ParamType::Function))
                        else {
                            return Err(Error::at("S0401", position));
                        };
                        let end = find_closing_bracket(&chars, position, '<', '>')
                            .ok_or_else(|| Error::at("S0401", position))?;
                        prev.subtype = Some(chars[position + 1..end].iter().collect());
                        position = end;
                    }
                    _ => {}
                }
            }
            position += 1;
        }

        let mut regex_source = String::from("^");
        for param in &params {
            regex_source.push('(');
            regex_source.push_str(&param.regex);
            regex_source.push(')');
        }
        regex_source.push('$');
        let pattern = Regex::new(&regex_source)
            .map_err(|e| Error::new("S0401").with_token(e.to_string()))?;

        Ok(Signature {
            source: source.to_string(),
            function_name: function_name.to_string(),
            params,
            pattern,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    /// Number of declared parameters.
    pub fn param_count(&self) -> usize {
        self.params.len()
    }

    /// Parameters that must be supplied.
    pub fn min_args(&self) -> usize {
        self.params.iter().filter(|p| !p.optional()).count()
    }

    /// Validate `args` against the signature, returning the coerced argument list.
    pub fn validate(&self, args: &[JValue], context: &JValue) -> Result<Vec<JValue>> {
        let supplied: String = args.iter().map(type_symbol).collect();
        let Some(captures) = self.pattern.captures(&supplied) else {
            return Err(self.mismatch(&supplied));
        };

        let mut validated = Vec::with_capacity(self.params.len());
        let mut arg_index = 0;
        for (index, param) in self.params.iter().enumerate() {
            let matched = captures.get(index + 1).map_or("", |m| m.as_str());
            if matched.is_empty() {
                if param.context {
                    let context_type = type_symbol(context).to_string();
                    let accepts = Regex::new(&format!("^(?:{})$", param.regex))
                        .map(|re| re.is_match(&context_type))
                        .unwrap_or(false);
                    if !accepts {
                        return Err(Error::new("T0411")
                            .with_token((arg_index + 1).to_string())
                            .with_value(self.function_name.clone()));
                    }
                    validated.push(context.clone());
                } else {
                    validated.push(args.get(arg_index).cloned().unwrap_or(JValue::Undefined));
                    arg_index += 1;
                }
                continue;
            }

            for single in matched.chars() {
                let arg = args.get(arg_index).cloned().unwrap_or(JValue::Undefined);
                if param.param_type == ParamType::Array {
                    if single == 'm' {
                        validated.push(JValue::Undefined);
                    } else {
                        self.check_array_subtype(param, single, matched, &arg, arg_index)?;
                        if single == 'a' {
                            validated.push(arg);
                        } else {
                            validated.push(JValue::array(vec![arg]));
                        }
                    }
                } else {
                    validated.push(arg);
                }
                arg_index += 1;
            }
        }
        Ok(validated)
    }

    fn check_array_subtype(
        &self,
        param: &Parameter,
        single: char,
        matched: &str,
        arg: &JValue,
        arg_index: usize,
    ) -> Result<()> {
        let Some(subtype) = param.subtype.as_deref() else {
            return Ok(());
        };
        let ok = if single != 'a' {
            matched == subtype
        } else {
            let mut members = arg.members();
            match members.next() {
                None => true,
                Some(first) => {
                    let item_type = type_symbol(&first);
                    subtype.starts_with(item_type)
                        && members.all(|m| type_symbol(&m) == item_type)
                }
            }
        };
        if ok {
            Ok(())
        } else {
            Err(Error::new("T0412")
                .with_token((arg_index + 1).to_string())
                .with_value(array_item_description(subtype)))
        }
    }

    /// T0410 naming the first argument at which the signature stops matching.
    fn mismatch(&self, supplied: &str) -> Error {
        let mut partial = String::from("^");
        let mut good_to = 0;
        for param in &self.params {
            partial.push_str(&param.regex);
            match Regex::new(&partial).ok().and_then(|re| re.find(supplied)) {
                Some(m) => good_to = m.end(),
                None => break,
            }
        }
        Error::new("T0410")
            .with_token((good_to + 1).to_string())
            .with_value(self.function_name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvalue;

    #[test]
    fn test_signature_arity() {
        let sig = Signature::parse("<s-nn?:s>", "substring").unwrap();
        assert_eq!(sig.param_count(), 3);
        assert_eq!(sig.min_args(), 1);
        assert!(sig.params()[0].context);
        assert!(sig.params()[2].optional());
    }

    #[test]
    fn test_scalar_wrapped_for_array_param() {
        let sig = Signature::parse("<a:n>", "count").unwrap();
        let args = sig.validate(&[jvalue!(5i64)], &JValue::Undefined).unwrap();
        assert_eq!(args, vec![jvalue!([5i64])]);
    }

    #[test]
    fn test_missing_arg_takes_context() {
        let sig = Signature::parse("<s-:s>", "uppercase").unwrap();
        let args = sig.validate(&[], &jvalue!("hello")).unwrap();
        assert_eq!(args, vec![jvalue!("hello")]);
    }

    #[test]
    fn test_context_type_checked() {
        let sig = Signature::parse("<s-:s>", "uppercase").unwrap();
        let err = sig.validate(&[], &jvalue!(42i64)).unwrap_err();
        assert_eq!(err.code, "T0411");
    }

    #[test]
    fn test_mismatch_reports_argument_index() {
        let sig = Signature::parse("<s-nn?:s>", "substring").unwrap();
        let err = sig.validate(&[jvalue!("abc"), jvalue!("x")], &JValue::Undefined).unwrap_err();
        assert_eq!(err.code, "T0410");
        assert_eq!(err.token.as_deref(), Some("2"));
        assert_eq!(err.value.as_deref(), Some("substring"));
    }

    #[test]
    fn test_array_subtype() {
        let sig = Signature::parse("<a<n>:n>", "sum").unwrap();
        assert!(sig.validate(&[jvalue!([1i64, 2i64])], &JValue::Undefined).is_ok());
        assert!(sig.validate(&[jvalue!([])], &JValue::Undefined).is_ok());
        let err = sig.validate(&[jvalue!([1i64, "a"])], &JValue::Undefined).unwrap_err();
        assert_eq!(err.code, "T0412");
        assert_eq!(err.message(), "Argument 1 must be an array of numbers");
    }

    #[test]
    fn test_choice_and_plus() {
        let sig = Signature::parse("<(sn)+:s>", "join").unwrap();
        let args = sig
            .validate(&[jvalue!("a"), jvalue!(1i64), jvalue!("b")], &JValue::Undefined)
            .unwrap();
        assert_eq!(args.len(), 3);
        assert!(sig.validate(&[jvalue!(true)], &JValue::Undefined).is_err());
    }

    #[test]
    fn test_type_parameters_only_on_arrays_and_functions() {
        assert_eq!(Signature::parse("<s<n>>", "f").unwrap_err().code, "S0401");
        assert_eq!(Signature::parse("<(a<n>)>", "f").unwrap_err().code, "S0402");
        assert_eq!(Signature::parse("<(", "f").unwrap_err().code, "S0401");
        assert_eq!(Signature::parse("<a<", "f").unwrap_err().code, "S0401");
    }

    #[test]
    fn test_missing_optional_array_is_undefined() {
        let sig = Signature::parse("<a?:a>", "f").unwrap();
        let args = sig.validate(&[JValue::Undefined], &JValue::Undefined).unwrap();
        assert_eq!(args, vec![JValue::Undefined]);
    }
}
