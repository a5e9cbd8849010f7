//! # jsonata-core
//!
//! A JSONata query and transformation engine.
//!
//! An expression is compiled once into a normalized syntax tree and can then
//! be evaluated any number of times against different inputs.
//!
//! ## Architecture
//!
//! - `tokenizer` - Splits expression source into tokens
//! - `parser` - Pratt parser producing a raw tree (converts JSONata strings to AST)
//! - `normalize` - Rewrites the raw tree into paths, resolves `%` and marks tail calls
//! - `evaluator` - Expression evaluator (executes AST against data)
//! - `watchdog` - Depth and time bounds applied during evaluation
//! - `functions` - Native function handle and the built-in function registry
//! - `datetime` - Evaluation timestamp for `$now()` / `$millis()`
//! - `signature` - Function signature validation
//! - `frame` - Lexical scopes
//! - `value` - The dynamic value model
//! - `utils` - Utility functions and helpers
//! - `ast` - Abstract Syntax Tree definitions
//!
//! ## Example
//!
//! ```
//! use jsonata_core::{Jsonata, JValue};
//!
//! let expr = Jsonata::new("orders[price > 100].product").unwrap();
//! let data = JValue::from(serde_json::json!({
//!     "orders": [
//!         {"product": "A", "price": 150},
//!         {"product": "B", "price": 50}
//!     ]
//! }));
//! assert_eq!(expr.evaluate(&data).unwrap(), JValue::from("A"));
//! ```

use std::sync::Arc;

use indexmap::IndexMap;
use tracing::debug;

pub mod ast;
pub mod datetime;
pub mod errors;
pub mod evaluator;
pub mod frame;
pub mod functions;
mod normalize;
pub mod parser;
pub mod signature;
pub mod tokenizer;
pub mod utils;
pub mod value;
pub mod watchdog;

pub use errors::{Error, Result};
pub use functions::NativeFunction;
pub use signature::Signature;
pub use value::JValue;
pub use watchdog::RuntimeBounds;

use crate::ast::AstNode;
use crate::evaluator::Evaluator;
use crate::frame::Frame;
use crate::utils::to_json_value;
use crate::watchdog::Watchdog;

/// Per-call variable bindings, keyed by name without the leading `$`.
pub type Bindings = IndexMap<String, JValue>;

/// Compile-time options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ParseOptions {
    /// Collect syntax errors instead of failing on the first one.
    pub recover: bool,
}

/// A compiled JSONata expression that can be evaluated against data.
///
/// Compile an expression once, then evaluate it multiple times against
/// different inputs. Compiled expressions are `Send + Sync`; every evaluation
/// builds its own scope chain.
#[derive(Debug, Clone)]
pub struct Jsonata {
    /// The normalized Abstract Syntax Tree
    ast: AstNode,
    errors: Vec<Error>,
    bounds: RuntimeBounds,
    variables: IndexMap<String, serde_json::Value>,
    functions: IndexMap<String, Arc<NativeFunction>>,
}

impl Jsonata {
    /// Compile an expression.
    ///
    /// # Errors
    ///
    /// Returns the first lexical, syntax or normalization error.
    pub fn new(source: &str) -> Result<Self> {
        Jsonata::with_options(source, ParseOptions::default())
    }

    /// Compile an expression with explicit options. In recover mode syntax
    /// errors are collected into [`Jsonata::errors`] instead.
    pub fn with_options(source: &str, options: ParseOptions) -> Result<Self> {
        let (ast, errors) = if options.recover {
            parser::parse_recovering(source)?
        } else {
            (parser::parse(source)?, Vec::new())
        };
        debug!(
            length = source.chars().count(),
            recover = options.recover,
            errors = errors.len(),
            "compiled expression"
        );
        Ok(Jsonata {
            ast,
            errors,
            bounds: RuntimeBounds::default(),
            variables: IndexMap::new(),
            functions: IndexMap::new(),
        })
    }

    /// The normalized syntax tree.
    pub fn ast(&self) -> &AstNode {
        &self.ast
    }

    /// Errors collected while compiling in recover mode.
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Replace the depth and time limits applied to every evaluation.
    pub fn set_runtime_bounds(&mut self, bounds: RuntimeBounds) {
        self.bounds = bounds;
    }

    /// Bind a variable for every evaluation of this expression.
    pub fn assign(&mut self, name: &str, value: serde_json::Value) {
        self.variables.insert(name.to_string(), value);
    }

    /// Register a native function for every evaluation of this expression.
    ///
    /// # Errors
    ///
    /// Returns a signature error if `signature` does not compile.
    pub fn register_function<F>(&mut self, name: &str, signature: Option<&str>, implementation: F) -> Result<()>
    where
        F: Fn(&mut Evaluator, &[JValue], &JValue) -> Result<JValue> + Send + Sync + 'static,
    {
        let function = NativeFunction::new(name, signature, implementation)?;
        self.functions.insert(name.to_string(), Arc::new(function));
        Ok(())
    }

    /// Evaluate against `input`.
    pub fn evaluate(&self, input: &JValue) -> Result<JValue> {
        self.evaluate_with_bindings(input, &Bindings::new())
    }

    /// Evaluate against `input` with extra variables for this call only.
    ///
    /// # Errors
    ///
    /// `S0500` if the expression was compiled with syntax errors, otherwise
    /// the first error raised during evaluation.
    pub fn evaluate_with_bindings(&self, input: &JValue, bindings: &Bindings) -> Result<JValue> {
        if !self.errors.is_empty() {
            return Err(Error::new("S0500"));
        }

        let environment = Frame::root();
        for (name, value) in &self.variables {
            environment.bind(name.as_str(), JValue::from(value));
        }
        for (name, function) in &self.functions {
            environment.bind(name.as_str(), JValue::Native(Arc::clone(function)));
        }

        let frame = Frame::child(&environment);
        for (name, value) in bindings {
            frame.bind(name.as_str(), value.clone());
        }
        frame.bind("$", input.clone());

        // A top-level array is wrapped so that paths map over its members.
        let input = if input.is_array() && !input.is_sequence() {
            JValue::sequence(vec![input.clone()]).with_flags(|flags| flags.outer_wrapper = true)
        } else {
            input.clone()
        };

        debug!(
            timeout = ?self.bounds.timeout,
            max_depth = self.bounds.max_depth,
            bindings = bindings.len(),
            "evaluating expression"
        );
        let mut evaluator = Evaluator::with_hook(Box::new(Watchdog::new(self.bounds)));
        let result = evaluator.evaluate(&self.ast, &input, &frame);
        match &result {
            Ok(value) => debug!(undefined = value.is_undefined(), "evaluation finished"),
            Err(error) => debug!(code = error.code, position = ?error.position, "evaluation failed"),
        }
        result
    }

    /// Evaluate against a JSON document and render the result as JSON.
    /// Blank input evaluates against no input; an undefined result renders as `null`.
    pub fn evaluate_json(&self, input: &str) -> Result<String> {
        let input = if input.trim().is_empty() {
            JValue::Undefined
        } else {
            JValue::from_json_str(input).map_err(|e| Error::new("J0001").with_token(e.to_string()))?
        };
        let result = self.evaluate(&input)?;
        serde_json::to_string(&to_json_value(&result)?).map_err(|e| Error::new("D3001").with_token(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn assert_send_sync<T: Send + Sync>() {}

    #[test]
    fn test_compiled_expression_is_shareable() {
        assert_send_sync::<Jsonata>();
    }

    #[test]
    fn test_evaluate_json() {
        let expr = Jsonata::new("a.b").unwrap();
        assert_eq!(expr.evaluate_json(r#"{"a": [{"b": 1}, {"b": 2}]}"#).unwrap(), "[1,2]");
        assert_eq!(expr.evaluate_json(r#"{"x": 1}"#).unwrap(), "null");
        assert_eq!(expr.evaluate_json("{oops").unwrap_err().code, "J0001");
    }

    #[test]
    fn test_assign_and_bindings() {
        let mut expr = Jsonata::new("$rate * $qty").unwrap();
        expr.assign("rate", json!(2.5));
        let mut bindings = Bindings::new();
        bindings.insert("qty".to_string(), JValue::from(4));
        let result = expr.evaluate_with_bindings(&JValue::Undefined, &bindings).unwrap();
        assert_eq!(result, JValue::from(10));
        assert!(expr.evaluate(&JValue::Undefined).unwrap().is_undefined());
    }

    #[test]
    fn test_register_function() {
        let mut expr = Jsonata::new("$double(21)").unwrap();
        expr.register_function("double", Some("<n:n>"), |_, args, _| {
            Ok(JValue::from(args[0].as_f64().unwrap_or_default() * 2.0))
        })
        .unwrap();
        assert_eq!(expr.evaluate(&JValue::Undefined).unwrap(), JValue::from(42));
        let err = expr.register_function("bad", Some("<s<n>>"), |_, _, _| Ok(JValue::Null));
        assert!(err.is_err());
        let err = expr.register_function("open", Some("<("), |_, _, _| Ok(JValue::Null));
        assert_eq!(err.unwrap_err().code, "S0401");
    }

    #[test]
    fn test_recover_mode() {
        let expr = Jsonata::with_options("[1, 2", ParseOptions { recover: true }).unwrap();
        assert!(!expr.errors().is_empty());
        assert_eq!(expr.evaluate(&JValue::Undefined).unwrap_err().code, "S0500");
        assert!(Jsonata::new("[1, 2").is_err());
    }

    #[test]
    fn test_runtime_bounds() {
        let mut expr = Jsonata::new("($f := function($n){ $n = 0 ? 0 : 1 + $f($n - 1) }; $f(500))").unwrap();
        expr.set_runtime_bounds(RuntimeBounds { timeout: None, max_depth: 50 });
        assert_eq!(expr.evaluate(&JValue::Undefined).unwrap_err().code, "U1001");
    }
}
