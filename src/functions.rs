// Native functions
// The `NativeFunction` handle, the shared built-ins registry and the core
// built-in implementations grouped by the kind of value they work on.

use std::fmt;
use std::sync::{Arc, OnceLock};

use indexmap::{IndexMap, IndexSet};
use tracing::warn;

use crate::errors::Result;
use crate::evaluator::Evaluator;
use crate::signature::Signature;
use crate::value::JValue;

/// Implementation of a native function. Receives the evaluator (for calling
/// back into function arguments), the validated arguments and the context value.
pub type Implementation =
    Arc<dyn Fn(&mut Evaluator, &[JValue], &JValue) -> Result<JValue> + Send + Sync>;

/// A function implemented in Rust and callable from expressions.
pub struct NativeFunction {
    pub name: String,
    pub signature: Option<Signature>,
    implementation: Implementation,
}

impl NativeFunction {
    /// Create a native function, compiling its signature if one is given.
    pub fn new<F>(name: &str, signature: Option<&str>, implementation: F) -> Result<Self>
    where
        F: Fn(&mut Evaluator, &[JValue], &JValue) -> Result<JValue> + Send + Sync + 'static,
    {
        let signature = signature.map(|s| Signature::parse(s, name)).transpose()?;
        Ok(NativeFunction {
            name: name.to_string(),
            signature,
            implementation: Arc::new(implementation),
        })
    }

    /// Validate `args` against the signature, then run the implementation.
    pub fn call(&self, evaluator: &mut Evaluator, args: &[JValue], context: &JValue) -> Result<JValue> {
        match &self.signature {
            Some(signature) => {
                let validated = signature.validate(args, context)?;
                (self.implementation)(evaluator, &validated, context)
            }
            None => (self.implementation)(evaluator, args, context),
        }
    }

    /// Number of arguments the function requires.
    pub fn arity(&self) -> usize {
        self.signature.as_ref().map_or(0, |s| s.min_args())
    }

    /// Number of declared parameters, used when partially applying.
    pub fn param_count(&self) -> usize {
        self.signature.as_ref().map_or(0, |s| s.param_count())
    }
}

impl fmt::Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("signature", &self.signature.as_ref().map(|s| s.source()))
            .finish()
    }
}

type Builtin = fn(&mut Evaluator, &[JValue], &JValue) -> Result<JValue>;

const BUILTINS: &[(&str, &str, Builtin)] = &[
    ("sum", "<a<n>:n>", numeric::sum),
    ("count", "<a:n>", array::count),
    ("max", "<a<n>:n>", numeric::max),
    ("min", "<a<n>:n>", numeric::min),
    ("average", "<a<n>:n>", numeric::average),
    ("string", "<x-b?:s>", string::string),
    ("substring", "<s-nn?:s>", string::substring),
    ("lowercase", "<s-:s>", string::lowercase),
    ("uppercase", "<s-:s>", string::uppercase),
    ("length", "<s-:n>", string::length),
    ("boolean", "<x-:b>", boolean::boolean),
    ("not", "<x-:b>", boolean::not),
    ("exists", "<x:b>", boolean::exists),
    ("append", "<xx:a>", array::append),
    ("reverse", "<a:a>", array::reverse),
    ("keys", "<x-:a<s>>", object::keys),
    ("lookup", "<x-s:x>", object::lookup),
    ("clone", "<(oa)-:o>", object::clone),
    ("map", "<af>", higher_order::map),
    ("filter", "<af>", higher_order::filter),
    ("now", "<s?s?:s>", clock::now),
    ("millis", "<:n>", clock::millis),
];

fn registry() -> &'static IndexMap<&'static str, Arc<NativeFunction>> {
    static REGISTRY: OnceLock<IndexMap<&'static str, Arc<NativeFunction>>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        let mut functions = IndexMap::with_capacity(BUILTINS.len());
        for &(name, signature, implementation) in BUILTINS {
            match NativeFunction::new(name, Some(signature), implementation) {
                Ok(function) => {
                    functions.insert(name, Arc::new(function));
                }
                Err(err) => warn!(name, %err, "skipping built-in with invalid signature"),
            }
        }
        functions
    })
}

/// Look up a built-in function by name.
pub fn builtin(name: &str) -> Option<Arc<NativeFunction>> {
    registry().get(name).cloned()
}

/// Names of all built-in functions.
pub fn builtin_names() -> impl Iterator<Item = &'static str> {
    registry().keys().copied()
}

fn arg(args: &[JValue], index: usize) -> JValue {
    args.get(index).cloned().unwrap_or(JValue::Undefined)
}

/// Concatenate two values into an array. Absent values are ignored, a
/// constructed array on the right is kept as a single member.
pub fn append(first: JValue, second: JValue) -> JValue {
    if first.is_undefined() {
        return second;
    }
    if second.is_undefined() {
        return first;
    }
    if first.is_array() && first.is_empty() && matches!(second, JValue::Range(_)) {
        return second;
    }
    let mut items = first.to_vec();
    if !second.is_array() || second.is_cons() {
        items.push(second);
    } else {
        items.extend(second.members());
    }
    JValue::array(items)
}

/// Value of `key` in an object, or the flattened values of `key` across the
/// members of an array.
pub fn lookup(input: &JValue, key: &str) -> JValue {
    match input {
        JValue::Array(..) | JValue::Range(_) => {
            let mut result = Vec::new();
            for member in input.members() {
                match lookup(&member, key) {
                    JValue::Undefined => {}
                    found if found.is_array() => result.extend(found.members()),
                    found => result.push(found),
                }
            }
            JValue::sequence(result)
        }
        JValue::Object(map) => map.get(key).cloned().unwrap_or(JValue::Undefined),
        _ => JValue::Undefined,
    }
}

/// Number of arguments to hand to a function argument of a higher-order built-in.
fn arity(function: &JValue) -> usize {
    match function {
        JValue::Lambda(closure) => closure.params.len(),
        JValue::Native(native) => native.arity(),
        _ => 1,
    }
}

/// Built-in numeric functions
pub mod numeric {
    use super::*;

    fn numbers(value: &JValue) -> Vec<f64> {
        value.members().filter_map(|v| v.as_f64()).collect()
    }

    /// $sum()
    pub fn sum(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        let values = arg(args, 0);
        if values.is_undefined() {
            return Ok(JValue::Undefined);
        }
        Ok(JValue::Number(numbers(&values).iter().sum()))
    }

    /// $max()
    pub fn max(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        Ok(numbers(&arg(args, 0))
            .into_iter()
            .reduce(f64::max)
            .map_or(JValue::Undefined, JValue::Number))
    }

    /// $min()
    pub fn min(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        Ok(numbers(&arg(args, 0))
            .into_iter()
            .reduce(f64::min)
            .map_or(JValue::Undefined, JValue::Number))
    }

    /// $average()
    pub fn average(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        let values = numbers(&arg(args, 0));
        if values.is_empty() {
            return Ok(JValue::Undefined);
        }
        Ok(JValue::Number(values.iter().sum::<f64>() / values.len() as f64))
    }
}

/// Built-in string functions
pub mod string {
    use super::*;
    use crate::utils::stringify;

    /// $string() - Cast value to string
    pub fn string(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        let pretty = arg(args, 1).as_bool().unwrap_or(false);
        Ok(stringify(&arg(args, 0), pretty)?.map_or(JValue::Undefined, JValue::from))
    }

    /// $substring() - Extract by code point offset; negative starts count from the end
    pub fn substring(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        let JValue::String(text) = arg(args, 0) else {
            return Ok(JValue::Undefined);
        };
        let chars: Vec<char> = text.chars().collect();
        let len = chars.len() as i64;
        let start = arg(args, 1).as_f64().unwrap_or(0.0) as i64;
        let start = if start < 0 { (len + start).max(0) } else { start.min(len) };
        let end = match arg(args, 2).as_f64() {
            Some(length) if length <= 0.0 => return Ok(JValue::from("")),
            Some(length) => start.saturating_add(length as i64).min(len),
            None => len,
        };
        Ok(JValue::from(chars[start as usize..end as usize].iter().collect::<String>()))
    }

    /// $lowercase() - Convert to lowercase
    pub fn lowercase(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        Ok(match arg(args, 0) {
            JValue::String(s) => JValue::from(s.to_lowercase()),
            _ => JValue::Undefined,
        })
    }

    /// $uppercase() - Convert to uppercase
    pub fn uppercase(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        Ok(match arg(args, 0) {
            JValue::String(s) => JValue::from(s.to_uppercase()),
            _ => JValue::Undefined,
        })
    }

    /// $length() - Number of code points
    pub fn length(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        Ok(match arg(args, 0) {
            JValue::String(s) => JValue::from(s.chars().count()),
            _ => JValue::Undefined,
        })
    }
}

/// Built-in boolean functions
pub mod boolean {
    use super::*;
    use crate::utils::{boolize, to_boolean};

    pub fn boolean(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        Ok(to_boolean(&arg(args, 0)).map_or(JValue::Undefined, JValue::Bool))
    }

    pub fn not(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        let value = arg(args, 0);
        if value.is_undefined() {
            return Ok(JValue::Undefined);
        }
        Ok(JValue::Bool(!boolize(&value)))
    }

    pub fn exists(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        Ok(JValue::Bool(!arg(args, 0).is_undefined()))
    }
}

/// Built-in array functions
pub mod array {
    use super::*;

    /// $count() - Count array elements
    pub fn count(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        Ok(JValue::from(arg(args, 0).len()))
    }

    /// $append() - Append to array
    pub fn append(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        Ok(super::append(arg(args, 0), arg(args, 1)))
    }

    /// $reverse()
    pub fn reverse(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        let values = arg(args, 0);
        if values.len() <= 1 {
            return Ok(values);
        }
        let mut items = values.to_vec();
        items.reverse();
        Ok(JValue::array(items))
    }
}

/// Built-in object functions
pub mod object {
    use super::*;
    use crate::utils::deep_clone;

    fn collect_keys(value: &JValue, keys: &mut IndexSet<String>) {
        match value {
            JValue::Object(map) => keys.extend(map.keys().cloned()),
            JValue::Array(..) => value.members().for_each(|m| collect_keys(&m, keys)),
            _ => {}
        }
    }

    /// $keys() - Object keys; the union of member keys for arrays
    pub fn keys(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        let mut keys = IndexSet::new();
        collect_keys(&arg(args, 0), &mut keys);
        Ok(JValue::sequence(keys.into_iter().map(JValue::from).collect()))
    }

    /// $lookup()
    pub fn lookup(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        let key = arg(args, 1);
        Ok(super::lookup(&arg(args, 0), key.as_str().unwrap_or_default()))
    }

    /// $clone() - Deep copy through JSON
    pub fn clone(_: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        deep_clone(&arg(args, 0))
    }
}

/// Higher-order built-ins that call back into function arguments
pub mod higher_order {
    use super::*;
    use crate::utils::boolize;

    /// Arguments for the callback: value, then index and whole array if it takes them.
    fn callback_args(function: &JValue, value: JValue, index: usize, whole: &JValue) -> Vec<JValue> {
        let mut args = vec![value];
        let arity = arity(function);
        if arity >= 2 {
            args.push(JValue::from(index));
        }
        if arity >= 3 {
            args.push(whole.clone());
        }
        args
    }

    /// $map()
    pub fn map(evaluator: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        let values = arg(args, 0);
        if values.is_undefined() {
            return Ok(JValue::Undefined);
        }
        let function = arg(args, 1);
        let mut result = Vec::with_capacity(values.len());
        for (index, value) in values.members().enumerate() {
            let call_args = callback_args(&function, value, index, &values);
            let mapped = evaluator.apply(&function, call_args, &JValue::Undefined)?;
            if !mapped.is_undefined() {
                result.push(mapped);
            }
        }
        Ok(JValue::sequence(result))
    }

    /// $filter()
    pub fn filter(evaluator: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        let values = arg(args, 0);
        if values.is_undefined() {
            return Ok(JValue::Undefined);
        }
        let function = arg(args, 1);
        let mut result = Vec::new();
        for (index, value) in values.members().enumerate() {
            let call_args = callback_args(&function, value.clone(), index, &values);
            if boolize(&evaluator.apply(&function, call_args, &JValue::Undefined)?) {
                result.push(value);
            }
        }
        Ok(JValue::sequence(result))
    }
}

/// $now() and $millis(), both reading the evaluation timestamp
pub mod clock {
    use super::*;
    use crate::datetime;

    pub fn now(evaluator: &mut Evaluator, args: &[JValue], _: &JValue) -> Result<JValue> {
        let timezone = arg(args, 1);
        Ok(JValue::from(datetime::format_timestamp(
            evaluator.timestamp(),
            timezone.as_str(),
        )))
    }

    pub fn millis(evaluator: &mut Evaluator, _: &[JValue], _: &JValue) -> Result<JValue> {
        Ok(JValue::from(evaluator.timestamp().timestamp_millis()))
    }
}
