// JValue: Rc-wrapped dynamic value for O(1) cloning
// Covers JSON data plus the engine's internal kinds: query-result sequences,
// lazy ranges, closures, native functions and compiled regex literals.

use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use indexmap::IndexMap;
use serde::de::{self, Deserializer, MapAccess, SeqAccess, Visitor};
use serde::ser::{Serialize, SerializeMap, SerializeSeq, Serializer};

use crate::ast::AstNode;
use crate::frame::Frame;
use crate::functions::NativeFunction;
use crate::signature::Signature;

/// A JSON-like value with O(1) clone semantics via Rc-wrapping.
///
/// Arrays carry [`SequenceFlags`] so that query-result sequences can be told
/// apart from arrays the user constructed. `Range` is an inclusive integer
/// run produced by the `..` operator that is only materialized on demand.
#[derive(Clone, Debug)]
pub enum JValue {
    // Standard JSON types
    Null,
    Bool(bool),
    Number(f64),
    String(Rc<str>),
    Array(Rc<Vec<JValue>>, SequenceFlags),
    Object(Rc<IndexMap<String, JValue>>),

    // Internal types
    Undefined,
    Range(IntRange),
    Lambda(Rc<Closure>),
    Native(Arc<NativeFunction>),
    Regex(Arc<RegexLiteral>),
}

/// Flags distinguishing query-result sequences from plain arrays.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SequenceFlags {
    /// Produced by path evaluation; collapses when it has 0 or 1 members.
    pub sequence: bool,
    /// Keep a single member wrapped (the `[]` suffix).
    pub keep_singleton: bool,
    /// Members are `{"@": value, ...bindings}` tuples.
    pub tuple_stream: bool,
    /// The top-level input array wrapped for evaluation.
    pub outer_wrapper: bool,
    /// Built by an array constructor; never flattened into a surrounding sequence.
    pub cons: bool,
}

/// Inclusive integer range `start..=end`, never empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IntRange {
    pub start: i64,
    pub end: i64,
}

impl IntRange {
    #[inline]
    pub fn len(&self) -> usize {
        (self.end - self.start + 1) as usize
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        false
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<JValue> {
        if index < self.len() {
            Some(JValue::Number((self.start + index as i64) as f64))
        } else {
            None
        }
    }
}

/// A closure created by evaluating a `function(...) {...}` definition, a
/// partial application, a tail-call thunk or a transform expression.
pub struct Closure {
    pub params: Vec<String>,
    pub body: Arc<AstNode>,
    pub signature: Option<Arc<Signature>>,
    /// Context value at the point of definition.
    pub input: JValue,
    pub environment: Rc<Frame>,
    pub kind: ClosureKind,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ClosureKind {
    /// Evaluates `body` with the parameters bound.
    Lambda,
    /// A deferred tail call; `body` is the call node.
    Thunk,
    /// `body` is a transform node applied to a deep copy of the argument.
    Transform,
}

impl fmt::Debug for Closure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Closure")
            .field("params", &self.params)
            .field("kind", &self.kind)
            .finish_non_exhaustive()
    }
}

/// A compiled `/pattern/flags` literal.
pub struct RegexLiteral {
    pub pattern: String,
    pub flags: String,
    compiled: regex::Regex,
}

impl RegexLiteral {
    pub fn new(pattern: &str, flags: &str) -> Result<Self, regex::Error> {
        let compiled = regex::RegexBuilder::new(pattern)
            .case_insensitive(flags.contains('i'))
            .multi_line(flags.contains('m'))
            .build()?;
        Ok(RegexLiteral {
            pattern: pattern.to_string(),
            flags: flags.to_string(),
            compiled,
        })
    }

    #[inline]
    pub fn regex(&self) -> &regex::Regex {
        &self.compiled
    }
}

impl fmt::Debug for RegexLiteral {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}/{}", self.pattern, self.flags)
    }
}

impl PartialEq for RegexLiteral {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern && self.flags == other.flags
    }
}

// ── Type checks ──────────────────────────────────────────────────────────────

impl JValue {
    #[inline]
    pub fn is_null(&self) -> bool {
        matches!(self, JValue::Null)
    }

    #[inline]
    pub fn is_undefined(&self) -> bool {
        matches!(self, JValue::Undefined)
    }

    #[inline]
    pub fn is_bool(&self) -> bool {
        matches!(self, JValue::Bool(_))
    }

    #[inline]
    pub fn is_number(&self) -> bool {
        matches!(self, JValue::Number(_))
    }

    #[inline]
    pub fn is_string(&self) -> bool {
        matches!(self, JValue::String(_))
    }

    #[inline]
    pub fn is_array(&self) -> bool {
        matches!(self, JValue::Array(..) | JValue::Range(_))
    }

    #[inline]
    pub fn is_object(&self) -> bool {
        matches!(self, JValue::Object(_))
    }

    #[inline]
    pub fn is_lambda(&self) -> bool {
        matches!(self, JValue::Lambda(_))
    }

    #[inline]
    pub fn is_native(&self) -> bool {
        matches!(self, JValue::Native(_))
    }

    #[inline]
    pub fn is_function(&self) -> bool {
        matches!(self, JValue::Lambda(_) | JValue::Native(_))
    }

    /// Anything that can be applied to arguments, regex literals included.
    #[inline]
    pub fn is_function_like(&self) -> bool {
        matches!(self, JValue::Lambda(_) | JValue::Native(_) | JValue::Regex(_))
    }

    #[inline]
    pub fn is_regex(&self) -> bool {
        matches!(self, JValue::Regex(_))
    }

    /// Integral number (no fractional part).
    #[inline]
    pub fn is_integer(&self) -> bool {
        matches!(self, JValue::Number(n) if n.fract() == 0.0)
    }
}

// ── Sequence flags ───────────────────────────────────────────────────────────

impl JValue {
    /// Flags of an array value; ranges and non-arrays report none.
    #[inline]
    pub fn flags(&self) -> SequenceFlags {
        match self {
            JValue::Array(_, flags) => *flags,
            _ => SequenceFlags::default(),
        }
    }

    #[inline]
    pub fn is_sequence(&self) -> bool {
        self.flags().sequence
    }

    #[inline]
    pub fn is_tuple_stream(&self) -> bool {
        self.flags().tuple_stream
    }

    #[inline]
    pub fn keeps_singleton(&self) -> bool {
        self.flags().keep_singleton
    }

    #[inline]
    pub fn is_outer_wrapper(&self) -> bool {
        self.flags().outer_wrapper
    }

    #[inline]
    pub fn is_cons(&self) -> bool {
        self.flags().cons
    }

    /// Return the array with its flags adjusted. A range is materialized first.
    pub fn with_flags(self, update: impl FnOnce(&mut SequenceFlags)) -> JValue {
        match self {
            JValue::Array(items, mut flags) => {
                update(&mut flags);
                JValue::Array(items, flags)
            }
            JValue::Range(range) => {
                let mut flags = SequenceFlags::default();
                update(&mut flags);
                JValue::Array(Rc::new(range_members(range).collect()), flags)
            }
            other => other,
        }
    }
}

// ── Extraction ───────────────────────────────────────────────────────────────

impl JValue {
    #[inline]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            JValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    #[inline]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            JValue::Number(n) => {
                let f = *n;
                if f.fract() == 0.0 && f >= i64::MIN as f64 && f <= i64::MAX as f64 {
                    Some(f as i64)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    #[inline]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            JValue::String(s) => Some(s),
            _ => None,
        }
    }

    #[inline]
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            JValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Borrow the members of a materialized array.
    #[inline]
    pub fn as_array(&self) -> Option<&Vec<JValue>> {
        match self {
            JValue::Array(arr, _) => Some(arr),
            _ => None,
        }
    }

    #[inline]
    pub fn as_object(&self) -> Option<&IndexMap<String, JValue>> {
        match self {
            JValue::Object(map) => Some(map),
            _ => None,
        }
    }

    /// Get a mutable reference to the inner Vec, cloning if shared (Rc::make_mut).
    pub fn as_array_mut(&mut self) -> Option<&mut Vec<JValue>> {
        if let JValue::Range(range) = *self {
            *self = JValue::Array(Rc::new(range_members(range).collect()), SequenceFlags::default());
        }
        match self {
            JValue::Array(arr, _) => Some(Rc::make_mut(arr)),
            _ => None,
        }
    }

    /// Get a mutable reference to the inner IndexMap, cloning if shared (Rc::make_mut).
    #[inline]
    pub fn as_object_mut(&mut self) -> Option<&mut IndexMap<String, JValue>> {
        match self {
            JValue::Object(map) => Some(Rc::make_mut(map)),
            _ => None,
        }
    }

    /// Index into an object by key.
    #[inline]
    pub fn get(&self, key: &str) -> Option<&JValue> {
        match self {
            JValue::Object(map) => map.get(key),
            _ => None,
        }
    }

    /// Index into an array (or range) by position.
    pub fn get_index(&self, index: usize) -> Option<JValue> {
        match self {
            JValue::Array(arr, _) => arr.get(index).cloned(),
            JValue::Range(range) => range.get(index),
            _ => None,
        }
    }

    /// Number of members of an array or range; 0 for anything else.
    pub fn len(&self) -> usize {
        match self {
            JValue::Array(arr, _) => arr.len(),
            JValue::Range(range) => range.len(),
            _ => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Iterate the members of an array or range. Non-arrays yield nothing.
    pub fn members(&self) -> Members<'_> {
        match self {
            JValue::Array(arr, _) => Members::Slice(arr.iter()),
            JValue::Range(range) => Members::Range(range.start..=range.end),
            _ => Members::Slice([].iter()),
        }
    }

    /// Owned copy of the members; scalars become a one-element vector.
    pub fn to_vec(&self) -> Vec<JValue> {
        match self {
            JValue::Array(arr, _) => arr.as_ref().clone(),
            JValue::Range(range) => range_members(*range).collect(),
            other => vec![other.clone()],
        }
    }
}

fn range_members(range: IntRange) -> impl Iterator<Item = JValue> {
    (range.start..=range.end).map(|i| JValue::Number(i as f64))
}

/// Iterator over array members that hides the lazy range representation.
pub enum Members<'a> {
    Slice(std::slice::Iter<'a, JValue>),
    Range(std::ops::RangeInclusive<i64>),
}

impl Iterator for Members<'_> {
    type Item = JValue;

    fn next(&mut self) -> Option<JValue> {
        match self {
            Members::Slice(iter) => iter.next().cloned(),
            Members::Range(iter) => iter.next().map(|i| JValue::Number(i as f64)),
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        match self {
            Members::Slice(iter) => iter.size_hint(),
            Members::Range(iter) => iter.size_hint(),
        }
    }
}

// ── Constructors ─────────────────────────────────────────────────────────────

impl JValue {
    #[inline]
    pub fn string(s: impl Into<Rc<str>>) -> Self {
        JValue::String(s.into())
    }

    #[inline]
    pub fn array(v: Vec<JValue>) -> Self {
        JValue::Array(Rc::new(v), SequenceFlags::default())
    }

    /// A query-result sequence.
    #[inline]
    pub fn sequence(v: Vec<JValue>) -> Self {
        JValue::Array(
            Rc::new(v),
            SequenceFlags {
                sequence: true,
                ..SequenceFlags::default()
            },
        )
    }

    #[inline]
    pub fn object(m: IndexMap<String, JValue>) -> Self {
        JValue::Object(Rc::new(m))
    }

    #[inline]
    pub fn range(start: i64, end: i64) -> Self {
        JValue::Range(IntRange { start, end })
    }

    #[inline]
    pub fn lambda(closure: Closure) -> Self {
        JValue::Lambda(Rc::new(closure))
    }

    #[inline]
    pub fn native(function: Arc<NativeFunction>) -> Self {
        JValue::Native(function)
    }
}

// ── From impls ───────────────────────────────────────────────────────────────

impl From<bool> for JValue {
    #[inline]
    fn from(b: bool) -> Self {
        JValue::Bool(b)
    }
}

impl From<i64> for JValue {
    #[inline]
    fn from(n: i64) -> Self {
        JValue::Number(n as f64)
    }
}

impl From<i32> for JValue {
    #[inline]
    fn from(n: i32) -> Self {
        JValue::Number(n as f64)
    }
}

impl From<usize> for JValue {
    #[inline]
    fn from(n: usize) -> Self {
        JValue::Number(n as f64)
    }
}

impl From<f64> for JValue {
    #[inline]
    fn from(n: f64) -> Self {
        JValue::Number(n)
    }
}

impl From<&str> for JValue {
    #[inline]
    fn from(s: &str) -> Self {
        JValue::String(s.into())
    }
}

impl From<String> for JValue {
    #[inline]
    fn from(s: String) -> Self {
        JValue::String(s.into())
    }
}

impl From<Vec<JValue>> for JValue {
    #[inline]
    fn from(v: Vec<JValue>) -> Self {
        JValue::array(v)
    }
}

impl From<IndexMap<String, JValue>> for JValue {
    #[inline]
    fn from(m: IndexMap<String, JValue>) -> Self {
        JValue::Object(Rc::new(m))
    }
}

// ── PartialEq ────────────────────────────────────────────────────────────────

/// Structural equality; sequence flags are ignored and ranges compare by members.
impl PartialEq for JValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (JValue::Null, JValue::Null) => true,
            (JValue::Undefined, JValue::Undefined) => true,
            (JValue::Bool(a), JValue::Bool(b)) => a == b,
            (JValue::Number(a), JValue::Number(b)) => a == b,
            (JValue::String(a), JValue::String(b)) => a == b,
            (JValue::Array(a, _), JValue::Array(b, _)) => a == b,
            (JValue::Range(a), JValue::Range(b)) => a == b,
            (JValue::Array(..), JValue::Range(_)) | (JValue::Range(_), JValue::Array(..)) => {
                self.len() == other.len() && self.members().zip(other.members()).all(|(x, y)| x == y)
            }
            (JValue::Object(a), JValue::Object(b)) => a == b,
            (JValue::Lambda(a), JValue::Lambda(b)) => Rc::ptr_eq(a, b),
            (JValue::Native(a), JValue::Native(b)) => Arc::ptr_eq(a, b) || a.name == b.name,
            (JValue::Regex(a), JValue::Regex(b)) => a == b,
            _ => false,
        }
    }
}

// ── Display ──────────────────────────────────────────────────────────────────

impl fmt::Display for JValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JValue::Null => write!(f, "null"),
            JValue::Undefined => write!(f, "undefined"),
            JValue::Bool(b) => write!(f, "{}", b),
            JValue::Number(n) => format_number(*n, f),
            JValue::String(s) => write!(f, "\"{}\"", escape_json_string(s)),
            JValue::Array(..) | JValue::Range(_) => {
                write!(f, "[")?;
                for (i, v) in self.members().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}", v)?;
                }
                write!(f, "]")
            }
            JValue::Object(map) => {
                write!(f, "{{")?;
                for (i, (k, v)) in map.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "\"{}\":{}", escape_json_string(k), v)?;
                }
                write!(f, "}}")
            }
            JValue::Lambda(_) | JValue::Native(_) => write!(f, "\"\""),
            JValue::Regex(r) => write!(f, "\"{:?}\"", r),
        }
    }
}

pub(crate) fn escape_json_string(s: &str) -> String {
    let mut result = String::with_capacity(s.len());
    for c in s.chars() {
        match c {
            '"' => result.push_str("\\\""),
            '\\' => result.push_str("\\\\"),
            '\n' => result.push_str("\\n"),
            '\r' => result.push_str("\\r"),
            '\t' => result.push_str("\\t"),
            c if c < '\x20' => {
                result.push_str(&format!("\\u{:04x}", c as u32));
            }
            c => result.push(c),
        }
    }
    result
}

fn format_number(n: f64, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if n.is_finite() {
        f.write_str(&crate::utils::format_number(n))
    } else {
        write!(f, "null")
    }
}

// ── Serialization ────────────────────────────────────────────────────────────

impl Serialize for JValue {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match self {
            JValue::Null | JValue::Undefined => serializer.serialize_none(),
            JValue::Bool(b) => serializer.serialize_bool(*b),
            JValue::Number(n) => {
                if n.is_nan() || n.is_infinite() {
                    serializer.serialize_none()
                } else if n.fract() == 0.0 && *n >= i64::MIN as f64 && *n <= i64::MAX as f64 {
                    serializer.serialize_i64(*n as i64)
                } else {
                    serializer.serialize_f64(*n)
                }
            }
            JValue::String(s) => serializer.serialize_str(s),
            JValue::Array(..) | JValue::Range(_) => {
                let mut seq = serializer.serialize_seq(Some(self.len()))?;
                for v in self.members() {
                    seq.serialize_element(&v)?;
                }
                seq.end()
            }
            JValue::Object(map) => {
                let mut m = serializer.serialize_map(Some(map.len()))?;
                for (k, v) in map.iter() {
                    m.serialize_entry(k, v)?;
                }
                m.end()
            }
            JValue::Lambda(_) | JValue::Native(_) | JValue::Regex(_) => serializer.serialize_str(""),
        }
    }
}

// ── Deserialization (single-pass JSON→JValue) ────────────────────────────────

impl<'de> serde::Deserialize<'de> for JValue {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_any(JValueVisitor)
    }
}

struct JValueVisitor;

impl<'de> Visitor<'de> for JValueVisitor {
    type Value = JValue;

    fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "any valid JSON value")
    }

    fn visit_bool<E: de::Error>(self, v: bool) -> Result<JValue, E> {
        Ok(JValue::Bool(v))
    }

    fn visit_i64<E: de::Error>(self, v: i64) -> Result<JValue, E> {
        Ok(JValue::Number(v as f64))
    }

    fn visit_u64<E: de::Error>(self, v: u64) -> Result<JValue, E> {
        Ok(JValue::Number(v as f64))
    }

    fn visit_f64<E: de::Error>(self, v: f64) -> Result<JValue, E> {
        Ok(JValue::Number(v))
    }

    fn visit_str<E: de::Error>(self, v: &str) -> Result<JValue, E> {
        Ok(JValue::string(v))
    }

    fn visit_string<E: de::Error>(self, v: String) -> Result<JValue, E> {
        Ok(JValue::String(v.into()))
    }

    fn visit_none<E: de::Error>(self) -> Result<JValue, E> {
        Ok(JValue::Null)
    }

    fn visit_unit<E: de::Error>(self) -> Result<JValue, E> {
        Ok(JValue::Null)
    }

    fn visit_seq<A: SeqAccess<'de>>(self, mut seq: A) -> Result<JValue, A::Error> {
        let mut vec = Vec::with_capacity(seq.size_hint().unwrap_or(0));
        while let Some(elem) = seq.next_element()? {
            vec.push(elem);
        }
        Ok(JValue::array(vec))
    }

    fn visit_map<A: MapAccess<'de>>(self, mut map: A) -> Result<JValue, A::Error> {
        let mut m = IndexMap::with_capacity(map.size_hint().unwrap_or(0));
        while let Some((k, v)) = map.next_entry()? {
            m.insert(k, v);
        }
        Ok(JValue::object(m))
    }
}

// ── JSON parsing ──────────────────────────────────────────────────────────

impl JValue {
    /// Parse a JSON string into a JValue (single-pass, no intermediate serde_json::Value).
    pub fn from_json_str(s: &str) -> Result<JValue, serde_json::Error> {
        serde_json::from_str(s)
    }
}

// ── Conversion from/to serde_json::Value ─────────────────────────────────────

impl From<serde_json::Value> for JValue {
    fn from(v: serde_json::Value) -> Self {
        match v {
            serde_json::Value::Null => JValue::Null,
            serde_json::Value::Bool(b) => JValue::Bool(b),
            serde_json::Value::Number(n) => JValue::Number(n.as_f64().unwrap_or(0.0)),
            serde_json::Value::String(s) => JValue::String(s.into()),
            serde_json::Value::Array(arr) => JValue::array(arr.into_iter().map(JValue::from).collect()),
            serde_json::Value::Object(map) => {
                let m: IndexMap<String, JValue> =
                    map.into_iter().map(|(k, v)| (k, JValue::from(v))).collect();
                JValue::Object(Rc::new(m))
            }
        }
    }
}

impl From<&serde_json::Value> for JValue {
    fn from(v: &serde_json::Value) -> Self {
        JValue::from(v.clone())
    }
}

impl From<&JValue> for serde_json::Value {
    fn from(v: &JValue) -> Self {
        match v {
            JValue::Null | JValue::Undefined => serde_json::Value::Null,
            JValue::Bool(b) => serde_json::Value::Bool(*b),
            JValue::Number(n) => {
                if n.is_nan() || n.is_infinite() {
                    serde_json::Value::Null
                } else if n.fract() == 0.0 && n.abs() < 9.007_199_254_740_992e15 {
                    serde_json::json!(*n as i64)
                } else {
                    serde_json::json!(*n)
                }
            }
            JValue::String(s) => serde_json::Value::String(s.to_string()),
            JValue::Array(..) | JValue::Range(_) => {
                serde_json::Value::Array(v.members().map(|m| serde_json::Value::from(&m)).collect())
            }
            JValue::Object(map) => {
                let m: serde_json::Map<String, serde_json::Value> = map
                    .iter()
                    .map(|(k, v)| (k.clone(), serde_json::Value::from(v)))
                    .collect();
                serde_json::Value::Object(m)
            }
            JValue::Lambda(_) | JValue::Native(_) | JValue::Regex(_) => {
                serde_json::Value::String(String::new())
            }
        }
    }
}

// ── jvalue! macro ────────────────────────────────────────────────────────────

/// Macro for constructing JValue literals, similar to serde_json::json!
///
/// Usage:
///   jvalue!(null)           → JValue::Null
///   jvalue!(true)           → JValue::Bool(true)
///   jvalue!(42)             → JValue::Number(42.0)
///   jvalue!("hello")        → JValue::String(Rc::from("hello"))
///   jvalue!([1, 2, 3])      → plain (unflagged) array
///   jvalue!({"k": v, ...})  → JValue::Object(Rc::new(IndexMap from pairs))
///   jvalue!(expr)           → JValue::from(expr)
#[macro_export]
macro_rules! jvalue {
    (null) => {
        $crate::value::JValue::Null
    };

    (true) => {
        $crate::value::JValue::Bool(true)
    };

    (false) => {
        $crate::value::JValue::Bool(false)
    };

    ([ $($elem:tt),* $(,)? ]) => {
        $crate::value::JValue::array(vec![ $( $crate::jvalue!($elem) ),* ])
    };

    ({ $($key:tt : $val:tt),* $(,)? }) => {
        {
            let mut map = indexmap::IndexMap::new();
            $(
                map.insert(($key).to_string(), $crate::jvalue!($val));
            )*
            $crate::value::JValue::object(map)
        }
    };

    ($other:expr) => {
        $crate::value::JValue::from($other)
    };
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clone_is_cheap() {
        let arr = JValue::array(vec![JValue::from(1i64), JValue::from(2i64)]);
        let arr2 = arr.clone();
        if let (JValue::Array(a, _), JValue::Array(b, _)) = (&arr, &arr2) {
            assert!(Rc::ptr_eq(a, b));
        } else {
            panic!("expected arrays");
        }

        let s = JValue::string("hello");
        let s2 = s.clone();
        if let (JValue::String(a), JValue::String(b)) = (&s, &s2) {
            assert!(Rc::ptr_eq(a, b));
        } else {
            panic!("expected strings");
        }
    }

    #[test]
    fn test_type_checks() {
        assert!(JValue::Null.is_null());
        assert!(JValue::Undefined.is_undefined());
        assert!(JValue::Bool(true).is_bool());
        assert!(JValue::Number(42.0).is_number());
        assert!(JValue::Number(42.0).is_integer());
        assert!(!JValue::Number(4.2).is_integer());
        assert!(JValue::string("hello").is_string());
        assert!(JValue::array(vec![]).is_array());
        assert!(JValue::range(1, 3).is_array());
        assert!(JValue::object(IndexMap::new()).is_object());
        let re = RegexLiteral::new("a+", "i").unwrap();
        assert!(JValue::Regex(Arc::new(re)).is_function_like());
    }

    #[test]
    fn test_sequence_flags_ignored_by_equality() {
        let plain = jvalue!([1i64, 2i64]);
        let seq = JValue::sequence(vec![JValue::from(1i64), JValue::from(2i64)]);
        assert!(seq.is_sequence());
        assert!(!plain.is_sequence());
        assert_eq!(plain, seq);
    }

    #[test]
    fn test_range_is_lazy_until_flagged() {
        let r = JValue::range(1, 10_000_000);
        assert_eq!(r.len(), 10_000_000);
        assert_eq!(r.get_index(9_999_999), Some(JValue::from(10_000_000i64)));
        assert_eq!(JValue::range(1, 3), jvalue!([1i64, 2i64, 3i64]));

        let cons = JValue::range(1, 3).with_flags(|f| f.cons = true);
        assert!(cons.is_cons());
        assert_eq!(cons.as_array().map(|a| a.len()), Some(3));
    }

    #[test]
    fn test_jvalue_macro() {
        let obj = jvalue!({"name": "Alice", "tags": ["a", "b"], "age": 30i64});
        assert_eq!(obj.get("name").and_then(|v| v.as_str()), Some("Alice"));
        assert_eq!(obj.get("tags").map(|v| v.len()), Some(2));
        assert!(jvalue!(null).is_null());
    }

    #[test]
    fn test_serde_roundtrip() {
        let v = jvalue!({"name": "Alice", "scores": [1i64, 2.5, 3i64], "active": true});
        let json_str = serde_json::to_string(&v).unwrap();
        assert_eq!(json_str, r#"{"name":"Alice","scores":[1,2.5,3],"active":true}"#);
        let parsed = JValue::from_json_str(&json_str).unwrap();
        assert_eq!(v, parsed);
    }

    #[test]
    fn test_display_renders_numbers_like_string() {
        assert_eq!(JValue::from(0.0000001).to_string(), "1e-7");
        assert_eq!(JValue::from(1e21).to_string(), "1e+21");
        assert_eq!(JValue::from(0.1 + 0.2).to_string(), "0.3");
        assert_eq!(JValue::Number(f64::NAN).to_string(), "null");
    }

    #[test]
    fn test_make_mut() {
        let mut arr = JValue::array(vec![JValue::from(1i64), JValue::from(2i64)]);
        let arr2 = arr.clone();
        arr.as_array_mut().unwrap().push(JValue::from(3i64));
        assert_eq!(arr.len(), 3);
        assert_eq!(arr2.len(), 2);
    }
}
