// Expression evaluator
// Tree-walking interpreter over the normalized AST, including the tail-call
// trampoline, partial application, function chaining and transforms.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::rc::{Rc, Weak};
use std::sync::{Arc, OnceLock};

use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use tracing::trace;

use crate::ast::{AstNode, BinaryOp, NodeKind, SortTerm, Stage};
use crate::datetime;
use crate::errors::{Error, Result};
use crate::frame::Frame;
use crate::functions::{self, append, NativeFunction};
use crate::parser;
use crate::signature::Signature;
use crate::utils::{boolize, deep_clone, stringify};
use crate::value::{Closure, ClosureKind, JValue, RegexLiteral, SequenceFlags};
use crate::watchdog::EvaluationHook;

/// Largest number of integers a range operator may produce.
const MAX_RANGE_SIZE: i64 = 10_000_000;

type Tuple = IndexMap<String, JValue>;

/// Pending edits for one object matched by a transform pattern.
#[derive(Default)]
struct TransformEdit {
    update: Option<Rc<IndexMap<String, JValue>>>,
    delete: Vec<String>,
}

type TransformEdits = HashMap<*const IndexMap<String, JValue>, Vec<TransformEdit>>;

/// Evaluation state for one top-level call: the optional entry/exit hook,
/// the frozen timestamp and the frames that received `:=` bindings.
pub struct Evaluator {
    hook: Option<Box<dyn EvaluationHook>>,
    timestamp: DateTime<Utc>,
    bound_frames: Vec<Weak<Frame>>,
}

impl Default for Evaluator {
    fn default() -> Self {
        Evaluator::new()
    }
}

impl Drop for Evaluator {
    /// Closures bound with `:=` reference the frame they are bound in, so the
    /// frame keeps itself alive. Clearing the bindings releases the cycle.
    fn drop(&mut self) {
        for frame in self.bound_frames.drain(..) {
            if let Some(frame) = frame.upgrade() {
                frame.clear();
            }
        }
    }
}

impl Evaluator {
    pub fn new() -> Self {
        Evaluator {
            hook: None,
            timestamp: datetime::capture(),
            bound_frames: Vec::new(),
        }
    }

    /// An evaluator that reports every evaluation step to `hook`.
    pub fn with_hook(hook: Box<dyn EvaluationHook>) -> Self {
        let mut evaluator = Evaluator::new();
        evaluator.hook = Some(hook);
        evaluator
    }

    /// Timestamp captured when this evaluator was created.
    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    /// Evaluate `expr` against `input` in `frame`.
    pub fn evaluate(&mut self, expr: &AstNode, input: &JValue, frame: &Rc<Frame>) -> Result<JValue> {
        if let Some(hook) = self.hook.as_mut() {
            hook.on_entry(expr, input, frame)?;
        }

        let mut result = self.evaluate_node(expr, input, frame)?;

        for stage in &expr.predicate {
            if let Stage::Filter { expr: predicate, .. } = stage {
                result = self.evaluate_filter(predicate, result, frame)?;
            }
        }

        if !expr.is_path() {
            if let Some(group) = &expr.group {
                result = self.evaluate_group(&group.pairs, group.position, result, frame)?;
            }
        }

        if let Some(hook) = self.hook.as_mut() {
            hook.on_exit(expr, input, frame, &result)?;
        }

        Ok(collapse(result, expr.keep_array))
    }

    fn evaluate_node(&mut self, expr: &AstNode, input: &JValue, frame: &Rc<Frame>) -> Result<JValue> {
        match &expr.kind {
            NodeKind::Path { steps } => self.evaluate_path(expr, steps, input, frame),
            NodeKind::Binary { op, lhs, rhs } => self.evaluate_binary(expr, *op, lhs, rhs, input, frame),
            NodeKind::Negate(operand) => self.evaluate_negate(expr, operand, input, frame),
            NodeKind::Array(items) => self.evaluate_array(expr, items, input, frame),
            NodeKind::Object(pairs) => self.evaluate_group(pairs, expr.position, input.clone(), frame),
            NodeKind::Name(name) => Ok(functions::lookup(input, name)),
            NodeKind::Variable(name) => Ok(evaluate_variable(name, input, frame)),
            NodeKind::String(s) => Ok(JValue::from(s.as_str())),
            NodeKind::Number(n) => Ok(JValue::Number(*n)),
            NodeKind::Bool(b) => Ok(JValue::Bool(*b)),
            NodeKind::Null => Ok(JValue::Null),
            NodeKind::Regex(regex) => Ok(JValue::Regex(Arc::clone(regex))),
            NodeKind::Wildcard => Ok(evaluate_wildcard(input)),
            NodeKind::Descendant => Ok(evaluate_descendants(input)),
            NodeKind::Parent(slot) => Ok(frame.lookup(&slot.label).unwrap_or(JValue::Undefined)),
            NodeKind::Condition {
                condition,
                then,
                otherwise,
            } => self.evaluate_condition(condition, then, otherwise.as_deref(), input, frame),
            NodeKind::Block(expressions) => self.evaluate_block(expressions, input, frame),
            NodeKind::Bind { name, value } => self.evaluate_bind(name, value, input, frame),
            NodeKind::Function { procedure, args } => {
                self.evaluate_function(expr, procedure, args, input, frame, None)
            }
            NodeKind::Partial { procedure, args } => self.evaluate_partial(expr, procedure, args, input, frame),
            NodeKind::Placeholder => Ok(JValue::Undefined),
            NodeKind::Apply { lhs, rhs } => self.evaluate_apply(expr, lhs, rhs, input, frame),
            NodeKind::Lambda {
                params,
                body,
                signature,
                thunk,
            } => Ok(JValue::lambda(Closure {
                params: params.clone(),
                body: Arc::clone(body),
                signature: signature.clone(),
                input: input.clone(),
                environment: Rc::clone(frame),
                kind: if *thunk { ClosureKind::Thunk } else { ClosureKind::Lambda },
            })),
            NodeKind::Sort { terms } => self.evaluate_sort(terms, expr.position, input, frame),
            NodeKind::Transform { .. } => Ok(JValue::lambda(Closure {
                params: Vec::new(),
                body: Arc::new(expr.clone()),
                signature: Some(transform_signature()?),
                input: input.clone(),
                environment: Rc::clone(frame),
                kind: ClosureKind::Transform,
            })),
            NodeKind::Error(error) => Err(error.clone()),
        }
    }

    // ── Paths ────────────────────────────────────────────────────────────────

    fn evaluate_path(
        &mut self,
        expr: &AstNode,
        steps: &[AstNode],
        input: &JValue,
        frame: &Rc<Frame>,
    ) -> Result<JValue> {
        let Some(first) = steps.first() else {
            return Ok(JValue::Undefined);
        };

        // A variable-rooted path starts from the variable, not the input members.
        let mut input_sequence = if input.is_array() && !matches!(first.kind, NodeKind::Variable(_)) {
            input.clone()
        } else {
            JValue::sequence(vec![input.clone()])
        };

        let mut result = JValue::Undefined;
        let mut tuple_mode = false;
        let mut tuples: Option<JValue> = None;
        let last = steps.len() - 1;

        for (index, step) in steps.iter().enumerate() {
            if step.tuple {
                tuple_mode = true;
            }

            if index == 0 && step.cons_array {
                result = self.evaluate(step, &input_sequence, frame)?;
            } else if tuple_mode {
                tuples = Some(self.evaluate_tuple_step(step, &input_sequence, tuples.take(), frame)?);
            } else {
                result = self.evaluate_step(step, &input_sequence, frame, index == last)?;
            }

            if !tuple_mode && (result.is_undefined() || (result.is_array() && result.is_empty())) {
                break;
            }

            if step.focus.is_none() {
                input_sequence = result.clone();
            }
        }

        let stream = if tuple_mode {
            let stream = tuples.unwrap_or_else(|| tuple_stream(Vec::new()));
            result = if expr.tuple {
                stream.clone()
            } else {
                JValue::sequence(stream.members().map(|tuple| tuple_context(&tuple)).collect())
            };
            Some(stream)
        } else {
            None
        };

        if expr.keep_singleton_array && result.is_array() {
            if result.is_cons() && !result.is_sequence() {
                result = JValue::sequence(vec![result]);
            }
            result = result.with_flags(|flags| flags.keep_singleton = true);
        }

        if let Some(group) = &expr.group {
            let source = stream.unwrap_or(result);
            result = self.evaluate_group(&group.pairs, group.position, source, frame)?;
        }

        Ok(result)
    }

    /// Evaluate one step against every member of `input`, flattening the results.
    fn evaluate_step(&mut self, step: &AstNode, input: &JValue, frame: &Rc<Frame>, last_step: bool) -> Result<JValue> {
        if let NodeKind::Sort { terms } = &step.kind {
            let sorted = self.evaluate_sort(terms, step.position, input, frame)?;
            return self.evaluate_stages(&step.stages, sorted, frame);
        }

        let mut results = Vec::with_capacity(input.len());
        for item in input.members() {
            let mut value = self.evaluate(step, &item, frame)?;
            for stage in &step.stages {
                if let Stage::Filter { expr, .. } = stage {
                    value = self.evaluate_filter(expr, value, frame)?;
                }
            }
            if !value.is_undefined() {
                results.push(value);
            }
        }

        if last_step && results.len() == 1 && results[0].is_array() && !results[0].is_sequence() {
            return Ok(results.swap_remove(0));
        }

        let mut sequence = Vec::with_capacity(results.len());
        for value in results {
            if !value.is_array() || value.is_cons() {
                sequence.push(value);
            } else {
                sequence.extend(value.members());
            }
        }
        Ok(JValue::sequence(sequence))
    }

    /// Evaluate a step in tuple-stream mode, threading focus, index and
    /// ancestor bindings through the `{"@": value, ...}` tuples.
    fn evaluate_tuple_step(
        &mut self,
        step: &AstNode,
        input: &JValue,
        tuples: Option<JValue>,
        frame: &Rc<Frame>,
    ) -> Result<JValue> {
        if let NodeKind::Sort { terms } = &step.kind {
            let sorted = match tuples {
                Some(stream) => self.evaluate_sort(terms, step.position, &stream, frame)?,
                None => {
                    let sorted = self.evaluate_sort(terms, step.position, input, frame)?;
                    let records = sorted
                        .members()
                        .enumerate()
                        .map(|(position, value)| {
                            let mut tuple = Tuple::new();
                            tuple.insert("@".to_string(), value);
                            if let Some(index) = &step.index {
                                tuple.insert(index.clone(), JValue::from(position));
                            }
                            JValue::object(tuple)
                        })
                        .collect();
                    tuple_stream(records)
                }
            };
            return self.evaluate_stages(&step.stages, sorted, frame);
        }

        let stream = match tuples {
            Some(stream) => stream,
            None => tuple_stream(
                input
                    .members()
                    .filter(|value| !value.is_undefined())
                    .map(|value| {
                        let mut tuple = Tuple::new();
                        tuple.insert("@".to_string(), value);
                        JValue::object(tuple)
                    })
                    .collect(),
            ),
        };

        let mut records = Vec::new();
        for tuple in stream.members() {
            let JValue::Object(bindings) = &tuple else {
                continue;
            };
            let environment = tuple_frame(frame, &tuple);
            let focus = tuple_context(&tuple);
            let value = self.evaluate(step, &focus, &environment)?;
            if value.is_undefined() {
                continue;
            }

            let nested = value.is_tuple_stream();
            let members = if value.is_array() { value.to_vec() } else { vec![value] };
            for (position, member) in members.into_iter().enumerate() {
                let mut record = (**bindings).clone();
                if nested {
                    if let JValue::Object(inner) = &member {
                        for (key, bound) in inner.iter() {
                            record.insert(key.clone(), bound.clone());
                        }
                    }
                } else {
                    match &step.focus {
                        Some(name) => {
                            record.insert(name.clone(), member);
                            record.insert("@".to_string(), focus.clone());
                        }
                        None => {
                            record.insert("@".to_string(), member);
                        }
                    }
                    if let Some(index) = &step.index {
                        record.insert(index.clone(), JValue::from(position));
                    }
                    if let Some(slot) = &step.ancestor {
                        record.insert(slot.label.clone(), focus.clone());
                    }
                }
                records.push(JValue::object(record));
            }
        }

        self.evaluate_stages(&step.stages, tuple_stream(records), frame)
    }

    fn evaluate_stages(&mut self, stages: &[Stage], input: JValue, frame: &Rc<Frame>) -> Result<JValue> {
        let mut result = input;
        for stage in stages {
            result = match stage {
                Stage::Filter { expr, .. } => self.evaluate_filter(expr, result, frame)?,
                Stage::Index { name } => bind_positions(result, name),
            };
        }
        Ok(result)
    }

    /// Apply a predicate to `input`: select by (end-relative) index, by
    /// computed indexes or by truthiness.
    fn evaluate_filter(&mut self, predicate: &AstNode, input: JValue, frame: &Rc<Frame>) -> Result<JValue> {
        let tuples = input.is_tuple_stream();
        let flags = SequenceFlags {
            sequence: true,
            tuple_stream: tuples,
            ..SequenceFlags::default()
        };
        if input.is_undefined() {
            return Ok(JValue::Array(Rc::new(Vec::new()), flags));
        }
        let items = if input.is_array() {
            input
        } else {
            JValue::sequence(vec![input])
        };
        let length = items.len() as i64;
        let mut results = Vec::new();

        if let NodeKind::Number(n) = predicate.kind {
            let mut index = n.floor() as i64;
            if index < 0 {
                index += length;
            }
            if index >= 0 {
                if let Some(item) = items.get_index(index as usize) {
                    if item.is_array() {
                        return Ok(item);
                    }
                    results.push(item);
                }
            }
        } else {
            for (position, item) in items.members().enumerate() {
                let (context, environment) = if tuples {
                    (tuple_context(&item), tuple_frame(frame, &item))
                } else {
                    (item.clone(), Rc::clone(frame))
                };
                let mut selector = self.evaluate(predicate, &context, &environment)?;
                if selector.is_number() {
                    selector = JValue::sequence(vec![selector]);
                }
                if is_array_of_numbers(&selector) {
                    let selected = selector.members().any(|n| {
                        let mut index = n.as_f64().unwrap_or(f64::NAN).floor() as i64;
                        if index < 0 {
                            index += length;
                        }
                        index == position as i64
                    });
                    if selected {
                        results.push(item);
                    }
                } else if boolize(&selector) {
                    results.push(item);
                }
            }
        }

        Ok(JValue::Array(Rc::new(results), flags))
    }

    // ── Operators ────────────────────────────────────────────────────────────

    fn evaluate_binary(
        &mut self,
        expr: &AstNode,
        op: BinaryOp,
        lhs: &AstNode,
        rhs: &AstNode,
        input: &JValue,
        frame: &Rc<Frame>,
    ) -> Result<JValue> {
        let left = self.evaluate(lhs, input, frame)?;

        match op {
            BinaryOp::And => {
                if !boolize(&left) {
                    return Ok(JValue::Bool(false));
                }
                let right = self.evaluate(rhs, input, frame)?;
                return Ok(JValue::Bool(boolize(&right)));
            }
            BinaryOp::Or => {
                if boolize(&left) {
                    return Ok(JValue::Bool(true));
                }
                let right = self.evaluate(rhs, input, frame)?;
                return Ok(JValue::Bool(boolize(&right)));
            }
            _ => {}
        }

        let right = self.evaluate(rhs, input, frame)?;

        match op {
            BinaryOp::Add | BinaryOp::Subtract | BinaryOp::Multiply | BinaryOp::Divide | BinaryOp::Modulo => {
                numeric(op, &left, &right, expr.position)
            }
            BinaryOp::Equal | BinaryOp::NotEqual => {
                if left.is_undefined() || right.is_undefined() {
                    return Ok(JValue::Bool(false));
                }
                let equal = left == right;
                Ok(JValue::Bool(if op == BinaryOp::Equal { equal } else { !equal }))
            }
            BinaryOp::LessThan
            | BinaryOp::LessThanOrEqual
            | BinaryOp::GreaterThan
            | BinaryOp::GreaterThanOrEqual => compare(op, &left, &right, expr.position),
            BinaryOp::Concatenate => {
                let mut joined = stringify(&left, false)?.unwrap_or_default();
                joined.push_str(&stringify(&right, false)?.unwrap_or_default());
                Ok(JValue::from(joined))
            }
            BinaryOp::Range => range(&left, &right, expr.position),
            BinaryOp::In => {
                if left.is_undefined() || right.is_undefined() {
                    return Ok(JValue::Bool(false));
                }
                let found = if right.is_array() {
                    right.members().any(|member| member == left)
                } else {
                    right == left
                };
                Ok(JValue::Bool(found))
            }
            BinaryOp::And | BinaryOp::Or => Ok(JValue::Undefined),
        }
    }

    fn evaluate_negate(&mut self, expr: &AstNode, operand: &AstNode, input: &JValue, frame: &Rc<Frame>) -> Result<JValue> {
        match self.evaluate(operand, input, frame)? {
            JValue::Undefined => Ok(JValue::Undefined),
            JValue::Number(n) => Ok(JValue::Number(-n)),
            other => Err(Error::at("D1002", expr.position)
                .with_token("-")
                .with_value(other.to_string())),
        }
    }

    // ── Constructors ─────────────────────────────────────────────────────────

    fn evaluate_array(&mut self, expr: &AstNode, items: &[AstNode], input: &JValue, frame: &Rc<Frame>) -> Result<JValue> {
        let previous = frame.is_parallel();
        let result = self.construct_array(items, input, frame);
        frame.set_parallel(previous);
        let result = result?;
        if expr.cons_array {
            return Ok(result.with_flags(|flags| flags.cons = true));
        }
        Ok(result)
    }

    fn construct_array(&mut self, items: &[AstNode], input: &JValue, frame: &Rc<Frame>) -> Result<JValue> {
        let mut result = JValue::array(Vec::new());
        for (index, item) in items.iter().enumerate() {
            frame.set_parallel(index > 0);
            let value = self.evaluate(item, input, frame)?;
            if value.is_undefined() {
                continue;
            }
            if matches!(item.kind, NodeKind::Array(_)) {
                if let Some(members) = result.as_array_mut() {
                    members.push(value);
                }
            } else {
                result = append(result, value);
            }
        }
        Ok(result)
    }

    /// Group `input` by the key expressions of `pairs` and evaluate each
    /// group's value expression. Also implements the object constructor.
    fn evaluate_group(
        &mut self,
        pairs: &[(AstNode, AstNode)],
        position: usize,
        input: JValue,
        frame: &Rc<Frame>,
    ) -> Result<JValue> {
        let reduce = input.is_tuple_stream();
        let mut items = if input.is_array() { input.to_vec() } else { vec![input] };
        if items.is_empty() {
            items.push(JValue::Undefined);
        }

        let mut groups: IndexMap<String, (JValue, usize)> = IndexMap::new();
        for item in items {
            let (context, environment) = if reduce {
                (tuple_context(&item), tuple_frame(frame, &item))
            } else {
                (item.clone(), Rc::clone(frame))
            };
            for (pair_index, (key_expr, _)) in pairs.iter().enumerate() {
                let key = match self.evaluate(key_expr, &context, &environment)? {
                    JValue::Undefined => continue,
                    JValue::String(key) => key,
                    other => return Err(Error::at("T1003", position).with_token(other.to_string())),
                };
                match groups.get_mut(&*key) {
                    Some((data, index)) => {
                        if *index != pair_index {
                            return Err(Error::at("D1009", position).with_token(&*key));
                        }
                        *data = append(std::mem::replace(data, JValue::Undefined), item.clone());
                    }
                    None => {
                        groups.insert(key.to_string(), (item.clone(), pair_index));
                    }
                }
            }
        }

        let previous = frame.is_parallel();
        let result = self.evaluate_groups(pairs, groups, reduce, frame);
        frame.set_parallel(previous);
        result
    }

    fn evaluate_groups(
        &mut self,
        pairs: &[(AstNode, AstNode)],
        groups: IndexMap<String, (JValue, usize)>,
        reduce: bool,
        frame: &Rc<Frame>,
    ) -> Result<JValue> {
        let mut result = IndexMap::with_capacity(groups.len());
        for (index, (key, (data, pair_index))) in groups.into_iter().enumerate() {
            let (context, environment) = if reduce {
                let mut tuple = reduce_tuple_stream(&data);
                let context = tuple.shift_remove("@").unwrap_or(JValue::Undefined);
                (context, tuple_frame(frame, &JValue::object(tuple)))
            } else {
                (data, Rc::clone(frame))
            };
            environment.set_parallel(index > 0);
            let value = self.evaluate(&pairs[pair_index].1, &context, &environment)?;
            if !value.is_undefined() {
                result.insert(key, value);
            }
        }
        Ok(JValue::object(result))
    }

    /// Order `input` by the sort terms. Undefined keys sort last.
    fn evaluate_sort(&mut self, terms: &[SortTerm], position: usize, input: &JValue, frame: &Rc<Frame>) -> Result<JValue> {
        let tuples = input.is_tuple_stream();
        let items = match input {
            JValue::Undefined => Vec::new(),
            value if value.is_array() => value.to_vec(),
            value => vec![value.clone()],
        };

        let mut keyed = Vec::with_capacity(items.len());
        for item in items {
            let (context, environment) = if tuples {
                (tuple_context(&item), tuple_frame(frame, &item))
            } else {
                (item.clone(), Rc::clone(frame))
            };
            let mut keys = Vec::with_capacity(terms.len());
            for term in terms {
                keys.push(self.evaluate(&term.expression, &context, &environment)?);
            }
            keyed.push((keys, item));
        }

        let mut by_keys = |a: &(Vec<JValue>, JValue), b: &(Vec<JValue>, JValue)| {
            compare_sort_keys(terms, &a.0, &b.0, position)
        };
        let sorted = merge_sort(keyed, &mut by_keys)?;
        let flags = SequenceFlags {
            sequence: true,
            tuple_stream: tuples,
            ..SequenceFlags::default()
        };
        Ok(JValue::Array(
            Rc::new(sorted.into_iter().map(|(_, item)| item).collect()),
            flags,
        ))
    }

    // ── Control flow ─────────────────────────────────────────────────────────

    fn evaluate_condition(
        &mut self,
        condition: &AstNode,
        then: &AstNode,
        otherwise: Option<&AstNode>,
        input: &JValue,
        frame: &Rc<Frame>,
    ) -> Result<JValue> {
        let test = self.evaluate(condition, input, frame)?;
        if boolize(&test) {
            self.evaluate(then, input, frame)
        } else if let Some(otherwise) = otherwise {
            self.evaluate(otherwise, input, frame)
        } else {
            Ok(JValue::Undefined)
        }
    }

    fn evaluate_block(&mut self, expressions: &[AstNode], input: &JValue, frame: &Rc<Frame>) -> Result<JValue> {
        let scope = Frame::child(frame);
        let mut result = JValue::Undefined;
        for expression in expressions {
            result = self.evaluate(expression, input, &scope)?;
        }
        Ok(result)
    }

    fn evaluate_bind(&mut self, name: &str, value: &AstNode, input: &JValue, frame: &Rc<Frame>) -> Result<JValue> {
        let value = self.evaluate(value, input, frame)?;
        if matches!(value, JValue::Lambda(_) | JValue::Array(..) | JValue::Object(_)) {
            self.bound_frames.push(Rc::downgrade(frame));
        }
        frame.bind(name, value.clone());
        Ok(value)
    }

    // ── Functions ────────────────────────────────────────────────────────────

    fn evaluate_function(
        &mut self,
        expr: &AstNode,
        procedure: &AstNode,
        args: &[AstNode],
        input: &JValue,
        frame: &Rc<Frame>,
        applied_to: Option<JValue>,
    ) -> Result<JValue> {
        let function = self.evaluate(procedure, input, frame)?;
        if function.is_undefined() {
            if let Some(name) = step_name(procedure) {
                if frame.lookup(name).is_some() {
                    return Err(Error::at("T1005", expr.position).with_token(name));
                }
            }
        }

        let mut evaluated = Vec::with_capacity(args.len() + 1);
        if let Some(context) = applied_to {
            evaluated.push(context);
        }
        for arg in args {
            evaluated.push(self.evaluate(arg, input, frame)?);
        }

        let name = procedure_name(procedure);
        if function.is_undefined() {
            let error = Error::at("T1006", expr.position);
            return Err(match name {
                Some(name) => error.with_token(name),
                None => error,
            });
        }
        self.apply(&function, evaluated, input)
            .map_err(|error| error.locate(expr.position, name))
    }

    /// Apply a function value to arguments, running deferred tail calls in a
    /// loop until a final value is produced.
    pub fn apply(&mut self, procedure: &JValue, args: Vec<JValue>, input: &JValue) -> Result<JValue> {
        let mut result = self.apply_inner(procedure, args, input)?;
        let mut bounces = 0usize;
        loop {
            let thunk = match &result {
                JValue::Lambda(closure) if closure.kind == ClosureKind::Thunk => Rc::clone(closure),
                _ => break,
            };
            let NodeKind::Function { procedure: callee, args: arg_nodes } = &thunk.body.kind else {
                break;
            };
            let next = self.evaluate(callee, &thunk.input, &thunk.environment)?;
            let mut evaluated = Vec::with_capacity(arg_nodes.len());
            for arg in arg_nodes {
                evaluated.push(self.evaluate(arg, &thunk.input, &thunk.environment)?);
            }
            result = self
                .apply_inner(&next, evaluated, input)
                .map_err(|error| error.locate(thunk.body.position, procedure_name(callee)))?;
            bounces += 1;
        }
        if bounces > 0 {
            trace!(bounces, "tail calls completed");
        }
        Ok(result)
    }

    fn apply_inner(&mut self, procedure: &JValue, args: Vec<JValue>, input: &JValue) -> Result<JValue> {
        match procedure {
            JValue::Lambda(closure) => {
                let args = match &closure.signature {
                    Some(signature) => signature.validate(&args, input)?,
                    None => args,
                };
                match closure.kind {
                    ClosureKind::Transform => self.apply_transform(closure, args),
                    ClosureKind::Lambda | ClosureKind::Thunk => self.apply_procedure(closure, args),
                }
            }
            JValue::Native(native) => native.call(self, &args, input),
            JValue::Regex(regex) => Ok(regex_match(regex, args.first())),
            _ => Err(Error::new("T1006")),
        }
    }

    fn apply_procedure(&mut self, closure: &Closure, args: Vec<JValue>) -> Result<JValue> {
        let environment = Frame::child(&closure.environment);
        for (param, arg) in closure.params.iter().zip(args) {
            environment.bind(param.as_str(), arg);
        }
        self.evaluate(&closure.body, &closure.input, &environment)
    }

    fn evaluate_partial(
        &mut self,
        expr: &AstNode,
        procedure: &AstNode,
        args: &[AstNode],
        input: &JValue,
        frame: &Rc<Frame>,
    ) -> Result<JValue> {
        let mut evaluated = Vec::with_capacity(args.len());
        for arg in args {
            if matches!(arg.kind, NodeKind::Placeholder) {
                evaluated.push(None);
            } else {
                evaluated.push(Some(self.evaluate(arg, input, frame)?));
            }
        }

        let function = self.evaluate(procedure, input, frame)?;
        if function.is_undefined() {
            if let Some(name) = step_name(procedure) {
                if frame.lookup(name).is_some() {
                    return Err(Error::at("T1007", expr.position).with_token(name));
                }
            }
        }

        match &function {
            JValue::Lambda(closure) => Ok(partial_closure(closure, &evaluated)),
            JValue::Native(native) => Ok(partial_native(native, &evaluated, frame, expr.position)),
            _ => {
                let error = Error::at("T1008", expr.position);
                Err(match procedure_name(procedure) {
                    Some(name) => error.with_token(name),
                    None => error,
                })
            }
        }
    }

    fn evaluate_apply(&mut self, expr: &AstNode, lhs: &AstNode, rhs: &AstNode, input: &JValue, frame: &Rc<Frame>) -> Result<JValue> {
        let value = self.evaluate(lhs, input, frame)?;

        if let NodeKind::Function { procedure, args } = &rhs.kind {
            return self.evaluate_function(rhs, procedure, args, input, frame, Some(value));
        }

        let function = self.evaluate(rhs, input, frame)?;
        if !function.is_function_like() && !value.is_function_like() {
            return Err(Error::at("T2006", expr.position).with_token(function.to_string()));
        }

        if value.is_function_like() {
            let chain = self.evaluate(chain_ast()?, &JValue::Undefined, frame)?;
            self.apply(&chain, vec![value, function], &JValue::Undefined)
        } else {
            self.apply(&function, vec![value], &JValue::Undefined)
        }
    }

    // ── Transform ────────────────────────────────────────────────────────────

    fn apply_transform(&mut self, closure: &Closure, args: Vec<JValue>) -> Result<JValue> {
        let subject = args.into_iter().next().unwrap_or(JValue::Undefined);
        if subject.is_undefined() {
            return Ok(JValue::Undefined);
        }
        let NodeKind::Transform { pattern, update, delete } = &closure.body.kind else {
            return Err(Error::new("T1006"));
        };

        let copy = deep_clone(&subject)?;
        let matches = self.evaluate(pattern, &copy, &closure.environment)?;
        if matches.is_undefined() {
            return Ok(copy);
        }

        let mut edits = TransformEdits::new();
        for matched in matches.to_vec() {
            let JValue::Object(target) = &matched else {
                continue;
            };
            let mut edit = TransformEdit::default();

            match self.evaluate(update, &matched, &closure.environment)? {
                JValue::Undefined => {}
                JValue::Object(fields) => edit.update = Some(fields),
                other => {
                    return Err(Error::at("T2011", update.position).with_token(other.to_string()));
                }
            }

            if let Some(delete) = delete {
                let keys = self.evaluate(delete, &matched, &closure.environment)?;
                if !keys.is_undefined() {
                    let keys = if keys.is_array() { keys.to_vec() } else { vec![keys] };
                    for key in &keys {
                        match key.as_str() {
                            Some(key) => edit.delete.push(key.to_string()),
                            None => {
                                return Err(Error::at("T2012", delete.position).with_token(key.to_string()));
                            }
                        }
                    }
                }
            }

            edits.entry(Rc::as_ptr(target)).or_default().push(edit);
        }

        if edits.is_empty() {
            return Ok(copy);
        }
        Ok(rewrite(&copy, &edits))
    }
}

// ── Helpers ──────────────────────────────────────────────────────────────────

/// Unwrap query-result sequences of zero or one member.
fn collapse(result: JValue, keep_array: bool) -> JValue {
    if !result.is_sequence() || result.is_tuple_stream() {
        return result;
    }
    let result = if keep_array {
        result.with_flags(|flags| flags.keep_singleton = true)
    } else {
        result
    };
    match result.len() {
        0 => JValue::Undefined,
        1 if !result.keeps_singleton() => result.get_index(0).unwrap_or(JValue::Undefined),
        _ => result,
    }
}

fn evaluate_variable(name: &str, input: &JValue, frame: &Frame) -> JValue {
    if name.is_empty() {
        if input.is_outer_wrapper() {
            return input.get_index(0).unwrap_or(JValue::Undefined);
        }
        return input.clone();
    }
    frame.lookup(name).unwrap_or(JValue::Undefined)
}

fn numeric(op: BinaryOp, left: &JValue, right: &JValue, position: usize) -> Result<JValue> {
    if !left.is_undefined() && !left.is_number() {
        return Err(Error::at("T2001", position)
            .with_token(op.symbol())
            .with_value(left.to_string()));
    }
    if !right.is_undefined() && !right.is_number() {
        return Err(Error::at("T2002", position)
            .with_token(op.symbol())
            .with_value(right.to_string()));
    }
    let (Some(a), Some(b)) = (left.as_f64(), right.as_f64()) else {
        return Ok(JValue::Undefined);
    };
    let result = match op {
        BinaryOp::Add => a + b,
        BinaryOp::Subtract => a - b,
        BinaryOp::Multiply => a * b,
        BinaryOp::Divide => a / b,
        _ => a % b,
    };
    if !result.is_finite() {
        let shown = if result.is_nan() {
            "NaN"
        } else if result > 0.0 {
            "Infinity"
        } else {
            "-Infinity"
        };
        return Err(Error::at("D1001", position).with_token(shown));
    }
    Ok(JValue::Number(result))
}

fn compare(op: BinaryOp, left: &JValue, right: &JValue, position: usize) -> Result<JValue> {
    let comparable = |value: &JValue| matches!(value, JValue::Undefined | JValue::String(_) | JValue::Number(_));
    if !comparable(left) || !comparable(right) {
        let offending = if comparable(left) { right } else { left };
        return Err(Error::at("T2010", position)
            .with_token(op.symbol())
            .with_value(offending.to_string()));
    }
    if left.is_undefined() || right.is_undefined() {
        return Ok(JValue::Undefined);
    }
    let ordering = match (left, right) {
        (JValue::Number(a), JValue::Number(b)) => a.partial_cmp(b),
        (JValue::String(a), JValue::String(b)) => Some(a.cmp(b)),
        _ => {
            return Err(Error::at("T2009", position)
                .with_token(left.to_string())
                .with_value(right.to_string()));
        }
    };
    let Some(ordering) = ordering else {
        return Ok(JValue::Bool(false));
    };
    let result = match op {
        BinaryOp::LessThan => ordering.is_lt(),
        BinaryOp::LessThanOrEqual => ordering.is_le(),
        BinaryOp::GreaterThan => ordering.is_gt(),
        _ => ordering.is_ge(),
    };
    Ok(JValue::Bool(result))
}

fn range(left: &JValue, right: &JValue, position: usize) -> Result<JValue> {
    let bound = |value: &JValue, code: &'static str| -> Result<Option<i64>> {
        match value {
            JValue::Undefined => Ok(None),
            value if value.is_integer() => value
                .as_i64()
                .map(Some)
                .ok_or_else(|| Error::at(code, position).with_token(value.to_string())),
            value => Err(Error::at(code, position).with_token(value.to_string())),
        }
    };
    let start = bound(left, "T2003")?;
    let end = bound(right, "T2004")?;
    let (Some(start), Some(end)) = (start, end) else {
        return Ok(JValue::Undefined);
    };
    if start > end {
        return Ok(JValue::Undefined);
    }
    let size = (end as i128) - (start as i128) + 1;
    if size > MAX_RANGE_SIZE as i128 {
        return Err(Error::at("D2014", position).with_token(size.to_string()));
    }
    Ok(JValue::range(start, end))
}

fn is_array_of_numbers(value: &JValue) -> bool {
    match value {
        JValue::Range(_) => true,
        JValue::Array(items, _) => items.iter().all(JValue::is_number),
        _ => false,
    }
}

fn evaluate_wildcard(input: &JValue) -> JValue {
    let input = if input.is_outer_wrapper() && !input.is_empty() {
        input.get_index(0).unwrap_or(JValue::Undefined)
    } else {
        input.clone()
    };
    let mut results = Vec::new();
    collect_wildcard(&input, &mut results);
    JValue::sequence(results)
}

fn collect_wildcard(input: &JValue, results: &mut Vec<JValue>) {
    match input {
        JValue::Object(map) => {
            for value in map.values() {
                if value.is_array() {
                    flatten_into(value, results);
                } else {
                    results.push(value.clone());
                }
            }
        }
        JValue::Array(..) | JValue::Range(_) => {
            for member in input.members() {
                if member.is_array() {
                    flatten_into(&member, results);
                } else if member.is_object() {
                    collect_wildcard(&member, results);
                } else {
                    results.push(member);
                }
            }
        }
        _ => {}
    }
}

fn flatten_into(value: &JValue, results: &mut Vec<JValue>) {
    if value.is_array() {
        for member in value.members() {
            flatten_into(&member, results);
        }
    } else {
        results.push(value.clone());
    }
}

fn evaluate_descendants(input: &JValue) -> JValue {
    if input.is_undefined() {
        return JValue::Undefined;
    }
    let mut results = Vec::new();
    collect_descendants(input, &mut results);
    if results.len() == 1 {
        return results.swap_remove(0);
    }
    JValue::sequence(results)
}

fn collect_descendants(input: &JValue, results: &mut Vec<JValue>) {
    if !input.is_array() {
        results.push(input.clone());
    }
    match input {
        JValue::Array(..) | JValue::Range(_) => {
            for member in input.members() {
                collect_descendants(&member, results);
            }
        }
        JValue::Object(map) => {
            for value in map.values() {
                collect_descendants(value, results);
            }
        }
        _ => {}
    }
}

fn tuple_stream(records: Vec<JValue>) -> JValue {
    JValue::Array(
        Rc::new(records),
        SequenceFlags {
            sequence: true,
            tuple_stream: true,
            ..SequenceFlags::default()
        },
    )
}

/// The context value of a tuple.
fn tuple_context(tuple: &JValue) -> JValue {
    tuple.get("@").cloned().unwrap_or(JValue::Undefined)
}

/// A child frame holding every binding of a tuple.
fn tuple_frame(frame: &Rc<Frame>, tuple: &JValue) -> Rc<Frame> {
    let environment = Frame::child(frame);
    if let JValue::Object(bindings) = tuple {
        for (name, value) in bindings.iter() {
            environment.bind(name.as_str(), value.clone());
        }
    }
    environment
}

/// Record each tuple's position under `name`.
fn bind_positions(stream: JValue, name: &str) -> JValue {
    let flags = stream.flags();
    let records = stream
        .members()
        .enumerate()
        .map(|(position, tuple)| match tuple {
            JValue::Object(mut bindings) => {
                Rc::make_mut(&mut bindings).insert(name.to_string(), JValue::from(position));
                JValue::Object(bindings)
            }
            other => other,
        })
        .collect();
    JValue::Array(Rc::new(records), flags)
}

/// Merge a group of tuples: the first tuple's bindings, with each later
/// tuple's bindings appended.
fn reduce_tuple_stream(data: &JValue) -> Tuple {
    if !data.is_array() {
        return data.as_object().cloned().unwrap_or_default();
    }
    let mut members = data.members();
    let mut result = members
        .next()
        .and_then(|first| first.as_object().cloned())
        .unwrap_or_default();
    for tuple in members {
        if let JValue::Object(bindings) = tuple {
            for (name, value) in bindings.iter() {
                let merged = append(result.shift_remove(name).unwrap_or(JValue::Undefined), value.clone());
                result.insert(name.clone(), merged);
            }
        }
    }
    result
}

fn compare_sort_keys(terms: &[SortTerm], a: &[JValue], b: &[JValue], position: usize) -> Result<Ordering> {
    for (index, term) in terms.iter().enumerate() {
        let (x, y) = (&a[index], &b[index]);
        match (x, y) {
            (JValue::Undefined, JValue::Undefined) => continue,
            (JValue::Undefined, _) => return Ok(Ordering::Greater),
            (_, JValue::Undefined) => return Ok(Ordering::Less),
            _ => {}
        }
        let sortable = |value: &JValue| value.is_number() || value.is_string();
        if !sortable(x) || !sortable(y) {
            return Err(Error::at("T2008", position)
                .with_token(x.to_string())
                .with_value(y.to_string()));
        }
        let ordering = match (x, y) {
            (JValue::Number(p), JValue::Number(q)) => p.partial_cmp(q).unwrap_or(Ordering::Equal),
            (JValue::String(p), JValue::String(q)) => p.cmp(q),
            _ => {
                return Err(Error::at("T2007", position)
                    .with_token(x.to_string())
                    .with_value(y.to_string()));
            }
        };
        if ordering != Ordering::Equal {
            return Ok(if term.descending { ordering.reverse() } else { ordering });
        }
    }
    Ok(Ordering::Equal)
}

/// Stable merge sort with a fallible comparator.
fn merge_sort<T, F>(mut items: Vec<T>, compare: &mut F) -> Result<Vec<T>>
where
    F: FnMut(&T, &T) -> Result<Ordering>,
{
    if items.len() <= 1 {
        return Ok(items);
    }
    let right = items.split_off(items.len() / 2);
    let left = merge_sort(items, compare)?;
    let right = merge_sort(right, compare)?;

    let mut merged = Vec::with_capacity(left.len() + right.len());
    let mut left = left.into_iter().peekable();
    let mut right = right.into_iter().peekable();
    loop {
        let take_right = match (left.peek(), right.peek()) {
            (Some(l), Some(r)) => compare(l, r)? == Ordering::Greater,
            (Some(_), None) => false,
            (None, Some(_)) => true,
            (None, None) => break,
        };
        merged.extend(if take_right { right.next() } else { left.next() });
    }
    Ok(merged)
}

/// Name of the first step of a path-shaped procedure, for "did you mean $name" errors.
fn step_name(procedure: &AstNode) -> Option<&str> {
    match &procedure.kind {
        NodeKind::Name(name) => Some(name),
        NodeKind::Path { steps } => match steps.first().map(|step| &step.kind) {
            Some(NodeKind::Name(name)) => Some(name),
            _ => None,
        },
        _ => None,
    }
}

fn procedure_name(procedure: &AstNode) -> Option<&str> {
    match &procedure.kind {
        NodeKind::Variable(name) => Some(name),
        _ => step_name(procedure),
    }
}

fn regex_match(regex: &RegexLiteral, subject: Option<&JValue>) -> JValue {
    let Some(JValue::String(text)) = subject else {
        return JValue::Undefined;
    };
    let text: &str = text;
    let Some(captures) = regex.regex().captures(text) else {
        return JValue::Undefined;
    };
    let Some(whole) = captures.get(0) else {
        return JValue::Undefined;
    };
    let groups = captures
        .iter()
        .skip(1)
        .map(|group| JValue::from(group.map_or("", |m| m.as_str())))
        .collect();
    let mut result = IndexMap::new();
    result.insert("match".to_string(), JValue::from(whole.as_str()));
    result.insert("index".to_string(), JValue::from(text[..whole.start()].chars().count()));
    result.insert("groups".to_string(), JValue::array(groups));
    JValue::object(result)
}

/// A closure with the supplied arguments bound and the rest left as parameters.
fn partial_closure(closure: &Closure, args: &[Option<JValue>]) -> JValue {
    let environment = Frame::child(&closure.environment);
    let mut unbound = Vec::new();
    for (index, param) in closure.params.iter().enumerate() {
        match args.get(index) {
            Some(Some(arg)) if !arg.is_undefined() => environment.bind(param.as_str(), arg.clone()),
            _ => unbound.push(param.clone()),
        }
    }
    JValue::lambda(Closure {
        params: unbound,
        body: Arc::clone(&closure.body),
        signature: None,
        input: closure.input.clone(),
        environment,
        kind: closure.kind,
    })
}

/// Wrap a native function in `function($a, $b, ...) { $name($a, $b, ...) }`
/// and partially apply that.
fn partial_native(native: &Arc<NativeFunction>, args: &[Option<JValue>], frame: &Rc<Frame>, position: usize) -> JValue {
    let params: Vec<String> = (0..native.param_count())
        .map(|index| char::from(b'a' + (index % 26) as u8).to_string())
        .collect();
    let call = AstNode::new(
        NodeKind::Function {
            procedure: Box::new(AstNode::new(NodeKind::Variable(native.name.clone()), position)),
            args: params
                .iter()
                .map(|param| AstNode::new(NodeKind::Variable(param.clone()), position))
                .collect(),
        },
        position,
    );
    let environment = Frame::child(frame);
    environment.bind(native.name.as_str(), JValue::Native(Arc::clone(native)));
    let wrapper = Closure {
        params,
        body: Arc::new(call),
        signature: None,
        input: JValue::Undefined,
        environment,
        kind: ClosureKind::Lambda,
    };
    partial_closure(&wrapper, args)
}

/// Copy of `value` with the transform edits applied to every matched object.
fn rewrite(value: &JValue, edits: &TransformEdits) -> JValue {
    match value {
        JValue::Object(map) => {
            let mut rebuilt: IndexMap<String, JValue> = map
                .iter()
                .map(|(key, member)| (key.clone(), rewrite(member, edits)))
                .collect();
            if let Some(pending) = edits.get(&Rc::as_ptr(map)) {
                for edit in pending {
                    if let Some(update) = &edit.update {
                        for (key, field) in update.iter() {
                            rebuilt.insert(key.clone(), field.clone());
                        }
                    }
                    for key in &edit.delete {
                        rebuilt.shift_remove(key);
                    }
                }
            }
            JValue::object(rebuilt)
        }
        JValue::Array(items, flags) => {
            JValue::Array(Rc::new(items.iter().map(|item| rewrite(item, edits)).collect()), *flags)
        }
        other => other.clone(),
    }
}

fn transform_signature() -> Result<Arc<Signature>> {
    static SIGNATURE: OnceLock<Result<Arc<Signature>>> = OnceLock::new();
    SIGNATURE
        .get_or_init(|| Signature::parse("<(oa):o>", "transform").map(Arc::new))
        .clone()
}

/// `f ~> g` for two functions: `function($f, $g) { function($x) { $g($f($x)) } }`.
fn chain_ast() -> Result<&'static AstNode> {
    static CHAIN: OnceLock<Result<AstNode>> = OnceLock::new();
    CHAIN
        .get_or_init(|| parser::parse("function($f, $g) { function($x){ $g($f($x)) } }"))
        .as_ref()
        .map_err(Clone::clone)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jvalue;
    use crate::watchdog::{RuntimeBounds, Watchdog};

    fn run_with(evaluator: &mut Evaluator, source: &str, data: JValue) -> Result<JValue> {
        let ast = parser::parse(source)?;
        let frame = Frame::child(&Frame::root());
        frame.bind("$", data.clone());
        let input = if data.is_array() && !data.is_sequence() {
            JValue::sequence(vec![data]).with_flags(|flags| flags.outer_wrapper = true)
        } else {
            data
        };
        evaluator.evaluate(&ast, &input, &frame)
    }

    fn run(source: &str, data: JValue) -> Result<JValue> {
        run_with(&mut Evaluator::new(), source, data)
    }

    fn eval(source: &str) -> JValue {
        run(source, JValue::Undefined).unwrap()
    }

    fn orders() -> JValue {
        jvalue!({
            "orders": [
                {"id": 1, "item": "pen", "price": 3, "tags": ["office"]},
                {"id": 2, "item": "desk", "price": 120, "tags": ["office", "furniture"]},
                {"id": 3, "item": "lamp", "price": 25, "tags": ["furniture"]}
            ]
        })
    }

    #[test]
    fn test_literals() {
        assert_eq!(eval("42"), JValue::from(42));
        assert_eq!(eval("\"hi\""), JValue::from("hi"));
        assert_eq!(eval("true"), JValue::Bool(true));
        assert_eq!(eval("null"), JValue::Null);
        assert!(eval("$missing").is_undefined());
    }

    #[test]
    fn test_path_flattening_and_collapse() {
        let data = jvalue!({"a": [{"b": 1}, {"b": 2}]});
        assert_eq!(run("a.b", data).unwrap(), jvalue!([1, 2]));
        let data = jvalue!({"a": {"b": 1}});
        assert_eq!(run("a.b", data).unwrap(), JValue::from(1));
        assert!(run("a.c", jvalue!({"a": {"b": 1}})).unwrap().is_undefined());
    }

    #[test]
    fn test_keep_array() {
        let data = jvalue!({"a": {"b": 1}});
        assert_eq!(run("a.b[]", data).unwrap(), jvalue!([1]));
    }

    #[test]
    fn test_filters() {
        assert_eq!(run("orders[price > 20].item", orders()).unwrap(), jvalue!(["desk", "lamp"]));
        assert_eq!(run("orders[0].item", orders()).unwrap(), JValue::from("pen"));
        assert_eq!(run("orders[-1].item", orders()).unwrap(), JValue::from("lamp"));
        assert_eq!(run("orders[[0, 2]].id", orders()).unwrap(), jvalue!([1, 3]));
        assert!(run("orders[5]", orders()).unwrap().is_undefined());
    }

    #[test]
    fn test_arithmetic_and_comparison() {
        assert_eq!(eval("1 + 2 * 3"), JValue::from(7));
        assert_eq!(eval("7 % 4"), JValue::from(3));
        assert_eq!(eval("\"a\" < \"b\""), JValue::Bool(true));
        assert_eq!(eval("1 = 1.0"), JValue::Bool(true));
        assert_eq!(eval("[1, 2] = [1, 2]"), JValue::Bool(true));
        assert_eq!(eval("$x = 1"), JValue::Bool(false));
        assert!(eval("$x + 1").is_undefined());
        assert_eq!(eval("\"a\" & 1 & $x"), JValue::from("a1"));
        assert_eq!(eval("3 in [1, 2, 3]"), JValue::Bool(true));
    }

    #[test]
    fn test_operator_errors() {
        let err = run("1 + \"a\"", JValue::Undefined).unwrap_err();
        assert_eq!(err.code, "T2002");
        assert_eq!(err.token.as_deref(), Some("+"));
        assert_eq!(run("\"a\" - 1", JValue::Undefined).unwrap_err().code, "T2001");
        assert_eq!(run("\"a\" < 1", JValue::Undefined).unwrap_err().code, "T2009");
        assert_eq!(run("true < 1", JValue::Undefined).unwrap_err().code, "T2010");
        assert_eq!(run("1 / 0", JValue::Undefined).unwrap_err().code, "D1001");
        assert_eq!(run("-\"x\"", JValue::Undefined).unwrap_err().code, "D1002");
    }

    #[test]
    fn test_boolean_short_circuit() {
        // the right side would raise if it were evaluated
        assert_eq!(eval("false and (1 + \"a\")"), JValue::Bool(false));
        assert_eq!(eval("true or (1 + \"a\")"), JValue::Bool(true));
    }

    #[test]
    fn test_ranges() {
        assert_eq!(eval("[1..5]"), jvalue!([1, 2, 3, 4, 5]));
        assert_eq!(eval("[5..1]"), jvalue!([]));
        assert_eq!(eval("$count([1..10000000])"), JValue::from(10_000_000));
        assert_eq!(run("[1..10000001]", JValue::Undefined).unwrap_err().code, "D2014");
        assert_eq!(run("[1.5..3]", JValue::Undefined).unwrap_err().code, "T2003");
        assert_eq!(run("[1..\"x\"]", JValue::Undefined).unwrap_err().code, "T2004");
    }

    #[test]
    fn test_array_constructor_keeps_nested_arrays() {
        assert_eq!(eval("[1, [2, 3], 4]"), jvalue!([1, [2, 3], 4]));
        assert_eq!(eval("[[1]]"), jvalue!([[1]]));
    }

    #[test]
    fn test_object_constructor_and_group_by() {
        assert_eq!(eval("{\"a\": 1, \"b\": [1, 2]}"), jvalue!({"a": 1, "b": [1, 2]}));
        let counts = run("orders.tags{$: $count($)}", orders()).unwrap();
        assert_eq!(counts, jvalue!({"office": 2, "furniture": 2}));
        let totals = run("orders{item: price}", orders()).unwrap();
        assert_eq!(totals, jvalue!({"pen": 3, "desk": 120, "lamp": 25}));
        assert_eq!(run("{\"a\": 1, \"a\": 2}", JValue::Undefined).unwrap_err().code, "D1009");
        assert_eq!(run("{1: 2}", JValue::Undefined).unwrap_err().code, "T1003");
    }

    #[test]
    fn test_sort() {
        assert_eq!(run("orders^(>price).id", orders()).unwrap(), jvalue!([2, 3, 1]));
        assert_eq!(run("orders^(item).item", orders()).unwrap(), jvalue!(["desk", "lamp", "pen"]));
        let mixed = jvalue!([{"a": 1}, {"a": "x"}]);
        assert_eq!(run("$^(a)", mixed).unwrap_err().code, "T2007");
    }

    #[test]
    fn test_sort_puts_undefined_last() {
        let data = jvalue!([{"a": 2}, {"b": 1}, {"a": 1}]);
        assert_eq!(run("$^(a)", data).unwrap(), jvalue!([{"a": 1}, {"a": 2}, {"b": 1}]));
    }

    #[test]
    fn test_wildcard_and_descendants() {
        let data = jvalue!({"a": {"x": 1, "y": [2, 3]}, "b": {"z": {"deep": 4}}});
        assert_eq!(run("a.*", data.clone()).unwrap(), jvalue!([1, 2, 3]));
        assert_eq!(run("**.deep", data).unwrap(), JValue::from(4));
    }

    #[test]
    fn test_index_binding() {
        let result = run("orders#$i[$i > 0].item", orders()).unwrap();
        assert_eq!(result, jvalue!(["desk", "lamp"]));
    }

    #[test]
    fn test_focus_binding() {
        let data = jvalue!({
            "people": [{"name": "ann", "pet": "rex"}, {"name": "bob", "pet": "tom"}],
            "pets": [{"name": "rex", "kind": "dog"}, {"name": "tom", "kind": "cat"}]
        });
        let result = run("people@$p.$$.pets[name = $p.pet].{\"owner\": $p.name, \"kind\": kind}", data).unwrap();
        assert_eq!(
            result,
            jvalue!([{"owner": "ann", "kind": "dog"}, {"owner": "bob", "kind": "cat"}])
        );
    }

    #[test]
    fn test_parent_operator() {
        let data = jvalue!({"order": {"id": 7, "lines": [{"sku": "a"}, {"sku": "b"}]}});
        let result = run("order.lines.{\"sku\": sku, \"order\": %.id}", data).unwrap();
        assert_eq!(result, jvalue!([{"sku": "a", "order": 7}, {"sku": "b", "order": 7}]));
    }

    #[test]
    fn test_blocks_bindings_and_conditions() {
        assert_eq!(eval("($x := 2; $y := $x * 3; $y)"), JValue::from(6));
        assert_eq!(eval("1 > 2 ? \"yes\" : \"no\""), JValue::from("no"));
        assert!(eval("false ? 1").is_undefined());
    }

    #[test]
    fn test_lambdas_and_recursion() {
        assert_eq!(eval("(function($x){ $x * 2 })(21)"), JValue::from(42));
        let source = "($f := function($n){ $n <= 1 ? 1 : $n * $f($n - 1) }; $f(5))";
        assert_eq!(eval(source), JValue::from(120));
    }

    #[test]
    fn test_tail_calls_run_in_constant_depth() {
        let bounds = RuntimeBounds { timeout: None, max_depth: 100 };
        let mut evaluator = Evaluator::with_hook(Box::new(Watchdog::new(bounds)));
        let source = "($loop := function($n, $acc){ $n = 0 ? $acc : $loop($n - 1, $acc + 1) }; $loop(5000, 0))";
        assert_eq!(run_with(&mut evaluator, source, JValue::Undefined).unwrap(), JValue::from(5000));
    }

    #[test]
    fn test_deep_recursion_trips_watchdog() {
        let bounds = RuntimeBounds { timeout: None, max_depth: 60 };
        let mut evaluator = Evaluator::with_hook(Box::new(Watchdog::new(bounds)));
        let source = "($f := function($n){ $n = 0 ? 0 : 1 + $f($n - 1) }; $f(1000))";
        let err = run_with(&mut evaluator, source, JValue::Undefined).unwrap_err();
        assert_eq!(err.code, "U1001");
    }

    #[test]
    fn test_lambda_signature_is_checked() {
        let source = "(function($x)<n:n>{ $x + 1 })(\"a\")";
        assert_eq!(run(source, JValue::Undefined).unwrap_err().code, "T0410");
    }

    #[test]
    fn test_partial_application() {
        assert_eq!(eval("($add := function($a, $b){ $a + $b }; $inc := $add(?, 1); $inc(4))"), JValue::from(5));
        assert_eq!(eval("($first := $substring(?, 0, 3); $first(\"hello\"))"), JValue::from("hel"));
        assert_eq!(run("$nothing(?)", JValue::Undefined).unwrap_err().code, "T1008");
    }

    #[test]
    fn test_function_chaining() {
        assert_eq!(eval("\"hello\" ~> $uppercase()"), JValue::from("HELLO"));
        assert_eq!(eval("\"hello\" ~> $uppercase"), JValue::from("HELLO"));
        assert_eq!(eval("($f := $uppercase ~> $substring(?, 0, 2); $f(\"hello\"))"), JValue::from("HE"));
        assert_eq!(run("1 ~> 2", JValue::Undefined).unwrap_err().code, "T2006");
    }

    #[test]
    fn test_invoking_non_functions() {
        assert_eq!(run("$nothing()", JValue::Undefined).unwrap_err().code, "T1006");
        let err = run("sum(1)", jvalue!({})).unwrap_err();
        assert_eq!(err.code, "T1005");
        assert_eq!(err.token.as_deref(), Some("sum"));
    }

    #[test]
    fn test_regex_application() {
        let result = eval("/l+/(\"hello\")");
        assert_eq!(result, jvalue!({"match": "ll", "index": 2, "groups": []}));
        assert!(eval("/z/(\"hello\")").is_undefined());
    }

    #[test]
    fn test_transform() {
        let data = jvalue!({"a": {"b": 1, "c": 2}, "keep": true});
        let result = run("$ ~> |a|{\"d\": 3}, [\"c\"]|", data.clone()).unwrap();
        assert_eq!(result, jvalue!({"a": {"b": 1, "d": 3}, "keep": true}));
        // the input itself is untouched
        assert_eq!(run("$", data.clone()).unwrap(), data);
        assert_eq!(run("$ ~> |a|5|", data.clone()).unwrap_err().code, "T2011");
        assert_eq!(run("$ ~> |a|{}, 5|", data).unwrap_err().code, "T2012");
    }

    #[test]
    fn test_builtin_callbacks() {
        assert_eq!(eval("$map([1, 2, 3], function($v){ $v * 10 })"), jvalue!([10, 20, 30]));
        assert_eq!(eval("$filter([1, 2, 3, 4], function($v, $i){ $i % 2 = 0 })"), jvalue!([1, 3]));
        assert_eq!(run("$sum(orders.price)", orders()).unwrap(), JValue::from(148));
    }

    #[test]
    fn test_timestamp_is_frozen() {
        assert_eq!(eval("$now() = $now()"), JValue::Bool(true));
        assert_eq!(eval("$millis() = $millis()"), JValue::Bool(true));
    }

    #[test]
    fn test_outer_array_input() {
        let data = jvalue!([{"a": 1}, {"a": 2}]);
        assert_eq!(run("a", data.clone()).unwrap(), jvalue!([1, 2]));
        assert_eq!(run("$[1].a", data.clone()).unwrap(), JValue::from(2));
        assert_eq!(run("$", data.clone()).unwrap(), data);
    }

    #[test]
    fn test_bound_frames_are_released() {
        let frame = Frame::child(&Frame::root());
        {
            let mut evaluator = Evaluator::new();
            let ast = parser::parse("$f := function(){ $f }").unwrap();
            evaluator.evaluate(&ast, &JValue::Undefined, &frame).unwrap();
            assert!(frame.lookup("f").is_some());
        }
        assert!(frame.names().is_empty());
    }
}
