// AST normalizer
// Rewrites the raw parse tree: `.` chains become paths of steps, predicates,
// group-by and order-by clauses are attached to the steps they qualify,
// `%` references are resolved to the steps that supply them, and tail
// calls inside lambda bodies are wrapped as thunks.

use std::sync::Arc;

use crate::ast::{AncestorSlot, AstNode, BinaryOp, GroupBy, NodeKind, SortTerm, Stage};
use crate::errors::{Error, Result};
use crate::parser::{RawKind, RawNode};
use crate::utils::format_number;

/// Bookkeeping for one `%` reference.
#[derive(Debug)]
struct Slot {
    label: String,
    /// Number of enclosing steps still to climb.
    level: usize,
}

pub(crate) struct Normalizer<'e> {
    slots: Vec<Slot>,
    recover: bool,
    errors: &'e mut Vec<Error>,
}

/// Slots a node still needs resolved, including its own if it is a `%`.
fn push_ancestry(target: &mut Vec<usize>, value: &AstNode) {
    target.extend_from_slice(&value.seeking_parent);
    if let NodeKind::Parent(slot) = &value.kind {
        target.push(slot.index);
    }
}

fn into_path(node: AstNode) -> AstNode {
    let position = node.position;
    AstNode::new(NodeKind::Path { steps: vec![node] }, position)
}

/// The last step of a path, or the node itself.
fn target_step(node: &mut AstNode) -> &mut AstNode {
    if node.steps().is_empty() {
        return node;
    }
    match node.kind {
        NodeKind::Path { ref mut steps } => {
            let last = steps.len() - 1;
            &mut steps[last]
        }
        _ => node,
    }
}

fn variable_name(raw: RawNode, code: &'static str) -> Result<String> {
    match raw.kind {
        RawKind::Variable(name) => Ok(name),
        _ => Err(Error::at(code, raw.position)),
    }
}

/// Wrap a trailing function call so the trampoline can run it in a loop.
fn tail_call_optimize(mut expr: AstNode) -> AstNode {
    if matches!(expr.kind, NodeKind::Function { .. }) && expr.predicate.is_empty() {
        let position = expr.position;
        return AstNode::new(
            NodeKind::Lambda {
                params: Vec::new(),
                body: Arc::new(expr),
                signature: None,
                thunk: true,
            },
            position,
        );
    }
    match &mut expr.kind {
        NodeKind::Condition { then, otherwise, .. } => {
            optimize_in_place(then);
            if let Some(otherwise) = otherwise {
                optimize_in_place(otherwise);
            }
        }
        NodeKind::Block(expressions) => {
            if let Some(last) = expressions.last_mut() {
                optimize_in_place(last);
            }
        }
        _ => {}
    }
    expr
}

fn optimize_in_place(node: &mut AstNode) {
    let taken = std::mem::replace(node, AstNode::new(NodeKind::Null, 0));
    *node = tail_call_optimize(taken);
}

impl<'e> Normalizer<'e> {
    pub(crate) fn new(recover: bool, errors: &'e mut Vec<Error>) -> Self {
        Normalizer {
            slots: Vec::new(),
            recover,
            errors,
        }
    }

    pub(crate) fn normalize(mut self, raw: RawNode) -> Result<AstNode> {
        let mut ast = self.process(raw)?;
        if matches!(ast.kind, NodeKind::Parent(_)) || !ast.seeking_parent.is_empty() {
            return Err(Error::at("S0217", ast.position).with_token(ast.type_name()));
        }
        self.relabel(&mut ast);
        Ok(ast)
    }

    fn process(&mut self, raw: RawNode) -> Result<AstNode> {
        let keep_array = raw.keep_array;
        let position = raw.position;
        let mut result = match raw.kind {
            RawKind::Binary { op, lhs, rhs } => self.binary(op, *lhs, *rhs, keep_array, position)?,
            RawKind::Group { lhs, pairs } => self.group(*lhs, pairs, position)?,
            RawKind::Sort { lhs, terms } => self.sort(*lhs, terms, position)?,
            RawKind::Negate(operand) => {
                let operand = self.process(*operand)?;
                if let NodeKind::Number(n) = operand.kind {
                    let mut folded = operand;
                    folded.kind = NodeKind::Number(-n);
                    folded
                } else {
                    let mut seeking = Vec::new();
                    push_ancestry(&mut seeking, &operand);
                    let mut node = AstNode::new(NodeKind::Negate(Box::new(operand)), position);
                    node.seeking_parent = seeking;
                    node
                }
            }
            RawKind::Array(items) => {
                let mut seeking = Vec::new();
                let mut processed = Vec::with_capacity(items.len());
                for item in items {
                    let item = self.process(item)?;
                    push_ancestry(&mut seeking, &item);
                    processed.push(item);
                }
                let mut node = AstNode::new(NodeKind::Array(processed), position);
                node.seeking_parent = seeking;
                node
            }
            RawKind::Object(pairs) => {
                let mut seeking = Vec::new();
                let mut processed = Vec::with_capacity(pairs.len());
                for (key, value) in pairs {
                    let key = self.process(key)?;
                    push_ancestry(&mut seeking, &key);
                    let value = self.process(value)?;
                    push_ancestry(&mut seeking, &value);
                    processed.push((key, value));
                }
                let mut node = AstNode::new(NodeKind::Object(processed), position);
                node.seeking_parent = seeking;
                node
            }
            RawKind::Call {
                procedure,
                args,
                partial,
            } => {
                let mut seeking = Vec::new();
                let mut processed = Vec::with_capacity(args.len());
                for arg in args {
                    let arg = self.process(arg)?;
                    push_ancestry(&mut seeking, &arg);
                    processed.push(arg);
                }
                let procedure = Box::new(self.process(*procedure)?);
                let kind = if partial {
                    NodeKind::Partial {
                        procedure,
                        args: processed,
                    }
                } else {
                    NodeKind::Function {
                        procedure,
                        args: processed,
                    }
                };
                let mut node = AstNode::new(kind, position);
                node.seeking_parent = seeking;
                node
            }
            RawKind::Lambda {
                params,
                signature,
                body,
            } => {
                let body = tail_call_optimize(self.process(*body)?);
                AstNode::new(
                    NodeKind::Lambda {
                        params,
                        body: Arc::new(body),
                        signature: signature.map(Arc::new),
                        thunk: false,
                    },
                    position,
                )
            }
            RawKind::Condition {
                condition,
                then,
                otherwise,
            } => {
                let mut seeking = Vec::new();
                let condition = self.process(*condition)?;
                push_ancestry(&mut seeking, &condition);
                let then = self.process(*then)?;
                push_ancestry(&mut seeking, &then);
                let otherwise = match otherwise {
                    Some(otherwise) => {
                        let otherwise = self.process(*otherwise)?;
                        push_ancestry(&mut seeking, &otherwise);
                        Some(Box::new(otherwise))
                    }
                    None => None,
                };
                let mut node = AstNode::new(
                    NodeKind::Condition {
                        condition: Box::new(condition),
                        then: Box::new(then),
                        otherwise,
                    },
                    position,
                );
                node.seeking_parent = seeking;
                node
            }
            RawKind::Transform {
                pattern,
                update,
                delete,
            } => {
                let pattern = Box::new(self.process(*pattern)?);
                let update = Box::new(self.process(*update)?);
                let delete = match delete {
                    Some(delete) => Some(Box::new(self.process(*delete)?)),
                    None => None,
                };
                AstNode::new(
                    NodeKind::Transform {
                        pattern,
                        update,
                        delete,
                    },
                    position,
                )
            }
            RawKind::Block(expressions) => {
                let mut seeking = Vec::new();
                let mut cons_array = false;
                let mut processed = Vec::with_capacity(expressions.len());
                for expr in expressions {
                    let part = self.process(expr)?;
                    push_ancestry(&mut seeking, &part);
                    if part.cons_array || part.steps().first().is_some_and(|s| s.cons_array) {
                        cons_array = true;
                    }
                    processed.push(part);
                }
                let mut node = AstNode::new(NodeKind::Block(processed), position);
                node.seeking_parent = seeking;
                node.cons_array = cons_array;
                node
            }
            RawKind::Name(name) => self.name(name, keep_array, position),
            RawKind::Operator(op @ ("and" | "or" | "in")) => self.name(op.to_string(), keep_array, position),
            RawKind::Operator("?") => AstNode::new(NodeKind::Placeholder, position),
            RawKind::Operator(op) => return Err(Error::at("S0201", position).with_token(op)),
            RawKind::Parent => {
                let index = self.slots.len();
                let label = format!("!{}", index);
                self.slots.push(Slot {
                    label: label.clone(),
                    level: 1,
                });
                AstNode::new(NodeKind::Parent(AncestorSlot { label, index }), position)
            }
            RawKind::Variable(name) => AstNode::new(NodeKind::Variable(name), position),
            RawKind::String(s) => AstNode::new(NodeKind::String(s), position),
            RawKind::Number(n) => AstNode::new(NodeKind::Number(n), position),
            RawKind::Bool(b) => AstNode::new(NodeKind::Bool(b), position),
            RawKind::Null => AstNode::new(NodeKind::Null, position),
            RawKind::Regex(r) => AstNode::new(NodeKind::Regex(r), position),
            RawKind::Wildcard => AstNode::new(NodeKind::Wildcard, position),
            RawKind::Descendant => AstNode::new(NodeKind::Descendant, position),
            RawKind::Error(err) => AstNode::new(NodeKind::Error(err), position),
            RawKind::End => {
                let err = Error::at("S0207", position);
                if !self.recover {
                    return Err(err);
                }
                self.errors.push(err.clone());
                AstNode::new(NodeKind::Error(err), position)
            }
        };
        if keep_array {
            result.keep_array = true;
        }
        Ok(result)
    }

    fn name(&mut self, name: String, keep_array: bool, position: usize) -> AstNode {
        let mut step = AstNode::new(NodeKind::Name(name), position);
        step.keep_array = keep_array;
        let mut path = into_path(step);
        path.keep_singleton_array = keep_array;
        path
    }

    fn binary(
        &mut self,
        op: &'static str,
        lhs: RawNode,
        rhs: RawNode,
        keep_array: bool,
        position: usize,
    ) -> Result<AstNode> {
        match op {
            "." => self.dot(lhs, rhs),
            "[" => self.filter(lhs, rhs, keep_array, position),
            ":=" => {
                let name = variable_name(lhs, "S0212")?;
                let value = self.process(rhs)?;
                let mut seeking = Vec::new();
                push_ancestry(&mut seeking, &value);
                let mut node = AstNode::new(
                    NodeKind::Bind {
                        name,
                        value: Box::new(value),
                    },
                    position,
                );
                node.seeking_parent = seeking;
                Ok(node)
            }
            "@" => self.focus(lhs, rhs, keep_array, position),
            "#" => self.index(lhs, rhs),
            "~>" => {
                let lhs = self.process(lhs)?;
                let rhs = self.process(rhs)?;
                Ok(AstNode::new(
                    NodeKind::Apply {
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    position,
                ))
            }
            _ => {
                let op = BinaryOp::from_symbol(op).ok_or_else(|| Error::at("S0201", position).with_token(op))?;
                let lhs = self.process(lhs)?;
                let rhs = self.process(rhs)?;
                let mut seeking = Vec::new();
                push_ancestry(&mut seeking, &lhs);
                push_ancestry(&mut seeking, &rhs);
                let mut node = AstNode::new(
                    NodeKind::Binary {
                        op,
                        lhs: Box::new(lhs),
                        rhs: Box::new(rhs),
                    },
                    position,
                );
                node.seeking_parent = seeking;
                Ok(node)
            }
        }
    }

    /// `lhs.rhs`: extend the path on the left with the step(s) on the right.
    fn dot(&mut self, lhs: RawNode, rhs: RawNode) -> Result<AstNode> {
        let lstep = self.process(lhs)?;
        let parent_slot = match &lstep.kind {
            NodeKind::Parent(slot) => Some(slot.index),
            _ => None,
        };
        let mut result = if lstep.is_path() { lstep } else { into_path(lstep) };
        if let Some(index) = parent_slot {
            result.seeking_parent = vec![index];
        }

        let mut rest = self.process(rhs)?;
        if let NodeKind::Path { steps } = &mut result.kind {
            match rest.kind {
                NodeKind::Path { steps: rest_steps } => steps.extend(rest_steps),
                _ => {
                    if !rest.predicate.is_empty() {
                        rest.stages = std::mem::take(&mut rest.predicate);
                    }
                    steps.push(rest);
                }
            }

            for step in steps.iter_mut() {
                let literal = match &step.kind {
                    NodeKind::Number(n) => Some(format_number(*n)),
                    NodeKind::Bool(b) => Some(b.to_string()),
                    NodeKind::Null => Some("null".to_string()),
                    _ => None,
                };
                if let Some(literal) = literal {
                    return Err(Error::at("S0213", step.position).with_token(literal));
                }
                if let NodeKind::String(s) = &mut step.kind {
                    let name = std::mem::take(s);
                    step.kind = NodeKind::Name(name);
                }
            }

            if steps.iter().any(|s| s.keep_array) {
                result.keep_singleton_array = true;
            }
            if let Some(first) = steps.first_mut() {
                if matches!(first.kind, NodeKind::Array(_)) {
                    first.cons_array = true;
                }
            }
            if let Some(last) = steps.last_mut() {
                if matches!(last.kind, NodeKind::Array(_)) {
                    last.cons_array = true;
                }
            }
        }
        self.resolve_ancestry(&mut result)?;
        Ok(result)
    }

    /// `lhs[rhs]`: a filter stage on the last step (inside a path) or a
    /// predicate on the node itself.
    fn filter(&mut self, lhs: RawNode, rhs: RawNode, keep_array: bool, position: usize) -> Result<AstNode> {
        let mut result = self.process(lhs)?;
        let in_path = result.is_path();
        let step = target_step(&mut result);
        if step.group.is_some() {
            return Err(Error::at("S0209", position));
        }

        let predicate = self.process(rhs)?;
        for &slot in &predicate.seeking_parent {
            if self.slots[slot].level == 1 {
                self.seek_parent(step, slot)?;
            } else {
                self.slots[slot].level -= 1;
            }
        }
        push_ancestry(&mut step.seeking_parent, &predicate);

        if keep_array {
            step.keep_array = true;
        }
        let stage = Stage::Filter {
            expr: Box::new(predicate),
            position,
        };
        if in_path {
            step.stages.push(stage);
        } else {
            step.predicate.push(stage);
        }
        Ok(result)
    }

    /// `lhs{key: value}`
    fn group(&mut self, lhs: RawNode, pairs: Vec<(RawNode, RawNode)>, position: usize) -> Result<AstNode> {
        let mut result = self.process(lhs)?;
        if result.group.is_some() {
            return Err(Error::at("S0210", position));
        }
        let mut processed = Vec::with_capacity(pairs.len());
        for (key, value) in pairs {
            processed.push((self.process(key)?, self.process(value)?));
        }
        result.group = Some(GroupBy {
            pairs: processed,
            position,
        });
        Ok(result)
    }

    /// `lhs^(terms)` appends a sort step.
    fn sort(&mut self, lhs: RawNode, terms: Vec<(RawNode, bool)>, position: usize) -> Result<AstNode> {
        let result = self.process(lhs)?;
        let mut result = if result.is_path() { result } else { into_path(result) };

        let mut seeking = Vec::new();
        let mut processed = Vec::with_capacity(terms.len());
        for (expression, descending) in terms {
            let expression = self.process(expression)?;
            push_ancestry(&mut seeking, &expression);
            processed.push(SortTerm {
                expression,
                descending,
            });
        }
        let mut sort = AstNode::new(NodeKind::Sort { terms: processed }, position);
        sort.seeking_parent = seeking;

        if let NodeKind::Path { steps } = &mut result.kind {
            steps.push(sort);
        }
        self.resolve_ancestry(&mut result)?;
        Ok(result)
    }

    /// `lhs@$name`
    fn focus(&mut self, lhs: RawNode, rhs: RawNode, keep_array: bool, position: usize) -> Result<AstNode> {
        let mut result = self.process(lhs)?;
        let name = variable_name(rhs, "S0214")?;
        let step = target_step(&mut result);
        if !step.stages.is_empty() || !step.predicate.is_empty() {
            return Err(Error::at("S0215", position));
        }
        if matches!(step.kind, NodeKind::Sort { .. }) {
            return Err(Error::at("S0216", position));
        }
        if keep_array {
            step.keep_array = true;
        }
        step.focus = Some(name);
        step.tuple = true;
        Ok(result)
    }

    /// `lhs#$name`
    fn index(&mut self, lhs: RawNode, rhs: RawNode) -> Result<AstNode> {
        let mut result = self.process(lhs)?;
        let name = variable_name(rhs, "S0214")?;
        if !result.is_path() {
            if !result.predicate.is_empty() {
                result.stages = std::mem::take(&mut result.predicate);
            }
            result = into_path(result);
        }
        let step = target_step(&mut result);
        if step.stages.is_empty() {
            step.index = Some(name);
        } else {
            step.stages.push(Stage::Index { name });
        }
        step.tuple = true;
        Ok(result)
    }

    /// Climb from `node` towards the step that supplies the ancestor for `slot`.
    fn seek_parent(&mut self, node: &mut AstNode, slot: usize) -> Result<()> {
        match node.kind {
            NodeKind::Name(_) | NodeKind::Wildcard => {
                let state = &mut self.slots[slot];
                state.level = state.level.saturating_sub(1);
                if state.level == 0 {
                    match &node.ancestor {
                        None => {
                            node.ancestor = Some(AncestorSlot {
                                label: state.label.clone(),
                                index: slot,
                            });
                        }
                        Some(existing) => {
                            // Share the label already recorded on this step.
                            let label = self.slots[existing.index].label.clone();
                            self.slots[slot].label = label.clone();
                            node.ancestor = Some(AncestorSlot { label, index: slot });
                        }
                    }
                    node.tuple = true;
                }
            }
            NodeKind::Parent(_) => self.slots[slot].level += 1,
            NodeKind::Block(ref mut expressions) => {
                if let Some(last) = expressions.last_mut() {
                    node.tuple = true;
                    self.seek_parent(last, slot)?;
                }
            }
            NodeKind::Path { ref mut steps } => {
                node.tuple = true;
                let mut index = steps.len();
                while index > 0 {
                    index -= 1;
                    self.seek_parent(&mut steps[index], slot)?;
                    if self.slots[slot].level == 0 {
                        break;
                    }
                }
            }
            _ => {
                return Err(Error::at("S0217", node.position).with_token(node.type_name()));
            }
        }
        Ok(())
    }

    /// Resolve the `%` slots of a path's last step against its earlier steps.
    /// Slots that climb past the first step bubble up on the path itself.
    fn resolve_ancestry(&mut self, path: &mut AstNode) -> Result<()> {
        let AstNode {
            kind: NodeKind::Path { steps },
            seeking_parent,
            ..
        } = path
        else {
            return Ok(());
        };
        let Some(last) = steps.last() else {
            return Ok(());
        };
        let mut slots = Vec::new();
        push_ancestry(&mut slots, last);

        for slot in slots {
            let mut index = steps.len() as isize - 2;
            while self.slots[slot].level > 0 {
                if index < 0 {
                    seeking_parent.push(slot);
                    break;
                }
                let mut step = index as usize;
                index -= 1;
                // contiguous focus-binding steps count as one
                while index >= 0 && steps[step].focus.is_some() && steps[index as usize].focus.is_some() {
                    step = index as usize;
                    index -= 1;
                }
                self.seek_parent(&mut steps[step], slot)?;
            }
        }
        Ok(())
    }

    /// Write the final slot labels into every `%` and ancestor binding.
    fn relabel(&self, node: &mut AstNode) {
        if let Some(slot) = &mut node.ancestor {
            slot.label = self.slots[slot.index].label.clone();
        }
        match &mut node.kind {
            NodeKind::Path { steps: nodes } | NodeKind::Array(nodes) | NodeKind::Block(nodes) => {
                for child in nodes {
                    self.relabel(child);
                }
            }
            NodeKind::Binary { lhs, rhs, .. } | NodeKind::Apply { lhs, rhs } => {
                self.relabel(lhs);
                self.relabel(rhs);
            }
            NodeKind::Negate(operand) => self.relabel(operand),
            NodeKind::Object(pairs) => {
                for (key, value) in pairs {
                    self.relabel(key);
                    self.relabel(value);
                }
            }
            NodeKind::Parent(slot) => slot.label = self.slots[slot.index].label.clone(),
            NodeKind::Condition {
                condition,
                then,
                otherwise,
            } => {
                self.relabel(condition);
                self.relabel(then);
                if let Some(otherwise) = otherwise {
                    self.relabel(otherwise);
                }
            }
            NodeKind::Bind { value, .. } => self.relabel(value),
            NodeKind::Function { procedure, args } | NodeKind::Partial { procedure, args } => {
                self.relabel(procedure);
                for arg in args {
                    self.relabel(arg);
                }
            }
            NodeKind::Lambda { body, .. } => self.relabel(Arc::make_mut(body)),
            NodeKind::Sort { terms } => {
                for term in terms {
                    self.relabel(&mut term.expression);
                }
            }
            NodeKind::Transform {
                pattern,
                update,
                delete,
            } => {
                self.relabel(pattern);
                self.relabel(update);
                if let Some(delete) = delete {
                    self.relabel(delete);
                }
            }
            _ => {}
        }
        for stage in node.predicate.iter_mut().chain(node.stages.iter_mut()) {
            if let Stage::Filter { expr, .. } = stage {
                self.relabel(expr);
            }
        }
        if let Some(group) = &mut node.group {
            for (key, value) in &mut group.pairs {
                self.relabel(key);
                self.relabel(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::ast::{AstNode, NodeKind};
    use crate::parser::parse;

    fn lambda_body(ast: AstNode) -> AstNode {
        match ast.kind {
            NodeKind::Lambda { body, .. } => (*body).clone(),
            other => panic!("Expected lambda, got {:?}", other),
        }
    }

    #[test]
    fn test_array_constructor_steps() {
        let ast = parse("[1, 2].a").unwrap();
        assert!(ast.steps()[0].cons_array);

        let ast = parse("a.[b, c]").unwrap();
        assert!(ast.steps()[1].cons_array);
        assert!(!ast.steps()[0].cons_array);

        let ast = parse("([1, 2].a)").unwrap();
        assert!(ast.cons_array);
    }

    #[test]
    fn test_tail_call_in_block() {
        let body = lambda_body(parse("function($n){ ($m := $n - 1; $f($m)) }").unwrap());
        let NodeKind::Block(expressions) = body.kind else {
            panic!("Expected block body");
        };
        assert!(matches!(expressions[0].kind, NodeKind::Bind { .. }));
        assert!(matches!(expressions[1].kind, NodeKind::Lambda { thunk: true, .. }));
    }

    #[test]
    fn test_filtered_call_is_not_a_tail_call() {
        let body = lambda_body(parse("function($n){ $f($n)[0] }").unwrap());
        assert!(matches!(body.kind, NodeKind::Function { .. }));
        assert_eq!(body.predicate.len(), 1);
    }

    #[test]
    fn test_parents_on_one_step_share_a_label() {
        let ast = parse("a.b.{\"x\": %.c, \"y\": %.d}").unwrap();
        let steps = ast.steps();
        assert_eq!(steps[1].ancestor.as_ref().map(|s| s.label.as_str()), Some("!0"));

        let NodeKind::Object(pairs) = &steps[2].kind else {
            panic!("Expected object step");
        };
        for (_, value) in pairs {
            match &value.steps()[0].kind {
                NodeKind::Parent(slot) => assert_eq!(slot.label, "!0"),
                other => panic!("Expected parent, got {:?}", other),
            }
        }
    }

    #[test]
    fn test_literal_steps_are_rejected() {
        let err = parse("a.true").unwrap_err();
        assert_eq!(err.code, "S0213");
        assert_eq!(err.token.as_deref(), Some("true"));
        assert_eq!(parse("a.null").unwrap_err().code, "S0213");
    }

    #[test]
    fn test_negative_numbers_fold() {
        assert_eq!(parse("-2.5").unwrap().kind, NodeKind::Number(-2.5));
        assert!(matches!(parse("-(2)").unwrap().kind, NodeKind::Negate(_)));
    }
}
