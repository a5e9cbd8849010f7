// JSONata expression parser
// Pratt parser over the token stream. Builds a raw operator tree which the
// normalizer then rewrites into the `AstNode` form the evaluator walks.

use std::sync::Arc;

use tracing::trace;

use crate::ast::AstNode;
use crate::errors::{Error, Result};
use crate::normalize::Normalizer;
use crate::signature::Signature;
use crate::tokenizer::{binding_power, Token, TokenValue, Tokenizer};
use crate::utils::format_number;
use crate::value::RegexLiteral;

/// Left binding power of a registered symbol. `None` means the tokenizer
/// knows the operator but the grammar does not (`!`, `~`).
fn left_binding_power(id: &str) -> Option<u8> {
    match id {
        "(end)" | "(name)" | "(literal)" | "(regex)" => Some(0),
        ":" | ";" | "," | ")" | "]" | "}" | ".." | "**" | "|" => Some(0),
        "!" | "~" => None,
        _ => binding_power(id),
    }
}

/// Node of the raw parse tree.
#[derive(Debug, Clone)]
pub(crate) struct RawNode {
    pub kind: RawKind,
    pub position: usize,
    /// `[]` followed this node.
    pub keep_array: bool,
}

#[derive(Debug, Clone)]
pub(crate) enum RawKind {
    Name(String),
    Variable(String),
    String(String),
    Number(f64),
    Bool(bool),
    Null,
    Regex(Arc<RegexLiteral>),
    Wildcard,
    Descendant,
    Parent,
    /// `and`/`or`/`in` in prefix position, or a `?` argument placeholder
    Operator(&'static str),
    Binary {
        op: &'static str,
        lhs: Box<RawNode>,
        rhs: Box<RawNode>,
    },
    Negate(Box<RawNode>),
    Array(Vec<RawNode>),
    Object(Vec<(RawNode, RawNode)>),
    Group {
        lhs: Box<RawNode>,
        pairs: Vec<(RawNode, RawNode)>,
    },
    Sort {
        lhs: Box<RawNode>,
        terms: Vec<(RawNode, bool)>,
    },
    Block(Vec<RawNode>),
    Call {
        procedure: Box<RawNode>,
        args: Vec<RawNode>,
        partial: bool,
    },
    Lambda {
        params: Vec<String>,
        signature: Option<Signature>,
        body: Box<RawNode>,
    },
    Condition {
        condition: Box<RawNode>,
        then: Box<RawNode>,
        otherwise: Option<Box<RawNode>>,
    },
    Transform {
        pattern: Box<RawNode>,
        update: Box<RawNode>,
        delete: Option<Box<RawNode>>,
    },
    /// Input ran out where an operand was expected
    End,
    Error(Error),
}

impl RawNode {
    fn new(kind: RawKind, position: usize) -> Self {
        RawNode {
            kind,
            position,
            keep_array: false,
        }
    }

    fn binary(op: &'static str, lhs: RawNode, rhs: RawNode, position: usize) -> Self {
        RawNode::new(
            RawKind::Binary {
                op,
                lhs: Box::new(lhs),
                rhs: Box::new(rhs),
            },
            position,
        )
    }

    /// Literal rendering for error details.
    pub(crate) fn describe(&self) -> String {
        match &self.kind {
            RawKind::Name(s) | RawKind::String(s) => s.clone(),
            RawKind::Variable(s) => format!("${}", s),
            RawKind::Number(n) => format_number(*n),
            RawKind::Bool(b) => b.to_string(),
            RawKind::Null => "null".to_string(),
            RawKind::Operator(op) => op.to_string(),
            _ => String::new(),
        }
    }
}

fn terminal(token: Token) -> RawKind {
    match token.value {
        TokenValue::Name(s) => RawKind::Name(s),
        TokenValue::Variable(s) => RawKind::Variable(s),
        TokenValue::String(s) => RawKind::String(s),
        TokenValue::Number(n) => RawKind::Number(n),
        TokenValue::Bool(b) => RawKind::Bool(b),
        TokenValue::Null => RawKind::Null,
        TokenValue::Regex(r) => RawKind::Regex(r),
        TokenValue::Operator(op) => RawKind::Operator(op),
    }
}

/// The symbol under the cursor.
#[derive(Debug, Clone)]
struct Cursor {
    id: &'static str,
    token: Option<Token>,
    position: usize,
}

impl Cursor {
    fn text(&self) -> String {
        match &self.token {
            Some(token) => token.text(),
            None => self.id.to_string(),
        }
    }
}

/// Pratt parser for JSONata expressions
pub(crate) struct Parser {
    tokenizer: Tokenizer,
    current: Cursor,
    recover: bool,
    errors: Vec<Error>,
}

impl Parser {
    fn new(source: &str, recover: bool) -> Self {
        Parser {
            tokenizer: Tokenizer::new(source),
            current: Cursor {
                id: "(end)",
                token: None,
                position: 0,
            },
            recover,
            errors: Vec::new(),
        }
    }

    /// Record the error in recover mode, otherwise fail with it.
    fn recoverable(&mut self, err: Error) -> Result<()> {
        if self.recover {
            self.errors.push(err);
            Ok(())
        } else {
            Err(err)
        }
    }

    /// Like `recoverable`, substituting an error node for the failed construct.
    fn fail(&mut self, err: Error, position: usize) -> Result<RawNode> {
        self.recoverable(err.clone())?;
        Ok(RawNode::new(RawKind::Error(err), position))
    }

    /// Move to the next token, first checking the current one is `expected`.
    /// `infix` tells the tokenizer an operator is expected, so `/` is division.
    fn advance(&mut self, expected: Option<&'static str>, infix: bool) -> Result<()> {
        if let Some(id) = expected {
            if self.current.id != id {
                let code = if self.current.id == "(end)" { "S0203" } else { "S0202" };
                let err = Error::at(code, self.current.position)
                    .with_token(id)
                    .with_value(self.current.text());
                return self.recoverable(err);
            }
        }
        loop {
            let Some(token) = self.tokenizer.next(infix)? else {
                self.current = Cursor {
                    id: "(end)",
                    token: None,
                    position: self.tokenizer.source_len(),
                };
                return Ok(());
            };
            let id = match &token.value {
                TokenValue::Name(_) | TokenValue::Variable(_) => "(name)",
                TokenValue::Regex(_) => "(regex)",
                TokenValue::Operator(op) => {
                    let op: &'static str = *op;
                    if left_binding_power(op).is_none() {
                        self.recoverable(Error::at("S0204", token.position).with_token(op))?;
                        continue;
                    }
                    op
                }
                _ => "(literal)",
            };
            self.current = Cursor {
                id,
                position: token.position,
                token: Some(token),
            };
            return Ok(());
        }
    }

    fn lbp(&self) -> u8 {
        left_binding_power(self.current.id).unwrap_or(0)
    }

    fn expression(&mut self, rbp: u8) -> Result<RawNode> {
        let t = self.current.clone();
        self.advance(None, true)?;
        let mut left = self.nud(t)?;
        while rbp < self.lbp() {
            let t = self.current.clone();
            self.advance(None, false)?;
            left = self.led(t, left)?;
        }
        Ok(left)
    }

    /// Prefix position.
    fn nud(&mut self, t: Cursor) -> Result<RawNode> {
        let position = t.position;
        match t.id {
            "(name)" | "(literal)" | "(regex)" => {
                let text = t.text();
                match t.token {
                    Some(token) => Ok(RawNode::new(terminal(token), position)),
                    None => self.fail(Error::at("S0205", position).with_token(text), position),
                }
            }
            "(end)" => Ok(RawNode::new(RawKind::End, position)),
            "-" => {
                let operand = self.expression(70)?;
                Ok(RawNode::new(RawKind::Negate(Box::new(operand)), position))
            }
            "*" => Ok(RawNode::new(RawKind::Wildcard, position)),
            "**" => Ok(RawNode::new(RawKind::Descendant, position)),
            "%" => Ok(RawNode::new(RawKind::Parent, position)),
            "(" => self.block(position),
            "[" => self.array(position),
            "{" => self.object(None, position),
            "|" => self.transform(position),
            "and" | "or" | "in" => Ok(RawNode::new(RawKind::Operator(t.id), position)),
            _ => self.fail(Error::at("S0211", position).with_token(t.text()), position),
        }
    }

    /// Infix position.
    fn led(&mut self, t: Cursor, left: RawNode) -> Result<RawNode> {
        let position = t.position;
        match t.id {
            "(" => self.call(left, position),
            "[" => self.predicate(left, position),
            "{" => self.object(Some(left), position),
            "^" => self.sort(left, position),
            ":=" => {
                if !matches!(left.kind, RawKind::Variable(_)) {
                    let at = left.position;
                    return self.fail(Error::at("S0212", at).with_token(left.describe()), at);
                }
                // right associative
                let rhs = self.expression(binding_power(":=").unwrap_or(10) - 1)?;
                Ok(RawNode::binary(":=", left, rhs, position))
            }
            "@" | "#" => {
                let rhs = self.expression(binding_power(t.id).unwrap_or(80))?;
                if !matches!(rhs.kind, RawKind::Variable(_)) {
                    let at = rhs.position;
                    return self.fail(Error::at("S0214", at).with_token(t.id), at);
                }
                Ok(RawNode::binary(t.id, left, rhs, position))
            }
            "?" => {
                let then = self.expression(0)?;
                let otherwise = if self.current.id == ":" {
                    self.advance(Some(":"), false)?;
                    Some(Box::new(self.expression(0)?))
                } else {
                    None
                };
                Ok(RawNode::new(
                    RawKind::Condition {
                        condition: Box::new(left),
                        then: Box::new(then),
                        otherwise,
                    },
                    position,
                ))
            }
            op => match left_binding_power(op) {
                Some(bp) if bp > 0 => {
                    let rhs = self.expression(bp)?;
                    Ok(RawNode::binary(op, left, rhs, position))
                }
                _ => self.fail(Error::at("S0201", position).with_token(op), position),
            },
        }
    }

    /// `( expr; expr; ... )`
    fn block(&mut self, position: usize) -> Result<RawNode> {
        let mut expressions = Vec::new();
        while self.current.id != ")" {
            expressions.push(self.expression(0)?);
            if self.current.id != ";" {
                break;
            }
            self.advance(Some(";"), false)?;
        }
        self.advance(Some(")"), true)?;
        Ok(RawNode::new(RawKind::Block(expressions), position))
    }

    /// `[ item, lo..hi, ... ]`
    fn array(&mut self, position: usize) -> Result<RawNode> {
        let mut items = Vec::new();
        if self.current.id != "]" {
            loop {
                let mut item = self.expression(0)?;
                if self.current.id == ".." {
                    let range_position = self.current.position;
                    self.advance(Some(".."), false)?;
                    let rhs = self.expression(0)?;
                    item = RawNode::binary("..", item, rhs, range_position);
                }
                items.push(item);
                if self.current.id != "," {
                    break;
                }
                self.advance(Some(","), false)?;
            }
        }
        self.advance(Some("]"), true)?;
        Ok(RawNode::new(RawKind::Array(items), position))
    }

    /// Object constructor, or a group-by clause when `left` is given.
    fn object(&mut self, left: Option<RawNode>, position: usize) -> Result<RawNode> {
        let mut pairs = Vec::new();
        if self.current.id != "}" {
            loop {
                let key = self.expression(0)?;
                self.advance(Some(":"), false)?;
                let value = self.expression(0)?;
                pairs.push((key, value));
                if self.current.id != "," {
                    break;
                }
                self.advance(Some(","), false)?;
            }
        }
        self.advance(Some("}"), true)?;
        let kind = match left {
            Some(lhs) => RawKind::Group {
                lhs: Box::new(lhs),
                pairs,
            },
            None => RawKind::Object(pairs),
        };
        Ok(RawNode::new(kind, position))
    }

    /// `| pattern | update [, delete] |`
    fn transform(&mut self, position: usize) -> Result<RawNode> {
        let pattern = self.expression(0)?;
        self.advance(Some("|"), false)?;
        let update = self.expression(0)?;
        let delete = if self.current.id == "," {
            self.advance(Some(","), false)?;
            Some(Box::new(self.expression(0)?))
        } else {
            None
        };
        self.advance(Some("|"), false)?;
        Ok(RawNode::new(
            RawKind::Transform {
                pattern: Box::new(pattern),
                update: Box::new(update),
                delete,
            },
            position,
        ))
    }

    /// Predicate `lhs[expr]`, or `lhs[]` which only flags the root step.
    fn predicate(&mut self, left: RawNode, position: usize) -> Result<RawNode> {
        if self.current.id == "]" {
            let mut left = left;
            mark_keep_array(&mut left);
            self.advance(Some("]"), false)?;
            return Ok(left);
        }
        let rhs = self.expression(0)?;
        self.advance(Some("]"), true)?;
        Ok(RawNode::binary("[", left, rhs, position))
    }

    /// Order-by clause `lhs^(<a, >b)`.
    fn sort(&mut self, left: RawNode, position: usize) -> Result<RawNode> {
        self.advance(Some("("), false)?;
        let mut terms = Vec::new();
        loop {
            let mut descending = false;
            if self.current.id == "<" {
                self.advance(Some("<"), false)?;
            } else if self.current.id == ">" {
                descending = true;
                self.advance(Some(">"), false)?;
            }
            terms.push((self.expression(0)?, descending));
            if self.current.id != "," {
                break;
            }
            self.advance(Some(","), false)?;
        }
        self.advance(Some(")"), false)?;
        Ok(RawNode::new(
            RawKind::Sort {
                lhs: Box::new(left),
                terms,
            },
            position,
        ))
    }

    /// Function call, partial application or lambda definition.
    fn call(&mut self, procedure: RawNode, position: usize) -> Result<RawNode> {
        let mut args = Vec::new();
        let mut partial = false;
        if self.current.id != ")" {
            loop {
                if self.current.id == "?" {
                    partial = true;
                    args.push(RawNode::new(RawKind::Operator("?"), self.current.position));
                    self.advance(Some("?"), false)?;
                } else {
                    args.push(self.expression(0)?);
                }
                if self.current.id != "," {
                    break;
                }
                self.advance(Some(","), false)?;
            }
        }
        self.advance(Some(")"), true)?;

        let is_lambda = matches!(&procedure.kind, RawKind::Name(name) if name == "function" || name == "λ");
        if !is_lambda {
            return Ok(RawNode::new(
                RawKind::Call {
                    procedure: Box::new(procedure),
                    args,
                    partial,
                },
                position,
            ));
        }

        let mut params = Vec::with_capacity(args.len());
        for arg in &args {
            match &arg.kind {
                RawKind::Variable(name) => params.push(name.clone()),
                _ => {
                    let err = Error::at("S0208", arg.position).with_token(arg.describe());
                    return self.fail(err, arg.position);
                }
            }
        }

        let signature = if self.current.id == "<" {
            Some(self.signature()?)
        } else {
            None
        };

        self.advance(Some("{"), false)?;
        let body = self.expression(0)?;
        self.advance(Some("}"), false)?;
        Ok(RawNode::new(
            RawKind::Lambda {
                params,
                signature,
                body: Box::new(body),
            },
            position,
        ))
    }

    /// Collect the `<...>` tokens after a lambda parameter list.
    fn signature(&mut self) -> Result<Signature> {
        let mut depth = 1;
        let mut source = String::from("<");
        while depth > 0 && self.current.id != "{" && self.current.id != "(end)" {
            self.advance(None, false)?;
            match self.current.id {
                ">" => depth -= 1,
                "<" => depth += 1,
                _ => {}
            }
            source.push_str(&self.current.text());
        }
        self.advance(Some(">"), false)?;
        Signature::parse(&source, "lambda")
    }
}

/// `[]` applies to the innermost step of a chain of predicates.
fn mark_keep_array(node: &mut RawNode) {
    match &mut node.kind {
        RawKind::Binary { op: "[", lhs, .. } => mark_keep_array(lhs),
        _ => node.keep_array = true,
    }
}

fn run(source: &str, recover: bool) -> Result<(AstNode, Vec<Error>)> {
    let mut parser = Parser::new(source, recover);
    parser.advance(None, false)?;
    let raw = parser.expression(0)?;
    if parser.current.id != "(end)" {
        let err = Error::at("S0201", parser.current.position).with_token(parser.current.text());
        parser.recoverable(err)?;
    }
    let mut errors = parser.errors;
    let ast = Normalizer::new(recover, &mut errors).normalize(raw)?;
    trace!(source, node = ast.type_name(), errors = errors.len(), "parsed expression");
    Ok((ast, errors))
}

/// Parse a JSONata expression string into a normalized AST.
///
/// This is the main entry point for parsing.
pub fn parse(source: &str) -> Result<AstNode> {
    run(source, false).map(|(ast, _)| ast)
}

/// Parse in recover mode. Syntax errors are collected and the failed
/// constructs replaced with error nodes so tooling can inspect a partial
/// tree. Lexical errors still abort.
pub fn parse_recovering(source: &str) -> Result<(AstNode, Vec<Error>)> {
    run(source, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::{AncestorSlot, BinaryOp, NodeKind, Stage};

    fn names(node: &AstNode) -> Vec<String> {
        node.steps()
            .iter()
            .map(|s| match &s.kind {
                NodeKind::Name(n) => n.clone(),
                other => format!("{:?}", other),
            })
            .collect()
    }

    fn code(source: &str) -> &'static str {
        parse(source).unwrap_err().code
    }

    #[test]
    fn test_parse_path() {
        let ast = parse("Account.Order.Product").unwrap();
        assert!(ast.is_path());
        assert_eq!(names(&ast), vec!["Account", "Order", "Product"]);
    }

    #[test]
    fn test_string_steps_become_names() {
        let ast = parse("a.\"b c\"").unwrap();
        assert_eq!(names(&ast), vec!["a", "b c"]);
    }

    #[test]
    fn test_parse_precedence() {
        let ast = parse("1 + 2 * 3").unwrap();
        match ast.kind {
            NodeKind::Binary { op: BinaryOp::Add, rhs, .. } => {
                assert!(matches!(rhs.kind, NodeKind::Binary { op: BinaryOp::Multiply, .. }));
            }
            other => panic!("Expected addition, got {:?}", other),
        }
    }

    #[test]
    fn test_negative_literal_is_folded() {
        let ast = parse("-5").unwrap();
        assert_eq!(ast.kind, NodeKind::Number(-5.0));
        let ast = parse("-$x").unwrap();
        assert!(matches!(ast.kind, NodeKind::Negate(_)));
    }

    #[test]
    fn test_keywords_as_names() {
        let ast = parse("and.or").unwrap();
        assert_eq!(names(&ast), vec!["and", "or"]);
    }

    #[test]
    fn test_predicate_attaches_to_last_step() {
        let ast = parse("a.b[0]").unwrap();
        let steps = ast.steps();
        assert_eq!(steps.len(), 2);
        assert_eq!(steps[1].stages.len(), 1);
        assert!(steps[1].predicate.is_empty());

        let ast = parse("$x[0]").unwrap();
        assert_eq!(ast.predicate.len(), 1);
    }

    #[test]
    fn test_keep_array_flags() {
        let ast = parse("a.b[]").unwrap();
        assert!(ast.keep_singleton_array);
        assert!(ast.steps()[1].keep_array);
    }

    #[test]
    fn test_group_and_sort() {
        let ast = parse("a{b: c}").unwrap();
        assert_eq!(ast.group.as_ref().map(|g| g.pairs.len()), Some(1));

        let ast = parse("a^(>b, c)").unwrap();
        let steps = ast.steps();
        assert_eq!(steps.len(), 2);
        match &steps[1].kind {
            NodeKind::Sort { terms } => {
                assert!(terms[0].descending);
                assert!(!terms[1].descending);
            }
            other => panic!("Expected sort step, got {:?}", other),
        }
    }

    #[test]
    fn test_focus_and_index_bindings() {
        let ast = parse("a@$x.b#$i").unwrap();
        let steps = ast.steps();
        assert_eq!(steps[0].focus.as_deref(), Some("x"));
        assert!(steps[0].tuple);
        assert_eq!(steps[1].index.as_deref(), Some("i"));

        let ast = parse("a[0]#$i").unwrap();
        let step = &ast.steps()[0];
        assert!(step.index.is_none());
        assert!(matches!(step.stages.last(), Some(Stage::Index { name }) if name == "i"));
    }

    #[test]
    fn test_lambda_with_signature() {
        let ast = parse("function($x, $y)<nn:n>{$x + $y}").unwrap();
        match ast.kind {
            NodeKind::Lambda { params, signature, thunk, .. } => {
                assert_eq!(params, vec!["x", "y"]);
                assert_eq!(signature.map(|s| s.source().to_string()).as_deref(), Some("<nn:n>"));
                assert!(!thunk);
            }
            other => panic!("Expected lambda, got {:?}", other),
        }
    }

    #[test]
    fn test_tail_calls_are_wrapped() {
        let ast = parse("function($n){ $n > 0 ? $f($n - 1) : 0 }").unwrap();
        let NodeKind::Lambda { body, .. } = ast.kind else {
            panic!("Expected lambda");
        };
        let NodeKind::Condition { then, otherwise, .. } = &body.kind else {
            panic!("Expected condition body");
        };
        assert!(matches!(then.kind, NodeKind::Lambda { thunk: true, .. }));
        assert!(matches!(otherwise.as_deref().map(|o| &o.kind), Some(NodeKind::Number(_))));
    }

    #[test]
    fn test_partial_application() {
        let ast = parse("$substring(?, 0, 2)").unwrap();
        match ast.kind {
            NodeKind::Partial { args, .. } => assert_eq!(args[0].kind, NodeKind::Placeholder),
            other => panic!("Expected partial, got {:?}", other),
        }
    }

    #[test]
    fn test_parent_resolves_to_step() {
        let ast = parse("a.b.%.c").unwrap();
        let steps = ast.steps();
        let slot = AncestorSlot {
            label: "!0".to_string(),
            index: 0,
        };
        assert_eq!(steps[1].ancestor.as_ref(), Some(&slot));
        assert!(steps[1].tuple);
        assert_eq!(steps[2].kind, NodeKind::Parent(slot));
    }

    #[test]
    fn test_parent_in_predicate() {
        let ast = parse("Account.Order[%.x = 1]").unwrap();
        let order = &ast.steps()[1];
        assert!(order.ancestor.is_some());
    }

    #[test]
    fn test_syntax_errors() {
        assert_eq!(code("1 +"), "S0207");
        assert_eq!(code("(1"), "S0203");
        assert_eq!(code("foo(1]"), "S0202");
        assert_eq!(code("!a"), "S0204");
        assert_eq!(code(")"), "S0211");
        assert_eq!(code("1 2"), "S0201");
        assert_eq!(code("function(a){1}"), "S0208");
        assert_eq!(code("1 := 2"), "S0212");
        assert_eq!(code("a@b"), "S0214");
        assert_eq!(code("a.1"), "S0213");
        assert_eq!(code("$a{\"x\": 1}[0]"), "S0209");
        assert_eq!(code("a{\"x\": 1}{\"y\": 2}"), "S0210");
        assert_eq!(code("a[0]@$x"), "S0215");
        assert_eq!(code("a^(b)@$x"), "S0216");
        assert_eq!(code("%"), "S0217");
        assert_eq!(code("%.a"), "S0217");
    }

    #[test]
    fn test_error_details() {
        let err = parse("foo(1]").unwrap_err();
        assert_eq!(err.message(), "Expected ), got ]");
        assert_eq!(err.position, Some(6));

        let err = parse("(1").unwrap_err();
        assert_eq!(err.position, Some(2));
    }

    #[test]
    fn test_recover_collects_errors() {
        let (ast, errors) = parse_recovering("[1, 2").unwrap();
        assert!(matches!(ast.kind, NodeKind::Array(_)));
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].code, "S0203");

        let (_, errors) = parse_recovering("a + ").unwrap();
        assert_eq!(errors[0].code, "S0207");
    }

    #[test]
    fn test_lexical_errors_abort_recovery() {
        assert_eq!(parse_recovering("\"open").unwrap_err().code, "S0101");
    }
}
