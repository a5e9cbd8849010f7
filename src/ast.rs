// Normalized abstract syntax tree
// Produced by the normalizer from the raw Pratt parse tree. Dotted, indexed,
// grouped and sorted chains are already resolved into `Path` nodes here.

use std::sync::Arc;

use crate::errors::Error;
use crate::signature::Signature;
use crate::value::RegexLiteral;

/// A node of the normalized tree.
///
/// `kind` carries the node-specific payload. The remaining fields are the
/// path metadata any node may carry once it appears as a step or has
/// predicates / grouping attached to it.
#[derive(Debug, Clone, PartialEq)]
pub struct AstNode {
    pub kind: NodeKind,
    /// Source offset just after the token that produced this node.
    pub position: usize,
    /// `[]` suffix seen on this step.
    pub keep_array: bool,
    /// Array constructor appearing as the first or last step of a path.
    pub cons_array: bool,
    /// Path-level: some step carried `[]`, so singleton results stay arrays.
    pub keep_singleton_array: bool,
    /// Filters applied to the node's whole result.
    pub predicate: Vec<Stage>,
    /// Filters and index bindings applied per step while inside a path.
    pub stages: Vec<Stage>,
    /// Group-by clause (`{...}` in infix position).
    pub group: Option<GroupBy>,
    /// Variable bound by `@$name` on this step.
    pub focus: Option<String>,
    /// Variable bound by `#$name` on this step.
    pub index: Option<String>,
    /// This step (or path) runs in tuple-stream mode.
    pub tuple: bool,
    /// Label under which this step records its input for `%` references.
    pub ancestor: Option<AncestorSlot>,
    /// Unresolved `%` slots bubbling up during normalization.
    pub(crate) seeking_parent: Vec<usize>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
    /// Sequence of steps evaluated left to right
    Path { steps: Vec<AstNode> },

    Binary {
        op: BinaryOp,
        lhs: Box<AstNode>,
        rhs: Box<AstNode>,
    },

    /// Unary minus on a non-literal operand
    Negate(Box<AstNode>),

    /// Array constructor `[a, b, ...]`
    Array(Vec<AstNode>),

    /// Object constructor `{k: v, ...}` in prefix position
    Object(Vec<(AstNode, AstNode)>),

    /// Field name
    Name(String),

    /// `$name` reference; the empty name is the context value
    Variable(String),

    String(String),
    Number(f64),
    Bool(bool),
    Null,
    Regex(Arc<RegexLiteral>),

    /// `*`
    Wildcard,

    /// `**`
    Descendant,

    /// `%`
    Parent(AncestorSlot),

    Condition {
        condition: Box<AstNode>,
        then: Box<AstNode>,
        otherwise: Option<Box<AstNode>>,
    },

    /// `( expr; expr; ... )`
    Block(Vec<AstNode>),

    /// `$name := value`
    Bind { name: String, value: Box<AstNode> },

    Function {
        procedure: Box<AstNode>,
        args: Vec<AstNode>,
    },

    /// Function call with at least one `?` argument
    Partial {
        procedure: Box<AstNode>,
        args: Vec<AstNode>,
    },

    /// `?` inside a partial application
    Placeholder,

    /// `lhs ~> rhs`
    Apply { lhs: Box<AstNode>, rhs: Box<AstNode> },

    Lambda {
        params: Vec<String>,
        body: Arc<AstNode>,
        signature: Option<Arc<Signature>>,
        /// Deferred tail call produced by tail-call marking
        thunk: bool,
    },

    /// Order-by pseudo-step
    Sort { terms: Vec<SortTerm> },

    /// `| pattern | update, delete |`
    Transform {
        pattern: Box<AstNode>,
        update: Box<AstNode>,
        delete: Option<Box<AstNode>>,
    },

    /// Placeholder for a construct that failed to parse in recover mode
    Error(Error),
}

/// Per-step annotation collected when a predicate or `#` follows a step.
#[derive(Debug, Clone, PartialEq)]
pub enum Stage {
    /// Filter/predicate stage [expr]
    Filter { expr: Box<AstNode>, position: usize },
    /// Position binding `#$name`
    Index { name: String },
}

/// Group-by clause: key/value expression pairs.
#[derive(Debug, Clone, PartialEq)]
pub struct GroupBy {
    pub pairs: Vec<(AstNode, AstNode)>,
    pub position: usize,
}

/// One `<expr` / `>expr` term of an order-by clause.
#[derive(Debug, Clone, PartialEq)]
pub struct SortTerm {
    pub expression: AstNode,
    pub descending: bool,
}

/// Binding used to thread `%` through enclosing steps. `index` identifies
/// the slot; `label` is the tuple key the ancestor value is stored under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AncestorSlot {
    pub label: String,
    pub index: usize,
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,
    Modulo,

    // Comparison
    Equal,
    NotEqual,
    LessThan,
    LessThanOrEqual,
    GreaterThan,
    GreaterThanOrEqual,

    // Logical
    And,
    Or,

    // String
    Concatenate,

    Range,
    In,
}

impl BinaryOp {
    pub fn from_symbol(symbol: &str) -> Option<BinaryOp> {
        let op = match symbol {
            "+" => BinaryOp::Add,
            "-" => BinaryOp::Subtract,
            "*" => BinaryOp::Multiply,
            "/" => BinaryOp::Divide,
            "%" => BinaryOp::Modulo,
            "=" => BinaryOp::Equal,
            "!=" => BinaryOp::NotEqual,
            "<" => BinaryOp::LessThan,
            "<=" => BinaryOp::LessThanOrEqual,
            ">" => BinaryOp::GreaterThan,
            ">=" => BinaryOp::GreaterThanOrEqual,
            "and" => BinaryOp::And,
            "or" => BinaryOp::Or,
            "&" => BinaryOp::Concatenate,
            ".." => BinaryOp::Range,
            "in" => BinaryOp::In,
            _ => return None,
        };
        Some(op)
    }

    /// Source symbol, used as the token of operator errors.
    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Subtract => "-",
            BinaryOp::Multiply => "*",
            BinaryOp::Divide => "/",
            BinaryOp::Modulo => "%",
            BinaryOp::Equal => "=",
            BinaryOp::NotEqual => "!=",
            BinaryOp::LessThan => "<",
            BinaryOp::LessThanOrEqual => "<=",
            BinaryOp::GreaterThan => ">",
            BinaryOp::GreaterThanOrEqual => ">=",
            BinaryOp::And => "and",
            BinaryOp::Or => "or",
            BinaryOp::Concatenate => "&",
            BinaryOp::Range => "..",
            BinaryOp::In => "in",
        }
    }
}

impl AstNode {
    pub fn new(kind: NodeKind, position: usize) -> Self {
        AstNode {
            kind,
            position,
            keep_array: false,
            cons_array: false,
            keep_singleton_array: false,
            predicate: Vec::new(),
            stages: Vec::new(),
            group: None,
            focus: None,
            index: None,
            tuple: false,
            ancestor: None,
            seeking_parent: Vec::new(),
        }
    }

    /// Short name of the node type, used in error messages and tracing.
    pub fn type_name(&self) -> &'static str {
        match &self.kind {
            NodeKind::Path { .. } => "path",
            NodeKind::Binary { .. } => "binary",
            NodeKind::Negate(_) | NodeKind::Array(_) | NodeKind::Object(_) => "unary",
            NodeKind::Name(_) => "name",
            NodeKind::Variable(_) => "variable",
            NodeKind::String(_) => "string",
            NodeKind::Number(_) => "number",
            NodeKind::Bool(_) | NodeKind::Null => "value",
            NodeKind::Regex(_) => "regex",
            NodeKind::Wildcard => "wildcard",
            NodeKind::Descendant => "descendant",
            NodeKind::Parent(_) => "parent",
            NodeKind::Condition { .. } => "condition",
            NodeKind::Block(_) => "block",
            NodeKind::Bind { .. } => "bind",
            NodeKind::Function { .. } => "function",
            NodeKind::Partial { .. } => "partial",
            NodeKind::Placeholder => "operator",
            NodeKind::Apply { .. } => "apply",
            NodeKind::Lambda { .. } => "lambda",
            NodeKind::Sort { .. } => "sort",
            NodeKind::Transform { .. } => "transform",
            NodeKind::Error(_) => "error",
        }
    }

    #[inline]
    pub fn is_path(&self) -> bool {
        matches!(self.kind, NodeKind::Path { .. })
    }

    /// Steps of a path node; empty for anything else.
    pub fn steps(&self) -> &[AstNode] {
        match &self.kind {
            NodeKind::Path { steps } => steps,
            _ => &[],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ast_node_creation() {
        let node = AstNode::new(NodeKind::Number(42.0), 2);
        assert_eq!(node.type_name(), "number");
        assert_eq!(node.position, 2);
        assert!(node.predicate.is_empty());
        assert!(node.steps().is_empty());
    }

    #[test]
    fn test_binary_op_symbols() {
        for symbol in ["+", "-", "*", "/", "%", "=", "!=", "<", "<=", ">", ">=", "and", "or", "&", "..", "in"] {
            let op = BinaryOp::from_symbol(symbol).unwrap();
            assert_eq!(op.symbol(), symbol);
        }
        assert!(BinaryOp::from_symbol(":=").is_none());
    }
}
