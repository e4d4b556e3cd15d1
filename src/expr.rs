//! Expressions evaluated into families of trace nodes.
//!
//! This is the smallest surface a host evaluator needs to drive the trace:
//! literals, references to nodes that already exist, and applications.

use crate::arena::NodeId;
use crate::value::Value;

#[derive(Clone, Debug, PartialEq)]
pub enum Expr {
    /// Becomes a constant node.
    Constant(Value),
    /// Becomes a lookup node aliasing an existing node.
    Lookup(NodeId),
    /// Becomes a request/output pair over the evaluated operator and operands.
    Apply(Box<Expr>, Vec<Expr>),
}

impl Expr {
    pub fn constant(v: impl Into<Value>) -> Self {
        Expr::Constant(v.into())
    }

    pub fn apply(operator: Expr, operands: impl IntoIterator<Item = Expr>) -> Self {
        Expr::Apply(Box::new(operator), operands.into_iter().collect())
    }
}

impl From<Value> for Expr {
    fn from(v: Value) -> Self {
        Expr::Constant(v)
    }
}
