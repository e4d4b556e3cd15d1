//! Values stored in trace nodes.

use crate::arena::NodeId;
use crate::psp::{Request, Sp};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Clone, Debug)]
pub enum Value {
    Nil,
    Bool(bool),
    Number(f64),
    Atom(u32),
    Symbol(Arc<str>),
    Array(Arc<[Value]>),
    /// Reference to the procedure recorded at a maker node.
    Procedure(NodeId),
    /// A freshly simulated procedure, not yet recorded at its maker node.
    Sp(Arc<Sp>),
    /// External stochastic requests issued by a request node.
    Request(Arc<Request>),
}

impl Value {
    pub fn symbol(s: &str) -> Self {
        Value::Symbol(Arc::from(s))
    }

    pub fn array(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Array(items.into_iter().collect())
    }

    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(x) => Some(*x),
            Value::Atom(a) => Some(*a as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_procedure(&self) -> Option<NodeId> {
        match self {
            Value::Procedure(maker) => Some(*maker),
            _ => None,
        }
    }

    pub fn as_request(&self) -> Option<&Arc<Request>> {
        match self {
            Value::Request(r) => Some(r),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Value::Nil => 0,
            Value::Bool(_) => 1,
            Value::Number(_) => 2,
            Value::Atom(_) => 3,
            Value::Symbol(_) => 4,
            Value::Array(_) => 5,
            Value::Procedure(_) => 6,
            Value::Sp(_) => 7,
            Value::Request(_) => 8,
        }
    }
}

// Manual Hash/Eq for Float handling
impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Nil, Value::Nil) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a.to_bits() == b.to_bits(),
            (Value::Atom(a), Value::Atom(b)) => a == b,
            (Value::Symbol(a), Value::Symbol(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Procedure(a), Value::Procedure(b)) => a == b,
            (Value::Sp(a), Value::Sp(b)) => Arc::ptr_eq(a, b),
            (Value::Request(a), Value::Request(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Value {}

impl Hash for Value {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.rank().hash(state);
        match self {
            Value::Nil => {}
            Value::Bool(b) => b.hash(state),
            Value::Number(x) => x.to_bits().hash(state),
            Value::Atom(a) => a.hash(state),
            Value::Symbol(s) => s.hash(state),
            Value::Array(items) => items.hash(state),
            Value::Procedure(n) => n.hash(state),
            Value::Sp(sp) => (Arc::as_ptr(sp) as *const u8 as usize).hash(state),
            Value::Request(r) => {
                for esr in &r.esrs {
                    esr.id.hash(state);
                }
            }
        }
    }
}

/// Values of the same scalar kind compare naturally; procedures and requests
/// have no order.
impl PartialOrd for Value {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        match (self, other) {
            (Value::Nil, Value::Nil) => Some(Ordering::Equal),
            (Value::Bool(a), Value::Bool(b)) => a.partial_cmp(b),
            (Value::Number(a), Value::Number(b)) => Some(a.total_cmp(b)),
            (Value::Atom(a), Value::Atom(b)) => a.partial_cmp(b),
            (Value::Symbol(a), Value::Symbol(b)) => a.partial_cmp(b),
            (Value::Array(a), Value::Array(b)) => {
                for (x, y) in a.iter().zip(b.iter()) {
                    match x.partial_cmp(y)? {
                        Ordering::Equal => continue,
                        ord => return Some(ord),
                    }
                }
                a.len().partial_cmp(&b.len())
            }
            (Value::Procedure(a), Value::Procedure(b)) => a.partial_cmp(b),
            (Value::Sp(_), Value::Sp(_)) | (Value::Request(_), Value::Request(_)) if self == other => {
                Some(Ordering::Equal)
            }
            (Value::Sp(_), _) | (_, Value::Sp(_)) => None,
            (Value::Request(_), _) | (_, Value::Request(_)) => None,
            _ => self.rank().partial_cmp(&other.rank()),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Nil => write!(f, "nil"),
            Value::Bool(b) => write!(f, "{b}"),
            Value::Number(x) => write!(f, "{x}"),
            Value::Atom(a) => write!(f, "atom<{a}>"),
            Value::Symbol(s) => write!(f, "{s}"),
            Value::Array(items) => {
                write!(f, "[")?;
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        write!(f, " ")?;
                    }
                    write!(f, "{item}")?;
                }
                write!(f, "]")
            }
            Value::Procedure(n) => write!(f, "<procedure@{}>", n.0),
            Value::Sp(_) => write!(f, "<sp>"),
            Value::Request(r) => write!(f, "<request {} esrs>", r.esrs.len()),
        }
    }
}

impl From<f64> for Value {
    fn from(x: f64) -> Self {
        Value::Number(x)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::symbol(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_number_equality_is_bitwise() {
        assert_eq!(Value::Number(1.5), Value::Number(1.5));
        assert_ne!(Value::Number(0.0), Value::Number(-0.0));
        let nan = Value::Number(f64::NAN);
        assert_eq!(nan, nan.clone());
    }

    #[test]
    fn test_values_as_map_keys() {
        let mut set = FxHashSet::default();
        set.insert(Value::array([Value::Number(1.0), Value::symbol("a")]));
        assert!(set.contains(&Value::array([Value::Number(1.0), Value::symbol("a")])));
        assert!(!set.contains(&Value::array([Value::Number(2.0)])));
    }

    #[test]
    fn test_partial_order() {
        assert!(Value::Number(1.0) < Value::Number(2.0));
        assert!(Value::Bool(true) < Value::Number(0.0));
        assert!(Value::array([Value::Atom(1)]) < Value::array([Value::Atom(1), Value::Atom(0)]));
    }
}
