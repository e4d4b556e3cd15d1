pub mod arena;
pub mod builtins;
pub mod check;
pub mod config;
pub mod directive;
pub mod engine;
pub mod error;
pub mod expr;
pub mod infer;
pub mod kernel;
pub mod psp;
pub mod scaffold;
pub mod scope;
pub mod trace;
pub mod value;

pub use arena::NodeId;
pub use error::{Result, TraceError};
pub use expr::Expr;
pub use trace::{DirectiveId, Trace};
pub use value::Value;
