//! AST optimizers.
//!
//! Language-neutral rewrites over `cel-core` trees: constant folding,
//! common-subexpression elimination (nested `cel.bind` macros or a flat
//! `cel.@block`), and identifier inlining with presence-test rewriting. All
//! mutation goes through the core mutator, every optimizer returns a fresh
//! AST with stabilized ids, and rewrite work is bounded by a shared
//! iteration cap.

mod constant_folding;
mod cse;
mod inlining;
mod support;

pub use constant_folding::ConstantFoldingOptimizer;
pub use cse::{CseStyle, SubexpressionOptimizer};
pub use inlining::{InlineVariable, InliningOptimizer};

use std::fmt;

use cel_core::{ast::Ast, Env};

/// Shared optimizer knobs.
#[derive(Debug, Clone, Copy)]
pub struct OptimizerConfig {
    /// Upper bound on rewrite rounds within one `optimize` call.
    pub max_iterations: usize,
    /// When non-zero, block emission keeps extracting subexpressions until
    /// no emitted element nests deeper than this many levels.
    pub subexpression_max_recursion_depth: usize,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            subexpression_max_recursion_depth: 0,
        }
    }
}

/// An AST-to-AST rewrite. The input is never modified; the result has
/// dense, stabilized ids.
pub trait Optimizer {
    fn optimize(&self, env: &Env, ast: &Ast) -> Result<Ast, OptimizeError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OptimizeError {
    /// The rewrite did not converge within the iteration cap.
    MaxIterationCountReached,
    /// A `cel.@block` element references a slot at or after itself.
    IllegalBlockIndex { reference: usize, limit: usize },
    /// An `@`-prefixed name is internal and cannot be inlined.
    InternalName(String),
    /// The post-rewrite verifier found a structural violation.
    Verify(String),
}

impl fmt::Display for OptimizeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MaxIterationCountReached => write!(f, "optimization iteration cap reached"),
            Self::IllegalBlockIndex { reference, limit } => {
                write!(f, "illegal block index @index{reference}; must be below {limit}")
            }
            Self::InternalName(name) => write!(f, "'{name}' is internal and cannot be inlined"),
            Self::Verify(message) => write!(f, "optimizer verification failed: {message}"),
        }
    }
}

impl std::error::Error for OptimizeError {}
