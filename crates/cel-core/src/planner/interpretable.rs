//! Plan nodes.
//!
//! The planner translates each expression node into exactly one plan node,
//! carrying the originating expression id for error localization. The tree
//! is immutable after planning and freely shareable; per-evaluation state
//! lives in the execution frame.

use crate::{
    ast::ExprId,
    env::{FunctionImpl, OverloadDecl},
    planner::attributes::Attribute,
    value::Value,
};

#[derive(Clone)]
pub(crate) enum Interpretable {
    /// A literal or plan-time-folded constant.
    Const { id: ExprId, value: Value },
    /// Variable or qualified-name access.
    Attr { id: ExprId, attr: Attribute },
    /// Presence test: the attribute's last qualifier is a
    /// [`Qualifier::PresenceTest`](crate::planner::attributes::Qualifier).
    TestOnly { id: ExprId, attr: Attribute },
    Call(Box<CallPlan>),
    LateBound(Box<LateBoundPlan>),
    And {
        id: ExprId,
        lhs: Box<Interpretable>,
        rhs: Box<Interpretable>,
    },
    Or {
        id: ExprId,
        lhs: Box<Interpretable>,
        rhs: Box<Interpretable>,
    },
    Conditional {
        id: ExprId,
        cond: Box<Interpretable>,
        then: Box<Interpretable>,
        otherwise: Box<Interpretable>,
    },
    CreateList {
        id: ExprId,
        elements: Vec<Interpretable>,
        optional_indices: Vec<u32>,
    },
    CreateMap {
        id: ExprId,
        keys: Vec<Interpretable>,
        values: Vec<Interpretable>,
        /// entry positions whose value carries the optional marker
        optional_indices: Vec<u32>,
    },
    CreateStruct {
        id: ExprId,
        type_name: String,
        fields: Vec<String>,
        values: Vec<Interpretable>,
        optional_indices: Vec<u32>,
    },
    Fold(Box<FoldPlan>),
    /// The lazily-memoized slot list emitted by common-subexpression
    /// elimination (`cel.@block`).
    Block(Box<BlockPlan>),
}

impl Interpretable {
    pub fn id(&self) -> ExprId {
        match self {
            Self::Const { id, .. }
            | Self::Attr { id, .. }
            | Self::TestOnly { id, .. }
            | Self::And { id, .. }
            | Self::Or { id, .. }
            | Self::Conditional { id, .. }
            | Self::CreateList { id, .. }
            | Self::CreateMap { id, .. }
            | Self::CreateStruct { id, .. } => *id,
            Self::Call(call) => call.id,
            Self::LateBound(call) => call.id,
            Self::Fold(fold) => fold.id,
            Self::Block(block) => block.id,
        }
    }
}

/// A call dispatched to overloads resolved at plan time.
#[derive(Clone)]
pub(crate) struct CallPlan {
    pub id: ExprId,
    pub function: String,
    pub args: Vec<Interpretable>,
    pub target: DispatchTarget,
    /// Non-strict calls receive error/unknown arguments unfiltered.
    pub non_strict: bool,
}

#[derive(Clone)]
pub(crate) enum DispatchTarget {
    /// Exactly one overload matched at plan time.
    Single(FunctionImpl),
    /// Several candidates remain; the runtime picks by argument kind.
    Candidates(Vec<CandidateBinding>),
}

#[derive(Clone)]
pub(crate) struct CandidateBinding {
    pub decl: OverloadDecl,
    pub binding: FunctionImpl,
}

/// A call dispatched at evaluation time against the frame's function
/// resolver.
#[derive(Clone)]
pub(crate) struct LateBoundPlan {
    pub id: ExprId,
    pub function: String,
    pub overload_ids: Vec<String>,
    pub args: Vec<Interpretable>,
}

#[derive(Clone)]
pub(crate) struct FoldPlan {
    pub id: ExprId,
    pub iter_var: String,
    pub iter_var2: Option<String>,
    pub iter_range: Interpretable,
    pub accu_var: String,
    pub accu_init: Interpretable,
    pub loop_condition: Interpretable,
    pub loop_step: Interpretable,
    pub result: Interpretable,
}

#[derive(Clone)]
pub(crate) struct BlockPlan {
    pub id: ExprId,
    /// slot names `@index0`, `@index1`, … precomputed at plan time
    pub slot_names: Vec<String>,
    pub slots: Vec<Interpretable>,
    pub body: Interpretable,
}
