//! The expression tree shared by every phase.
//!
//! An [`Ast`] is immutable once constructed: the checker annotates it through
//! a side overlay ([`CheckedAst`]), the optimizers build fresh trees through
//! the mutator, and plans reference node ids rather than nodes. Every node
//! carries a non-zero 64-bit id unique within its owning tree; id `0` is
//! reserved for "no node".

pub mod factory;
pub mod mutator;
pub mod navigation;

use std::{
    fmt,
    hash::{Hash, Hasher},
};

use ahash::AHashMap;
use serde::{Deserialize, Serialize};

use crate::types::CelType;

/// Name of the comprehension accumulator variable macros desugar to.
pub const ACCUMULATOR_VAR: &str = "__result__";

/// The flat common-subexpression block form. Only the CSE optimizer emits
/// calls to this name; the checker and planner accept it nowhere else.
pub const BLOCK_FUNCTION: &str = "cel.@block";

/// Prefix of identifiers introduced by block emission (`@index0`, `@index1`, …).
pub const BLOCK_INDEX_PREFIX: &str = "@index";

/// A stable identifier for one expression node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ExprId(u64);

impl ExprId {
    /// The reserved "no node" id carried by [`ExprKind::NotSet`] placeholders.
    pub const NONE: ExprId = ExprId(0);

    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ExprId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A literal constant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Constant {
    Null,
    Bool(bool),
    Int(i64),
    Uint(u64),
    Double(f64),
    String(String),
    Bytes(Vec<u8>),
}

/// One expression node: a stable id plus its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Expr {
    pub id: ExprId,
    pub kind: ExprKind,
}

/// The closed sum of expression forms.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ExprKind {
    /// Placeholder inside macro-call snapshots for slots whose content was
    /// replaced or never captured.
    NotSet,
    Const(Constant),
    /// A simple (possibly dotted-absolute) identifier; meaning is resolved
    /// by the checker or, for parse-only plans, at evaluation time.
    Ident(String),
    Select(Box<SelectExpr>),
    Call(Box<CallExpr>),
    List(ListExpr),
    Map(MapExpr),
    Struct(StructExpr),
    Comprehension(Box<ComprehensionExpr>),
}

/// Field or map-key access: `operand.field`, or `has(operand.field)` when
/// `test_only` is set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SelectExpr {
    pub operand: Expr,
    pub field: String,
    pub test_only: bool,
}

/// A function invocation. A missing `target` means a global call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallExpr {
    pub target: Option<Expr>,
    pub function: String,
    pub args: Vec<Expr>,
}

/// A list literal. `optional_indices` are the strictly increasing element
/// positions carrying the `?` optional marker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ListExpr {
    pub elements: Vec<Expr>,
    pub optional_indices: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapExpr {
    pub entries: Vec<MapEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    pub key: Expr,
    pub value: Expr,
    pub optional: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructExpr {
    pub message_name: String,
    pub entries: Vec<StructField>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StructField {
    pub field: String,
    pub value: Expr,
    pub optional: bool,
}

/// The single low-level iteration primitive all macros desugar to.
///
/// The two-variable form binds `(index, value)` for lists and `(key, value)`
/// for maps; the one-variable form binds the element (list) or key (map).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComprehensionExpr {
    pub iter_var: String,
    pub iter_var2: Option<String>,
    pub iter_range: Expr,
    pub accu_var: String,
    pub accu_init: Expr,
    pub loop_condition: Expr,
    pub loop_step: Expr,
    pub result: Expr,
}

impl Expr {
    pub fn new(id: ExprId, kind: ExprKind) -> Self {
        Self { id, kind }
    }

    pub fn not_set() -> Self {
        Self {
            id: ExprId::NONE,
            kind: ExprKind::NotSet,
        }
    }

    /// Children in canonical order: select operand; call target then args;
    /// list elements; map keys and values interleaved; struct values;
    /// comprehension range, init, condition, step, result.
    pub fn children(&self) -> Vec<&Expr> {
        match &self.kind {
            ExprKind::NotSet | ExprKind::Const(_) | ExprKind::Ident(_) => vec![],
            ExprKind::Select(sel) => vec![&sel.operand],
            ExprKind::Call(call) => {
                let mut out = Vec::with_capacity(call.args.len() + 1);
                if let Some(target) = &call.target {
                    out.push(target);
                }
                out.extend(call.args.iter());
                out
            }
            ExprKind::List(list) => list.elements.iter().collect(),
            ExprKind::Map(map) => map
                .entries
                .iter()
                .flat_map(|e| [&e.key, &e.value])
                .collect(),
            ExprKind::Struct(st) => st.entries.iter().map(|e| &e.value).collect(),
            ExprKind::Comprehension(comp) => vec![
                &comp.iter_range,
                &comp.accu_init,
                &comp.loop_condition,
                &comp.loop_step,
                &comp.result,
            ],
        }
    }

    /// Pre-order traversal over this subtree.
    pub fn visit(&self, f: &mut impl FnMut(&Expr)) {
        f(self);
        for child in self.children() {
            child.visit(f);
        }
    }

    /// Whether any node in this subtree has the given id.
    pub fn contains_id(&self, id: ExprId) -> bool {
        let mut found = false;
        self.visit(&mut |e| found |= e.id == id);
        found
    }

    /// The largest id in this subtree.
    pub fn max_id(&self) -> u64 {
        let mut max = 0;
        self.visit(&mut |e| max = max.max(e.id.get()));
        max
    }

    /// Structural equality modulo node ids: the equivalence relation used to
    /// group candidate subexpressions during elimination.
    pub fn same_shape(&self, other: &Expr) -> bool {
        match (&self.kind, &other.kind) {
            (ExprKind::NotSet, ExprKind::NotSet) => true,
            (ExprKind::Const(a), ExprKind::Const(b)) => a == b,
            (ExprKind::Ident(a), ExprKind::Ident(b)) => a == b,
            (ExprKind::Select(a), ExprKind::Select(b)) => {
                a.field == b.field && a.test_only == b.test_only && a.operand.same_shape(&b.operand)
            }
            (ExprKind::Call(a), ExprKind::Call(b)) => {
                a.function == b.function
                    && a.args.len() == b.args.len()
                    && match (&a.target, &b.target) {
                        (None, None) => true,
                        (Some(x), Some(y)) => x.same_shape(y),
                        _ => false,
                    }
                    && a.args.iter().zip(&b.args).all(|(x, y)| x.same_shape(y))
            }
            (ExprKind::List(a), ExprKind::List(b)) => {
                a.optional_indices == b.optional_indices
                    && a.elements.len() == b.elements.len()
                    && a.elements.iter().zip(&b.elements).all(|(x, y)| x.same_shape(y))
            }
            (ExprKind::Map(a), ExprKind::Map(b)) => {
                a.entries.len() == b.entries.len()
                    && a.entries.iter().zip(&b.entries).all(|(x, y)| {
                        x.optional == y.optional
                            && x.key.same_shape(&y.key)
                            && x.value.same_shape(&y.value)
                    })
            }
            (ExprKind::Struct(a), ExprKind::Struct(b)) => {
                a.message_name == b.message_name
                    && a.entries.len() == b.entries.len()
                    && a.entries.iter().zip(&b.entries).all(|(x, y)| {
                        x.field == y.field && x.optional == y.optional && x.value.same_shape(&y.value)
                    })
            }
            (ExprKind::Comprehension(a), ExprKind::Comprehension(b)) => {
                a.iter_var == b.iter_var
                    && a.iter_var2 == b.iter_var2
                    && a.accu_var == b.accu_var
                    && a.iter_range.same_shape(&b.iter_range)
                    && a.accu_init.same_shape(&b.accu_init)
                    && a.loop_condition.same_shape(&b.loop_condition)
                    && a.loop_step.same_shape(&b.loop_step)
                    && a.result.same_shape(&b.result)
            }
            _ => false,
        }
    }

    /// A hash of the id-free structure, consistent with [`Expr::same_shape`].
    pub fn shape_hash(&self) -> u64 {
        let mut hasher = ahash::AHasher::default();
        self.shape_hash_into(&mut hasher);
        hasher.finish()
    }

    fn shape_hash_into(&self, state: &mut impl Hasher) {
        std::mem::discriminant(&self.kind).hash(state);
        match &self.kind {
            ExprKind::NotSet => {}
            ExprKind::Const(c) => match c {
                Constant::Null => state.write_u8(0),
                Constant::Bool(b) => {
                    state.write_u8(1);
                    b.hash(state);
                }
                Constant::Int(i) => {
                    state.write_u8(2);
                    i.hash(state);
                }
                Constant::Uint(u) => {
                    state.write_u8(3);
                    u.hash(state);
                }
                Constant::Double(d) => {
                    state.write_u8(4);
                    d.to_bits().hash(state);
                }
                Constant::String(s) => {
                    state.write_u8(5);
                    s.hash(state);
                }
                Constant::Bytes(b) => {
                    state.write_u8(6);
                    b.hash(state);
                }
            },
            ExprKind::Ident(name) => name.hash(state),
            ExprKind::Select(sel) => {
                sel.field.hash(state);
                sel.test_only.hash(state);
                sel.operand.shape_hash_into(state);
            }
            ExprKind::Call(call) => {
                call.function.hash(state);
                if let Some(target) = &call.target {
                    target.shape_hash_into(state);
                }
                for arg in &call.args {
                    arg.shape_hash_into(state);
                }
            }
            ExprKind::List(list) => {
                list.optional_indices.hash(state);
                for elem in &list.elements {
                    elem.shape_hash_into(state);
                }
            }
            ExprKind::Map(map) => {
                for entry in &map.entries {
                    entry.optional.hash(state);
                    entry.key.shape_hash_into(state);
                    entry.value.shape_hash_into(state);
                }
            }
            ExprKind::Struct(st) => {
                st.message_name.hash(state);
                for entry in &st.entries {
                    entry.field.hash(state);
                    entry.optional.hash(state);
                    entry.value.shape_hash_into(state);
                }
            }
            ExprKind::Comprehension(comp) => {
                comp.iter_var.hash(state);
                comp.iter_var2.hash(state);
                comp.accu_var.hash(state);
                comp.iter_range.shape_hash_into(state);
                comp.accu_init.shape_hash_into(state);
                comp.loop_condition.shape_hash_into(state);
                comp.loop_step.shape_hash_into(state);
                comp.result.shape_hash_into(state);
            }
        }
    }
}

/// Source overlay: positions and pre-expansion macro snapshots, keyed by
/// node id.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceInfo {
    /// The original source text, when the AST came from a parse.
    pub text: Option<String>,
    /// Byte offset of each node's start in `text`.
    pub positions: AHashMap<ExprId, u32>,
    /// For each node that resulted from macro expansion, the pre-expansion
    /// call form. Snapshot arguments share ids with the subtrees that
    /// survived into the expansion, so the unparser can print the original
    /// shape.
    pub macro_calls: AHashMap<ExprId, Expr>,
}

/// An immutable expression tree plus its source overlay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ast {
    root: Expr,
    source: SourceInfo,
}

impl Ast {
    pub fn new(root: Expr, source: SourceInfo) -> Self {
        Self { root, source }
    }

    pub fn root(&self) -> &Expr {
        &self.root
    }

    pub fn source(&self) -> &SourceInfo {
        &self.source
    }

    pub fn into_parts(self) -> (Expr, SourceInfo) {
        (self.root, self.source)
    }

    /// The largest node id in the tree (ignoring snapshot-only ids).
    pub fn max_id(&self) -> u64 {
        self.root.max_id()
    }
}

/// A resolved reference recorded by the checker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Reference {
    /// A variable (or enum constant, or type identifier) by fully-qualified
    /// name; `value` is set when the reference is a compile-time constant.
    Var {
        name: String,
        value: Option<Constant>,
    },
    /// A function call's candidate overload ids, narrowed as far as the
    /// argument types allow.
    Func { overload_ids: Vec<String> },
}

/// A checked AST: the tree plus the typed overlay the planner consumes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckedAst {
    ast: Ast,
    type_map: AHashMap<ExprId, CelType>,
    reference_map: AHashMap<ExprId, Reference>,
}

impl CheckedAst {
    pub fn new(
        ast: Ast,
        type_map: AHashMap<ExprId, CelType>,
        reference_map: AHashMap<ExprId, Reference>,
    ) -> Self {
        Self {
            ast,
            type_map,
            reference_map,
        }
    }

    pub fn ast(&self) -> &Ast {
        &self.ast
    }

    pub fn into_ast(self) -> Ast {
        self.ast
    }

    pub fn type_of(&self, id: ExprId) -> Option<&CelType> {
        self.type_map.get(&id)
    }

    pub fn reference(&self, id: ExprId) -> Option<&Reference> {
        self.reference_map.get(&id)
    }

    pub fn type_map(&self) -> &AHashMap<ExprId, CelType> {
        &self.type_map
    }

    pub fn reference_map(&self) -> &AHashMap<ExprId, Reference> {
        &self.reference_map
    }

    /// The result type of the whole expression.
    pub fn result_type(&self) -> &CelType {
        self.type_map
            .get(&self.ast.root().id)
            .unwrap_or(&CelType::Dyn)
    }
}
