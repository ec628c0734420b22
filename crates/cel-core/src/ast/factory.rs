//! Fresh-id node construction.
//!
//! Used wherever new nodes enter a tree: the macro expander at parse time
//! and the optimizers during rewrites. Ids are handed out monotonically so a
//! factory seeded above an AST's `max_id` never collides with it.

use crate::ast::{
    CallExpr, ComprehensionExpr, Constant, Expr, ExprId, ExprKind, ListExpr, MapEntry, MapExpr,
    SelectExpr, StructExpr, StructField,
};

#[derive(Debug)]
pub struct ExprFactory {
    next: u64,
}

impl ExprFactory {
    /// Creates a factory whose first handed-out id is `start`.
    pub fn new(start: u64) -> Self {
        Self { next: start.max(1) }
    }

    /// Creates a factory that numbers above every id in `expr`.
    pub fn above(expr: &Expr) -> Self {
        Self::new(expr.max_id() + 1)
    }

    pub fn next_id(&mut self) -> ExprId {
        let id = ExprId::new(self.next);
        self.next += 1;
        id
    }

    pub fn constant(&mut self, value: Constant) -> Expr {
        Expr::new(self.next_id(), ExprKind::Const(value))
    }

    pub fn null(&mut self) -> Expr {
        self.constant(Constant::Null)
    }

    pub fn bool(&mut self, value: bool) -> Expr {
        self.constant(Constant::Bool(value))
    }

    pub fn int(&mut self, value: i64) -> Expr {
        self.constant(Constant::Int(value))
    }

    pub fn uint(&mut self, value: u64) -> Expr {
        self.constant(Constant::Uint(value))
    }

    pub fn double(&mut self, value: f64) -> Expr {
        self.constant(Constant::Double(value))
    }

    pub fn string(&mut self, value: impl Into<String>) -> Expr {
        self.constant(Constant::String(value.into()))
    }

    pub fn bytes(&mut self, value: Vec<u8>) -> Expr {
        self.constant(Constant::Bytes(value))
    }

    pub fn ident(&mut self, name: impl Into<String>) -> Expr {
        Expr::new(self.next_id(), ExprKind::Ident(name.into()))
    }

    pub fn select(&mut self, operand: Expr, field: impl Into<String>) -> Expr {
        Expr::new(
            self.next_id(),
            ExprKind::Select(Box::new(SelectExpr {
                operand,
                field: field.into(),
                test_only: false,
            })),
        )
    }

    pub fn presence_test(&mut self, operand: Expr, field: impl Into<String>) -> Expr {
        Expr::new(
            self.next_id(),
            ExprKind::Select(Box::new(SelectExpr {
                operand,
                field: field.into(),
                test_only: true,
            })),
        )
    }

    pub fn global_call(&mut self, function: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::new(
            self.next_id(),
            ExprKind::Call(Box::new(CallExpr {
                target: None,
                function: function.into(),
                args,
            })),
        )
    }

    pub fn member_call(&mut self, target: Expr, function: impl Into<String>, args: Vec<Expr>) -> Expr {
        Expr::new(
            self.next_id(),
            ExprKind::Call(Box::new(CallExpr {
                target: Some(target),
                function: function.into(),
                args,
            })),
        )
    }

    pub fn list(&mut self, elements: Vec<Expr>) -> Expr {
        self.list_with_optionals(elements, vec![])
    }

    pub fn list_with_optionals(&mut self, elements: Vec<Expr>, optional_indices: Vec<u32>) -> Expr {
        Expr::new(
            self.next_id(),
            ExprKind::List(ListExpr {
                elements,
                optional_indices,
            }),
        )
    }

    pub fn map(&mut self, entries: Vec<MapEntry>) -> Expr {
        Expr::new(self.next_id(), ExprKind::Map(MapExpr { entries }))
    }

    pub fn strukt(&mut self, message_name: impl Into<String>, entries: Vec<StructField>) -> Expr {
        Expr::new(
            self.next_id(),
            ExprKind::Struct(StructExpr {
                message_name: message_name.into(),
                entries,
            }),
        )
    }

    #[expect(clippy::too_many_arguments, reason = "mirrors the comprehension node shape")]
    pub fn comprehension(
        &mut self,
        iter_var: impl Into<String>,
        iter_var2: Option<String>,
        iter_range: Expr,
        accu_var: impl Into<String>,
        accu_init: Expr,
        loop_condition: Expr,
        loop_step: Expr,
        result: Expr,
    ) -> Expr {
        Expr::new(
            self.next_id(),
            ExprKind::Comprehension(Box::new(ComprehensionExpr {
                iter_var: iter_var.into(),
                iter_var2,
                iter_range,
                accu_var: accu_var.into(),
                accu_init,
                loop_condition,
                loop_step,
                result,
            })),
        )
    }

    /// Deep-copies a subtree, renumbering every node with fresh ids from this
    /// factory.
    pub fn copy_with_fresh_ids(&mut self, expr: &Expr) -> Expr {
        let kind = match &expr.kind {
            ExprKind::NotSet => ExprKind::NotSet,
            ExprKind::Const(c) => ExprKind::Const(c.clone()),
            ExprKind::Ident(name) => ExprKind::Ident(name.clone()),
            ExprKind::Select(sel) => ExprKind::Select(Box::new(SelectExpr {
                operand: self.copy_with_fresh_ids(&sel.operand),
                field: sel.field.clone(),
                test_only: sel.test_only,
            })),
            ExprKind::Call(call) => ExprKind::Call(Box::new(CallExpr {
                target: call.target.as_ref().map(|t| self.copy_with_fresh_ids(t)),
                function: call.function.clone(),
                args: call.args.iter().map(|a| self.copy_with_fresh_ids(a)).collect(),
            })),
            ExprKind::List(list) => ExprKind::List(ListExpr {
                elements: list.elements.iter().map(|e| self.copy_with_fresh_ids(e)).collect(),
                optional_indices: list.optional_indices.clone(),
            }),
            ExprKind::Map(map) => ExprKind::Map(MapExpr {
                entries: map
                    .entries
                    .iter()
                    .map(|e| MapEntry {
                        key: self.copy_with_fresh_ids(&e.key),
                        value: self.copy_with_fresh_ids(&e.value),
                        optional: e.optional,
                    })
                    .collect(),
            }),
            ExprKind::Struct(st) => ExprKind::Struct(StructExpr {
                message_name: st.message_name.clone(),
                entries: st
                    .entries
                    .iter()
                    .map(|e| StructField {
                        field: e.field.clone(),
                        value: self.copy_with_fresh_ids(&e.value),
                        optional: e.optional,
                    })
                    .collect(),
            }),
            ExprKind::Comprehension(comp) => ExprKind::Comprehension(Box::new(ComprehensionExpr {
                iter_var: comp.iter_var.clone(),
                iter_var2: comp.iter_var2.clone(),
                iter_range: self.copy_with_fresh_ids(&comp.iter_range),
                accu_var: comp.accu_var.clone(),
                accu_init: self.copy_with_fresh_ids(&comp.accu_init),
                loop_condition: self.copy_with_fresh_ids(&comp.loop_condition),
                loop_step: self.copy_with_fresh_ids(&comp.loop_step),
                result: self.copy_with_fresh_ids(&comp.result),
            })),
        };
        Expr::new(self.next_id(), kind)
    }
}
