//! Canonical source rendering.
//!
//! The unparser honors the source overlay's macro snapshots: a node that
//! resulted from macro expansion prints its pre-expansion form
//! (`[1].exists(i, i > 0)`), not the desugared comprehension. Operator
//! precedence is handled explicitly and parentheses are inserted only where
//! the grammar requires them.

use std::fmt::Write;

use crate::{
    ast::{Ast, Constant, Expr, ExprKind, SourceInfo},
    operators,
    value::format_double,
};

/// Renders an AST as canonical source text.
pub fn unparse(ast: &Ast) -> String {
    let mut unparser = Unparser {
        source: ast.source(),
        out: String::new(),
    };
    unparser.expr(ast.root(), 0);
    unparser.out
}

/// Precedence floor for operands that must be primary expressions.
const PRIMARY: u8 = 8;

struct Unparser<'a> {
    source: &'a SourceInfo,
    out: String,
}

impl Unparser<'_> {
    /// Writes `expr`, parenthesizing when its own binding strength is below
    /// `min_prec`.
    fn expr(&mut self, expr: &Expr, min_prec: u8) {
        if let Some(snapshot) = self.source.macro_calls.get(&expr.id) {
            let snapshot = snapshot.clone();
            self.expr(&snapshot, min_prec);
            return;
        }
        match &expr.kind {
            ExprKind::NotSet => self.out.push_str("<unset>"),
            ExprKind::Const(c) => self.constant(c),
            ExprKind::Ident(name) => self.out.push_str(name),
            ExprKind::Select(sel) => {
                if sel.test_only {
                    self.out.push_str("has(");
                    self.expr(&sel.operand, PRIMARY);
                    self.out.push('.');
                    self.out.push_str(&sel.field);
                    self.out.push(')');
                } else {
                    self.expr(&sel.operand, PRIMARY);
                    self.out.push('.');
                    self.out.push_str(&sel.field);
                }
            }
            ExprKind::Call(_) => self.call(expr, min_prec),
            ExprKind::List(list) => {
                self.out.push('[');
                for (i, element) in list.elements.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    if list.optional_indices.contains(&(i as u32)) {
                        self.out.push('?');
                    }
                    self.expr(element, 0);
                }
                self.out.push(']');
            }
            ExprKind::Map(map) => {
                self.out.push('{');
                for (i, entry) in map.entries.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    if entry.optional {
                        self.out.push('?');
                    }
                    self.expr(&entry.key, 0);
                    self.out.push_str(": ");
                    self.expr(&entry.value, 0);
                }
                self.out.push('}');
            }
            ExprKind::Struct(st) => {
                self.out.push_str(&st.message_name);
                self.out.push('{');
                for (i, entry) in st.entries.iter().enumerate() {
                    if i > 0 {
                        self.out.push_str(", ");
                    }
                    if entry.optional {
                        self.out.push('?');
                    }
                    self.out.push_str(&entry.field);
                    self.out.push_str(": ");
                    self.expr(&entry.value, 0);
                }
                self.out.push('}');
            }
            ExprKind::Comprehension(comp) => {
                // a comprehension without a macro snapshot has no surface
                // form; render the primitive explicitly
                self.out.push_str("__comprehension__(");
                self.out.push_str(&comp.iter_var);
                if let Some(var2) = &comp.iter_var2 {
                    self.out.push_str(", ");
                    self.out.push_str(var2);
                }
                self.out.push_str(", ");
                self.expr(&comp.iter_range, 0);
                self.out.push_str(", ");
                self.out.push_str(&comp.accu_var);
                self.out.push_str(", ");
                self.expr(&comp.accu_init, 0);
                self.out.push_str(", ");
                self.expr(&comp.loop_condition, 0);
                self.out.push_str(", ");
                self.expr(&comp.loop_step, 0);
                self.out.push_str(", ");
                self.expr(&comp.result, 0);
                self.out.push(')');
            }
        }
    }

    fn call(&mut self, expr: &Expr, min_prec: u8) {
        let ExprKind::Call(call) = &expr.kind else {
            unreachable!("call on non-call");
        };
        let function = call.function.as_str();

        if call.target.is_none() {
            match (function, call.args.len()) {
                (operators::CONDITIONAL, 3) => {
                    let parens = min_prec > 1;
                    if parens {
                        self.out.push('(');
                    }
                    self.expr(&call.args[0], 2);
                    self.out.push_str(" ? ");
                    self.expr(&call.args[1], 2);
                    self.out.push_str(" : ");
                    self.expr(&call.args[2], 1);
                    if parens {
                        self.out.push(')');
                    }
                    return;
                }
                (operators::LOGICAL_NOT, 1) => {
                    let parens = min_prec > 7;
                    if parens {
                        self.out.push('(');
                    }
                    self.out.push('!');
                    self.expr(&call.args[0], 7);
                    if parens {
                        self.out.push(')');
                    }
                    return;
                }
                (operators::NEGATE, 1) => {
                    let parens = min_prec > 7;
                    if parens {
                        self.out.push('(');
                    }
                    self.out.push('-');
                    self.expr(&call.args[0], 7);
                    if parens {
                        self.out.push(')');
                    }
                    return;
                }
                (operators::INDEX, 2) => {
                    self.expr(&call.args[0], PRIMARY);
                    self.out.push('[');
                    self.expr(&call.args[1], 0);
                    self.out.push(']');
                    return;
                }
                (operators::OPT_INDEX, 2) => {
                    self.expr(&call.args[0], PRIMARY);
                    self.out.push_str("[?");
                    self.expr(&call.args[1], 0);
                    self.out.push(']');
                    return;
                }
                (operators::OPT_SELECT, 2) => {
                    if let ExprKind::Const(Constant::String(field)) = &call.args[1].kind {
                        self.expr(&call.args[0], PRIMARY);
                        self.out.push_str(".?");
                        self.out.push_str(field);
                        return;
                    }
                }
                _ => {}
            }
            if let (Some(prec), Some(symbol), 2) = (
                operators::precedence(function),
                operators::binary_symbol(function),
                call.args.len(),
            ) {
                let parens = min_prec > prec;
                if parens {
                    self.out.push('(');
                }
                self.expr(&call.args[0], prec);
                let _ = write!(self.out, " {symbol} ");
                // left associative: an equal-precedence right child needs parens
                self.expr(&call.args[1], prec + 1);
                if parens {
                    self.out.push(')');
                }
                return;
            }
        }

        if let Some(target) = &call.target {
            self.expr(target, PRIMARY);
            self.out.push('.');
        }
        self.out.push_str(function);
        self.out.push('(');
        for (i, arg) in call.args.iter().enumerate() {
            if i > 0 {
                self.out.push_str(", ");
            }
            self.expr(arg, 0);
        }
        self.out.push(')');
    }

    fn constant(&mut self, c: &Constant) {
        match c {
            Constant::Null => self.out.push_str("null"),
            Constant::Bool(b) => {
                self.out.push_str(if *b { "true" } else { "false" });
            }
            Constant::Int(i) => {
                let _ = write!(self.out, "{i}");
            }
            Constant::Uint(u) => {
                let _ = write!(self.out, "{u}u");
            }
            Constant::Double(d) => self.out.push_str(&format_double(*d)),
            Constant::String(s) => {
                self.out.push('"');
                for ch in s.chars() {
                    self.escape_char(ch);
                }
                self.out.push('"');
            }
            Constant::Bytes(b) => {
                self.out.push_str("b\"");
                for byte in b {
                    if byte.is_ascii_graphic() && *byte != b'"' && *byte != b'\\' {
                        self.out.push(*byte as char);
                    } else if *byte == b' ' {
                        self.out.push(' ');
                    } else {
                        let _ = write!(self.out, "\\x{byte:02x}");
                    }
                }
                self.out.push('"');
            }
        }
    }

    fn escape_char(&mut self, ch: char) {
        match ch {
            '"' => self.out.push_str("\\\""),
            '\\' => self.out.push_str("\\\\"),
            '\n' => self.out.push_str("\\n"),
            '\r' => self.out.push_str("\\r"),
            '\t' => self.out.push_str("\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(self.out, "\\u{:04x}", c as u32);
            }
            c => self.out.push(c),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::factory::ExprFactory;
    use crate::ast::{MapEntry, SourceInfo, StructField};
    use crate::operators;

    #[test]
    fn literals() {
        let mut fx = ExprFactory::new(1);
        let cases = vec![
            (fx.int(-4), "-4"),
            (fx.uint(7), "7u"),
            (fx.double(1.0), "1.0"),
            (fx.string("a\"b"), "\"a\\\"b\""),
            (fx.bytes(vec![b'h', b'i', 0xff]), "b\"hi\\xff\""),
            (fx.null(), "null"),
            (fx.bool(true), "true"),
        ];
        for (expr, expected) in cases {
            let ast = Ast::new(expr, SourceInfo::default());
            assert_eq!(unparse(&ast), expected);
        }
    }

    #[test]
    fn precedence_parenthesizes_only_where_needed() {
        // (1 + 2) * 3 keeps parens, 1 + 2 * 3 does not
        let mut fx = ExprFactory::new(1);
        let one = fx.int(1);
        let two = fx.int(2);
        let add = fx.global_call(operators::ADD, vec![one, two]);
        let three = fx.int(3);
        let mul = fx.global_call(operators::MULTIPLY, vec![add, three]);
        let ast = Ast::new(mul, SourceInfo::default());
        assert_eq!(unparse(&ast), "(1 + 2) * 3");

        let mut fx = ExprFactory::new(1);
        let two = fx.int(2);
        let three = fx.int(3);
        let mul = fx.global_call(operators::MULTIPLY, vec![two, three]);
        let one = fx.int(1);
        let add = fx.global_call(operators::ADD, vec![one, mul]);
        let ast = Ast::new(add, SourceInfo::default());
        assert_eq!(unparse(&ast), "1 + 2 * 3");
    }

    #[test]
    fn left_associative_right_child_keeps_parens() {
        // 1 - (2 - 3)
        let mut fx = ExprFactory::new(1);
        let two = fx.int(2);
        let three = fx.int(3);
        let inner = fx.global_call(operators::SUBTRACT, vec![two, three]);
        let one = fx.int(1);
        let outer = fx.global_call(operators::SUBTRACT, vec![one, inner]);
        let ast = Ast::new(outer, SourceInfo::default());
        assert_eq!(unparse(&ast), "1 - (2 - 3)");
    }

    #[test]
    fn aggregate_forms() {
        let mut fx = ExprFactory::new(1);
        let one = fx.int(1);
        let opt = fx.global_call("optional.none", vec![]);
        let list = fx.list_with_optionals(vec![one, opt], vec![1]);
        let ast = Ast::new(list, SourceInfo::default());
        assert_eq!(unparse(&ast), "[1, ?optional.none()]");

        let mut fx = ExprFactory::new(1);
        let key = fx.string("a");
        let value = fx.int(1);
        let map = fx.map(vec![MapEntry {
            key,
            value,
            optional: false,
        }]);
        let ast = Ast::new(map, SourceInfo::default());
        assert_eq!(unparse(&ast), "{\"a\": 1}");

        let mut fx = ExprFactory::new(1);
        let value = fx.int(4);
        let st = fx.strukt(
            "TestAllTypes",
            vec![StructField {
                field: "single_int32".to_string(),
                value,
                optional: false,
            }],
        );
        let ast = Ast::new(st, SourceInfo::default());
        assert_eq!(unparse(&ast), "TestAllTypes{single_int32: 4}");
    }

    #[test]
    fn macro_snapshot_wins_over_expansion() {
        // a comprehension whose snapshot says `[1].exists(i, i > 0)`
        let mut fx = ExprFactory::new(1);
        let one = fx.int(1);
        let range = fx.list(vec![one]);
        let range_id = range.id;
        let accu_init = fx.bool(false);
        let cond = fx.bool(true);
        let i1 = fx.ident("__result__");
        let i2 = fx.ident("i");
        let zero = fx.int(0);
        let gt = fx.global_call(operators::GREATER, vec![i2, zero]);
        let step = fx.global_call(operators::LOGICAL_OR, vec![i1, gt]);
        let result = fx.ident("__result__");
        let comp = fx.comprehension("i", None, range, "__result__", accu_init, cond, step, result);
        let comp_id = comp.id;

        let mut source = SourceInfo::default();
        let snap_range = Expr::new(range_id, ExprKind::List(crate::ast::ListExpr {
            elements: vec![Expr::new(crate::ast::ExprId::new(99), ExprKind::Const(Constant::Int(1)))],
            optional_indices: vec![],
        }));
        let snap_i = fx.ident("i");
        let snap_zero = fx.int(0);
        let snap_pred = fx.global_call(operators::GREATER, vec![snap_i, snap_zero]);
        let snap_var = fx.ident("i");
        let snapshot = fx.member_call(snap_range, "exists", vec![snap_var, snap_pred]);
        source.macro_calls.insert(comp_id, snapshot);

        let ast = Ast::new(comp, source);
        assert_eq!(unparse(&ast), "[1].exists(i, i > 0)");
    }
}
