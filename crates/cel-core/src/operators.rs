//! Operator function names and display metadata.
//!
//! Operators are ordinary functions with reserved names (`_&&_`, `_+_`, …).
//! The parser lowers symbols to these names, the planner special-cases the
//! non-strict ones, and the unparser maps them back through the tables here.

pub const CONDITIONAL: &str = "_?_:_";
pub const LOGICAL_AND: &str = "_&&_";
pub const LOGICAL_OR: &str = "_||_";
pub const LOGICAL_NOT: &str = "!_";
pub const EQUALS: &str = "_==_";
pub const NOT_EQUALS: &str = "_!=_";
pub const LESS: &str = "_<_";
pub const LESS_EQUALS: &str = "_<=_";
pub const GREATER: &str = "_>_";
pub const GREATER_EQUALS: &str = "_>=_";
pub const IN: &str = "@in";
pub const ADD: &str = "_+_";
pub const SUBTRACT: &str = "_-_";
pub const MULTIPLY: &str = "_*_";
pub const DIVIDE: &str = "_/_";
pub const MODULO: &str = "_%_";
pub const NEGATE: &str = "-_";
pub const INDEX: &str = "_[_]";
pub const OPT_INDEX: &str = "_[?_]";
pub const OPT_SELECT: &str = "_?._";
/// Non-strict guard used by the comprehension condition of `all`/`exists`:
/// false only for a definitive `false`, true for errors and unknowns.
pub const NOT_STRICTLY_FALSE: &str = "@not_strictly_false";

/// Binding strength, higher binds tighter. Mirrors the grammar's precedence
/// levels so the unparser can parenthesize minimally.
pub fn precedence(function: &str) -> Option<u8> {
    match function {
        CONDITIONAL => Some(1),
        LOGICAL_OR => Some(2),
        LOGICAL_AND => Some(3),
        EQUALS | NOT_EQUALS | LESS | LESS_EQUALS | GREATER | GREATER_EQUALS | IN => Some(4),
        ADD | SUBTRACT => Some(5),
        MULTIPLY | DIVIDE | MODULO => Some(6),
        LOGICAL_NOT | NEGATE => Some(7),
        _ => None,
    }
}

/// The source symbol for a binary operator function name.
pub fn binary_symbol(function: &str) -> Option<&'static str> {
    match function {
        LOGICAL_OR => Some("||"),
        LOGICAL_AND => Some("&&"),
        EQUALS => Some("=="),
        NOT_EQUALS => Some("!="),
        LESS => Some("<"),
        LESS_EQUALS => Some("<="),
        GREATER => Some(">"),
        GREATER_EQUALS => Some(">="),
        IN => Some("in"),
        ADD => Some("+"),
        SUBTRACT => Some("-"),
        MULTIPLY => Some("*"),
        DIVIDE => Some("/"),
        MODULO => Some("%"),
        _ => None,
    }
}

/// Whether the name is one of the reserved operator function names.
pub fn is_operator(function: &str) -> bool {
    precedence(function).is_some() || matches!(function, INDEX | OPT_INDEX | OPT_SELECT | NOT_STRICTLY_FALSE)
}
