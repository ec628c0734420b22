//! The CEL grammar front-end.
//!
//! Lexes and parses CEL source into [`cel_core::ast::Ast`] trees, expanding
//! surface macros (`has`, `all`, `exists`, `exists_one`, `map`, `filter`,
//! `cel.bind`) into the comprehension primitive at parse time. The
//! pre-expansion call forms are recorded in the source overlay so
//! expressions unparse the way they were written.
//!
//! ```
//! let ast = cel_parser::parse("[1, 2, 3].exists(i, i > 2)").unwrap();
//! assert_eq!(cel_core::unparse(&ast), "[1, 2, 3].exists(i, i > 2)");
//! ```

mod error;
mod lexer;
mod macros;
mod parser;

pub use error::{ParseError, ParseErrors};
pub use macros::MacroSet;
pub use parser::{parse, Parser};
