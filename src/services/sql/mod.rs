// Portable SQL AST and its dialect renderers
pub mod ast;
pub mod dialect;
pub mod translator;

pub use ast::*;
pub use dialect::{Dialect, DialectRenderer};
pub use translator::{DialectTranslationService, SqlText};
