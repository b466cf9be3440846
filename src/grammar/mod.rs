//! Reference grammars — one small parser per symbolic syntax.

pub mod api;
pub mod matrix;
pub mod placeholder;
