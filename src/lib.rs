//! Stencil — template macro expansion.
//!
//! Compact declarations (API families, resource matrices, pipeline action
//! graphs) expanded into plain resource definitions. Deterministic output.
//! References into generated resources rewritten in place.

pub mod cli;
pub mod core;
pub mod grammar;
pub mod pipeline;
pub mod resolvers;
