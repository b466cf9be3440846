//! Core expansion logic — tree, fragments, dispatch, engine.

pub mod config;
pub mod dispatch;
pub mod engine;
pub mod error;
pub mod fragment;
pub mod hasher;
pub mod template;
pub mod tree;
pub mod types;
