//! Core building blocks for driving the external media engine.
//!
//! Everything in this crate is free of queue state: input validation,
//! the local-channel authenticator, the engine command builder and the
//! sandboxed process runner. The pipeline and progress crates compose
//! these pieces.

pub mod auth;
pub mod command;
pub mod hashing;
pub mod process;
pub mod types;
pub mod validation;
