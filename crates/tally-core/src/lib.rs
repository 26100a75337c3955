//! Core types and trait definitions for the classification tally engine.
//!
//! This crate is deliberately free of database and runtime dependencies.
//! The SQLite store and the ingestion engine depend on it; it depends on
//! nothing beyond serialisation and error helpers.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod classification;
pub mod error;
pub mod io;
pub mod parse;
pub mod store;
pub mod subject;

pub use error::ParseError;
pub use parse::parse;
