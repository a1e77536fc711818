//! Core types and trait definitions for the Llinatge genealogy catalogue.
//!
//! This crate is deliberately free of HTTP and database dependencies. It holds
//! the domain model, the pure halves of every engine (permission matching,
//! search normalisation and scoring, rollup arithmetic, rate limiting), the
//! configuration layer, and the store traits that backends implement.

// We intentionally use native `async fn` in traits (stabilised in Rust 1.75).
// Suppress the advisory lint about `Send` bounds on the returned futures.
#![allow(async_fn_in_trait)]

pub mod account;
pub mod config;
pub mod entity;
pub mod error;
pub mod permission;
pub mod ratelimit;
pub mod rollup;
pub mod search;
pub mod services;
pub mod store;
pub mod wiki;

pub use error::{Error, ErrorKind, Result};
