//! Traceopt: an optimizer for the linear traces of a tracing JIT
//!
//! A recorded trace is a straight-line list of operations with guards that
//! leave the trace when a recorded assumption stops holding. Traceopt rewrites
//! such traces into shorter equivalent ones:
//!
//! - **Integer bounds**: interval and known-bit facts remove redundant guards
//!   and overflow checks
//! - **Virtuals**: allocations that do not escape are never performed; guards
//!   carry the data needed to rebuild them
//! - **Strings**: concatenations, slices and copies stay symbolic
//! - **Heap caching**: repeated field and array reads are reused, writes are
//!   delayed until someone can observe them
//! - **Loop peeling**: loops get a preamble and a body that reuses what the
//!   preamble computed
//!
//! # Quick Start
//!
//! ```no_run
//! use traceopt::ir::parser::parse_trace;
//! use traceopt::optimizer::Optimizer;
//!
//! fn main() -> traceopt::Result<()> {
//!     let trace = parse_trace("[i0]\ni1 = int_add(i0, 0)\nfinish(i1)\n")?;
//!     let optimized = Optimizer::new().optimize(&trace)?;
//!     println!("{}", optimized);
//!     Ok(())
//! }
//! ```
//!
//! # Module Overview
//!
//! | Category | Modules |
//! |----------|---------|
//! | **Input** | [`ir`], [`error`](Error) |
//! | **Facts** | [`intbound`], [`info`] |
//! | **Optimizing** | [`optimizer`], [`resume`], [`virtualstate`], [`unroll`] |
//! | **Checking** | [`interp`], [`selfcheck`] |
#![allow(clippy::type_complexity)]
#![allow(clippy::new_without_default)]

pub mod info;
pub mod intbound;
pub mod interp;
pub mod ir;
pub mod optimizer;
pub mod resume;
pub mod selfcheck;
pub mod unroll;
pub mod virtualstate;

mod error;

pub use error::{Error, Result};

/// Traceopt version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
