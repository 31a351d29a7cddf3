//! Reusable stress testing infrastructure for the `foundation_synckit`
//! primitives.
//!
//! This crate provides:
//! - **Stress harness**: many workers running one operation, with success
//!   counting and an optional time limit enforced by cancellation
//! - **Primitive runs**: counter and lock stress runs with lost-update reports
//! - **Scenarios**: transfer storms and rendezvous crowds
//!
//! # Examples
//!
//! ```rust
//! use foundation_synckit::ExclusiveLock;
//! use foundation_testing::stress::{StressConfig, StressHarness};
//! use std::sync::Arc;
//!
//! let lock = Arc::new(ExclusiveLock::new(0usize));
//! let shared = Arc::clone(&lock);
//!
//! let results = StressHarness::new(StressConfig::new().threads(10).iterations(1000))
//!     .run(move |_worker, _iteration| shared.with(|value| *value += 1).is_ok())
//!     .unwrap();
//!
//! assert_eq!(results.successes, 10000);
//! assert_eq!(lock.with(|value| *value).unwrap(), 10000);
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod scenarios;
pub mod stress;

pub use stress::{StressConfig, StressError, StressHarness, StressResult};
