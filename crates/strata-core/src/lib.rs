//! # strata-core
//!
//! Shared infrastructure for Strata control-plane components.
//!
//! This crate carries the concerns every Strata service needs but none
//! should reimplement:
//!
//! - **Errors**: the shared [`error::Error`] enum and `Result` alias
//! - **Time**: the injectable [`clock::Clock`] abstraction so services and
//!   tests observe the same notion of "now"
//! - **Observability**: tracing initialization and span constructors

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rust_2018_idioms)]
#![warn(clippy::pedantic)]

pub mod clock;
pub mod error;
pub mod observability;

pub use clock::{Clock, ManualClock, SystemClock};
pub use error::{Error, Result};
