//! Client-side orchestration of polls whose ballots stay encrypted on an
//! FHEVM ledger until the results are revealed.

#[macro_use]
extern crate log;

#[cfg(test)]
#[macro_use]
extern crate ballot_test;

pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod ledger;
pub mod lifecycle;
pub mod model;
pub mod pipeline;
pub mod simulation;

pub use error::{Error, ErrorKind, Result};
