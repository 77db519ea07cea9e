//! Parsers for the `/proc` and `/sys` interfaces the monitors read.
//!
//! Only the fields the monitors need are extracted; this is not a general
//! procfs schema.

pub mod parser;

pub use parser::{CpuInfoRecord, StatCpus, SwapTotals};
