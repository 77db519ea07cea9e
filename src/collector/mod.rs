//! Kernel interface access layer.
//!
//! This module provides the file reader, the pattern matcher and the
//! filesystem abstraction the monitors read through, with an in-memory mock
//! for testing on machines without Linux `/proc` and `/sys`.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                 MemoryMonitor / ProcessorMonitor             │
//! └──────────────┬─────────────────────────────────┬─────────────┘
//!                │ content                         │ parse
//!         ┌──────▼──────┐                   ┌──────▼──────────┐
//!         │  FileSystem │ (trait)           │ procfs::parser  │
//!         └──────┬──────┘                   └──────┬──────────┘
//!                │                                 │
//!       ┌────────┴────────┐                 ┌──────▼──────────┐
//!       │                 │                 │ PatternMatcher  │
//! ┌─────▼─────┐     ┌─────▼─────┐           │ (regex cache)   │
//! │  RealFs   │     │  MockFs   │           └─────────────────┘
//! │  Buffer   │     │ Scenarios │
//! │ mmap/read │     │ (Testing) │
//! └───────────┘     └───────────┘
//! ```
//!
//! # Usage
//!
//! ```
//! use kernstat::collector::{PatternMatcher, Patterns};
//!
//! let matcher = PatternMatcher::shared();
//! let result = matcher.match_line("processor   : 3", Patterns::CPU_PROCESSOR).unwrap();
//! assert!(result.matched);
//! assert_eq!(result.value, "3");
//! ```

pub mod buffer;
pub mod error;
pub mod mock;
pub mod pattern;
pub mod procfs;
mod traits;

pub use buffer::{Buffer, BufferConfig};
pub use error::CollectError;
pub use mock::MockFs;
pub use pattern::{MatchResult, PatternMatcher, Patterns};
pub use traits::{FileSystem, RealFs};
