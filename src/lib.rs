//! kernstat: Linux memory and processor telemetry.
//!
//! Provides:
//! - `collector`: file reader (buffered or memory-mapped), regex pattern
//!   matcher with a compiled-pattern cache, `/proc` and `/sys` parsers, and
//!   the `FileSystem` abstraction with its in-memory mock
//! - `model`: serializable snapshot types
//! - `monitor`: `MemoryMonitor` and `ProcessorMonitor`, each holding the
//!   latest snapshot with synchronous, asynchronous and continuous refresh
//!
//! The library logs through `tracing` and never installs a subscriber.

pub mod collector;
pub mod model;
pub mod monitor;
