//! Deterministic, pure logic shared by the conductor.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data and return deterministic outputs suitable for tests.

pub mod backoff;
pub mod gate;
pub mod ident;
pub mod recovery;
pub mod types;
