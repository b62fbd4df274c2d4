//! This module exports a minimal message-passing API, which is encapsulated
//! by a `Communicator` trait. Implementors only need to write tagged `send`
//! and `recv` operations for a given transport layer (an in-process channel
//! mesh and a pure-Rust TCP transport are included). The trait then provides
//! default implementations for the paired exchange used by the buffer
//! engine, and for broadcast, reduce, reduce-all, gather-all and barrier
//! operations.
//!

pub mod comm;
pub mod local;
pub mod tcp;
pub mod util;
