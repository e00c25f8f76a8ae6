//! Purpose: Checkpoint buffer manager library used by the `ckpool` CLI and tests.
//! Exports: `api` (stable surface), `core` (buffers, epochs, encoding, errors).
//! Role: Engine backing the binary; embedders should prefer `api`.
//! Invariants: Writers never block on drain I/O; only the drain pass touches the sink.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
