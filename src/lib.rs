//! Purpose: Shared library crate used by the `bodybind` CLI, the echo server and tests.
//! Exports: `core` (buffering, tokenizing, binding, errors) and `api` (the decoding pipeline).
//! Role: Request-body decoding core that binds JSON onto typed models field by field.
//! Invariants: Field-scoped failures are recorded against their field; only fatal ones escape.
//! Invariants: Core modules prefer explicit inputs/outputs over hidden state.
pub mod api;
pub mod core;
