//! Operator-facing application layer.

pub mod error;
