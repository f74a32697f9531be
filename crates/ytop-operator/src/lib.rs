//! ytop operator: drives Ytsaurus clusters toward their spec

#![deny(missing_docs)]

/// Ytsaurus reconcile loop, status store and error policy
pub mod controller;
/// Controller futures wiring
pub mod controller_runner;
