//! Error taxonomy.
//!
//! Operational failures ride on [`anyhow`] with context naming the failing
//! operation. A structural divergence between the two inputs gets the typed
//! [`Unreconcilable`] error instead, so the binary can map it to exit
//! status 2.

use thiserror::Error;

/// A difference between the two inputs that no amount of extraction can
/// reconcile.
#[derive(Debug, Error)]
#[error("unreconcilable difference: {0}")]
pub struct Unreconcilable(String);

impl Unreconcilable {
    pub fn new(msg: impl Into<String>) -> Self {
        Unreconcilable(msg.into())
    }
}
