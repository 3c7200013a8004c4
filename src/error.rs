//! Error types for perishable streams.

use std::sync::Arc;

/// Errors delivered through [`Observer::on_error`](crate::Observer::on_error).
///
/// A stream error is terminal: the stream emits nothing afterwards. Death
/// actions already registered on delivered items are unaffected.
#[derive(Debug, Clone, thiserror::Error)]
pub enum PerishableError {
    /// The upstream source failed.
    ///
    /// The inner error is shared so the same failure can be handed to every
    /// subscriber.
    #[error("source failed: {0}")]
    Source(Arc<anyhow::Error>),
}

impl PerishableError {
    /// Wraps any error as a source failure.
    pub fn source_failure(err: impl Into<anyhow::Error>) -> Self {
        PerishableError::Source(Arc::new(err.into()))
    }

    /// Returns a reference to the inner error if this is a `Source` variant.
    pub fn source_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            PerishableError::Source(e) => Some(e),
        }
    }

    /// Attempts to downcast the source failure to a specific type.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.source_error().and_then(|e| e.downcast_ref::<E>())
    }
}
