use crate::EventEnvelope;

/// Result of feeding one envelope to a projection.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Applied {
    /// The read model changed.
    Updated,
    /// The envelope was a duplicate, stale, or irrelevant; nothing changed.
    Skipped,
}

/// A projection builds a read model from published envelopes.
///
/// Delivery is at-least-once and only ordered per partition key, so `apply` must be
/// idempotent: feeding the same envelope twice (or an older one after a newer one)
/// has to leave the read model exactly as a single in-order delivery would.
///
/// Read models are disposable; the ledger is the source of truth and a projection can
/// be rebuilt by replaying its events.
pub trait Projection: Send + Sync {
    type Payload;
    type Error: core::fmt::Debug + Send + Sync + 'static;

    /// Stable projection name (used in logs and worker names).
    fn name(&self) -> &'static str;

    /// Apply a single envelope.
    fn apply(&self, envelope: &EventEnvelope<Self::Payload>) -> Result<Applied, Self::Error>;
}
