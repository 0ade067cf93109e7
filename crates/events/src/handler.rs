//! Explicit handler registration for inbound bus messages.
//!
//! Listeners register a closure per event type; the registry routes each envelope to
//! every matching handler. Patterns:
//! - exact match: `"orders.order.approved"`
//! - category match: `"orders.*"` matches any type starting with `orders.`
//! - wildcard: `"*"` matches everything

use serde_json::Value as JsonValue;
use thiserror::Error;

use crate::EventEnvelope;

/// Error raised by a registered handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("handler '{handler}' failed: {message}")]
pub struct HandlerError {
    pub handler: String,
    pub message: String,
}

/// Handles one kind of inbound message.
pub trait MessageHandler: Send + Sync {
    type Error: core::fmt::Display;

    /// Stable name for logs.
    fn name(&self) -> &'static str;

    fn handle(&self, envelope: &EventEnvelope<JsonValue>) -> Result<(), Self::Error>;
}

type BoxedHandler = Box<dyn Fn(&EventEnvelope<JsonValue>) -> Result<(), HandlerError> + Send + Sync>;

/// Routing table from event-type patterns to handlers.
#[derive(Default)]
pub struct HandlerRegistry {
    routes: Vec<(String, BoxedHandler)>,
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("patterns", &self.routes.iter().map(|(p, _)| p.as_str()).collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a [`MessageHandler`] for an event-type pattern.
    pub fn register<H>(&mut self, pattern: impl Into<String>, handler: H)
    where
        H: MessageHandler + 'static,
    {
        self.routes.push((
            pattern.into(),
            Box::new(move |envelope| {
                handler.handle(envelope).map_err(|e| HandlerError {
                    handler: handler.name().to_string(),
                    message: e.to_string(),
                })
            }),
        ));
    }

    /// Register a plain closure for an event-type pattern.
    pub fn register_fn<F>(&mut self, pattern: impl Into<String>, handler: F)
    where
        F: Fn(&EventEnvelope<JsonValue>) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.routes.push((pattern.into(), Box::new(handler)));
    }

    /// Number of handlers that would receive an envelope of `event_type`.
    pub fn matching(&self, event_type: &str) -> usize {
        self.routes
            .iter()
            .filter(|(pattern, _)| pattern_matches(pattern, event_type))
            .count()
    }

    /// Route an envelope to every matching handler.
    ///
    /// All matching handlers run even if an earlier one fails; the errors are collected.
    /// Returns how many handlers ran.
    pub fn dispatch(&self, envelope: &EventEnvelope<JsonValue>) -> Result<usize, Vec<HandlerError>> {
        let mut ran = 0;
        let mut errors = Vec::new();

        for (pattern, handler) in &self.routes {
            if !pattern_matches(pattern, envelope.event_type()) {
                continue;
            }
            ran += 1;
            if let Err(e) = handler(envelope) {
                errors.push(e);
            }
        }

        if errors.is_empty() { Ok(ran) } else { Err(errors) }
    }
}

fn pattern_matches(pattern: &str, event_type: &str) -> bool {
    if pattern == "*" || pattern == event_type {
        return true;
    }
    match pattern.strip_suffix(".*") {
        Some(prefix) => event_type
            .strip_prefix(prefix)
            .is_some_and(|rest| rest.starts_with('.')),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use uuid::Uuid;

    use super::*;

    fn envelope(event_type: &str) -> EventEnvelope<JsonValue> {
        EventEnvelope::new(Uuid::now_v7(), event_type, 1, "k", 0, Utc::now(), JsonValue::Null)
    }

    #[test]
    fn patterns_route_by_exact_category_and_wildcard() {
        assert!(pattern_matches("orders.order.approved", "orders.order.approved"));
        assert!(pattern_matches("orders.*", "orders.order.approved"));
        assert!(!pattern_matches("orders.*", "ordersx.order"));
        assert!(pattern_matches("*", "anything"));
        assert!(!pattern_matches("inventory.*", "orders.order.approved"));
    }

    #[test]
    fn dispatch_runs_all_matches_and_collects_errors() {
        let hits = Arc::new(AtomicUsize::new(0));
        let mut registry = HandlerRegistry::new();

        let h = hits.clone();
        registry.register_fn("orders.*", move |_| {
            h.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        registry.register_fn("orders.order.approved", |_| {
            Err(HandlerError {
                handler: "failing".to_string(),
                message: "boom".to_string(),
            })
        });

        let errors = registry.dispatch(&envelope("orders.order.approved")).unwrap_err();
        assert_eq!(errors.len(), 1);
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        assert_eq!(registry.dispatch(&envelope("inventory.other")).unwrap(), 0);
    }
}
