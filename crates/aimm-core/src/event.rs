//! Event-bus data types and subscription matching.
//!
//! Events are addressed by a path of string segments. Subscriptions are
//! sets of path patterns where `?` matches exactly one segment and a
//! trailing `*` matches any remainder.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Event address: a path of string segments.
pub type EventType = Vec<String>;

/// An event received from the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Address the event was published under.
    pub event_type: EventType,
    /// JSON payload.
    pub payload: Value,
}

/// An event to be published on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterEvent {
    /// Address to publish under.
    pub event_type: EventType,
    /// JSON payload.
    pub payload: Value,
}

impl RegisterEvent {
    /// Creates a register event.
    pub fn new(event_type: EventType, payload: Value) -> Self {
        Self {
            event_type,
            payload,
        }
    }
}

/// A set of event-type patterns.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Subscription {
    patterns: Vec<EventType>,
}

impl Subscription {
    /// Creates a subscription from the given patterns.
    pub fn new(patterns: Vec<EventType>) -> Self {
        Self { patterns }
    }

    /// Creates a subscription for everything under `prefix`.
    pub fn prefix(prefix: &[String]) -> Self {
        let mut pattern = prefix.to_vec();
        pattern.push("*".to_string());
        Self {
            patterns: vec![pattern],
        }
    }

    /// Returns the union of this subscription and `other`.
    pub fn union(&self, other: &Subscription) -> Subscription {
        let mut patterns = self.patterns.clone();
        patterns.extend(other.patterns.iter().cloned());
        Subscription { patterns }
    }

    /// Returns `true` when no pattern is registered.
    pub fn is_empty(&self) -> bool {
        self.patterns.is_empty()
    }

    /// Returns the registered patterns.
    pub fn patterns(&self) -> &[EventType] {
        &self.patterns
    }

    /// Returns `true` if `event_type` matches any registered pattern.
    pub fn matches(&self, event_type: &[String]) -> bool {
        self.patterns
            .iter()
            .any(|pattern| matches_pattern(pattern, event_type))
    }
}

/// Matches a single pattern against an event type.
pub fn matches_pattern(pattern: &[String], event_type: &[String]) -> bool {
    let mut segments = event_type.iter();
    for (i, part) in pattern.iter().enumerate() {
        if part == "*" && i == pattern.len() - 1 {
            return true;
        }
        match segments.next() {
            Some(segment) if part == "?" || part == segment => {}
            _ => return false,
        }
    }
    segments.next().is_none()
}
