//! Client write and event gating
//!
//! Every check runs against the live values of the target's gate properties.
//! Nothing is cached, so a rule flipping between two checks is always seen.

use super::schema::{GateKind, PushPolicy};
use crate::core::error::{Error, Result};
use crate::state::HasVisibilityGate;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::warn;

/// Why a client change or event was refused
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Rejection {
    /// Property or handler the client tried to use
    pub blocked_property: String,
    /// Gate property that blocked it; `None` when the target itself is not writable
    pub blocked_by_property: Option<String>,
    /// Name of the component or service
    #[serde(rename = "componentName")]
    pub object_name: String,
    /// Human readable reason
    pub reason: String,
}

impl Rejection {
    /// Wire form sent back to the client
    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.object_name, self.blocked_property)?;
        if let Some(blocking) = &self.blocked_by_property {
            write!(f, " blocked by {}", blocking)?;
        }
        write!(f, ": {}", self.reason)
    }
}

/// Result of a gated client operation
#[derive(Debug, Clone, PartialEq)]
pub enum GateOutcome<T> {
    /// The operation ran
    Accepted(T),
    /// A gate refused it; nothing changed
    Rejected(Rejection),
}

impl<T> GateOutcome<T> {
    pub fn is_accepted(&self) -> bool {
        matches!(self, GateOutcome::Accepted(_))
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, GateOutcome::Rejected(_))
    }

    /// The rejection, if any
    pub fn rejection(&self) -> Option<&Rejection> {
        match self {
            GateOutcome::Rejected(rejection) => Some(rejection),
            GateOutcome::Accepted(_) => None,
        }
    }

    /// Map the accepted value
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> GateOutcome<U> {
        match self {
            GateOutcome::Accepted(value) => GateOutcome::Accepted(f(value)),
            GateOutcome::Rejected(rejection) => GateOutcome::Rejected(rejection),
        }
    }

    /// Turn a rejection into [`Error::RejectedClientChange`]
    pub fn into_result(self) -> Result<T> {
        match self {
            GateOutcome::Accepted(value) => Ok(value),
            GateOutcome::Rejected(rejection) => Err(Error::RejectedClientChange(rejection)),
        }
    }
}

/// How deep into a collection property a client update reaches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateDepth {
    /// The whole value is replaced
    Whole,
    /// Single rows or entries are replaced
    Shallow,
    /// Content nested inside rows or entries is updated
    Deep,
}

impl UpdateDepth {
    fn required_policy(self) -> PushPolicy {
        match self {
            UpdateDepth::Whole => PushPolicy::Allow,
            UpdateDepth::Shallow => PushPolicy::Shallow,
            UpdateDepth::Deep => PushPolicy::Deep,
        }
    }
}

/// Decides whether client writes and events may touch an object
pub struct AccessGate;

impl AccessGate {
    /// May the client replace property `name`?
    pub fn check_property<T>(target: &T, name: &str) -> GateOutcome<()>
    where
        T: HasVisibilityGate + ?Sized,
    {
        Self::check_granular(target, name, UpdateDepth::Whole)
    }

    /// May the client update property `name` at the given depth?
    pub fn check_granular<T>(target: &T, name: &str, depth: UpdateDepth) -> GateOutcome<()>
    where
        T: HasVisibilityGate + ?Sized,
    {
        // dotted names are gated by their root property
        let root = name.split('.').next().unwrap_or(name);
        let spec = target.spec();
        let declared = spec.get_property(name).or_else(|| spec.get_property(root));

        let Some(property) = declared else {
            return Self::reject(target, name, None, "property is not declared".to_string());
        };
        if property.is_intrinsically_protected() {
            return Self::reject(target, name, None, "property is protected".to_string());
        }
        let required = depth.required_policy();
        if property.push_policy < required {
            return Self::reject(
                target,
                name,
                None,
                format!(
                    "push policy {} does not allow {:?} updates",
                    property.push_policy, depth
                ),
            );
        }

        Self::check_rules(target, &property.name, name)
    }

    /// May the client run handler `handler`?
    pub fn check_event<T>(target: &T, handler: &str) -> GateOutcome<()>
    where
        T: HasVisibilityGate + ?Sized,
    {
        if target.spec().get_handler(handler).is_none() {
            return Self::reject(target, handler, None, "handler is not declared".to_string());
        }
        Self::check_rules(target, handler, handler)
    }

    fn check_rules<T>(target: &T, entry: &str, reported: &str) -> GateOutcome<()>
    where
        T: HasVisibilityGate + ?Sized,
    {
        let blocking = target
            .spec()
            .gate_rules()
            .find(|rule| rule.constrains(entry) && rule.is_blocking(target.gate_value(&rule.name)));

        match blocking {
            Some(rule) => {
                let reason = match rule.gate {
                    GateKind::Visibility { .. } => "blocked by visibility",
                    _ => "blocked by protecting property",
                };
                Self::reject(target, reported, Some(rule.name.clone()), reason.to_string())
            }
            None => GateOutcome::Accepted(()),
        }
    }

    fn reject<T>(
        target: &T,
        name: &str,
        blocked_by: Option<String>,
        reason: String,
    ) -> GateOutcome<()>
    where
        T: HasVisibilityGate + ?Sized,
    {
        warn!(
            object = target.object_name(),
            property = name,
            blocked_by = blocked_by.as_deref().unwrap_or("-"),
            %reason,
            "rejected client change"
        );
        GateOutcome::Rejected(Rejection {
            blocked_property: name.to_string(),
            blocked_by_property: blocked_by,
            object_name: target.object_name().to_string(),
            reason,
        })
    }
}
