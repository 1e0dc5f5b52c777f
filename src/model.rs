use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Internal product identifier, assigned by the store
pub type ProductId = u64;

/// Role used when a dependency does not name one
pub const DEFAULT_ROLE: &str = "any";

/// Event tags written by the coordinator itself
pub mod events {
    pub const CREATED: &str = "created";
    pub const HEARTBEAT: &str = "heartbeat";
    pub const IMPLICIT_CREATE: &str = "implicit_create";
    pub const CLAIMED: &str = "claimed";
    pub const COMPLETED: &str = "completed";
    pub const ERROR: &str = "error";
    pub const REQUEUED: &str = "requeued";
    pub const EXPIRED: &str = "expired";
}

/// Product lifecycle state.
///
/// The store persists any string; `Other` carries states the scheduler
/// does not recognise so they survive a round trip untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ProductState {
    Waiting,
    Available,
    Running,
    Completed,
    Error,
    Updated,
    Other(String),
}

impl ProductState {
    pub fn parse(s: &str) -> Self {
        let trimmed = s.trim();
        match trimmed.to_ascii_lowercase().as_str() {
            "waiting" => ProductState::Waiting,
            "available" => ProductState::Available,
            "running" => ProductState::Running,
            "completed" => ProductState::Completed,
            "error" => ProductState::Error,
            "updated" => ProductState::Updated,
            _ => ProductState::Other(trimmed.to_string()),
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            ProductState::Waiting => "waiting",
            ProductState::Available => "available",
            ProductState::Running => "running",
            ProductState::Completed => "completed",
            ProductState::Error => "error",
            ProductState::Updated => "updated",
            ProductState::Other(s) => s,
        }
    }

    /// Terminal absent external re-activation
    pub fn is_terminal(&self) -> bool {
        matches!(self, ProductState::Completed | ProductState::Error)
    }

    pub fn is_recognized(&self) -> bool {
        !matches!(self, ProductState::Other(_))
    }
}

impl fmt::Display for ProductState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ProductState {
    fn from(s: &str) -> Self {
        ProductState::parse(s)
    }
}

impl From<String> for ProductState {
    fn from(s: String) -> Self {
        ProductState::parse(&s)
    }
}

impl From<ProductState> for String {
    fn from(state: ProductState) -> Self {
        state.as_str().to_string()
    }
}

/// A named node in the pipeline graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub pid: String,
    pub state: ProductState,
    pub event: Option<String>,
    pub message: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Product {
    pub(crate) fn new(id: ProductId, pid: &str, transition: &Transition, now: DateTime<Utc>) -> Self {
        Self {
            id,
            pid: pid.to_string(),
            state: transition.state.clone(),
            event: transition.event.clone(),
            message: transition.message.clone(),
            updated_at: now,
        }
    }

    /// Apply a transition, keeping identity
    pub(crate) fn apply(&self, transition: &Transition, now: DateTime<Utc>) -> Self {
        Self {
            id: self.id,
            pid: self.pid.clone(),
            state: transition.state.clone(),
            event: transition.event.clone(),
            message: transition.message.clone(),
            updated_at: now,
        }
    }
}

/// Fully resolved state/event/message triple written by a mutation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    pub state: ProductState,
    pub event: Option<String>,
    pub message: Option<String>,
}

impl Transition {
    pub fn new(state: impl Into<ProductState>) -> Self {
        Self {
            state: state.into(),
            event: None,
            message: None,
        }
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.event = Some(event.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn maybe_message(mut self, message: Option<String>) -> Self {
        self.message = message;
        self
    }
}

/// Optional fields as supplied by a caller; defaults fill the gaps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFields {
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub event: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

impl ProductFields {
    pub fn resolve(&self, default_state: ProductState, default_event: Option<&str>) -> Transition {
        Transition {
            state: self
                .state
                .as_deref()
                .map(ProductState::parse)
                .unwrap_or(default_state),
            event: self
                .event
                .clone()
                .or_else(|| default_event.map(str::to_string)),
            message: self.message.clone(),
        }
    }
}

/// A role-labelled edge between two products, resolved to pids
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub downstream: String,
    pub upstream: String,
    pub role: String,
}
