//! Coordinator API contracts
//!
//! Request and response records for the operations workers and producers
//! call. Transport is somebody else's problem: anything that can carry
//! these serde types can implement `CoordinatorApi`.

use async_broadcast::Receiver;
use async_trait::async_trait;
use chrono::SecondsFormat;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::core::errors::{CoordError, ErrorKind};
use crate::model::{Product, ProductFields};
use crate::notify::Wakeup;

/// Wire representation of a product
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductRecord {
    pub pid: String,
    pub state: String,
    pub event: Option<String>,
    pub message: Option<String>,
    /// ISO-8601, UTC
    pub ts: String,
}

impl From<&Product> for ProductRecord {
    fn from(product: &Product) -> Self {
        Self {
            pid: product.pid.clone(),
            state: product.state.to_string(),
            event: product.event.clone(),
            message: product.message.clone(),
            ts: product.updated_at.to_rfc3339_opts(SecondsFormat::Secs, true),
        }
    }
}

impl From<Product> for ProductRecord {
    fn from(product: Product) -> Self {
        Self::from(&product)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CreateProduct {
    pub pid: String,
    #[serde(flatten)]
    pub fields: ProductFields,
}

impl CreateProduct {
    pub fn new(pid: impl Into<String>) -> Self {
        Self {
            pid: pid.into(),
            fields: ProductFields::default(),
        }
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.fields.state = Some(state.into());
        self
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.fields.event = Some(event.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.fields.message = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateProduct {
    pub pid: String,
    #[serde(flatten)]
    pub fields: ProductFields,
}

impl UpdateProduct {
    pub fn new(pid: impl Into<String>) -> Self {
        Self {
            pid: pid.into(),
            fields: ProductFields::default(),
        }
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.fields.state = Some(state.into());
        self
    }

    pub fn event(mut self, event: impl Into<String>) -> Self {
        self.fields.event = Some(event.into());
        self
    }

    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.fields.message = Some(message.into());
        self
    }
}

/// `downstream` depends on `upstream`. The optional fields seed the
/// downstream product if it has to be created.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AddDependency {
    pub downstream: String,
    #[serde(default)]
    pub upstream: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
    #[serde(flatten)]
    pub fields: ProductFields,
}

impl AddDependency {
    pub fn new(downstream: impl Into<String>, upstream: impl Into<String>) -> Self {
        Self {
            downstream: downstream.into(),
            upstream: Some(upstream.into()),
            role: None,
            fields: ProductFields::default(),
        }
    }

    pub fn role(mut self, role: impl Into<String>) -> Self {
        self.role = Some(role.into());
        self
    }

    pub fn state(mut self, state: impl Into<String>) -> Self {
        self.fields.state = Some(state.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimNext {
    /// Acceptable roles, most preferred first
    pub roles: Vec<String>,
}

impl ClaimNext {
    pub fn new<I, S>(roles: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            roles: roles.into_iter().map(Into::into).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "product", rename_all = "snake_case")]
pub enum ClaimOutcome {
    Claimed(ProductRecord),
    NoWork,
}

impl ClaimOutcome {
    pub fn into_product(self) -> Option<ProductRecord> {
        match self {
            ClaimOutcome::Claimed(record) => Some(record),
            ClaimOutcome::NoWork => None,
        }
    }
}

/// Structured error returned to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    pub kind: ErrorKind,
    pub message: String,
    /// Set when the same call may succeed if retried after this long
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after_ms: Option<u64>,
}

impl ApiError {
    pub fn retry_after(&self) -> Option<Duration> {
        self.retry_after_ms.map(Duration::from_millis)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ApiError {}

impl From<CoordError> for ApiError {
    fn from(err: CoordError) -> Self {
        Self {
            kind: err.kind(),
            message: err.to_string(),
            retry_after_ms: err
                .suggested_retry_delay()
                .filter(|_| err.is_retryable())
                .map(|d| d.as_millis() as u64),
        }
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;

#[async_trait]
pub trait CoordinatorApi: Send + Sync {
    /// Fails with `Conflict` if the pid exists
    async fn create_product(&self, req: CreateProduct) -> ApiResult<ProductRecord>;

    async fn get_product(&self, pid: &str) -> ApiResult<ProductRecord>;

    /// Returns the deleted record
    async fn delete_product(&self, pid: &str) -> ApiResult<ProductRecord>;

    /// Deletes the product and all of its upstream ancestors
    async fn delete_subtree(&self, pid: &str) -> ApiResult<Vec<ProductRecord>>;

    /// Creates the product if absent
    async fn update_product(&self, req: UpdateProduct) -> ApiResult<ProductRecord>;

    /// Liveness signal that keeps the current state
    async fn heartbeat(&self, pid: &str, message: Option<String>) -> ApiResult<ProductRecord>;

    /// Returns the downstream product
    async fn add_dependency(&self, req: AddDependency) -> ApiResult<ProductRecord>;

    /// Absence of work is not an error
    async fn claim_next(&self, req: ClaimNext) -> ApiResult<ClaimOutcome>;

    /// Wakeup feed, if the implementation has one
    fn subscribe(&self) -> Option<Receiver<Wakeup>> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ProductState;
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_record_uses_iso8601() {
        let product = Product {
            id: 3,
            pid: "a".into(),
            state: ProductState::Available,
            event: Some("created".into()),
            message: None,
            updated_at: Utc.with_ymd_and_hms(2014, 5, 1, 12, 30, 0).unwrap(),
        };
        let record = ProductRecord::from(&product);
        assert_eq!(record.ts, "2014-05-01T12:30:00Z");
        assert_eq!(record.state, "available");
    }

    #[test]
    fn test_requests_accept_flat_json() {
        let req: AddDependency = serde_json::from_str(
            r#"{"downstream": "bins/x_blobs", "upstream": "bins/x", "state": "waiting"}"#,
        )
        .unwrap();
        assert_eq!(req.upstream.as_deref(), Some("bins/x"));
        assert_eq!(req.role, None);
        assert_eq!(req.fields.state.as_deref(), Some("waiting"));

        let req: AddDependency = serde_json::from_str(r#"{"downstream": "d"}"#).unwrap();
        assert_eq!(req.upstream, None);
    }

    #[test]
    fn test_claim_outcome_wire_shape() {
        let json = serde_json::to_value(ClaimOutcome::NoWork).unwrap();
        assert_eq!(json, serde_json::json!({"outcome": "no_work"}));
    }

    #[test]
    fn test_api_error_from_coord_error() {
        let err = ApiError::from(CoordError::conflict("a"));
        assert_eq!(err.kind, ErrorKind::Conflict);
        assert!(err.message.contains("a"));
        assert_eq!(err.retry_after(), None);

        let err = ApiError::from(CoordError::storage("disk full"));
        assert_eq!(err.kind, ErrorKind::Internal);
        assert_eq!(err.retry_after(), Some(Duration::from_secs(2)));
    }
}
