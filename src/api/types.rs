use serde::{Deserialize, Serialize};

use crate::alloc::model::Strategy;

/// Body of `POST /alloc`. Fields default so that a missing field surfaces as
/// a validation failure with its field name rather than a decode error.
#[derive(Clone, Debug, Deserialize)]
pub struct AllocRequest {
    #[serde(default)]
    pub request_id: String,
    #[serde(default)]
    pub token_count: i64,
}

/// Body of `POST /free`.
#[derive(Clone, Debug, Deserialize)]
pub struct FreeRequest {
    #[serde(default)]
    pub request_id: String,
}

#[derive(Clone, Debug, Serialize)]
pub struct AllocResponse {
    pub node_id: i64,
    pub remaining_quota: i64,
}

#[derive(Clone, Debug, Serialize)]
pub struct FreeResponse {
    pub node_id: i64,
}

/// Body of both strategy endpoints.
#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct StrategyBody {
    pub strategy: Strategy,
}

/// One failed validation check, reported under `detail`.
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct FieldError {
    pub field: &'static str,
    pub reason: &'static str,
}

impl AllocRequest {
    /// Collects every failed field instead of stopping at the first.
    pub fn validate(&self) -> Vec<FieldError> {
        let mut failures = Vec::new();
        if self.request_id.is_empty() {
            failures.push(FieldError {
                field: "request_id",
                reason: "must be a non-empty string",
            });
        }
        if self.token_count <= 0 {
            failures.push(FieldError {
                field: "token_count",
                reason: "must be a positive integer",
            });
        }
        failures
    }
}

impl FreeRequest {
    pub fn validate(&self) -> Vec<FieldError> {
        if self.request_id.is_empty() {
            vec![FieldError {
                field: "request_id",
                reason: "must be a non-empty string",
            }]
        } else {
            Vec::new()
        }
    }
}
