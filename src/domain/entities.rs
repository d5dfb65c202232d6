//! Domain entities mirrored from the durable queue store.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use time::OffsetDateTime;

use crate::domain::{error::DomainError, identifiers::validate_template_name, types::TaskState};

/// What to render: a template identifier, its data, and pass-through layout
/// options for the document engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderPayload {
    pub template: String,
    #[serde(default)]
    pub data: Map<String, Value>,
    /// Opaque page-layout options (paper size, margins, header/footer markup).
    #[serde(default, skip_serializing_if = "Value::is_null")]
    pub options: Value,
}

impl RenderPayload {
    /// Validate loosely-typed request fields into a payload.
    ///
    /// `template` must be a valid template name, `data` must be a JSON object
    /// and `options`, when present, must be an object too.
    pub fn parse(
        template: Option<String>,
        data: Option<Value>,
        options: Option<Value>,
    ) -> Result<Self, DomainError> {
        let template = template
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or_else(|| DomainError::validation("missing `template`"))?;
        validate_template_name(&template)?;

        let data = match data {
            Some(Value::Object(map)) => map,
            Some(_) => return Err(DomainError::validation("`data` must be a JSON object")),
            None => return Err(DomainError::validation("missing `data`")),
        };

        let options = match options {
            None | Some(Value::Null) => Value::Null,
            Some(value @ Value::Object(_)) => value,
            Some(_) => return Err(DomainError::validation("`options` must be a JSON object")),
        };

        Ok(Self {
            template,
            data,
            options,
        })
    }
}

/// Outcome stored once a task completes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenderResult {
    pub file_path: String,
    pub file_size: u64,
    pub duration_ms: u64,
    pub template: String,
}

/// A render task as held by the queue store.
///
/// `result` is only present in [`TaskState::Completed`] and `failure_reason`
/// only in [`TaskState::Failed`]; a task in `Waiting`/`Delayed` may still
/// carry `last_error` from an earlier attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderTaskRecord {
    pub id: String,
    pub payload: RenderPayload,
    pub priority: i32,
    pub state: TaskState,
    pub attempts_made: i32,
    pub max_attempts: i32,
    /// Advisory only; status derivation never looks at it.
    pub progress: u8,
    pub run_at: OffsetDateTime,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<OffsetDateTime>,
    pub result: Option<RenderResult>,
    pub failure_reason: Option<String>,
    pub last_error: Option<String>,
    pub created_at: OffsetDateTime,
    pub processed_at: Option<OffsetDateTime>,
    pub finished_at: Option<OffsetDateTime>,
}

impl RenderTaskRecord {
    pub fn attempts_remaining(&self) -> i32 {
        (self.max_attempts - self.attempts_made).max(0)
    }

    pub fn is_leased_by(&self, owner: &str) -> bool {
        self.state == TaskState::Active && self.lease_owner.as_deref() == Some(owner)
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn parse_accepts_object_data() {
        let payload = RenderPayload::parse(
            Some(" invoice ".to_string()),
            Some(json!({"invoiceNumber": "INV-001"})),
            None,
        )
        .expect("valid payload");

        assert_eq!(payload.template, "invoice");
        assert_eq!(payload.data["invoiceNumber"], "INV-001");
        assert!(payload.options.is_null());
    }

    #[test]
    fn parse_rejects_missing_template_and_non_object_data() {
        assert!(RenderPayload::parse(None, Some(json!({})), None).is_err());
        assert!(RenderPayload::parse(Some(String::new()), Some(json!({})), None).is_err());
        assert!(RenderPayload::parse(Some("invoice".into()), Some(json!([1, 2])), None).is_err());
        assert!(RenderPayload::parse(Some("invoice".into()), None, None).is_err());
        assert!(
            RenderPayload::parse(Some("invoice".into()), Some(json!({})), Some(json!("A4")))
                .is_err()
        );
    }
}
