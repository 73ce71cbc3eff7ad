//! # Types
//!
//! The two payloads flowing through the pipeline: candidates on the intake queue and
//! enriched records on the output queue (and in the store).
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::normalizer::{EnrichedFields, UNKNOWN_COUNTRY};

/// A raw phone number candidate as published by the producer.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone)]
pub struct RawCandidate {
    pub id: String,
    pub raw: String,
}

/// Reasons a message body cannot be turned into something the pipeline understands.
/// These are never retried: the same body will fail the same way on every delivery.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum MalformedError {
    #[error("body is not valid JSON: {0}")]
    InvalidJson(String),
    #[error("body is not a JSON object")]
    NotAnObject,
    #[error("missing or empty id")]
    MissingId,
    #[error("field {0} has an unsupported type")]
    UnsupportedFieldType(String),
    #[error("record does not satisfy invariants: {0}")]
    InvalidRecord(String),
}

/// The outcome of reading a candidate body: either we found a raw value, or the
/// candidate carries an id but none of the accepted fields.
#[derive(Debug, PartialEq, Eq)]
pub enum CandidateBody {
    Found(RawCandidate),
    MissingNumber { id: String },
}

impl RawCandidate {
    /// Read a candidate out of a JSON body, looking up the phone number in `fields`, in order.
    /// The first field that is present and not `null` wins. Integers are accepted as well as
    /// strings, since older producers published the raw value as a JSON number. Fractional
    /// numbers are not: their rendering does not preserve the digits.
    pub fn from_body(body: &str, fields: &[String]) -> Result<CandidateBody, MalformedError> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| MalformedError::InvalidJson(e.to_string()))?;
        let object = value.as_object().ok_or(MalformedError::NotAnObject)?;

        let id = match object.get("id") {
            Some(Value::String(id)) if !id.is_empty() => id.to_owned(),
            _ => return Err(MalformedError::MissingId),
        };

        for field in fields {
            match object.get(field) {
                None | Some(Value::Null) => continue,
                Some(Value::String(raw)) => {
                    return Ok(CandidateBody::Found(RawCandidate {
                        id,
                        raw: raw.to_owned(),
                    }))
                }
                Some(Value::Number(raw)) if raw.is_u64() || raw.is_i64() => {
                    return Ok(CandidateBody::Found(RawCandidate {
                        id,
                        raw: raw.to_string(),
                    }))
                }
                Some(_) => return Err(MalformedError::UnsupportedFieldType(field.to_owned())),
            }
        }

        Ok(CandidateBody::MissingNumber { id })
    }
}

/// A validated and classified phone number, ready to be persisted.
#[derive(Deserialize, Serialize, Debug, PartialEq, Eq, Clone, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct EnrichedRecord {
    pub id: String,
    pub raw: String,
    pub raw_digits: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub e164: Option<String>,
    pub country: String,
    pub is_target_mobile: bool,
    pub created_at: DateTime<Utc>,
}

impl EnrichedRecord {
    pub fn new(candidate: RawCandidate, fields: EnrichedFields, created_at: DateTime<Utc>) -> Self {
        Self {
            id: candidate.id,
            raw: candidate.raw,
            raw_digits: fields.raw_digits,
            e164: fields.e164,
            country: fields.country,
            is_target_mobile: fields.is_target_mobile,
            created_at,
        }
    }

    /// Parse a record from an output queue body. Bodies without an id can never be stored
    /// idempotently, so they are reported as `MissingId` before anything else is checked.
    pub fn from_body(body: &str) -> Result<Self, MalformedError> {
        let value: Value =
            serde_json::from_str(body).map_err(|e| MalformedError::InvalidJson(e.to_string()))?;
        match value.get("id") {
            Some(Value::String(id)) if !id.is_empty() => {}
            _ if value.is_object() => return Err(MalformedError::MissingId),
            _ => return Err(MalformedError::NotAnObject),
        }

        let record: EnrichedRecord = serde_json::from_value(value)
            .map_err(|e| MalformedError::InvalidRecord(e.to_string()))?;
        record.validate()?;
        Ok(record)
    }

    /// Check the data model invariants that the store relies on.
    pub fn validate(&self) -> Result<(), MalformedError> {
        if self.raw_digits.is_empty() || !self.raw_digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(MalformedError::InvalidRecord(
                "rawDigits must be a non-empty string of digits".to_owned(),
            ));
        }
        if self.country == UNKNOWN_COUNTRY && self.is_target_mobile {
            return Err(MalformedError::InvalidRecord(
                "an UNKNOWN country cannot be a target mobile".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<String> {
        ["msisdn", "raw", "phone", "number", "value"]
            .iter()
            .map(|f| f.to_string())
            .collect()
    }

    #[test]
    fn test_candidate_reads_first_present_field() {
        let body = r#"{"id": "c1", "phone": "+31 6 1234 5678", "raw": null, "value": "999"}"#;

        let parsed = RawCandidate::from_body(body, &fields()).unwrap();

        assert_eq!(
            parsed,
            CandidateBody::Found(RawCandidate {
                id: "c1".to_owned(),
                raw: "+31 6 1234 5678".to_owned(),
            })
        );
    }

    #[test]
    fn test_candidate_accepts_numeric_raw() {
        let body = r#"{"id": "c1", "raw": 5511987654321}"#;

        let parsed = RawCandidate::from_body(body, &fields()).unwrap();

        assert_eq!(
            parsed,
            CandidateBody::Found(RawCandidate {
                id: "c1".to_owned(),
                raw: "5511987654321".to_owned(),
            })
        );
    }

    #[test]
    fn test_candidate_rejects_fractional_numbers() {
        for body in [
            r#"{"id": "c1", "raw": 55000000000.0}"#,
            r#"{"id": "c1", "raw": 5.5e10}"#,
        ] {
            assert_eq!(
                RawCandidate::from_body(body, &fields()),
                Err(MalformedError::UnsupportedFieldType("raw".to_owned()))
            );
        }
    }

    #[test]
    fn test_candidate_without_number_fields() {
        let body = r#"{"id": "c1", "email": "someone@example.com"}"#;

        let parsed = RawCandidate::from_body(body, &fields()).unwrap();

        assert_eq!(
            parsed,
            CandidateBody::MissingNumber {
                id: "c1".to_owned()
            }
        );
    }

    #[test]
    fn test_candidate_malformed_bodies() {
        assert!(matches!(
            RawCandidate::from_body("not json", &fields()),
            Err(MalformedError::InvalidJson(_))
        ));
        assert_eq!(
            RawCandidate::from_body("[1, 2]", &fields()),
            Err(MalformedError::NotAnObject)
        );
        assert_eq!(
            RawCandidate::from_body(r#"{"raw": "123"}"#, &fields()),
            Err(MalformedError::MissingId)
        );
        assert_eq!(
            RawCandidate::from_body(r#"{"id": "", "raw": "123"}"#, &fields()),
            Err(MalformedError::MissingId)
        );
        assert_eq!(
            RawCandidate::from_body(r#"{"id": "c1", "raw": ["123"]}"#, &fields()),
            Err(MalformedError::UnsupportedFieldType("raw".to_owned()))
        );
    }

    #[test]
    fn test_record_body_uses_camel_case() {
        let record = EnrichedRecord {
            id: "c1".to_owned(),
            raw: "+31 6 1234 5678".to_owned(),
            raw_digits: "31612345678".to_owned(),
            e164: None,
            country: "NL".to_owned(),
            is_target_mobile: true,
            created_at: "2024-06-01T12:00:00Z".parse().unwrap(),
        };

        let body = serde_json::to_value(&record).unwrap();

        assert_eq!(body["rawDigits"], "31612345678");
        assert_eq!(body["isTargetMobile"], true);
        assert_eq!(body["createdAt"], "2024-06-01T12:00:00Z");
        assert!(body.get("e164").is_none());
        assert_eq!(
            EnrichedRecord::from_body(&body.to_string()).unwrap(),
            record
        );
    }

    #[test]
    fn test_record_body_without_id_is_missing_id() {
        let body = r#"{"rawDigits": "123", "country": "NL", "isTargetMobile": false}"#;

        assert_eq!(
            EnrichedRecord::from_body(body),
            Err(MalformedError::MissingId)
        );
    }

    #[test]
    fn test_record_body_violating_invariants() {
        let body = r#"{"id": "c1", "raw": "x", "rawDigits": "12a", "country": "NL",
            "isTargetMobile": false, "createdAt": "2024-06-01T12:00:00Z"}"#;
        assert!(matches!(
            EnrichedRecord::from_body(body),
            Err(MalformedError::InvalidRecord(_))
        ));

        let body = r#"{"id": "c1", "raw": "x", "rawDigits": "123", "country": "UNKNOWN",
            "isTargetMobile": true, "createdAt": "2024-06-01T12:00:00Z"}"#;
        assert!(matches!(
            EnrichedRecord::from_body(body),
            Err(MalformedError::InvalidRecord(_))
        ));
    }
}
