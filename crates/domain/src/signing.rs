//! Signed request envelope and its canonical byte form.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Version tag prefixed to every canonical message.
const CANONICAL_VERSION: &str = "v1";

/// Request payload together with its replay-protection fields and signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedRequest {
    /// Signed JSON payload.
    pub payload: Value,
    /// Unix timestamp (seconds) at signing time.
    pub timestamp: i64,
    /// Single-use random token, hex encoded.
    pub nonce: String,
    /// Hex-encoded HMAC-SHA256 over [`canonical_message`].
    pub signature: String,
}

impl SignedRequest {
    /// Returns the canonical bytes covered by this request's signature.
    #[must_use]
    pub fn canonical_message(&self) -> Vec<u8> {
        canonical_message(&self.payload, self.timestamp, self.nonce.as_str())
    }
}

/// Outcome of verifying a [`SignedRequest`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignatureVerification {
    /// Signature is authentic, fresh, and the nonce was unused.
    Valid,
    /// Signature does not match the payload under the given secret.
    InvalidSignature,
    /// Timestamp lies outside the allowed clock skew.
    Expired,
    /// Nonce was already consumed inside the replay window.
    ReplayDetected,
    /// Nonce store failed and the verifier is configured to fail closed.
    StoreUnavailable,
}

impl SignatureVerification {
    /// Returns true for [`SignatureVerification::Valid`].
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Returns a stable label for logs and responses.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::InvalidSignature => "invalid_signature",
            Self::Expired => "expired",
            Self::ReplayDetected => "replay_detected",
            Self::StoreUnavailable => "store_unavailable",
        }
    }
}

/// Builds the canonical message `v1\n{timestamp}\n{nonce}\n{payload}`.
///
/// The payload is rendered with object keys sorted at every depth and no
/// insignificant whitespace, so equal JSON values always sign identically.
#[must_use]
pub fn canonical_message(payload: &Value, timestamp: i64, nonce: &str) -> Vec<u8> {
    let mut message = format!("{CANONICAL_VERSION}\n{timestamp}\n{nonce}\n");
    write_canonical_json(payload, &mut message);
    message.into_bytes()
}

/// Renders a JSON value canonically.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut output = String::new();
    write_canonical_json(value, &mut output);
    output
}

fn write_canonical_json(value: &Value, output: &mut String) {
    match value {
        Value::Object(map) => {
            let mut entries: Vec<(&String, &Value)> = map.iter().collect();
            entries.sort_by(|left, right| left.0.cmp(right.0));

            output.push('{');
            for (index, (key, nested)) in entries.into_iter().enumerate() {
                if index > 0 {
                    output.push(',');
                }
                output.push_str(Value::String(key.clone()).to_string().as_str());
                output.push(':');
                write_canonical_json(nested, output);
            }
            output.push('}');
        }
        Value::Array(items) => {
            output.push('[');
            for (index, nested) in items.iter().enumerate() {
                if index > 0 {
                    output.push(',');
                }
                write_canonical_json(nested, output);
            }
            output.push(']');
        }
        scalar => output.push_str(scalar.to_string().as_str()),
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{canonical_json, canonical_message};

    #[test]
    fn canonical_json_sorts_nested_keys() {
        let left = json!({"b": 1, "a": {"z": [1, {"y": true, "x": null}], "c": "é"}});
        let right = json!({"a": {"c": "é", "z": [1, {"x": null, "y": true}]}, "b": 1});

        assert_eq!(canonical_json(&left), canonical_json(&right));
        assert_eq!(
            canonical_json(&left),
            r#"{"a":{"c":"é","z":[1,{"x":null,"y":true}]},"b":1}"#
        );
    }

    #[test]
    fn canonical_message_separates_fields() {
        let message = canonical_message(&json!({"amount": 120}), 1_700_000_000, "abcd");
        assert_eq!(
            String::from_utf8(message).unwrap_or_default(),
            "v1\n1700000000\nabcd\n{\"amount\":120}"
        );
    }

    #[test]
    fn string_keys_are_escaped() {
        let value = json!({"quo\"te": "line\nbreak"});
        assert_eq!(canonical_json(&value), r#"{"quo\"te":"line\nbreak"}"#);
    }
}
