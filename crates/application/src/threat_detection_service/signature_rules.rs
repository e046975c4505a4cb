//! Payload signature rules for injection attacks.

use regex::Regex;
use serde_json::json;

use fleetguard_core::{AppError, AppResult};
use fleetguard_domain::{AttackType, RequestEvent};

use super::rules::{DetectionRule, RuleFinding, combine_weights};
use super::statistics::TrafficSnapshot;

const SQL_INJECTION_SIGNATURES: &[(&str, &str, f64)] = &[
    (
        "tautology",
        r#"(?i)['"]\s*(or|and)\s+['"]?\w+['"]?\s*(=|like)\s*['"]?\w+"#,
        0.8,
    ),
    ("union_select", r"(?i)\bunion\b(\s+all)?\s+select\b", 0.85),
    (
        "stacked_query",
        r"(?i);\s*(drop|delete|insert|update|alter|truncate|exec)\b",
        0.85,
    ),
    (
        "time_delay",
        r"(?i)\b(sleep|benchmark|pg_sleep)\s*\(|\bwaitfor\s+delay\b",
        0.8,
    ),
    (
        "schema_probe",
        r"(?i)\binformation_schema\b|\bpg_catalog\b|\bsys\.(tables|objects)\b",
        0.7,
    ),
    ("comment_terminator", r#"--(\s|"|'|$)|/\*|\*/"#, 0.3),
];

const XSS_SIGNATURES: &[(&str, &str, f64)] = &[
    ("script_tag", r"(?i)<\s*/?\s*script\b", 0.9),
    (
        "event_handler",
        r"(?i)\bon(error|load|click|mouseover|focus|blur|submit|toggle|animationstart)\s*=",
        0.7,
    ),
    ("javascript_uri", r"(?i)(java|vb)script\s*:", 0.7),
    (
        "dom_sink",
        r"(?i)\bdocument\.(cookie|write)\b|\beval\s*\(|\binnerHTML\b",
        0.5,
    ),
    (
        "embedding_tag",
        r"(?i)<\s*(iframe|object|embed|svg|math)\b",
        0.3,
    ),
];

struct WeightedSignature {
    label: &'static str,
    pattern: Regex,
    weight: f64,
}

/// Rule matching request texts against weighted regular expressions.
pub struct PayloadSignatureRule {
    name: &'static str,
    attack_type: AttackType,
    signatures: Vec<WeightedSignature>,
    max_inspected_bytes: usize,
}

impl PayloadSignatureRule {
    /// SQL meta-character and keyword signatures.
    pub fn sql_injection(max_inspected_bytes: usize) -> AppResult<Self> {
        Self::compile(
            "sqli",
            AttackType::Sqli,
            SQL_INJECTION_SIGNATURES,
            max_inspected_bytes,
        )
    }

    /// Script and event-handler signatures.
    pub fn cross_site_scripting(max_inspected_bytes: usize) -> AppResult<Self> {
        Self::compile("xss", AttackType::Xss, XSS_SIGNATURES, max_inspected_bytes)
    }

    fn compile(
        name: &'static str,
        attack_type: AttackType,
        table: &[(&'static str, &str, f64)],
        max_inspected_bytes: usize,
    ) -> AppResult<Self> {
        let signatures = table
            .iter()
            .map(|(label, pattern, weight)| {
                Regex::new(pattern)
                    .map(|pattern| WeightedSignature {
                        label: *label,
                        pattern,
                        weight: *weight,
                    })
                    .map_err(|error| {
                        AppError::Internal(format!(
                            "invalid {name} signature '{label}': {error}"
                        ))
                    })
            })
            .collect::<AppResult<Vec<_>>>()?;

        Ok(Self {
            name,
            attack_type,
            signatures,
            max_inspected_bytes,
        })
    }

    fn inspected_texts(&self, event: &RequestEvent) -> Vec<String> {
        let mut texts: Vec<String> = event
            .inspectable_texts()
            .into_iter()
            .map(|text| truncate(text, self.max_inspected_bytes).to_owned())
            .collect();

        if let Some(query) = event.query.as_deref().filter(|query| !query.is_empty()) {
            let decoded = url::form_urlencoded::parse(query.as_bytes())
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join("&");
            texts.push(truncate(decoded.as_str(), self.max_inspected_bytes).to_owned());
        }

        texts
    }
}

impl DetectionRule for PayloadSignatureRule {
    fn name(&self) -> &'static str {
        self.name
    }

    fn attack_type(&self) -> AttackType {
        self.attack_type
    }

    fn evaluate(&self, event: &RequestEvent, _traffic: &TrafficSnapshot) -> Option<RuleFinding> {
        let texts = self.inspected_texts(event);
        let matched: Vec<&WeightedSignature> = self
            .signatures
            .iter()
            .filter(|signature| {
                texts
                    .iter()
                    .any(|text| signature.pattern.is_match(text.as_str()))
            })
            .collect();

        if matched.is_empty() {
            return None;
        }

        Some(RuleFinding {
            attack_type: self.attack_type,
            confidence: combine_weights(matched.iter().map(|signature| signature.weight)),
            evidence: json!({
                "signatures": matched
                    .iter()
                    .map(|signature| signature.label)
                    .collect::<Vec<_>>(),
            }),
        })
    }
}

fn truncate(text: &str, max_bytes: usize) -> &str {
    if text.len() <= max_bytes {
        return text;
    }

    let mut end = max_bytes;
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
