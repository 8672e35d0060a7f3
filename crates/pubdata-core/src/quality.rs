//! Advisory quality scoring for fetched payloads.
//!
//! Scores are attached next to the payload and never alter it.

use std::fmt::{Display, Formatter};
use std::time::Duration;

use serde::Serialize;
use time::OffsetDateTime;

use crate::error::ValidationError;
use crate::fetcher::Payload;

const EXCELLENT_COMPLETENESS: f64 = 0.9;
const GOOD_COMPLETENESS: f64 = 0.7;
const FAIR_COMPLETENESS: f64 = 0.5;

/// Quality verdict, ordered from best to worst.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    Excellent,
    Good,
    Fair,
    Poor,
}

impl Verdict {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
        }
    }

    fn from_completeness(completeness: f64) -> Self {
        if completeness >= EXCELLENT_COMPLETENESS {
            Self::Excellent
        } else if completeness >= GOOD_COMPLETENESS {
            Self::Good
        } else if completeness >= FAIR_COMPLETENESS {
            Self::Fair
        } else {
            Self::Poor
        }
    }
}

impl Display for Verdict {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Top-level fields an adapter promises, and the TTL freshness is judged against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeclaredSchema {
    pub fields: Vec<String>,
    pub ttl: Duration,
}

impl DeclaredSchema {
    pub fn new<I, S>(fields: I, ttl: Duration) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: fields.into_iter().map(Into::into).collect(),
            ttl,
        }
    }
}

/// Freshness thresholds as fractions of the TTL.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FreshnessBands {
    pub excellent: f64,
    pub good: f64,
    pub fair: f64,
}

impl Default for FreshnessBands {
    fn default() -> Self {
        Self {
            excellent: 0.25,
            good: 0.5,
            fair: 1.0,
        }
    }
}

impl FreshnessBands {
    pub fn validate(&self) -> Result<(), ValidationError> {
        let ordered = 0.0 < self.excellent && self.excellent < self.good && self.good < self.fair;
        if ordered && self.fair <= 1.0 {
            return Ok(());
        }
        Err(ValidationError::InvalidFreshnessBands {
            excellent: self.excellent.to_string(),
            good: self.good.to_string(),
            fair: self.fair.to_string(),
        })
    }

    fn verdict(&self, age: f64, ttl: Duration) -> Verdict {
        let ttl = ttl.as_secs_f64();
        let ratio = if ttl > 0.0 {
            age / ttl
        } else if age > 0.0 {
            f64::INFINITY
        } else {
            0.0
        };

        if ratio < self.excellent {
            Verdict::Excellent
        } else if ratio < self.good {
            Verdict::Good
        } else if ratio < self.fair {
            Verdict::Fair
        } else {
            Verdict::Poor
        }
    }
}

/// A problem spotted while scoring.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "detail", rename_all = "snake_case")]
pub enum QualityIssue {
    MissingField(String),
    NullField(String),
    ErrorReported(String),
    NotAnObject,
}

impl Display for QualityIssue {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::MissingField(field) => write!(f, "missing field '{field}'"),
            Self::NullField(field) => write!(f, "field '{field}' is empty"),
            Self::ErrorReported(message) => write!(f, "payload reports an error: {message}"),
            Self::NotAnObject => f.write_str("payload is not a JSON object"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QualityScore {
    pub completeness: f64,
    pub freshness_seconds: f64,
    pub verdict: Verdict,
    pub issues: Vec<QualityIssue>,
    #[serde(with = "time::serde::rfc3339")]
    pub scored_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct QualityValidator {
    bands: FreshnessBands,
}

impl QualityValidator {
    pub fn new(bands: FreshnessBands) -> Self {
        Self { bands }
    }

    pub const fn bands(&self) -> FreshnessBands {
        self.bands
    }

    pub fn score(
        &self,
        payload: &Payload,
        fetched_at: OffsetDateTime,
        schema: &DeclaredSchema,
    ) -> QualityScore {
        self.score_at(payload, fetched_at, schema, OffsetDateTime::now_utc())
    }

    /// Scores against an explicit clock reading.
    pub fn score_at(
        &self,
        payload: &Payload,
        fetched_at: OffsetDateTime,
        schema: &DeclaredSchema,
        now: OffsetDateTime,
    ) -> QualityScore {
        let mut issues = Vec::new();
        let object = payload.as_object();
        if object.is_none() {
            issues.push(QualityIssue::NotAnObject);
        }

        let mut present = 0usize;
        for field in &schema.fields {
            match object.and_then(|map| map.get(field)) {
                None => issues.push(QualityIssue::MissingField(field.clone())),
                Some(value) if is_blank(value) => issues.push(QualityIssue::NullField(field.clone())),
                Some(_) => present += 1,
            }
        }
        let completeness = if schema.fields.is_empty() {
            1.0
        } else {
            present as f64 / schema.fields.len() as f64
        };

        let freshness_seconds = (now - fetched_at).as_seconds_f64().max(0.0);
        let mut verdict = self
            .bands
            .verdict(freshness_seconds, schema.ttl)
            .max(Verdict::from_completeness(completeness));

        if let Some(error) = object.and_then(|map| map.get("error")).filter(|value| !is_blank(value)) {
            let message = error
                .as_str()
                .map_or_else(|| error.to_string(), ToOwned::to_owned);
            issues.push(QualityIssue::ErrorReported(message));
            verdict = Verdict::Poor;
        }

        QualityScore {
            completeness,
            freshness_seconds,
            verdict,
            issues,
            scored_at: now,
        }
    }
}

fn is_blank(value: &Payload) -> bool {
    match value {
        Payload::Null => true,
        Payload::String(text) => text.is_empty(),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> DeclaredSchema {
        DeclaredSchema::new(
            ["symbol", "price", "volume", "currency"],
            Duration::from_secs(400),
        )
    }

    fn at(seconds_ago: i64, now: OffsetDateTime) -> OffsetDateTime {
        now - time::Duration::seconds(seconds_ago)
    }

    #[test]
    fn complete_and_fresh_payload_is_excellent() {
        let now = OffsetDateTime::now_utc();
        let payload = json!({ "symbol": "AAPL", "price": 189.2, "volume": 1000, "currency": "USD" });

        let score = QualityValidator::default().score_at(&payload, at(10, now), &schema(), now);

        assert_eq!(score.completeness, 1.0);
        assert_eq!(score.freshness_seconds, 10.0);
        assert_eq!(score.verdict, Verdict::Excellent);
        assert!(score.issues.is_empty());
    }

    #[test]
    fn freshness_bands_are_fractions_of_ttl() {
        let now = OffsetDateTime::now_utc();
        let payload = json!({ "symbol": "AAPL", "price": 1, "volume": 1, "currency": "USD" });
        let validator = QualityValidator::default();
        let verdict = |age| validator.score_at(&payload, at(age, now), &schema(), now).verdict;

        assert_eq!(verdict(99), Verdict::Excellent);
        assert_eq!(verdict(100), Verdict::Good);
        assert_eq!(verdict(200), Verdict::Fair);
        assert_eq!(verdict(400), Verdict::Poor);
    }

    #[test]
    fn verdict_takes_the_worse_of_completeness_and_freshness() {
        let now = OffsetDateTime::now_utc();
        let payload = json!({ "symbol": "AAPL", "price": null, "volume": 1 });

        let score = QualityValidator::default().score_at(&payload, at(0, now), &schema(), now);

        assert_eq!(score.completeness, 0.5);
        assert_eq!(score.verdict, Verdict::Fair);
        assert_eq!(
            score.issues,
            vec![
                QualityIssue::NullField("price".into()),
                QualityIssue::MissingField("currency".into()),
            ]
        );
    }

    #[test]
    fn error_field_forces_poor() {
        let now = OffsetDateTime::now_utc();
        let payload = json!({ "symbol": "AAPL", "price": 1, "volume": 1, "currency": "USD", "error": "quota exceeded" });

        let score = QualityValidator::default().score_at(&payload, at(0, now), &schema(), now);

        assert_eq!(score.verdict, Verdict::Poor);
        assert_eq!(score.issues, vec![QualityIssue::ErrorReported("quota exceeded".into())]);
    }

    #[test]
    fn non_object_payload_has_nothing_present() {
        let now = OffsetDateTime::now_utc();

        let score = QualityValidator::default().score_at(&json!([1, 2]), at(0, now), &schema(), now);

        assert_eq!(score.completeness, 0.0);
        assert_eq!(score.verdict, Verdict::Poor);
        assert_eq!(score.issues[0], QualityIssue::NotAnObject);
    }

    #[test]
    fn bands_must_increase() {
        assert!(FreshnessBands::default().validate().is_ok());
        assert!(FreshnessBands {
            excellent: 0.5,
            good: 0.25,
            fair: 1.0,
        }
        .validate()
        .is_err());
        assert!(FreshnessBands {
            excellent: 0.25,
            good: 0.5,
            fair: 1.5,
        }
        .validate()
        .is_err());
    }
}
