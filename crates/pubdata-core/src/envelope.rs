use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::cache::CacheSource;
use crate::cache_key::CacheKey;
use crate::quality::{QualityScore, Verdict};

/// Response envelope returned by [`ResilientPipeline::execute_enveloped`](crate::ResilientPipeline::execute_enveloped).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope<T> {
    pub meta: EnvelopeMeta,
    pub data: T,
}

impl<T> Envelope<T> {
    pub fn new(meta: EnvelopeMeta, data: T) -> Self {
        Self { meta, data }
    }

    pub fn was_cached(&self) -> bool {
        self.meta.cache_hit
    }
}

/// Call metadata attached to every envelope.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvelopeMeta {
    pub call_id: Uuid,
    pub resource_key: String,
    pub cache_key: String,
    pub source: CacheSource,
    pub cache_hit: bool,
    pub latency_ms: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub generated_at: OffsetDateTime,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub quality: Option<QualityScore>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl EnvelopeMeta {
    pub fn new(
        resource_key: impl Into<String>,
        cache_key: &CacheKey,
        source: CacheSource,
        fetched_at: OffsetDateTime,
        latency_ms: u64,
    ) -> Self {
        Self {
            call_id: Uuid::new_v4(),
            resource_key: resource_key.into(),
            cache_key: cache_key.as_str().to_owned(),
            source,
            cache_hit: matches!(source, CacheSource::Local | CacheSource::Distributed),
            latency_ms,
            fetched_at,
            generated_at: OffsetDateTime::now_utc(),
            quality: None,
            warnings: Vec::new(),
        }
    }

    /// Attaches a quality score; a poor verdict also lands in `warnings`.
    pub fn with_quality(mut self, score: QualityScore) -> Self {
        if score.verdict == Verdict::Poor {
            let reasons = score
                .issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            self.push_warning(if reasons.is_empty() {
                String::from("data quality is poor: stale payload")
            } else {
                format!("data quality is poor: {reasons}")
            });
        }
        self.quality = Some(score);
        self
    }

    pub fn push_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::quality::QualityIssue;
    use serde_json::json;

    fn key() -> CacheKey {
        CacheKey::builder("scientific", "apod").build().unwrap()
    }

    #[test]
    fn serializes_meta_with_rfc3339_timestamps() {
        let fetched_at = OffsetDateTime::UNIX_EPOCH;
        let envelope = Envelope::new(
            EnvelopeMeta::new("api.nasa.gov", &key(), CacheSource::Local, fetched_at, 3),
            json!({ "title": "M31" }),
        );

        let value = serde_json::to_value(&envelope).unwrap();

        assert!(envelope.was_cached());
        assert_eq!(value["meta"]["source"], "local");
        assert_eq!(value["meta"]["cache_key"], "scientific:apod:");
        assert_eq!(value["meta"]["fetched_at"], "1970-01-01T00:00:00Z");
        assert!(value["meta"].get("quality").is_none());
        assert!(value["meta"].get("warnings").is_none());
        assert_eq!(value["data"]["title"], "M31");
    }

    #[test]
    fn poor_quality_adds_a_warning() {
        let now = OffsetDateTime::now_utc();
        let meta = EnvelopeMeta::new("api.nasa.gov", &key(), CacheSource::Fetched, now, 120)
            .with_quality(QualityScore {
                completeness: 0.0,
                freshness_seconds: 0.0,
                verdict: Verdict::Poor,
                issues: vec![QualityIssue::MissingField("title".into())],
                scored_at: now,
            });

        assert!(!meta.cache_hit);
        assert_eq!(meta.warnings, vec!["data quality is poor: missing field 'title'"]);
        assert_ne!(meta.call_id, Uuid::nil());
    }
}
