use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;

const PROMPT_TOKEN_KEYS: &[&str] = &[
    "prompt_tokens",
    "input_tokens",
    "promptTokens",
    "inputTokens",
];
const COMPLETION_TOKEN_KEYS: &[&str] = &[
    "completion_tokens",
    "output_tokens",
    "completionTokens",
    "outputTokens",
];

/// Token counters as reported by a backend. Either counter may be absent,
/// several backends omit the usage block entirely while streaming.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RawUsage {
    pub prompt_tokens: Option<u64>,
    pub completion_tokens: Option<u64>,
}

impl RawUsage {
    pub fn new(prompt_tokens: Option<u64>, completion_tokens: Option<u64>) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
        }
    }

    /// Reads whichever naming the backend uses. Backend-supplied totals are ignored.
    pub fn from_value(value: &Value) -> Self {
        Self {
            prompt_tokens: first_counter(value, PROMPT_TOKEN_KEYS),
            completion_tokens: first_counter(value, COMPLETION_TOKEN_KEYS),
        }
    }

    /// Later payloads win counter by counter; a missing counter keeps the earlier value.
    pub fn merge(&mut self, other: RawUsage) {
        if other.prompt_tokens.is_some() {
            self.prompt_tokens = other.prompt_tokens;
        }
        if other.completion_tokens.is_some() {
            self.completion_tokens = other.completion_tokens;
        }
    }

    pub fn is_empty(&self) -> bool {
        self.prompt_tokens.is_none() && self.completion_tokens.is_none()
    }
}

fn first_counter(value: &Value, keys: &[&str]) -> Option<u64> {
    keys.iter()
        .find_map(|key| value.get(*key).and_then(Value::as_u64))
}

/// Uniform usage record. Totals are derived on every construction path,
/// including deserialization, so they can never disagree with their parts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "RecordedUsage")]
pub struct UsageStats {
    prompt_tokens: u64,
    completion_tokens: u64,
    total_tokens: u64,
    prompt_time: Duration,
    completion_time: Duration,
    total_time: Duration,
}

impl UsageStats {
    pub fn new(
        prompt_tokens: u64,
        completion_tokens: u64,
        prompt_time: Duration,
        completion_time: Duration,
    ) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens.saturating_add(completion_tokens),
            prompt_time,
            completion_time,
            total_time: prompt_time.saturating_add(completion_time),
        }
    }

    pub fn prompt_tokens(&self) -> u64 {
        self.prompt_tokens
    }

    pub fn completion_tokens(&self) -> u64 {
        self.completion_tokens
    }

    pub fn total_tokens(&self) -> u64 {
        self.total_tokens
    }

    pub fn prompt_time(&self) -> Duration {
        self.prompt_time
    }

    pub fn completion_time(&self) -> Duration {
        self.completion_time
    }

    pub fn total_time(&self) -> Duration {
        self.total_time
    }
}

#[derive(Deserialize)]
struct RecordedUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    prompt_time: Duration,
    #[serde(default)]
    completion_time: Duration,
}

impl From<RecordedUsage> for UsageStats {
    fn from(recorded: RecordedUsage) -> Self {
        UsageStats::new(
            recorded.prompt_tokens,
            recorded.completion_tokens,
            recorded.prompt_time,
            recorded.completion_time,
        )
    }
}

pub fn account(
    raw: &RawUsage,
    prompt_elapsed: Duration,
    completion_elapsed: Duration,
) -> UsageStats {
    UsageStats::new(
        raw.prompt_tokens.unwrap_or(0),
        raw.completion_tokens.unwrap_or(0),
        prompt_elapsed,
        completion_elapsed,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn account_recomputes_totals_from_parts() {
        let raw = RawUsage::from_value(&json!({
            "prompt_tokens": 12,
            "completion_tokens": 30,
            "total_tokens": 999,
        }));
        let usage = account(&raw, Duration::from_millis(40), Duration::from_millis(60));

        assert_eq!(usage.prompt_tokens(), 12);
        assert_eq!(usage.completion_tokens(), 30);
        assert_eq!(usage.total_tokens(), 42);
        assert_eq!(usage.total_time(), Duration::from_millis(100));
    }

    #[test]
    fn account_defaults_missing_counters_to_zero() {
        let usage = account(&RawUsage::default(), Duration::ZERO, Duration::ZERO);
        assert_eq!(usage, UsageStats::default());
        assert_eq!(usage.total_tokens(), 0);
        assert_eq!(usage.total_time(), Duration::ZERO);

        let partial = account(
            &RawUsage::from_value(&json!({ "output_tokens": 7 })),
            Duration::from_millis(5),
            Duration::ZERO,
        );
        assert_eq!(partial.prompt_tokens(), 0);
        assert_eq!(partial.total_tokens(), 7);
        assert_eq!(partial.total_time(), Duration::from_millis(5));
    }

    #[test]
    fn raw_usage_accepts_input_output_naming() {
        let raw = RawUsage::from_value(&json!({ "input_tokens": 3, "output_tokens": 4 }));
        assert_eq!(raw, RawUsage::new(Some(3), Some(4)));
    }

    #[test]
    fn merge_keeps_earlier_counters_when_later_payload_omits_them() {
        let mut raw = RawUsage::new(Some(10), None);
        raw.merge(RawUsage::new(None, Some(5)));
        assert_eq!(raw, RawUsage::new(Some(10), Some(5)));
        raw.merge(RawUsage::default());
        assert_eq!(raw, RawUsage::new(Some(10), Some(5)));
    }

    #[test]
    fn deserialized_usage_ignores_recorded_totals() {
        let usage: UsageStats = serde_json::from_value(json!({
            "prompt_tokens": 2,
            "completion_tokens": 3,
            "total_tokens": 100,
            "prompt_time": { "secs": 1, "nanos": 0 },
            "completion_time": { "secs": 2, "nanos": 0 },
            "total_time": { "secs": 0, "nanos": 0 },
        }))
        .expect("usage should deserialize");

        assert_eq!(usage.total_tokens(), 5);
        assert_eq!(usage.total_time(), Duration::from_secs(3));
    }
}
