//! Usage metering: token extraction, per-request records, the append-only
//! daily store and the background writer task.

pub mod extract;
pub mod store;
pub mod writer;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Token counts
// ---------------------------------------------------------------------------

/// Token counters pulled out of an Anthropic response body.
///
/// Fields absent from the response default to zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_input_tokens: u64,
    #[serde(default)]
    pub cache_read_input_tokens: u64,
}

impl TokenUsage {
    /// Sum of all four counters.
    pub fn total(&self) -> u64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_input_tokens
            + self.cache_read_input_tokens
    }

    /// Whether every counter is zero.
    pub fn is_empty(&self) -> bool {
        self.total() == 0
    }
}

// ---------------------------------------------------------------------------
// Usage record
// ---------------------------------------------------------------------------

/// One immutable line in a tenant's daily usage file.
///
/// Written exactly once per proxied request, when the upstream response body
/// ends (normally or by disconnect). Costs are USD rounded to 6 decimals.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageRecord {
    pub request_id: String,
    pub tenant_id: String,
    /// ISO-8601 UTC.
    pub timestamp: String,
    pub model: String,
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_creation_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
    #[serde(default)]
    pub input_cost: f64,
    #[serde(default)]
    pub output_cost: f64,
    #[serde(default)]
    pub cache_creation_cost: f64,
    #[serde(default)]
    pub cache_read_cost: f64,
    #[serde(default)]
    pub total_cost: f64,
    /// Request duration in milliseconds.
    #[serde(default)]
    pub duration: u64,
    /// Status code sent to the client, or 0 if no header was written.
    #[serde(default)]
    pub status_code: u16,
    pub upstream_id: String,
    #[serde(default)]
    pub user_agent: String,
    #[serde(default, rename = "clientIP")]
    pub client_ip: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 50,
            cache_creation_input_tokens: 10,
            cache_read_input_tokens: 5,
        };
        assert_eq!(usage.total(), 165);
        assert!(!usage.is_empty());
        assert!(TokenUsage::default().is_empty());
    }

    #[test]
    fn test_usage_record_camel_case_fields() {
        let record = UsageRecord {
            request_id: "a1b2c3d4e5f60708".to_string(),
            tenant_id: "acme".to_string(),
            timestamp: "2025-06-01T12:00:00Z".to_string(),
            model: "claude-3-5-haiku-20241022".to_string(),
            input_tokens: 100,
            output_tokens: 50,
            cache_creation_tokens: 0,
            cache_read_tokens: 0,
            total_tokens: 150,
            input_cost: 0.00008,
            output_cost: 0.0002,
            cache_creation_cost: 0.0,
            cache_read_cost: 0.0,
            total_cost: 0.00028,
            duration: 420,
            status_code: 200,
            upstream_id: "primary".to_string(),
            user_agent: "anthropic-sdk".to_string(),
            client_ip: "10.0.0.1".to_string(),
        };

        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["requestId"], "a1b2c3d4e5f60708");
        assert_eq!(json["tenantId"], "acme");
        assert_eq!(json["inputTokens"], 100);
        assert_eq!(json["cacheCreationTokens"], 0);
        assert_eq!(json["statusCode"], 200);
        assert_eq!(json["clientIP"], "10.0.0.1");
    }

    #[test]
    fn test_usage_record_missing_fields_default() {
        // Aggregation must tolerate records written by older builds.
        let record: UsageRecord = serde_json::from_str(
            r#"{"requestId":"x","tenantId":"t","timestamp":"2025-06-01T00:00:00Z",
                "model":"m","upstreamId":"u"}"#,
        )
        .unwrap();
        assert_eq!(record.input_tokens, 0);
        assert_eq!(record.total_cost, 0.0);
        assert_eq!(record.status_code, 0);
    }
}
