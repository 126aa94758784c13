//! Shared domain types for the GPU session shopper control plane.
//!
//! Defines the [`Session`]/[`CostRecord`] data model, the provider error
//! taxonomy, and the small set of pure codecs (offer ids, instance labels)
//! that must round-trip exactly — see [`format_offer_id`]/[`parse_offer_id`]
//! and [`format_label`]/[`parse_label`].

#![forbid(unsafe_code)]

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ─── Session ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Pending,
    Provisioning,
    Running,
    Stopping,
    Stopped,
    Failed,
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Provisioning => write!(f, "provisioning"),
            Self::Running => write!(f, "running"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

impl SessionStatus {
    /// Terminal statuses never transition forward again (I4).
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Stopped | Self::Failed)
    }

    /// Statuses counted as "active" for uniqueness (I1) and gauge purposes.
    pub fn is_active(self) -> bool {
        matches!(self, Self::Pending | Self::Provisioning | Self::Running)
    }
}

/// A reserved GPU instance lease.
///
/// Field semantics and invariants (I1-I5) are documented on the owning
/// store, not here — this type is a plain record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    pub id: String,
    pub consumer_id: String,
    pub provider: String,
    pub provider_id: String,
    pub offer_id: String,
    pub gpu_type: String,
    pub gpu_count: u32,
    pub price_per_hour: f64,
    pub workload_type: String,
    pub storage_policy: String,
    pub status: SessionStatus,
    pub reservation_hours: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub hard_max_override: bool,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub error: String,
}

impl Session {
    /// Age of the session relative to `now`.
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - self.created_at
    }
}

/// A single hourly billing entry. `(session_id, hour_bucket)` is the
/// dedup key (I6) — see `shopper-persist::CostStore::record`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: String,
    pub session_id: String,
    pub consumer_id: String,
    pub provider: String,
    pub gpu_type: String,
    pub hour_bucket: DateTime<Utc>,
    pub amount: f64,
    pub currency: String,
}

/// Aggregate cost breakdown for a billing query.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostSummary {
    pub total: f64,
    pub session_count: u64,
    pub row_count: u64,
    pub by_provider: Vec<(String, f64)>,
    pub by_gpu_type: Vec<(String, f64)>,
}

// ─── Offer (transient, never persisted) ──────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub provider: String,
    pub provider_internal_id: String,
    pub gpu_type: String,
    pub vram_gb: u32,
    pub gpu_count: u32,
    pub price_per_hour: f64,
    pub location: String,
    pub reliability: f64,
    pub availability_confidence: f64,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct OfferFilter {
    pub min_vram: Option<u32>,
    pub max_price: Option<f64>,
    pub gpu_type: Option<String>,
    pub min_gpu_count: Option<u32>,
    pub provider: Option<String>,
}

impl OfferFilter {
    pub fn matches(&self, offer: &Offer) -> bool {
        if let Some(min_vram) = self.min_vram {
            if offer.vram_gb < min_vram {
                return false;
            }
        }
        if let Some(max_price) = self.max_price {
            if offer.price_per_hour > max_price {
                return false;
            }
        }
        if let Some(ref gpu_type) = self.gpu_type {
            if !offer.gpu_type.eq_ignore_ascii_case(gpu_type) {
                return false;
            }
        }
        if let Some(min_gpu_count) = self.min_gpu_count {
            if offer.gpu_count < min_gpu_count {
                return false;
            }
        }
        if let Some(ref provider) = self.provider {
            if !offer.provider.eq_ignore_ascii_case(provider) {
                return false;
            }
        }
        true
    }
}

// ─── Provider error taxonomy (§7) ────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Auth,
    NotFound,
    RateLimit,
    ServerError,
    Network,
    StaleInventory,
    CircuitOpen,
    Cancelled,
    TerminalState,
    HardMaxExceeded,
}

impl ErrorKind {
    /// Whether an operation that failed with this kind may be retried at all.
    pub fn is_retryable(self) -> bool {
        matches!(
            self,
            Self::RateLimit | Self::ServerError | Self::Network | Self::StaleInventory | Self::CircuitOpen
        )
    }

    /// Whether a failure of this kind counts toward the circuit breaker's
    /// consecutive-failure counter (§4.1).
    pub fn counts_for_circuit_breaker(self) -> bool {
        matches!(self, Self::RateLimit | Self::ServerError | Self::Network)
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Validation => "validation",
            Self::Auth => "auth",
            Self::NotFound => "not_found",
            Self::RateLimit => "rate_limit",
            Self::ServerError => "server_error",
            Self::Network => "network",
            Self::StaleInventory => "stale_inventory",
            Self::CircuitOpen => "circuit_open",
            Self::Cancelled => "cancelled",
            Self::TerminalState => "terminal_state",
            Self::HardMaxExceeded => "hard_max_exceeded",
        };
        write!(f, "{s}")
    }
}

/// A classified failure from a provider adapter operation.
#[derive(Debug, Clone, thiserror::Error, Serialize, Deserialize)]
#[error("{provider}:{operation} failed ({kind}): {message}")]
pub struct ProviderError {
    pub provider: String,
    pub operation: String,
    pub status_code: Option<u16>,
    pub message: String,
    pub kind: ErrorKind,
}

impl ProviderError {
    pub fn new(provider: impl Into<String>, operation: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            provider: provider.into(),
            operation: operation.into(),
            status_code: None,
            message: message.into(),
            kind,
        }
    }

    pub fn with_status(mut self, status_code: u16) -> Self {
        self.status_code = Some(status_code);
        self
    }
}

/// Sanitize an error message for persistence to `session.error`: truncate
/// at 1000 chars with a `"… [truncated]"` suffix, strip newlines so the
/// string can't forge additional log lines.
pub fn sanitize_error(message: &str) -> String {
    let flattened: String = message.chars().map(|c| if c == '\n' || c == '\r' { ' ' } else { c }).collect();
    if flattened.chars().count() <= 1000 {
        return flattened;
    }
    let truncated: String = flattened.chars().take(1000).collect();
    format!("{truncated}… [truncated]")
}

/// Documented case-insensitive substring patterns that classify a creation
/// failure as stale inventory rather than a hard provider error (§4.1).
pub const STALE_INVENTORY_PATTERNS: &[&str] = &[
    "no available nodes",
    "insufficient capacity",
    "out of stock",
    "resource unavailable",
    "gpu unavailable",
    "sold out",
    "quota exceeded",
    "no available public ip",
];

/// Classify a creation-failure message as stale inventory.
pub fn is_stale_inventory(message: &str) -> bool {
    let lower = message.to_lowercase();
    STALE_INVENTORY_PATTERNS.iter().any(|pattern| lower.contains(pattern))
}

// ─── Validation ───────────────────────────────────────────────────────────────

/// Validate a provider instance id: nonempty, ≤128 chars, and free of path
/// traversal / path-separator sequences (raw or percent-encoded).
pub fn validate_instance_id(id: &str) -> bool {
    if id.is_empty() || id.len() > 128 {
        return false;
    }
    let lower = id.to_lowercase();
    !(id.contains('/') || id.contains('\\') || lower.contains("%2f") || lower.contains("%5c"))
}

/// Validate a consumer/tenant id.
pub fn validate_account_id(id: &str) -> bool {
    !id.is_empty() && id.len() <= 64
}

/// Validate that a string is plausibly a single `authorized_keys` line:
/// one of the recognized key-type prefixes, followed by a non-empty
/// base64 body.
pub fn validate_ssh_public_key(key: &str) -> bool {
    let key = key.trim();
    let mut parts = key.split_whitespace();
    let Some(key_type) = parts.next() else {
        return false;
    };
    let recognized = matches!(
        key_type,
        "ssh-rsa" | "ssh-ed25519" | "ecdsa-sha2-nistp256" | "ecdsa-sha2-nistp384" | "ecdsa-sha2-nistp521"
    );
    let Some(body) = parts.next() else {
        return false;
    };
    recognized && !body.is_empty()
}

// ─── Offer-id codec (P4) ──────────────────────────────────────────────────────

#[derive(Debug, Clone, thiserror::Error)]
pub enum OfferIdError {
    #[error("offer id is missing the provider prefix")]
    MissingPrefix,
    #[error("offer id has the wrong provider prefix: expected {expected}")]
    WrongPrefix { expected: String },
    #[error("offer id is too short: expected a 36-char location uuid plus a non-empty gpu name, e.g. \"{provider}-3fa85f64-5717-4562-b3fc-2c963f66afa6-RTX4090\"")]
    TooShort { provider: String },
}

/// Build a reversible offer id: `provider-location_id-gpu_name`.
pub fn format_offer_id(provider: &str, location_id: &str, gpu_name: &str) -> String {
    format!("{provider}-{location_id}-{gpu_name}")
}

/// Recover `(location_id, gpu_name)` from an offer id built by
/// [`format_offer_id`] for the given `provider`. See (P4).
pub fn parse_offer_id(provider: &str, offer_id: &str) -> Result<(String, String), OfferIdError> {
    let prefix = format!("{provider}-");
    if offer_id.len() < prefix.len() {
        return Err(OfferIdError::MissingPrefix);
    }
    if !offer_id.starts_with(&prefix) {
        return Err(OfferIdError::WrongPrefix { expected: provider.to_string() });
    }
    let rest = &offer_id[prefix.len()..];
    // 36-char UUID + '-' + at least one gpu-name char.
    const UUID_LEN: usize = 36;
    if rest.len() < UUID_LEN + 1 + 1 || rest.as_bytes().get(UUID_LEN) != Some(&b'-') {
        return Err(OfferIdError::TooShort { provider: provider.to_string() });
    }
    let location_id = &rest[..UUID_LEN];
    let gpu_name = &rest[UUID_LEN + 1..];
    if gpu_name.is_empty() {
        return Err(OfferIdError::TooShort { provider: provider.to_string() });
    }
    Ok((location_id.to_string(), gpu_name.to_string()))
}

// ─── Instance label codec (P5) ────────────────────────────────────────────────

pub const LABEL_PREFIX: &str = "shopper-";

/// Build the instance label this deployment tags every created instance
/// with, so reconciliation can distinguish ours from unrelated instances.
pub fn format_label(session_id: &str) -> String {
    format!("{LABEL_PREFIX}{session_id}")
}

/// Recover the session id from a label produced by [`format_label`].
/// Returns `None` on a wrong prefix or an empty session id (P5).
pub fn parse_label(label: &str) -> Option<String> {
    let session_id = label.strip_prefix(LABEL_PREFIX)?;
    if session_id.is_empty() {
        return None;
    }
    Some(session_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_instance_id() {
        assert!(validate_instance_id("i-abc123"));
        assert!(validate_instance_id("tensordock-inst-9f8e"));
        assert!(!validate_instance_id(""));
        assert!(!validate_instance_id("a/../b"));
        assert!(!validate_instance_id("a%2fb"));
        assert!(!validate_instance_id("a%5Cb"));
    }

    #[test]
    fn test_validate_account_id() {
        assert!(validate_account_id("consumer-1"));
        assert!(!validate_account_id(""));
        assert!(!validate_account_id(&"a".repeat(65)));
    }

    #[test]
    fn test_validate_ssh_public_key() {
        assert!(validate_ssh_public_key("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAI test@host"));
        assert!(!validate_ssh_public_key("not-a-key"));
        assert!(!validate_ssh_public_key("ssh-rsa"));
    }

    #[test]
    fn test_session_status_display_and_terminal() {
        assert_eq!(SessionStatus::Running.to_string(), "running");
        assert!(SessionStatus::Stopped.is_terminal());
        assert!(SessionStatus::Failed.is_terminal());
        assert!(!SessionStatus::Running.is_terminal());
        assert!(SessionStatus::Pending.is_active());
        assert!(!SessionStatus::Stopped.is_active());
    }

    #[test]
    fn test_sanitize_error_truncates_and_strips_newlines() {
        let long = "x".repeat(1200);
        let sanitized = sanitize_error(&long);
        assert!(sanitized.ends_with("… [truncated]"));
        assert_eq!(sanitized.chars().count(), 1000 + "… [truncated]".chars().count());

        let with_newlines = "line one\nline two\r\nline three";
        assert_eq!(sanitize_error(with_newlines), "line one line two  line three");
    }

    #[test]
    fn test_stale_inventory_classification() {
        assert!(is_stale_inventory("No available nodes found"));
        assert!(is_stale_inventory("Insufficient Capacity in region"));
        assert!(!is_stale_inventory("internal server error"));
    }

    #[test]
    fn test_error_kind_retry_and_circuit_rules() {
        assert!(ErrorKind::ServerError.is_retryable());
        assert!(ErrorKind::ServerError.counts_for_circuit_breaker());
        assert!(ErrorKind::StaleInventory.is_retryable());
        assert!(!ErrorKind::StaleInventory.counts_for_circuit_breaker());
        assert!(!ErrorKind::Cancelled.is_retryable());
        assert!(!ErrorKind::Cancelled.counts_for_circuit_breaker());
        assert!(!ErrorKind::NotFound.counts_for_circuit_breaker());
    }

    #[test]
    fn test_offer_id_roundtrip() {
        let location = "3fa85f64-5717-4562-b3fc-2c963f66afa6";
        let id = format_offer_id("tensordock", location, "RTX4090");
        let (parsed_location, parsed_gpu) = parse_offer_id("tensordock", &id).expect("parse");
        assert_eq!(parsed_location, location);
        assert_eq!(parsed_gpu, "RTX4090");
    }

    #[test]
    fn test_offer_id_rejects_wrong_prefix() {
        let location = "3fa85f64-5717-4562-b3fc-2c963f66afa6";
        let id = format_offer_id("vastai", location, "A100");
        assert!(matches!(parse_offer_id("tensordock", &id), Err(OfferIdError::WrongPrefix { .. })));
    }

    #[test]
    fn test_offer_id_rejects_too_short() {
        assert!(matches!(parse_offer_id("tensordock", "tensordock-shortid-RTX4090"), Err(OfferIdError::TooShort { .. })));
        assert!(matches!(
            parse_offer_id("tensordock", "tensordock-3fa85f64-5717-4562-b3fc-2c963f66afa6-"),
            Err(OfferIdError::TooShort { .. })
        ));
    }

    #[test]
    fn test_label_roundtrip() {
        let label = format_label("sess-abc123");
        let (sid, ok) = (parse_label(&label), true);
        assert_eq!(sid, Some("sess-abc123".to_string()));
        assert!(ok);
        assert_eq!(format_label(&sid.unwrap()), label);
    }

    #[test]
    fn test_label_rejects_wrong_prefix_and_empty_id() {
        assert_eq!(parse_label("other-sess-1"), None);
        assert_eq!(parse_label("shopper-"), None);
    }

    #[test]
    fn test_offer_filter_matches() {
        let offer = Offer {
            id: "x".to_string(),
            provider: "tensordock".to_string(),
            provider_internal_id: "loc-gpu".to_string(),
            gpu_type: "RTX4090".to_string(),
            vram_gb: 24,
            gpu_count: 1,
            price_per_hour: 0.40,
            location: "us-east".to_string(),
            reliability: 0.9,
            availability_confidence: 0.5,
            fetched_at: Utc::now(),
        };
        let filter = OfferFilter {
            min_vram: Some(16),
            max_price: Some(0.5),
            ..Default::default()
        };
        assert!(filter.matches(&offer));

        let too_expensive = OfferFilter {
            max_price: Some(0.1),
            ..Default::default()
        };
        assert!(!too_expensive.matches(&offer));
    }
}
