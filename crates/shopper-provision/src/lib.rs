//! Provider adapter runtime for the GPU session shopper control plane.
//!
//! Each adapter wraps one external GPU marketplace API behind the uniform
//! [`ProviderAdapter`] capability set (§4.1). [`AdapterRuntime`] supplies the
//! shared request pipeline every adapter composes around its HTTP calls:
//! circuit breaking, rate limiting, and per-location availability scoring.

#![forbid(unsafe_code)]

pub mod catalog;
pub mod circuit;
pub mod location;
pub mod mock;
pub mod rate_limit;
pub mod redact;
pub mod tensordock;
pub mod vastai;

use async_trait::async_trait;
use circuit::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
use location::{LocationStats, LocationStatsConfig};
use rate_limit::RateLimiter;
use shopper_observe::Metrics;
use shopper_proto::{ErrorKind, Offer, OfferFilter, ProviderError};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

// ─── Capability set (§4.1) ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Feature {
    CustomImages,
    SpotPricing,
    LiveResize,
}

#[derive(Debug, Clone)]
pub struct ProviderInstance {
    pub id: String,
    pub label: String,
    pub status: String,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone, Default)]
pub struct CreateInstanceRequest {
    pub offer_id: String,
    pub ssh_public_key: Option<String>,
    pub tags: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct InstanceInfo {
    pub provider_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Default)]
pub struct InstanceStatus {
    pub status: String,
    pub running: bool,
    pub ssh_host: String,
    pub ssh_port: u16,
    pub ssh_user: String,
    pub public_ip: Option<String>,
    pub port_mappings: HashMap<u16, u16>,
}

impl InstanceStatus {
    /// External port mapped to internal 22, falling back to 22 (§4.1, §6.1).
    pub fn ssh_external_port(&self) -> u16 {
        self.port_mappings.get(&22).copied().unwrap_or(22)
    }
}

/// Uniform capability set every provider adapter implements (§4.1).
///
/// Every operation takes the caller's `deadline`: an absolute point beyond
/// which the operation must not still be running. Adapters compose it with
/// their own `operation_timeout()` and never extend a caller's earlier
/// deadline (§4.1 step 4, §5).
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    /// Stable identifier used in offer ids and persisted sessions.
    fn name(&self) -> &str;

    fn supports_feature(&self, feature: Feature) -> bool;

    async fn list_offers(&self, filter: &OfferFilter, deadline: Option<Instant>) -> Result<Vec<Offer>, ProviderError>;

    /// Only instances bearing this deployment's label prefix (§6.2).
    async fn list_all_instances(&self, deadline: Option<Instant>) -> Result<Vec<ProviderInstance>, ProviderError>;

    async fn create_instance(&self, request: &CreateInstanceRequest, deadline: Option<Instant>) -> Result<InstanceInfo, ProviderError>;

    async fn get_instance_status(&self, instance_id: &str, deadline: Option<Instant>) -> Result<InstanceStatus, ProviderError>;

    /// Idempotent: a not-found response is success.
    async fn destroy_instance(&self, instance_id: &str, deadline: Option<Instant>) -> Result<(), ProviderError>;
}

// ─── Shared adapter runtime (request pipeline, §4.1) ─────────────────────────

#[derive(Clone)]
pub struct AdapterRuntimeConfig {
    pub min_interval: Duration,
    pub circuit: CircuitBreakerConfig,
    pub location: LocationStatsConfig,
    /// Shared metrics sink (§6.4). Defaults to a private instance so
    /// callers that don't care about metrics don't need to thread one
    /// through; `shopper-cli` overrides this with the app-wide `Metrics`.
    pub metrics: Arc<Metrics>,
}

impl Default for AdapterRuntimeConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_secs(1),
            circuit: CircuitBreakerConfig::default(),
            location: LocationStatsConfig::default(),
            metrics: Arc::new(Metrics::new()),
        }
    }
}

/// Numeric encoding of circuit state for the `provider_circuit_breaker_state`
/// gauge (§6.4): `closed=0`, `half_open=1`, `open=2`.
fn circuit_state_value(state: CircuitState) -> i64 {
    match state {
        CircuitState::Closed => 0,
        CircuitState::HalfOpen => 1,
        CircuitState::Open => 2,
    }
}

/// Per-operation default timeouts (§4.1 step 4).
pub fn operation_timeout(operation: &str) -> Duration {
    if operation == "create_instance" {
        Duration::from_secs(60)
    } else {
        Duration::from_secs(30)
    }
}

/// Bundles the circuit breaker, rate limiter, and location stats one
/// adapter instance owns, and runs steps 2/3/6 of the request pipeline
/// around a caller-supplied HTTP exchange (step 5).
pub struct AdapterRuntime {
    provider: String,
    circuit: CircuitBreaker,
    rate_limiter: RateLimiter,
    pub location_stats: LocationStats,
    metrics: Arc<Metrics>,
}

impl AdapterRuntime {
    pub fn new(provider: impl Into<String>, config: AdapterRuntimeConfig) -> Self {
        Self {
            provider: provider.into(),
            circuit: CircuitBreaker::new(config.circuit),
            rate_limiter: RateLimiter::new(config.min_interval),
            location_stats: LocationStats::new(config.location),
            metrics: config.metrics,
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.circuit.state()
    }

    /// Gate, rate-limit, run `f`, and record the outcome to the circuit
    /// breaker. `f`'s error kind drives whether the failure counts.
    /// Stale-inventory and cancellation never count (§4.1, §5).
    ///
    /// `deadline` is the caller's absolute cutoff, if any. It is composed
    /// with `operation_timeout()` by taking whichever is sooner — a
    /// caller's deadline is never extended. A deadline that has already
    /// passed before dispatch short-circuits as `ErrorKind::Cancelled`
    /// without touching the circuit breaker.
    pub async fn execute<T, Fut>(&self, operation: &str, deadline: Option<Instant>, f: impl FnOnce() -> Fut) -> Result<T, ProviderError>
    where
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        if let Some(d) = deadline {
            if Instant::now() >= d {
                return Err(ProviderError::new(&self.provider, operation, ErrorKind::Cancelled, format!("{operation} cancelled: caller deadline already passed")));
            }
        }

        if let Err(backoff) = self.circuit.admit() {
            self.metrics.record_provider_api_call(&self.provider, operation, "circuit_open");
            self.metrics.set_circuit_breaker_state(&self.provider, circuit_state_value(self.circuit.state()));
            return Err(ProviderError::new(
                &self.provider,
                operation,
                ErrorKind::CircuitOpen,
                format!("circuit open for {}, retry after {:.1}s", self.provider, backoff.as_secs_f64()),
            ));
        }
        self.rate_limiter.acquire().await;

        let op_timeout = operation_timeout(operation);
        let (timeout, capped_by_deadline) = match deadline {
            Some(d) => {
                let remaining = d.saturating_duration_since(Instant::now());
                if remaining < op_timeout { (remaining, true) } else { (op_timeout, false) }
            }
            None => (op_timeout, false),
        };
        let started = Instant::now();
        let outcome = match tokio::time::timeout(timeout, f()).await {
            Ok(result) => result,
            Err(_) if capped_by_deadline => Err(ProviderError::new(
                &self.provider,
                operation,
                ErrorKind::Cancelled,
                format!("{operation} cancelled: caller deadline exceeded"),
            )),
            Err(_) => Err(ProviderError::new(
                &self.provider,
                operation,
                ErrorKind::Network,
                format!("{operation} timed out after {timeout:?}"),
            )),
        };
        self.metrics.observe_provider_api_response_time(&self.provider, operation, started.elapsed().as_secs_f64());

        match &outcome {
            Ok(_) => {
                self.circuit.record(None);
                self.metrics.record_provider_api_call(&self.provider, operation, "success");
            }
            Err(e) if e.kind == ErrorKind::Cancelled => {}
            Err(e) => {
                self.circuit.record(Some(e.kind));
                self.metrics.record_provider_api_call(&self.provider, operation, "error");
                self.metrics.record_provider_api_error(&self.provider, operation);
            }
        }
        self.metrics.set_circuit_breaker_state(&self.provider, circuit_state_value(self.circuit.state()));
        outcome
    }
}

// ─── Registry ─────────────────────────────────────────────────────────────────

pub struct ProviderRegistry {
    adapters: HashMap<String, Box<dyn ProviderAdapter>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self { adapters: HashMap::new() }
    }

    pub fn register(&mut self, adapter: Box<dyn ProviderAdapter>) {
        tracing::info!(name = adapter.name(), "registering provider adapter");
        self.adapters.insert(adapter.name().to_string(), adapter);
    }

    pub fn get(&self, name: &str) -> Option<&dyn ProviderAdapter> {
        self.adapters.get(name).map(|a| a.as_ref())
    }

    pub fn names(&self) -> Vec<&str> {
        self.adapters.keys().map(String::as_str).collect()
    }

    pub async fn list_all_offers(&self, filter: &OfferFilter) -> Vec<Offer> {
        let mut union = Vec::new();
        for (name, adapter) in &self.adapters {
            if let Some(ref wanted) = filter.provider {
                if !name.eq_ignore_ascii_case(wanted) {
                    continue;
                }
            }
            match adapter.list_offers(filter, None).await {
                Ok(offers) => union.extend(offers.into_iter().map(catalog::normalize_offer).filter(|o| filter.matches(o))),
                Err(e) => tracing::warn!(provider = name, error = %e, "list_offers failed"),
            }
        }
        union
    }
}

impl Default for ProviderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockAdapter;

    #[tokio::test]
    async fn test_registry_register_and_get() {
        let mut registry = ProviderRegistry::new();
        registry.register(Box::new(MockAdapter::new("tensordock")));
        assert!(registry.get("tensordock").is_some());
        assert!(registry.get("vastai").is_none());
    }

    #[tokio::test]
    async fn test_registry_list_all_offers_unions_adapters() {
        let mut registry = ProviderRegistry::new();
        registry.register(Box::new(MockAdapter::new("tensordock").with_offers(2)));
        registry.register(Box::new(MockAdapter::new("vastai").with_offers(3)));
        let offers = registry.list_all_offers(&OfferFilter::default()).await;
        assert_eq!(offers.len(), 5);
    }

    #[tokio::test]
    async fn test_registry_list_all_offers_filters_by_provider() {
        let mut registry = ProviderRegistry::new();
        registry.register(Box::new(MockAdapter::new("tensordock").with_offers(2)));
        registry.register(Box::new(MockAdapter::new("vastai").with_offers(3)));
        let filter = OfferFilter { provider: Some("vastai".to_string()), ..Default::default() };
        let offers = registry.list_all_offers(&filter).await;
        assert_eq!(offers.len(), 3);
    }

    #[test]
    fn test_instance_status_ssh_port_fallback() {
        let status = InstanceStatus::default();
        assert_eq!(status.ssh_external_port(), 22);

        let mut mapped = InstanceStatus::default();
        mapped.port_mappings.insert(22, 40022);
        assert_eq!(mapped.ssh_external_port(), 40022);
    }

    #[test]
    fn test_operation_timeout_defaults() {
        assert_eq!(operation_timeout("create_instance"), Duration::from_secs(60));
        assert_eq!(operation_timeout("destroy_instance"), Duration::from_secs(30));
        assert_eq!(operation_timeout("list_offers"), Duration::from_secs(30));
    }

    #[tokio::test]
    async fn test_adapter_runtime_opens_circuit_after_failures() {
        let runtime = AdapterRuntime::new(
            "tensordock",
            AdapterRuntimeConfig { circuit: CircuitBreakerConfig { failure_threshold: 2, ..Default::default() }, ..Default::default() },
        );
        for _ in 0..2 {
            let result: Result<(), ProviderError> = runtime
                .execute("create_instance", None, || async { Err(ProviderError::new("tensordock", "create_instance", ErrorKind::ServerError, "boom")) })
                .await;
            assert!(result.is_err());
        }
        let result: Result<(), ProviderError> = runtime.execute("create_instance", None, || async { Ok(()) }).await;
        assert_eq!(result.unwrap_err().kind, ErrorKind::CircuitOpen);
    }

    #[tokio::test]
    async fn test_adapter_runtime_stale_inventory_does_not_open_circuit() {
        let runtime = AdapterRuntime::new(
            "tensordock",
            AdapterRuntimeConfig { circuit: CircuitBreakerConfig { failure_threshold: 1, ..Default::default() }, ..Default::default() },
        );
        for _ in 0..5 {
            let _: Result<(), ProviderError> = runtime
                .execute("create_instance", None, || async { Err(ProviderError::new("tensordock", "create_instance", ErrorKind::StaleInventory, "no available nodes")) })
                .await;
        }
        assert_eq!(runtime.circuit_state(), CircuitState::Closed);
    }
}
