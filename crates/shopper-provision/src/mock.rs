//! Scriptable in-memory adapter for tests (generalizes the stub-provider
//! idiom used for marketplaces this deployment does not talk to over HTTP).

use crate::{CreateInstanceRequest, Feature, InstanceInfo, InstanceStatus, ProviderAdapter, ProviderInstance};
use async_trait::async_trait;
use parking_lot::Mutex;
use shopper_proto::{format_offer_id, Offer, OfferFilter, ProviderError, LABEL_PREFIX};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

struct State {
    instances: HashMap<String, (ProviderInstance, InstanceStatus)>,
    next_create_error: Option<ProviderError>,
    next_status_error: Option<ProviderError>,
    next_destroy_error: Option<ProviderError>,
}

/// A [`ProviderAdapter`] whose behavior is scripted by the test rather than
/// hardcoded, so the same adapter can exercise both the happy path and
/// specific failure modes (stale inventory, rate limit, circuit-open).
pub struct MockAdapter {
    provider_name: String,
    offers: Vec<Offer>,
    features: Vec<Feature>,
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl MockAdapter {
    pub fn new(provider_name: impl Into<String>) -> Self {
        Self {
            provider_name: provider_name.into(),
            offers: Vec::new(),
            features: Vec::new(),
            state: Mutex::new(State { instances: HashMap::new(), next_create_error: None, next_status_error: None, next_destroy_error: None }),
            next_id: AtomicU64::new(1),
        }
    }

    /// Populate `count` synthetic offers, each a distinct location/gpu pair.
    pub fn with_offers(mut self, count: u32) -> Self {
        let fetched_at = chrono::Utc::now();
        for i in 0..count {
            let location_id = format!("{:08x}-0000-0000-0000-{:012x}", i, i);
            let offer = Offer {
                id: format_offer_id(&self.provider_name, &location_id, "RTX4090"),
                provider: self.provider_name.clone(),
                provider_internal_id: location_id.clone(),
                gpu_type: "RTX4090".to_string(),
                vram_gb: 24,
                gpu_count: 1,
                price_per_hour: 0.35,
                location: format!("loc-{i}"),
                reliability: 0.95,
                availability_confidence: 0.8,
                fetched_at,
            };
            self.offers.push(offer);
        }
        self
    }

    pub fn with_feature(mut self, feature: Feature) -> Self {
        self.features.push(feature);
        self
    }

    /// The next `create_instance` call returns this error instead of
    /// succeeding.
    pub fn fail_next_create(&self, error: ProviderError) {
        self.state.lock().next_create_error = Some(error);
    }

    pub fn fail_next_status(&self, error: ProviderError) {
        self.state.lock().next_status_error = Some(error);
    }

    /// The next `destroy_instance` call returns this error instead of
    /// succeeding, leaving the instance in place.
    pub fn fail_next_destroy(&self, error: ProviderError) {
        self.state.lock().next_destroy_error = Some(error);
    }

    /// Force a provider-side instance into `status`, as if it had changed
    /// out from under the control plane (used to test reconciliation).
    pub fn set_instance_status(&self, instance_id: &str, status: InstanceStatus) {
        if let Some(entry) = self.state.lock().instances.get_mut(instance_id) {
            entry.1 = status;
        }
    }

    /// Inject an instance that exists on the provider but was never created
    /// through this adapter (a ghost/orphan for reconciliation tests).
    pub fn inject_instance(&self, id: &str, label: &str, status: InstanceStatus) {
        self.state.lock().instances.insert(
            id.to_string(),
            (ProviderInstance { id: id.to_string(), label: label.to_string(), status: status.status.clone(), tags: HashMap::new() }, status),
        );
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.provider_name
    }

    fn supports_feature(&self, feature: Feature) -> bool {
        self.features.contains(&feature)
    }

    async fn list_offers(&self, filter: &OfferFilter, _deadline: Option<Instant>) -> Result<Vec<Offer>, ProviderError> {
        Ok(self.offers.iter().filter(|o| filter.matches(o)).cloned().collect())
    }

    async fn list_all_instances(&self, _deadline: Option<Instant>) -> Result<Vec<ProviderInstance>, ProviderError> {
        Ok(self
            .state
            .lock()
            .instances
            .values()
            .filter(|(instance, _)| instance.label.starts_with(LABEL_PREFIX))
            .map(|(instance, _)| instance.clone())
            .collect())
    }

    async fn create_instance(&self, request: &CreateInstanceRequest, _deadline: Option<Instant>) -> Result<InstanceInfo, ProviderError> {
        if let Some(error) = self.state.lock().next_create_error.take() {
            return Err(error);
        }
        let id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let label = request.tags.get("label").cloned().unwrap_or_default();
        let status = InstanceStatus {
            status: "running".to_string(),
            running: true,
            ssh_host: "127.0.0.1".to_string(),
            ssh_port: 22,
            ssh_user: "root".to_string(),
            public_ip: Some("127.0.0.1".to_string()),
            port_mappings: HashMap::new(),
        };
        self.state
            .lock()
            .instances
            .insert(id.clone(), (ProviderInstance { id: id.clone(), label, status: status.status.clone(), tags: request.tags.clone() }, status));
        Ok(InstanceInfo { provider_id: id, status: "running".to_string() })
    }

    async fn get_instance_status(&self, instance_id: &str, _deadline: Option<Instant>) -> Result<InstanceStatus, ProviderError> {
        if let Some(error) = self.state.lock().next_status_error.take() {
            return Err(error);
        }
        self.state
            .lock()
            .instances
            .get(instance_id)
            .map(|(_, status)| status.clone())
            .ok_or_else(|| ProviderError::new(&self.provider_name, "get_instance_status", shopper_proto::ErrorKind::NotFound, "instance not found"))
    }

    async fn destroy_instance(&self, instance_id: &str, _deadline: Option<Instant>) -> Result<(), ProviderError> {
        if let Some(error) = self.state.lock().next_destroy_error.take() {
            return Err(error);
        }
        self.state.lock().instances.remove(instance_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_create_then_status_then_destroy() {
        let adapter = MockAdapter::new("tensordock").with_offers(1);
        let offer = &adapter.list_offers(&OfferFilter::default(), None).await.unwrap()[0];
        let request = CreateInstanceRequest { offer_id: offer.id.clone(), ssh_public_key: None, tags: HashMap::from([("label".to_string(), "shopper-sess-1".to_string())]) };

        let info = adapter.create_instance(&request, None).await.unwrap();
        let status = adapter.get_instance_status(&info.provider_id, None).await.unwrap();
        assert!(status.running);

        adapter.destroy_instance(&info.provider_id, None).await.unwrap();
        assert!(adapter.get_instance_status(&info.provider_id, None).await.is_err());
    }

    #[tokio::test]
    async fn test_destroy_unknown_instance_is_idempotent() {
        let adapter = MockAdapter::new("tensordock");
        assert!(adapter.destroy_instance("does-not-exist", None).await.is_ok());
    }

    #[tokio::test]
    async fn test_fail_next_create_returns_scripted_error() {
        let adapter = MockAdapter::new("tensordock");
        adapter.fail_next_create(ProviderError::new("tensordock", "create_instance", shopper_proto::ErrorKind::StaleInventory, "no available nodes"));
        let request = CreateInstanceRequest { offer_id: "tensordock-x-RTX4090".to_string(), ssh_public_key: None, tags: HashMap::new() };
        let result = adapter.create_instance(&request, None).await;
        assert_eq!(result.unwrap_err().kind, shopper_proto::ErrorKind::StaleInventory);
    }

    #[tokio::test]
    async fn test_list_all_instances_only_returns_labeled() {
        let adapter = MockAdapter::new("tensordock");
        adapter.inject_instance(
            "unrelated-1",
            "someone-elses-box",
            InstanceStatus { status: "running".to_string(), running: true, ..Default::default() },
        );
        assert!(adapter.list_all_instances(None).await.unwrap().is_empty());
    }
}
