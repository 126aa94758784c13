//! Vast.ai marketplace adapter (§4.1, §4.2).
//!
//! Same bearer-auth/JSON idiom as [`crate::tensordock`], but Vast.ai's API
//! shapes responses as flat top-level arrays rather than a `data` envelope
//! — the adapter boundary is exactly where that kind of per-provider
//! inconsistency should be absorbed.

use crate::redact::shell_quote_single;
use crate::{
    AdapterRuntime, AdapterRuntimeConfig, CreateInstanceRequest, Feature, InstanceInfo, InstanceStatus, ProviderAdapter,
    ProviderInstance,
};
use async_trait::async_trait;
use shopper_proto::{
    format_offer_id, is_stale_inventory, parse_offer_id, sanitize_error, validate_instance_id, validate_ssh_public_key, ErrorKind, Offer, OfferFilter,
    ProviderError, LABEL_PREFIX,
};
use std::collections::HashMap;
use std::time::{Duration, Instant};

const PROVIDER_NAME: &str = "vastai";

fn build_client() -> reqwest::Client {
    reqwest::Client::builder().timeout(Duration::from_secs(30)).build().expect("failed to build HTTP client")
}

pub struct VastAiAdapter {
    api_token: String,
    base_url: String,
    client: reqwest::Client,
    runtime: AdapterRuntime,
}

impl VastAiAdapter {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self::with_config(api_token, AdapterRuntimeConfig::default())
    }

    pub fn with_config(api_token: impl Into<String>, config: AdapterRuntimeConfig) -> Self {
        Self {
            api_token: api_token.into(),
            base_url: "https://console.vast.ai/api/v0".to_string(),
            client: build_client(),
            runtime: AdapterRuntime::new(PROVIDER_NAME, config),
        }
    }

    fn error_kind_for_status(status: u16) -> ErrorKind {
        match status {
            401 | 403 => ErrorKind::Auth,
            404 => ErrorKind::NotFound,
            429 => ErrorKind::RateLimit,
            400..=499 => ErrorKind::Validation,
            _ => ErrorKind::ServerError,
        }
    }

    fn err(&self, operation: &str, kind: ErrorKind, message: impl Into<String>) -> ProviderError {
        ProviderError::new(PROVIDER_NAME, operation, kind, sanitize_error(&message.into()))
    }
}

#[async_trait]
impl ProviderAdapter for VastAiAdapter {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn supports_feature(&self, feature: Feature) -> bool {
        matches!(feature, Feature::SpotPricing)
    }

    async fn list_offers(&self, filter: &OfferFilter, deadline: Option<Instant>) -> Result<Vec<Offer>, ProviderError> {
        let location_stats = &self.runtime.location_stats;
        self.runtime
            .execute("list_offers", deadline, || async {
                let url = format!("{}/bundles?api_key={}", self.base_url, self.api_token);
                let resp = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| self.err("list_offers", ErrorKind::Network, e.to_string()))?;

                let status = resp.status();
                let body: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| self.err("list_offers", ErrorKind::ServerError, e.to_string()))?;
                if !status.is_success() {
                    return Err(self.err("list_offers", Self::error_kind_for_status(status.as_u16()), body.to_string()));
                }

                let Some(raw_offers) = body.get("offers").and_then(|v| v.as_array()) else {
                    return Ok(Vec::new());
                };

                let fetched_at = chrono::Utc::now();
                let mut offers = Vec::new();
                for raw in raw_offers {
                    let Some(machine_id) = raw.get("machine_id").and_then(|v| v.as_u64()) else { continue };
                    let location_id = machine_id.to_string();
                    let Some(gpu_type) = raw.get("gpu_name").and_then(|v| v.as_str()) else { continue };
                    let vram_gb = raw.get("gpu_ram_gb").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                    let gpu_count = raw.get("num_gpus").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
                    let price_per_hour = raw.get("dph_total").and_then(|v| v.as_f64()).unwrap_or(0.0);
                    let location = raw.get("geolocation").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
                    let reliability = raw.get("reliability2").and_then(|v| v.as_f64()).unwrap_or(0.9);

                    let offer = Offer {
                        id: format_offer_id(PROVIDER_NAME, &location_id, gpu_type),
                        provider: PROVIDER_NAME.to_string(),
                        provider_internal_id: location_id.clone(),
                        gpu_type: gpu_type.to_string(),
                        vram_gb,
                        gpu_count,
                        price_per_hour,
                        location,
                        reliability,
                        availability_confidence: location_stats.confidence(&location_id),
                        fetched_at,
                    };
                    if filter.matches(&offer) {
                        offers.push(offer);
                    }
                }
                Ok(offers)
            })
            .await
    }

    async fn list_all_instances(&self, deadline: Option<Instant>) -> Result<Vec<ProviderInstance>, ProviderError> {
        self.runtime
            .execute("list_all_instances", deadline, || async {
                let url = format!("{}/instances?api_key={}", self.base_url, self.api_token);
                let resp = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| self.err("list_all_instances", ErrorKind::Network, e.to_string()))?;

                let status = resp.status();
                let body: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| self.err("list_all_instances", ErrorKind::ServerError, e.to_string()))?;
                if !status.is_success() {
                    return Err(self.err("list_all_instances", Self::error_kind_for_status(status.as_u16()), body.to_string()));
                }

                let Some(raw) = body.get("instances").and_then(|v| v.as_array()) else {
                    return Ok(Vec::new());
                };
                let mut instances = Vec::new();
                for item in raw {
                    let Some(id) = item.get("id").and_then(|v| v.as_u64()) else { continue };
                    let label = item.get("label").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    if !label.starts_with(LABEL_PREFIX) {
                        continue;
                    }
                    let status = item.get("actual_status").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
                    instances.push(ProviderInstance { id: id.to_string(), label, status, tags: HashMap::new() });
                }
                Ok(instances)
            })
            .await
    }

    async fn create_instance(&self, request: &CreateInstanceRequest, deadline: Option<Instant>) -> Result<InstanceInfo, ProviderError> {
        let (location_id, gpu_name) = parse_offer_id(PROVIDER_NAME, &request.offer_id)
            .map_err(|e| self.err("create_instance", ErrorKind::Validation, e.to_string()))?;
        if let Some(key) = request.ssh_public_key.as_deref() {
            if !validate_ssh_public_key(key) {
                return Err(self.err("create_instance", ErrorKind::Validation, "ssh public key is not a valid authorized_keys line"));
            }
        }

        let result = self
            .runtime
            .execute("create_instance", deadline, || async {
                let onstart = request
                    .ssh_public_key
                    .as_deref()
                    .map(|k| format!("mkdir -p ~/.ssh && echo '{}' >> ~/.ssh/authorized_keys", shell_quote_single(k)))
                    .unwrap_or_default();

                let body = serde_json::json!({
                    "client_id": "me",
                    "gpu_name": gpu_name,
                    "onstart": onstart,
                    "label": request.tags.get("label").cloned().unwrap_or_default(),
                });

                let url = format!("{}/asks/{}/?api_key={}", self.base_url, location_id, self.api_token);
                let resp = self
                    .client
                    .put(&url)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| self.err("create_instance", ErrorKind::Network, e.to_string()))?;

                let status = resp.status();
                let parsed: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| self.err("create_instance", ErrorKind::ServerError, e.to_string()))?;

                let success = parsed.get("success").and_then(|v| v.as_bool()).unwrap_or(status.is_success());
                if !status.is_success() || !success {
                    let message = parsed.get("msg").and_then(|v| v.as_str()).unwrap_or("create_instance failed").to_string();
                    let kind = if is_stale_inventory(&message) {
                        ErrorKind::StaleInventory
                    } else {
                        Self::error_kind_for_status(status.as_u16())
                    };
                    return Err(self.err("create_instance", kind, message));
                }

                let provider_id = parsed
                    .get("new_contract")
                    .and_then(|v| v.as_u64())
                    .ok_or_else(|| self.err("create_instance", ErrorKind::ServerError, "missing new_contract in response"))?
                    .to_string();

                Ok(InstanceInfo { provider_id, status: "provisioning".to_string() })
            })
            .await;

        self.runtime.location_stats.record(&location_id, result.is_ok());
        result
    }

    async fn get_instance_status(&self, instance_id: &str, deadline: Option<Instant>) -> Result<InstanceStatus, ProviderError> {
        if !validate_instance_id(instance_id) {
            return Err(self.err("get_instance_status", ErrorKind::Validation, "invalid instance id"));
        }
        self.runtime
            .execute("get_instance_status", deadline, || async {
                let url = format!("{}/instances/{}/?api_key={}", self.base_url, instance_id, self.api_token);
                let resp = self
                    .client
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| self.err("get_instance_status", ErrorKind::Network, e.to_string()))?;

                let status = resp.status();
                if status.as_u16() == 404 {
                    return Err(self.err("get_instance_status", ErrorKind::NotFound, "instance not found"));
                }
                let body: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| self.err("get_instance_status", ErrorKind::ServerError, e.to_string()))?;
                if !status.is_success() {
                    return Err(self.err("get_instance_status", Self::error_kind_for_status(status.as_u16()), body.to_string()));
                }

                let instance = body.get("instances").unwrap_or(&body);
                let status_str = instance.get("actual_status").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
                let running = status_str == "running";
                let public_ip = instance.get("public_ipaddr").and_then(|v| v.as_str()).map(String::from);
                let ssh_port = instance.get("ssh_port").and_then(|v| v.as_u64()).unwrap_or(22) as u16;

                let mut port_mappings = HashMap::new();
                port_mappings.insert(22u16, ssh_port);

                Ok(InstanceStatus {
                    status: status_str,
                    running,
                    ssh_host: public_ip.clone().unwrap_or_default(),
                    ssh_port,
                    ssh_user: "root".to_string(),
                    public_ip,
                    port_mappings,
                })
            })
            .await
    }

    async fn destroy_instance(&self, instance_id: &str, deadline: Option<Instant>) -> Result<(), ProviderError> {
        if !validate_instance_id(instance_id) {
            return Err(self.err("destroy_instance", ErrorKind::Validation, "invalid instance id"));
        }
        self.runtime
            .execute("destroy_instance", deadline, || async {
                let url = format!("{}/instances/{}/?api_key={}", self.base_url, instance_id, self.api_token);
                let resp = self
                    .client
                    .delete(&url)
                    .send()
                    .await
                    .map_err(|e| self.err("destroy_instance", ErrorKind::Network, e.to_string()))?;

                let status = resp.status();
                if status.is_success() || status.as_u16() == 404 {
                    return Ok(());
                }
                let body = resp.text().await.unwrap_or_default();
                Err(self.err("destroy_instance", Self::error_kind_for_status(status.as_u16()), body))
            })
            .await
    }
}
