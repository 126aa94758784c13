//! TensorDock marketplace adapter (§4.1, §4.2).
//!
//! Mirrors the bearer-auth reqwest client and JSON-polling idiom the
//! original VPS adapters used against Hetzner, generalized to GPU
//! marketplace offers/instances and wrapped in [`AdapterRuntime`].

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

const PROVIDER_NAME: &str = "tensordock";

fn build_client() -> reqwest::Client {
    reqwest::Client::builder().timeout(Duration::from_secs(30)).build().expect("failed to build HTTP client")
}

pub struct TensorDockAdapter {
    api_token: String,
    base_url: String,
    client: reqwest::Client,
    runtime: AdapterRuntime,
}

impl TensorDockAdapter {
    pub fn new(api_token: impl Into<String>) -> Self {
        Self::with_config(api_token, AdapterRuntimeConfig::default())
    }

    pub fn with_config(api_token: impl Into<String>, config: AdapterRuntimeConfig) -> Self {
        Self {
            api_token: api_token.into(),
            base_url: "https://dashboard.tensordock.com/api/v2".to_string(),
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

    /// Response shapes vary between `{"data": [...]}` and
    /// `{"data": {"instances": [...]}}`; try both before giving up.
    fn extract_array<'a>(value: &'a serde_json::Value, nested_key: &str) -> Option<&'a Vec<serde_json::Value>> {
        if let Some(array) = value.get("data").and_then(|d| d.as_array()) {
            return Some(array);
        }
        value.get("data").and_then(|d| d.get(nested_key)).and_then(|v| v.as_array())
    }
}

#[async_trait]
impl ProviderAdapter for TensorDockAdapter {
    fn name(&self) -> &str {
        PROVIDER_NAME
    }

    fn supports_feature(&self, feature: Feature) -> bool {
        matches!(feature, Feature::CustomImages | Feature::SpotPricing)
    }

    async fn list_offers(&self, filter: &OfferFilter, deadline: Option<Instant>) -> Result<Vec<Offer>, ProviderError> {
        let location_stats = &self.runtime.location_stats;
        self.runtime
            .execute("list_offers", deadline, || async {
                let url = format!("{}/marketplace/hostnodes", self.base_url);
                let resp = self
                    .client
                    .get(&url)
                    .bearer_auth(&self.api_token)
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

                let Some(hostnodes) = Self::extract_array(&body, "hostnodes") else {
                    return Ok(Vec::new());
                };

                let fetched_at = chrono::Utc::now();
                let mut offers = Vec::new();
                for node in hostnodes {
                    let Some(location_id) = node.get("id").and_then(|v| v.as_str()) else { continue };
                    let location = node.get("location").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
                    let reliability = node.get("uptime_pct").and_then(|v| v.as_f64()).unwrap_or(0.9);

                    let Some(gpus) = node.get("gpu_types").and_then(|v| v.as_array()) else { continue };
                    for gpu in gpus {
                        let Some(gpu_type) = gpu.get("name").and_then(|v| v.as_str()) else { continue };
                        let vram_gb = gpu.get("vram_gb").and_then(|v| v.as_u64()).unwrap_or(0) as u32;
                        let gpu_count = gpu.get("available_count").and_then(|v| v.as_u64()).unwrap_or(1) as u32;
                        let price_per_hour = gpu.get("price_per_hour").and_then(|v| v.as_f64()).unwrap_or(0.0);

                        let offer = Offer {
                            id: format_offer_id(PROVIDER_NAME, location_id, gpu_type),
                            provider: PROVIDER_NAME.to_string(),
                            provider_internal_id: location_id.to_string(),
                            gpu_type: gpu_type.to_string(),
                            vram_gb,
                            gpu_count,
                            price_per_hour,
                            location: location.clone(),
                            reliability,
                            availability_confidence: location_stats.confidence(location_id),
                            fetched_at,
                        };
                        if filter.matches(&offer) {
                            offers.push(offer);
                        }
                    }
                }
                Ok(offers)
            })
            .await
    }

    async fn list_all_instances(&self, deadline: Option<Instant>) -> Result<Vec<ProviderInstance>, ProviderError> {
        self.runtime
            .execute("list_all_instances", deadline, || async {
                let url = format!("{}/instances", self.base_url);
                let resp = self
                    .client
                    .get(&url)
                    .bearer_auth(&self.api_token)
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

                let Some(raw) = Self::extract_array(&body, "instances") else {
                    return Ok(Vec::new());
                };
                let mut instances = Vec::new();
                for item in raw {
                    let Some(id) = item.get("id").and_then(|v| v.as_str()) else { continue };
                    let label = item.get("name").and_then(|v| v.as_str()).unwrap_or("").to_string();
                    if !label.starts_with(LABEL_PREFIX) {
                        continue;
                    }
                    let status = item.get("status").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
                    let tags = item
                        .get("tags")
                        .and_then(|v| v.as_object())
                        .map(|obj| obj.iter().filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_string()))).collect())
                        .unwrap_or_default();
                    instances.push(ProviderInstance { id: id.to_string(), label, status, tags });
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
                let key_fragment = request
                    .ssh_public_key
                    .as_deref()
                    .map(|k| format!("mkdir -p /root/.ssh && echo '{}' >> /root/.ssh/authorized_keys", shell_quote_single(k)))
                    .unwrap_or_default();
                let startup_script = format!("#!/bin/bash\nset -euo pipefail\n{key_fragment}\n");

                let body = serde_json::json!({
                    "hostnode_id": location_id,
                    "gpu_type": gpu_name,
                    "startup_script": startup_script,
                    "name": request.tags.get("label").cloned().unwrap_or_default(),
                });

                let resp = self
                    .client
                    .post(format!("{}/instances", self.base_url))
                    .bearer_auth(&self.api_token)
                    .json(&body)
                    .send()
                    .await
                    .map_err(|e| self.err("create_instance", ErrorKind::Network, e.to_string()))?;

                let status = resp.status();
                let parsed: serde_json::Value = resp
                    .json()
                    .await
                    .map_err(|e| self.err("create_instance", ErrorKind::ServerError, e.to_string()))?;

                // Some marketplace APIs report failures inside a 200 body rather
                // than via HTTP status; check both.
                let error_message = parsed.get("error").and_then(|v| v.as_str());
                if !status.is_success() || error_message.is_some() {
                    let message = error_message.unwrap_or(&parsed.to_string()).to_string();
                    let kind = if is_stale_inventory(&message) {
                        ErrorKind::StaleInventory
                    } else {
                        Self::error_kind_for_status(status.as_u16())
                    };
                    return Err(self.err("create_instance", kind, message));
                }

                let provider_id = parsed
                    .get("data")
                    .and_then(|d| d.get("id"))
                    .and_then(|v| v.as_str())
                    .ok_or_else(|| self.err("create_instance", ErrorKind::ServerError, "missing instance id in response"))?
                    .to_string();
                let status_str = parsed.get("data").and_then(|d| d.get("status")).and_then(|v| v.as_str()).unwrap_or("provisioning").to_string();

                Ok(InstanceInfo { provider_id, status: status_str })
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
                let url = format!("{}/instances/{}", self.base_url, instance_id);
                let resp = self
                    .client
                    .get(&url)
                    .bearer_auth(&self.api_token)
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

                let data = body.get("data").unwrap_or(&body);
                let status_str = data.get("status").and_then(|v| v.as_str()).unwrap_or("unknown").to_string();
                let running = status_str == "running";
                let public_ip = data.get("ip").and_then(|v| v.as_str()).map(String::from);

                let mut port_mappings = HashMap::new();
                if let Some(ports) = data.get("port_mappings").and_then(|v| v.as_object()) {
                    for (internal, external) in ports {
                        if let (Ok(internal), Some(external)) = (internal.parse::<u16>(), external.as_u64()) {
                            port_mappings.insert(internal, external as u16);
                        }
                    }
                }

                Ok(InstanceStatus {
                    status: status_str,
                    running,
                    ssh_host: public_ip.clone().unwrap_or_default(),
                    ssh_port: port_mappings.get(&22).copied().unwrap_or(22),
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
                let resp = self
                    .client
                    .delete(format!("{}/instances/{}", self.base_url, instance_id))
                    .bearer_auth(&self.api_token)
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
