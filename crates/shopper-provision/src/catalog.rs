//! Offer Catalog (C2): normalizes GPU display names across providers so the
//! uniform `OfferFilter` compares like against like regardless of how a
//! given marketplace spells its GPU names.

use regex::Regex;
use shopper_proto::Offer;
use std::sync::OnceLock;

fn vram_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)(\d+)\s*GB").unwrap())
}

fn pcie_suffix_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"(?i)\s*PCIe\s*\d+GB$").unwrap())
}

/// Strip vendor noise (`"NVIDIA "`, `"GeForce "`, `"Tesla "`) and any
/// trailing `" PCIe <n>GB"` suffix from a raw GPU display name.
pub fn normalize_gpu_name(raw: &str) -> String {
    let mut name = raw.to_string();
    for prefix in ["NVIDIA ", "GeForce ", "Tesla "] {
        if let Some(stripped) = name.strip_prefix(prefix) {
            name = stripped.to_string();
        }
    }
    name = pcie_suffix_pattern().replace(&name, "").to_string();
    name.trim().to_string()
}

/// Recover VRAM in GB from the first `\d+\s*GB` substring in a raw GPU
/// display name, case-insensitive. `None` if no such substring exists.
pub fn extract_vram_gb(raw: &str) -> Option<u32> {
    vram_pattern().captures(raw).and_then(|c| c.get(1)).and_then(|m| m.as_str().parse().ok())
}

/// Apply catalog normalization to an offer fetched from a provider:
/// clean up the display name, and fall back to a name-derived VRAM figure
/// when the provider didn't report one directly.
pub fn normalize_offer(mut offer: Offer) -> Offer {
    let original_name = offer.gpu_type.clone();
    offer.gpu_type = normalize_gpu_name(&original_name);
    if offer.vram_gb == 0 {
        if let Some(vram) = extract_vram_gb(&original_name) {
            offer.vram_gb = vram;
        }
    }
    offer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_strips_vendor_prefix() {
        assert_eq!(normalize_gpu_name("NVIDIA RTX 4090"), "RTX 4090");
        assert_eq!(normalize_gpu_name("GeForce RTX 3090"), "RTX 3090");
        assert_eq!(normalize_gpu_name("Tesla V100"), "V100");
    }

    #[test]
    fn test_normalize_strips_pcie_suffix() {
        assert_eq!(normalize_gpu_name("NVIDIA A100 PCIe 40GB"), "A100");
    }

    #[test]
    fn test_normalize_leaves_clean_name_unchanged() {
        assert_eq!(normalize_gpu_name("RTX4090"), "RTX4090");
    }

    #[test]
    fn test_extract_vram_from_display_name() {
        assert_eq!(extract_vram_gb("A100 PCIe 40GB"), Some(40));
        assert_eq!(extract_vram_gb("RTX 4090 24gb"), Some(24));
        assert_eq!(extract_vram_gb("RTX4090"), None);
    }

    #[test]
    fn test_normalize_offer_fills_in_missing_vram() {
        let offer = Offer {
            id: "tensordock-3fa85f64-5717-4562-b3fc-2c963f66afa6-A100".to_string(),
            provider: "tensordock".to_string(),
            provider_internal_id: "3fa85f64-5717-4562-b3fc-2c963f66afa6".to_string(),
            gpu_type: "NVIDIA A100 PCIe 40GB".to_string(),
            vram_gb: 0,
            gpu_count: 1,
            price_per_hour: 1.2,
            location: "us-east".to_string(),
            reliability: 0.9,
            availability_confidence: 0.5,
            fetched_at: chrono::Utc::now(),
        };
        let normalized = normalize_offer(offer);
        assert_eq!(normalized.gpu_type, "A100");
        assert_eq!(normalized.vram_gb, 40);
    }
}
