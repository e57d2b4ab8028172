//! Alias to variant resolution.
//!
//! Pure function of (catalog snapshot, alias, hardware, explicit id): candidates
//! are filtered to tiers the host supports, then ranked by acceleration tier with
//! catalog publication order breaking ties.

use crate::catalog::{CatalogSnapshot, ModelVariant};
use crate::error::{LifecycleError, Result};
use crate::hardware::HardwareProfile;

pub fn select<'a>(
    catalog: &'a CatalogSnapshot,
    alias: &str,
    hardware: &HardwareProfile,
    explicit_variant_id: Option<&str>,
) -> Result<&'a ModelVariant> {
    let candidates = catalog.find_variants(alias);

    if let Some(variant_id) = explicit_variant_id {
        return candidates
            .into_iter()
            .find(|v| v.id == variant_id)
            .ok_or_else(|| LifecycleError::VariantNotFound {
                alias: alias.to_string(),
                variant_id: variant_id.to_string(),
            });
    }

    rank(candidates, hardware)
        .into_iter()
        .next()
        .ok_or_else(|| LifecycleError::NoCompatibleVariant {
            alias: alias.to_string(),
            hardware: hardware.tier.to_string(),
        })
}

/// Compatible candidates, best first. Stable sort keeps publication order on ties.
pub fn rank<'a>(
    candidates: Vec<&'a ModelVariant>,
    hardware: &HardwareProfile,
) -> Vec<&'a ModelVariant> {
    let mut compatible: Vec<&ModelVariant> = candidates
        .into_iter()
        .filter(|v| hardware.supports(v.hardware))
        .collect();
    compatible.sort_by_key(|v| v.hardware.rank());
    compatible
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{Catalog, BundledManifest, ContentHash, Manifest, ManifestFile};
    use crate::hardware::HardwareTier;
    use proptest::prelude::*;

    fn variant(id: &str, alias: &str, hardware: HardwareTier) -> ModelVariant {
        ModelVariant {
            id: id.to_string(),
            alias: alias.to_string(),
            hardware,
            execution_provider: String::new(),
            uri: Some("http://models.local".to_string()),
            files: vec![ManifestFile {
                path: "model.onnx".to_string(),
                hash: ContentHash::blake3(id.as_bytes()),
                size: 1,
                url: None,
            }],
        }
    }

    fn snapshot(variants: Vec<ModelVariant>) -> CatalogSnapshot {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("m.json");
        std::fs::write(&path, serde_json::to_vec(&Manifest { variants }).unwrap()).unwrap();
        let catalog = Catalog::new(vec![Box::new(BundledManifest::new(&path))], None);
        tokio_test::block_on(catalog.refresh()).unwrap()
    }

    #[test]
    fn test_cuda_host_prefers_cuda_variant() {
        let catalog = snapshot(vec![
            variant("phi-4-mini/cpu", "phi-4-mini", HardwareTier::Cpu),
            variant("phi-4-mini/cuda", "phi-4-mini", HardwareTier::Cuda),
        ]);
        let hw = HardwareProfile::for_tier(HardwareTier::Cuda);
        let chosen = select(&catalog, "phi-4-mini", &hw, None).unwrap();
        assert_eq!(chosen.id, "phi-4-mini/cuda");
    }

    #[test]
    fn test_cpu_host_never_gets_accelerated_variant() {
        let catalog = snapshot(vec![
            variant("phi/cuda", "phi", HardwareTier::Cuda),
            variant("phi/npu", "phi", HardwareTier::Npu),
            variant("phi/cpu", "phi", HardwareTier::Cpu),
        ]);
        let hw = HardwareProfile::for_tier(HardwareTier::Cpu);
        assert_eq!(select(&catalog, "phi", &hw, None).unwrap().id, "phi/cpu");
    }

    #[test]
    fn test_ties_broken_by_publication_order() {
        let catalog = snapshot(vec![
            variant("phi/cpu-int4", "phi", HardwareTier::Cpu),
            variant("phi/cpu-fp16", "phi", HardwareTier::Cpu),
        ]);
        let hw = HardwareProfile::for_tier(HardwareTier::Npu);
        assert_eq!(select(&catalog, "phi", &hw, None).unwrap().id, "phi/cpu-int4");
    }

    #[test]
    fn test_explicit_variant_returned_verbatim_even_if_not_preferred() {
        let catalog = snapshot(vec![
            variant("phi/cpu", "phi", HardwareTier::Cpu),
            variant("phi/cuda", "phi", HardwareTier::Cuda),
        ]);
        let hw = HardwareProfile::for_tier(HardwareTier::Cuda);
        assert_eq!(select(&catalog, "phi", &hw, Some("phi/cpu")).unwrap().id, "phi/cpu");
    }

    #[test]
    fn test_explicit_variant_under_other_alias_is_not_found() {
        let catalog = snapshot(vec![
            variant("phi/cpu", "phi", HardwareTier::Cpu),
            variant("qwen/cpu", "qwen", HardwareTier::Cpu),
        ]);
        let hw = HardwareProfile::for_tier(HardwareTier::Cpu);
        let err = select(&catalog, "phi", &hw, Some("qwen/cpu")).unwrap_err();
        assert_eq!(err.kind(), "VariantNotFound");
    }

    #[test]
    fn test_no_compatible_variant() {
        let catalog = snapshot(vec![variant("phi/cuda", "phi", HardwareTier::Cuda)]);
        let hw = HardwareProfile::for_tier(HardwareTier::WebGpu);
        let err = select(&catalog, "phi", &hw, None).unwrap_err();
        assert_eq!(err.kind(), "NoCompatibleVariant");
        assert_eq!(
            select(&catalog, "unknown", &hw, None).unwrap_err().kind(),
            "NoCompatibleVariant"
        );
    }

    fn tier() -> impl Strategy<Value = HardwareTier> {
        prop::sample::select(HardwareTier::ALL.to_vec())
    }

    proptest! {
        #[test]
        fn prop_selection_is_deterministic_and_best_tier(
            tiers in prop::collection::vec(tier(), 1..8),
            host in tier(),
        ) {
            let variants: Vec<ModelVariant> = tiers
                .iter()
                .enumerate()
                .map(|(i, t)| variant(&format!("m/{}", i), "m", *t))
                .collect();
            let catalog = snapshot(variants.clone());
            let hw = HardwareProfile::for_tier(host);

            let first = select(&catalog, "m", &hw, None).map(|v| v.id.clone());
            let second = select(&catalog, "m", &hw, None).map(|v| v.id.clone());
            prop_assert_eq!(first.as_ref().ok(), second.as_ref().ok());

            if let Ok(id) = first {
                let chosen = variants.iter().find(|v| v.id == id).unwrap();
                prop_assert!(hw.supports(chosen.hardware));
                for other in variants.iter().filter(|v| hw.supports(v.hardware)) {
                    prop_assert!(chosen.hardware.rank() <= other.hardware.rank());
                }
            } else {
                prop_assert!(variants.iter().all(|v| !hw.supports(v.hardware)));
            }
        }
    }
}
