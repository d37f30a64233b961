//! Deterministic weighted selection with session stickiness.
//!
//! A client id is hashed with BLAKE3; the first eight bytes, read as a
//! little-endian `u64`, are reduced modulo the pool total to get a bucket.
//! The same id therefore always lands in the same bucket for a given pool,
//! and distinct ids spread uniformly across it.

use std::sync::Arc;

use super::identity::StickyAssignment;
use crate::config::{Deployment, GrayConfig, WeightedPool};

/// Maps an identity onto `[0, modulus)`.
pub fn bucket(identity: &str, modulus: u32) -> u32 {
    if modulus == 0 {
        return 0;
    }
    let hash = blake3::hash(identity.as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&hash.as_bytes()[..8]);
    (u64::from_le_bytes(prefix) % u64::from(modulus)) as u32
}

/// Selects a deployment from the weighted pool.
///
/// A returning client whose sticky client id equals its current id keeps
/// its previous version while that version is still registered. Otherwise
/// the current id is bucketed into the pool.
pub fn select_weighted(
    config: &GrayConfig,
    pool: &WeightedPool,
    previous: Option<&StickyAssignment>,
    client_id: &str,
) -> Arc<Deployment> {
    if let Some(sticky) = previous {
        if !sticky.client_id.is_empty() && sticky.client_id == client_id {
            if let Some(deployment) = config.find_version(&sticky.version) {
                return deployment.clone();
            }
            tracing::debug!(
                version = %sticky.version,
                "sticky version no longer registered, re-bucketing"
            );
        }
    }

    pool.pick(bucket(client_id, pool.total())).clone()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SelectionMode;
    use proptest::prelude::*;

    // ========== Test Helpers ==========

    fn make_config(json: &str) -> GrayConfig {
        GrayConfig::from_json(json).unwrap()
    }

    fn pool_of(config: &GrayConfig) -> &WeightedPool {
        match config.mode() {
            SelectionMode::Weighted { pool } => pool,
            _ => panic!("expected weighted mode"),
        }
    }

    fn three_way() -> GrayConfig {
        make_config(
            r#"{
                "baseDeployment": {"version": "base"},
                "grayDeployments": [
                    {"version": "a", "weight": 10},
                    {"version": "b", "weight": 30}
                ]
            }"#,
        )
    }

    fn sticky(version: &str, client_id: &str) -> StickyAssignment {
        StickyAssignment {
            version: version.to_string(),
            client_id: client_id.to_string(),
        }
    }

    // ========== Phase 1: Bucketing ==========

    #[test]
    fn test_bucket_is_deterministic() {
        assert_eq!(bucket("10.0.0.1", 100), bucket("10.0.0.1", 100));
        assert_eq!(bucket("", 100), bucket("", 100));
    }

    #[test]
    fn test_bucket_zero_modulus() {
        assert_eq!(bucket("anything", 0), 0);
    }

    proptest! {
        #[test]
        fn test_bucket_within_range(id in ".*", modulus in 1u32..10_000) {
            prop_assert!(bucket(&id, modulus) < modulus);
        }

        #[test]
        fn test_selection_stable_for_fixed_identity(id in "[a-z0-9.]{1,24}") {
            let config = three_way();
            let pool = pool_of(&config);
            let first = select_weighted(&config, pool, None, &id);
            let again = select_weighted(&config, pool, None, &id);
            prop_assert_eq!(&first.version, &again.version);
        }
    }

    // ========== Phase 2: Distribution ==========

    #[test]
    fn test_distribution_converges_to_weights() {
        let config = three_way();
        let pool = pool_of(&config);
        let samples = 20_000;
        let mut counts = std::collections::HashMap::new();
        for i in 0..samples {
            let id = format!("client-{}", i);
            let chosen = select_weighted(&config, pool, None, &id);
            *counts.entry(chosen.version.clone()).or_insert(0u32) += 1;
        }
        let share = |v: &str| f64::from(*counts.get(v).unwrap_or(&0)) / f64::from(samples);
        assert!((share("a") - 0.10).abs() < 0.02, "a share {}", share("a"));
        assert!((share("b") - 0.30).abs() < 0.02, "b share {}", share("b"));
        assert!((share("base") - 0.60).abs() < 0.02, "base share {}", share("base"));
    }

    // ========== Phase 3: Stickiness ==========

    #[test]
    fn test_sticky_version_kept_for_same_client() {
        let config = three_way();
        let pool = pool_of(&config);
        let id = "10.1.1.1";
        let first = select_weighted(&config, pool, None, id);

        // Pick a version different from the natural bucket to prove the
        // cookie, not the hash, decides.
        let other = if first.version == "a" { "b" } else { "a" };
        let chosen = select_weighted(&config, pool, Some(&sticky(other, id)), id);
        assert_eq!(chosen.version, other);
    }

    #[test]
    fn test_sticky_survives_weight_change() {
        let before = three_way();
        let id = "user-77";
        let first = select_weighted(&before, pool_of(&before), None, id);

        let after = make_config(
            r#"{
                "baseDeployment": {"version": "base"},
                "grayDeployments": [
                    {"version": "a", "weight": 90},
                    {"version": "b", "weight": 5}
                ]
            }"#,
        );
        let replay = sticky(&first.version, id);
        let chosen = select_weighted(&after, pool_of(&after), Some(&replay), id);
        assert_eq!(chosen.version, first.version);
    }

    #[test]
    fn test_sticky_ignored_for_different_client() {
        let config = three_way();
        let pool = pool_of(&config);
        let natural = select_weighted(&config, pool, None, "client-x");
        let chosen = select_weighted(&config, pool, Some(&sticky("zzz", "client-y")), "client-x");
        assert_eq!(chosen.version, natural.version);
    }

    #[test]
    fn test_sticky_with_empty_client_id_ignored() {
        let config = three_way();
        let pool = pool_of(&config);
        let natural = select_weighted(&config, pool, None, "");
        let chosen = select_weighted(&config, pool, Some(&sticky("a", "")), "");
        assert_eq!(chosen.version, natural.version);
    }

    #[test]
    fn test_removed_sticky_version_falls_through() {
        let config = three_way();
        let pool = pool_of(&config);
        let natural = select_weighted(&config, pool, None, "client-z");
        let chosen = select_weighted(&config, pool, Some(&sticky("gone", "client-z")), "client-z");
        assert_eq!(chosen.version, natural.version);
    }
}
