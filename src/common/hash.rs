//! Hashing utilities for fleetconf
//!
//! - BLAKE3 dataset digests (compare snapshots across nodes)
//! - Deterministic rollout buckets for percentage rollouts

/// Number of rollout buckets (percent granularity)
pub const ROLLOUT_BUCKETS: u64 = 100;

/// Compute BLAKE3 hash of data, return hex string
pub fn blake3_hash(data: &[u8]) -> String {
    let hash = blake3::hash(data);
    format!("{}", hash)
}

/// Rollout bucket in `0..ROLLOUT_BUCKETS` for a device and a config key.
///
/// The same device always lands in the same bucket for a given config, while
/// different configs spread a device population independently.
pub fn rollout_bucket(device_id: &str, config_key: &str) -> u64 {
    let mut hasher = blake3::Hasher::new();
    hasher.update(device_id.as_bytes());
    hasher.update(b":");
    hasher.update(config_key.as_bytes());
    let hash = hasher.finalize();
    let mut head = [0u8; 8];
    head.copy_from_slice(&hash.as_bytes()[0..8]);
    u64::from_le_bytes(head) % ROLLOUT_BUCKETS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_blake3_hash() {
        let h1 = blake3_hash(b"hello");
        let h2 = blake3_hash(b"hello");
        let h3 = blake3_hash(b"world");
        assert_eq!(h1, h2);
        assert_ne!(h1, h3);
        assert_eq!(h1.len(), 64);
    }

    #[test]
    fn test_rollout_bucket_is_stable() {
        for i in 0..50 {
            let device = format!("device-{}", i);
            let b1 = rollout_bucket(&device, "cfg-1");
            let b2 = rollout_bucket(&device, "cfg-1");
            assert_eq!(b1, b2);
            assert!(b1 < ROLLOUT_BUCKETS);
        }
    }

    #[test]
    fn test_rollout_bucket_distribution() {
        let in_half = (0..2000)
            .filter(|i| rollout_bucket(&format!("device-{}", i), "cfg-1") < 50)
            .count();
        // Roughly half of the population, with generous slack
        assert!(in_half > 800 && in_half < 1200, "got {}", in_half);
    }
}
