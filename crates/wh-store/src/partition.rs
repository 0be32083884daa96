//! Partition rebalancer (`spec.md` §4.3): a pure function of the live
//! instance set, consulted by the claim step of `process_work_batch`.
//! No runtime state, no database access — this module is unit-testable
//! on its own.

use sha2::{Digest, Sha256};
use wh_core::InstanceId;

/// `hash(stream_id) mod partition_count`, per `spec.md` §4.3. Uses a
/// SHA-256 digest rather than `std::hash` so two processes (and two
/// Rust compiler versions) agree on the same partition for the same
/// stream id, the way `outbox.rs`'s `compute_message_hash` fixes on
/// SHA-256 rather than a std hasher for its own idempotency digest.
pub fn partition_for_stream(stream_id: &str, partition_count: i32) -> i32 {
    assert!(partition_count > 0, "partition_count must be positive");
    let mut hasher = Sha256::new();
    hasher.update(stream_id.as_bytes());
    let digest = hasher.finalize();
    let n = u64::from_be_bytes(digest[0..8].try_into().expect("sha256 digest is 32 bytes"));
    (n % partition_count as u64) as i32
}

/// The partitions instance `me` currently owns, given the full live set.
///
/// Instances are numbered by sort order of `instance_id`; instance `i`
/// of `n` live instances owns `{p : p mod n == i}`, capped at
/// `max_partitions_per_instance`. Returns an empty set if `me` is not
/// among `live_instances` (it has not yet heartbeat in this call) or if
/// the live set is empty.
pub fn owned_partitions(
    live_instances: &[InstanceId],
    me: InstanceId,
    partition_count: i32,
    max_partitions_per_instance: usize,
) -> Vec<i32> {
    if live_instances.is_empty() || partition_count <= 0 {
        return Vec::new();
    }
    let mut sorted = live_instances.to_vec();
    sorted.sort();
    sorted.dedup();

    let n = sorted.len() as i32;
    let Some(i) = sorted.iter().position(|id| *id == me) else {
        return Vec::new();
    };
    let i = i as i32;

    (0..partition_count)
        .filter(|p| p % n == i)
        .take(max_partitions_per_instance)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_for_stream_is_deterministic() {
        let a = partition_for_stream("order-42", 10_000);
        let b = partition_for_stream("order-42", 10_000);
        assert_eq!(a, b);
    }

    #[test]
    fn partition_for_stream_is_in_range() {
        for key in ["a", "b", "order-1", "stream-with-a-much-longer-name"] {
            let p = partition_for_stream(key, 64);
            assert!((0..64).contains(&p));
        }
    }

    #[test]
    fn different_streams_usually_land_on_different_partitions() {
        let p1 = partition_for_stream("stream-one", 10_000);
        let p2 = partition_for_stream("stream-two", 10_000);
        assert_ne!(p1, p2);
    }

    #[test]
    fn single_partition_one_instance_owns_everything() {
        let me = InstanceId::new();
        let owned = owned_partitions(&[me], me, 1, 100);
        assert_eq!(owned, vec![0]);
    }

    #[test]
    fn single_partition_with_n_instances_only_the_first_owns_it() {
        let mut instances: Vec<InstanceId> = (0..4).map(|_| InstanceId::new()).collect();
        instances.sort();
        let owned_first = owned_partitions(&instances, instances[0], 1, 100);
        let owned_second = owned_partitions(&instances, instances[1], 1, 100);
        assert_eq!(owned_first, vec![0]);
        assert!(owned_second.is_empty());
    }

    #[test]
    fn ownership_partitions_the_full_domain_with_no_overlap() {
        let mut instances: Vec<InstanceId> = (0..3).map(|_| InstanceId::new()).collect();
        instances.sort();
        let mut all_owned = Vec::new();
        for &id in &instances {
            all_owned.extend(owned_partitions(&instances, id, 9, 100));
        }
        all_owned.sort();
        assert_eq!(all_owned, (0..9).collect::<Vec<_>>());
    }

    #[test]
    fn max_partitions_per_instance_caps_the_owned_set() {
        let me = InstanceId::new();
        let owned = owned_partitions(&[me], me, 10_000, 50);
        assert_eq!(owned.len(), 50);
    }

    #[test]
    fn instance_not_in_live_set_owns_nothing() {
        let me = InstanceId::new();
        let other = InstanceId::new();
        let owned = owned_partitions(&[other], me, 100, 100);
        assert!(owned.is_empty());
    }

    #[test]
    fn empty_live_set_owns_nothing() {
        let me = InstanceId::new();
        assert!(owned_partitions(&[], me, 100, 100).is_empty());
    }
}
