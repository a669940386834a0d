use bytes::Bytes;
use tracing::trace;
use crate::error::{QueueConnError, QueueConnResult};
use crate::sequence::Sequence;

/// Retains the raw on-wire bytes of recently sent slices for re-sending on NACK.
///
/// This is a fixed ring indexed by `sequence mod capacity`: storing a slice silently evicts the
///  slice sent `capacity` sequences earlier. Memory is bounded at the cost of slices older than
///  that being unrecoverable.
pub struct SendCache {
    slots: Vec<Option<(Sequence, Bytes)>>,
}

impl SendCache {
    /// NB: panics if `capacity` is not a power of two. [crate::config::QueueConnConfig::validate]
    ///  ensures this for configured caches.
    pub fn new(capacity: usize) -> SendCache {
        assert!(capacity.is_power_of_two(), "send cache capacity must be a power of two");
        SendCache {
            slots: vec![None; capacity],
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn insert(&mut self, sequence: Sequence, raw: Bytes) {
        let slot = sequence.slot(self.capacity());
        if let Some((evicted, _)) = &self.slots[slot] {
            trace!("send cache: slice #{} evicted by #{}", evicted, sequence);
        }
        self.slots[slot] = Some((sequence, raw));
    }

    /// Returns the raw datagram for `sequence` if it is still retained
    pub fn get(&self, sequence: Sequence) -> QueueConnResult<Bytes> {
        match &self.slots[sequence.slot(self.capacity())] {
            Some((cached, raw)) if *cached == sequence => Ok(raw.clone()),
            _ => Err(QueueConnError::CacheEvicted(sequence)),
        }
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut()
            .for_each(|slot| *slot = None);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    #[should_panic]
    fn test_capacity_not_power_of_two() {
        SendCache::new(12);
    }

    fn raw(sequence: u32) -> Bytes {
        Bytes::from(sequence.to_be_bytes().to_vec())
    }

    #[rstest]
    #[case::empty(vec![], 1, false)]
    #[case::present(vec![1,2,3], 2, true)]
    #[case::not_sent_yet(vec![1,2,3], 4, false)]
    #[case::last_in_window(vec![1,2,3,4,5,6,7,8,9,10,11], 4, true)]
    #[case::evicted(vec![1,2,3,4,5,6,7,8,9,10,11], 3, false)]
    #[case::evicted_same_slot(vec![1,2,3,4,5,6,7,8,9], 1, false)]
    #[case::newest(vec![1,2,3,4,5,6,7,8,9], 9, true)]
    fn test_get(#[case] sent: Vec<u32>, #[case] requested: u32, #[case] expected_present: bool) {
        let mut cache = SendCache::new(8);
        for s in sent {
            cache.insert(Sequence::from_raw(s), raw(s));
        }

        match cache.get(Sequence::from_raw(requested)) {
            Ok(buf) => {
                assert!(expected_present);
                assert_eq!(buf, raw(requested));
            }
            Err(QueueConnError::CacheEvicted(s)) => {
                assert!(!expected_present);
                assert_eq!(s, Sequence::from_raw(requested));
            }
            Err(e) => panic!("unexpected error {}", e),
        }
    }

    #[test]
    fn test_clear() {
        let mut cache = SendCache::new(4);
        cache.insert(Sequence::from_raw(1), raw(1));
        cache.clear();
        assert!(cache.get(Sequence::from_raw(1)).is_err());
    }
}
