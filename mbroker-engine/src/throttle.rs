//! Per-kind limit on concurrent provisioning calls.

use mbroker_core::ResourceKind;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Counts in-flight provisioning calls per resource kind.
///
/// A throttled task that finds its kind at the limit waits and retries
/// instead of failing.
#[derive(Clone, Default)]
pub struct ProvisionThrottle {
    slots: HashMap<ResourceKind, (usize, Arc<AtomicUsize>)>,
}

impl ProvisionThrottle {
    pub fn new(limits: &HashMap<ResourceKind, usize>) -> Self {
        Self {
            slots: limits
                .iter()
                .map(|(kind, limit)| (*kind, (*limit, Arc::new(AtomicUsize::new(0)))))
                .collect(),
        }
    }

    /// Take a slot for `kind`, or `None` when the limit is reached.
    pub fn try_acquire(&self, kind: ResourceKind) -> Option<ThrottlePermit> {
        let Some((limit, in_flight)) = self.slots.get(&kind) else {
            return Some(ThrottlePermit { in_flight: None });
        };
        in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < *limit).then_some(n + 1)
            })
            .ok()
            .map(|_| ThrottlePermit {
                in_flight: Some(in_flight.clone()),
            })
    }

    pub fn in_flight(&self, kind: ResourceKind) -> usize {
        self.slots
            .get(&kind)
            .map(|(_, n)| n.load(Ordering::Acquire))
            .unwrap_or(0)
    }
}

/// Slot held while a provisioning call runs.
pub struct ThrottlePermit {
    in_flight: Option<Arc<AtomicUsize>>,
}

impl Drop for ThrottlePermit {
    fn drop(&mut self) {
        if let Some(n) = &self.in_flight {
            n.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_limit_and_release() {
        let throttle = ProvisionThrottle::new(&HashMap::from([(ResourceKind::Instance, 2)]));

        let a = throttle.try_acquire(ResourceKind::Instance).unwrap();
        let _b = throttle.try_acquire(ResourceKind::Instance).unwrap();
        assert!(throttle.try_acquire(ResourceKind::Instance).is_none());
        assert_eq!(throttle.in_flight(ResourceKind::Instance), 2);

        drop(a);
        assert!(throttle.try_acquire(ResourceKind::Instance).is_some());
    }

    #[test]
    fn test_unlisted_kind_is_unthrottled() {
        let throttle = ProvisionThrottle::new(&HashMap::new());
        let permits: Vec<_> = (0..10)
            .map(|_| throttle.try_acquire(ResourceKind::Network))
            .collect();
        assert!(permits.iter().all(Option::is_some));
    }
}
