//! Node load sources for leader election.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use rand::Rng;

/// Reports this node's current load. Lower is better.
pub trait LoadProbe: Send + Sync {
    fn sample(&self) -> u64;
}

/// A load that only changes when told to.
#[derive(Debug, Clone, Default)]
pub struct FixedLoad(Arc<AtomicU64>);

impl FixedLoad {
    pub fn new(load: u64) -> Self {
        Self(Arc::new(AtomicU64::new(load)))
    }

    pub fn set(&self, load: u64) {
        self.0.store(load, Ordering::SeqCst);
    }
}

impl LoadProbe for FixedLoad {
    fn sample(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// Uniformly random load below `max`, for deployments without a real
/// signal. Every sample differs, so leadership drifts between nodes.
#[derive(Debug, Clone, Copy)]
pub struct RandomLoad {
    max: u64,
}

impl RandomLoad {
    pub fn new(max: u64) -> Self {
        Self { max: max.max(1) }
    }
}

impl Default for RandomLoad {
    fn default() -> Self {
        Self::new(100)
    }
}

impl LoadProbe for RandomLoad {
    fn sample(&self) -> u64 {
        rand::thread_rng().gen_range(0..self.max)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_load_is_shared() {
        let load = FixedLoad::new(50);
        let probe: Box<dyn LoadProbe> = Box::new(load.clone());
        assert_eq!(probe.sample(), 50);
        load.set(10);
        assert_eq!(probe.sample(), 10);
    }

    #[test]
    fn test_random_load_in_range() {
        let probe = RandomLoad::new(10);
        for _ in 0..100 {
            assert!(probe.sample() < 10);
        }
        assert_eq!(RandomLoad::new(0).sample(), 0);
    }
}
