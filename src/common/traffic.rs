//! Per-worker traffic accounting and connection caps.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Semaphore;

/// Byte counters for one forwarder. `inbound` counts source→target bytes,
/// `outbound` counts target→source. Monotone for the life of one worker;
/// a restart starts from zero.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    inbound: AtomicU64,
    outbound: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add_in(&self, bytes: u64) {
        self.inbound.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn add_out(&self, bytes: u64) {
        self.outbound.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn inbound(&self) -> u64 {
        self.inbound.load(Ordering::Relaxed)
    }

    pub fn outbound(&self) -> u64 {
        self.outbound.load(Ordering::Relaxed)
    }
}

/// Connection cap for TCP-like listeners. `try_acquire` hands out a guard
/// that frees the slot on drop, so a connection task can never leak its slot.
pub struct ConnectionLimiter {
    semaphore: Arc<Semaphore>,
    max: u32,
    active: Arc<AtomicU64>,
}

impl ConnectionLimiter {
    pub fn new(max: u32) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(max as usize)),
            max,
            active: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn try_acquire(&self) -> Option<ConnectionGuard> {
        let permit = self.semaphore.clone().try_acquire_owned().ok()?;
        self.active.fetch_add(1, Ordering::Relaxed);
        Some(ConnectionGuard {
            _permit: permit,
            active: self.active.clone(),
        })
    }

    pub fn active(&self) -> u64 {
        self.active.load(Ordering::Relaxed)
    }

    pub fn max(&self) -> u32 {
        self.max
    }
}

pub struct ConnectionGuard {
    _permit: tokio::sync::OwnedSemaphorePermit,
    active: Arc<AtomicU64>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_accumulate() {
        let c = TrafficCounters::new();
        c.add_in(100);
        c.add_out(200);
        c.add_in(4);
        assert_eq!(c.inbound(), 104);
        assert_eq!(c.outbound(), 200);
    }

    #[test]
    fn limiter_enforces_cap() {
        let limiter = ConnectionLimiter::new(2);
        let g1 = limiter.try_acquire().unwrap();
        let g2 = limiter.try_acquire().unwrap();
        assert_eq!(limiter.active(), 2);
        assert!(limiter.try_acquire().is_none());

        drop(g1);
        assert_eq!(limiter.active(), 1);
        let _g3 = limiter.try_acquire().unwrap();
        assert!(limiter.try_acquire().is_none());
        drop(g2);
        assert_eq!(limiter.active(), 1);
    }
}
