//! Stop-the-world coordination
//!
//! The collector raises one global trap flag and prods every other CPU.
//! Mutators observe the flag at their next safepoint poll (loop back-edges
//! and runtime-service entry) and park with a snapshot of their managed
//! context; the coordinator proceeds only after every registered mutator
//! has parked. Resuming crosses the flag's release store, so mutators see
//! no reordering across the collection.

use crate::platform::Platform;
use crate::unwind::Context;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Pause statistics, mirrored into the collector's cycle log.
#[derive(Debug, Default)]
pub struct SafepointStats {
    total_parks: AtomicUsize,
    total_stops: AtomicUsize,
}

impl SafepointStats {
    pub fn total_parks(&self) -> usize {
        self.total_parks.load(Ordering::Relaxed)
    }

    pub fn total_stops(&self) -> usize {
        self.total_stops.load(Ordering::Relaxed)
    }
}

/// Coordinates trap-flag publication and mutator parking.
pub struct SafepointCoordinator {
    /// The flag emitted code polls; kept as a byte so generated polls are
    /// a single `cmp byte` against its address.
    trap: AtomicBool,
    /// Registered mutator threads, the coordinator included while it runs
    /// managed code.
    mutators: AtomicUsize,
    parked: AtomicUsize,
    /// Managed-context snapshots of currently parked mutators.
    contexts: Mutex<Vec<Context>>,
    pub stats: SafepointStats,
}

impl Default for SafepointCoordinator {
    fn default() -> Self {
        SafepointCoordinator::new()
    }
}

impl SafepointCoordinator {
    pub fn new() -> SafepointCoordinator {
        SafepointCoordinator {
            trap: AtomicBool::new(false),
            mutators: AtomicUsize::new(0),
            parked: AtomicUsize::new(0),
            contexts: Mutex::new(Vec::new()),
            stats: SafepointStats::default(),
        }
    }

    /// Address of the trap byte for the JIT's back-edge polls.
    pub fn trap_flag_addr(&self) -> usize {
        &self.trap as *const AtomicBool as usize
    }

    /// True when a stop is pending; the slow-path check behind polls.
    #[inline]
    pub fn trap_pending(&self) -> bool {
        self.trap.load(Ordering::Acquire)
    }

    pub fn register_mutator(&self) {
        self.mutators.fetch_add(1, Ordering::AcqRel);
    }

    pub fn deregister_mutator(&self) {
        self.mutators.fetch_sub(1, Ordering::AcqRel);
    }

    pub fn mutator_count(&self) -> usize {
        self.mutators.load(Ordering::Acquire)
    }

    /// Raise the trap and prod the other CPUs without waiting; the
    /// caller owns the wait policy (the collector also counts threads
    /// sitting inside runtime services as safe).
    pub fn raise_trap(&self, platform: &dyn Platform) {
        self.trap.store(true, Ordering::Release);
        platform.send_ipi_all();
        self.stats.total_stops.fetch_add(1, Ordering::Relaxed);
    }

    /// Mutators currently parked.
    pub fn parked_count(&self) -> usize {
        self.parked.load(Ordering::Acquire)
    }

    /// Context snapshots of the currently parked mutators.
    pub fn parked_contexts(&self) -> Vec<Context> {
        self.contexts.lock().clone()
    }

    /// Raise the trap and wait until every other registered mutator is
    /// parked. Returns the parked threads' managed contexts.
    pub fn request_stop(&self, platform: &dyn Platform) -> Vec<Context> {
        self.trap.store(true, Ordering::Release);
        platform.send_ipi_all();
        self.stats.total_stops.fetch_add(1, Ordering::Relaxed);

        let others = self.mutator_count().saturating_sub(1);
        let mut backoff = 1u32;
        while self.parked.load(Ordering::Acquire) < others {
            for _ in 0..backoff {
                std::hint::spin_loop();
            }
            backoff = (backoff * 2).min(1024);
        }
        self.contexts.lock().clone()
    }

    /// Drop the trap; parked mutators resume through the release store.
    pub fn resume(&self) {
        self.contexts.lock().clear();
        self.trap.store(false, Ordering::Release);
    }

    /// Park the calling mutator with its managed-context snapshot until
    /// the coordinator resumes the world.
    pub fn park(&self, ctx: Context) {
        self.contexts.lock().push(ctx);
        self.parked.fetch_add(1, Ordering::AcqRel);
        self.stats.total_parks.fetch_add(1, Ordering::Relaxed);

        let mut backoff = 1u32;
        while self.trap.load(Ordering::Acquire) {
            for _ in 0..backoff {
                std::hint::spin_loop();
            }
            backoff = (backoff * 2).min(1024);
        }
        self.parked.fetch_sub(1, Ordering::AcqRel);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_trap_flag_starts_clear() {
        let coord = SafepointCoordinator::new();
        assert!(!coord.trap_pending());
        assert_eq!(coord.mutator_count(), 0);
    }

    #[test]
    fn test_trap_flag_addr_is_live() {
        let coord = SafepointCoordinator::new();
        let addr = coord.trap_flag_addr();
        // The emitted poll reads this byte directly.
        assert_eq!(unsafe { *(addr as *const u8) }, 0);
        coord.trap.store(true, Ordering::Release);
        assert_eq!(unsafe { *(addr as *const u8) }, 1);
        coord.trap.store(false, Ordering::Release);
    }

    #[test]
    fn test_register_deregister() {
        let coord = SafepointCoordinator::new();
        coord.register_mutator();
        coord.register_mutator();
        assert_eq!(coord.mutator_count(), 2);
        coord.deregister_mutator();
        assert_eq!(coord.mutator_count(), 1);
    }

    #[cfg(unix)]
    #[test]
    fn test_stop_collects_parked_contexts() {
        use crate::platform::HostPlatform;

        let coord = Arc::new(SafepointCoordinator::new());
        let platform = HostPlatform;
        coord.register_mutator(); // the coordinator itself
        coord.register_mutator(); // one worker

        let worker = {
            let coord = coord.clone();
            std::thread::spawn(move || {
                // Poll loop: park once the trap shows up.
                loop {
                    if coord.trap_pending() {
                        let ctx = Context {
                            rip: 0x1234,
                            ..Default::default()
                        };
                        coord.park(ctx);
                        break;
                    }
                    std::hint::spin_loop();
                }
            })
        };

        let contexts = coord.request_stop(&platform);
        assert_eq!(contexts.len(), 1);
        assert_eq!(contexts[0].rip, 0x1234);
        coord.resume();
        worker.join().unwrap();
        assert_eq!(coord.stats.total_parks(), 1);
        assert_eq!(coord.stats.total_stops(), 1);
    }
}
