use std::sync::atomic::{AtomicU64, Ordering};

use ktune_api::DispatchTelemetry;

#[derive(Default)]
pub struct DispatchCounters {
    dispatches: AtomicU64,
    enqueues: AtomicU64,
    timed_launches: AtomicU64,
    split_dispatches: AtomicU64,
    tuning_searches: AtomicU64,
    candidates_measured: AtomicU64,
    forced_waits: AtomicU64,
    fake_warmups: AtomicU64,
    program_cache_hits: AtomicU64,
    program_cache_misses: AtomicU64,
}

impl DispatchCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_dispatch(&self) {
        self.dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_enqueue(&self, timed: bool) {
        self.enqueues.fetch_add(1, Ordering::Relaxed);
        if timed {
            self.timed_launches.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_split(&self) {
        self.split_dispatches.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_tuning_search(&self, candidates: u64) {
        self.tuning_searches.fetch_add(1, Ordering::Relaxed);
        self.candidates_measured
            .fetch_add(candidates, Ordering::Relaxed);
    }

    pub fn record_forced_wait(&self) {
        self.forced_waits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fake_warmup(&self) {
        self.fake_warmups.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_program_cache(&self, hit: bool) {
        if hit {
            self.program_cache_hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.program_cache_misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn reset(&self) {
        self.dispatches.store(0, Ordering::Relaxed);
        self.enqueues.store(0, Ordering::Relaxed);
        self.timed_launches.store(0, Ordering::Relaxed);
        self.split_dispatches.store(0, Ordering::Relaxed);
        self.tuning_searches.store(0, Ordering::Relaxed);
        self.candidates_measured.store(0, Ordering::Relaxed);
        self.forced_waits.store(0, Ordering::Relaxed);
        self.fake_warmups.store(0, Ordering::Relaxed);
        self.program_cache_hits.store(0, Ordering::Relaxed);
        self.program_cache_misses.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> DispatchTelemetry {
        DispatchTelemetry {
            dispatches: self.dispatches.load(Ordering::Relaxed),
            enqueues: self.enqueues.load(Ordering::Relaxed),
            timed_launches: self.timed_launches.load(Ordering::Relaxed),
            split_dispatches: self.split_dispatches.load(Ordering::Relaxed),
            tuning_searches: self.tuning_searches.load(Ordering::Relaxed),
            candidates_measured: self.candidates_measured.load(Ordering::Relaxed),
            forced_waits: self.forced_waits.load(Ordering::Relaxed),
            fake_warmups: self.fake_warmups.load(Ordering::Relaxed),
            program_cache_hits: self.program_cache_hits.load(Ordering::Relaxed),
            program_cache_misses: self.program_cache_misses.load(Ordering::Relaxed),
        }
    }
}
