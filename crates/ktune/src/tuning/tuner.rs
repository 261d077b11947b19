use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use ktune_api::{DispatchError, Result};

use super::{Timer, TuningStore};
use crate::geometry::LaunchGeometry;
use crate::telemetry::DispatchCounters;

/// Reserved tuning-table key holding the queue window recorded while tuning.
pub const QUEUE_WINDOW_KEY: &str = "ktune_queue_window_size";

const WARMUP_RUNS: u32 = 1;
const MEASURE_RUNS: u32 = 10;
/// Stop measuring a candidate once at least two runs exceeded this total.
const SOFT_BUDGET_US: f64 = 100_000.0;
/// Stop measuring a candidate once its runs exceeded this total.
const HARD_BUDGET_US: f64 = 200_000.0;

/// Chooses, records and replays launch geometries per tuning key.
pub struct Tuner {
    store: Arc<dyn TuningStore>,
    tuning: bool,
    // Run-mode results for keys absent from the table; never persisted.
    remembered: Mutex<HashMap<String, LaunchGeometry>>,
    counters: Arc<DispatchCounters>,
}

impl Tuner {
    pub fn new(
        store: Arc<dyn TuningStore>,
        tuning: bool,
        queue_window_size: i64,
        counters: Arc<DispatchCounters>,
    ) -> Self {
        if tuning {
            let window = queue_window_size.clamp(0, u32::MAX as i64) as u32;
            store.put(QUEUE_WINDOW_KEY, vec![window]);
        }
        Self {
            store,
            tuning,
            remembered: Mutex::new(HashMap::new()),
            counters,
        }
    }

    pub fn is_tuning(&self) -> bool {
        self.tuning
    }

    pub fn store(&self) -> &Arc<dyn TuningStore> {
        &self.store
    }

    /// Queue window for production runs. Throttling is off while tuning so
    /// measurements are not perturbed by forced waits.
    pub fn queue_window_size(&self, configured: i64) -> i64 {
        if self.tuning {
            return 0;
        }
        self.store
            .get(QUEUE_WINDOW_KEY)
            .and_then(|p| p.first().copied())
            .map(|w| w as i64)
            .unwrap_or(configured)
    }

    /// Geometry recorded for `key`, from the table or from an earlier
    /// run-mode dispatch.
    pub fn lookup(&self, key: &str, dims: usize) -> Option<LaunchGeometry> {
        if let Some(params) = self.store.get(key) {
            match LaunchGeometry::from_params(&params, dims) {
                Ok(geometry) => return Some(geometry),
                Err(err) => log::warn!("ignoring tuning entry '{key}': {err}"),
            }
        }
        self.remembered
            .lock()
            .ok()
            .and_then(|g| g.get(key).cloned())
    }

    /// Run the launch described by `run` for `key`.
    ///
    /// * recorded key: replay the recorded geometry on the untimed path
    /// * tuning: measure every candidate, record and return the fastest
    /// * otherwise: timed run with `default`, remembered for later calls
    ///
    /// `run` receives the geometry and a timer (`None` on the production
    /// path) and returns the geometry it effectively used, including any
    /// block size chosen by splitting.
    pub fn tune_or_run<G, F>(
        &self,
        key: &str,
        default: &LaunchGeometry,
        candidates: G,
        timer: &mut dyn Timer,
        mut run: F,
    ) -> Result<LaunchGeometry>
    where
        G: FnOnce() -> Vec<LaunchGeometry>,
        F: FnMut(&LaunchGeometry, Option<&mut dyn Timer>) -> Result<LaunchGeometry>,
    {
        if let Some(geometry) = self.lookup(key, default.dims()) {
            run(&geometry, None)?;
            return Ok(geometry);
        }

        if self.tuning {
            let span = tracing::info_span!("ktune.tune", key = key);
            let _enter = span.enter();
            let best = self.search(key, default, candidates(), timer, &mut run)?;
            self.store.put(key, best.to_params());
            return Ok(best);
        }

        let used = run(default, Some(timer))?;
        log::debug!("{key}: running default geometry {used:?}");
        if let Ok(mut guard) = self.remembered.lock() {
            guard.insert(key.to_string(), used.clone());
        }
        Ok(used)
    }

    fn search<F>(
        &self,
        key: &str,
        default: &LaunchGeometry,
        candidates: Vec<LaunchGeometry>,
        timer: &mut dyn Timer,
        run: &mut F,
    ) -> Result<LaunchGeometry>
    where
        F: FnMut(&LaunchGeometry, Option<&mut dyn Timer>) -> Result<LaunchGeometry>,
    {
        let mut best: Option<(f64, LaunchGeometry)> = None;
        let mut measured = 0u64;
        for candidate in &candidates {
            match measure(candidate, timer, run) {
                Ok((mean_us, used)) => {
                    measured += 1;
                    log::debug!("{key}: {:?} took {mean_us:.2} us", used);
                    if best.as_ref().map_or(true, |(t, _)| mean_us < *t) {
                        best = Some((mean_us, used));
                    }
                }
                Err(err @ DispatchError::Enqueue { .. }) => {
                    log::debug!("{key}: skipping candidate {:?}: {err}", candidate.local);
                }
                Err(err) => return Err(err),
            }
        }
        self.counters.record_tuning_search(measured);

        match best {
            Some((mean_us, geometry)) => {
                log::info!(
                    "tuned {key}: local {:?} block {:?} ({mean_us:.2} us)",
                    geometry.local,
                    geometry.block_size
                );
                Ok(geometry)
            }
            None => {
                log::warn!(
                    "{key}: none of {} candidates ran, falling back to {:?}",
                    candidates.len(),
                    default.local
                );
                run(default, Some(timer))
            }
        }
    }
}

fn measure<F>(
    candidate: &LaunchGeometry,
    timer: &mut dyn Timer,
    run: &mut F,
) -> Result<(f64, LaunchGeometry)>
where
    F: FnMut(&LaunchGeometry, Option<&mut dyn Timer>) -> Result<LaunchGeometry>,
{
    for _ in 0..WARMUP_RUNS {
        run(candidate, Some(&mut *timer))?;
    }
    let mut total_us = 0.0;
    let mut iterations = 0u32;
    let mut used = candidate.clone();
    while iterations < MEASURE_RUNS {
        used = run(candidate, Some(&mut *timer))?;
        total_us += timer.accumulated_micros();
        iterations += 1;
        if (iterations >= 2 && total_us > SOFT_BUDGET_US) || total_us > HARD_BUDGET_US {
            break;
        }
    }
    Ok((total_us / iterations as f64, used))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tuning::{InMemoryTuningStore, ProfilingTimer};
    use ktune_api::CallStats;

    fn tuner(tuning: bool) -> (Tuner, Arc<InMemoryTuningStore>) {
        let store = Arc::new(InMemoryTuningStore::new());
        let t = Tuner::new(store.clone(), tuning, 8, Arc::new(DispatchCounters::new()));
        (t, store)
    }

    fn fake_run(
        cost: impl Fn(&LaunchGeometry) -> i64,
    ) -> impl FnMut(&LaunchGeometry, Option<&mut dyn Timer>) -> Result<LaunchGeometry> {
        move |g: &LaunchGeometry, timer: Option<&mut dyn Timer>| {
            if let Some(timer) = timer {
                timer.clear();
                timer.accumulate(&CallStats {
                    end_micros: cost(g),
                    ..CallStats::default()
                });
            }
            Ok(g.clone())
        }
    }

    #[test]
    fn search_picks_fastest_and_records() {
        let (t, store) = tuner(true);
        let mut timer = ProfilingTimer::new();
        let candidates = vec![
            LaunchGeometry::new(vec![8, 2]),
            LaunchGeometry::new(vec![4, 4]),
            LaunchGeometry::new(vec![2, 8]),
        ];
        let best = t
            .tune_or_run(
                "k",
                &LaunchGeometry::new(vec![1, 1]),
                || candidates,
                &mut timer,
                fake_run(|g| if g.local == vec![4, 4] { 5 } else { 50 }),
            )
            .expect("tune");
        assert_eq!(best.local, vec![4, 4]);
        assert_eq!(store.get("k"), Some(vec![4, 4, 0]));
    }

    #[test]
    fn ties_keep_first_candidate() {
        let (t, _) = tuner(true);
        let mut timer = ProfilingTimer::new();
        let best = t
            .tune_or_run(
                "tie",
                &LaunchGeometry::new(vec![1, 1]),
                || {
                    vec![
                        LaunchGeometry::new(vec![2, 2]),
                        LaunchGeometry::new(vec![4, 1]),
                    ]
                },
                &mut timer,
                fake_run(|_| 10),
            )
            .expect("tune");
        assert_eq!(best.local, vec![2, 2]);
    }

    #[test]
    fn hard_budget_stops_measurement_early() {
        let (t, _) = tuner(true);
        let mut timer = ProfilingTimer::new();
        let mut calls = 0;
        t.tune_or_run(
            "slow",
            &LaunchGeometry::new(vec![1, 1]),
            || vec![LaunchGeometry::new(vec![2, 2])],
            &mut timer,
            |g: &LaunchGeometry, timer: Option<&mut dyn Timer>| {
                calls += 1;
                if let Some(timer) = timer {
                    timer.clear();
                    timer.accumulate(&CallStats {
                        end_micros: 250_000,
                        ..CallStats::default()
                    });
                }
                Ok(g.clone())
            },
        )
        .expect("tune");
        // one warm-up plus a single measured run over the hard budget
        assert_eq!(calls, 2);
    }

    #[test]
    fn recorded_key_replays_without_timer() {
        let (t, store) = tuner(false);
        store.put("k", vec![16, 16, 4]);
        let mut timer = ProfilingTimer::new();
        let mut saw_timer = false;
        let used = t
            .tune_or_run(
                "k",
                &LaunchGeometry::new(vec![1, 1]),
                Vec::new,
                &mut timer,
                |g: &LaunchGeometry, timer: Option<&mut dyn Timer>| {
                    saw_timer |= timer.is_some();
                    Ok(g.clone())
                },
            )
            .expect("run");
        assert!(!saw_timer);
        assert_eq!(used, LaunchGeometry::new(vec![16, 16]).with_block_size(4));
    }

    #[test]
    fn run_mode_remembers_default_in_process_only() {
        let (t, store) = tuner(false);
        let mut timer = ProfilingTimer::new();
        let default = LaunchGeometry::new(vec![8, 8]);
        t.tune_or_run("k", &default, Vec::new, &mut timer, fake_run(|_| 1))
            .expect("run");
        assert_eq!(store.get("k"), None);
        assert_eq!(t.lookup("k", 2), Some(default));
    }

    #[test]
    fn queue_window_key() {
        let (t, store) = tuner(true);
        assert_eq!(store.get(QUEUE_WINDOW_KEY), Some(vec![8]));
        assert_eq!(t.queue_window_size(8), 0);

        let run_mode = Tuner::new(store.clone(), false, 3, Arc::new(DispatchCounters::new()));
        assert_eq!(run_mode.queue_window_size(3), 8);

        let empty = Tuner::new(
            Arc::new(InMemoryTuningStore::new()),
            false,
            3,
            Arc::new(DispatchCounters::new()),
        );
        assert_eq!(empty.queue_window_size(3), 3);
    }
}
