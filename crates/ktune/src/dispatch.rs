//! Tuned dispatch of 2-D and 3-D kernels.
//!
//! A dispatch resolves its launch geometry through the runtime's tuner, then
//! either replays it on the production path (throttled, optionally split into
//! blocks along the slowest-varying axis) or runs it timed, splitting when the
//! measured time exceeds the configured ceiling.

use std::sync::Arc;

use ktune_api::{
    CallStats, ComputeDevice, DispatchError, EventHandle, KernelHandle, KernelLaunchStats, NdRange,
    Result, RunMetadata,
};

use crate::context::OpContext;
use crate::geometry::{candidates_2d, candidates_3d, default_3d_local_ws, round_up, LaunchGeometry};
use crate::kernel::BuiltKernel;
use crate::splitter::{self, Block};
use crate::telemetry::DispatchCounters;
use crate::throttle::QueueThrottle;
use crate::tuning::{ProfilingTimer, Timer};

/// Dispatch a 2-D kernel under `tuning_key`. `lws` is the default local size
/// used when the key has no recorded geometry and tuning is off.
pub fn tuning_or_run_2d(
    ctx: &mut OpContext<'_>,
    kernel: &BuiltKernel,
    tuning_key: &str,
    gws: [u32; 2],
    lws: [u32; 2],
) -> Result<LaunchGeometry> {
    let kwg = kernel.max_work_group_size();
    tuning_or_run(ctx, kernel, tuning_key, &gws, &lws, || candidates_2d(kwg))
}

/// Dispatch a 3-D kernel under `tuning_key`. An `lws` with a zero axis
/// selects the default local size scaled to the device's memory cache.
pub fn tuning_or_run_3d(
    ctx: &mut OpContext<'_>,
    kernel: &BuiltKernel,
    tuning_key: &str,
    gws: [u32; 3],
    lws: [u32; 3],
) -> Result<LaunchGeometry> {
    let kwg = kernel.max_work_group_size();
    let lws = if lws.contains(&0) {
        let cache = ctx.runtime().device().capabilities().global_mem_cache_size;
        default_3d_local_ws(&gws, kwg, cache)
    } else {
        lws.to_vec()
    };
    tuning_or_run(ctx, kernel, tuning_key, &gws, &lws, || {
        candidates_3d(&gws, kwg)
    })
}

fn tuning_or_run<G>(
    ctx: &mut OpContext<'_>,
    kernel: &BuiltKernel,
    tuning_key: &str,
    gws: &[u32],
    lws: &[u32],
    candidates: G,
) -> Result<LaunchGeometry>
where
    G: FnOnce() -> Vec<LaunchGeometry>,
{
    let runtime = ctx.runtime();
    let default = LaunchGeometry::new(lws.iter().map(|&l| l.max(1)).collect());
    if ctx.fake_warmup() {
        runtime.counters().record_fake_warmup();
        return Ok(default);
    }
    if let Some(axis) = gws.iter().position(|&g| g == 0) {
        return Err(DispatchError::InvalidGeometry(format!(
            "{tuning_key}: global size {gws:?} is empty along axis {axis}"
        )));
    }
    runtime.counters().record_dispatch();

    let config = runtime.config();
    let mut launch = Launch {
        device: runtime.device(),
        counters: runtime.counters(),
        kernel: kernel.handle(),
        tuning_key,
        gws,
        non_uniform: runtime.non_uniform_work_groups(),
        time_ceiling_us: config
            .limit_kernel_time
            .then_some(config.max_kernel_exec_time_us),
        first_event: None,
        last_event: None,
    };
    let throttle = &mut ctx.throttle;
    let metadata = &mut ctx.run_metadata;
    let mut timer = ProfilingTimer::new();
    let used = runtime.tuner().tune_or_run(
        tuning_key,
        &default,
        candidates,
        &mut timer,
        |geometry, timer| match timer {
            Some(timer) => launch.run_timed(geometry, timer),
            None => launch.run_production(geometry, throttle, metadata.as_mut()),
        },
    )?;

    if let Some(first) = launch.first_event.take() {
        let held = HeldEvents {
            device: runtime.device_arc(),
            first,
            last: launch.last_event.take(),
        };
        ctx.future.set(move |stats| held.wait(stats));
    }
    Ok(used)
}

/// Events of the final run of a dispatch, kept alive by the context's
/// completion future and released when it is replaced.
struct HeldEvents {
    device: Arc<dyn ComputeDevice>,
    first: EventHandle,
    last: Option<EventHandle>,
}

impl HeldEvents {
    fn wait(&self, stats: Option<&mut CallStats>) -> Result<()> {
        self.device.wait(self.last.unwrap_or(self.first))?;
        if let Some(stats) = stats {
            let mut span = self.device.call_stats(self.first)?;
            if let Some(last) = self.last {
                span.merge(&self.device.call_stats(last)?);
            }
            *stats = span;
        }
        Ok(())
    }
}

impl Drop for HeldEvents {
    fn drop(&mut self) {
        self.device.release_event(self.first);
        if let Some(last) = self.last {
            self.device.release_event(last);
        }
    }
}

struct Launch<'r> {
    device: &'r dyn ComputeDevice,
    counters: &'r DispatchCounters,
    kernel: &'r KernelHandle,
    tuning_key: &'r str,
    gws: &'r [u32],
    non_uniform: bool,
    time_ceiling_us: Option<f64>,
    // First and latest enqueue of the current run; earlier ones are released.
    first_event: Option<EventHandle>,
    last_event: Option<EventHandle>,
}

impl Drop for Launch<'_> {
    fn drop(&mut self) {
        self.release_run();
    }
}

impl Launch<'_> {
    /// Global size actually enqueued: the logical size, rounded up to the
    /// local size when non-uniform work-groups are unavailable.
    fn internal_global(&self, local: &[u32]) -> Result<Vec<u32>> {
        if local.len() != self.gws.len() {
            return Err(DispatchError::InvalidGeometry(format!(
                "{}: local size {local:?} does not match global size {:?}",
                self.tuning_key, self.gws
            )));
        }
        if local.contains(&0) {
            return Err(DispatchError::InvalidGeometry(format!(
                "{}: local size {local:?} has an empty axis",
                self.tuning_key
            )));
        }
        if self.non_uniform {
            return Ok(self.gws.to_vec());
        }
        Ok(self
            .gws
            .iter()
            .zip(local)
            .map(|(&g, &l)| round_up(g, l))
            .collect())
    }

    fn block_range(internal: &[u32], block: Block) -> (Vec<u32>, Vec<u32>) {
        let last = internal.len() - 1;
        let mut offset = vec![0; internal.len()];
        offset[last] = block.offset;
        let mut global = internal.to_vec();
        global[last] = block.len;
        (offset, global)
    }

    fn release_run(&mut self) {
        for event in [self.first_event.take(), self.last_event.take()]
            .into_iter()
            .flatten()
        {
            self.device.release_event(event);
        }
    }

    fn enqueue(&mut self, range: &NdRange, timed: bool) -> Result<EventHandle> {
        let event = self.device.enqueue(self.kernel, range)?;
        self.counters.record_enqueue(timed);
        if self.first_event.is_none() {
            self.first_event = Some(event);
        } else if let Some(previous) = self.last_event.replace(event) {
            self.device.release_event(previous);
        }
        Ok(event)
    }

    fn run_production(
        &mut self,
        geometry: &LaunchGeometry,
        throttle: &mut QueueThrottle,
        mut metadata: Option<&mut RunMetadata>,
    ) -> Result<LaunchGeometry> {
        let internal = self.internal_global(&geometry.local)?;
        self.release_run();
        let last = internal.len() - 1;
        let block_size = geometry.block_size.unwrap_or(internal[last]);
        let blocks = splitter::blocks(internal[last], block_size);
        if blocks.len() > 1 {
            self.counters.record_split();
        }
        for block in blocks {
            let (offset, global) = Self::block_range(&internal, block);
            let range = NdRange::new(offset, global, geometry.local.clone());
            let event = self.enqueue(&range, false)?;
            if let Some(meta) = metadata.as_deref_mut() {
                let stats = self.device.call_stats(event)?;
                meta.launches.push(KernelLaunchStats {
                    tuning_key: self.tuning_key.to_string(),
                    offset: range.offset,
                    global: range.global,
                    local: range.local,
                    stats,
                });
            }
            if throttle.record(self.device, event)? {
                self.counters.record_forced_wait();
            }
        }
        Ok(geometry.clone())
    }

    fn run_timed(&mut self, geometry: &LaunchGeometry, timer: &mut dyn Timer) -> Result<LaunchGeometry> {
        let internal = self.internal_global(&geometry.local)?;
        self.release_run();
        let last = internal.len() - 1;

        timer.clear();
        let whole = NdRange::new(vec![0; internal.len()], internal.clone(), geometry.local.clone());
        let event = self.enqueue(&whole, true)?;
        timer.accumulate(&self.device.call_stats(event)?);

        let mut used = LaunchGeometry::new(geometry.local.clone());
        let Some(ceiling_us) = self.time_ceiling_us else {
            return Ok(used);
        };
        let Some(block_size) = splitter::plan_block_size(
            timer.accumulated_micros(),
            ceiling_us,
            self.gws[last],
            internal[last],
            geometry.local[last],
            self.non_uniform,
        ) else {
            return Ok(used);
        };

        log::debug!(
            "{}: {:.1} us exceeds {ceiling_us:.1} us, splitting axis {last} into blocks of {block_size}",
            self.tuning_key,
            timer.accumulated_micros()
        );
        timer.clear();
        self.release_run();
        for block in splitter::blocks(internal[last], block_size) {
            let (offset, global) = Self::block_range(&internal, block);
            let range = NdRange::new(offset, global, geometry.local.clone());
            let event = self.enqueue(&range, true)?;
            timer.accumulate(&self.device.call_stats(event)?);
        }
        self.counters.record_split();
        used.block_size = Some(block_size);
        Ok(used)
    }
}
