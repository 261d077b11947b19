use ktune_api::{CallStats, OperatorStats, Result, RunMetadata, StatsFuture};

use crate::runtime::Runtime;
use crate::throttle::QueueThrottle;

/// Per-thread state for issuing operators onto a [`Runtime`].
///
/// Holds the queue throttle, the completion future of the last dispatch and,
/// when profiling, the run metadata being collected.
pub struct OpContext<'a> {
    runtime: &'a Runtime,
    pub(crate) throttle: QueueThrottle,
    pub(crate) future: StatsFuture,
    pub(crate) run_metadata: Option<RunMetadata>,
    fake_warmup: bool,
}

impl<'a> OpContext<'a> {
    pub fn new(runtime: &'a Runtime) -> Self {
        let window = runtime
            .tuner()
            .queue_window_size(runtime.config().queue_window_size);
        Self {
            runtime,
            throttle: QueueThrottle::new(window),
            future: StatsFuture::new(),
            run_metadata: None,
            fake_warmup: false,
        }
    }

    pub fn runtime(&self) -> &'a Runtime {
        self.runtime
    }

    /// When set, dispatches return immediately without touching the device.
    pub fn set_fake_warmup(&mut self, fake_warmup: bool) {
        self.fake_warmup = fake_warmup;
    }

    pub fn fake_warmup(&self) -> bool {
        self.fake_warmup
    }

    pub fn throttle(&self) -> &QueueThrottle {
        &self.throttle
    }

    pub fn future(&self) -> &StatsFuture {
        &self.future
    }

    /// Wait for the last dispatch issued from this context.
    pub fn wait(&self) -> Result<()> {
        self.future.wait(None)
    }

    pub fn enable_run_metadata(&mut self) {
        if self.run_metadata.is_none() {
            self.run_metadata = Some(RunMetadata::default());
        }
    }

    pub fn is_profiling(&self) -> bool {
        self.run_metadata.is_some()
    }

    pub fn run_metadata(&self) -> Option<&RunMetadata> {
        self.run_metadata.as_ref()
    }

    pub fn take_run_metadata(&mut self) -> Option<RunMetadata> {
        self.run_metadata.take()
    }

    /// Wait for the last dispatch and append its timing under the operator's
    /// name. No-op unless profiling.
    pub fn record_operator(
        &mut self,
        operator_name: &str,
        op_type: &str,
        output_shape: &[usize],
    ) -> Result<()> {
        if self.run_metadata.is_none() {
            return Ok(());
        }
        let mut stats = CallStats::default();
        self.future.wait(Some(&mut stats))?;
        if let Some(meta) = self.run_metadata.as_mut() {
            meta.op_stats.push(OperatorStats {
                operator_name: operator_name.to_string(),
                op_type: op_type.to_string(),
                output_shape: vec![output_shape.iter().map(|&d| d as i64).collect()],
                stats,
            });
        }
        Ok(())
    }
}
