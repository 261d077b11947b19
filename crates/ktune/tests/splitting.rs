use std::sync::Arc;

use ktune::ktune_api::{CallStats, DataType, KernelArg, NdRange};
use ktune::{
    tensor, tuning_or_run_3d, DispatchConfig, HostDevice, HostDeviceOptions, InMemoryTuningStore,
    KernelSpec, Runtime,
};

const GWS: [u32; 3] = [5, 3, 7];
const LWS: [u32; 3] = [1, 3, 2];

/// 1us per work item, so a whole launch of the rounded range takes 120us.
fn slow_device(non_uniform_work_groups: bool) -> HostDevice {
    HostDevice::with_options(HostDeviceOptions {
        non_uniform_work_groups,
        ..HostDeviceOptions::default()
    })
    .with_cost_model(|_: &str, range: &NdRange| range.work_items() * 1_000)
}

fn limited_config() -> DispatchConfig {
    DispatchConfig {
        limit_kernel_time: true,
        max_kernel_exec_time_us: 30.0,
        ..DispatchConfig::default()
    }
}

fn expected_fill() -> Vec<f32> {
    let mut out = Vec::new();
    for z in 0..GWS[2] {
        for y in 0..GWS[1] {
            for x in 0..GWS[0] {
                out.push((x + 7 * y + 31 * z + 1) as f32);
            }
        }
    }
    out
}

struct FillRun {
    data: Vec<f32>,
    /// `(offset, global)` of every replayed launch.
    launches: Vec<(Vec<u32>, Vec<u32>)>,
    /// Completion stats reported for the replayed dispatch.
    completion: CallStats,
}

/// Run `fill_index` twice: timed, then replayed.
fn fill_twice(rt: &Runtime) -> FillRun {
    let device = rt.device();
    let kernel = rt
        .build_kernel(&KernelSpec::new("fill_index", "fill_index", DataType::Float))
        .expect("build");
    let out = tensor::empty(device, &[GWS[2] as usize, GWS[1] as usize, GWS[0] as usize])
        .expect("output");
    for (i, g) in GWS.iter().enumerate() {
        device
            .set_arg(kernel.handle(), i as u32, KernelArg::U32(*g))
            .expect("size arg");
    }
    device
        .set_arg(kernel.handle(), 3, KernelArg::Buffer(out.buffer))
        .expect("output arg");

    let mut ctx = rt.context();
    tuning_or_run_3d(&mut ctx, &kernel, "fill_index_5_3_7", GWS, LWS).expect("timed");
    ctx.enable_run_metadata();
    tuning_or_run_3d(&mut ctx, &kernel, "fill_index_5_3_7", GWS, LWS).expect("replayed");
    let mut completion = CallStats::default();
    ctx.future().wait(Some(&mut completion)).expect("wait");

    let host = tensor::download(device, &out).expect("download");
    tensor::release(device, &out);
    let launches = ctx
        .take_run_metadata()
        .expect("metadata")
        .launches
        .into_iter()
        .map(|l| (l.offset, l.global))
        .collect();
    FillRun {
        data: host.data,
        launches,
        completion,
    }
}

#[test]
fn uniform_blocks_are_multiples_of_the_local_size() {
    let rt = Runtime::with_store(
        Arc::new(slow_device(false)),
        limited_config(),
        Arc::new(InMemoryTuningStore::new()),
    );
    let FillRun {
        data,
        launches,
        completion,
    } = fill_twice(&rt);
    assert_eq!(data, expected_fill());
    // one span from the first block's start to the last block's end
    assert_eq!(completion.elapsed_micros(), 120);

    // 120us over a 30us ceiling: 4 blocks of 7/4 = 1, rounded up to 2
    assert_eq!(
        launches,
        vec![
            (vec![0, 0, 0], vec![5, 3, 2]),
            (vec![0, 0, 2], vec![5, 3, 2]),
            (vec![0, 0, 4], vec![5, 3, 2]),
            (vec![0, 0, 6], vec![5, 3, 2]),
        ]
    );
    let recorded = rt.tuner().lookup("fill_index_5_3_7", 3).expect("remembered");
    assert_eq!(recorded.block_size, Some(2));
}

#[test]
fn non_uniform_blocks_cover_the_logical_extent_exactly() {
    let rt = Runtime::with_store(
        Arc::new(slow_device(true)),
        limited_config(),
        Arc::new(InMemoryTuningStore::new()),
    );
    let FillRun { data, launches, .. } = fill_twice(&rt);
    assert_eq!(data, expected_fill());

    // 105us / 30us wants 4 blocks; 7 / 4 = 1 per block, no rounding
    assert_eq!(launches.len(), 7);
    let mut next = 0;
    for (offset, global) in &launches {
        assert_eq!(&offset[..2], &[0, 0]);
        assert_eq!(&global[..2], &[5, 3]);
        assert_eq!(offset[2], next);
        next += global[2];
    }
    assert_eq!(next, GWS[2]);
}

#[test]
fn launches_under_the_ceiling_stay_whole() {
    let config = DispatchConfig {
        max_kernel_exec_time_us: 1_000.0,
        ..limited_config()
    };
    let rt = Runtime::with_store(
        Arc::new(slow_device(true)),
        config,
        Arc::new(InMemoryTuningStore::new()),
    );
    let FillRun { data, launches, .. } = fill_twice(&rt);
    assert_eq!(data, expected_fill());
    assert_eq!(launches, vec![(vec![0, 0, 0], vec![5, 3, 7])]);
    assert_eq!(rt.telemetry().split_dispatches, 0);
}

#[test]
fn empty_global_size_is_rejected() {
    let rt = Runtime::with_store(
        Arc::new(HostDevice::new()),
        DispatchConfig::default(),
        Arc::new(InMemoryTuningStore::new()),
    );
    let kernel = rt
        .build_kernel(&KernelSpec::new("fill_index", "fill_index", DataType::Float))
        .expect("build");
    let mut ctx = rt.context();
    let err = tuning_or_run_3d(&mut ctx, &kernel, "empty", [4, 0, 2], [1, 1, 1])
        .expect_err("empty range");
    assert!(matches!(err, ktune::ktune_api::DispatchError::InvalidGeometry(_)));
}
