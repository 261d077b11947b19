use std::sync::Arc;

use ktune::ktune_api::{DispatchError, HostTensor};
use ktune::{CustomAddOp, DispatchConfig, HostDevice, InMemoryTuningStore, Runtime};

fn runtime(device: Arc<HostDevice>, config: DispatchConfig) -> Runtime {
    Runtime::with_store(device, config, Arc::new(InMemoryTuningStore::new()))
}

fn scenario_inputs() -> (HostTensor, HostTensor) {
    let a = HostTensor::new(vec![1, 2, 3, 1], vec![6.0, 5.0, 4.0, 3.0, 2.0, 1.0]).expect("a");
    let b = HostTensor::new(vec![1, 2, 3, 1], vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]).expect("b");
    (a, b)
}

const EXPECTED: [f32; 6] = [70.0, 133.0, 196.0, 259.0, 322.0, 385.0];

fn ramp(shape: Vec<usize>, scale: f32) -> HostTensor {
    let len: usize = shape.iter().product();
    let data = (0..len).map(|i| (i % 97) as f32 * scale).collect();
    HostTensor::new(shape, data).expect("ramp")
}

#[test]
fn cpu_and_device_produce_the_reference_values() {
    let (a, b) = scenario_inputs();

    let cpu = CustomAddOp::cpu()
        .run(&mut runtime(Arc::new(HostDevice::new()), DispatchConfig::default()).context(), &a, &b)
        .expect("cpu");
    assert_eq!(cpu.data, EXPECTED);

    let rt = runtime(Arc::new(HostDevice::new()), DispatchConfig::default());
    let mut ctx = rt.context();
    let mut op = CustomAddOp::device("add0");
    let out = op.run(&mut ctx, &a, &b).expect("device");
    assert_eq!(out.shape, vec![1, 2, 3, 1]);
    assert_eq!(out.data, EXPECTED);
}

#[test]
fn forced_split_matches_single_block() {
    let (a, b) = scenario_inputs();
    let config = DispatchConfig {
        limit_kernel_time: true,
        max_kernel_exec_time_us: 0.001,
        ..DispatchConfig::default()
    };
    let rt = runtime(Arc::new(HostDevice::new()), config);
    let mut ctx = rt.context();
    let mut op = CustomAddOp::device("add0");

    // First call measures and splits, the second replays the split.
    let first = op.run(&mut ctx, &a, &b).expect("timed run");
    let second = op.run(&mut ctx, &a, &b).expect("production run");
    assert_eq!(first.data, EXPECTED);
    assert_eq!(second.data, EXPECTED);

    let telemetry = rt.telemetry();
    assert_eq!(telemetry.split_dispatches, 2);
    // timed: whole launch + 2 blocks; production: 2 blocks
    assert_eq!(telemetry.enqueues, 5);
    assert_eq!(telemetry.timed_launches, 3);
}

#[test]
fn larger_tensors_match_cpu_with_and_without_splitting() {
    let a = ramp(vec![2, 3, 5, 6], 0.5);
    let b = ramp(vec![2, 3, 5, 6], 0.25);
    let expected = CustomAddOp::cpu()
        .run(&mut runtime(Arc::new(HostDevice::new()), DispatchConfig::default()).context(), &a, &b)
        .expect("cpu");

    for limit_kernel_time in [false, true] {
        let config = DispatchConfig {
            limit_kernel_time,
            max_kernel_exec_time_us: 0.001,
            ..DispatchConfig::default()
        };
        let rt = runtime(Arc::new(HostDevice::new()), config);
        let mut ctx = rt.context();
        let mut op = CustomAddOp::device("add0");
        for _ in 0..2 {
            let out = op.run(&mut ctx, &a, &b).expect("device");
            assert_eq!(out.data, expected.data, "limit_kernel_time={limit_kernel_time}");
        }
        assert_eq!(rt.telemetry().split_dispatches > 0, limit_kernel_time);
    }
}

#[test]
fn changing_shape_reallocates_the_output() {
    let device = Arc::new(HostDevice::new());
    let rt = runtime(device.clone(), DispatchConfig::default());
    let mut ctx = rt.context();
    let mut op = CustomAddOp::device("add0").with_repeat(2);

    let small = ramp(vec![1, 2, 2, 3], 1.0);
    let big = ramp(vec![1, 4, 3, 5], 1.0);
    for input in [&small, &big, &small] {
        let out = op.run(&mut ctx, input, input).expect("run");
        let want: Vec<f32> = input.data.iter().map(|x| x * 3.0).collect();
        assert_eq!(out.data, want);
    }
    // inputs are released after each run; only the output stays
    assert_eq!(device.live_buffers(), 1);
    drop(op);
    assert_eq!(device.live_buffers(), 0);
    assert_eq!(device.live_kernels(), 0);
}

#[test]
fn program_is_built_once_per_runtime() {
    let device = Arc::new(HostDevice::new());
    let rt = runtime(device.clone(), DispatchConfig::default());
    let (a, b) = scenario_inputs();
    let mut ctx = rt.context();
    let mut first = CustomAddOp::device("add0");
    let mut second = CustomAddOp::device("add1");
    first.run(&mut ctx, &a, &b).expect("first");
    second.run(&mut ctx, &a, &b).expect("second");

    assert_eq!(device.stats().programs_built, 1);
    let telemetry = rt.telemetry();
    assert_eq!(telemetry.program_cache_misses, 1);
    assert_eq!(telemetry.program_cache_hits, 1);
}

#[test]
fn run_metadata_collects_operator_and_launch_stats() {
    let rt = runtime(Arc::new(HostDevice::new()), DispatchConfig::default());
    let (a, b) = scenario_inputs();
    let mut ctx = rt.context();
    ctx.enable_run_metadata();
    let mut op = CustomAddOp::device("add0");
    op.run(&mut ctx, &a, &b).expect("first");
    op.run(&mut ctx, &a, &b).expect("second");

    let meta = ctx.take_run_metadata().expect("metadata");
    assert_eq!(meta.op_stats.len(), 2);
    let stats = &meta.op_stats[0];
    assert_eq!(stats.operator_name, "add0");
    assert_eq!(stats.op_type, "CustomAdd");
    assert_eq!(stats.output_shape, vec![vec![1, 2, 3, 1]]);
    assert!(stats.stats.end_micros >= stats.stats.start_micros);

    // Only the replayed (production) dispatch records launches.
    assert_eq!(meta.launches.len(), 1);
    let launch = &meta.launches[0];
    assert_eq!(launch.tuning_key, "custom_add_kernel_1_2_3_1");
    assert_eq!(launch.global, vec![3, 2]);
    assert_eq!(launch.local, vec![16, 16]);
}

#[test]
fn fake_warmup_touches_no_device_work() {
    let device = Arc::new(HostDevice::new());
    let rt = runtime(device.clone(), DispatchConfig::default());
    let (a, b) = scenario_inputs();
    let mut ctx = rt.context();
    ctx.set_fake_warmup(true);
    let mut op = CustomAddOp::device("add0");
    let out = op.run(&mut ctx, &a, &b).expect("warmup");
    assert_eq!(out.data, vec![0.0; 6]);
    assert_eq!(device.stats().enqueues, 0);
    assert_eq!(rt.telemetry().fake_warmups, 1);
}

#[test]
fn shape_errors_are_reported() {
    let rt = runtime(Arc::new(HostDevice::new()), DispatchConfig::default());
    let mut ctx = rt.context();
    let a = HostTensor::zeros(vec![1, 2, 3, 1]);
    let b = HostTensor::zeros(vec![1, 3, 2, 1]);
    let flat = HostTensor::zeros(vec![6]);

    let mut op = CustomAddOp::device("add0");
    let err = op.run(&mut ctx, &a, &b).expect_err("mismatch");
    assert!(matches!(err, DispatchError::ShapeMismatch(_)));
    let err = op.run(&mut ctx, &flat, &flat).expect_err("rank");
    assert!(matches!(err, DispatchError::ShapeMismatch(_)));
    assert_eq!(rt.telemetry().dispatches, 0);
}
