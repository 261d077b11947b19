use std::sync::Arc;

use ktune::ktune_api::HostTensor;
use ktune::{CustomAddOp, DispatchConfig, HostDevice, InMemoryTuningStore, Runtime};

fn ones(shape: Vec<usize>) -> HostTensor {
    let len = shape.iter().product();
    HostTensor::new(shape, vec![1.0; len]).expect("tensor")
}

/// Runtime whose table already holds a geometry for `key`, so dispatches
/// take the replay path where throttling applies.
fn replaying_runtime(
    device: Arc<HostDevice>,
    key: &str,
    params: Vec<u32>,
    queue_window_size: i64,
) -> Runtime {
    let config = DispatchConfig {
        queue_window_size,
        ..DispatchConfig::default()
    };
    let store = InMemoryTuningStore::with_entries([(key.to_string(), params)]);
    Runtime::with_store(device, config, Arc::new(store))
}

#[test]
fn window_forces_a_wait_every_n_enqueues() {
    let device = Arc::new(HostDevice::new());
    let rt = replaying_runtime(device.clone(), "custom_add_kernel_1_2_3_1", vec![16, 16, 0], 2);
    let mut ctx = rt.context();
    assert_eq!(ctx.throttle().window(), 2);
    let (a, b) = (ones(vec![1, 2, 3, 1]), ones(vec![1, 2, 3, 1]));

    let mut op = CustomAddOp::device("add0").with_repeat(1);
    for _ in 0..5 {
        let out = op.run(&mut ctx, &a, &b).expect("run");
        assert_eq!(out.data, vec![2.0; 6]);
    }

    assert_eq!(rt.telemetry().forced_waits, 2);
    assert_eq!(ctx.throttle().outstanding(), 1);
    // one wait per run to read the result, plus the forced ones
    assert_eq!(device.stats().waits, 5 + 2);
}

#[test]
fn split_blocks_count_against_the_window() {
    let device = Arc::new(HostDevice::new());
    // block size 1 along N*H = 3 gives three enqueues per dispatch
    let rt = replaying_runtime(device.clone(), "custom_add_kernel_1_3_3_1", vec![16, 16, 1], 2);
    let mut ctx = rt.context();
    let (a, b) = (ones(vec![1, 3, 3, 1]), ones(vec![1, 3, 3, 1]));

    let mut op = CustomAddOp::device("add0").with_repeat(1);
    op.run(&mut ctx, &a, &b).expect("first");
    op.run(&mut ctx, &a, &b).expect("second");

    let telemetry = rt.telemetry();
    assert_eq!(telemetry.enqueues, 6);
    assert_eq!(telemetry.split_dispatches, 2);
    assert_eq!(telemetry.forced_waits, 3);
}

#[test]
fn zero_window_never_waits() {
    let device = Arc::new(HostDevice::new());
    let rt = replaying_runtime(device.clone(), "custom_add_kernel_1_2_3_1", vec![16, 16, 0], 0);
    let mut ctx = rt.context();
    assert!(!ctx.throttle().is_enabled());
    let (a, b) = (ones(vec![1, 2, 3, 1]), ones(vec![1, 2, 3, 1]));
    let mut op = CustomAddOp::device("add0");
    for _ in 0..4 {
        op.run(&mut ctx, &a, &b).expect("run");
    }
    assert_eq!(rt.telemetry().forced_waits, 0);
    assert_eq!(device.stats().waits, 4);
}
