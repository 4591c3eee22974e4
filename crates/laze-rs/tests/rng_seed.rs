use std::sync::Arc;

use anyhow::Result;
use laze_rs::ir::NodeOp;
use laze_rs::{Device, LazyGraphExecutor, LazyTensor};
use laze_rs_backend_ref_cpu::CpuRefBackend;

fn new_executor() -> Arc<LazyGraphExecutor<CpuRefBackend>> {
    LazyGraphExecutor::new(Arc::new(CpuRefBackend::new()))
}

/// Records one uniform draw, runs the step, and reads the result back.
fn draw(executor: &Arc<LazyGraphExecutor<CpuRefBackend>>, device: Device) -> Result<Vec<f32>> {
    let sample = LazyTensor::rng_uniform(executor, device, [8]);
    executor.mark_step(&device)?;
    Ok(sample.to_literal()?.to_f32_vec()?)
}

#[test]
fn seed_defaults_until_set() {
    let executor = new_executor();
    let device = Device::cpu(0);

    assert_eq!(executor.get_running_seed(&device), 101);

    executor.set_rng_seed(&device, 7);
    assert_eq!(executor.get_running_seed(&device), 7);
}

#[test]
fn set_seed_regenerates_the_seed_node() {
    let executor = new_executor();
    let device = Device::cpu(0);

    let first = executor.get_rng_seed(&device);
    let again = executor.get_rng_seed(&device);
    assert!(first.ptr_eq(&again), "the seed node is stable between sets");

    executor.set_rng_seed(&device, 5);
    let replaced = executor.get_rng_seed(&device);
    assert!(!first.ptr_eq(&replaced));
    match (first.op(), replaced.op()) {
        (NodeOp::Seed(101), NodeOp::Seed(5)) => {}
        (before, after) => panic!("unexpected seed nodes: {before:?} then {after:?}"),
    }
}

#[test]
fn seed_state_is_per_device() {
    let executor = new_executor();
    let cpu0 = Device::cpu(0);
    let cpu1 = Device::cpu(1);

    executor.set_rng_seed(&cpu0, 11);

    assert_eq!(executor.get_running_seed(&cpu0), 11);
    assert_eq!(executor.get_running_seed(&cpu1), 101);
    assert!(!executor.get_rng_seed(&cpu0).ptr_eq(&executor.get_rng_seed(&cpu1)));
}

#[test]
fn seeded_draws_replay_identically() -> Result<()> {
    let executor = new_executor();
    let device = Device::cpu(0);

    executor.set_rng_seed(&device, 42);
    let first = draw(&executor, device)?;
    executor.set_rng_seed(&device, 42);
    let replay = draw(&executor, device)?;

    assert_eq!(first, replay);
    assert!(first.iter().all(|x| (0.0..1.0).contains(x)));

    let twin = new_executor();
    twin.set_rng_seed(&device, 42);
    assert_eq!(draw(&twin, device)?, first, "replay holds across executors");
    Ok(())
}

#[test]
fn consecutive_steps_draw_distinct_streams() -> Result<()> {
    let executor = new_executor();
    let device = Device::cpu(0);

    let first = draw(&executor, device)?;
    let second = draw(&executor, device)?;

    assert_ne!(first, second, "the seed advances between steps");
    Ok(())
}

#[test]
fn seed_advance_is_deterministic_across_executors() -> Result<()> {
    let left = new_executor();
    let right = new_executor();
    let device = Device::cpu(0);

    for _ in 0..3 {
        assert_eq!(draw(&left, device)?, draw(&right, device)?);
        assert_eq!(
            left.get_running_seed(&device),
            right.get_running_seed(&device)
        );
    }
    assert_ne!(left.get_running_seed(&device), 101);
    Ok(())
}

#[test]
fn empty_steps_advance_the_seed() -> Result<()> {
    let executor = new_executor();
    let device = Device::cpu(0);

    let before = executor.get_running_seed(&device);
    executor.mark_step(&device)?;
    let after = executor.get_running_seed(&device);
    assert_ne!(before, after);

    let twin = new_executor();
    twin.mark_step(&device)?;
    assert_eq!(
        twin.get_running_seed(&device),
        after,
        "empty and non-empty steps share one advance rule"
    );
    Ok(())
}

#[test]
fn recorded_draws_keep_the_seed_they_captured() -> Result<()> {
    let executor = new_executor();
    let device = Device::cpu(0);

    executor.set_rng_seed(&device, 42);
    let sample = LazyTensor::rng_uniform(&executor, device, [8]);
    executor.set_rng_seed(&device, 43);
    executor.mark_step(&device)?;

    let reference = new_executor();
    reference.set_rng_seed(&device, 42);
    assert_eq!(
        sample.to_literal()?.to_f32_vec()?,
        draw(&reference, device)?,
        "a draw samples with the seed current when it was recorded"
    );
    Ok(())
}
