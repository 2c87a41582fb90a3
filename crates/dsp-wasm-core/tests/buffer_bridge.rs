//! Buffer bridge tests: copy in, call, copy out.

use dsp_wasm_common::{BridgeConfig, EngineConfig, ExecutionConfig, RuntimeError};
use dsp_wasm_core::{AllocatorContext, Engine, Instance, LimitedAllocator, Module, Store, SystemAllocator};
use proptest::prelude::*;

const MAX_FRAMES: u32 = 512;

/// Copies `n` samples from input to output byte for byte.
const IDENTITY_WAT: &str = r#"
    (module
        (memory (export "memory") 1)
        (func (export "process") (param $in i32) (param $out i32) (param $n i32)
            (memory.copy
                (local.get $out)
                (local.get $in)
                (i32.shl (local.get $n) (i32.const 2))))
    )
"#;

/// Writes `in[i] + in[i-1]` (a two-tap sum) and keeps the last sample in a
/// global, so state carries across blocks.
const TWO_TAP_WAT: &str = r#"
    (module
        (memory (export "memory") 1)
        (global $prev (mut f32) (f32.const 0))
        (func (export "process") (param $in i32) (param $out i32) (param $n i32)
            (local $i i32)
            (local $x f32)
            (block $done
                (loop $next
                    (br_if $done (i32.ge_u (local.get $i) (local.get $n)))
                    (local.set $x
                        (f32.load (i32.add (local.get $in) (i32.shl (local.get $i) (i32.const 2)))))
                    (f32.store
                        (i32.add (local.get $out) (i32.shl (local.get $i) (i32.const 2)))
                        (f32.add (local.get $x) (global.get $prev)))
                    (global.set $prev (local.get $x))
                    (local.set $i (i32.add (local.get $i) (i32.const 1)))
                    (br $next))))
    )
"#;

fn bridge() -> BridgeConfig {
    BridgeConfig {
        max_frames: MAX_FRAMES,
        ..Default::default()
    }
}

fn store(engine: &Engine) -> Store<'_> {
    Store::with_bridge(engine, &ExecutionConfig::default(), bridge()).unwrap()
}

// ============================================================================
// Test: Identity
// ============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_identity_round_trips(input in prop::collection::vec(any::<f32>(), 0..=MAX_FRAMES as usize)) {
        let engine = Engine::new(&EngineConfig::default()).unwrap();
        let module = Module::from_wat(&engine, IDENTITY_WAT).unwrap();
        let mut store = store(&engine);
        let instance = Instance::new(&mut store, &module).unwrap();
        let process = instance.get_func(&mut store, b"process").unwrap();

        let mut output = vec![0.0_f32; input.len()];
        instance.process(&mut store, &process, &input, &mut output).unwrap();

        // Bit patterns, so NaN payloads count too
        let sent: Vec<u32> = input.iter().map(|s| s.to_bits()).collect();
        let received: Vec<u32> = output.iter().map(|s| s.to_bits()).collect();
        prop_assert_eq!(sent, received);
    }
}

#[test]
fn test_zero_frames_still_calls_guest() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    let module = Module::from_wat(&engine, IDENTITY_WAT).unwrap();
    let mut store = store(&engine);
    let instance = Instance::new(&mut store, &module).unwrap();
    let process = instance.get_func(&mut store, b"process").unwrap();

    let calls_before = store.metrics().calls;
    instance.process(&mut store, &process, &[], &mut []).unwrap();
    assert_eq!(store.metrics().calls, calls_before + 1);
}

#[test]
fn test_full_capacity() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    let module = Module::from_wat(&engine, IDENTITY_WAT).unwrap();
    let mut store = store(&engine);
    let instance = Instance::new(&mut store, &module).unwrap();
    let process = instance.get_func(&mut store, b"process").unwrap();

    #[allow(clippy::cast_precision_loss)]
    let input: Vec<f32> = (0..MAX_FRAMES).map(|i| i as f32).collect();
    let mut output = vec![0.0; input.len()];
    instance.process(&mut store, &process, &input, &mut output).unwrap();

    assert_eq!(output, input);
}

// ============================================================================
// Test: Failure Paths
// ============================================================================

#[test]
fn test_oversize_buffer_rejected() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    let module = Module::from_wat(&engine, IDENTITY_WAT).unwrap();
    let mut store = store(&engine);
    let instance = Instance::new(&mut store, &module).unwrap();
    let process = instance.get_func(&mut store, b"process").unwrap();

    let input = vec![0.25_f32; MAX_FRAMES as usize + 1];
    let mut output = vec![0.0; input.len()];
    let calls_before = store.metrics().calls;

    let result = instance.process(&mut store, &process, &input, &mut output);

    assert!(matches!(
        result,
        Err(RuntimeError::BufferTooLarge { requested, capacity })
            if requested == MAX_FRAMES as usize + 1 && capacity == MAX_FRAMES as usize
    ));
    assert!(input.iter().all(|&s| (s - 0.25).abs() < f32::EPSILON));
    assert_eq!(store.metrics().calls, calls_before);
}

#[test]
fn test_scalar_function_rejected() {
    let wat = r#"
        (module
            (memory (export "memory") 1)
            (func (export "add") (param i32 i32) (result i32)
                local.get 0
                local.get 1
                i32.add)
        )
    "#;

    let engine = Engine::new(&EngineConfig::default()).unwrap();
    let module = Module::from_wat(&engine, wat).unwrap();
    let mut store = store(&engine);
    let instance = Instance::new(&mut store, &module).unwrap();
    let add = instance.get_func(&mut store, b"add").unwrap();

    let result = instance.process(&mut store, &add, &[1.0], &mut [0.0]);
    assert!(matches!(result, Err(RuntimeError::SignatureMismatch { .. })));
}

#[test]
fn test_trapping_guest() {
    let wat = r#"
        (module
            (memory (export "memory") 1)
            (func (export "process") (param i32 i32 i32)
                unreachable)
        )
    "#;

    let engine = Engine::new(&EngineConfig::default()).unwrap();
    let module = Module::from_wat(&engine, wat).unwrap();
    let mut store = store(&engine);
    let instance = Instance::new(&mut store, &module).unwrap();
    let process = instance.get_func(&mut store, b"process").unwrap();

    let result = instance.process(&mut store, &process, &[1.0], &mut [0.0]);
    assert!(matches!(result, Err(RuntimeError::Trap { .. })));
}

#[test]
fn test_instance_from_other_store_rejected() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    let module = Module::from_wat(&engine, IDENTITY_WAT).unwrap();

    let mut store_a = store(&engine);
    let mut store_b = store(&engine);
    let instance_a = Instance::new(&mut store_a, &module).unwrap();
    let instance_b = Instance::new(&mut store_b, &module).unwrap();
    let process_a = instance_a.get_func(&mut store_a, b"process").unwrap();

    let result = instance_b.process(&mut store_b, &process_a, &[1.0], &mut [0.0]);
    assert!(matches!(result, Err(RuntimeError::StoreMismatch)));
}

// ============================================================================
// Test: Region Reuse
// ============================================================================

#[test]
fn test_state_carries_across_blocks() {
    let engine = Engine::new(&EngineConfig::default()).unwrap();
    let module = Module::from_wat(&engine, TWO_TAP_WAT).unwrap();
    let mut store = store(&engine);
    let instance = Instance::new(&mut store, &module).unwrap();
    let process = instance.get_func(&mut store, b"process").unwrap();

    let mut first = [0.0; 3];
    instance.process(&mut store, &process, &[1.0, 2.0, 3.0], &mut first).unwrap();
    assert_eq!(first, [1.0, 3.0, 5.0]);

    let mut second = [0.0; 2];
    instance.process(&mut store, &process, &[10.0, 20.0], &mut second).unwrap();
    assert_eq!(second, [13.0, 30.0]);
}

#[test]
fn test_guest_growth_does_not_move_region() {
    let wat = r#"
        (module
            (memory (export "memory") 1)
            (func (export "process") (param $in i32) (param $out i32) (param $n i32)
                (drop (memory.grow (i32.const 1)))
                (memory.copy
                    (local.get $out)
                    (local.get $in)
                    (i32.shl (local.get $n) (i32.const 2))))
        )
    "#;

    let engine = Engine::new(&EngineConfig::default()).unwrap();
    let module = Module::from_wat(&engine, wat).unwrap();
    let mut store = store(&engine);
    let instance = Instance::new(&mut store, &module).unwrap();
    let process = instance.get_func(&mut store, b"process").unwrap();
    let offsets = instance
        .region()
        .map(|r| (r.input_offset(), r.output_offset()));

    for block in 0..3 {
        #[allow(clippy::cast_precision_loss)]
        let input = [block as f32, 0.5];
        let mut output = [0.0; 2];
        instance.process(&mut store, &process, &input, &mut output).unwrap();
        assert_eq!(output, input);
    }

    let after = instance
        .region()
        .map(|r| (r.input_offset(), r.output_offset()));
    assert_eq!(offsets, after);
}

// ============================================================================
// Test: Host Allocator
// ============================================================================

#[test]
fn test_bridge_on_host_allocator() {
    let ctx = AllocatorContext::new(LimitedAllocator::new(SystemAllocator, 4 * 64 * 1024));
    let engine = Engine::with_allocator(&EngineConfig::default(), ctx.clone()).unwrap();
    let module = Module::from_wat(&engine, IDENTITY_WAT).unwrap();
    let mut store = store(&engine);
    let instance = Instance::new(&mut store, &module).unwrap();
    let process = instance.get_func(&mut store, b"process").unwrap();

    // Guest page plus region page, both moved into one grown block
    assert!(instance.region().is_some());
    assert_eq!(ctx.stats().bytes_in_use, 2 * 64 * 1024);

    let allocations = ctx.stats().allocations;
    let mut buffer = [0.1, 0.2, 0.3];
    for _ in 0..100 {
        instance.process_in_place(&mut store, &process, &mut buffer).unwrap();
    }

    assert_eq!(buffer, [0.1, 0.2, 0.3]);
    // The region was reserved once, at instantiation
    assert_eq!(ctx.stats().allocations, allocations);
}

#[test]
fn test_region_beyond_pool_is_reported() {
    // Guest page fits, region page does not
    let ctx = AllocatorContext::new(LimitedAllocator::new(SystemAllocator, 64 * 1024));
    let engine = Engine::with_allocator(&EngineConfig::default(), ctx).unwrap();
    let module = Module::from_wat(&engine, IDENTITY_WAT).unwrap();
    let mut store = store(&engine);
    let instance = Instance::new(&mut store, &module).unwrap();
    let process = instance.get_func(&mut store, b"process").unwrap();

    assert!(instance.region().is_none());
    let result = instance.process(&mut store, &process, &[1.0], &mut [0.0]);
    assert!(matches!(result, Err(ref e) if e.is_allocation_failure()));
}
