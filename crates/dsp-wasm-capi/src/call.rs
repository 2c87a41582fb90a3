//! Scalar call adapters and the buffer bridge entry point.

use std::slice;

use tracing::warn;

use crate::guard::{guard, report};
use crate::lifecycle::{DspWasmFunc, DspWasmInstance, DspWasmStore};
use crate::registry::{self, Kind};

/// Call an `(i32, i32) -> i32` export.
///
/// Returns 0 on any failure (invalid handle, signature mismatch, trap); the
/// cause is logged.
///
/// # Safety
///
/// `store` must not be in use by another thread.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_func_call_i32_i32_to_i32(
    store: *mut DspWasmStore,
    func: *const DspWasmFunc,
    a: i32,
    b: i32,
) -> i32 {
    guard("dspwasm_func_call_i32_i32_to_i32", 0, || {
        // SAFETY: distinct kinds, so the two handles never alias.
        let (Some(store), Some(func)) = (unsafe {
            (
                registry::get_mut(store, Kind::Store),
                registry::get(func, Kind::Func),
            )
        }) else {
            warn!("dspwasm_func_call_i32_i32_to_i32: invalid store or func handle");
            return 0;
        };

        let result = func.func.call_i32_i32_to_i32(&mut store.store, a, b);
        report("dspwasm_func_call_i32_i32_to_i32", result).unwrap_or(0)
    })
}

/// Call an `(f32) -> f32` export.
///
/// Returns 0.0 on any failure; the cause is logged.
///
/// # Safety
///
/// `store` must not be in use by another thread.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_func_call_f32_to_f32(
    store: *mut DspWasmStore,
    func: *const DspWasmFunc,
    x: f32,
) -> f32 {
    guard("dspwasm_func_call_f32_to_f32", 0.0, || {
        // SAFETY: distinct kinds, so the two handles never alias.
        let (Some(store), Some(func)) = (unsafe {
            (
                registry::get_mut(store, Kind::Store),
                registry::get(func, Kind::Func),
            )
        }) else {
            warn!("dspwasm_func_call_f32_to_f32: invalid store or func handle");
            return 0.0;
        };

        let result = func.func.call_f32_to_f32(&mut store.store, x);
        report("dspwasm_func_call_f32_to_f32", result).unwrap_or(0.0)
    })
}

/// Run a `(i32, i32, i32) -> ()` export over `buffer_size` samples.
///
/// `input` and `output` may be the same pointer for in-place processing;
/// partially overlapping buffers are rejected. Both may be null when
/// `buffer_size` is 0. Returns 0 on success and -1 on failure, in which case
/// `output` is unspecified and `input` is untouched (unless it is `output`).
///
/// # Safety
///
/// `input` must be valid for reads and `output` for writes of `buffer_size`
/// floats; `store` must not be in use by another thread.
#[allow(unsafe_code)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn dspwasm_func_call_buffer_process(
    store: *mut DspWasmStore,
    instance: *const DspWasmInstance,
    func: *const DspWasmFunc,
    input: *const f32,
    output: *mut f32,
    buffer_size: usize,
) -> i32 {
    guard("dspwasm_func_call_buffer_process", -1, || {
        // SAFETY: distinct kinds, so the three handles never alias.
        let (Some(store), Some(instance), Some(func)) = (unsafe {
            (
                registry::get_mut(store, Kind::Store),
                registry::get(instance, Kind::Instance),
                registry::get(func, Kind::Func),
            )
        }) else {
            warn!("dspwasm_func_call_buffer_process: invalid store, instance, or func handle");
            return -1;
        };

        let result = match Buffers::classify(input, output, buffer_size) {
            Some(Buffers::Empty) => instance
                .instance
                .process(&mut store.store, &func.func, &[], &mut []),
            Some(Buffers::InPlace) => {
                // SAFETY: valid for `buffer_size` floats per the contract.
                let buffer = unsafe { slice::from_raw_parts_mut(output, buffer_size) };
                instance
                    .instance
                    .process_in_place(&mut store.store, &func.func, buffer)
            }
            Some(Buffers::Disjoint) => {
                // SAFETY: valid and non-overlapping per the contract and
                // the overlap check.
                let (input, output) = unsafe {
                    (
                        slice::from_raw_parts(input, buffer_size),
                        slice::from_raw_parts_mut(output, buffer_size),
                    )
                };
                instance
                    .instance
                    .process(&mut store.store, &func.func, input, output)
            }
            None => {
                warn!(
                    buffer_size,
                    "dspwasm_func_call_buffer_process: null, misaligned, or overlapping buffers"
                );
                return -1;
            }
        };

        report("dspwasm_func_call_buffer_process", result).map_or(-1, |()| 0)
    })
}

/// How the caller's buffers relate to each other.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Buffers {
    Empty,
    InPlace,
    Disjoint,
}

impl Buffers {
    /// `None` for null, misaligned, oversized, or partially overlapping
    /// buffers.
    fn classify(input: *const f32, output: *const f32, count: usize) -> Option<Self> {
        if count == 0 {
            return Some(Self::Empty);
        }
        if input.is_null() || output.is_null() || !input.is_aligned() || !output.is_aligned() {
            return None;
        }
        let bytes = count.checked_mul(size_of::<f32>())?;
        if isize::try_from(bytes).is_err() {
            return None;
        }

        let (a, b) = (input as usize, output as usize);
        if a == b {
            return Some(Self::InPlace);
        }
        let overlap = a < b.checked_add(bytes)? && b < a.checked_add(bytes)?;
        (!overlap).then_some(Self::Disjoint)
    }
}
