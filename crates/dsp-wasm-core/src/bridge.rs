//! Host↔guest buffer bridge.
//!
//! Right after instantiation the bridge grows the instance's exported memory
//! by enough whole pages to hold `max_frames` input samples followed by
//! `max_frames` output samples. Those pages sit above everything the guest
//! owned at that moment, and any later guest `memory.grow` lands above them,
//! so the region never overlaps guest data. Every call reuses it:
//!
//! ```text
//!  0                    old end          old end + 4*max_frames
//!  | guest data ...     | input region   | output region   | later growth
//! ```
//!
//! A memory whose declared maximum leaves no room for the region pages gets
//! no region; the instance still works for scalar calls.
//!
//! Samples cross the boundary as little-endian IEEE-754 bytes, the layout
//! wasm loads and stores use. The call path performs no allocation.

use tracing::{debug, warn};
use wasmtime::{Memory, TypedFunc};

use dsp_wasm_common::{RuntimeError, WASM_PAGE_SIZE};

use crate::Store;
use crate::func::Func;
use crate::instance::Instance;

const SAMPLE_BYTES: usize = size_of::<f32>();

/// The reserved input/output area inside one instance's linear memory.
#[derive(Debug, Clone, Copy)]
pub struct BufferRegion {
    memory: Memory,
    input_offset: usize,
    output_offset: usize,
    capacity_frames: usize,
}

impl BufferRegion {
    /// Guest address of the first input sample.
    pub fn input_offset(&self) -> usize {
        self.input_offset
    }

    /// Guest address of the first output sample.
    pub fn output_offset(&self) -> usize {
        self.output_offset
    }

    /// Most frames one call can carry.
    pub fn capacity_frames(&self) -> usize {
        self.capacity_frames
    }
}

/// Outcome of reserving the region, kept on the instance.
///
/// Instantiation succeeds even when no region can be reserved; the buffer
/// bridge then reports the stored reason on every call while the scalar
/// adapters keep working.
#[derive(Debug, Clone)]
pub(crate) enum RegionState {
    Reserved(BufferRegion),
    Disabled,
    MissingMemory(String),
    LimitExceeded(u32),
    Exhausted,
    Unavailable(String),
}

impl RegionState {
    pub(crate) fn region(&self) -> Option<&BufferRegion> {
        match self {
            Self::Reserved(region) => Some(region),
            _ => None,
        }
    }

    fn get(&self) -> Result<&BufferRegion, RuntimeError> {
        match self {
            Self::Reserved(region) => Ok(region),
            Self::Disabled => Err(RuntimeError::region_unavailable(
                "bridge disabled (max_frames = 0)",
            )),
            Self::MissingMemory(name) => Err(RuntimeError::MissingMemory { name: name.clone() }),
            Self::LimitExceeded(limit_mb) => Err(RuntimeError::MemoryLimitExceeded {
                limit_mb: *limit_mb,
            }),
            Self::Exhausted => Err(RuntimeError::allocation_failed(
                "host allocator could not back the bridge region",
            )),
            Self::Unavailable(reason) => Err(RuntimeError::region_unavailable(reason.clone())),
        }
    }
}

/// Grow the instance's memory and carve out the bridge region.
pub(crate) fn reserve(store: &mut Store<'_>, instance: &wasmtime::Instance) -> RegionState {
    let max_frames = store.bridge().max_frames as usize;
    if max_frames == 0 {
        return RegionState::Disabled;
    }

    let export = store.bridge().memory_export.clone();
    let Some(memory) = instance.get_memory(store.inner_mut(), &export) else {
        debug!(memory_export = %export, "No exported memory, bridge region not reserved");
        return RegionState::MissingMemory(export);
    };

    let pages = store.bridge().region_pages();
    let failures_before = store.engine().allocation_failures();

    match memory.grow(store.inner_mut(), pages) {
        Ok(old_pages) => {
            let Some(input_offset) = usize::try_from(old_pages)
                .ok()
                .and_then(|p| p.checked_mul(WASM_PAGE_SIZE))
            else {
                return RegionState::Unavailable("memory end not addressable".to_string());
            };
            let output_offset = input_offset + max_frames * SAMPLE_BYTES;
            let end = output_offset + max_frames * SAMPLE_BYTES;

            // Offsets travel to the guest as i32 addresses.
            if u32::try_from(end).is_err() {
                return RegionState::Unavailable(format!(
                    "region end {end:#x} beyond 32-bit address space"
                ));
            }

            debug!(
                input_offset,
                output_offset,
                capacity_frames = max_frames,
                pages,
                "Bridge region reserved"
            );

            RegionState::Reserved(BufferRegion {
                memory,
                input_offset,
                output_offset,
                capacity_frames: max_frames,
            })
        }
        Err(e) => {
            warn!(pages, error = %e, "Bridge region could not be reserved");

            if store.engine().allocation_failures() > failures_before {
                return RegionState::Exhausted;
            }

            let current = memory.data_size(store.inner());
            let requested = usize::try_from(pages)
                .ok()
                .and_then(|p| p.checked_mul(WASM_PAGE_SIZE))
                .and_then(|bytes| bytes.checked_add(current));
            let limit = store.max_memory_mb() as usize * 1024 * 1024;
            if requested.is_none_or(|total| total > limit) {
                RegionState::LimitExceeded(store.max_memory_mb())
            } else {
                RegionState::Unavailable(e.to_string())
            }
        }
    }
}

/// Run `func` over `input`, writing the result into `output`.
///
/// # Errors
///
/// Returns an error if the handles belong to another store, the function is
/// not `(i32, i32, i32) -> ()`, the lengths differ, the buffer exceeds the
/// region, or the guest traps. `output` is unspecified on error; `input` is
/// never modified.
pub fn process(
    store: &mut Store<'_>,
    instance: &Instance,
    func: &Func,
    input: &[f32],
    output: &mut [f32],
) -> Result<(), RuntimeError> {
    if input.len() != output.len() {
        return Err(RuntimeError::invalid_argument(format!(
            "input has {} frames, output has {}",
            input.len(),
            output.len()
        )));
    }

    let (region, typed) = prepare(store, instance, func, input.len())?;
    write_input(store, region, input)?;
    call(store, typed, region, input.len())?;
    read_output(store, region, output)
}

/// Like [`process`], reading and writing the same buffer.
///
/// # Errors
///
/// Same as [`process`]; `buffer` is unspecified on error.
pub fn process_in_place(
    store: &mut Store<'_>,
    instance: &Instance,
    func: &Func,
    buffer: &mut [f32],
) -> Result<(), RuntimeError> {
    let (region, typed) = prepare(store, instance, func, buffer.len())?;
    write_input(store, region, buffer)?;
    call(store, typed, region, buffer.len())?;
    read_output(store, region, buffer)
}

fn prepare<'a>(
    store: &Store<'_>,
    instance: &'a Instance,
    func: &'a Func,
    count: usize,
) -> Result<(&'a BufferRegion, &'a TypedFunc<(i32, i32, i32), ()>), RuntimeError> {
    instance.check_store(store)?;
    func.check_store(store)?;

    let typed = func.buffer_process()?;
    let region = instance.region_state().get()?;

    if count > region.capacity_frames {
        return Err(RuntimeError::BufferTooLarge {
            requested: count,
            capacity: region.capacity_frames,
        });
    }

    Ok((region, typed))
}

fn write_input(
    store: &mut Store<'_>,
    region: &BufferRegion,
    frames: &[f32],
) -> Result<(), RuntimeError> {
    let start = region.input_offset;
    let data = region.memory.data_mut(store.inner_mut());
    let bytes = data
        .get_mut(start..start + frames.len() * SAMPLE_BYTES)
        .ok_or_else(|| RuntimeError::region_unavailable("input region outside linear memory"))?;

    for (chunk, sample) in bytes.chunks_exact_mut(SAMPLE_BYTES).zip(frames) {
        chunk.copy_from_slice(&sample.to_le_bytes());
    }
    Ok(())
}

fn read_output(
    store: &Store<'_>,
    region: &BufferRegion,
    frames: &mut [f32],
) -> Result<(), RuntimeError> {
    let start = region.output_offset;
    let data = region.memory.data(store.inner());
    let bytes = data
        .get(start..start + frames.len() * SAMPLE_BYTES)
        .ok_or_else(|| RuntimeError::region_unavailable("output region outside linear memory"))?;

    for (sample, chunk) in frames.iter_mut().zip(bytes.chunks_exact(SAMPLE_BYTES)) {
        *sample = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
    }
    Ok(())
}

// Wasm addresses are unsigned; the i32 argument carries the same bits.
#[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
fn call(
    store: &mut Store<'_>,
    typed: &TypedFunc<(i32, i32, i32), ()>,
    region: &BufferRegion,
    count: usize,
) -> Result<(), RuntimeError> {
    let args = (
        region.input_offset as u32 as i32,
        region.output_offset as u32 as i32,
        count as u32 as i32,
    );

    store.begin_call()?;
    let result = typed.call(store.inner_mut(), args);
    store.finish_call(result)
}
