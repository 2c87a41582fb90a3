//! Panic containment and error reporting at the C boundary.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tracing::{error, warn};

use dsp_wasm_common::RuntimeError;

/// Run `f`, returning `fallback` if it panics.
///
/// Unwinding across an `extern "C"` frame aborts the process, so every
/// exported function runs its body through this.
pub(crate) fn guard<R>(function: &'static str, fallback: R, f: impl FnOnce() -> R) -> R {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => value,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            error!(function, panic = %message, "Panic caught at C boundary");
            fallback
        }
    }
}

/// Log a failed operation and turn the result into an `Option`.
pub(crate) fn report<T>(function: &'static str, result: Result<T, RuntimeError>) -> Option<T> {
    result
        .inspect_err(|e| warn!(function, error = %e, "C API call failed"))
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_passes_value_through() {
        assert_eq!(guard("test", -1, || 7), 7);
    }

    #[test]
    fn test_guard_catches_panic() {
        let result = guard("test", -1, || -> i32 { panic!("boom") });
        assert_eq!(result, -1);
    }

    #[test]
    fn test_report() {
        assert_eq!(report("test", Ok::<_, RuntimeError>(3)), Some(3));
        assert_eq!(report::<i32>("test", Err(RuntimeError::StoreMismatch)), None);
    }
}
