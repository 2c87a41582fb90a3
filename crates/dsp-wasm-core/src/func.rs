//! Function handles and the scalar call adapters.
//!
//! A [`Func`] is resolved by exact export name and classified once, at
//! lookup, into a [`CallShape`]. Only the typed function matching that shape
//! is cached; calling through any other adapter is a
//! [`RuntimeError::SignatureMismatch`], never undefined behavior.

use std::fmt::Write as _;

use tracing::debug;
use wasmtime::{FuncType, TypedFunc, ValType};

use dsp_wasm_common::RuntimeError;

use crate::Store;

/// Signatures the call adapters understand.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    /// `(i32, i32) -> i32`
    I32I32ToI32,
    /// `(f32) -> f32`
    F32ToF32,
    /// `(i32, i32, i32) -> ()`: input offset, output offset, frame count.
    BufferProcess,
    /// Anything else. Such functions can be looked up but not called.
    Other,
}

impl CallShape {
    /// The signature in the notation used by error messages.
    pub fn signature(self) -> &'static str {
        match self {
            Self::I32I32ToI32 => "(i32, i32) -> i32",
            Self::F32ToF32 => "(f32) -> f32",
            Self::BufferProcess => "(i32, i32, i32) -> ()",
            Self::Other => "other",
        }
    }
}

enum Typed {
    I32I32ToI32(TypedFunc<(i32, i32), i32>),
    F32ToF32(TypedFunc<f32, f32>),
    BufferProcess(TypedFunc<(i32, i32, i32), ()>),
    Other,
}

/// A callable export of one instance.
///
/// Holds no reference to the store; it remembers the store's id and every
/// call checks it.
pub struct Func {
    typed: Typed,
    store_id: u64,
    name: String,
    signature: String,
}

impl Func {
    pub(crate) fn resolve(
        store: &mut Store<'_>,
        instance: &wasmtime::Instance,
        name: &[u8],
    ) -> Result<Self, RuntimeError> {
        // Export names are UTF-8 by validation, so other bytes never match.
        let Ok(name_str) = std::str::from_utf8(name) else {
            return Err(RuntimeError::export_not_found(name));
        };
        let Some(func) = instance.get_func(store.inner_mut(), name_str) else {
            return Err(RuntimeError::export_not_found(name));
        };

        let ty = func.ty(store.inner());
        let signature = describe(&ty);
        let params: Vec<ValType> = ty.params().collect();
        let results: Vec<ValType> = ty.results().collect();

        let typed_err =
            |e: wasmtime::Error| RuntimeError::signature_mismatch("typed function", e.to_string());

        let typed = match (params.as_slice(), results.as_slice()) {
            ([ValType::I32, ValType::I32], [ValType::I32]) => {
                Typed::I32I32ToI32(func.typed(store.inner()).map_err(typed_err)?)
            }
            ([ValType::F32], [ValType::F32]) => {
                Typed::F32ToF32(func.typed(store.inner()).map_err(typed_err)?)
            }
            ([ValType::I32, ValType::I32, ValType::I32], []) => {
                Typed::BufferProcess(func.typed(store.inner()).map_err(typed_err)?)
            }
            _ => Typed::Other,
        };

        let resolved = Self {
            typed,
            store_id: store.id(),
            name: name_str.to_string(),
            signature,
        };

        debug!(
            name = %resolved.name,
            signature = %resolved.signature,
            shape = ?resolved.shape(),
            "Function resolved"
        );

        Ok(resolved)
    }

    /// The call shape this function was classified as.
    pub fn shape(&self) -> CallShape {
        match self.typed {
            Typed::I32I32ToI32(_) => CallShape::I32I32ToI32,
            Typed::F32ToF32(_) => CallShape::F32ToF32,
            Typed::BufferProcess(_) => CallShape::BufferProcess,
            Typed::Other => CallShape::Other,
        }
    }

    /// The export name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The actual signature, e.g. `(i32, i32) -> i32`.
    pub fn signature(&self) -> &str {
        &self.signature
    }

    /// Id of the store this function lives in.
    pub fn store_id(&self) -> u64 {
        self.store_id
    }

    pub(crate) fn check_store(&self, store: &Store<'_>) -> Result<(), RuntimeError> {
        if self.store_id == store.id() {
            Ok(())
        } else {
            Err(RuntimeError::StoreMismatch)
        }
    }

    /// Call an `(i32, i32) -> i32` function.
    ///
    /// # Errors
    ///
    /// Returns an error on store or signature mismatch, a trap, or fuel
    /// exhaustion.
    pub fn call_i32_i32_to_i32(
        &self,
        store: &mut Store<'_>,
        a: i32,
        b: i32,
    ) -> Result<i32, RuntimeError> {
        self.check_store(store)?;
        let Typed::I32I32ToI32(ref typed) = self.typed else {
            return Err(self.mismatch(CallShape::I32I32ToI32));
        };

        store.begin_call()?;
        let result = typed.call(store.inner_mut(), (a, b));
        store.finish_call(result)
    }

    /// Call an `(f32) -> f32` function.
    ///
    /// # Errors
    ///
    /// Returns an error on store or signature mismatch, a trap, or fuel
    /// exhaustion.
    pub fn call_f32_to_f32(&self, store: &mut Store<'_>, x: f32) -> Result<f32, RuntimeError> {
        self.check_store(store)?;
        let Typed::F32ToF32(ref typed) = self.typed else {
            return Err(self.mismatch(CallShape::F32ToF32));
        };

        store.begin_call()?;
        let result = typed.call(store.inner_mut(), x);
        store.finish_call(result)
    }

    pub(crate) fn buffer_process(
        &self,
    ) -> Result<&TypedFunc<(i32, i32, i32), ()>, RuntimeError> {
        match self.typed {
            Typed::BufferProcess(ref typed) => Ok(typed),
            _ => Err(self.mismatch(CallShape::BufferProcess)),
        }
    }

    fn mismatch(&self, expected: CallShape) -> RuntimeError {
        RuntimeError::signature_mismatch(expected.signature(), self.signature.clone())
    }
}

impl std::fmt::Debug for Func {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Func")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .field("store_id", &self.store_id)
            .finish_non_exhaustive()
    }
}

/// Render a function type as `(p1, p2) -> r`.
fn describe(ty: &FuncType) -> String {
    let mut out = String::from("(");
    for (i, param) in ty.params().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{param}");
    }
    out.push_str(") -> ");

    let results: Vec<ValType> = ty.results().collect();
    match results.as_slice() {
        [] => out.push_str("()"),
        [single] => {
            let _ = write!(out, "{single}");
        }
        many => {
            out.push('(');
            for (i, result) in many.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                let _ = write!(out, "{result}");
            }
            out.push(')');
        }
    }
    out
}
