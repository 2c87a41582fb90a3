//! Registry of live C handles.
//!
//! Every handle handed to C is a boxed value whose address is recorded here
//! together with its kind and the handle it borrows from. Before any pointer
//! from C is dereferenced it is looked up:
//!
//! - null, deleted, or wrong-kind pointers are rejected, so use-after-delete
//!   and double delete return the failure sentinel instead of faulting
//! - a handle other live handles borrow from (an engine with live stores or
//!   modules) cannot be deleted; the request is logged and ignored
//!
//! A freed address can be reused by a later allocation of the same kind, in
//! which case a stale pointer resolves to the new handle. Instances and
//! functions still refuse to run against a store they do not belong to.

use std::sync::LazyLock;

use dashmap::DashMap;
use tracing::{debug, error};

/// The kind of object behind a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Kind {
    Engine,
    Store,
    Module,
    Instance,
    Func,
}

#[derive(Debug, Clone, Copy)]
struct Entry {
    kind: Kind,
    parent: Option<usize>,
}

static HANDLES: LazyLock<DashMap<usize, Entry>> = LazyLock::new(DashMap::new);

/// Leak `value` to C and record it.
pub(crate) fn register<T>(value: Box<T>, kind: Kind, parent: Option<usize>) -> *mut T {
    let ptr = Box::into_raw(value);
    HANDLES.insert(ptr as usize, Entry { kind, parent });
    debug!(?kind, addr = ptr as usize, "Handle registered");
    ptr
}

/// Whether `ptr` is a live handle of `kind`.
pub(crate) fn is_live<T>(ptr: *const T, kind: Kind) -> bool {
    !ptr.is_null()
        && HANDLES
            .get(&(ptr as usize))
            .is_some_and(|entry| entry.kind == kind)
}

/// Borrow a live handle.
///
/// # Safety
///
/// No mutable reference to the same handle may be alive.
#[allow(unsafe_code)]
pub(crate) unsafe fn get<'a, T>(ptr: *const T, kind: Kind) -> Option<&'a T> {
    if is_live(ptr, kind) {
        // SAFETY: registered pointers come from `Box::into_raw` and stay
        // valid until `release` removes them.
        Some(unsafe { &*ptr })
    } else {
        None
    }
}

/// Mutably borrow a live handle.
///
/// # Safety
///
/// No other reference to the same handle may be alive.
#[allow(unsafe_code)]
pub(crate) unsafe fn get_mut<'a, T>(ptr: *mut T, kind: Kind) -> Option<&'a mut T> {
    if is_live(ptr, kind) {
        // SAFETY: as in `get`; exclusivity is the caller's contract.
        Some(unsafe { &mut *ptr })
    } else {
        None
    }
}

/// Take a handle back from C, if it is live and nothing borrows from it.
#[allow(unsafe_code)]
pub(crate) fn release<T>(ptr: *mut T, kind: Kind) -> Option<Box<T>> {
    let addr = ptr as usize;
    if !is_live(ptr, kind) {
        debug!(?kind, addr, "Ignoring delete of unknown handle");
        return None;
    }

    let dependents = dependents(addr);
    if dependents > 0 {
        error!(
            ?kind,
            addr, dependents, "Refusing to delete a handle that live handles depend on"
        );
        return None;
    }

    HANDLES.remove_if(&addr, |_, entry| entry.kind == kind)?;
    debug!(?kind, addr, "Handle released");

    // SAFETY: the entry was just removed, so this is the only owner of the
    // pointer `register` produced.
    Some(unsafe { Box::from_raw(ptr) })
}

/// Number of live handles that borrow from `addr`.
pub(crate) fn dependents(addr: usize) -> usize {
    HANDLES
        .iter()
        .filter(|entry| entry.value().parent == Some(addr))
        .count()
}
