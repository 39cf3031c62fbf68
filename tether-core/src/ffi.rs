//! C ABI for linking tether-core as a static library from Android (NDK) or other C/C++ hosts.
//! The host owns the event loop: it calls these from one thread only and polls actions
//! with `tether_core_next_action` after every event.

use std::ffi::c_void;
use std::os::raw::c_int;
use std::slice;

use crate::chunk::TransferEvent;
use crate::config::DeliveryConfig;
use crate::delivery::{Outcome, SubmitOptions};
use crate::protocol::PROTOCOL_VERSION;
use crate::txid::TransactionId;
use crate::{Action, TetherCore};

/// Action kinds reported by `tether_core_next_action`.
pub const ACTION_TRANSMIT: u8 = 1;
pub const ACTION_SCHEDULE_RETRY: u8 = 2;
pub const ACTION_RESOLVED: u8 = 3;
pub const ACTION_TRANSFER_PROGRESS: u8 = 4;
pub const ACTION_TRANSFER_COMPLETE: u8 = 5;
pub const ACTION_TRANSFER_ABANDONED: u8 = 6;
pub const ACTION_TRANSFER_CANCELLED: u8 = 7;

/// Outcome codes in `out_value` for `ACTION_RESOLVED`.
pub const OUTCOME_DELIVERED: u32 = 0;
pub const OUTCOME_FAILED: u32 = 1;
pub const OUTCOME_CANCELLED: u32 = 2;

/// Returns the current protocol version. Used so the staticlib exports a C symbol and is linkable.
#[no_mangle]
pub extern "C" fn tether_core_version() -> u8 {
    PROTOCOL_VERSION
}

/// Create a new core instance. `frame_limit` 0 keeps the default. Returns opaque handle or null on invalid settings.
#[no_mangle]
pub extern "C" fn tether_core_create(max_retries: u32, frame_limit: u32) -> *mut c_void {
    let mut config = DeliveryConfig {
        max_retries,
        ..DeliveryConfig::default()
    };
    if frame_limit != 0 {
        config.frame_limit = frame_limit as usize;
    }
    if config.validate().is_err() {
        return std::ptr::null_mut();
    }
    let core = TetherCore::with_config(config);
    Box::into_raw(Box::new(core)) as *mut c_void
}

/// Destroy core instance. No-op if h is null.
#[no_mangle]
pub extern "C" fn tether_core_destroy(h: *mut c_void) {
    if h.is_null() {
        return;
    }
    let _ = unsafe { Box::from_raw(h as *mut TetherCore) };
}

/// Queue one message. Returns its transaction id (0..=254), or -1 on error.
#[no_mangle]
pub extern "C" fn tether_core_send_message(h: *mut c_void, bytes: *const u8, len: usize) -> c_int {
    if h.is_null() || (bytes.is_null() && len != 0) {
        return -1;
    }
    let core = unsafe { &mut *(h as *mut TetherCore) };
    let payload = copy_in(bytes, len);
    core.send_message(payload, SubmitOptions::default()).get() as c_int
}

/// Start a chunked transfer. Returns the first frame's transaction id, or -1 on error (object too large).
#[no_mangle]
pub extern "C" fn tether_core_send_object(
    h: *mut c_void,
    object_id: u32,
    bytes: *const u8,
    len: usize,
) -> c_int {
    if h.is_null() || (bytes.is_null() && len != 0) {
        return -1;
    }
    let core = unsafe { &mut *(h as *mut TetherCore) };
    match core.send_object(object_id, copy_in(bytes, len)) {
        Ok(id) => id.get() as c_int,
        Err(_) => -1,
    }
}

/// Peer acknowledged `id`. Returns 0, or -1 if h is null.
#[no_mangle]
pub extern "C" fn tether_core_on_ack(h: *mut c_void, id: u8) -> c_int {
    with_core(h, |core| core.on_ack(TransactionId::new(id)))
}

/// Peer rejected `id`. Returns 0, or -1 if h is null.
#[no_mangle]
pub extern "C" fn tether_core_on_nack(h: *mut c_void, id: u8) -> c_int {
    with_core(h, |core| core.on_nack(TransactionId::new(id)))
}

/// A delay requested by `ACTION_SCHEDULE_RETRY` expired. Returns 0, or -1 if h is null.
#[no_mangle]
pub extern "C" fn tether_core_on_retry_due(h: *mut c_void, id: u8) -> c_int {
    with_core(h, |core| core.on_retry_due(TransactionId::new(id)))
}

/// Cancel all queued and in-flight messages. Returns 0, or -1 if h is null.
#[no_mangle]
pub extern "C" fn tether_core_clear(h: *mut c_void) -> c_int {
    with_core(h, |core| core.clear())
}

/// Pop the next action.
/// - `out_kind`: one of the `ACTION_*` codes.
/// - `out_id`: transaction id (transmit, retry, resolved).
/// - `out_value`: payload length (transmit), delay ms (retry), `OUTCOME_*` (resolved), object id (transfer events).
/// - `out_buf`: payload bytes for transmit.
///
/// Returns 1 if an action was written, 0 if none is pending, -1 on error (null pointer, or
/// `out_buf` too small; the action stays queued).
#[no_mangle]
pub extern "C" fn tether_core_next_action(
    h: *mut c_void,
    out_kind: *mut u8,
    out_id: *mut u8,
    out_value: *mut u32,
    out_buf: *mut u8,
    out_buf_len: usize,
) -> c_int {
    if h.is_null() || out_kind.is_null() || out_id.is_null() || out_value.is_null() {
        return -1;
    }
    let core = unsafe { &mut *(h as *mut TetherCore) };
    let Some(action) = core.pop_action() else {
        return 0;
    };
    let (kind, id, value) = match &action {
        Action::Transmit { id, payload } => {
            if out_buf.is_null() || payload.len() > out_buf_len {
                core.unpop_action(action);
                return -1;
            }
            unsafe {
                out_buf.copy_from_nonoverlapping(payload.as_ptr(), payload.len());
            }
            (ACTION_TRANSMIT, id.get(), payload.len() as u32)
        }
        Action::ScheduleRetry { id, after } => (
            ACTION_SCHEDULE_RETRY,
            id.get(),
            after.as_millis().min(u32::MAX as u128) as u32,
        ),
        Action::Resolved(r) => {
            let outcome = match r.outcome {
                Outcome::Delivered => OUTCOME_DELIVERED,
                Outcome::Failed => OUTCOME_FAILED,
                Outcome::Cancelled => OUTCOME_CANCELLED,
            };
            (ACTION_RESOLVED, r.id.get(), outcome)
        }
        Action::Transfer(event) => match *event {
            TransferEvent::Progress { object_id, .. } => (ACTION_TRANSFER_PROGRESS, 0, object_id),
            TransferEvent::Complete { object_id } => (ACTION_TRANSFER_COMPLETE, 0, object_id),
            TransferEvent::Abandoned { object_id, .. } => {
                (ACTION_TRANSFER_ABANDONED, 0, object_id)
            }
            TransferEvent::Cancelled { object_id, .. } => {
                (ACTION_TRANSFER_CANCELLED, 0, object_id)
            }
        },
    };
    unsafe {
        *out_kind = kind;
        *out_id = id;
        *out_value = value;
    }
    1
}

fn with_core(h: *mut c_void, f: impl FnOnce(&mut TetherCore)) -> c_int {
    if h.is_null() {
        return -1;
    }
    let core = unsafe { &mut *(h as *mut TetherCore) };
    f(core);
    0
}

fn copy_in(bytes: *const u8, len: usize) -> Vec<u8> {
    if len == 0 {
        return Vec::new();
    }
    unsafe { slice::from_raw_parts(bytes, len) }.to_vec()
}
