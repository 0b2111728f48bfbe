//! C entry point used as the custom-call target for host callbacks.

use std::os::raw::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};

use crate::callback::{panic_message, CallbackError, CpuCallback};
use crate::status::CustomCallStatus;

/// Leaks `callback` and returns the handle the runtime stores in the first operand of the
/// custom call.
pub fn into_handle(callback: CpuCallback) -> usize {
    Box::into_raw(Box::new(callback)) as usize
}

/// Reclaims a handle created by [`into_handle`].
///
/// # Safety
/// `handle` must come from [`into_handle`], be released at most once and not be in use by a
/// concurrent [`cmdbuf_cpu_callback`] call.
pub unsafe fn release_handle(handle: usize) {
    if handle != 0 {
        drop(unsafe { Box::from_raw(handle as *mut CpuCallback) });
    }
}

#[no_mangle]
/// # Safety
/// `inputs[0]` must point to a `usize` holding a live handle from [`into_handle`], followed by
/// one readable buffer per callback argument. `output` must point to one writable buffer per
/// callback result, each at least as large as the result's `size_in_bytes`. Token slots may be
/// null. `status` must be null or point to a live [`CustomCallStatus`].
pub unsafe extern "C" fn cmdbuf_cpu_callback(
    output: *mut c_void,
    inputs: *const *const c_void,
    status: *mut c_void,
) {
    let outcome = catch_unwind(AssertUnwindSafe(|| unsafe { dispatch(output, inputs) }));
    let message = match outcome {
        Ok(Ok(())) => return,
        Ok(Err(err)) => err.to_string(),
        Err(payload) => CallbackError::Callable(panic_message(&*payload)).to_string(),
    };
    if let Some(status) = unsafe { (status as *mut CustomCallStatus).as_mut() } {
        status.set_failure(message);
    }
}

unsafe fn dispatch(output: *mut c_void, inputs: *const *const c_void) -> Result<(), CallbackError> {
    if inputs.is_null() {
        return Err(CallbackError::NullPointer("inputs"));
    }
    let handle = unsafe { (*inputs as *const usize).as_ref() }
        .ok_or(CallbackError::NullPointer("callback handle"))?;
    let callback = unsafe { (*handle as *const CpuCallback).as_ref() }
        .ok_or(CallbackError::NullPointer("callback"))?;

    let raw_inputs = unsafe { std::slice::from_raw_parts(inputs.add(1), callback.args().len()) };
    let mut input_buffers = Vec::with_capacity(raw_inputs.len());
    for (ptr, arg) in raw_inputs.iter().zip(callback.args()) {
        let len = arg.byte_len();
        let buffer: &[u8] = if len == 0 {
            &[]
        } else if ptr.is_null() {
            return Err(CallbackError::NullPointer("input buffer"));
        } else {
            unsafe { std::slice::from_raw_parts(*ptr as *const u8, len) }
        };
        input_buffers.push(buffer);
    }

    let results = callback.results();
    let raw_outputs: &[*mut c_void] = if results.is_empty() {
        &[]
    } else if output.is_null() {
        return Err(CallbackError::NullPointer("output"));
    } else {
        unsafe { std::slice::from_raw_parts(output as *const *mut c_void, results.len()) }
    };
    let mut output_buffers = Vec::with_capacity(results.len());
    for (ptr, result) in raw_outputs.iter().zip(results) {
        let len = result.byte_len();
        let buffer: &mut [u8] = if len == 0 {
            &mut []
        } else if ptr.is_null() {
            return Err(CallbackError::NullPointer("output buffer"));
        } else {
            unsafe { std::slice::from_raw_parts_mut(*ptr as *mut u8, len) }
        };
        output_buffers.push(buffer);
    }

    callback.prepare_and_call(&input_buffers, &mut output_buffers)
}
