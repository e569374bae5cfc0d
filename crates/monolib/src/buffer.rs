//! Ownership hand-off of byte buffers across the C ABI.
//!
//! Every allocation handed to a caller is a boxed byte slice created here, and the only
//! way back is [`release`]. The caller owns the buffer from the moment it is returned and
//! must release it exactly once with the same pointer and length.

use std::ffi::c_char;
use std::ptr;

/// A byte buffer whose ownership has moved to the caller.
///
/// `ptr` is null iff `len == 0`.
#[derive(Debug)]
#[must_use = "an OwnedBuffer leaks unless it is handed out and released"]
pub struct OwnedBuffer {
    ptr: *mut u8,
    len: usize,
}

impl OwnedBuffer {
    pub fn empty() -> Self {
        Self {
            ptr: ptr::null_mut(),
            len: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Give up the handle; from here on only the caller may free it.
    pub fn into_raw_parts(self) -> (*mut u8, usize) {
        (self.ptr, self.len)
    }
}

/// Move `bytes` into a caller-owned buffer.
pub fn acquire(bytes: impl Into<Vec<u8>>) -> OwnedBuffer {
    let boxed = bytes.into().into_boxed_slice();
    if boxed.is_empty() {
        return OwnedBuffer::empty();
    }
    let len = boxed.len();
    let ptr = Box::into_raw(boxed) as *mut u8;
    OwnedBuffer { ptr, len }
}

/// Copy `s` into a NUL-terminated caller-owned buffer.
///
/// Interior NUL bytes are dropped so that `strlen(ptr) + 1` always equals the allocation
/// length. Never returns null: the empty string is a single NUL byte.
pub fn acquire_c_string(s: &str) -> *mut c_char {
    let mut bytes: Vec<u8> = s.bytes().filter(|b| *b != 0).collect();
    bytes.push(0);
    let (ptr, _len) = acquire(bytes).into_raw_parts();
    ptr as *mut c_char
}

/// Free a buffer produced by [`acquire`].
///
/// A null `ptr` is a no-op.
///
/// # Safety
/// `ptr`/`len` must come from one [`OwnedBuffer`] that has not been released yet.
/// Releasing twice, or passing a pointer this module did not allocate, is undefined
/// behavior and is not detected.
pub unsafe fn release(ptr: *mut u8, len: usize) {
    if ptr.is_null() {
        return;
    }
    let slice = ptr::slice_from_raw_parts_mut(ptr, len);
    drop(unsafe { Box::from_raw(slice) });
}

/// Free a string produced by [`acquire_c_string`].
///
/// # Safety
/// Same contract as [`release`]; `ptr` must still be NUL-terminated.
pub unsafe fn release_c_string(ptr: *mut c_char) {
    if ptr.is_null() {
        return;
    }
    let len = unsafe { std::ffi::CStr::from_ptr(ptr) }.to_bytes_with_nul().len();
    unsafe { release(ptr as *mut u8, len) };
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    #[test]
    fn empty_bytes_give_null_zero_length_handle() {
        let buf = acquire(Vec::new());
        assert!(buf.is_empty());
        let (ptr, len) = buf.into_raw_parts();
        assert!(ptr.is_null());
        assert_eq!(len, 0);
        unsafe { release(ptr, len) };
    }

    #[test]
    fn acquired_bytes_are_copied_verbatim() {
        let jpeg = vec![0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0xFF, 0xD9];
        let (ptr, len) = acquire(jpeg.clone()).into_raw_parts();
        assert_eq!(len, jpeg.len());
        let seen = unsafe { std::slice::from_raw_parts(ptr, len) }.to_vec();
        assert_eq!(seen, jpeg);
        unsafe { release(ptr, len) };
    }

    #[test]
    fn empty_string_is_a_valid_nul_terminated_buffer() {
        let ptr = acquire_c_string("");
        assert!(!ptr.is_null());
        assert_eq!(unsafe { CStr::from_ptr(ptr) }.to_bytes(), b"");
        unsafe { release_c_string(ptr) };
    }

    #[test]
    fn interior_nul_is_stripped() {
        let ptr = acquire_c_string("Sigur\0 Rós");
        let s = unsafe { CStr::from_ptr(ptr) }.to_str().unwrap().to_string();
        assert_eq!(s, "Sigur Rós");
        unsafe { release(ptr as *mut u8, s.len() + 1) };
    }

    #[test]
    fn release_null_is_noop() {
        unsafe {
            release(ptr::null_mut(), 0);
            release(ptr::null_mut(), 42);
            release_c_string(ptr::null_mut());
        }
    }
}
