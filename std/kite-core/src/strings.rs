///
/// String conversion for the foreign boundary.
///
/// The host runtime hands strings over as UTF-16 code units. Table keys and
/// SQL text are kept as UTF-8; unpaired surrogates become U+FFFD.
///

/// Convert host UTF-16 text to an owned UTF-8 string.
///
/// # Safety
///
/// `data` must be valid for `len` reads, or null (treated as empty).
pub unsafe fn string_from_utf16(data: *const u16, len: usize) -> String {
    if data.is_null() || len == 0 {
        return String::new();
    }
    let units = unsafe { std::slice::from_raw_parts(data, len) };
    String::from_utf16_lossy(units)
}

/// Convert a NUL-terminated UTF-8 C string; invalid sequences are replaced.
///
/// # Safety
///
/// `data` must be null or point to a NUL-terminated string.
pub unsafe fn string_from_c(data: *const std::ffi::c_char) -> Option<String> {
    if data.is_null() {
        return None;
    }
    let c = unsafe { std::ffi::CStr::from_ptr(data) };
    Some(c.to_string_lossy().into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_utf16_conversion() {
        let units: Vec<u16> = "SELECT 'é' FROM t".encode_utf16().collect();
        let s = unsafe { string_from_utf16(units.as_ptr(), units.len()) };
        assert_eq!(s, "SELECT 'é' FROM t");
        assert_eq!(unsafe { string_from_utf16(std::ptr::null(), 3) }, "");
    }

    #[test]
    fn test_lone_surrogate_is_replaced() {
        let units = [0x0041u16, 0xD800, 0x0042];
        let s = unsafe { string_from_utf16(units.as_ptr(), units.len()) };
        assert_eq!(s, "A\u{FFFD}B");
    }

    #[test]
    fn test_c_string() {
        let c = std::ffi::CString::new("kite.toml").unwrap();
        assert_eq!(unsafe { string_from_c(c.as_ptr()) }.as_deref(), Some("kite.toml"));
        assert!(unsafe { string_from_c(std::ptr::null()) }.is_none());
    }
}
