use std::sync::atomic::{AtomicI32, Ordering};

/// Closure to obtain a new, unique request ID.
pub(crate) fn next_request_id() -> i32 {
    static REQUEST_ID: AtomicI32 = AtomicI32::new(0);
    REQUEST_ID.fetch_add(1, Ordering::SeqCst)
}

/// Appends a cstring (bytes terminated by a NUL) to the buffer.
pub(crate) fn write_cstring(buffer: &mut Vec<u8>, s: &str) {
    buffer.extend_from_slice(s.as_bytes());
    buffer.push(0);
}

/// Reads a cstring out of the cursor, advancing it past the trailing NUL.
pub(crate) fn read_cstring(cursor: &mut std::io::Cursor<&[u8]>) -> crate::error::Result<String> {
    let bytes = cursor.get_ref();
    let start = cursor.position() as usize;
    let end = bytes[start..]
        .iter()
        .position(|&b| b == 0)
        .map(|i| start + i)
        .ok_or_else(|| crate::error::Error::invalid_response("unterminated cstring in message"))?;

    let s = String::from_utf8_lossy(&bytes[start..end]).into_owned();
    cursor.set_position((end + 1) as u64);
    Ok(s)
}
