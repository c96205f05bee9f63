//! RESP record encoding.

use std::time::SystemTime;

/// Appends a `set` record for the item to `buf`.
///
/// A TTL is persisted as whole seconds remaining from now, truncated.
/// Sub-second precision is deliberately lost; an already-expired item
/// writes `ex 0` and is dropped on the next load.
pub(crate) fn write_set(
    buf: &mut Vec<u8>,
    key: &[u8],
    value: &[u8],
    expires_at: Option<SystemTime>,
) {
    match expires_at {
        Some(at) => {
            let secs = at
                .duration_since(SystemTime::now())
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let secs = secs.to_string();
            write_array(buf, &[b"set", key, value, b"ex", secs.as_bytes()]);
        }
        None => write_array(buf, &[b"set", key, value]),
    }
}

/// Appends a `del` record for the key to `buf`.
pub(crate) fn write_del(buf: &mut Vec<u8>, key: &[u8]) {
    write_array(buf, &[b"del", key]);
}

fn write_array(buf: &mut Vec<u8>, bulks: &[&[u8]]) {
    write_head(buf, b'*', bulks.len());
    for bulk in bulks {
        write_head(buf, b'$', bulk.len());
        buf.extend_from_slice(bulk);
        buf.extend_from_slice(b"\r\n");
    }
}

fn write_head(buf: &mut Vec<u8>, sigil: u8, n: usize) {
    buf.push(sigil);
    buf.extend_from_slice(n.to_string().as_bytes());
    buf.extend_from_slice(b"\r\n");
}
