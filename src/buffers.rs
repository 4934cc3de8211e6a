//! Fixed-size chunk allocation for sniffing and relaying.

use bytes::BytesMut;

/// Buffer size classes for different use cases
const BUFFER_SIZES: &[usize] = &[1024, 4096, 8192, 16384, 32768, 65536];

/// Get a buffer with at least the specified capacity, rounded up to a size class.
pub fn get_buffer(min_size: usize) -> BytesMut {
    let size = BUFFER_SIZES
        .iter()
        .find(|&&size| size >= min_size)
        .copied()
        .unwrap_or_else(|| min_size.next_power_of_two().max(4096));

    BytesMut::with_capacity(size)
}

/// A zero-filled chunk of exactly `size` bytes, ready to be read into.
///
/// Relay loops own one chunk per direction for the life of a connection.
pub fn chunk(size: usize) -> BytesMut {
    let mut buffer = get_buffer(size);
    buffer.resize(size, 0);
    buffer
}
