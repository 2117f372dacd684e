pub mod view;

/// Allocates a zeroed buffer with the specified size.
pub fn new_buffer(len: usize) -> Vec<u8> {
    vec![0u8; len]
}
