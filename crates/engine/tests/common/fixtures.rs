use bytes::Bytes;
use cirrus_core::ContentHash;

/// Chunk size used by most engine tests, so multi-chunk files stay small.
#[allow(dead_code)]
pub const TEST_CHUNK_SIZE: usize = 1024;

/// Hex SHA-256 of data.
#[allow(dead_code)]
pub fn sha256_hex(data: &[u8]) -> String {
    ContentHash::compute(data).to_hex()
}

/// Generate deterministic test data using a seeded pseudo-random generator
/// Same seed produces same output (reproducible tests)
#[allow(dead_code)]
pub fn seeded_bytes(seed: u64, len: usize) -> Bytes {
    let mut data = vec![0u8; len];
    let mut state = seed;

    // LCG
    for chunk in data.chunks_mut(8) {
        state = state.wrapping_mul(6364136223846793005).wrapping_add(1);
        let bytes = state.to_le_bytes();
        for (i, byte) in chunk.iter_mut().enumerate() {
            *byte = bytes[i % 8];
        }
    }

    Bytes::from(data)
}

/// Concatenate byte slices into one payload.
#[allow(dead_code)]
pub fn concat(parts: &[&[u8]]) -> Bytes {
    Bytes::from(parts.concat())
}
