use blake2b_simd::Params;

/// 64-bit content hash used by verified cells and verifying pointers.
pub fn hash64(bytes: &[u8]) -> u64 {
    let digest = Params::new().hash_length(8).hash(bytes);
    u64::from_le_bytes(digest.as_bytes().try_into().expect("8 byte digest"))
}

/// 64-bit keyed hash; the cuckoo table draws a fresh key per seed slot.
pub fn hash64_seeded(bytes: &[u8], seed: u64) -> u64 {
    let digest = Params::new()
        .hash_length(8)
        .key(&seed.to_le_bytes())
        .hash(bytes);
    u64::from_le_bytes(digest.as_bytes().try_into().expect("8 byte digest"))
}

/// 128-bit key hash. The low 16 bits place a key on the routing ring, the
/// full width places it in a table.
pub fn hash128(bytes: &[u8]) -> u128 {
    let digest = Params::new().hash_length(16).hash(bytes);
    u128::from_le_bytes(digest.as_bytes().try_into().expect("16 byte digest"))
}
