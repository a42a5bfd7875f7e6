use sha2::{Digest, Sha512};

/// Width of an uppercase hex SHA-512 digest.
pub const HASH_LEN: usize = 128;

/// SHA-512 of `bytes`, uppercase hex.
pub fn sha512_hex(bytes: &[u8]) -> String {
    hex::encode_upper(Sha512::digest(bytes))
}

pub fn same_hash(a: &str, b: &str) -> bool {
    a.eq_ignore_ascii_case(b)
}
