use sha2::{Digest, Sha256};

pub(crate) struct Hasher {}

impl Hasher {
    /// SHA-256 of the input, hex encoded.
    pub(crate) fn sha256_hex(data: &str) -> String {
        hex::encode(Sha256::digest(data.as_bytes()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_digest() {
        assert_eq!(
            Hasher::sha256_hex("abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
