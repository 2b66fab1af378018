use sha1::{Digest, Sha1};

/// Validates downloaded pieces against the descriptor's expected hashes.
#[derive(Debug)]
pub struct Hasher {
    expected_hashes: Vec<[u8; 20]>,
}

impl Hasher {
    pub fn new(expected_hashes: Vec<[u8; 20]>) -> Self {
        Self { expected_hashes }
    }

    pub fn verify(&self, piece: u32, data: &[u8]) -> bool {
        let expected = match self.expected_hashes.get(piece as usize) {
            Some(e) => e,
            None => return false,
        };
        let mut hsh = Sha1::new();
        hsh.update(data);
        hsh.finalize().as_slice() == expected
    }
}
