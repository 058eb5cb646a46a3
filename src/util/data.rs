//! Data types and hashing helpers

use std::fmt;

use sha2::{Digest, Sha256};

/// A 256-bit hash or identifier, stored as raw bytes
#[derive(Default, PartialEq, Eq, Clone, Copy, PartialOrd, Ord, Hash)]
pub struct Hash([u8; 32]);

impl Hash {
	pub fn as_slice(&self) -> &[u8] {
		&self.0
	}

	pub fn to_vec(&self) -> Vec<u8> {
		self.0.to_vec()
	}
}

impl From<[u8; 32]> for Hash {
	fn from(x: [u8; 32]) -> Hash {
		Hash(x)
	}
}

impl AsRef<[u8]> for Hash {
	fn as_ref(&self) -> &[u8] {
		&self.0
	}
}

impl fmt::Debug for Hash {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{}…", hex::encode(&self.0[..8]))
	}
}

/// Compute the SHA-256 of a byte slice
pub fn sha256sum(data: &[u8]) -> Hash {
	let mut hasher = Sha256::new();
	hasher.update(data);
	let mut hash = [0u8; 32];
	hash.copy_from_slice(&hasher.finalize()[..]);
	Hash(hash)
}
