//! Envelope signing. The protocol is sign-with-field-cleared: the
//! signature field is emptied, the message serialized, the detached
//! signature computed over those bytes and stored back base64-encoded.
//! Verification runs the same steps in reverse.

use base64::prelude::*;
use prost::Message;
use rand::prelude::*;
use sodiumoxide::crypto::sign as ed25519;

use hangar_util::error::{Error, OkOrMessage};

use crate::request::GatewayRequestInfo;

/// Detached-signature provider for request envelopes. The gateway's key
/// pair is provisioned by the metadata service; the engine only ever
/// sees this trait.
pub trait Signer: Send + Sync {
	fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, Error>;
	fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<(), Error>;
}

/// Ed25519 signer holding the gateway's key pair
pub struct SecretKeySigner {
	public_key: ed25519::PublicKey,
	secret_key: ed25519::SecretKey,
}

impl SecretKeySigner {
	pub fn new(public_key: ed25519::PublicKey, secret_key: ed25519::SecretKey) -> Self {
		Self {
			public_key,
			secret_key,
		}
	}

	/// Generate a fresh key pair (tests and first-run provisioning)
	pub fn generate() -> Result<Self, Error> {
		sodiumoxide::init().map_err(|_| Error::from("Unable to initialize sodiumoxide"))?;
		let (public_key, secret_key) = ed25519::gen_keypair();
		Ok(Self {
			public_key,
			secret_key,
		})
	}

	pub fn public_key(&self) -> &ed25519::PublicKey {
		&self.public_key
	}
}

impl Signer for SecretKeySigner {
	fn sign(&self, msg: &[u8]) -> Result<Vec<u8>, Error> {
		Ok(ed25519::sign_detached(msg, &self.secret_key).as_ref().to_vec())
	}

	fn verify(&self, msg: &[u8], signature: &[u8]) -> Result<(), Error> {
		let signature = ed25519::Signature::from_slice(signature)
			.ok_or_message("Malformed ed25519 signature")?;
		if ed25519::verify_detached(&signature, msg, &self.public_key) {
			Ok(())
		} else {
			Err(Error::Message("Invalid signature on request envelope".into()))
		}
	}
}

/// Sign a request envelope in place
pub fn sign_request(signer: &dyn Signer, info: &mut GatewayRequestInfo) -> Result<(), Error> {
	info.signature = String::new();
	let bits = info.encode_to_vec();
	let signature = signer.sign(&bits)?;
	info.signature = BASE64_STANDARD.encode(&signature);
	Ok(())
}

/// Check the signature of a received request envelope
pub fn verify_request(signer: &dyn Signer, info: &GatewayRequestInfo) -> Result<(), Error> {
	let signature = BASE64_STANDARD
		.decode(info.signature.as_bytes())
		.ok_or_message("Invalid base64 in signature field")?;

	let mut cleared = info.clone();
	cleared.signature = String::new();
	signer.verify(&cleared.encode_to_vec(), &signature)
}

/// Hash-field filler for garbage-collection envelopes, which carry no
/// payload: 256 random bytes, base64-encoded, so that a passive
/// observer cannot structurally tell a delete from an upload
pub fn gc_hash_padding() -> String {
	let mut padding = [0u8; 256];
	thread_rng().fill(&mut padding[..]);
	BASE64_STANDARD.encode(&padding[..])
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::request::ArtifactType;

	fn envelope() -> GatewayRequestInfo {
		GatewayRequestInfo {
			kind: ArtifactType::Manifest as i32,
			file_id: 0xAB,
			file_version: 1,
			block_id: 0,
			block_version: 0,
			blocking_factor: 1048576,
			size: 42,
			file_mtime_sec: 100,
			file_mtime_nsec: 0,
			owner: 9,
			writer: 5,
			volume: 7,
			hash: "aGVsbG8=".into(),
			signature: String::new(),
		}
	}

	#[test]
	fn test_sign_and_verify() {
		let signer = SecretKeySigner::generate().unwrap();
		let mut info = envelope();

		sign_request(&signer, &mut info).unwrap();
		assert!(!info.signature.is_empty());
		verify_request(&signer, &info).unwrap();
	}

	#[test]
	fn test_verify_rejects_tampering() {
		let signer = SecretKeySigner::generate().unwrap();
		let mut info = envelope();
		sign_request(&signer, &mut info).unwrap();

		info.file_version = 2;
		assert!(verify_request(&signer, &info).is_err());
	}

	#[test]
	fn test_gc_hash_padding() {
		let p1 = gc_hash_padding();
		let p2 = gc_hash_padding();
		// base64 of 256 bytes
		assert_eq!(p1.len(), 344);
		assert_ne!(p1, p2);
		assert_eq!(BASE64_STANDARD.decode(p1.as_bytes()).unwrap().len(), 256);
	}
}
