//! The request envelope, hand-written in prost rather than generated
//! from a .proto file so that the wire schema lives next to its users

/// Kind of artifact described by a request envelope
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, ::prost::Enumeration)]
#[repr(i32)]
pub enum ArtifactType {
	Manifest = 1,
	Block = 2,
}

/// Envelope describing one artifact transfer, sent as the "metadata"
/// part of the multipart form. The signature field is a base64 detached
/// signature over the serialized message with the field itself cleared.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct GatewayRequestInfo {
	#[prost(enumeration = "ArtifactType", tag = "1")]
	pub kind: i32,

	#[prost(uint64, tag = "2")]
	pub file_id: u64,
	#[prost(int64, tag = "3")]
	pub file_version: i64,
	#[prost(uint64, tag = "4")]
	pub block_id: u64,
	#[prost(int64, tag = "5")]
	pub block_version: i64,

	#[prost(uint64, tag = "6")]
	pub blocking_factor: u64,
	#[prost(uint64, tag = "7")]
	pub size: u64,

	#[prost(int64, tag = "8")]
	pub file_mtime_sec: i64,
	#[prost(int32, tag = "9")]
	pub file_mtime_nsec: i32,

	#[prost(uint64, tag = "10")]
	pub owner: u64,
	#[prost(uint64, tag = "11")]
	pub writer: u64,
	#[prost(uint64, tag = "12")]
	pub volume: u64,

	/// Base64 SHA-256 of the payload; for garbage-collection requests,
	/// base64 of 256 random bytes (see sign::gc_hash_padding)
	#[prost(string, tag = "13")]
	pub hash: ::prost::alloc::string::String,
	#[prost(string, tag = "14")]
	pub signature: ::prost::alloc::string::String,
}
