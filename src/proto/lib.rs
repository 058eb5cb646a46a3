//! Signed protobuf request envelopes sent with every artifact transfer
//! between a gateway and its replica gateways

pub mod request;
pub mod sign;

pub use request::{ArtifactType, GatewayRequestInfo};
pub use sign::{gc_hash_padding, sign_request, verify_request, SecretKeySigner, Signer};
