//! Error types for the replication engines

use err_derive::Error;

use hangar_util::error::Error as CommonError;

/// Verdict of one fan-out leg, also aggregated per context: when
/// several legs of a fan-out fail differently, the worst verdict wins
/// and a later successful leg never clears an earlier failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransferError {
	#[error(display = "Transfer was cancelled")]
	Cancelled,

	#[error(display = "Artifact not found on replica gateway")]
	NotFound,

	#[error(display = "Replica gateway denied the request")]
	PermissionDenied,

	#[error(display = "Replica gateway returned HTTP status {}", _0)]
	RemoteIo(u16),

	#[error(display = "Could not talk to replica gateway")]
	Transport,

	#[error(display = "Transfer did not complete before its deadline")]
	Timeout,
}

impl TransferError {
	fn severity(self) -> u32 {
		match self {
			TransferError::Cancelled => 1,
			TransferError::NotFound => 2,
			TransferError::PermissionDenied => 3,
			TransferError::RemoteIo(_) => 4,
			TransferError::Transport => 5,
			TransferError::Timeout => 6,
		}
	}

	/// The worse of an already recorded verdict and a new one
	pub fn worst(prev: Option<TransferError>, new: TransferError) -> TransferError {
		match prev {
			Some(prev) if prev.severity() >= new.severity() => prev,
			_ => new,
		}
	}
}

/// Errors of this crate
#[derive(Debug, Error)]
pub enum Error {
	#[error(display = "{}", _0)]
	Common(#[error(source)] CommonError),

	#[error(display = "HTTP client error: {}", _0)]
	Http(#[error(source)] reqwest::Error),

	/// The metadata service knows of no replica gateway for this volume
	#[error(display = "No replica gateways are known for this volume")]
	NoReplicas,

	#[error(display = "Replica transfer failed: {}", _0)]
	Transfer(#[error(source)] TransferError),
}

impl From<std::io::Error> for Error {
	fn from(e: std::io::Error) -> Error {
		Error::Common(CommonError::Io(e))
	}
}

impl<'a> From<&'a str> for Error {
	fn from(v: &'a str) -> Error {
		Error::Common(CommonError::Message(v.to_string()))
	}
}
