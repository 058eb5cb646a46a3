//! Contains type and functions related to Hangar configuration file
use std::io::Read;
use std::path::PathBuf;

use serde::Deserialize;

use crate::error::Error;

/// Represent the whole configuration
#[derive(Deserialize, Debug, Clone)]
pub struct Config {
	/// Path where to store metadata. Should be fast, but low volume
	pub metadata_dir: PathBuf,
	/// Path where to store file blocks. Can be slower, but need higher volume
	pub data_dir: PathBuf,

	/// Size of file blocks; also the blocking factor advertised in
	/// replica request envelopes
	#[serde(default = "default_block_size")]
	pub block_size: usize,

	/// URL of the metadata service coordinating this volume
	pub ms_url: String,

	/// Identifier of this gateway, as registered with the metadata service
	pub gateway_id: u64,
	/// Identifier of the volume served by this gateway
	pub volume_id: u64,

	/// How long a replica transfer may take before a synchronous caller
	/// gives up on it, in seconds. 0 means wait forever.
	#[serde(default = "default_transfer_timeout")]
	pub transfer_timeout: u64,

	/// How long to wait for a connection to a replica gateway, in seconds
	#[serde(default = "default_replica_connect_timeout")]
	pub replica_connect_timeout: u64,
}

fn default_block_size() -> usize {
	1048576
}
fn default_transfer_timeout() -> u64 {
	300
}
fn default_replica_connect_timeout() -> u64 {
	10
}

/// Read and parse configuration
pub fn read_config(config_file: PathBuf) -> Result<Config, Error> {
	let mut file = std::fs::OpenOptions::new()
		.read(true)
		.open(config_file.as_path())?;

	let mut config = String::new();
	file.read_to_string(&mut config)?;

	Ok(toml::from_str(&config)?)
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn test_parse_config() {
		let config = toml::from_str::<Config>(
			r#"
			metadata_dir = "/tmp/hangar/meta"
			data_dir = "/tmp/hangar/data"
			ms_url = "https://ms.example.net"
			gateway_id = 5
			volume_id = 7
			transfer_timeout = 60
			"#,
		)
		.unwrap();

		assert_eq!(config.block_size, 1048576);
		assert_eq!(config.transfer_timeout, 60);
		assert_eq!(config.replica_connect_timeout, 10);
	}
}
