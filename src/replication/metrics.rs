use opentelemetry::{global, metrics::*};

/// ReplicationMetrics references all counters used for transfer metrics;
/// both engines share one instance, distinguished by the engine attribute
pub struct ReplicationMetrics {
	pub(crate) transfers_started: Counter<u64>,
	pub(crate) transfers_completed: Counter<u64>,
	pub(crate) transfers_failed: Counter<u64>,
	pub(crate) transfers_detached: Counter<u64>,
	pub(crate) bytes_sent: Counter<u64>,
	pub(crate) transfer_duration: Histogram<f64>,
}

impl ReplicationMetrics {
	pub fn new() -> Self {
		let meter = global::meter("hangar_replication");
		Self {
			transfers_started: meter
				.u64_counter("replication.transfers_started")
				.with_description("Number of fan-out legs handed to a transfer worker")
				.init(),
			transfers_completed: meter
				.u64_counter("replication.transfers_completed")
				.with_description("Number of replica contexts fully processed")
				.init(),
			transfers_failed: meter
				.u64_counter("replication.transfers_failed")
				.with_description("Number of fan-out legs that ended in an error")
				.init(),
			transfers_detached: meter
				.u64_counter("replication.transfers_detached")
				.with_description("Number of fan-out legs detached by cancellation or expiry")
				.init(),
			bytes_sent: meter
				.u64_counter("replication.bytes_sent")
				.with_description("Payload bytes successfully sent to replica gateways")
				.init(),
			transfer_duration: meter
				.f64_histogram("replication.transfer_duration")
				.with_description("Duration of individual fan-out legs")
				.init(),
		}
	}
}
