#![forbid(unsafe_code)]

pub mod framing;
pub mod messages;

pub use framing::{
	DEFAULT_MAX_FRAME_SIZE, FramingError, encode_line, encode_line_default, encode_line_into,
	try_decode_line_from_buffer,
};
pub use messages::{
	AckStatus, ChannelReport, ClientMessage, ControlCommand, ControlResult, ErrorCode, HubMessage, PassReport,
	SessionReport, StatusReport, SubscriptionsReport,
};

/// Protocol version constants.
pub mod version {
	/// Current protocol major version.
	pub const PROTOCOL_MAJOR: u32 = 1;
	/// Current protocol minor version.
	pub const PROTOCOL_MINOR: u32 = 0;

	/// Compact representation useful for logs/metrics.
	pub const PROTOCOL_VERSION_U32: u32 = (PROTOCOL_MAJOR << 16) | PROTOCOL_MINOR;
}
