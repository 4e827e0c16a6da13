#![forbid(unsafe_code)]

use bytes::{BufMut, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;

/// Default maximum line size (payload without the trailing newline).
pub const DEFAULT_MAX_FRAME_SIZE: usize = 64 * 1024; // 64 KiB

#[derive(Debug, Error)]
pub enum FramingError {
	/// A line (or an unterminated buffer) grew past the limit.
	#[error("frame exceeds maximum size: len={len} max={max}")]
	FrameTooLarge {
		len: usize,
		max: usize,
	},

	/// A complete line that is not valid JSON or does not match the message schema.
	/// The line has been consumed; the stream stays usable.
	#[error("malformed message: {0}")]
	Malformed(String),

	#[error("json encode error: {0}")]
	Encode(#[from] serde_json::Error),
}

impl FramingError {
	/// True when the stream can keep going after this error.
	pub fn is_recoverable(&self) -> bool {
		matches!(self, Self::Malformed(_))
	}
}

/// Encode a message as one JSON line terminated by `\n`.
pub fn encode_line<M: Serialize>(msg: &M, max_frame_size: usize) -> Result<Vec<u8>, FramingError> {
	let mut out = serde_json::to_vec(msg)?;
	if out.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: out.len(),
			max: max_frame_size,
		});
	}
	out.push(b'\n');
	Ok(out)
}

/// Encode a line using `DEFAULT_MAX_FRAME_SIZE`.
pub fn encode_line_default<M: Serialize>(msg: &M) -> Result<Vec<u8>, FramingError> {
	encode_line(msg, DEFAULT_MAX_FRAME_SIZE)
}

/// Append an encoded line into the provided buffer.
pub fn encode_line_into<M: Serialize>(buf: &mut BytesMut, msg: &M, max_frame_size: usize) -> Result<(), FramingError> {
	let line = serde_json::to_vec(msg)?;
	if line.len() > max_frame_size {
		return Err(FramingError::FrameTooLarge {
			len: line.len(),
			max: max_frame_size,
		});
	}

	buf.reserve(line.len() + 1);
	buf.put_slice(&line);
	buf.put_u8(b'\n');
	Ok(())
}

/// Try to decode a single line from a growable buffer.
///
/// Blank lines are skipped. A complete line that fails to parse is consumed and reported as
/// `Malformed`. `FrameTooLarge` means the peer is not speaking the protocol and the stream
/// should be closed.
pub fn try_decode_line_from_buffer<M: DeserializeOwned>(
	buf: &mut BytesMut,
	max_frame_size: usize,
) -> Result<Option<M>, FramingError> {
	loop {
		let Some(pos) = buf.iter().position(|b| *b == b'\n') else {
			if buf.len() > max_frame_size {
				return Err(FramingError::FrameTooLarge {
					len: buf.len(),
					max: max_frame_size,
				});
			}
			return Ok(None);
		};

		let line = buf.split_to(pos + 1);
		let mut body = &line[..pos];
		if body.last() == Some(&b'\r') {
			body = &body[..body.len() - 1];
		}

		if body.len() > max_frame_size {
			return Err(FramingError::FrameTooLarge {
				len: body.len(),
				max: max_frame_size,
			});
		}

		if body.iter().all(u8::is_ascii_whitespace) {
			continue;
		}

		return serde_json::from_slice(body)
			.map(Some)
			.map_err(|e| FramingError::Malformed(e.to_string()));
	}
}
