//! Control-plane wire protocol
//!
//! Every message is a multi-part frame sequence `[sender][empty][TAG][arg...]`.
//! Integers are fixed-width little-endian, strings are UTF-8. Replies mirror the
//! request envelope: `[sender][empty][TAG][payload]`.

use crate::error::ProtocolError;
use crate::types::TaskId;
use bytes::Bytes;
use std::fmt;

/// Reply payload for accepted requests
pub const RETURN_OK: &str = "Ok";
/// Reply payload for rejected requests
pub const RETURN_ERROR: &str = "Error";

/// Minimum number of frames in an inbound message
pub const MIN_FRAMES: usize = 4;

/// Message tags, matched case-insensitively
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Tag {
    /// `HS`: associate the connection with a logical identifier
    Handshake,
    /// `TOTAL`: progress denominator for the sender's work item
    NotifyTotal,
    /// `DL`: one item processed by the sender
    NotifyDownloaded,
    /// `TITLE`: informational title update
    NotifyTitle,
    /// `FFMPEG_REQ`: request a brokered transcode
    FfmpegRequest,
    /// `FFMPEG_RET`: poll the exit code of a brokered transcode
    FfmpegResult,
    /// `ARIA2`: append downloader input through the batching queue
    Aria2,
}

impl Tag {
    /// All protocol tags
    pub const ALL: [Tag; 7] = [
        Tag::Handshake,
        Tag::NotifyTotal,
        Tag::NotifyDownloaded,
        Tag::NotifyTitle,
        Tag::FfmpegRequest,
        Tag::FfmpegResult,
        Tag::Aria2,
    ];

    /// Wire representation of the tag
    pub fn as_str(&self) -> &'static str {
        match self {
            Tag::Handshake => "HS",
            Tag::NotifyTotal => "TOTAL",
            Tag::NotifyDownloaded => "DL",
            Tag::NotifyTitle => "TITLE",
            Tag::FfmpegRequest => "FFMPEG_REQ",
            Tag::FfmpegResult => "FFMPEG_RET",
            Tag::Aria2 => "ARIA2",
        }
    }

    /// Parse an upper-cased wire tag
    pub fn parse(tag: &str) -> Option<Tag> {
        Tag::ALL.into_iter().find(|t| t.as_str() == tag)
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded inbound request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    /// `HS [identifier, channel-kind]`
    Handshake {
        /// Logical identifier the worker claims
        identifier: String,
        /// Channel kind the worker believes it is talking to ("Comm" or "Task")
        channel: String,
    },
    /// `TOTAL [i32]`
    NotifyTotal {
        /// Number of items the worker will process
        total: i32,
    },
    /// `DL [i64, i32]`
    NotifyDownloaded {
        /// Item the worker finished
        item_id: i64,
        /// Worker-defined result code
        result: i32,
    },
    /// `TITLE [str]`
    NotifyTitle {
        /// New title
        title: String,
    },
    /// `FFMPEG_REQ [arg...]`
    FfmpegRequest {
        /// Transcoder arguments
        args: Vec<String>,
    },
    /// `FFMPEG_RET [i32]`
    FfmpegResult {
        /// Task id returned by a previous `FFMPEG_REQ`
        task_id: TaskId,
    },
    /// `ARIA2 [destination, payload]`
    Aria2 {
        /// Destination file, possibly relative
        destination: String,
        /// Text appended to the destination
        payload: String,
    },
}

impl Request {
    /// Decode the argument frames of a message with the given (upper-cased) tag
    pub fn decode(tag: &str, args: &[Bytes]) -> Result<Request, ProtocolError> {
        let Some(parsed) = Tag::parse(tag) else {
            return Err(ProtocolError::UnknownTag(tag.to_string()));
        };
        let args = Args { tag, frames: args };

        let request = match parsed {
            Tag::Handshake => Request::Handshake {
                identifier: args.string(0)?,
                channel: args.string(1)?,
            },
            Tag::NotifyTotal => Request::NotifyTotal {
                total: args.i32(0)?,
            },
            Tag::NotifyDownloaded => Request::NotifyDownloaded {
                item_id: args.i64(0)?,
                result: args.i32(1)?,
            },
            Tag::NotifyTitle => Request::NotifyTitle {
                title: args.string(0)?,
            },
            Tag::FfmpegRequest => Request::FfmpegRequest {
                args: (0..args.frames.len())
                    .map(|i| args.string(i))
                    .collect::<Result<_, _>>()?,
            },
            Tag::FfmpegResult => Request::FfmpegResult {
                task_id: TaskId(args.i32(0)?),
            },
            Tag::Aria2 => Request::Aria2 {
                destination: args.string(0)?,
                payload: args.string(1)?,
            },
        };
        Ok(request)
    }

    /// Tag of this request
    pub fn tag(&self) -> Tag {
        match self {
            Request::Handshake { .. } => Tag::Handshake,
            Request::NotifyTotal { .. } => Tag::NotifyTotal,
            Request::NotifyDownloaded { .. } => Tag::NotifyDownloaded,
            Request::NotifyTitle { .. } => Tag::NotifyTitle,
            Request::FfmpegRequest { .. } => Tag::FfmpegRequest,
            Request::FfmpegResult { .. } => Tag::FfmpegResult,
            Request::Aria2 { .. } => Tag::Aria2,
        }
    }

    /// Encode the argument frames (client side; used by tests and tooling)
    pub fn encode_args(&self) -> Vec<Bytes> {
        match self {
            Request::Handshake {
                identifier,
                channel,
            } => vec![
                Bytes::from(identifier.clone()),
                Bytes::from(channel.clone()),
            ],
            Request::NotifyTotal { total } => vec![Bytes::copy_from_slice(&total.to_le_bytes())],
            Request::NotifyDownloaded { item_id, result } => vec![
                Bytes::copy_from_slice(&item_id.to_le_bytes()),
                Bytes::copy_from_slice(&result.to_le_bytes()),
            ],
            Request::NotifyTitle { title } => vec![Bytes::from(title.clone())],
            Request::FfmpegRequest { args } => {
                args.iter().map(|a| Bytes::from(a.clone())).collect()
            }
            Request::FfmpegResult { task_id } => {
                vec![Bytes::copy_from_slice(&task_id.0.to_le_bytes())]
            }
            Request::Aria2 {
                destination,
                payload,
            } => vec![
                Bytes::from(destination.clone()),
                Bytes::from(payload.clone()),
            ],
        }
    }
}

struct Args<'a> {
    tag: &'a str,
    frames: &'a [Bytes],
}

impl Args<'_> {
    fn frame(&self, index: usize) -> Result<&Bytes, ProtocolError> {
        self.frames
            .get(index)
            .ok_or_else(|| ProtocolError::MissingArgument {
                tag: self.tag.to_string(),
                index,
            })
    }

    fn fixed<const N: usize>(&self, index: usize) -> Result<[u8; N], ProtocolError> {
        let frame = self.frame(index)?;
        <[u8; N]>::try_from(frame.as_ref()).map_err(|_| ProtocolError::InvalidLength {
            tag: self.tag.to_string(),
            index,
            expected: N,
            actual: frame.len(),
        })
    }

    fn i32(&self, index: usize) -> Result<i32, ProtocolError> {
        Ok(i32::from_le_bytes(self.fixed::<4>(index)?))
    }

    fn i64(&self, index: usize) -> Result<i64, ProtocolError> {
        Ok(i64::from_le_bytes(self.fixed::<8>(index)?))
    }

    fn string(&self, index: usize) -> Result<String, ProtocolError> {
        let frame = self.frame(index)?;
        std::str::from_utf8(frame)
            .map(str::to_owned)
            .map_err(|_| ProtocolError::InvalidUtf8 {
                tag: self.tag.to_string(),
                index,
            })
    }
}

/// An outbound reply payload
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Reply {
    /// `"Ok"`
    Ok,
    /// `"Error"`
    Error,
    /// Newly assigned sub-work task id (i32)
    TaskId(TaskId),
    /// Exit code of a sub-work task, or -1 when the id is unknown (i32)
    ExitCode(i32),
    /// ARIA2 acknowledgement (i32 0)
    Accepted,
}

impl Reply {
    /// Encode the reply payload frame
    pub fn encode(&self) -> Bytes {
        match self {
            Reply::Ok => Bytes::from_static(RETURN_OK.as_bytes()),
            Reply::Error => Bytes::from_static(RETURN_ERROR.as_bytes()),
            Reply::TaskId(id) => Bytes::copy_from_slice(&id.0.to_le_bytes()),
            Reply::ExitCode(code) => Bytes::copy_from_slice(&code.to_le_bytes()),
            Reply::Accepted => Bytes::copy_from_slice(&0i32.to_le_bytes()),
        }
    }
}

/// A parsed inbound envelope
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Envelope {
    /// Opaque connection id assigned by the ROUTER socket
    pub sender: Bytes,
    /// Upper-cased tag
    pub tag: String,
    /// Remaining argument frames
    pub args: Vec<Bytes>,
}

impl Envelope {
    /// Split raw frames into sender, tag and arguments
    pub fn parse(mut frames: Vec<Bytes>) -> Result<Envelope, ProtocolError> {
        if frames.len() < MIN_FRAMES {
            return Err(ProtocolError::MessageTooShort {
                frames: frames.len(),
            });
        }
        let args = frames.split_off(3);
        let tag = String::from_utf8_lossy(&frames[2]).to_uppercase();
        let sender = frames.swap_remove(0);
        Ok(Envelope { sender, tag, args })
    }

    /// Build the outbound frames of a reply to `sender`
    pub fn reply(sender: &Bytes, tag: &str, payload: Bytes) -> Vec<Bytes> {
        vec![
            sender.clone(),
            Bytes::new(),
            Bytes::copy_from_slice(tag.as_bytes()),
            payload,
        ]
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn frames(parts: &[&[u8]]) -> Vec<Bytes> {
        parts.iter().map(|p| Bytes::copy_from_slice(p)).collect()
    }

    #[test]
    fn envelope_upper_cases_tag() {
        let env = Envelope::parse(frames(&[b"id", b"", b"hs", b"1_page1", b"Comm"])).unwrap();
        assert_eq!(env.sender, Bytes::from_static(b"id"));
        assert_eq!(env.tag, "HS");
        assert_eq!(env.args.len(), 2);
    }

    #[test]
    fn envelope_requires_four_frames() {
        let err = Envelope::parse(frames(&[b"id", b"", b"HS"])).unwrap_err();
        assert_eq!(err, ProtocolError::MessageTooShort { frames: 3 });
    }

    #[test]
    fn decodes_notifications() {
        let total = Request::decode("TOTAL", &[Bytes::copy_from_slice(&48i32.to_le_bytes())]);
        assert_eq!(total, Ok(Request::NotifyTotal { total: 48 }));

        let dl = Request::decode(
            "DL",
            &[
                Bytes::copy_from_slice(&9_000_000_000i64.to_le_bytes()),
                Bytes::copy_from_slice(&2i32.to_le_bytes()),
            ],
        );
        assert_eq!(
            dl,
            Ok(Request::NotifyDownloaded {
                item_id: 9_000_000_000,
                result: 2
            })
        );
    }

    #[test]
    fn rejects_wrong_integer_width() {
        let err = Request::decode("TOTAL", &[Bytes::from_static(b"\x01\x00")]).unwrap_err();
        assert_eq!(
            err,
            ProtocolError::InvalidLength {
                tag: "TOTAL".into(),
                index: 0,
                expected: 4,
                actual: 2
            }
        );
    }

    #[test]
    fn rejects_missing_and_invalid_utf8_arguments() {
        assert_eq!(
            Request::decode("ARIA2", &[Bytes::from_static(b"x.txt")]),
            Err(ProtocolError::MissingArgument {
                tag: "ARIA2".into(),
                index: 1
            })
        );
        assert_eq!(
            Request::decode("TITLE", &[Bytes::from_static(b"\xff\xfe")]),
            Err(ProtocolError::InvalidUtf8 {
                tag: "TITLE".into(),
                index: 0
            })
        );
    }

    #[test]
    fn unknown_tag_is_reported() {
        assert_eq!(
            Request::decode("ERROR", &[]),
            Err(ProtocolError::UnknownTag("ERROR".into()))
        );
    }

    #[test]
    fn ffmpeg_request_accepts_any_argument_count() {
        assert_eq!(
            Request::decode("FFMPEG_REQ", &[]),
            Ok(Request::FfmpegRequest { args: vec![] })
        );
    }

    #[test]
    fn reply_payloads() {
        assert_eq!(Reply::Ok.encode(), Bytes::from_static(b"Ok"));
        assert_eq!(Reply::Error.encode(), Bytes::from_static(b"Error"));
        assert_eq!(Reply::ExitCode(-1).encode().as_ref(), &[0xff, 0xff, 0xff, 0xff]);
        assert_eq!(Reply::Accepted.encode().as_ref(), &[0, 0, 0, 0]);
        assert_eq!(Reply::TaskId(TaskId(258)).encode().as_ref(), &[2, 1, 0, 0]);
    }

    #[test]
    fn reply_envelope_mirrors_request() {
        let sender = Bytes::from_static(b"\x00\x01");
        let out = Envelope::reply(&sender, "HS", Reply::Ok.encode());
        assert_eq!(out.len(), 4);
        assert_eq!(out[0], sender);
        assert!(out[1].is_empty());
        assert_eq!(out[2], Bytes::from_static(b"HS"));
    }

    proptest! {
        #[test]
        fn decode_never_panics(
            tag in prop::sample::select(vec!["HS", "TOTAL", "DL", "TITLE", "FFMPEG_REQ", "FFMPEG_RET", "ARIA2", "NOPE"]),
            args in prop::collection::vec(prop::collection::vec(any::<u8>(), 0..12), 0..4),
        ) {
            let args: Vec<Bytes> = args.into_iter().map(Bytes::from).collect();
            let _ = Request::decode(tag, &args);
        }

        #[test]
        fn encoded_requests_decode_to_themselves(total in any::<i32>(), item in any::<i64>(), result in any::<i32>()) {
            for request in [
                Request::NotifyTotal { total },
                Request::NotifyDownloaded { item_id: item, result },
                Request::FfmpegResult { task_id: TaskId(result) },
            ] {
                let decoded = Request::decode(request.tag().as_str(), &request.encode_args()).unwrap();
                prop_assert_eq!(decoded, request);
            }
        }
    }
}
