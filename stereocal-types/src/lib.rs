//! Shared vocabulary for the stereocal intake service: camera sides, the
//! wire header of a frame, the persisted-file layout, and the status
//! messages sent back to the capture client.

use serde::{Deserialize, Serialize};

/// Default address of the frame intake endpoint.
pub const DEFAULT_DATA_ADDR: &str = "127.0.0.1:12345";
/// Default address of the calibration-completion signal endpoint.
pub const DEFAULT_SIGNAL_ADDR: &str = "127.0.0.1:12346";

/// Sent to the capture client when the frame quota is reached and the
/// external calibration job starts.
pub const CALIBRATING_MSG: &str = "Calibrating...";
/// Sent to the capture client when the completion notification arrives.
pub const CALIBRATED_MSG: &str = "Calibrated!";

/// Literal token separating the side prefix from the payload length in a
/// frame header line.
const IMAGE_DATA_TOKEN: &str = "ImageData:";
const SENDING_PREFIX: &str = "Sending";

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("header line does not contain the \"ImageData:\" token")]
    MissingImageDataToken,
    #[error("unrecognized camera side in header: {0:?}")]
    UnknownSide(String),
    #[error("payload length is not a non-negative decimal integer: {0:?}")]
    BadPayloadLength(String),
}

pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Which physical camera of the stereo rig a frame belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CameraSide {
    Left,
    Right,
}

impl CameraSide {
    /// The wire and filename token for this side.
    pub fn as_str(&self) -> &'static str {
        match self {
            CameraSide::Left => "LEFT",
            CameraSide::Right => "RIGHT",
        }
    }

    /// Both sides of the rig, in a fixed order.
    pub fn both() -> [CameraSide; 2] {
        [CameraSide::Left, CameraSide::Right]
    }
}

impl std::str::FromStr for CameraSide {
    type Err = ProtocolError;
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "LEFT" => Ok(CameraSide::Left),
            "RIGHT" => Ok(CameraSide::Right),
            other => Err(ProtocolError::UnknownSide(other.to_string())),
        }
    }
}

impl std::fmt::Display for CameraSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The parsed header of one incoming frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub side: CameraSide,
    pub payload_len: usize,
}

/// Parse a frame header line of the form `Sending<SIDE>ImageData:<length>`.
///
/// Trailing `\n` (and a preceding `\r`, should a client send one) are
/// tolerated, as is an absent `Sending` token. The payload bytes themselves
/// follow the header on the wire and are not handled here.
pub fn parse_frame_header(line: &str) -> Result<FrameHeader> {
    let line = line.trim_end_matches(['\n', '\r']);
    let (prefix, len_str) = line
        .split_once(IMAGE_DATA_TOKEN)
        .ok_or(ProtocolError::MissingImageDataToken)?;
    let side_str = prefix.strip_prefix(SENDING_PREFIX).unwrap_or(prefix);
    let side: CameraSide = side_str.parse()?;
    let payload_len: usize = len_str
        .parse()
        .map_err(|_| ProtocolError::BadPayloadLength(len_str.to_string()))?;
    Ok(FrameHeader { side, payload_len })
}

/// Format a header line for `side` and `payload_len`, newline terminated.
pub fn frame_header_line(side: CameraSide, payload_len: usize) -> String {
    format!("{SENDING_PREFIX}{side}{IMAGE_DATA_TOKEN}{payload_len}\n")
}

/// Relative path of an accepted frame: `<SIDE>/<SIDE>_<index>.png` with a
/// 1-based index. This layout is the only contract with the external
/// calibration job, which reads the side directories by convention.
pub fn frame_relative_path(side: CameraSide, index: usize) -> std::path::PathBuf {
    std::path::PathBuf::from(side.as_str()).join(format!("{side}_{index}.png"))
}
