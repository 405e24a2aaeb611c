use self::response::Response;

pub mod codec;
pub mod command;
pub mod conv;
pub mod port;
pub mod response;

#[cfg(test)]
pub(crate) mod fake;

use thiserror::Error;

/// Longest reply line the instrument sends.
pub const MAX_LINE_LENGTH: usize = 128;

#[derive(Error, Debug)]
pub enum ProtoError {
    #[error("I/O error: {:?}", _0)]
    Io(#[from] std::io::Error),

    #[error("Serial I/O error: {:?}", _0)]
    Serial(#[from] tokio_serial::Error),

    #[error("Not connected to serial port")]
    NotConnected,
    #[error("URSA is not responding")]
    NotResponsive,

    #[error("Command refused while acquiring")]
    Busy,
    #[error("Command requires an acquisition in Geiger mode")]
    NotGeigerMode,

    #[error("Voltage must be between 0 and 2000 volts, got {0}")]
    VoltageOutOfRange(u16),
    #[error("Gain must be above 0 and below 250x, got {0}")]
    GainOutOfRange(f64),
    #[error("Ramp must be between 6 and 219 seconds, got {0}")]
    RampOutOfRange(u16),
    #[error("Threshold must be between 25 and 1023 mV, got {0}")]
    ThresholdOutOfRange(u16),
    #[error("Bits must be between 8 and 12, got {0}")]
    BitDepthOutOfRange(u8),
    #[error("Serial must be between 200000 and 299999, got {0}")]
    SerialNumberOutOfRange(u32),
    #[error("Smudge factor must be between 0 and 4, got {0}")]
    SmudgeOutOfRange(u8),

    #[error("Timed out waiting for reply")]
    Timeout,
    #[error("Invalid reply: {0}")]
    InvalidReply(String),
    #[error("Unexpected response: {:?}", _0)]
    Unexpected(Response),
    #[error("Ramp wait was cancelled")]
    Cancelled,
    #[error("Connection was closed")]
    Abort,
}

impl From<Response> for ProtoError {
    fn from(value: Response) -> Self {
        Self::Unexpected(value)
    }
}

pub type Result<T> = std::result::Result<T, ProtoError>;
