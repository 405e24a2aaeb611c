use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_serial::SerialPortBuilderExt;

use super::Result;

pub trait SerialIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> SerialIo for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

pub type Port = Box<dyn SerialIo>;

/// Opens the byte channel to the instrument.
///
/// Opening may fail any number of times, the session retries.
pub trait Connector: Send {
    fn open(&mut self) -> Result<Port>;

    /// Name used in log messages.
    fn name(&self) -> &str;
}

pub struct SerialConnector {
    path: String,
    baudrate: u32,
    timeout: Duration,
}

impl SerialConnector {
    pub fn new(path: impl Into<String>, baudrate: u32) -> Self {
        Self {
            path: path.into(),
            baudrate,
            timeout: Duration::from_secs(1),
        }
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

impl Connector for SerialConnector {
    fn open(&mut self) -> Result<Port> {
        let mut port = tokio_serial::new(self.path.as_str(), self.baudrate)
            .timeout(self.timeout)
            .open_native_async()?;

        #[cfg(unix)]
        port.set_exclusive(false)?;

        Ok(Box::new(port))
    }

    fn name(&self) -> &str {
        &self.path
    }
}
