//!
//! This library provides communication with an URSA-II multichannel analyzer.
//!
//! <br>
//!
//! # Details
//!
//! - The URSA-II is attached by USB and shows up as a serial port.
//!
//! - Basic setup and acquisition
//!
//!   ```no_run
//!   use std::time::Duration;
//!   use ursactrl::{Device, DEFAULT_BAUDRATE};
//!   #[tokio::main]
//!   async fn main() -> ursactrl::Result<()> {
//!       let path = "/dev/ttyUSB0".to_string();
//!       let mut device = Device::new(&path, DEFAULT_BAUDRATE);
//!       device.connect().await?;
//!       device.start_acquire().await?;
//!       tokio::time::sleep(Duration::from_secs(10)).await;
//!       device.read()?;
//!       device.stop_acquire().await?;
//!       eprintln!("Counts: {}", device.spectrum().total());
//!       Ok(())
//!   }
//!   ```
//!
//! - The [`Spectrum`] is shared, take a snapshot from any thread while
//!   the session keeps decoding.
//!
//! # Supported devices
//!
//!  * URSA-II
//!

pub mod device;
pub mod proto;
pub mod settings;
pub mod spectrum;

pub use device::Device;
pub use proto::Result;
pub use settings::{SessionConfig, Settings, Startup};
pub use spectrum::Spectrum;

#[cfg(unix)]
pub const DEFAULT_TTY: &str = "/dev/ttyUSB0";
#[cfg(windows)]
pub const DEFAULT_TTY: &str = "COM1";

/// Default Baudrate for the URSA-II.
pub const DEFAULT_BAUDRATE: u32 = 115200;
