use std::time::Duration;

use crate::proto::command::{Input, ShapingTime};
use crate::proto::{conv, Result};

/// Timing and retry behaviour of a [`crate::Device`] session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Longest wait for a reply.
    pub timeout: Duration,
    /// Pause after every command written.
    pub settle: Duration,
    /// Pause between stop requests while draining the stream.
    pub stop_settle: Duration,
    pub connect_attempts: usize,
    pub handshake_attempts: usize,
    /// Pause before polling for the end of a high voltage ramp.
    pub ramp_delay: Duration,
    /// Number of battery probes sent while waiting for a ramp.
    pub ramp_polls: usize,
    /// Pause after programming a serial number.
    pub serial_settle: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(1000),
            settle: Duration::from_millis(100),
            stop_settle: Duration::from_micros(500),
            connect_attempts: 5,
            handshake_attempts: 5,
            ramp_delay: Duration::from_secs(5),
            ramp_polls: 60,
            serial_settle: Duration::from_secs(3),
        }
    }
}

/// Full instrument profile.
#[derive(Debug, Clone, PartialEq)]
pub struct Settings {
    /// Volts, 0 to 2000.
    pub high_voltage: u16,
    pub gain: f64,
    /// Millivolts, 25 to 1023.
    pub threshold: u16,
    pub shaping_time: ShapingTime,
    pub input: Input,
    /// Seconds per 100 V, 6 to 219.
    pub ramp: u16,
}

impl Settings {
    /// Check every value before anything is sent to the instrument.
    pub fn validate(&self) -> Result<()> {
        conv::gain_to_wire(self.gain)?;
        conv::threshold_to_wire(self.threshold)?;
        conv::ramp_to_wire(self.ramp)?;
        conv::voltage_to_wire(self.high_voltage)?;
        Ok(())
    }
}

/// How a session configures the instrument before acquiring.
#[derive(Debug, Clone, PartialEq)]
pub enum Startup {
    /// Restore the profile stored in the instrument's EEPROM.
    LoadPrevious,
    Apply(Settings),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            high_voltage: 900,
            gain: 70.0,
            threshold: 100,
            shaping_time: ShapingTime::Us1,
            input: Input::Input1Negative,
            ramp: 6,
        }
    }

    #[test]
    fn test_validate() {
        assert!(settings().validate().is_ok());
        assert!(Settings {
            gain: 300.0,
            ..settings()
        }
        .validate()
        .is_err());
        assert!(Settings {
            high_voltage: 2500,
            ..settings()
        }
        .validate()
        .is_err());
        assert!(Settings {
            ramp: 2,
            ..settings()
        }
        .validate()
        .is_err());
    }
}
