use bytes::Bytes;

/// Items decoded from the inbound byte stream.
///
/// While acquiring a spectrum the instrument streams 3 byte frames
/// (`0xFF`, `b0`, `b1`) which decode into [`Response::Pulse`] or
/// [`Response::Battery`]. Outside of that the stream carries replies to
/// the last command sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    Pulse(Pulse),
    /// Raw 10 bit battery ADC value.
    Battery(u16),
    /// Bytes dropped while searching for the sync marker.
    Desync(Bytes),
    /// Trimmed reply line.
    Line(String),
    /// Geiger counts since the previous request.
    Counts(u32),
    /// Bytes nobody asked for.
    Unsolicited(Bytes),
}

/// Histogram event from a single frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pulse {
    /// Upper 6 bits of the first payload byte.
    pub count: u8,
    pub channel: u16,
}

impl Pulse {
    /// Amount the channel is incremented by.
    ///
    /// Only the top bits of the count field are used, the low bits were
    /// found to be unreliable on real hardware.
    pub fn increment(&self) -> u32 {
        u32::from(self.count >> 2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pulse_increment() {
        assert_eq!(Pulse { count: 1, channel: 0 }.increment(), 0);
        assert_eq!(Pulse { count: 4, channel: 0 }.increment(), 1);
        assert_eq!(Pulse { count: 63, channel: 0 }.increment(), 15);
    }
}
