use std::fmt;
use std::str::FromStr;

/// Commands understood by the URSA-II.
///
/// Payloads are already quantized to wire values, see [`super::conv`]
/// for the conversions from physical units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// `U`, replies with the identity line.
    Probe,
    // Acquisition
    StartAcquire,
    StopAcquire,
    EnterGeiger,
    LeaveGeiger,
    RequestCounts,
    // High voltage
    StopVoltage,
    SetVoltage(u16),
    SetNoSave,
    LoadPrevious,
    SetRamp(u16),
    NoRamp,
    // Amplifier
    SetGain { coarse: u8, fine: u8 },
    SetInput(Input),
    SetShapingTime(ShapingTime),
    SetThreshold([u8; 3]),
    SetBitMode(u8),
    // Misc
    RequestBattery,
    StartAscii,
    StopAscii,
    RequestSerialNumber,
    RequestMaxVoltage,
    ProgramSerialNumber,
    SerialNumber(u32),
    SetSmudge(u8),
    Alarm0(bool),
    Alarm1(bool),
}

/// Shape of the reply the instrument sends after a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// Nothing specific, any bytes are unsolicited.
    None,
    /// A newline terminated ASCII line.
    Line,
    /// Four bytes, big endian count.
    Counts,
    /// Two bytes of battery ADC, three in Geiger mode.
    Battery,
}

impl Command {
    pub fn reply(&self) -> Reply {
        match self {
            Command::Probe | Command::RequestSerialNumber | Command::RequestMaxVoltage => {
                Reply::Line
            }
            Command::RequestCounts => Reply::Counts,
            Command::RequestBattery => Reply::Battery,
            _ => Reply::None,
        }
    }

    /// Settings the instrument stores in EEPROM. These are refused
    /// while an acquisition is running.
    pub fn is_persisted(&self) -> bool {
        matches!(
            self,
            Command::SetVoltage(_)
                | Command::SetNoSave
                | Command::LoadPrevious
                | Command::SetRamp(_)
                | Command::NoRamp
                | Command::SetGain { .. }
                | Command::SetInput(_)
                | Command::SetShapingTime(_)
                | Command::SetThreshold(_)
                | Command::SetBitMode(_)
                | Command::StartAscii
                | Command::StopAscii
                | Command::ProgramSerialNumber
                | Command::SerialNumber(_)
                | Command::SetSmudge(_)
        )
    }
}

/// Signal input and polarity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Input {
    Input1Negative = 0,
    Input1Positive,
    Input2Negative,
    Input2Positive,
    /// Pre-shaped positive pulse on either input.
    ShapedPositive,
}

impl FromStr for Input {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "input1_negative" => Ok(Input::Input1Negative),
            "input1_positive" => Ok(Input::Input1Positive),
            "input2_negative" => Ok(Input::Input2Negative),
            "input2_positive" => Ok(Input::Input2Positive),
            "shaped_input" => Ok(Input::ShapedPositive),
            other => Err(format!(
                "invalid input {:?}, expected input1_negative, input1_positive, \
                 input2_negative, input2_positive or shaped_input",
                other
            )),
        }
    }
}

impl fmt::Display for Input {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Input::Input1Negative => "input1_negative",
            Input::Input1Positive => "input1_positive",
            Input::Input2Negative => "input2_negative",
            Input::Input2Positive => "input2_positive",
            Input::ShapedPositive => "shaped_input",
        };
        f.write_str(name)
    }
}

/// Amplifier shaping time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShapingTime {
    Us0_25 = 0,
    Us0_5,
    Us1,
    Us2,
    Us4,
    Us6,
    Us8,
    Us10,
}

impl ShapingTime {
    pub fn micros(&self) -> f64 {
        match self {
            ShapingTime::Us0_25 => 0.25,
            ShapingTime::Us0_5 => 0.5,
            ShapingTime::Us1 => 1.0,
            ShapingTime::Us2 => 2.0,
            ShapingTime::Us4 => 4.0,
            ShapingTime::Us6 => 6.0,
            ShapingTime::Us8 => 8.0,
            ShapingTime::Us10 => 10.0,
        }
    }
}

impl FromStr for ShapingTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let micros = s
            .trim_end_matches("us")
            .parse::<f64>()
            .map_err(|e| format!("invalid shaping time {:?}: {}", s, e))?;
        [
            ShapingTime::Us0_25,
            ShapingTime::Us0_5,
            ShapingTime::Us1,
            ShapingTime::Us2,
            ShapingTime::Us4,
            ShapingTime::Us6,
            ShapingTime::Us8,
            ShapingTime::Us10,
        ]
        .into_iter()
        .find(|t| t.micros() == micros)
        .ok_or_else(|| {
            format!(
                "invalid shaping time {}us, expected one of 0.25, 0.5, 1, 2, 4, 6, 8, 10",
                micros
            )
        })
    }
}

impl fmt::Display for ShapingTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}us", self.micros())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_shapes() {
        assert_eq!(Command::Probe.reply(), Reply::Line);
        assert_eq!(Command::RequestCounts.reply(), Reply::Counts);
        assert_eq!(Command::RequestBattery.reply(), Reply::Battery);
        assert_eq!(Command::SetVoltage(100).reply(), Reply::None);
    }

    #[test]
    fn test_persisted() {
        assert!(Command::SetVoltage(0).is_persisted());
        assert!(Command::SetSmudge(1).is_persisted());
        assert!(!Command::StopVoltage.is_persisted());
        assert!(!Command::Alarm0(true).is_persisted());
        assert!(!Command::RequestBattery.is_persisted());
    }

    #[test]
    fn test_parse_input() {
        assert_eq!(
            "input2_positive".parse::<Input>().unwrap(),
            Input::Input2Positive
        );
        assert_eq!("shaped_input".parse::<Input>().unwrap(), Input::ShapedPositive);
        assert!("input3".parse::<Input>().is_err());
    }

    #[test]
    fn test_parse_shaping_time() {
        assert_eq!("0.25".parse::<ShapingTime>().unwrap(), ShapingTime::Us0_25);
        assert_eq!("10us".parse::<ShapingTime>().unwrap(), ShapingTime::Us10);
        assert!("3".parse::<ShapingTime>().is_err());
        assert_eq!(ShapingTime::Us1 as u8, 2);
    }
}
