//! Conversions between physical units and wire values.

use super::{ProtoError, Result};

pub const MAX_VOLTAGE: u16 = 2000;
const VOLTAGE_FULL_SCALE: f64 = 65532.0;

/// Upper bound (exclusive) of each coarse gain range.
pub const GAIN_BREAKPOINTS: [f64; 6] = [2.0, 4.0, 15.0, 35.0, 125.0, 250.0];

pub const MIN_RAMP: u16 = 6;
pub const MAX_RAMP: u16 = 219;
const RAMP_LIMIT: u16 = 16383;
// Sent instead of anything above RAMP_LIMIT. Larger than the limit itself,
// kept as the firmware has always received it.
pub const RAMP_CLAMP: u16 = 16838;

pub const MIN_THRESHOLD: u16 = 25;
pub const MAX_THRESHOLD: u16 = 1023;
const MIN_OFFSET: u16 = 100;

pub const MIN_SERIAL: u32 = 200000;
pub const MAX_SERIAL: u32 = 299999;
pub const MAX_SMUDGE: u8 = 4;

/// High voltage in volts to the 16 bit DAC value.
pub fn voltage_to_wire(volts: u16) -> Result<u16> {
    if volts > MAX_VOLTAGE {
        return Err(ProtoError::VoltageOutOfRange(volts));
    }
    Ok((f64::from(volts) / f64::from(MAX_VOLTAGE) * VOLTAGE_FULL_SCALE).round() as u16)
}

/// Coarse and fine gain as sent with `C<coarse>F<fine>`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainSetting {
    /// ASCII `'0'..='5'`.
    pub coarse: u8,
    pub fine: u8,
    pub range_max: f64,
}

impl GainSetting {
    /// Fraction of the coarse range selected by the fine byte.
    pub fn fine_fraction(&self) -> f64 {
        (f64::from(self.fine) + 1.0) / 256.0
    }

    /// Gain the instrument ends up with.
    pub fn gain(&self) -> f64 {
        self.fine_fraction() * self.range_max
    }
}

pub fn gain_to_wire(gain: f64) -> Result<GainSetting> {
    if !gain.is_finite() || gain <= 0.0 {
        return Err(ProtoError::GainOutOfRange(gain));
    }
    let (range, range_max) = GAIN_BREAKPOINTS
        .iter()
        .enumerate()
        .find(|(_, max)| gain < **max)
        .ok_or(ProtoError::GainOutOfRange(gain))?;
    let fine = ((gain / range_max) * 256.0 - 1.0).round().clamp(0.0, 255.0) as u8;
    Ok(GainSetting {
        coarse: b'0' + range as u8,
        fine,
        range_max: *range_max,
    })
}

/// Ramp time in seconds per 100 V to the ramp register value.
pub fn ramp_to_wire(seconds: u16) -> Result<u16> {
    if !(MIN_RAMP..=MAX_RAMP).contains(&seconds) {
        return Err(ProtoError::RampOutOfRange(seconds));
    }
    let ramp = (f64::from(seconds) * 303.45 - 1197.0).round();
    if ramp > f64::from(RAMP_LIMIT) {
        Ok(RAMP_CLAMP)
    } else {
        Ok(ramp as u16)
    }
}

/// Threshold in millivolts packed into the three payload bytes of `T`.
pub fn threshold_to_wire(millivolts: u16) -> Result<[u8; 3]> {
    if !(MIN_THRESHOLD..=MAX_THRESHOLD).contains(&millivolts) {
        return Err(ProtoError::ThresholdOutOfRange(millivolts));
    }
    let thresh = millivolts * 2;
    let offset = if millivolts > MIN_OFFSET {
        millivolts
    } else {
        MIN_OFFSET
    };
    Ok([
        ((thresh >> 4) & 0xFF) as u8,
        (((thresh & 0xF) << 4) | ((offset >> 8) & 0xF)) as u8,
        (offset & 0xFF) as u8,
    ])
}

/// ADC resolution in bits to the `M` argument.
pub fn bit_mode_to_wire(bits: u8) -> Result<u8> {
    if !(8..=12).contains(&bits) {
        return Err(ProtoError::BitDepthOutOfRange(bits));
    }
    Ok(13 - bits)
}

pub fn check_serial_number(serial: u32) -> Result<u32> {
    if !(MIN_SERIAL..=MAX_SERIAL).contains(&serial) {
        return Err(ProtoError::SerialNumberOutOfRange(serial));
    }
    Ok(serial)
}

pub fn check_smudge(smudge: u8) -> Result<u8> {
    if smudge > MAX_SMUDGE {
        return Err(ProtoError::SmudgeOutOfRange(smudge));
    }
    Ok(smudge)
}

/// Battery voltage from the raw 10 bit ADC reading.
pub fn battery_volts(raw: u16) -> f32 {
    f32::from(raw) * 12.0 / 1024.0
}
