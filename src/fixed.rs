//! Fixed-point encodings used on the wire.
//!
//! The motor controllers exchange measurements and setpoints as integers with
//! an implied binary point. Conversions here use the same scale factors as the
//! controller firmware so that a value read back from a peer decodes to the
//! value that was written.

/// Scale of a signed 16-bit fraction of full output (-32768..=32767).
pub const FRACTION_FULL_SCALE: i32 = 32767;

/// Signed 8.8: one byte of integer part, one byte of fraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Q8_8(pub i16);

impl Q8_8 {
    pub const ONE: i32 = 1 << 8;

    pub fn from_f32(value: f32) -> Self {
        let scaled = (value * Self::ONE as f32).round();
        Self(scaled.clamp(i16::MIN as f32, i16::MAX as f32) as i16)
    }

    pub fn to_f32(self) -> f32 {
        f32::from(self.0) / Self::ONE as f32
    }

    pub fn from_unsigned(raw: u16) -> f32 {
        f32::from(raw) / Self::ONE as f32
    }
}

/// Signed 16.16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Q16_16(pub i32);

impl Q16_16 {
    pub const ONE: i64 = 1 << 16;

    pub fn from_f64(value: f64) -> Self {
        let scaled = (value * Self::ONE as f64).round();
        Self(scaled.clamp(f64::from(i32::MIN), f64::from(i32::MAX)) as i32)
    }

    pub fn to_f64(self) -> f64 {
        f64::from(self.0) / Self::ONE as f64
    }

    pub fn from_parts(integer: i16, fraction: u16) -> Self {
        Self((i32::from(integer) << 16) | i32::from(fraction))
    }
}

/// Convert a percentage of full output (-100.0..=100.0) to the 16-bit
/// fraction used for voltage setpoints.
pub fn percent_to_fraction(percent: f32) -> i16 {
    let scaled = (percent.clamp(-100.0, 100.0) / 100.0 * FRACTION_FULL_SCALE as f32).round();
    scaled as i16
}

pub fn fraction_to_percent(raw: i16) -> f32 {
    f32::from(raw) * 100.0 / FRACTION_FULL_SCALE as f32
}

/// Voltage ramp rate in volts per millisecond against a 12 V full scale,
/// encoded as fraction-of-full-scale per millisecond.
pub fn ramp_from_volts_per_ms(volts_per_ms_hundredths: u32) -> u16 {
    let ramp = u64::from(volts_per_ms_hundredths) * FRACTION_FULL_SCALE as u64 / 1200;
    ramp.min(u64::from(u16::MAX)) as u16
}
