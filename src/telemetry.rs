//! Decoders for the indoor bike data and heart rate measurement formats.
//!
//! Both formats start with a flags field that gates a sequence of optional,
//! fixed-width little-endian fields. Decoding is pure: the returned
//! [`TelemetrySample`] carries only the fields actually present in the buffer.

use crate::{
    error::{ErgError, Result},
    types::{DeviceRole, TelemetrySample},
};
use bytes::Buf;

/// What to do with a field once its bytes are located
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Field {
    Speed,
    Cadence,
    Power,
    HeartRate,
    Skip,
}

/// Indoor bike data layout: (flag bit, width in bytes, field)
///
/// Bit 0 has inverted meaning: speed is present when the bit is CLEAR.
const INDOOR_BIKE_FIELDS: [(u16, usize, Field); 13] = [
    (0, 2, Field::Speed),
    (1, 2, Field::Skip),      // average speed
    (2, 2, Field::Cadence),
    (3, 2, Field::Skip),      // average cadence
    (4, 3, Field::Skip),      // total distance
    (5, 2, Field::Skip),      // resistance level
    (6, 2, Field::Power),
    (7, 2, Field::Skip),      // average power
    (8, 5, Field::Skip),      // expended energy
    (9, 1, Field::HeartRate),
    (10, 1, Field::Skip),     // metabolic equivalent
    (11, 2, Field::Skip),     // elapsed time
    (12, 2, Field::Skip),     // remaining time
];

/// Heart rate value is 16 bits wide when set
const HR_VALUE_FORMAT_U16: u8 = 0x01;

fn field_present(flags: u16, bit: u16) -> bool {
    let set = flags & (1 << bit) != 0;
    if bit == 0 {
        !set
    } else {
        set
    }
}

/// Decode an indoor bike data notification
///
/// Fields that run past the end of a truncated buffer are left absent.
///
/// # Errors
///
/// Returns [`ErgError::ParseError`] if the buffer cannot hold the flags field.
pub fn parse_indoor_bike_data(data: &[u8]) -> Result<TelemetrySample> {
    if data.len() < 2 {
        return Err(ErgError::ParseError(format!(
            "Indoor bike data too short: {} bytes",
            data.len()
        )));
    }

    let mut buf = data;
    let flags = buf.get_u16_le();
    let mut sample = TelemetrySample::empty(DeviceRole::Control);

    for (bit, width, field) in INDOOR_BIKE_FIELDS {
        if !field_present(flags, bit) {
            continue;
        }
        if buf.remaining() < width {
            break;
        }

        match field {
            Field::Speed => sample.speed_kph = Some(f64::from(buf.get_u16_le()) / 100.0),
            Field::Cadence => sample.cadence_rpm = Some(f64::from(buf.get_u16_le()) / 2.0),
            Field::Power => sample.power_watts = Some(buf.get_i16_le()),
            Field::HeartRate => sample.heart_rate_bpm = Some(u16::from(buf.get_u8())),
            Field::Skip => buf.advance(width),
        }
    }

    Ok(sample)
}

/// Decode a heart rate measurement notification
///
/// Only the heart rate value is extracted.
///
/// # Errors
///
/// Returns [`ErgError::ParseError`] if the value is missing.
pub fn parse_heart_rate_measurement(data: &[u8]) -> Result<TelemetrySample> {
    let mut buf = data;
    if !buf.has_remaining() {
        return Err(ErgError::ParseError(
            "Empty heart rate measurement".to_string(),
        ));
    }

    let flags = buf.get_u8();
    let bpm = if flags & HR_VALUE_FORMAT_U16 != 0 {
        if buf.remaining() < 2 {
            return Err(ErgError::ParseError(
                "Heart rate measurement truncated (16-bit value)".to_string(),
            ));
        }
        buf.get_u16_le()
    } else {
        if !buf.has_remaining() {
            return Err(ErgError::ParseError(
                "Heart rate measurement truncated (8-bit value)".to_string(),
            ));
        }
        u16::from(buf.get_u8())
    };

    let mut sample = TelemetrySample::empty(DeviceRole::HeartRate);
    sample.heart_rate_bpm = Some(bpm);
    Ok(sample)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn approx(actual: Option<f64>, expected: f64) -> bool {
        actual.is_some_and(|value| (value - expected).abs() < 1e-9)
    }

    #[test]
    fn test_speed_only() {
        let sample = parse_indoor_bike_data(&[0x00, 0x00, 0x64, 0x00]).unwrap();
        assert!(approx(sample.speed_kph, 1.00));
        assert_eq!(sample.power_watts, None);
        assert_eq!(sample.cadence_rpm, None);
        assert_eq!(sample.heart_rate_bpm, None);
    }

    #[test]
    fn test_power_only_without_speed() {
        // bit 0 set (no speed), bit 6 set (instantaneous power)
        let sample = parse_indoor_bike_data(&[0x41, 0x00, 0xE8, 0x00]).unwrap();
        assert_eq!(sample.power_watts, Some(232));
        assert_eq!(sample.speed_kph, None);
    }

    #[test]
    fn test_bit_zero_clear_reads_speed_first() {
        // flags 0x0040: bit 0 is the FTMS "More Data" bit, clear means
        // instantaneous speed is present, so the power field is truncated
        let sample = parse_indoor_bike_data(&[0x40, 0x00, 0xE8, 0x00]).unwrap();
        assert!(approx(sample.speed_kph, 2.32));
        assert_eq!(sample.power_watts, None);
    }

    #[test]
    fn test_full_frame_skips_unused_fields() {
        // speed, avg speed, cadence, total distance, resistance, power,
        // expended energy, heart rate, elapsed time
        let flags: u16 = (1 << 1) | (1 << 2) | (1 << 4) | (1 << 5) | (1 << 6) | (1 << 8) | (1 << 9) | (1 << 11);
        let mut frame = flags.to_le_bytes().to_vec();
        frame.extend_from_slice(&2950u16.to_le_bytes()); // speed 29.50
        frame.extend_from_slice(&2800u16.to_le_bytes()); // avg speed
        frame.extend_from_slice(&181u16.to_le_bytes()); // cadence 90.5
        frame.extend_from_slice(&[0x10, 0x27, 0x00]); // total distance
        frame.extend_from_slice(&40i16.to_le_bytes()); // resistance
        frame.extend_from_slice(&(-12i16).to_le_bytes()); // power
        frame.extend_from_slice(&[0x00, 0x01, 0xFF, 0xFF, 0x0F]); // energy
        frame.push(142); // heart rate
        frame.extend_from_slice(&600u16.to_le_bytes()); // elapsed

        let sample = parse_indoor_bike_data(&frame).unwrap();
        assert!(approx(sample.speed_kph, 29.5));
        assert!(approx(sample.cadence_rpm, 90.5));
        assert_eq!(sample.power_watts, Some(-12));
        assert_eq!(sample.heart_rate_bpm, Some(142));
    }

    #[test]
    fn test_truncated_heart_rate_is_absent() {
        let flags: u16 = 1 | (1 << 6) | (1 << 9);
        let mut frame = flags.to_le_bytes().to_vec();
        frame.extend_from_slice(&150i16.to_le_bytes());

        let sample = parse_indoor_bike_data(&frame).unwrap();
        assert_eq!(sample.power_watts, Some(150));
        assert_eq!(sample.heart_rate_bpm, None);
    }

    #[test]
    fn test_truncated_mid_field_stops() {
        let flags: u16 = 1 | (1 << 2) | (1 << 6);
        let mut frame = flags.to_le_bytes().to_vec();
        frame.extend_from_slice(&160u16.to_le_bytes());
        frame.push(0xC8);

        let sample = parse_indoor_bike_data(&frame).unwrap();
        assert!(approx(sample.cadence_rpm, 80.0));
        assert_eq!(sample.power_watts, None);
    }

    #[test]
    fn test_flags_only_frame_is_empty() {
        let sample = parse_indoor_bike_data(&[0x01, 0x00]).unwrap();
        assert!(sample.is_empty());
        assert!(parse_indoor_bike_data(&[0x01]).is_err());
    }

    #[test]
    fn test_heart_rate_u8() {
        let sample = parse_heart_rate_measurement(&[0x00, 0x46]).unwrap();
        assert_eq!(sample.heart_rate_bpm, Some(70));
        assert_eq!(sample.source, DeviceRole::HeartRate);
    }

    #[test]
    fn test_heart_rate_u16() {
        let sample = parse_heart_rate_measurement(&[0x01, 0x46, 0x00]).unwrap();
        assert_eq!(sample.heart_rate_bpm, Some(70));
    }

    #[test]
    fn test_heart_rate_ignores_trailing_fields() {
        // sensor contact + RR interval bits set, trailing bytes ignored
        let sample = parse_heart_rate_measurement(&[0x16, 0x48, 0x10, 0x03]).unwrap();
        assert_eq!(sample.heart_rate_bpm, Some(72));
    }

    #[test]
    fn test_heart_rate_truncated() {
        assert!(parse_heart_rate_measurement(&[]).is_err());
        assert!(parse_heart_rate_measurement(&[0x00]).is_err());
        assert!(parse_heart_rate_measurement(&[0x01, 0x46]).is_err());
    }
}
