//! Decoders for the GATT measurement characteristics.
//!
//! Inputs are raw notification payloads exactly as delivered by the
//! peripheral. All multi-byte fields are little-endian.

use bytes::Buf;

use crate::error::{ParseError, ParseResult};
use crate::types::{CrankSample, CscMeasurement, WheelSample};

const HR_FLAG_VALUE_U16: u8 = 0x01;

const CSC_FLAG_WHEEL: u8 = 0x01;
const CSC_FLAG_CRANK: u8 = 0x02;
const CSC_WHEEL_LEN: usize = 6;
const CSC_CRANK_LEN: usize = 4;

/// Decode a Heart Rate Measurement (0x2A37) into beats per minute.
///
/// Bit 0 of the flags byte selects a 16-bit value; otherwise the value is
/// the single byte following the flags.
///
/// # Errors
///
/// Returns [`ParseError::InsufficientBytes`] when fewer than 2 bytes are
/// supplied, or fewer than 3 when the 16-bit flag is set.
pub fn decode_heart_rate(data: &[u8]) -> ParseResult<u16> {
    if data.len() < 2 {
        return Err(ParseError::insufficient(2, data.len()));
    }

    let mut buf = data;
    let flags = buf.get_u8();

    if flags & HR_FLAG_VALUE_U16 != 0 {
        if buf.remaining() < 2 {
            return Err(ParseError::insufficient(3, data.len()));
        }
        Ok(buf.get_u16_le())
    } else {
        Ok(u16::from(buf.get_u8()))
    }
}

/// Decode a Cycling Power Measurement (0x2A63) into watts.
///
/// The flags word is skipped; only the signed instantaneous power field is
/// read. Negative readings are clamped to zero.
///
/// # Errors
///
/// Returns [`ParseError::InsufficientBytes`] for payloads under 4 bytes.
pub fn decode_power(data: &[u8]) -> ParseResult<u16> {
    if data.len() < 4 {
        return Err(ParseError::insufficient(4, data.len()));
    }

    let mut buf = data;
    buf.advance(2);
    let watts = buf.get_i16_le();

    Ok(watts.max(0).unsigned_abs())
}

/// Decode a CSC Measurement (0x2A5B) into its raw wheel and crank fields.
///
/// Wheel data, when flagged, occupies the 6 bytes after the flags and pushes
/// the crank fields from offset 1 to offset 7. A payload without the crank
/// flag decodes successfully with `crank: None`.
///
/// # Errors
///
/// Returns [`ParseError::InsufficientBytes`] when the payload is empty or
/// shorter than the flagged fields require.
pub fn decode_csc(data: &[u8]) -> ParseResult<CscMeasurement> {
    if data.is_empty() {
        return Err(ParseError::insufficient(1, 0));
    }

    let mut buf = data;
    let flags = buf.get_u8();

    let mut expected = 1;
    if flags & CSC_FLAG_WHEEL != 0 {
        expected += CSC_WHEEL_LEN;
    }
    if flags & CSC_FLAG_CRANK != 0 {
        expected += CSC_CRANK_LEN;
    }
    if data.len() < expected {
        return Err(ParseError::insufficient(expected, data.len()));
    }

    let wheel = (flags & CSC_FLAG_WHEEL != 0).then(|| WheelSample {
        revolutions: buf.get_u32_le(),
        event_time: buf.get_u16_le(),
    });

    let crank = (flags & CSC_FLAG_CRANK != 0).then(|| CrankSample {
        revolutions: buf.get_u16_le(),
        event_time: buf.get_u16_le(),
    });

    Ok(CscMeasurement { wheel, crank })
}


#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        /// Decoders must never panic on arbitrary input.
        #[test]
        fn decoders_never_panic(data in proptest::collection::vec(any::<u8>(), 0..32)) {
            let _ = decode_heart_rate(&data);
            let _ = decode_power(&data);
            let _ = decode_csc(&data);
        }

        /// With bit 0 clear the 8-bit value comes back unchanged.
        #[test]
        fn heart_rate_u8_identity(flags in any::<u8>(), value in any::<u8>(), rest in proptest::collection::vec(any::<u8>(), 0..8)) {
            let flags = flags & !HR_FLAG_VALUE_U16;
            let mut data = vec![flags, value];
            data.extend(rest);
            prop_assert_eq!(decode_heart_rate(&data).unwrap(), u16::from(value));
        }

        #[test]
        fn power_never_negative(flags in any::<u16>(), watts in any::<i16>()) {
            let mut data = flags.to_le_bytes().to_vec();
            data.extend(watts.to_le_bytes());
            let decoded = decode_power(&data).unwrap();
            if watts < 0 {
                prop_assert_eq!(decoded, 0);
            } else {
                prop_assert_eq!(i32::from(decoded), i32::from(watts));
            }
        }

        #[test]
        fn csc_crank_roundtrips_fields(wheel in any::<bool>(), revs in any::<u16>(), time in any::<u16>()) {
            let mut data = vec![CSC_FLAG_CRANK | if wheel { CSC_FLAG_WHEEL } else { 0 }];
            if wheel {
                data.extend([0u8; CSC_WHEEL_LEN]);
            }
            data.extend(revs.to_le_bytes());
            data.extend(time.to_le_bytes());
            let csc = decode_csc(&data).unwrap();
            prop_assert_eq!(csc.crank, Some(CrankSample { revolutions: revs, event_time: time }));
        }
    }
}
