//! Platform-agnostic types for BLE fitness sensor telemetry.
//!
//! This crate holds everything about the sensors that does not need a
//! Bluetooth stack: GATT UUID constants, the measurement decoders, and the
//! JSON payload posted to the metrics sink.
//!
//! # Example
//!
//! ```
//! use spinbridge_types::{Characteristic, Measurement};
//!
//! let value = Characteristic::HeartRate.decode(&[0x00, 0x48]).unwrap();
//! assert_eq!(value, Measurement::HeartRate(72));
//! ```

pub mod decode;
pub mod error;
pub mod types;
pub mod uuid;

pub use decode::{decode_csc, decode_heart_rate, decode_power};
pub use error::{ParseError, ParseResult};
pub use types::{
    Characteristic, CrankSample, CscMeasurement, Measurement, Metric, TelemetryPayload,
    WheelSample,
};
pub use uuid as uuids;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_characteristic_lookup_by_uuid() {
        for c in Characteristic::ALL {
            assert_eq!(Characteristic::from_uuid(&c.uuid()), Some(c));
        }
        assert_eq!(Characteristic::from_uuid(&uuids::HEART_RATE_SERVICE), None);
    }

    #[test]
    fn test_characteristic_services() {
        assert_eq!(
            Characteristic::HeartRate.service(),
            uuids::HEART_RATE_SERVICE
        );
        assert_eq!(
            Characteristic::CyclingPower.service(),
            uuids::CYCLING_POWER_SERVICE
        );
        assert_eq!(
            Characteristic::Csc.service(),
            uuids::CYCLING_SPEED_CADENCE_SERVICE
        );
    }

    #[test]
    fn test_characteristic_metrics() {
        assert_eq!(Characteristic::HeartRate.metric(), Metric::HeartRate);
        assert_eq!(Characteristic::CyclingPower.metric(), Metric::Power);
        assert_eq!(Characteristic::Csc.metric(), Metric::Cadence);
    }

    #[test]
    fn test_characteristic_decode_dispatch() {
        assert_eq!(
            Characteristic::CyclingPower
                .decode(&[0x00, 0x00, 0xC8, 0x00])
                .unwrap(),
            Measurement::Power(200)
        );
        let Measurement::Csc(csc) = Characteristic::Csc
            .decode(&[0x02, 0x01, 0x00, 0x00, 0x04])
            .unwrap()
        else {
            panic!("expected CSC measurement");
        };
        assert!(csc.has_crank_data());
        assert!(Characteristic::HeartRate.decode(&[0x01]).is_err());
    }

    #[test]
    fn test_payload_display() {
        let payload = TelemetryPayload {
            power: 210,
            hr: 141,
            cadence: 88,
            elapsed: None,
        };
        assert_eq!(
            payload.to_string(),
            "Power: 210W | HR: 141bpm | Cadence: 88rpm"
        );
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_payload_json_shape() {
        let payload = TelemetryPayload {
            power: 200,
            hr: 72,
            cadence: 60,
            elapsed: None,
        };
        let json = serde_json::to_value(payload).unwrap();
        assert_eq!(
            json,
            serde_json::json!({"power": 200, "hr": 72, "cadence": 60})
        );

        let with_elapsed = TelemetryPayload {
            elapsed: Some(42),
            ..payload
        };
        let json = serde_json::to_value(with_elapsed).unwrap();
        assert_eq!(json["elapsed"], 42);
    }

    #[cfg(feature = "serde")]
    #[test]
    fn test_characteristic_config_names() {
        let parsed: Vec<Characteristic> =
            serde_json::from_str(r#"["heart_rate", "cycling_power", "csc"]"#).unwrap();
        assert_eq!(parsed, Characteristic::ALL.to_vec());
    }
}
