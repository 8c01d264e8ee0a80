//! Core types for fitness sensor telemetry.

use core::fmt;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::decode;
use crate::error::ParseResult;
use crate::uuid as ble;

/// A GATT measurement characteristic the bridge knows how to decode.
///
/// Each variant pairs a characteristic UUID with its parent service and the
/// decoder that turns its notification payload into a [`Measurement`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Characteristic {
    /// Heart Rate Measurement (0x2A37) under the Heart Rate service.
    HeartRate,
    /// Cycling Power Measurement (0x2A63) under the Cycling Power service.
    CyclingPower,
    /// CSC Measurement (0x2A5B) under the Cycling Speed and Cadence service.
    Csc,
}

impl Characteristic {
    /// All supported characteristics.
    pub const ALL: [Characteristic; 3] = [
        Characteristic::HeartRate,
        Characteristic::CyclingPower,
        Characteristic::Csc,
    ];

    /// The characteristic UUID.
    #[must_use]
    pub fn uuid(self) -> Uuid {
        match self {
            Characteristic::HeartRate => ble::HEART_RATE_MEASUREMENT,
            Characteristic::CyclingPower => ble::CYCLING_POWER_MEASUREMENT,
            Characteristic::Csc => ble::CSC_MEASUREMENT,
        }
    }

    /// The UUID of the service this characteristic lives under.
    #[must_use]
    pub fn service(self) -> Uuid {
        match self {
            Characteristic::HeartRate => ble::HEART_RATE_SERVICE,
            Characteristic::CyclingPower => ble::CYCLING_POWER_SERVICE,
            Characteristic::Csc => ble::CYCLING_SPEED_CADENCE_SERVICE,
        }
    }

    /// Look up a characteristic by UUID.
    #[must_use]
    pub fn from_uuid(uuid: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == *uuid)
    }

    /// The snapshot metric fed by this characteristic.
    #[must_use]
    pub fn metric(self) -> Metric {
        match self {
            Characteristic::HeartRate => Metric::HeartRate,
            Characteristic::CyclingPower => Metric::Power,
            Characteristic::Csc => Metric::Cadence,
        }
    }

    /// Decode a raw notification payload for this characteristic.
    ///
    /// # Errors
    ///
    /// Returns a [`ParseError`](crate::ParseError) when the payload is
    /// shorter than its flags require.
    pub fn decode(self, data: &[u8]) -> ParseResult<Measurement> {
        match self {
            Characteristic::HeartRate => decode::decode_heart_rate(data).map(Measurement::HeartRate),
            Characteristic::CyclingPower => decode::decode_power(data).map(Measurement::Power),
            Characteristic::Csc => decode::decode_csc(data).map(Measurement::Csc),
        }
    }
}

impl fmt::Display for Characteristic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Characteristic::HeartRate => write!(f, "heart rate (0x2A37)"),
            Characteristic::CyclingPower => write!(f, "cycling power (0x2A63)"),
            Characteristic::Csc => write!(f, "CSC (0x2A5B)"),
        }
    }
}

/// One of the three values carried by the telemetry snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "snake_case"))]
pub enum Metric {
    /// Instantaneous power in watts.
    Power,
    /// Heart rate in beats per minute.
    HeartRate,
    /// Crank cadence in revolutions per minute.
    Cadence,
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Metric::Power => write!(f, "power"),
            Metric::HeartRate => write!(f, "hr"),
            Metric::Cadence => write!(f, "cadence"),
        }
    }
}

/// Crank revolution data from a CSC Measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CrankSample {
    /// Cumulative crank revolutions (wraps at 65536).
    pub revolutions: u16,
    /// Last crank event time in 1/1024 s units (wraps at 65536).
    pub event_time: u16,
}

/// Wheel revolution data from a CSC Measurement.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct WheelSample {
    /// Cumulative wheel revolutions.
    pub revolutions: u32,
    /// Last wheel event time in 1/1024 s units (wraps at 65536).
    pub event_time: u16,
}

/// A decoded CSC Measurement notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CscMeasurement {
    /// Wheel data, when the wheel-present flag is set.
    pub wheel: Option<WheelSample>,
    /// Crank data, when the crank-present flag is set.
    pub crank: Option<CrankSample>,
}

impl CscMeasurement {
    /// Whether the payload carried crank revolution data.
    #[must_use]
    pub fn has_crank_data(&self) -> bool {
        self.crank.is_some()
    }
}

/// A decoded notification value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(tag = "type", content = "value", rename_all = "snake_case")
)]
pub enum Measurement {
    /// Heart rate in bpm.
    HeartRate(u16),
    /// Instantaneous power in watts, clamped at zero.
    Power(u16),
    /// Raw CSC data; cadence requires the previous sample.
    Csc(CscMeasurement),
}

/// JSON body posted to the metrics sink.
///
/// Serializes as `{"power": .., "hr": .., "cadence": ..}` with an optional
/// `elapsed` field in whole seconds since the bridge started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct TelemetryPayload {
    /// Instantaneous power in watts.
    pub power: u16,
    /// Heart rate in bpm.
    pub hr: u16,
    /// Cadence in rpm.
    pub cadence: u16,
    /// Seconds since the bridge started, when enabled.
    #[cfg_attr(
        feature = "serde",
        serde(default, skip_serializing_if = "Option::is_none")
    )]
    pub elapsed: Option<u64>,
}

impl fmt::Display for TelemetryPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Power: {}W | HR: {}bpm | Cadence: {}rpm",
            self.power, self.hr, self.cadence
        )
    }
}
