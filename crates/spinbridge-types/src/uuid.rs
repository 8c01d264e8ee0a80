//! Bluetooth SIG UUIDs for the fitness profiles the bridge consumes.
//!
//! All values are 16-bit assigned numbers expanded onto the Bluetooth base
//! UUID `0000xxxx-0000-1000-8000-00805f9b34fb`.

use uuid::{Uuid, uuid};

// --- Service UUIDs ---

/// Heart Rate service (0x180D).
pub const HEART_RATE_SERVICE: Uuid = uuid!("0000180d-0000-1000-8000-00805f9b34fb");

/// Cycling Speed and Cadence service (0x1816).
pub const CYCLING_SPEED_CADENCE_SERVICE: Uuid = uuid!("00001816-0000-1000-8000-00805f9b34fb");

/// Cycling Power service (0x1818).
pub const CYCLING_POWER_SERVICE: Uuid = uuid!("00001818-0000-1000-8000-00805f9b34fb");

// --- Characteristic UUIDs ---

/// Heart Rate Measurement characteristic (0x2A37).
pub const HEART_RATE_MEASUREMENT: Uuid = uuid!("00002a37-0000-1000-8000-00805f9b34fb");

/// CSC Measurement characteristic (0x2A5B).
pub const CSC_MEASUREMENT: Uuid = uuid!("00002a5b-0000-1000-8000-00805f9b34fb");

/// Cycling Power Measurement characteristic (0x2A63).
pub const CYCLING_POWER_MEASUREMENT: Uuid = uuid!("00002a63-0000-1000-8000-00805f9b34fb");

/// Extract the 16-bit assigned number from a UUID built on the Bluetooth base UUID.
///
/// Returns `None` for vendor-specific 128-bit UUIDs.
pub fn short_id(uuid: &Uuid) -> Option<u16> {
    const BASE_TAIL: [u8; 12] = [
        0x00, 0x00, 0x10, 0x00, 0x80, 0x00, 0x00, 0x80, 0x5f, 0x9b, 0x34, 0xfb,
    ];
    let bytes = uuid.as_bytes();
    if bytes[..2] != [0, 0] || bytes[4..] != BASE_TAIL {
        return None;
    }
    Some(u16::from_be_bytes([bytes[2], bytes[3]]))
}
