use std::str::FromStr;

use uuid::Uuid;

use crate::{Error, Result};

const BLUETOOTH_BASE_UUID: u128 = 0x00000000_0000_1000_8000_00805f9b34fb;
const BLUETOOTH_BASE_MASK_32: u128 = 0x00000000_ffff_ffff_ffff_ffffffffffff;
const BLUETOOTH_BASE_MASK_16: u128 = 0xffff0000_ffff_ffff_ffff_ffffffffffff;

pub trait BluetoothUuid {
    fn as_u16(&self) -> Option<u16>;
    fn as_u32(&self) -> Option<u32>;
}

impl BluetoothUuid for Uuid {
    fn as_u16(&self) -> Option<u16> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_16 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u16)
        } else {
            None
        }
    }

    fn as_u32(&self) -> Option<u32> {
        let value = self.as_u128();
        if value & BLUETOOTH_BASE_MASK_32 == BLUETOOTH_BASE_UUID {
            Some((value >> 96) as u32)
        } else {
            None
        }
    }
}

// Const so that snippets can declare well-known service uuids as consts

pub const fn uuid_from_u16(v: u16) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}
pub const fn uuid_from_u32(v: u32) -> Uuid {
    Uuid::from_u128(BLUETOOTH_BASE_UUID | ((v as u128) << 96))
}

/// Parses a uuid as a remote caller writes it: either the full 128 bit form
/// or a 16/32 bit Bluetooth SIG short form such as "180D".
pub fn parse_uuid(s: &str) -> Result<Uuid> {
    let s = s.trim();
    match s.len() {
        4 => u16::from_str_radix(s, 16).map(uuid_from_u16).ok(),
        8 => u32::from_str_radix(s, 16).map(uuid_from_u32).ok(),
        _ => Uuid::from_str(s).ok(),
    }
    .ok_or_else(|| Error::InvalidArgument(format!("{:?} is not a valid uuid", s)))
}
