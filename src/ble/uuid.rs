//! UUID types.
//!
//! Bytes are stored little-endian, as they travel over the air. The
//! canonical text form is uppercase hex, most significant digit first,
//! without separators: `2902`, `0000FFE1`, `8EC90001F3154F609FB8838830DAEA50`.

use core::fmt;
use core::str::FromStr;

use crate::config::CCC_UUID;
use crate::error::Error;

/// Longest canonical string (128-bit).
pub const UUID_STR_LEN: usize = 32;

/// A 16-bit, 32-bit or 128-bit UUID.
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum Uuid {
    /// 16-bit UUID
    Uuid16([u8; 2]),
    /// 32-bit UUID
    Uuid32([u8; 4]),
    /// 128-bit UUID
    Uuid128([u8; 16]),
}

impl From<u16> for Uuid {
    fn from(data: u16) -> Self {
        Uuid::Uuid16(data.to_le_bytes())
    }
}

impl From<u32> for Uuid {
    fn from(data: u32) -> Self {
        Uuid::Uuid32(data.to_le_bytes())
    }
}

impl From<u128> for Uuid {
    fn from(data: u128) -> Self {
        Uuid::Uuid128(data.to_le_bytes())
    }
}

impl Uuid {
    /// Create a new 16-bit UUID.
    pub const fn new_short(val: u16) -> Self {
        Self::Uuid16(val.to_le_bytes())
    }

    /// Create a new 128-bit UUID from its little-endian bytes.
    pub const fn new_long(val: [u8; 16]) -> Self {
        Self::Uuid128(val)
    }

    /// Client Characteristic Configuration descriptor.
    pub const fn ccc() -> Self {
        Self::new_short(CCC_UUID)
    }

    pub fn is_ccc(&self) -> bool {
        *self == Self::ccc()
    }

    /// Little-endian bytes.
    pub fn as_raw(&self) -> &[u8] {
        match self {
            Uuid::Uuid16(uuid) => uuid,
            Uuid::Uuid32(uuid) => uuid,
            Uuid::Uuid128(uuid) => uuid,
        }
    }

    /// Canonical uppercase string.
    pub fn to_str(&self) -> heapless::String<UUID_STR_LEN> {
        let mut s = heapless::String::new();
        let _ = fmt::Write::write_fmt(&mut s, format_args!("{}", self));
        s
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.as_raw().iter().rev() {
            write!(f, "{:02X}", b)?;
        }
        Ok(())
    }
}

/// Accepts 4, 8 or 32 hex digits in either case. Dashes are ignored so
/// the registered `8EC90001-F315-...` form parses as well.
impl FromStr for Uuid {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut be = [0u8; 16];
        let mut nibbles = 0usize;
        for c in s.bytes().filter(|&c| c != b'-') {
            let v = (c as char).to_digit(16).ok_or(Error::InvalidArgument)? as u8;
            if nibbles >= 32 {
                return Err(Error::InvalidArgument);
            }
            be[nibbles / 2] |= if nibbles % 2 == 0 { v << 4 } else { v };
            nibbles += 1;
        }
        let len = nibbles / 2;
        let mut le = [0u8; 16];
        for (i, b) in be[..len].iter().rev().enumerate() {
            le[i] = *b;
        }
        match nibbles {
            4 => Ok(Uuid::Uuid16([le[0], le[1]])),
            8 => Ok(Uuid::Uuid32([le[0], le[1], le[2], le[3]])),
            32 => Ok(Uuid::Uuid128(le)),
            _ => Err(Error::InvalidArgument),
        }
    }
}
