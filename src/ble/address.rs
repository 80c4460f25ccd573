//! Peripheral address in the canonical `AA:BB:CC:DD:EE:FF` form.

use core::fmt;
use core::str::FromStr;

use crate::error::Error;

/// Length of the canonical string form.
pub const ADDRESS_STR_LEN: usize = 17;

/// 48-bit device address, most significant byte first (display order).
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Address(pub [u8; 6]);

impl Address {
    pub const fn new(bytes: [u8; 6]) -> Self {
        Self(bytes)
    }

    /// Build from the little-endian byte order radio stacks report.
    pub fn from_le_bytes(raw: [u8; 6]) -> Self {
        let mut bytes = raw;
        bytes.reverse();
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 6] {
        &self.0
    }

    /// Canonical uppercase string.
    pub fn to_str(&self) -> heapless::String<ADDRESS_STR_LEN> {
        let mut s = heapless::String::new();
        // 17 characters always fit.
        let _ = fmt::Write::write_fmt(&mut s, format_args!("{}", self));
        s
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let b = &self.0;
        write!(
            f,
            "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
            b[0], b[1], b[2], b[3], b[4], b[5]
        )
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Address {
    fn format(&self, f: defmt::Formatter) {
        let b = &self.0;
        defmt::write!(
            f,
            "{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}:{=u8:02X}",
            b[0],
            b[1],
            b[2],
            b[3],
            b[4],
            b[5]
        )
    }
}

/// Parses `aa:bb:cc:dd:ee:ff` in either case.
impl FromStr for Address {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() != ADDRESS_STR_LEN {
            return Err(Error::InvalidArgument);
        }
        let mut bytes = [0u8; 6];
        let mut parts = s.split(':');
        for byte in bytes.iter_mut() {
            let part = parts.next().ok_or(Error::InvalidArgument)?;
            if part.len() != 2 || !part.bytes().all(|c| c.is_ascii_hexdigit()) {
                return Err(Error::InvalidArgument);
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| Error::InvalidArgument)?;
        }
        if parts.next().is_some() {
            return Err(Error::InvalidArgument);
        }
        Ok(Self(bytes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_is_case_insensitive() {
        let lower: Address = "c0:ff:ee:0a:1b:2c".parse().unwrap();
        let upper: Address = "C0:FF:EE:0A:1B:2C".parse().unwrap();
        assert_eq!(lower, upper);
        assert_eq!(lower.to_str().as_str(), "C0:FF:EE:0A:1B:2C");
    }

    #[test]
    fn rejects_malformed() {
        assert!("C0:FF:EE:0A:1B".parse::<Address>().is_err());
        assert!("C0-FF-EE-0A-1B-2C".parse::<Address>().is_err());
        assert!("C0:FF:EE:0A:1B:ZZ".parse::<Address>().is_err());
    }

    #[test]
    fn le_bytes_are_reversed() {
        let a = Address::from_le_bytes([0x2C, 0x1B, 0x0A, 0xEE, 0xFF, 0xC0]);
        assert_eq!(a.to_str().as_str(), "C0:FF:EE:0A:1B:2C");
    }
}
