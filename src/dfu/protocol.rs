//! Nordic Secure DFU control point wire format.
//!
//! Commands are written to the control point characteristic; every
//! command is answered by one notification:
//!
//! ```text
//! [0x60, opcode, result, payload...]
//! ```
//!
//! All multi-byte fields are little-endian.

use heapless::Vec;

use crate::config::DFU_MAX_RESPONSE_LEN;
use crate::error::{Error, ProtocolError};

/// Raw control point notification.
pub type ResponseBuf = Vec<u8, DFU_MAX_RESPONSE_LEN>;

/// First byte of every response.
pub const RESPONSE_MAGIC: u8 = 0x60;

/// Longest encoded command (Create: opcode, type, u32 size).
pub const MAX_COMMAND_LEN: usize = 6;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum Opcode {
    Create = 0x01,
    SetPrn = 0x02,
    CrcGet = 0x03,
    Execute = 0x04,
    Select = 0x06,
    HwVersion = 0x0A,
    FwVersion = 0x0B,
    Abort = 0x0C,
}

impl TryFrom<u8> for Opcode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Opcode::Create,
            0x02 => Opcode::SetPrn,
            0x03 => Opcode::CrcGet,
            0x04 => Opcode::Execute,
            0x06 => Opcode::Select,
            0x0A => Opcode::HwVersion,
            0x0B => Opcode::FwVersion,
            // Abort is fire-and-forget; a response to it is not expected.
            other => return Err(ProtocolError::UnknownOpcode(other)),
        })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ObjectType {
    /// Init packet (`.dat`).
    Command = 0x01,
    /// Firmware image (`.bin`).
    Data = 0x02,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum FirmwareType {
    SoftDevice = 0x00,
    Application = 0x01,
    Bootloader = 0x02,
}

/// Result byte of a response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ResultCode {
    Invalid = 0x00,
    Success = 0x01,
    OpCodeNotSupported = 0x02,
    InvalidParameter = 0x03,
    InsufficientResources = 0x04,
    InvalidObject = 0x05,
    UnsupportedType = 0x07,
    OperationNotPermitted = 0x08,
    OperationFailed = 0x0A,
    ExtendedError = 0x0B,
}

impl ResultCode {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0x00 => ResultCode::Invalid,
            0x01 => ResultCode::Success,
            0x02 => ResultCode::OpCodeNotSupported,
            0x03 => ResultCode::InvalidParameter,
            0x04 => ResultCode::InsufficientResources,
            0x05 => ResultCode::InvalidObject,
            0x07 => ResultCode::UnsupportedType,
            0x08 => ResultCode::OperationNotPermitted,
            0x0A => ResultCode::OperationFailed,
            0x0B => ResultCode::ExtendedError,
            _ => return None,
        })
    }
}

/// Control point request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Command {
    Create { object: ObjectType, size: u32 },
    /// Packet receipt notification interval; 0 disables receipts.
    SetPrn(u16),
    CrcGet,
    Execute,
    Select(ObjectType),
    HwVersion,
    FwVersion(FirmwareType),
    Abort,
}

impl Command {
    pub fn opcode(&self) -> Opcode {
        match self {
            Command::Create { .. } => Opcode::Create,
            Command::SetPrn(_) => Opcode::SetPrn,
            Command::CrcGet => Opcode::CrcGet,
            Command::Execute => Opcode::Execute,
            Command::Select(_) => Opcode::Select,
            Command::HwVersion => Opcode::HwVersion,
            Command::FwVersion(_) => Opcode::FwVersion,
            Command::Abort => Opcode::Abort,
        }
    }

    pub fn encode(&self) -> Vec<u8, MAX_COMMAND_LEN> {
        let mut buf = Vec::new();
        // Every command fits in MAX_COMMAND_LEN.
        let _ = buf.push(self.opcode() as u8);
        match *self {
            Command::Create { object, size } => {
                let _ = buf.push(object as u8);
                let _ = buf.extend_from_slice(&size.to_le_bytes());
            }
            Command::SetPrn(rate) => {
                let _ = buf.extend_from_slice(&rate.to_le_bytes());
            }
            Command::Select(object) => {
                let _ = buf.push(object as u8);
            }
            Command::FwVersion(kind) => {
                let _ = buf.push(kind as u8);
            }
            Command::CrcGet | Command::Execute | Command::HwVersion | Command::Abort => {}
        }
        buf
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SelectResponse {
    pub max_size: u32,
    pub offset: u32,
    pub crc: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct CrcResponse {
    pub offset: u32,
    pub crc: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct HwVersionResponse {
    pub part: u32,
    pub variant: u32,
    pub rom_size: u32,
    pub ram_size: u32,
    pub rom_page_size: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct FwVersionResponse {
    pub kind: u8,
    pub version: u32,
    pub addr: u32,
    pub len: u32,
}

/// Parsed successful response.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Response {
    Create,
    SetPrn,
    CrcGet(CrcResponse),
    Execute,
    Select(SelectResponse),
    HwVersion(HwVersionResponse),
    FwVersion(FwVersionResponse),
}

impl Response {
    pub fn opcode(&self) -> Opcode {
        match self {
            Response::Create => Opcode::Create,
            Response::SetPrn => Opcode::SetPrn,
            Response::CrcGet(_) => Opcode::CrcGet,
            Response::Execute => Opcode::Execute,
            Response::Select(_) => Opcode::Select,
            Response::HwVersion(_) => Opcode::HwVersion,
            Response::FwVersion(_) => Opcode::FwVersion,
        }
    }

    /// Parse one control point notification.
    ///
    /// Non-success result codes are reported as
    /// [`ProtocolError::Result`] before any payload is looked at.
    pub fn parse(data: &[u8]) -> Result<Self, Error> {
        let [magic, opcode, result, payload @ ..] = data else {
            return Err(ProtocolError::ShortPacket.into());
        };
        if *magic != RESPONSE_MAGIC {
            return Err(ProtocolError::BadMagic(*magic).into());
        }
        let opcode = Opcode::try_from(*opcode)?;
        if *result != ResultCode::Success as u8 {
            return Err(ProtocolError::Result(*result).into());
        }

        let mut r = Reader::new(payload);
        let response = match opcode {
            Opcode::Create => Response::Create,
            Opcode::SetPrn => Response::SetPrn,
            Opcode::Execute => Response::Execute,
            Opcode::CrcGet => Response::CrcGet(CrcResponse {
                offset: r.u32()?,
                crc: r.u32()?,
            }),
            Opcode::Select => Response::Select(SelectResponse {
                max_size: r.u32()?,
                offset: r.u32()?,
                crc: r.u32()?,
            }),
            Opcode::HwVersion => Response::HwVersion(HwVersionResponse {
                part: r.u32()?,
                variant: r.u32()?,
                rom_size: r.u32()?,
                ram_size: r.u32()?,
                rom_page_size: r.u32()?,
            }),
            Opcode::FwVersion => Response::FwVersion(FwVersionResponse {
                kind: r.u8()?,
                version: r.u32()?,
                addr: r.u32()?,
                len: r.u32()?,
            }),
            Opcode::Abort => return Err(ProtocolError::UnknownOpcode(Opcode::Abort as u8).into()),
        };
        Ok(response)
    }
}

impl From<ProtocolError> for ResultCode {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::Result(code) => ResultCode::from_u8(code).unwrap_or(ResultCode::Invalid),
            _ => ResultCode::Invalid,
        }
    }
}

/// Little-endian cursor over a response payload.
struct Reader<'a> {
    data: &'a [u8],
}

impl<'a> Reader<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    fn take<const N: usize>(&mut self) -> Result<[u8; N], ProtocolError> {
        if self.data.len() < N {
            return Err(ProtocolError::ShortPacket);
        }
        let (head, rest) = self.data.split_at(N);
        self.data = rest;
        let mut out = [0u8; N];
        out.copy_from_slice(head);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8, ProtocolError> {
        Ok(self.take::<1>()?[0])
    }

    fn u32(&mut self) -> Result<u32, ProtocolError> {
        Ok(u32::from_le_bytes(self.take()?))
    }
}
