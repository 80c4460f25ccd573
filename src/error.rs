//! Unified error type for the gateway core.
//!
//! We avoid `alloc` - all error variants carry only fixed-size data.
//! Implements `defmt::Format` (behind the `defmt` feature) for efficient
//! on-target logging.

/// Top-level error type used across the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Error {
    // Lookups
    /// A lookup by address, link, handle or UUID missed.
    NotFound(Lookup),

    /// The handle is already present in the attribute table.
    Duplicate,

    // Concurrency
    /// A single-flight operation (discovery, DFU job) is already running.
    Busy,

    /// A bounded wait expired.
    Timeout,

    // Protocol
    /// A DFU response was malformed or reported a failure.
    Protocol(ProtocolError),

    // Resources
    /// A fixed-capacity table or buffer is full.
    ResourceExhausted,

    /// An argument was rejected before any I/O happened.
    InvalidArgument,

    // Collaborators
    /// The radio stack, download client or publisher failed.
    Transport(TransportError),

    /// The uplink encoder could not serialise a message.
    Encode,
}

/// What a failed lookup was looking for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Lookup {
    Address,
    Link,
    Handle,
    Uuid,
    Slot,
}

/// DFU response failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ProtocolError {
    /// Shorter than the three byte header or the opcode's payload.
    ShortPacket,
    /// First byte was not the response magic (0x60).
    BadMagic(u8),
    /// Opcode not known to the parser.
    UnknownOpcode(u8),
    /// Response to a different request than the one outstanding.
    UnexpectedOpcode { expected: u8, got: u8 },
    /// Target answered with a non-success result code.
    Result(u8),
    /// Offset reported by the target differs from the bytes sent.
    OffsetMismatch { expected: u32, got: u32 },
    /// CRC reported by the target differs from the running CRC.
    CrcMismatch { expected: u32, got: u32 },
    /// Select reported a maximum object size of zero.
    ZeroObjectSize,
}

/// Collaborator failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum TransportError {
    /// Raw error code from the radio stack.
    Radio(i32),
    /// Peer is not connected.
    NotConnected,
    /// Download socket was reset by the server.
    ConnectionReset,
    /// Any other download client failure.
    Download(i32),
    /// The cloud publisher rejected the message.
    Publish,
}

// Convenience conversions

impl From<ProtocolError> for Error {
    fn from(e: ProtocolError) -> Self {
        Error::Protocol(e)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

impl From<Lookup> for Error {
    fn from(l: Lookup) -> Self {
        Error::NotFound(l)
    }
}
