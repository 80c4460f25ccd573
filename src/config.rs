//! Application-wide constants and compile-time configuration.
//!
//! Capacities, protocol identifiers and timing parameters live here so
//! they can be tuned in one place.  Runtime knobs that tests (or a board
//! crate) may want to override are gathered in [`GatewayConfig`] and
//! [`DfuConfig`].

// BLE

/// Maximum number of peripheral records (connected or allow-listed).
pub const MAX_CONNECTIONS: usize = 8;

/// Maximum number of attribute pairs stored per connection.
pub const MAX_ATTRIBUTES: usize = 64;

/// Maximum number of concurrent notify/indicate subscriptions.
pub const SUBSCRIPTION_LIMIT: usize = 16;

/// Number of discovery attempts before the peripheral is dropped.
pub const DISCOVERY_ATTEMPTS: u8 = 2;

/// Gap between two discovery attempts (ms).
pub const DISCOVERY_RETRY_DELAY_MS: u32 = 500;

/// Maximum number of distinct devices kept from one scan pass.
pub const MAX_SCAN_RESULTS: usize = 16;

/// Maximum length of an advertised device name.
pub const MAX_NAME_LEN: usize = 32;

/// 16-bit UUID of the Client Characteristic Configuration descriptor.
pub const CCC_UUID: u16 = 0x2902;

// Notification pipeline

/// Depth of the notification queue. The oldest record is dropped when full.
pub const NOTIFICATION_QUEUE_LIMIT: usize = 10;

/// Largest payload a notification record can hold; longer ones are cut.
pub const MAX_NOTIFY_PAYLOAD: usize = 256;

/// Size of the shared uplink output buffer.
pub const MAX_BUF_SIZE: usize = 11000;

/// Longest GATT path ("SERVICE/CHARACTERISTIC/2902" with 128-bit UUIDs).
pub const MAX_PATH_LEN: usize = 72;

/// Longest error message relayed through the uplink.
pub const MAX_ERROR_MSG_LEN: usize = 64;

// DFU

/// Nordic Secure DFU control point characteristic.
pub const DFU_CONTROL_POINT_UUID: &str = "8EC90001F3154F609FB8838830DAEA50";

/// Nordic Secure DFU packet characteristic.
pub const DFU_PACKET_UUID: &str = "8EC90002F3154F609FB8838830DAEA50";

/// Largest write-without-response chunk on the packet characteristic.
pub const MAX_CHUNK_SIZE: usize = 20;

/// Minimum progress step (percent) between two job status reports.
pub const PROGRESS_UPDATE_INTERVAL: u8 = 5;

/// CRC-get attempts per page before the transfer is abandoned.
pub const DFU_CRC_ATTEMPTS: u8 = 5;

/// Settle delay before each CRC-get request (ms).
pub const DFU_CRC_SETTLE_MS: u32 = 100;

/// Bounded wait for a control point response (ms).
pub const DFU_RESPONSE_TIMEOUT_MS: u32 = 5000;

/// Depth of the control point response channel.
pub const DFU_RESPONSE_QUEUE: usize = 4;

/// Largest control point response we accept.
pub const DFU_MAX_RESPONSE_LEN: usize = 32;

/// Download restarts allowed after a socket-level error.
pub const FOTA_SOCKET_RETRIES: u8 = 2;

/// Maximum length of a download host name.
pub const MAX_HOST_LEN: usize = 64;

/// Maximum length of a download path.
pub const MAX_FILE_PATH_LEN: usize = 128;

/// Maximum length of a cloud job id.
pub const MAX_JOB_ID_LEN: usize = 40;

/// Runtime settings of the gateway core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct GatewayConfig {
    /// Discovery attempts before a peripheral is disconnected.
    pub discovery_attempts: u8,
    /// Delay between discovery attempts (ms).
    pub discovery_retry_delay_ms: u32,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            discovery_attempts: DISCOVERY_ATTEMPTS,
            discovery_retry_delay_ms: DISCOVERY_RETRY_DELAY_MS,
        }
    }
}

/// Runtime settings of the DFU transfer engine.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DfuConfig {
    /// Bounded wait for each control point response (ms).
    pub response_timeout_ms: u32,
    /// Delay before each CRC-get (ms).
    pub crc_settle_ms: u32,
    /// CRC-get attempts per page.
    pub crc_attempts: u8,
    /// Packet characteristic chunk size.
    pub chunk_size: usize,
    /// Minimum progress step between reports (percent).
    pub progress_interval: u8,
    /// Download restarts allowed after a socket-level error.
    pub socket_retries: u8,
}

impl Default for DfuConfig {
    fn default() -> Self {
        Self {
            response_timeout_ms: DFU_RESPONSE_TIMEOUT_MS,
            crc_settle_ms: DFU_CRC_SETTLE_MS,
            crc_attempts: DFU_CRC_ATTEMPTS,
            chunk_size: MAX_CHUNK_SIZE,
            progress_interval: PROGRESS_UPDATE_INTERVAL,
            socket_retries: FOTA_SOCKET_RETRIES,
        }
    }
}
