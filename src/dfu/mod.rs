//! Peripheral firmware update over Nordic Secure DFU.
//!
//! A cloud job names a connected peripheral and one or two images to
//! download. [`DfuService`] owns the job: it starts the download, feeds
//! each fragment through the [`engine`] and reports status to the
//! [`JobTracker`]. The peripheral is reached through a [`DfuTransport`],
//! normally the gateway's [`GatewayDfuLink`](crate::gateway::dfu_link::GatewayDfuLink).

pub mod engine;
pub mod progress;
pub mod protocol;
pub mod service;

use heapless::String;

use crate::ble::address::Address;
use crate::config::{MAX_FILE_PATH_LEN, MAX_HOST_LEN, MAX_JOB_ID_LEN};
use crate::error::{Error, TransportError};

use self::protocol::ResponseBuf;

pub use self::engine::{DfuState, Transfer};
pub use self::service::{DfuLock, DfuService};

/// Control point and packet characteristic access for one target.
pub trait DfuTransport {
    fn is_connected(&self, target: &Address) -> bool;

    /// Route control point notifications of `target` to [`response`](Self::response)
    /// and enable them on the peer.
    async fn open(&self, target: &Address) -> Result<(), Error>;

    /// Stop routing control point notifications.
    fn close(&self);

    /// Drop control point notifications that are already waiting.
    fn discard_responses(&self);

    /// Write with response to the control point.
    async fn write_control(&self, target: &Address, data: &[u8]) -> Result<(), Error>;

    /// Write without response to the packet characteristic.
    async fn write_packet(&self, target: &Address, data: &[u8]) -> Result<(), Error>;

    /// Next control point notification.
    async fn response(&self) -> ResponseBuf;

    /// Drop the cached attribute table; new firmware may change it.
    async fn rediscover(&self, target: &Address) -> Result<(), Error>;
}

/// One downloadable image.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ImageInfo {
    pub path: String<MAX_FILE_PATH_LEN>,
    pub size: usize,
}

impl ImageInfo {
    pub fn new(path: &str, size: usize) -> Result<Self, Error> {
        Ok(Self {
            path: String::try_from(path).map_err(|_| Error::InvalidArgument)?,
            size,
        })
    }

    /// Init packets (`*.dat`) go into command objects.
    pub fn is_init_packet(&self) -> bool {
        self.path.contains("dat")
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DfuJob {
    pub id: String<MAX_JOB_ID_LEN>,
    pub target: Address,
    pub host: String<MAX_HOST_LEN>,
    pub image: ImageInfo,
    /// Image sent after `image` completes, typically the firmware after
    /// its init packet.
    pub secondary: Option<ImageInfo>,
}

impl DfuJob {
    pub fn new(id: &str, target: Address, host: &str, image: ImageInfo) -> Result<Self, Error> {
        Ok(Self {
            id: String::try_from(id).map_err(|_| Error::InvalidArgument)?,
            target,
            host: String::try_from(host).map_err(|_| Error::InvalidArgument)?,
            image,
            secondary: None,
        })
    }

    pub fn with_secondary(mut self, image: ImageInfo) -> Self {
        self.secondary = Some(image);
        self
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JobStatus {
    InProgress,
    Downloading,
    Succeeded,
    Failed,
}

/// Failure classification reported with [`JobStatus::Failed`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum JobError {
    None,
    Download,
    Timeout,
    Protocol,
    Transport,
    NotConnected,
    Apply,
}

impl From<&Error> for JobError {
    fn from(e: &Error) -> Self {
        match e {
            Error::Timeout => JobError::Timeout,
            Error::Protocol(_) => JobError::Protocol,
            Error::NotFound(_) | Error::Transport(TransportError::NotConnected) => JobError::NotConnected,
            Error::Transport(TransportError::Download(_) | TransportError::ConnectionReset) => JobError::Download,
            Error::Transport(_) => JobError::Transport,
            _ => JobError::Apply,
        }
    }
}

/// Cloud-side job bookkeeping.
pub trait JobTracker {
    async fn update(&mut self, job: &DfuJob, status: JobStatus, progress: u8, error: JobError) -> Result<(), Error>;
}

/// HTTP(S) download client.
pub trait Downloader {
    async fn start(&mut self, host: &str, path: &str) -> Result<(), Error>;

    fn stop(&mut self);
}

/// Download client output, fed to [`DfuService::handle`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DfuEvent<'a> {
    Fragment(&'a [u8]),
    DownloadDone,
    DownloadError(Error),
}

/// What the download client should do after an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DownloadAction {
    Continue,
    /// Reconnect and resume from the current offset.
    Retry,
    Stop,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Lookup, ProtocolError};

    #[test]
    fn init_packet_by_path() {
        assert!(ImageInfo::new("fw/app.dat", 141).unwrap().is_init_packet());
        assert!(!ImageInfo::new("fw/app.bin", 4096).unwrap().is_init_packet());
    }

    #[test]
    fn job_error_classification() {
        assert_eq!(JobError::from(&Error::Timeout), JobError::Timeout);
        assert_eq!(
            JobError::from(&Error::Protocol(ProtocolError::CrcMismatch { expected: 1, got: 2 })),
            JobError::Protocol
        );
        assert_eq!(JobError::from(&Error::NotFound(Lookup::Address)), JobError::NotConnected);
        assert_eq!(
            JobError::from(&Error::Transport(TransportError::ConnectionReset)),
            JobError::Download
        );
        assert_eq!(JobError::from(&Error::Transport(TransportError::Radio(-5))), JobError::Transport);
    }
}
