//! Notification pipeline.
//!
//! The radio stack hands read results and notifications to the producer
//! side from its own callback context. Producers never wait: when the
//! queue is full the oldest record is evicted to make room. A single
//! worker drains the queue (see [`Gateway::run_notification_worker`]).
//!
//! [`Gateway::run_notification_worker`]: crate::gateway::Gateway::run_notification_worker

use core::sync::atomic::{AtomicU32, Ordering};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::channel::{Channel, TrySendError};
use heapless::Vec;

use crate::ble::address::Address;
use crate::config::{MAX_NOTIFY_PAYLOAD, NOTIFICATION_QUEUE_LIMIT};

/// One pending read result or notification.
#[derive(Clone, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NotificationRecord {
    pub address: Address,
    /// Handle that was read, or value handle of the notification.
    pub handle: u16,
    pub is_read: bool,
    pub payload: Vec<u8, MAX_NOTIFY_PAYLOAD>,
}

impl NotificationRecord {
    /// Payloads longer than [`MAX_NOTIFY_PAYLOAD`] are cut.
    pub fn new(address: Address, handle: u16, is_read: bool, data: &[u8]) -> Self {
        let len = data.len().min(MAX_NOTIFY_PAYLOAD);
        if len < data.len() {
            warn!("truncating {} byte payload from {}", data.len(), address);
        }
        let mut payload = Vec::new();
        // Cannot fail, `len` is bounded by the capacity.
        let _ = payload.extend_from_slice(&data[..len]);
        Self {
            address,
            handle,
            is_read,
            payload,
        }
    }
}

/// Tells the radio stack whether to keep delivering for this request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Iteration {
    Continue,
    Stop,
}

pub struct NotificationQueue<M: RawMutex> {
    records: Channel<M, NotificationRecord, NOTIFICATION_QUEUE_LIMIT>,
    dropped: AtomicU32,
}

impl<M: RawMutex> Default for NotificationQueue<M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex> NotificationQueue<M> {
    pub const fn new() -> Self {
        Self {
            records: Channel::new(),
            dropped: AtomicU32::new(0),
        }
    }

    /// Producer: a read completed. Empty results carry nothing to report.
    pub fn on_read_result(&self, address: Address, handle: u16, data: &[u8]) -> Iteration {
        if data.is_empty() {
            return Iteration::Continue;
        }
        info!("Read {} handle {}", address, handle);
        self.push(NotificationRecord::new(address, handle, true, data))
    }

    /// Producer: a notification or indication arrived. `None` means the
    /// stack tore the subscription down.
    pub fn on_notification(&self, address: Address, value_handle: u16, data: Option<&[u8]>) -> Iteration {
        let Some(data) = data else {
            return Iteration::Stop;
        };
        if data.is_empty() {
            return Iteration::Continue;
        }
        self.push(NotificationRecord::new(address, value_handle, false, data))
    }

    fn push(&self, record: NotificationRecord) -> Iteration {
        let record = match self.records.try_send(record) {
            Ok(()) => return Iteration::Continue,
            Err(TrySendError::Full(record)) => record,
        };

        if let Ok(oldest) = self.records.try_receive() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            info!(
                "Dropping oldest message: addr {} handle {} queued {}",
                oldest.address,
                oldest.handle,
                self.records.len()
            );
        }
        match self.records.try_send(record) {
            Ok(()) => Iteration::Continue,
            Err(_) => {
                error!("Notification queue stuck full, {} queued", self.records.len());
                Iteration::Stop
            }
        }
    }

    /// Consumer: wait for the next record.
    pub async fn receive(&self) -> NotificationRecord {
        self.records.receive().await
    }

    pub fn try_receive(&self) -> Option<NotificationRecord> {
        self.records.try_receive().ok()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Records evicted by drop-oldest since start-up.
    pub fn dropped(&self) -> u32 {
        self.dropped.load(Ordering::Relaxed)
    }
}
