//! Interface to the radio stack.
//!
//! The gateway drives a BLE central through this trait. Results that
//! arrive later (read values, notifications, discovered attributes,
//! connection events) come back through the gateway's callback methods
//! and the [`NotificationQueue`](crate::gateway::pipeline::NotificationQueue).

use crate::ble::address::Address;
use crate::ble::subscription::SubscriptionSlot;
use crate::ble::LinkHandle;
use crate::error::Error;

/// HCI disconnect reason.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DisconnectReason(pub u8);

impl DisconnectReason {
    /// "Remote user terminated connection", used for intentional drops.
    pub const REMOTE_USER_TERMINATED: Self = Self(0x13);
    pub const CONNECTION_TIMEOUT: Self = Self(0x08);

    pub fn is_user_terminated(self) -> bool {
        self == Self::REMOTE_USER_TERMINATED
    }
}

pub trait Radio {
    /// Issue a read; the value arrives via the notification queue.
    async fn read(&self, link: LinkHandle, handle: u16) -> Result<(), Error>;

    async fn write(&self, link: LinkHandle, handle: u16, data: &[u8]) -> Result<(), Error>;

    async fn write_without_response(
        &self,
        link: LinkHandle,
        handle: u16,
        data: &[u8],
    ) -> Result<(), Error>;

    /// Write the slot's CCC value and start routing its notifications.
    async fn subscribe(&self, link: LinkHandle, slot: &SubscriptionSlot) -> Result<(), Error>;

    async fn unsubscribe(&self, link: LinkHandle, slot: &SubscriptionSlot) -> Result<(), Error>;

    /// Start a full attribute discovery; results arrive via the gateway's
    /// discovery callbacks.
    async fn start_discovery(&self, link: LinkHandle) -> Result<(), Error>;

    async fn disconnect(&self, link: LinkHandle, reason: DisconnectReason) -> Result<(), Error>;

    async fn allowlist_add(&self, address: &Address) -> Result<(), Error>;

    async fn allowlist_remove(&self, address: &Address) -> Result<(), Error>;

    async fn allowlist_clear(&self) -> Result<(), Error>;

    async fn start_scan(&self) -> Result<(), Error>;

    async fn stop_scan(&self) -> Result<(), Error>;
}
