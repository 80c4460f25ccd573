//! The gateway core.
//!
//! [`Gateway`] ties the connection table, the subscription registry, the
//! notification pipeline and the uplink together. Radio-stack events come
//! in through the `on_*` methods, cloud requests through the plain
//! methods (`read`, `write`, `subscribe`, ...), and one long-lived task
//! runs [`Gateway::run_notification_worker`].
//!
//! Mutable state sits behind blocking mutexes that are never held across
//! an `.await`.

pub mod dfu_link;
pub mod pipeline;
pub mod uplink;

use core::cell::{Cell, RefCell};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;
use embassy_sync::channel::Channel;
use embedded_hal_async::delay::DelayNs;
use heapless::Vec;

use crate::ble::address::Address;
use crate::ble::attribute::{AttributeKind, AttributeTable, Path, Properties};
use crate::ble::connection::{ConnId, ConnectionTable, ScanRequest};
use crate::ble::radio::{DisconnectReason, Radio};
use crate::ble::scanner::{AdvKind, ScanResults};
use crate::ble::subscription::{SubscriptionRegistry, SubscriptionSlot, ValueType};
use crate::ble::uuid::Uuid;
use crate::ble::{DiscoveredAttribute, LinkHandle};
use crate::config::{
    GatewayConfig, DFU_MAX_RESPONSE_LEN, DFU_RESPONSE_QUEUE, MAX_ATTRIBUTES, MAX_CONNECTIONS,
    MAX_ERROR_MSG_LEN, SUBSCRIPTION_LIMIT,
};
use crate::dfu::protocol::ResponseBuf;
use crate::error::{Error, TransportError};

use self::pipeline::{NotificationQueue, NotificationRecord};
use self::uplink::{Encoder, Message, Publisher, Uplink};

/// Notifications from `address` on `uuid` are diverted away from the
/// uplink and into the gateway's response channel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct NotifyFilter {
    pub address: Address,
    pub uuid: Uuid,
}

/// The CCC descriptor directly follows the characteristic value.
fn ccc_handle(value_handle: u16) -> Result<u16, Error> {
    value_handle.checked_add(1).ok_or(Error::InvalidArgument)
}

/// Snapshot of what the worker needs to publish one record.
struct Resolved {
    uuid: Uuid,
    path: Path,
    ccc: bool,
    hidden: bool,
}

pub struct Gateway<'q, M, R, E, P, D>
where
    M: RawMutex,
    R: Radio,
    E: Encoder,
    P: Publisher,
    D: DelayNs + Clone,
{
    radio: R,
    queue: &'q NotificationQueue<M>,
    uplink: Uplink<M, E, P>,
    delay: D,
    config: GatewayConfig,
    conns: Mutex<M, RefCell<ConnectionTable>>,
    subs: Mutex<M, RefCell<SubscriptionRegistry>>,
    scan: Mutex<M, RefCell<ScanResults>>,
    notify_filter: Mutex<M, Cell<Option<NotifyFilter>>>,
    filtered: Channel<M, ResponseBuf, DFU_RESPONSE_QUEUE>,
}

impl<'q, M, R, E, P, D> Gateway<'q, M, R, E, P, D>
where
    M: RawMutex,
    R: Radio,
    E: Encoder,
    P: Publisher,
    D: DelayNs + Clone,
{
    pub fn new(
        radio: R,
        queue: &'q NotificationQueue<M>,
        encoder: E,
        publisher: P,
        delay: D,
        config: GatewayConfig,
    ) -> Self {
        Self {
            radio,
            queue,
            uplink: Uplink::new(encoder, publisher),
            delay,
            config,
            conns: Mutex::new(RefCell::new(ConnectionTable::new())),
            subs: Mutex::new(RefCell::new(SubscriptionRegistry::new())),
            scan: Mutex::new(RefCell::new(ScanResults::new())),
            notify_filter: Mutex::new(Cell::new(None)),
            filtered: Channel::new(),
        }
    }

    pub fn radio(&self) -> &R {
        &self.radio
    }

    pub fn uplink(&self) -> &Uplink<M, E, P> {
        &self.uplink
    }

    pub fn queue(&self) -> &NotificationQueue<M> {
        self.queue
    }

    /// Run `f` with the connection table locked.
    pub fn with_connections<T>(&self, f: impl FnOnce(&mut ConnectionTable) -> T) -> T {
        self.conns.lock(|c| f(&mut c.borrow_mut()))
    }

    fn with_subscriptions<T>(&self, f: impl FnOnce(&mut SubscriptionRegistry) -> T) -> T {
        self.subs.lock(|s| f(&mut s.borrow_mut()))
    }

    pub fn subscription_count(&self) -> usize {
        self.with_subscriptions(|s| s.current())
    }

    fn lookup(&self, address: &Address) -> Result<ConnId, Error> {
        self.with_connections(|t| t.lookup_by_address(address))
    }

    fn is_hidden(&self, id: ConnId) -> bool {
        self.with_connections(|t| t.get(id).map(|r| r.hidden).unwrap_or(false))
    }

    /// Link of a connected record.
    fn link(&self, id: ConnId) -> Result<LinkHandle, Error> {
        self.with_connections(|t| {
            let record = t.get(id)?;
            match (record.connected, record.link) {
                (true, Some(link)) => Ok(link),
                _ => Err(Error::Transport(TransportError::NotConnected)),
            }
        })
    }

    async fn send(&self, message: &Message<'_>) {
        if let Err(e) = self.uplink.send(message).await {
            error!("Unable to send: {:?}", e);
        }
    }

    // Desired devices

    /// Start tracking `address`. Hidden devices are managed without any
    /// cloud-visible output.
    pub fn add_device(&self, address: Address, hidden: bool) -> Result<(), Error> {
        self.with_connections(|t| t.add_device(address, hidden))
            .map(|_| ())
    }

    /// Stop tracking `address`, dropping its link and subscriptions.
    pub async fn remove_device(&self, address: &Address) -> Result<(), Error> {
        let id = self.lookup(address)?;
        if self.link(id).is_ok() {
            if let Err(e) = self.disconnect_device(address).await {
                warn!("Error disconnecting {}: {:?}", address, e);
            }
        }
        let record = self.with_connections(|t| t.remove_device(address))?;
        if record.added_to_allowlist {
            if let Err(e) = self.radio.allowlist_remove(address).await {
                warn!("Error removing {} from allowlist: {:?}", address, e);
            }
        }
        Ok(())
    }

    pub fn is_connected(&self, address: &Address) -> bool {
        self.with_connections(|t| t.is_connected(address))
    }

    /// Update the connected flag; the shadow is published only on a real
    /// transition and never for hidden devices.
    pub async fn set_connected(&self, address: &Address, connected: bool) -> Result<bool, Error> {
        let id = self.lookup(address)?;
        self.set_connected_id(id, address, connected).await
    }

    async fn set_connected_id(&self, id: ConnId, address: &Address, connected: bool) -> Result<bool, Error> {
        let (changed, hidden) = self.with_connections(|t| {
            let changed = t.set_connected(id, connected)?;
            Ok::<_, Error>((changed, t.get(id)?.hidden))
        })?;
        if changed && !hidden {
            self.send(&Message::Shadow {
                address: *address,
                connecting: false,
                connected,
            })
            .await;
        }
        Ok(changed)
    }

    // Connection events

    /// Radio stack: a link came up (or failed to).
    pub async fn on_connected(&self, address: Address, link: LinkHandle, status: Result<(), u8>) {
        let id = self.lookup(&address).ok();

        if let Err(code) = status {
            error!("Failed to connect to {} ({})", address, code);
            if let Some(id) = id {
                let _ = self.set_connected_id(id, &address, false).await;
            }
            return;
        }

        let hidden = id.map(|id| self.is_hidden(id)).unwrap_or(false);
        if hidden {
            debug!("suppressing device_connect");
        } else {
            self.send(&Message::ConnectResult {
                address,
                connected: true,
            })
            .await;
        }

        let Some(id) = id else {
            return;
        };
        let _ = self.with_connections(|t| t.get_mut(id).map(|r| r.link = Some(link)));

        match self.set_connected_id(id, &address, true).await {
            Ok(true) => {
                info!("Connected: {}", address);
                if let Err(e) = self.subscribe_device(&address, true).await {
                    warn!("Resubscribe failed for {}: {:?}", address, e);
                }
            }
            Ok(false) => info!("Reconnected: {}", address),
            Err(e) => error!("Connect bookkeeping failed: {:?}", e),
        }

        let allowlisted = self.with_connections(|t| t.get(id).map(|r| r.added_to_allowlist).unwrap_or(false));
        if allowlisted && self.radio.allowlist_remove(&address).await.is_ok() {
            let _ = self.with_connections(|t| t.get_mut(id).map(|r| r.added_to_allowlist = false));
        }
    }

    /// Radio stack: a link went down.
    pub async fn on_disconnected(&self, address: Address, reason: DisconnectReason) {
        let id = self.lookup(&address).ok();

        if id.is_some() {
            self.send(&Message::DisconnectResult { address }).await;
        } else {
            info!("suppressing device_disconnect");
        }
        let Some(id) = id else {
            return;
        };

        if reason.is_user_terminated() {
            // Expected to come back shortly; keep the shadow untouched.
            info!("Disconnected: temporary");
            let _ = self.with_connections(|t| t.get_mut(id).map(|r| r.link = None));
        } else {
            info!("Disconnected: {} (reason {})", address, reason.0);
            if let Err(e) = self.set_connected_id(id, &address, false).await {
                error!("Disconnect bookkeeping failed: {:?}", e);
            }
        }

        let allowlisted = self.with_connections(|t| t.get(id).map(|r| r.added_to_allowlist).unwrap_or(true));
        if !allowlisted && self.radio.allowlist_add(&address).await.is_ok() {
            let _ = self.with_connections(|t| t.get_mut(id).map(|r| r.added_to_allowlist = true));
        }
    }

    /// Drop all subscriptions of `address` and disconnect it on purpose.
    pub async fn disconnect_device(&self, address: &Address) -> Result<(), Error> {
        let id = self.lookup(address)?;
        let link = self.link(id)?;
        if let Err(e) = self.subscribe_device(address, false).await {
            error!("Error unsubscribing device: {:?}", e);
        }
        self.radio
            .disconnect(link, DisconnectReason::REMOTE_USER_TERMINATED)
            .await
    }

    // Discovery

    /// Discover the attribute table of `address`.
    ///
    /// Only one discovery runs at a time; a second request gets
    /// [`Error::Busy`]. Devices already discovered (or holding a cached
    /// table) are reported without radio traffic.
    pub async fn discover(&self, address: &Address) -> Result<(), Error> {
        let id = self.lookup(address)?;
        let link = self.link(id)?;

        let start = self.with_connections(|t| {
            if t.discovery_in_progress() {
                return Err(Error::Busy);
            }
            let record = t.get_mut(id)?;
            if record.discovered {
                record.encode_discovered = true;
                return Ok(false);
            }
            if !record.attributes.is_empty() {
                info!("Marking device as discovered; num pairs = {}", record.attributes.len());
                record.discovering = false;
                record.discovered = true;
                record.encode_discovered = true;
                return Ok(false);
            }
            t.begin_discovery(id)?;
            Ok(true)
        })?;

        if !start {
            self.send_discovery(id).await;
            return Ok(());
        }

        info!("Discovering: {}", address);
        let mut result = Ok(());
        for attempt in 1..=self.config.discovery_attempts {
            if attempt > 1 {
                info!("Retrying...");
                self.delay.clone().delay_ms(self.config.discovery_retry_delay_ms).await;
            }
            result = self.radio.start_discovery(link).await;
            match result {
                Ok(()) => return Ok(()),
                Err(e) => warn!("Service discovery err {:?}", e),
            }
        }

        error!("Aborting discovery. Disconnecting from device...");
        let scan_waiting = self.with_connections(|t| t.finish_discovery());
        if let Err(e) = self
            .radio
            .disconnect(link, DisconnectReason::REMOTE_USER_TERMINATED)
            .await
        {
            warn!("Error disconnecting: {:?}", e);
        }
        let _ = self.set_connected_id(id, address, false).await;
        if scan_waiting {
            self.start_scan().await?;
        }
        result
    }

    /// Radio stack: one attribute found during discovery.
    pub fn on_attribute_discovered(&self, address: &Address, attribute: DiscoveredAttribute) -> Result<(), Error> {
        let result = self.with_connections(|t| {
            let id = t.lookup_by_address(address)?;
            t.add_attribute(
                id,
                attribute.uuid,
                attribute.handle,
                attribute.kind,
                attribute.properties,
            )
        });
        if let Err(e) = result {
            error!("Unable to add attribute: {:?}", e);
        }
        result
    }

    /// Radio stack: discovery walked the whole database.
    pub async fn on_discovery_complete(&self, address: &Address) {
        let (id, scan_waiting) = self.with_connections(|t| {
            let mut report = None;
            match t.lookup_by_address(address) {
                Ok(id) => {
                    if let Ok(record) = t.get_mut(id) {
                        if record.connected && !record.attributes.is_empty() {
                            record.encode_discovered = true;
                            record.discovered = true;
                            report = Some(id);
                        } else {
                            warn!("Discovery not completed");
                        }
                    }
                }
                Err(_) => error!("Connection not found for addr {}", address),
            }
            (report, t.finish_discovery())
        });

        if let Some(id) = id {
            self.send_discovery(id).await;
        }
        if scan_waiting {
            if let Err(e) = self.start_scan().await {
                error!("Deferred scan failed: {:?}", e);
            }
        }
    }

    /// Radio stack: discovery failed part way.
    pub async fn on_discovery_failed(&self, address: &Address, code: i32) {
        error!("The discovery procedure failed for {}: err {}", address, code);
        let (link, scan_waiting) = self.with_connections(|t| {
            let link = t.lookup_by_address(address).ok().and_then(|id| {
                let _ = t.clear_attributes(id);
                t.get(id).ok().and_then(|r| r.link)
            });
            (link, t.finish_discovery())
        });
        if let Some(link) = link {
            if let Err(e) = self
                .radio
                .disconnect(link, DisconnectReason::REMOTE_USER_TERMINATED)
                .await
            {
                warn!("Error disconnecting: {:?}", e);
            }
        }
        if scan_waiting {
            if let Err(e) = self.start_scan().await {
                error!("Deferred scan failed: {:?}", e);
            }
        }
    }

    /// Throw away the cached attribute table (firmware updates may change
    /// the GATT layout) and discover again if the device is connected.
    pub async fn force_rediscover(&self, address: &Address) -> Result<(), Error> {
        let id = self.lookup(address)?;
        self.with_connections(|t| t.clear_attributes(id))?;
        if self.link(id).is_ok() {
            self.discover(address).await
        } else {
            Ok(())
        }
    }

    async fn send_discovery(&self, id: ConnId) {
        let snapshot = self.with_connections(|t| {
            let record = t.get_mut(id).ok()?;
            if !record.encode_discovered {
                return None;
            }
            record.encode_discovered = false;
            Some((record.address, record.hidden, record.attributes.clone()))
        });
        let Some((address, hidden, attributes)) = snapshot else {
            return;
        };
        if hidden {
            debug!("suppressing device_discovery_send");
            return;
        }
        info!("Sending discovery for {} ({} pairs)", address, attributes.len());
        self.send(&Message::Discovery {
            address,
            attributes: attributes.as_slice(),
        })
        .await;
    }

    // GATT operations

    /// Read a characteristic, or its CCC descriptor when `ccc` is set.
    /// The value arrives through the notification pipeline.
    pub async fn read(&self, address: &Address, uuid: &Uuid, ccc: bool) -> Result<(), Error> {
        let id = self.lookup(address)?;
        let handle = self.with_connections(|t| t.handle_by_uuid(id, uuid))?;
        let link = self.link(id)?;
        let handle = if ccc { ccc_handle(handle)? } else { handle };
        self.radio.read(link, handle).await
    }

    pub async fn write(&self, address: &Address, uuid: &Uuid, data: &[u8]) -> Result<(), Error> {
        let id = self.lookup(address)?;
        let handle = self.with_connections(|t| t.handle_by_uuid(id, uuid))?;
        let link = self.link(id)?;
        debug!("Writing {} bytes to {} handle {}", data.len(), address, handle);
        self.radio.write(link, handle, data).await
    }

    pub async fn write_without_response(&self, address: &Address, uuid: &Uuid, data: &[u8]) -> Result<(), Error> {
        let id = self.lookup(address)?;
        let handle = self.with_connections(|t| t.handle_by_uuid(id, uuid))?;
        let link = self.link(id)?;
        self.radio.write_without_response(link, handle, data).await
    }

    // Subscriptions

    /// Enable (`Notify`/`Indicate`) or disable (`None`) value updates of
    /// the characteristic `uuid`.
    ///
    /// Subscribing twice keeps the existing slot and only repeats the
    /// confirmation; unsubscribing something not subscribed does nothing.
    pub async fn subscribe(&self, address: &Address, uuid: &Uuid, value: ValueType) -> Result<(), Error> {
        let id = self.lookup(address).inspect_err(|_| {
            error!("Connection not found for addr {}", address);
        })?;
        let (handle, slot, path, hidden) = self.with_connections(|t| {
            let handle = t.handle_by_uuid(id, uuid)?;
            let (_, slot) = t.get_subscribed(id, handle)?;
            let path = t.generate_path(id, handle, true)?;
            Ok::<_, Error>((handle, slot, path, t.get(id)?.hidden))
        })?;
        let link = self.link(id).ok();

        match (slot, value) {
            (Some(index), ValueType::None) => {
                let old = self.with_subscriptions(|s| s.get(index).copied())?;
                if let Some(link) = link {
                    if let Err(e) = self.radio.unsubscribe(link, &old).await {
                        warn!("Unsubscribe failed: {:?}", e);
                    }
                }
                self.with_connections(|t| t.clear_subscribed(id, handle))?;
                self.with_subscriptions(|s| s.release(index))?;
                self.confirm_subscription(address, &path, value, hidden).await;
                info!("Unsubscribe: Addr {} Handle {}", address, handle);
            }
            (Some(_), _) => {
                self.confirm_subscription(address, &path, value, hidden).await;
                info!("Subscribe Dup: Addr {} Handle {} {:?}", address, handle, value);
            }
            (None, ValueType::None) => {
                debug!("Unsubscribe N/A: Addr {} Handle {}", address, handle);
            }
            (None, _) => {
                let ccc = ccc_handle(handle)?;
                if !self.with_subscriptions(|s| s.has_room()) {
                    return self.report_subscription_limit(address).await;
                }
                if let Some(link) = link {
                    let pending = SubscriptionSlot {
                        conn: Some(id),
                        value_handle: handle,
                        ccc_handle: ccc,
                        value,
                    };
                    self.radio.subscribe(link, &pending).await.inspect_err(|e| {
                        error!("Subscribe failed (err {:?})", e);
                    })?;
                }
                let index = match self.with_subscriptions(|s| s.allocate(id, handle, value)) {
                    Ok(index) => index,
                    Err(Error::ResourceExhausted) => return self.report_subscription_limit(address).await,
                    Err(e) => return Err(e),
                };
                self.with_connections(|t| t.set_subscribed(id, handle, index))?;
                self.confirm_subscription(address, &path, value, hidden).await;
                info!("Subscribe: Addr {} Handle {} {:?}", address, handle, value);
            }
        }
        Ok(())
    }

    async fn confirm_subscription(&self, address: &Address, path: &str, value: ValueType, hidden: bool) {
        if hidden {
            debug!("suppressing value_changed");
            return;
        }
        self.send(&Message::SubscriptionChanged {
            address: *address,
            path,
            value: value.ccc_value(),
        })
        .await;
    }

    async fn report_subscription_limit(&self, address: &Address) -> Result<(), Error> {
        let mut msg: heapless::String<MAX_ERROR_MSG_LEN> = heapless::String::new();
        let _ = core::fmt::Write::write_fmt(
            &mut msg,
            format_args!("Reached subscription limit of {}", SUBSCRIPTION_LIMIT),
        );
        warn!("{}", msg.as_str());
        self.send(&Message::DeviceError {
            address: *address,
            message: msg.as_str(),
        })
        .await;
        Err(Error::ResourceExhausted)
    }

    /// [`subscribe`](Self::subscribe) by value handle.
    pub async fn subscribe_handle(&self, address: &Address, handle: u16, value: ValueType) -> Result<(), Error> {
        let uuid = self.with_connections(|t| {
            let id = t.lookup_by_address(address)?;
            t.lookup_by_handle(id, handle)
        })?;
        debug!("Subscribing uuid {}", uuid);
        self.subscribe(address, &uuid, value).await
    }

    /// Subscribe to every characteristic that supports notifications.
    /// Stops at the first failure.
    pub async fn subscribe_all(&self, address: &Address, value: ValueType) -> Result<(), Error> {
        let handles: Vec<u16, MAX_ATTRIBUTES> = self.with_connections(|t| {
            let id = t.lookup_by_address(address)?;
            Ok::<_, Error>(
                t.get(id)?
                    .attributes
                    .iter()
                    .filter(|p| p.kind == AttributeKind::Characteristic && p.properties.contains(Properties::NOTIFY))
                    .map(|p| p.handle)
                    .collect(),
            )
        })?;
        for handle in handles {
            self.subscribe_handle(address, handle, value).await?;
        }
        Ok(())
    }

    /// Re-issue (`true`) or drop (`false`) every subscription of a device.
    pub async fn subscribe_device(&self, address: &Address, subscribe: bool) -> Result<(), Error> {
        let id = self.lookup(address)?;
        let link = self.link(id).ok();
        let slots: Vec<(u8, SubscriptionSlot), SUBSCRIPTION_LIMIT> =
            self.with_subscriptions(|s| s.slots_for(id).collect());

        let mut count = 0;
        for (index, slot) in slots {
            if subscribe && slot.value != ValueType::None {
                if let Some(link) = link {
                    if let Err(e) = self.radio.subscribe(link, &slot).await {
                        warn!("Resubscribe failed: {:?}", e);
                    }
                }
                let _ = self.with_connections(|t| t.set_subscribed(id, slot.value_handle, index));
                info!("Subscribe: Addr {} Handle {} Idx {}", address, slot.value_handle, index);
            } else {
                if let Some(link) = link {
                    if let Err(e) = self.radio.unsubscribe(link, &slot).await {
                        warn!("Unsubscribe failed: {:?}", e);
                    }
                }
                let _ = self.with_connections(|t| t.clear_subscribed(id, slot.value_handle));
                self.with_subscriptions(|s| s.release(index))?;
                info!("Unsubscribe: Addr {} Handle {} Idx {}", address, slot.value_handle, index);
            }
            count += 1;
        }
        info!("Subscriptions changed for {} handles", count);
        Ok(())
    }

    // Notification worker

    /// Consumer side of the notification pipeline. Never returns.
    pub async fn run_notification_worker(&self) -> ! {
        loop {
            self.process_next().await;
        }
    }

    /// Wait for one record and handle it.
    pub async fn process_next(&self) {
        let record = self.queue.receive().await;
        self.process_record(record).await;
    }

    async fn process_record(&self, record: NotificationRecord) {
        if record.is_read {
            info!("Read: Addr {} Handle {}", record.address, record.handle);
        } else {
            debug!("Notify Addr {} Handle {}", record.address, record.handle);
        }

        let Some(resolved) = self.resolve(&record) else {
            return;
        };

        if !record.is_read && self.deliver_filtered(&record, &resolved.uuid) {
            return;
        }

        if resolved.hidden {
            debug!("Suppressing notification write to cloud");
            return;
        }

        let address = record.address;
        let path = resolved.path.as_str();
        let value = record.payload.as_slice();
        let message = match (record.is_read, resolved.ccc) {
            (true, false) => Message::CharacteristicRead {
                address,
                uuid: resolved.uuid,
                path,
                value,
            },
            (true, true) => Message::DescriptorRead {
                address,
                uuid: Uuid::ccc(),
                path,
                value,
            },
            (false, _) => Message::ValueChanged {
                address,
                uuid: resolved.uuid,
                path,
                value,
            },
        };
        self.send(&message).await;
    }

    fn resolve(&self, record: &NotificationRecord) -> Option<Resolved> {
        self.with_connections(|t| {
            let Ok(id) = t.lookup_by_address(&record.address) else {
                error!("Connection not found for addr {}", record.address);
                return None;
            };
            let uuid = match t.lookup_by_handle(id, record.handle) {
                Ok(uuid) => uuid,
                Err(e) => {
                    if t.discovery_in_progress() {
                        info!(
                            "Ignoring notification on {} due to BLE discovery in progress",
                            record.address
                        );
                    } else {
                        error!("Unable to convert handle: {:?}", e);
                    }
                    return None;
                }
            };

            let mut handle = record.handle;
            let mut ccc = !record.is_read;
            if uuid.is_ccc() {
                ccc = true;
                handle = handle.wrapping_sub(1);
                debug!("Force ccc for handle {}", handle);
            }

            let path = match t.generate_path(id, handle, ccc) {
                Ok(path) => path,
                Err(e) => {
                    error!("Unable to generate path: {:?}", e);
                    return None;
                }
            };
            let hidden = t.get(id).map(|r| r.hidden).unwrap_or(false);
            Some(Resolved {
                uuid,
                path,
                ccc,
                hidden,
            })
        })
    }

    // Notify filter

    /// Divert notifications matching `filter`; `None` restores normal
    /// publishing.
    pub fn set_notify_filter(&self, filter: Option<NotifyFilter>) {
        self.notify_filter.lock(|f| f.set(filter));
        if filter.is_some() {
            self.discard_filtered();
        }
    }

    pub fn notify_filter(&self) -> Option<NotifyFilter> {
        self.notify_filter.lock(|f| f.get())
    }

    fn deliver_filtered(&self, record: &NotificationRecord, uuid: &Uuid) -> bool {
        let Some(filter) = self.notify_filter() else {
            return false;
        };
        if filter.address != record.address || filter.uuid != *uuid {
            return false;
        }
        let len = record.payload.len().min(DFU_MAX_RESPONSE_LEN);
        let mut payload = ResponseBuf::new();
        let _ = payload.extend_from_slice(&record.payload[..len]);
        debug!("filter took {} bytes", len);
        if self.filtered.try_send(payload).is_err() {
            warn!("Filtered notification dropped, receiver not keeping up");
        }
        true
    }

    /// Next payload captured by the notify filter.
    pub async fn filtered_notification(&self) -> ResponseBuf {
        self.filtered.receive().await
    }

    /// Throw away captured payloads nobody asked for yet.
    pub fn discard_filtered(&self) {
        while self.filtered.try_receive().is_ok() {}
    }

    // Scanning

    /// Start an active scan, or park the request while a discovery runs.
    pub async fn start_scan(&self) -> Result<(), Error> {
        match self.with_connections(|t| t.request_scan()) {
            ScanRequest::Deferred => {
                info!("Scan waiting... Discover in progress");
                Ok(())
            }
            ScanRequest::Proceed => {
                self.scan.lock(|s| s.borrow_mut().clear());
                self.radio.start_scan().await.inspect_err(|e| {
                    error!("Bluetooth set active scan failed (err {:?})", e);
                })?;
                info!("Bluetooth active scan enabled");
                Ok(())
            }
        }
    }

    /// Radio stack: advertisement seen while scanning.
    pub fn on_advertisement(&self, address: Address, rssi: i8, kind: AdvKind, data: &[u8]) {
        self.scan
            .lock(|s| s.borrow_mut().on_advertisement(address, rssi, kind, data));
    }

    /// Close the scan window and report what was found.
    pub async fn finish_scan(&self) {
        info!("Stopping scan...");
        if let Err(e) = self.radio.stop_scan().await {
            info!("Stopping scanning failed (err {:?})", e);
        }
        let results = self.scan.lock(|s| s.borrow().clone());
        info!(
            "Scan found {} devices, {} named",
            results.devices.len(),
            results.names_found()
        );
        self.send(&Message::ScanResults {
            devices: &results.devices,
        })
        .await;
    }

    /// Stop scanning, clear the allowlist and drop every connection.
    pub async fn stop_activity(&self) {
        if let Err(e) = self.radio.stop_scan().await {
            debug!("Error stopping scan: {:?}", e);
        }
        if let Err(e) = self.radio.allowlist_clear().await {
            debug!("Error clearing allowlist: {:?}", e);
        }
        self.with_connections(|t| {
            let ids: Vec<ConnId, MAX_CONNECTIONS> = t.iter().map(|(id, _)| id).collect();
            for id in ids {
                if let Ok(r) = t.get_mut(id) {
                    r.added_to_allowlist = false;
                }
            }
        });

        let connected: Vec<Address, MAX_CONNECTIONS> = self.with_connections(|t| {
            t.iter()
                .filter(|(_, r)| r.connected)
                .map(|(_, r)| r.address)
                .collect()
        });
        for address in connected {
            if let Err(e) = self.disconnect_device(&address).await {
                debug!("Error disconnecting {}: {:?}", address, e);
            }
        }
    }

    /// Copy of the attribute table of `address`.
    pub fn attributes(&self, address: &Address) -> Result<AttributeTable, Error> {
        self.with_connections(|t| {
            let id = t.lookup_by_address(address)?;
            Ok(t.get(id)?.attributes.clone())
        })
    }
}
