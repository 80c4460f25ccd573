//! Connection records for every desired (cloud-requested) peripheral.
//!
//! Records live in a fixed arena and are addressed by [`ConnId`], so an
//! index handed out stays valid until the device is removed. All access
//! goes through [`ConnectionTable`]; the gateway keeps the table behind a
//! blocking mutex and only holds it for short, non-awaiting sections.

use crate::ble::address::Address;
use crate::ble::attribute::{AttributeKind, AttributeTable, Path, Properties, SlotIndex};
use crate::ble::uuid::Uuid;
use crate::ble::LinkHandle;
use crate::config::MAX_CONNECTIONS;
use crate::error::{Error, Lookup};

/// Stable index of a connection record.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct ConnId(u8);

impl ConnId {
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

/// One desired peripheral and what we know about it.
#[derive(Clone, Debug)]
pub struct ConnectionRecord {
    pub address: Address,
    pub link: Option<LinkHandle>,
    pub connecting: bool,
    pub connected: bool,
    pub discovering: bool,
    pub discovered: bool,
    /// A discovery report is due for this device.
    pub encode_discovered: bool,
    /// Managed internally; nothing is published for hidden devices.
    pub hidden: bool,
    pub free: bool,
    pub added_to_allowlist: bool,
    pub attributes: AttributeTable,
}

impl ConnectionRecord {
    pub const fn empty() -> Self {
        Self {
            address: Address::new([0; 6]),
            link: None,
            connecting: false,
            connected: false,
            discovering: false,
            discovered: false,
            encode_discovered: false,
            hidden: false,
            free: true,
            added_to_allowlist: false,
            attributes: AttributeTable::new(),
        }
    }
}

/// Whether a scan may start now or was parked behind a discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ScanRequest {
    Proceed,
    Deferred,
}

pub struct ConnectionTable {
    records: [ConnectionRecord; MAX_CONNECTIONS],
    discover_in_progress: bool,
    scan_waiting: bool,
}

impl Default for ConnectionTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self {
            records: core::array::from_fn(|_| ConnectionRecord::empty()),
            discover_in_progress: false,
            scan_waiting: false,
        }
    }

    fn record(&self, id: ConnId) -> Result<&ConnectionRecord, Error> {
        self.records
            .get(id.index())
            .filter(|r| !r.free)
            .ok_or(Error::NotFound(Lookup::Address))
    }

    fn record_mut(&mut self, id: ConnId) -> Result<&mut ConnectionRecord, Error> {
        self.records
            .get_mut(id.index())
            .filter(|r| !r.free)
            .ok_or(Error::NotFound(Lookup::Address))
    }

    pub fn get(&self, id: ConnId) -> Result<&ConnectionRecord, Error> {
        self.record(id)
    }

    pub fn get_mut(&mut self, id: ConnId) -> Result<&mut ConnectionRecord, Error> {
        self.record_mut(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = (ConnId, &ConnectionRecord)> {
        self.records
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.free)
            .map(|(i, r)| (ConnId(i as u8), r))
    }

    // Devices

    /// Track `address`. Re-adding an existing device only updates `hidden`.
    pub fn add_device(&mut self, address: Address, hidden: bool) -> Result<ConnId, Error> {
        if let Ok(id) = self.lookup_by_address(&address) {
            self.records[id.index()].hidden = hidden;
            return Ok(id);
        }
        let index = self
            .records
            .iter()
            .position(|r| r.free)
            .ok_or(Error::ResourceExhausted)?;
        let record = &mut self.records[index];
        *record = ConnectionRecord::empty();
        record.address = address;
        record.hidden = hidden;
        record.free = false;
        Ok(ConnId(index as u8))
    }

    /// Forget `address`; its attribute table goes with it.
    pub fn remove_device(&mut self, address: &Address) -> Result<ConnectionRecord, Error> {
        let id = self.lookup_by_address(address)?;
        let old = core::mem::replace(&mut self.records[id.index()], ConnectionRecord::empty());
        Ok(old)
    }

    pub fn is_desired(&self, address: &Address) -> bool {
        self.lookup_by_address(address).is_ok()
    }

    pub fn lookup_by_address(&self, address: &Address) -> Result<ConnId, Error> {
        self.records
            .iter()
            .position(|r| !r.free && r.address == *address)
            .map(|i| ConnId(i as u8))
            .ok_or(Error::NotFound(Lookup::Address))
    }

    pub fn lookup_by_link(&self, link: LinkHandle) -> Result<ConnId, Error> {
        self.records
            .iter()
            .position(|r| !r.free && r.link == Some(link))
            .map(|i| ConnId(i as u8))
            .ok_or(Error::NotFound(Lookup::Link))
    }

    /// Returns `true` when the flag actually changed.
    pub fn set_connected(&mut self, id: ConnId, connected: bool) -> Result<bool, Error> {
        let record = self.record_mut(id)?;
        record.connecting = false;
        if !connected {
            record.link = None;
        }
        if record.connected == connected {
            return Ok(false);
        }
        record.connected = connected;
        Ok(true)
    }

    pub fn is_connected(&self, address: &Address) -> bool {
        self.lookup_by_address(address)
            .and_then(|id| self.record(id))
            .map(|r| r.connected)
            .unwrap_or(false)
    }

    // Attributes

    pub fn add_attribute(
        &mut self,
        id: ConnId,
        uuid: Uuid,
        handle: u16,
        kind: AttributeKind,
        properties: Properties,
    ) -> Result<(), Error> {
        self.record_mut(id)?
            .attributes
            .add(uuid, handle, kind, properties)
    }

    pub fn lookup_by_handle(&self, id: ConnId, handle: u16) -> Result<Uuid, Error> {
        self.record(id)?.attributes.uuid_by_handle(handle)
    }

    pub fn handle_by_uuid(&self, id: ConnId, uuid: &Uuid) -> Result<u16, Error> {
        self.record(id)?.attributes.handle_by_uuid(uuid)
    }

    pub fn set_subscribed(&mut self, id: ConnId, handle: u16, slot: SlotIndex) -> Result<(), Error> {
        self.record_mut(id)?.attributes.set_subscribed(handle, slot)
    }

    pub fn clear_subscribed(&mut self, id: ConnId, handle: u16) -> Result<(), Error> {
        self.record_mut(id)?.attributes.clear_subscribed(handle)
    }

    pub fn get_subscribed(
        &self,
        id: ConnId,
        handle: u16,
    ) -> Result<(bool, Option<SlotIndex>), Error> {
        self.record(id)?.attributes.get_subscribed(handle)
    }

    pub fn generate_path(&self, id: ConnId, handle: u16, ccc: bool) -> Result<Path, Error> {
        self.record(id)?.attributes.generate_path(handle, ccc)
    }

    /// Drop the attribute table so the next discovery starts from scratch.
    pub fn clear_attributes(&mut self, id: ConnId) -> Result<(), Error> {
        let record = self.record_mut(id)?;
        record.attributes.clear();
        record.discovered = false;
        record.discovering = false;
        Ok(())
    }

    // Discovery gate

    pub fn discovery_in_progress(&self) -> bool {
        self.discover_in_progress
    }

    /// Claim the single system-wide discovery slot for `id`.
    pub fn begin_discovery(&mut self, id: ConnId) -> Result<(), Error> {
        if self.discover_in_progress {
            return Err(Error::Busy);
        }
        let record = self.record_mut(id)?;
        record.discovering = true;
        self.discover_in_progress = true;
        Ok(())
    }

    /// Release the discovery slot. Returns `true` when a parked scan
    /// request should now run.
    pub fn finish_discovery(&mut self) -> bool {
        self.discover_in_progress = false;
        for r in self.records.iter_mut().filter(|r| !r.free) {
            r.discovering = false;
        }
        core::mem::take(&mut self.scan_waiting)
    }

    pub fn request_scan(&mut self) -> ScanRequest {
        if self.discover_in_progress {
            self.scan_waiting = true;
            ScanRequest::Deferred
        } else {
            self.scan_waiting = false;
            ScanRequest::Proceed
        }
    }
}
