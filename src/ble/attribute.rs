//! Discovered GATT attributes of one peripheral.
//!
//! Discovery walks a peripheral's database and records every service,
//! characteristic value and CCC descriptor as an [`AttributePair`]
//! (UUID plus handle). The table is append-only while discovery runs and
//! read-only afterwards, except for the subscription marker on
//! characteristic pairs.

use core::fmt::Write;

use heapless::{String, Vec};

use crate::ble::uuid::Uuid;
use crate::config::{MAX_ATTRIBUTES, MAX_PATH_LEN};
use crate::error::{Error, Lookup};

bitflags::bitflags! {
    /// Characteristic properties (Bluetooth Core Vol 3, Part G, 3.3.1.1).
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    #[repr(transparent)]
    pub struct Properties: u8 {
        const BROADCAST = 0x01;
        const READ = 0x02;
        const WRITE_WITHOUT_RESPONSE = 0x04;
        const WRITE = 0x08;
        const NOTIFY = 0x10;
        const INDICATE = 0x20;
        const AUTHENTICATED_SIGNED_WRITES = 0x40;
        const EXTENDED_PROPERTIES = 0x80;
    }
}

#[cfg(feature = "defmt")]
impl defmt::Format for Properties {
    fn format(&self, f: defmt::Formatter) {
        defmt::write!(f, "Properties({=u8:#04x})", self.bits())
    }
}

/// What kind of database entry a pair describes.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum AttributeKind {
    Service,
    Characteristic,
    Descriptor,
}

/// Index into the subscription registry.
pub type SlotIndex = u8;

/// One discovered attribute.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct AttributePair {
    pub uuid: Uuid,
    /// Service declaration handle, characteristic *value* handle or
    /// descriptor handle, depending on `kind`.
    pub handle: u16,
    pub kind: AttributeKind,
    pub properties: Properties,
    /// Registry slot while a notify/indicate subscription is active.
    pub subscription: Option<SlotIndex>,
}

impl AttributePair {
    pub const fn new(uuid: Uuid, handle: u16, kind: AttributeKind, properties: Properties) -> Self {
        Self {
            uuid,
            handle,
            kind,
            properties,
            subscription: None,
        }
    }

    pub fn is_subscribed(&self) -> bool {
        self.subscription.is_some()
    }
}

/// GATT path string: `SERVICE/CHARACTERISTIC[/2902]`.
pub type Path = String<MAX_PATH_LEN>;

/// Ordered attribute pairs of one connection.
#[derive(Clone, Debug, Default)]
pub struct AttributeTable {
    pairs: Vec<AttributePair, MAX_ATTRIBUTES>,
}

impl AttributeTable {
    pub const fn new() -> Self {
        Self { pairs: Vec::new() }
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    pub fn clear(&mut self) {
        self.pairs.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &AttributePair> {
        self.pairs.iter()
    }

    pub fn as_slice(&self) -> &[AttributePair] {
        &self.pairs
    }

    pub fn add(
        &mut self,
        uuid: Uuid,
        handle: u16,
        kind: AttributeKind,
        properties: Properties,
    ) -> Result<(), Error> {
        if self.pairs.iter().any(|p| p.handle == handle) {
            return Err(Error::Duplicate);
        }
        self.pairs
            .push(AttributePair::new(uuid, handle, kind, properties))
            .map_err(|_| Error::ResourceExhausted)
    }

    pub fn get(&self, handle: u16) -> Result<&AttributePair, Error> {
        self.pairs
            .iter()
            .find(|p| p.handle == handle)
            .ok_or(Error::NotFound(Lookup::Handle))
    }

    fn get_mut(&mut self, handle: u16) -> Result<&mut AttributePair, Error> {
        self.pairs
            .iter_mut()
            .find(|p| p.handle == handle)
            .ok_or(Error::NotFound(Lookup::Handle))
    }

    pub fn uuid_by_handle(&self, handle: u16) -> Result<Uuid, Error> {
        self.get(handle).map(|p| p.uuid)
    }

    /// First characteristic value handle carrying `uuid`.
    pub fn handle_by_uuid(&self, uuid: &Uuid) -> Result<u16, Error> {
        self.pairs
            .iter()
            .find(|p| p.kind == AttributeKind::Characteristic && p.uuid == *uuid)
            .map(|p| p.handle)
            .ok_or(Error::NotFound(Lookup::Uuid))
    }

    pub fn set_subscribed(&mut self, handle: u16, slot: SlotIndex) -> Result<(), Error> {
        self.get_mut(handle)?.subscription = Some(slot);
        Ok(())
    }

    pub fn clear_subscribed(&mut self, handle: u16) -> Result<(), Error> {
        self.get_mut(handle)?.subscription = None;
        Ok(())
    }

    pub fn get_subscribed(&self, handle: u16) -> Result<(bool, Option<SlotIndex>), Error> {
        let pair = self.get(handle)?;
        Ok((pair.is_subscribed(), pair.subscription))
    }

    /// Build the path of the characteristic whose value handle is `handle`.
    ///
    /// The service is the nearest service pair recorded before the
    /// characteristic.
    pub fn generate_path(&self, handle: u16, ccc: bool) -> Result<Path, Error> {
        let pos = self
            .pairs
            .iter()
            .position(|p| p.handle == handle && p.kind == AttributeKind::Characteristic)
            .ok_or(Error::NotFound(Lookup::Handle))?;
        let service = self.pairs[..pos]
            .iter()
            .rev()
            .find(|p| p.kind == AttributeKind::Service)
            .ok_or(Error::NotFound(Lookup::Uuid))?;

        let mut path = Path::new();
        write!(path, "{}/{}", service.uuid, self.pairs[pos].uuid)
            .map_err(|_| Error::ResourceExhausted)?;
        if ccc {
            write!(path, "/{}", Uuid::ccc()).map_err(|_| Error::ResourceExhausted)?;
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn battery_table() -> AttributeTable {
        let mut t = AttributeTable::new();
        t.add(Uuid::from(0x180Fu16), 10, AttributeKind::Service, Properties::empty())
            .unwrap();
        t.add(
            Uuid::from(0x2A19u16),
            12,
            AttributeKind::Characteristic,
            Properties::READ | Properties::NOTIFY,
        )
        .unwrap();
        t.add(Uuid::ccc(), 13, AttributeKind::Descriptor, Properties::empty())
            .unwrap();
        t
    }

    #[test]
    fn duplicate_handle_rejected() {
        let mut t = battery_table();
        assert_eq!(
            t.add(Uuid::from(0x2A00u16), 12, AttributeKind::Characteristic, Properties::READ),
            Err(Error::Duplicate)
        );
        assert_eq!(t.len(), 3);
    }

    #[test]
    fn table_full_is_resource_exhausted() {
        let mut t = AttributeTable::new();
        for h in 0..MAX_ATTRIBUTES as u16 {
            t.add(Uuid::from(h), h, AttributeKind::Descriptor, Properties::empty())
                .unwrap();
        }
        assert_eq!(
            t.add(Uuid::from(0xFFFFu16), 0xFFFF, AttributeKind::Descriptor, Properties::empty()),
            Err(Error::ResourceExhausted)
        );
    }

    #[test]
    fn lookups_both_ways() {
        let t = battery_table();
        assert_eq!(t.uuid_by_handle(13), Ok(Uuid::ccc()));
        assert_eq!(t.handle_by_uuid(&Uuid::from(0x2A19u16)), Ok(12));
        assert_eq!(t.uuid_by_handle(99), Err(Error::NotFound(Lookup::Handle)));
        assert_eq!(
            t.handle_by_uuid(&Uuid::from(0x180Fu16)),
            Err(Error::NotFound(Lookup::Uuid))
        );
    }

    #[test]
    fn path_with_and_without_ccc() {
        let t = battery_table();
        assert_eq!(t.generate_path(12, false).unwrap().as_str(), "180F/2A19");
        assert_eq!(t.generate_path(12, true).unwrap().as_str(), "180F/2A19/2902");
        assert!(t.generate_path(13, false).is_err());
    }

    #[test]
    fn subscription_marker() {
        let mut t = battery_table();
        assert_eq!(t.get_subscribed(12), Ok((false, None)));
        t.set_subscribed(12, 3).unwrap();
        assert_eq!(t.get_subscribed(12), Ok((true, Some(3))));
        t.clear_subscribed(12).unwrap();
        assert_eq!(t.get_subscribed(12), Ok((false, None)));
    }
}
