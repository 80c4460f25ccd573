//! Notify/indicate subscription slots.
//!
//! Slots are handed out from a monotonic index. Unsubscribing clears the
//! slot's connection and value type but never returns the index, so the
//! table is exhausted after [`SUBSCRIPTION_LIMIT`] allocations even if
//! fewer are live.

use crate::ble::attribute::SlotIndex;
use crate::ble::connection::ConnId;
use crate::config::SUBSCRIPTION_LIMIT;
use crate::error::{Error, Lookup};

/// CCC value written to the peripheral.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
#[repr(u8)]
pub enum ValueType {
    None = 0,
    Notify = 1,
    Indicate = 2,
}

impl ValueType {
    /// Little-endian CCC descriptor value.
    pub fn ccc_value(self) -> [u8; 2] {
        [self as u8, 0]
    }
}

impl TryFrom<u8> for ValueType {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(ValueType::None),
            1 => Ok(ValueType::Notify),
            2 => Ok(ValueType::Indicate),
            _ => Err(Error::InvalidArgument),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SubscriptionSlot {
    pub conn: Option<ConnId>,
    pub value_handle: u16,
    pub ccc_handle: u16,
    pub value: ValueType,
}

impl SubscriptionSlot {
    const fn empty() -> Self {
        Self {
            conn: None,
            value_handle: 0,
            ccc_handle: 0,
            value: ValueType::None,
        }
    }
}

pub struct SubscriptionRegistry {
    slots: [SubscriptionSlot; SUBSCRIPTION_LIMIT],
    next_index: usize,
    current: usize,
}

impl Default for SubscriptionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionRegistry {
    pub const fn new() -> Self {
        Self {
            slots: [SubscriptionSlot::empty(); SUBSCRIPTION_LIMIT],
            next_index: 0,
            current: 0,
        }
    }

    pub fn current(&self) -> usize {
        self.current
    }

    pub fn has_room(&self) -> bool {
        self.current < SUBSCRIPTION_LIMIT && self.next_index < SUBSCRIPTION_LIMIT
    }

    pub fn get(&self, index: SlotIndex) -> Result<&SubscriptionSlot, Error> {
        self.slots
            .get(index as usize)
            .ok_or(Error::NotFound(Lookup::Slot))
    }

    /// Claim the next slot for `conn`/`value_handle`. The CCC descriptor is
    /// assumed to follow the value handle.
    pub fn allocate(
        &mut self,
        conn: ConnId,
        value_handle: u16,
        value: ValueType,
    ) -> Result<SlotIndex, Error> {
        if !self.has_room() {
            return Err(Error::ResourceExhausted);
        }
        let ccc_handle = value_handle.checked_add(1).ok_or(Error::InvalidArgument)?;
        let index = self.next_index;
        self.slots[index] = SubscriptionSlot {
            conn: Some(conn),
            value_handle,
            ccc_handle,
            value,
        };
        self.next_index += 1;
        self.current += 1;
        Ok(index as SlotIndex)
    }

    /// Drop the connection reference of `index`. The index stays consumed.
    pub fn release(&mut self, index: SlotIndex) -> Result<SubscriptionSlot, Error> {
        let slot = self
            .slots
            .get_mut(index as usize)
            .ok_or(Error::NotFound(Lookup::Slot))?;
        let old = *slot;
        slot.conn = None;
        slot.value = ValueType::None;
        if old.conn.is_some() {
            self.current = self.current.saturating_sub(1);
        }
        Ok(old)
    }

    /// Live slots owned by `conn`.
    pub fn slots_for(&self, conn: ConnId) -> impl Iterator<Item = (SlotIndex, SubscriptionSlot)> + '_ {
        self.slots
            .iter()
            .enumerate()
            .filter(move |(_, s)| s.conn == Some(conn))
            .map(|(i, s)| (i as SlotIndex, *s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::address::Address;
    use crate::ble::connection::ConnectionTable;

    fn conn() -> ConnId {
        let mut table = ConnectionTable::new();
        table.add_device(Address::new([1, 2, 3, 4, 5, 6]), false).unwrap()
    }

    #[test]
    fn allocation_is_monotonic() {
        let c = conn();
        let mut reg = SubscriptionRegistry::new();
        assert_eq!(reg.allocate(c, 10, ValueType::Notify), Ok(0));
        assert_eq!(reg.allocate(c, 20, ValueType::Indicate), Ok(1));
        assert_eq!(reg.get(1).unwrap().ccc_handle, 21);

        reg.release(0).unwrap();
        assert_eq!(reg.current(), 1);
        // Released index is not reused.
        assert_eq!(reg.allocate(c, 30, ValueType::Notify), Ok(2));
    }

    #[test]
    fn exhausted_after_limit_allocations() {
        let c = conn();
        let mut reg = SubscriptionRegistry::new();
        for h in 0..SUBSCRIPTION_LIMIT as u16 {
            let i = reg.allocate(c, h * 2, ValueType::Notify).unwrap();
            reg.release(i).unwrap();
        }
        assert_eq!(reg.current(), 0);
        assert_eq!(
            reg.allocate(c, 100, ValueType::Notify),
            Err(Error::ResourceExhausted)
        );
    }

    #[test]
    fn value_handle_at_top_of_range_rejected() {
        let c = conn();
        let mut reg = SubscriptionRegistry::new();
        assert_eq!(
            reg.allocate(c, u16::MAX, ValueType::Notify),
            Err(Error::InvalidArgument)
        );
        assert_eq!(reg.current(), 0);
        assert_eq!(reg.allocate(c, 10, ValueType::Notify), Ok(0));
    }

    #[test]
    fn release_twice_counts_once() {
        let c = conn();
        let mut reg = SubscriptionRegistry::new();
        let i = reg.allocate(c, 10, ValueType::Notify).unwrap();
        reg.release(i).unwrap();
        reg.release(i).unwrap();
        assert_eq!(reg.current(), 0);
        assert_eq!(reg.slots_for(c).count(), 0);
    }
}
