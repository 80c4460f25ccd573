//! Bluetooth Low Energy subsystem.
//!
//! The gateway acts as a BLE **Central** for many peripherals at once:
//!
//! 1. **Connection table** - one record per desired peripheral, holding
//!    link state and the attributes found by discovery.
//! 2. **Subscription registry** - notify/indicate slots shared by all
//!    connections.
//! 3. **Scanner** - deduplicated scan results.
//! 4. **Radio** - the trait the host stack is driven through.

pub mod address;
pub mod adv_parser;
pub mod attribute;
pub mod connection;
pub mod radio;
pub mod scanner;
pub mod subscription;
pub mod uuid;

pub use address::Address;
pub use attribute::{AttributeKind, AttributePair, Properties};
pub use connection::{ConnId, ConnectionTable};
pub use radio::{DisconnectReason, Radio};
pub use subscription::{SubscriptionRegistry, ValueType};
pub use uuid::Uuid;

/// Radio-stack handle of an established link.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct LinkHandle(pub u16);

/// One attribute reported during discovery.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DiscoveredAttribute {
    pub uuid: Uuid,
    pub handle: u16,
    pub kind: AttributeKind,
    pub properties: Properties,
}
