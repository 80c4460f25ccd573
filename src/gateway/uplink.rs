//! Everything the gateway sends to the cloud goes through one output
//! buffer guarded by one async mutex: at most one encode+publish is in
//! flight at a time.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::mutex::Mutex;
use heapless::Vec;

use crate::ble::address::Address;
use crate::ble::attribute::AttributePair;
use crate::ble::scanner::ScannedDevice;
use crate::ble::uuid::Uuid;
use crate::config::MAX_BUF_SIZE;
use crate::error::Error;

pub type OutputBuffer = Vec<u8, MAX_BUF_SIZE>;

/// Cloud topic a message is published on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum Topic {
    /// Gateway-to-cloud data messages.
    Data,
    /// Device shadow updates.
    Shadow,
}

/// Messages the core asks the encoder to serialise.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Message<'a> {
    /// Value returned by a characteristic read.
    CharacteristicRead {
        address: Address,
        uuid: Uuid,
        path: &'a str,
        value: &'a [u8],
    },
    /// Value returned by a CCC descriptor read.
    DescriptorRead {
        address: Address,
        uuid: Uuid,
        path: &'a str,
        value: &'a [u8],
    },
    /// Notification or indication.
    ValueChanged {
        address: Address,
        uuid: Uuid,
        path: &'a str,
        value: &'a [u8],
    },
    /// CCC write confirmation after (un)subscribing.
    SubscriptionChanged {
        address: Address,
        path: &'a str,
        value: [u8; 2],
    },
    /// Human readable error for a device.
    DeviceError { address: Address, message: &'a str },
    ConnectResult { address: Address, connected: bool },
    DisconnectResult { address: Address },
    /// Connection state as recorded in the device shadow.
    Shadow {
        address: Address,
        connecting: bool,
        connected: bool,
    },
    Discovery {
        address: Address,
        attributes: &'a [AttributePair],
    },
    ScanResults { devices: &'a [ScannedDevice] },
}

impl Message<'_> {
    pub fn topic(&self) -> Topic {
        match self {
            Message::Shadow { .. } => Topic::Shadow,
            _ => Topic::Data,
        }
    }
}

/// Serialises [`Message`]s into the cloud envelope.
pub trait Encoder {
    fn encode(&self, message: &Message<'_>, out: &mut OutputBuffer) -> Result<(), Error>;
}

/// Sends encoded bytes to the cloud.
pub trait Publisher {
    async fn publish(&self, topic: Topic, data: &[u8]) -> Result<(), Error>;
}

pub struct Uplink<M: RawMutex, E: Encoder, P: Publisher> {
    output: Mutex<M, OutputBuffer>,
    encoder: E,
    publisher: P,
}

impl<M: RawMutex, E: Encoder, P: Publisher> Uplink<M, E, P> {
    pub fn new(encoder: E, publisher: P) -> Self {
        Self {
            output: Mutex::new(Vec::new()),
            encoder,
            publisher,
        }
    }

    pub fn encoder(&self) -> &E {
        &self.encoder
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Encode and publish `message` under the output lock.
    pub async fn send(&self, message: &Message<'_>) -> Result<(), Error> {
        let mut out = self.output.lock().await;
        out.clear();
        let result = match self.encoder.encode(message, &mut out) {
            Ok(()) => {
                trace!("publishing {} bytes", out.len());
                self.publisher.publish(message.topic(), &out).await
            }
            Err(e) => Err(e),
        };
        out.clear();
        result
    }
}
