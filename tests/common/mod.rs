//! Host-side stand-ins for the radio, the cloud and the download client.

#![allow(dead_code)]

use std::cell::RefCell;

use ble_gateway::ble::{Address, AttributeKind, DiscoveredAttribute, LinkHandle, Properties, Radio, Uuid};
use ble_gateway::ble::radio::DisconnectReason;
use ble_gateway::ble::subscription::SubscriptionSlot;
use ble_gateway::config::{GatewayConfig, DFU_CONTROL_POINT_UUID, DFU_PACKET_UUID};
use ble_gateway::dfu::{DfuJob, Downloader, JobError, JobStatus, JobTracker};
use ble_gateway::error::{Error, TransportError};
use ble_gateway::gateway::uplink::OutputBuffer;
use ble_gateway::{Encoder, Gateway, Message, NotificationQueue, Publisher, Topic};
use embassy_futures::yield_now;
use embassy_sync::blocking_mutex::raw::NoopRawMutex;
use embedded_hal_async::delay::DelayNs;

pub const PEER: Address = Address::new([0xC0, 0x11, 0x22, 0x33, 0x44, 0x55]);
pub const LINK: LinkHandle = LinkHandle(1);

pub const BATTERY_SERVICE: u16 = 0x180F;
pub const BATTERY_LEVEL: u16 = 0x2A19;
pub const BATTERY_VALUE_HANDLE: u16 = 2;

pub const CP_HANDLE: u16 = 0x0B;
pub const PACKET_HANDLE: u16 = 0x0D;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn battery_level() -> Uuid {
    Uuid::from(BATTERY_LEVEL)
}

pub fn control_point() -> Uuid {
    DFU_CONTROL_POINT_UUID.parse().unwrap()
}

pub fn battery_attributes() -> [DiscoveredAttribute; 3] {
    [
        DiscoveredAttribute {
            uuid: Uuid::from(BATTERY_SERVICE),
            handle: 1,
            kind: AttributeKind::Service,
            properties: Properties::empty(),
        },
        DiscoveredAttribute {
            uuid: battery_level(),
            handle: BATTERY_VALUE_HANDLE,
            kind: AttributeKind::Characteristic,
            properties: Properties::READ | Properties::NOTIFY,
        },
        DiscoveredAttribute {
            uuid: Uuid::ccc(),
            handle: 3,
            kind: AttributeKind::Descriptor,
            properties: Properties::empty(),
        },
    ]
}

pub fn dfu_attributes() -> [DiscoveredAttribute; 4] {
    [
        DiscoveredAttribute {
            uuid: Uuid::from(0xFE59u16),
            handle: 0x0A,
            kind: AttributeKind::Service,
            properties: Properties::empty(),
        },
        DiscoveredAttribute {
            uuid: control_point(),
            handle: CP_HANDLE,
            kind: AttributeKind::Characteristic,
            properties: Properties::WRITE | Properties::NOTIFY,
        },
        DiscoveredAttribute {
            uuid: Uuid::ccc(),
            handle: CP_HANDLE + 1,
            kind: AttributeKind::Descriptor,
            properties: Properties::empty(),
        },
        DiscoveredAttribute {
            uuid: DFU_PACKET_UUID.parse().unwrap(),
            handle: PACKET_HANDLE,
            kind: AttributeKind::Characteristic,
            properties: Properties::WRITE_WITHOUT_RESPONSE,
        },
    ]
}

// Radio

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Call {
    Read(u16),
    Write(u16, Vec<u8>),
    Subscribe(u16),
    Unsubscribe(u16),
    StartDiscovery,
    Disconnect(u8),
    AllowlistAdd(Address),
    AllowlistRemove(Address),
    AllowlistClear,
    StartScan,
    StopScan,
}

/// Secure DFU bootloader behind the control point.
#[derive(Debug, Default)]
pub struct DfuPeer {
    pub max_size: u32,
    /// Object type of the last Select; offsets and CRCs are per type.
    pub selected: u8,
    pub corrupt_crc: bool,
    /// Never answer this opcode.
    pub silent_on: Option<u8>,
    /// Answer this opcode with "operation failed".
    pub reject: Option<u8>,
    pub object: Vec<u8>,
    pub creates: Vec<(u8, u32)>,
    pub crc_gets: usize,
    pub executes: usize,
    pub aborts: usize,
    pub packets: usize,
}

impl DfuPeer {
    fn respond(&mut self, command: &[u8]) -> Option<Vec<u8>> {
        let opcode = command[0];
        if opcode != 0x0C && self.silent_on == Some(opcode) {
            return None;
        }
        if opcode != 0x0C && self.reject == Some(opcode) {
            return Some(vec![0x60, opcode, 0x0A]);
        }
        let mut r = vec![0x60, opcode, 0x01];
        match opcode {
            0x01 => {
                let size = u32::from_le_bytes(command[2..6].try_into().unwrap());
                self.creates.push((command[1], size));
            }
            0x03 => {
                self.crc_gets += 1;
                let mut crc = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC).checksum(&self.object);
                if self.corrupt_crc {
                    crc = !crc;
                }
                r.extend_from_slice(&(self.object.len() as u32).to_le_bytes());
                r.extend_from_slice(&crc.to_le_bytes());
            }
            0x04 => self.executes += 1,
            0x06 => {
                if command[1] != self.selected {
                    self.selected = command[1];
                    self.object.clear();
                }
                r.extend_from_slice(&self.max_size.to_le_bytes());
                r.extend_from_slice(&[0; 8]);
            }
            0x0A => r.extend_from_slice(&[0x40, 0x08, 0, 0].repeat(5)),
            0x0B => {
                r.push(command[1]);
                r.extend_from_slice(&[1, 0, 0, 0].repeat(3));
            }
            0x0C => {
                self.aborts += 1;
                return None;
            }
            _ => {}
        }
        Some(r)
    }
}

#[derive(Debug, Default)]
pub struct RadioState {
    pub calls: Vec<Call>,
    /// `start_discovery` fails this many more times.
    pub discovery_failures: usize,
    /// Control point writes starting with this opcode fail in the stack.
    pub failing_write: Option<u8>,
    pub dfu: DfuPeer,
}

pub struct MockRadio<'q> {
    queue: &'q NotificationQueue<NoopRawMutex>,
    pub state: RefCell<RadioState>,
}

impl<'q> MockRadio<'q> {
    pub fn new(queue: &'q NotificationQueue<NoopRawMutex>) -> Self {
        Self {
            queue,
            state: RefCell::new(RadioState {
                dfu: DfuPeer {
                    max_size: 512,
                    ..Default::default()
                },
                ..Default::default()
            }),
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    pub fn count(&self, f: impl Fn(&Call) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| f(c)).count()
    }

    fn record(&self, call: Call) {
        self.state.borrow_mut().calls.push(call);
    }
}

impl Radio for MockRadio<'_> {
    async fn read(&self, _link: LinkHandle, handle: u16) -> Result<(), Error> {
        self.record(Call::Read(handle));
        Ok(())
    }

    async fn write(&self, _link: LinkHandle, handle: u16, data: &[u8]) -> Result<(), Error> {
        let response = if handle == CP_HANDLE {
            let mut state = self.state.borrow_mut();
            if data.first().is_some_and(|op| state.failing_write == Some(*op)) {
                return Err(Error::Transport(TransportError::Radio(-5)));
            }
            state.dfu.respond(data)
        } else {
            self.record(Call::Write(handle, data.to_vec()));
            None
        };
        if let Some(r) = response {
            self.queue.on_notification(PEER, CP_HANDLE, Some(&r));
        }
        Ok(())
    }

    async fn write_without_response(&self, _link: LinkHandle, handle: u16, data: &[u8]) -> Result<(), Error> {
        let mut state = self.state.borrow_mut();
        if handle == PACKET_HANDLE {
            assert!(data.len() <= 20, "packet chunk of {} bytes", data.len());
            state.dfu.object.extend_from_slice(data);
            state.dfu.packets += 1;
        } else {
            state.calls.push(Call::Write(handle, data.to_vec()));
        }
        Ok(())
    }

    async fn subscribe(&self, _link: LinkHandle, slot: &SubscriptionSlot) -> Result<(), Error> {
        self.record(Call::Subscribe(slot.value_handle));
        Ok(())
    }

    async fn unsubscribe(&self, _link: LinkHandle, slot: &SubscriptionSlot) -> Result<(), Error> {
        self.record(Call::Unsubscribe(slot.value_handle));
        Ok(())
    }

    async fn start_discovery(&self, _link: LinkHandle) -> Result<(), Error> {
        self.record(Call::StartDiscovery);
        let mut state = self.state.borrow_mut();
        if state.discovery_failures > 0 {
            state.discovery_failures -= 1;
            return Err(Error::Transport(TransportError::Radio(-12)));
        }
        Ok(())
    }

    async fn disconnect(&self, _link: LinkHandle, reason: DisconnectReason) -> Result<(), Error> {
        self.record(Call::Disconnect(reason.0));
        Ok(())
    }

    async fn allowlist_add(&self, address: &Address) -> Result<(), Error> {
        self.record(Call::AllowlistAdd(*address));
        Ok(())
    }

    async fn allowlist_remove(&self, address: &Address) -> Result<(), Error> {
        self.record(Call::AllowlistRemove(*address));
        Ok(())
    }

    async fn allowlist_clear(&self) -> Result<(), Error> {
        self.record(Call::AllowlistClear);
        Ok(())
    }

    async fn start_scan(&self) -> Result<(), Error> {
        self.record(Call::StartScan);
        Ok(())
    }

    async fn stop_scan(&self) -> Result<(), Error> {
        self.record(Call::StopScan);
        Ok(())
    }
}

// Cloud

/// Owned copy of what the gateway asked to publish.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Sent {
    Read { path: String, value: Vec<u8> },
    DescriptorRead { path: String, value: Vec<u8> },
    ValueChanged { path: String, value: Vec<u8> },
    Subscription { path: String, value: [u8; 2] },
    DeviceError(String),
    Connect(bool),
    Disconnect,
    Shadow { connected: bool },
    Discovery(usize),
    Scan(usize),
}

#[derive(Default)]
pub struct RecordingEncoder {
    pub sent: RefCell<Vec<Sent>>,
}

impl RecordingEncoder {
    pub fn sent(&self) -> Vec<Sent> {
        self.sent.borrow().clone()
    }
}

impl Encoder for RecordingEncoder {
    fn encode(&self, message: &Message<'_>, out: &mut OutputBuffer) -> Result<(), Error> {
        let sent = match *message {
            Message::CharacteristicRead { path, value, .. } => Sent::Read {
                path: path.into(),
                value: value.to_vec(),
            },
            Message::DescriptorRead { path, value, .. } => Sent::DescriptorRead {
                path: path.into(),
                value: value.to_vec(),
            },
            Message::ValueChanged { path, value, .. } => Sent::ValueChanged {
                path: path.into(),
                value: value.to_vec(),
            },
            Message::SubscriptionChanged { path, value, .. } => Sent::Subscription {
                path: path.into(),
                value,
            },
            Message::DeviceError { message, .. } => Sent::DeviceError(message.into()),
            Message::ConnectResult { connected, .. } => Sent::Connect(connected),
            Message::DisconnectResult { .. } => Sent::Disconnect,
            Message::Shadow { connected, .. } => Sent::Shadow { connected },
            Message::Discovery { attributes, .. } => Sent::Discovery(attributes.len()),
            Message::ScanResults { devices } => Sent::Scan(devices.len()),
        };
        self.sent.borrow_mut().push(sent);
        out.extend_from_slice(b"{}").map_err(|_| Error::Encode)
    }
}

#[derive(Default)]
pub struct RecordingPublisher {
    pub topics: RefCell<Vec<Topic>>,
}

impl Publisher for RecordingPublisher {
    async fn publish(&self, topic: Topic, _data: &[u8]) -> Result<(), Error> {
        self.topics.borrow_mut().push(topic);
        Ok(())
    }
}

#[derive(Clone)]
pub struct TestDelay;

impl DelayNs for TestDelay {
    async fn delay_ns(&mut self, _ns: u32) {
        for _ in 0..16 {
            yield_now().await;
        }
    }
}

pub type TestGateway<'q> = Gateway<'q, NoopRawMutex, MockRadio<'q>, RecordingEncoder, RecordingPublisher, TestDelay>;

pub fn gateway(queue: &NotificationQueue<NoopRawMutex>) -> TestGateway<'_> {
    Gateway::new(
        MockRadio::new(queue),
        queue,
        RecordingEncoder::default(),
        RecordingPublisher::default(),
        TestDelay,
        GatewayConfig::default(),
    )
}

/// Track, connect and load the attribute table of `PEER`.
pub async fn connect_with(gw: &TestGateway<'_>, attributes: &[DiscoveredAttribute], hidden: bool) {
    gw.add_device(PEER, hidden).unwrap();
    gw.on_connected(PEER, LINK, Ok(())).await;
    gw.discover(&PEER).await.unwrap();
    for attribute in attributes {
        gw.on_attribute_discovered(&PEER, *attribute).unwrap();
    }
    gw.on_discovery_complete(&PEER).await;
}

pub fn sent(gw: &TestGateway<'_>) -> Vec<Sent> {
    gw.uplink().encoder().sent()
}

// DFU job plumbing

#[derive(Default)]
pub struct RecordingTracker {
    pub updates: Vec<(JobStatus, u8, JobError)>,
}

impl RecordingTracker {
    pub fn statuses(&self, status: JobStatus) -> usize {
        self.updates.iter().filter(|u| u.0 == status).count()
    }

    pub fn last(&self) -> Option<(JobStatus, u8, JobError)> {
        self.updates.last().copied()
    }
}

impl JobTracker for RecordingTracker {
    async fn update(&mut self, _job: &DfuJob, status: JobStatus, progress: u8, error: JobError) -> Result<(), Error> {
        self.updates.push((status, progress, error));
        Ok(())
    }
}

#[derive(Default)]
pub struct MockDownloader {
    pub started: Vec<String>,
    pub stops: usize,
    pub fail_start: bool,
}

impl Downloader for MockDownloader {
    async fn start(&mut self, host: &str, path: &str) -> Result<(), Error> {
        if self.fail_start {
            return Err(Error::Transport(TransportError::Download(-113)));
        }
        self.started.push(format!("{host}/{path}"));
        Ok(())
    }

    fn stop(&mut self) {
        self.stops += 1;
    }
}
