//! Per-image transfer state machine.
//!
//! ```text
//! Idle -> Selecting -> (Creating -> Transferring -> AwaitingCrc -> Executing)* -> Completed
//! ```
//!
//! An image is streamed in objects of at most `max_object_size` bytes.
//! Download fragments arrive with arbitrary boundaries, so [`Transfer`]
//! keeps the page bookkeeping between calls to [`Transfer::feed`].

use crc::{Crc, Digest, CRC_32_ISO_HDLC};
use embassy_futures::select::{select, Either};
use embedded_hal_async::delay::DelayNs;

use crate::ble::address::Address;
use crate::config::DfuConfig;
use crate::dfu::protocol::{Command, CrcResponse, FirmwareType, ObjectType, Response};
use crate::dfu::DfuTransport;
use crate::error::{Error, ProtocolError};

/// CRC-32 as computed by the bootloader.
pub static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DfuState {
    Idle,
    Selecting,
    Creating,
    Transferring,
    AwaitingCrc,
    Executing,
    Completed,
    Failed,
}

/// Request/response access to one target's control point.
pub struct ControlLink<'a, T: DfuTransport, D: DelayNs> {
    transport: &'a T,
    target: Address,
    delay: &'a mut D,
    config: &'a DfuConfig,
}

impl<'a, T: DfuTransport, D: DelayNs> ControlLink<'a, T, D> {
    pub fn new(transport: &'a T, target: Address, delay: &'a mut D, config: &'a DfuConfig) -> Self {
        Self {
            transport,
            target,
            delay,
            config,
        }
    }

    pub fn target(&self) -> &Address {
        &self.target
    }

    /// Write `command` and wait, bounded, for its response.
    pub async fn request(&mut self, command: Command) -> Result<Response, Error> {
        let raw = command.encode();
        trace!("DFU -> {:?}", command);
        // A reply that came in after its own timeout must not answer this request.
        self.transport.discard_responses();
        self.transport.write_control(&self.target, &raw).await?;

        let timeout = self.config.response_timeout_ms;
        let buf = match select(self.transport.response(), self.delay.delay_ms(timeout)).await {
            Either::First(buf) => buf,
            Either::Second(()) => {
                error!("DFU response timeout for {:?}", command.opcode());
                return Err(Error::Timeout);
            }
        };

        let response = Response::parse(&buf).inspect_err(|e| {
            error!("DFU response error: {:?}", e);
        })?;
        if response.opcode() != command.opcode() {
            return Err(ProtocolError::UnexpectedOpcode {
                expected: command.opcode() as u8,
                got: response.opcode() as u8,
            }
            .into());
        }
        trace!("DFU <- {:?}", response);
        Ok(response)
    }

    /// Stream `data` to the packet characteristic in chunks.
    pub async fn send_data(&mut self, data: &[u8]) -> Result<(), Error> {
        for chunk in data.chunks(self.config.chunk_size.max(1)) {
            self.transport.write_packet(&self.target, chunk).await?;
        }
        Ok(())
    }

    /// Abort the target's transfer without waiting for an answer.
    pub async fn abort(&mut self) {
        let raw = Command::Abort.encode();
        if let Err(e) = self.transport.write_control(&self.target, &raw).await {
            warn!("DFU abort not sent: {:?}", e);
        }
    }

    async fn settle(&mut self) {
        self.delay.delay_ms(self.config.crc_settle_ms).await;
    }
}

fn unexpected(expected: Command, got: Response) -> Error {
    ProtocolError::UnexpectedOpcode {
        expected: expected.opcode() as u8,
        got: got.opcode() as u8,
    }
    .into()
}

/// Transfer state of one image.
pub struct Transfer {
    state: DfuState,
    object: ObjectType,
    total: usize,
    sent: usize,
    crc: Digest<'static, u32>,
    max_size: usize,
    page_remaining: usize,
    page_open: bool,
}

impl Transfer {
    /// `init_packet` selects command objects instead of data objects.
    pub fn new(init_packet: bool, total: usize) -> Self {
        Self {
            state: DfuState::Idle,
            object: if init_packet {
                ObjectType::Command
            } else {
                ObjectType::Data
            },
            total,
            sent: 0,
            crc: CRC32.digest(),
            max_size: 0,
            page_remaining: 0,
            page_open: false,
        }
    }

    pub fn state(&self) -> DfuState {
        self.state
    }

    pub fn object(&self) -> ObjectType {
        self.object
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn sent(&self) -> usize {
        self.sent
    }

    pub fn max_object_size(&self) -> usize {
        self.max_size
    }

    pub fn is_complete(&self) -> bool {
        self.state == DfuState::Completed
    }

    /// Running CRC over everything sent so far.
    pub fn crc(&self) -> u32 {
        self.crc.clone().finalize()
    }

    pub fn fail(&mut self) {
        self.state = DfuState::Failed;
    }

    /// Open the control point and select the object type.
    pub async fn begin<T: DfuTransport, D: DelayNs>(&mut self, link: &mut ControlLink<'_, T, D>) -> Result<(), Error> {
        self.state = DfuState::Selecting;
        link.transport.open(&link.target).await?;
        link.request(Command::SetPrn(0)).await?;

        if self.object == ObjectType::Command {
            match link.request(Command::HwVersion).await {
                Ok(Response::HwVersion(hw)) => info!(
                    "Target part {} variant {} rom {} page {}",
                    hw.part, hw.variant, hw.rom_size, hw.rom_page_size
                ),
                Ok(_) => {}
                Err(e) => warn!("HW version unavailable: {:?}", e),
            }
            match link.request(Command::FwVersion(FirmwareType::Application)).await {
                Ok(Response::FwVersion(fw)) => {
                    info!("Target app version {} at {} len {}", fw.version, fw.addr, fw.len)
                }
                Ok(_) => {}
                Err(e) => warn!("FW version unavailable: {:?}", e),
            }
        }

        let select_cmd = Command::Select(self.object);
        let selected = match link.request(select_cmd).await? {
            Response::Select(s) => s,
            other => return Err(unexpected(select_cmd, other)),
        };
        if selected.max_size == 0 {
            return Err(ProtocolError::ZeroObjectSize.into());
        }
        self.max_size = selected.max_size as usize;
        if selected.offset as usize == self.total {
            info!("Target reports {} bytes already present, crc {}", selected.offset, selected.crc);
        }
        debug!(
            "Selected {:?}: max {} offset {} crc {}",
            self.object, selected.max_size, selected.offset, selected.crc
        );

        if self.object == ObjectType::Command {
            self.state = DfuState::Creating;
            link.request(Command::Create {
                object: ObjectType::Command,
                size: self.total as u32,
            })
            .await?;
            self.page_remaining = self.total;
            self.page_open = true;
        }
        self.state = DfuState::Transferring;
        Ok(())
    }

    /// Push one download fragment through the target.
    pub async fn feed<T: DfuTransport, D: DelayNs>(
        &mut self,
        link: &mut ControlLink<'_, T, D>,
        data: &[u8],
    ) -> Result<(), Error> {
        if self.sent + data.len() > self.total {
            error!("Fragment overruns image: {} + {} > {}", self.sent, data.len(), self.total);
            return Err(Error::InvalidArgument);
        }

        let mut rest = data;
        while !rest.is_empty() {
            if !self.page_open {
                let page = self.max_size.min(self.total - self.sent);
                self.state = DfuState::Creating;
                link.request(Command::Create {
                    object: ObjectType::Data,
                    size: page as u32,
                })
                .await?;
                self.page_remaining = page;
                self.page_open = true;
            }

            self.state = DfuState::Transferring;
            let (chunk, tail) = rest.split_at(rest.len().min(self.page_remaining));
            link.send_data(chunk).await?;
            self.crc.update(chunk);
            self.sent += chunk.len();
            self.page_remaining -= chunk.len();
            rest = tail;

            if self.page_remaining == 0 {
                self.verify_crc(link).await?;
                self.state = DfuState::Executing;
                link.request(Command::Execute).await?;
                self.page_open = false;
                debug!("Object executed, {}/{} bytes", self.sent, self.total);
            }
        }

        if self.sent == self.total {
            self.state = DfuState::Completed;
        }
        Ok(())
    }

    async fn verify_crc<T: DfuTransport, D: DelayNs>(&mut self, link: &mut ControlLink<'_, T, D>) -> Result<(), Error> {
        self.state = DfuState::AwaitingCrc;
        let expected = CrcResponse {
            offset: self.sent as u32,
            crc: self.crc(),
        };

        let mut last = Error::Timeout;
        for attempt in 1..=link.config.crc_attempts.max(1) {
            link.settle().await;
            last = match link.request(Command::CrcGet).await {
                Ok(Response::CrcGet(got)) if got.offset != expected.offset => ProtocolError::OffsetMismatch {
                    expected: expected.offset,
                    got: got.offset,
                }
                .into(),
                Ok(Response::CrcGet(got)) if got.crc != expected.crc => ProtocolError::CrcMismatch {
                    expected: expected.crc,
                    got: got.crc,
                }
                .into(),
                Ok(Response::CrcGet(_)) => return Ok(()),
                Ok(other) => unexpected(Command::CrcGet, other),
                Err(e) => e,
            };
            warn!("CRC check attempt {} failed: {:?}", attempt, last);
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use core::cell::RefCell;

    use embassy_futures::block_on;
    use embassy_futures::yield_now;
    use embassy_sync::blocking_mutex::raw::NoopRawMutex;
    use embassy_sync::channel::Channel;

    use super::*;
    use crate::dfu::protocol::ResponseBuf;

    /// Bootloader stand-in answering control point writes directly.
    struct Target {
        max_size: u32,
        corrupt_crc: bool,
        silent: bool,
        /// Answer the HW version query only after the next write.
        late_hw_version: bool,
        held: Option<std::vec::Vec<u8>>,
        object: std::vec::Vec<u8>,
        creates: std::vec::Vec<(u8, u32)>,
        crc_gets: usize,
        executes: usize,
        packets: usize,
    }

    struct MockTransport {
        target: RefCell<Target>,
        responses: Channel<NoopRawMutex, ResponseBuf, 4>,
    }

    impl MockTransport {
        fn new(max_size: u32) -> Self {
            Self {
                target: RefCell::new(Target {
                    max_size,
                    corrupt_crc: false,
                    silent: false,
                    late_hw_version: false,
                    held: None,
                    object: std::vec::Vec::new(),
                    creates: std::vec::Vec::new(),
                    crc_gets: 0,
                    executes: 0,
                    packets: 0,
                }),
                responses: Channel::new(),
            }
        }

        fn reply(&self, bytes: &[u8]) {
            let mut buf = ResponseBuf::new();
            buf.extend_from_slice(bytes).unwrap();
            self.responses.try_send(buf).unwrap();
        }
    }

    impl DfuTransport for MockTransport {
        fn is_connected(&self, _target: &Address) -> bool {
            true
        }

        async fn open(&self, _target: &Address) -> Result<(), Error> {
            Ok(())
        }

        fn close(&self) {}

        fn discard_responses(&self) {
            while self.responses.try_receive().is_ok() {}
        }

        async fn write_control(&self, _target: &Address, data: &[u8]) -> Result<(), Error> {
            let mut t = self.target.borrow_mut();
            if t.silent {
                return Ok(());
            }
            if let Some(late) = t.held.take() {
                self.reply(&late);
            }
            match data[0] {
                0x01 => {
                    t.creates.push((data[1], u32::from_le_bytes(data[2..6].try_into().unwrap())));
                    self.reply(&[0x60, 0x01, 0x01]);
                }
                0x02 => self.reply(&[0x60, 0x02, 0x01]),
                0x03 => {
                    t.crc_gets += 1;
                    let mut crc = CRC32.checksum(&t.object);
                    if t.corrupt_crc {
                        crc ^= 1;
                    }
                    let mut r = vec![0x60, 0x03, 0x01];
                    r.extend_from_slice(&(t.object.len() as u32).to_le_bytes());
                    r.extend_from_slice(&crc.to_le_bytes());
                    self.reply(&r);
                }
                0x04 => {
                    t.executes += 1;
                    self.reply(&[0x60, 0x04, 0x01]);
                }
                0x06 => {
                    let mut r = vec![0x60, 0x06, 0x01];
                    r.extend_from_slice(&t.max_size.to_le_bytes());
                    r.extend_from_slice(&[0; 8]);
                    self.reply(&r);
                }
                0x0A if t.late_hw_version => {
                    let mut r = vec![0x60, 0x0A, 0x01];
                    r.extend_from_slice(&[0x40, 0x08, 0, 0].repeat(5));
                    t.held = Some(r);
                }
                // Version queries unsupported on this target.
                0x0A | 0x0B => self.reply(&[0x60, data[0], 0x02]),
                _ => {}
            }
            Ok(())
        }

        async fn write_packet(&self, _target: &Address, data: &[u8]) -> Result<(), Error> {
            let mut t = self.target.borrow_mut();
            assert!(data.len() <= 20);
            t.object.extend_from_slice(data);
            t.packets += 1;
            Ok(())
        }

        async fn response(&self) -> ResponseBuf {
            self.responses.receive().await
        }

        async fn rediscover(&self, _target: &Address) -> Result<(), Error> {
            Ok(())
        }
    }

    struct Yield;

    impl DelayNs for Yield {
        async fn delay_ns(&mut self, _ns: u32) {
            for _ in 0..4 {
                yield_now().await;
            }
        }
    }

    const TARGET: Address = Address::new([0xD0, 0, 0, 0, 0, 1]);

    fn run(transport: &MockTransport, init: bool, image: &[u8], fragment: usize) -> (Transfer, Result<(), Error>) {
        let config = DfuConfig::default();
        let mut delay = Yield;
        let mut link = ControlLink::new(transport, TARGET, &mut delay, &config);
        let mut transfer = Transfer::new(init, image.len());
        let result = block_on(async {
            transfer.begin(&mut link).await?;
            for frag in image.chunks(fragment) {
                transfer.feed(&mut link, frag).await?;
            }
            Ok::<(), Error>(())
        });
        (transfer, result)
    }

    #[test]
    fn pages_follow_max_object_size() {
        let transport = MockTransport::new(512);
        let image: std::vec::Vec<u8> = (0..4096u32).map(|i| i as u8).collect();
        let (transfer, result) = run(&transport, false, &image, 300);
        assert_eq!(result, Ok(()));
        assert!(transfer.is_complete());
        assert_eq!(transfer.crc(), CRC32.checksum(&image));

        let t = transport.target.borrow();
        assert_eq!(t.creates.len(), 8);
        assert!(t.creates.iter().all(|&(kind, size)| kind == 2 && size == 512));
        assert_eq!(t.crc_gets, 8);
        assert_eq!(t.executes, 8);
        assert_eq!(t.object, image);
    }

    #[test]
    fn last_page_is_short() {
        let transport = MockTransport::new(512);
        let image = [0x5A; 1100];
        let (_, result) = run(&transport, false, &image, 64);
        assert_eq!(result, Ok(()));
        let t = transport.target.borrow();
        let sizes: std::vec::Vec<u32> = t.creates.iter().map(|c| c.1).collect();
        assert_eq!(sizes, vec![512, 512, 76]);
    }

    #[test]
    fn init_packet_is_one_command_object() {
        let transport = MockTransport::new(512);
        let init = [0x12; 140];
        let (transfer, result) = run(&transport, true, &init, 50);
        assert_eq!(result, Ok(()));
        assert_eq!(transfer.object(), ObjectType::Command);
        let t = transport.target.borrow();
        assert_eq!(t.creates, vec![(1, 140)]);
        assert_eq!(t.executes, 1);
    }

    #[test]
    fn crc_mismatch_after_retries() {
        let transport = MockTransport::new(512);
        transport.target.borrow_mut().corrupt_crc = true;
        let image = [0x33; 512];
        let (transfer, result) = run(&transport, false, &image, 512);
        assert!(matches!(
            result,
            Err(Error::Protocol(ProtocolError::CrcMismatch { .. }))
        ));
        assert_eq!(transfer.state(), DfuState::AwaitingCrc);
        let t = transport.target.borrow();
        assert_eq!(t.crc_gets, 5);
        assert_eq!(t.executes, 0);
    }

    #[test]
    fn late_reply_does_not_answer_next_request() {
        let transport = MockTransport::new(512);
        transport.target.borrow_mut().late_hw_version = true;
        let init = [0x12; 100];
        let (transfer, result) = run(&transport, true, &init, 100);
        assert_eq!(result, Ok(()));
        assert!(transfer.is_complete());
        let t = transport.target.borrow();
        assert_eq!(t.creates, vec![(1, 100)]);
        assert_eq!(t.executes, 1);
    }

    #[test]
    fn silent_target_times_out() {
        let transport = MockTransport::new(512);
        transport.target.borrow_mut().silent = true;
        let (_, result) = run(&transport, false, &[1; 10], 10);
        assert_eq!(result, Err(Error::Timeout));
    }

    #[test]
    fn overrun_rejected() {
        let transport = MockTransport::new(512);
        let config = DfuConfig::default();
        let mut delay = Yield;
        let mut link = ControlLink::new(&transport, TARGET, &mut delay, &config);
        let mut transfer = Transfer::new(false, 8);
        let result = block_on(async {
            transfer.begin(&mut link).await?;
            transfer.feed(&mut link, &[0; 9]).await?;
            Ok::<(), Error>(())
        });
        assert_eq!(result, Err(Error::InvalidArgument));
    }
}
