//! DFU transport over the gateway's own connections.
//!
//! Control point notifications are caught by the notify filter before the
//! notification worker would publish them, and handed back through the
//! gateway's filtered channel.

use embassy_sync::blocking_mutex::raw::RawMutex;
use embedded_hal_async::delay::DelayNs;

use crate::ble::address::Address;
use crate::ble::radio::Radio;
use crate::ble::subscription::ValueType;
use crate::ble::uuid::Uuid;
use crate::config::{DFU_CONTROL_POINT_UUID, DFU_PACKET_UUID};
use crate::dfu::protocol::ResponseBuf;
use crate::dfu::DfuTransport;
use crate::error::Error;

use super::uplink::{Encoder, Publisher};
use super::{Gateway, NotifyFilter};

pub struct GatewayDfuLink<'g, 'q, M, R, E, P, D>
where
    M: RawMutex,
    R: Radio,
    E: Encoder,
    P: Publisher,
    D: DelayNs + Clone,
{
    gateway: &'g Gateway<'q, M, R, E, P, D>,
    control_point: Uuid,
    packet: Uuid,
}

impl<'g, 'q, M, R, E, P, D> GatewayDfuLink<'g, 'q, M, R, E, P, D>
where
    M: RawMutex,
    R: Radio,
    E: Encoder,
    P: Publisher,
    D: DelayNs + Clone,
{
    pub fn new(gateway: &'g Gateway<'q, M, R, E, P, D>) -> Result<Self, Error> {
        Ok(Self {
            gateway,
            control_point: DFU_CONTROL_POINT_UUID.parse()?,
            packet: DFU_PACKET_UUID.parse()?,
        })
    }

    pub fn gateway(&self) -> &Gateway<'q, M, R, E, P, D> {
        self.gateway
    }
}

impl<M, R, E, P, D> DfuTransport for GatewayDfuLink<'_, '_, M, R, E, P, D>
where
    M: RawMutex,
    R: Radio,
    E: Encoder,
    P: Publisher,
    D: DelayNs + Clone,
{
    fn is_connected(&self, target: &Address) -> bool {
        self.gateway.is_connected(target)
    }

    async fn open(&self, target: &Address) -> Result<(), Error> {
        self.gateway.set_notify_filter(Some(NotifyFilter {
            address: *target,
            uuid: self.control_point,
        }));
        // A second subscribe only repeats the confirmation.
        self.gateway
            .subscribe(target, &self.control_point, ValueType::Notify)
            .await
    }

    fn close(&self) {
        self.gateway.set_notify_filter(None);
    }

    fn discard_responses(&self) {
        self.gateway.discard_filtered();
    }

    async fn write_control(&self, target: &Address, data: &[u8]) -> Result<(), Error> {
        self.gateway.write(target, &self.control_point, data).await
    }

    async fn write_packet(&self, target: &Address, data: &[u8]) -> Result<(), Error> {
        self.gateway
            .write_without_response(target, &self.packet, data)
            .await
    }

    async fn response(&self) -> ResponseBuf {
        self.gateway.filtered_notification().await
    }

    async fn rediscover(&self, target: &Address) -> Result<(), Error> {
        self.gateway.force_rediscover(target).await
    }
}
