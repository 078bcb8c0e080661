//! USBTMC adapter: frames DEVICE_WRITE/DEVICE_READ traffic as USB Test and
//! Measurement Class bulk messages (USBTMC-USB488 §3). Device selection is
//! by VID/PID and optional serial number, since USBTMC exposes no other
//! addressable identity.

use std::time::Instant;

use async_trait::async_trait;
use nusb::transfer::RequestBuffer;
use nusb::Interface;

use crate::adapter::{Adapter, ReadOutcome};
use crate::error::{Error, Result};

const USBTMC_INTERFACE_CLASS: u8 = 0xFE;
const USBTMC_INTERFACE_SUBCLASS: u8 = 0x03;

const MSGID_DEV_DEP_MSG_OUT: u8 = 1;
const MSGID_REQUEST_DEV_DEP_MSG_IN: u8 = 2;
const MSGID_DEV_DEP_MSG_IN: u8 = 2;

const BULK_OUT_ENDPOINT: u8 = 0x02;
const BULK_IN_ENDPOINT: u8 = 0x81;

pub struct UsbtmcAdapter {
    vendor_id: u16,
    product_id: u16,
    serial_number: Option<String>,
    interface: Option<Interface>,
    next_tag: u8,
}
impl UsbtmcAdapter {
    pub fn new(vendor_id: u16, product_id: u16, serial_number: Option<String>) -> Self {
        Self {
            vendor_id,
            product_id,
            serial_number,
            interface: None,
            next_tag: 1,
        }
    }

    fn tag(&mut self) -> u8 {
        let tag = self.next_tag;
        self.next_tag = if self.next_tag == 255 { 1 } else { self.next_tag + 1 };
        tag
    }

    fn find_usbtmc_interface_number(info: &nusb::DeviceInfo) -> Option<u8> {
        info.interfaces()
            .find(|i| {
                i.class() == USBTMC_INTERFACE_CLASS && i.subclass() == USBTMC_INTERFACE_SUBCLASS
            })
            .map(|i| i.interface_number())
    }
}

#[async_trait]
impl Adapter for UsbtmcAdapter {
    async fn connect(&mut self) -> Result<()> {
        if self.interface.is_some() {
            return Ok(());
        }

        let info = nusb::list_devices()
            .await
            .map_err(|e| Error::Unhandled(e.into()))?
            .find(|d| {
                d.vendor_id() == self.vendor_id
                    && d.product_id() == self.product_id
                    && self
                        .serial_number
                        .as_deref()
                        .is_none_or(|want| d.serial_number() == Some(want))
            })
            .ok_or_else(|| {
                Error::NotFound(format!(
                    "no USBTMC device matching {:04x}:{:04x} serial={:?}",
                    self.vendor_id, self.product_id, self.serial_number
                ))
            })?;

        let interface_number = Self::find_usbtmc_interface_number(&info)
            .ok_or_else(|| Error::NotSupported("device exposes no USBTMC interface".into()))?;

        let device = info.open().await.map_err(|e| Error::Unhandled(e.into()))?;
        let interface = device
            .claim_interface(interface_number)
            .await
            .map_err(|e| Error::Unhandled(e.into()))?;
        self.interface = Some(interface);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.interface.take();
        Ok(())
    }

    async fn acquire(&mut self, _deadline: Option<Instant>) -> Result<()> {
        if self.interface.is_none() {
            return Err(Error::NotAcquired);
        }
        Ok(())
    }

    async fn release(&mut self) -> Result<()> {
        Ok(())
    }

    async fn write(&mut self, data: &[u8]) -> Result<usize> {
        let Some(interface) = &mut self.interface else {
            return Err(Error::NotAcquired);
        };

        let tag = {
            let t = self.next_tag;
            self.next_tag = if self.next_tag == 255 { 1 } else { self.next_tag + 1 };
            t
        };

        let mut frame = Vec::with_capacity(12 + data.len() + 3);
        frame.push(MSGID_DEV_DEP_MSG_OUT);
        frame.push(tag);
        frame.push(!tag);
        frame.push(0); // reserved
        frame.extend((data.len() as u32).to_le_bytes());
        frame.push(0x01); // bmTransferAttributes: EOM set, this call carries the whole message
        frame.extend([0u8; 3]); // reserved
        frame.extend_from_slice(data);
        while !frame.len().is_multiple_of(4) {
            frame.push(0);
        }

        interface
            .bulk_out(BULK_OUT_ENDPOINT, frame)
            .await
            .into_result()
            .map_err(|e| Error::Unhandled(e.into()))?;

        Ok(data.len())
    }

    async fn read(&mut self, max_len: usize, deadline: Option<Instant>) -> Result<(Vec<u8>, ReadOutcome)> {
        let Some(interface) = &mut self.interface else {
            return Err(Error::NotAcquired);
        };

        let tag = self.tag();
        let mut request = Vec::with_capacity(12);
        request.push(MSGID_REQUEST_DEV_DEP_MSG_IN);
        request.push(tag);
        request.push(!tag);
        request.push(0);
        request.extend((max_len as u32).to_le_bytes());
        request.push(0); // no term char requested; rely on EOM
        request.push(0); // termChar
        request.extend([0u8; 2]); // reserved

        interface
            .bulk_out(BULK_OUT_ENDPOINT, request)
            .await
            .into_result()
            .map_err(|e| Error::Unhandled(e.into()))?;

        let response_len = 12 + max_len + 3;
        let transfer = interface.bulk_in(BULK_IN_ENDPOINT, RequestBuffer::new(response_len));
        let raw = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Err(Error::Timeout("usbtmc read deadline exceeded".into()));
                }
                tokio::time::timeout(deadline - now, transfer)
                    .await
                    .map_err(|_| Error::Timeout("usbtmc bulk-in timed out".into()))?
                    .into_result()
                    .map_err(|e| Error::Unhandled(e.into()))?
            }
            None => transfer.await.into_result().map_err(|e| Error::Unhandled(e.into()))?,
        };

        if raw.len() < 12 || raw[0] != MSGID_DEV_DEP_MSG_IN {
            return Err(Error::BadResponse("malformed USBTMC bulk-in header".into()));
        }
        let transfer_size = u32::from_le_bytes([raw[4], raw[5], raw[6], raw[7]]) as usize;
        let eom = raw[8] & 0x01 != 0;
        let payload_end = (12 + transfer_size).min(raw.len());
        let data = raw[12..payload_end].to_vec();

        let satisfied = data.len() >= max_len;
        Ok((
            data,
            ReadOutcome {
                request_size_satisfied: satisfied,
                termchr_matched: false,
                end: eom || satisfied,
            },
        ))
    }
}
