//! CMSIS-DAP packet transport.
//!
//! One command packet out, one response packet in. The HID implementation
//! talks to v1 probes through `hidapi`; the trait keeps the protocol layer
//! testable against an in-memory probe model.

use crate::link::LinkError;
use hidapi::{HidApi, HidDevice};
use tracing::debug;

const HID_PACKET_SIZE: usize = 64;
const READ_TIMEOUT_MS: i32 = 1000;

pub trait DapTransport: Send {
    /// Send one CMSIS-DAP command packet and return the response packet.
    fn transfer(&mut self, request: &[u8]) -> Result<Vec<u8>, LinkError>;

    /// Usable payload bytes per packet.
    fn packet_size(&self) -> usize {
        HID_PACKET_SIZE
    }
}

/// An enumerated CMSIS-DAP probe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeInfo {
    pub product: String,
    pub serial: String,
    pub vendor_id: u16,
    pub product_id: u16,
}

fn hid_err(context: &str, e: hidapi::HidError) -> LinkError {
    LinkError::Transport(format!("CMSIS-DAP HID failure in {context}. {e}"))
}

/// Lists connected probes that identify as CMSIS-DAP in their product
/// string (the standard v1 discovery rule).
pub fn enumerate() -> Result<Vec<ProbeInfo>, LinkError> {
    let api = HidApi::new().map_err(|e| hid_err("enumerate", e))?;
    let mut probes = Vec::new();
    for dev in api.device_list() {
        let product = dev.product_string().unwrap_or_default();
        if product.contains("CMSIS-DAP") {
            probes.push(ProbeInfo {
                product: product.to_owned(),
                serial: dev.serial_number().unwrap_or_default().to_owned(),
                vendor_id: dev.vendor_id(),
                product_id: dev.product_id(),
            });
        }
    }
    Ok(probes)
}

pub struct HidTransport {
    device: HidDevice,
}

impl HidTransport {
    /// Opens a probe by enumeration index or serial-number substring.
    pub fn open(selector: &str) -> Result<Self, LinkError> {
        let api = HidApi::new().map_err(|e| hid_err("open", e))?;
        let mut candidates = Vec::new();
        for dev in api.device_list() {
            let product = dev.product_string().unwrap_or_default();
            if product.contains("CMSIS-DAP") {
                candidates.push(dev.clone());
            }
        }
        if candidates.is_empty() {
            return Err(LinkError::Transport(
                "No CMSIS-DAP probes are connected".to_owned(),
            ));
        }

        let chosen = if let Ok(index) = selector.parse::<usize>() {
            candidates.get(index).ok_or_else(|| {
                LinkError::Transport(format!(
                    "CMSIS-DAP probe index {index} is out of range ({} connected)",
                    candidates.len()
                ))
            })?
        } else {
            candidates
                .iter()
                .find(|d| d.serial_number().unwrap_or_default().contains(selector))
                .ok_or_else(|| {
                    LinkError::Transport(format!(
                        "No CMSIS-DAP probe matches serial '{selector}'"
                    ))
                })?
        };

        debug!(
            product = chosen.product_string().unwrap_or_default(),
            serial = chosen.serial_number().unwrap_or_default(),
            "Opening CMSIS-DAP probe"
        );
        let device = chosen.open_device(&api).map_err(|e| hid_err("open", e))?;
        device
            .set_blocking_mode(true)
            .map_err(|e| hid_err("open", e))?;
        Ok(Self { device })
    }
}

impl DapTransport for HidTransport {
    fn transfer(&mut self, request: &[u8]) -> Result<Vec<u8>, LinkError> {
        // Report ID 0 plus a full-size padded packet.
        let mut out = vec![0u8; HID_PACKET_SIZE + 1];
        out[1..1 + request.len()].copy_from_slice(request);
        self.device.write(&out).map_err(|e| hid_err("write", e))?;

        let mut resp = vec![0u8; HID_PACKET_SIZE];
        let n = self
            .device
            .read_timeout(&mut resp, READ_TIMEOUT_MS)
            .map_err(|e| hid_err("read", e))?;
        if n == 0 {
            return Err(LinkError::Transport(
                "CMSIS-DAP probe did not answer within the timeout".to_owned(),
            ));
        }
        resp.truncate(n);
        Ok(resp)
    }
}
