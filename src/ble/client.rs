//! Biosignal Client (central role)
//!
//! Mirrors the measurement service from the central side: tracks the peer's
//! characteristic handles across discovery, decodes incoming notifications,
//! and manages the CCCD subscription handshake through the serialized GATT
//! operation queue.

use defmt::{debug, info, warn, Format};
use heapless::Vec;

use super::biosig_service::{BIOSIG_MEASUREMENT_CHAR_UUID, BIOSIG_SERVICE_UUID};
use super::events::{BleEvent, DiscoveryResult, ATT_HANDLE_INVALID};
use super::gatt_queue::{GattOpQueue, GattWriteRequest, QueueError};
use super::measurement::{decode_frame, DecodedMeasurement};

/// CCCD value enabling notifications, bit 0 of the little-endian u16.
pub const CCCD_NOTIFICATIONS_ENABLE: u16 = 0x0001;
pub const CCCD_DISABLE: u16 = 0x0000;

/// Peer-side handles of the measurement characteristic. Both start at the
/// invalid sentinel and return to it on disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub struct PeerRecord {
    pub meas_handle: u16,
    pub cccd_handle: u16,
}

impl PeerRecord {
    pub const INVALID: Self = Self {
        meas_handle: ATT_HANDLE_INVALID,
        cccd_handle: ATT_HANDLE_INVALID,
    };

    pub const fn is_populated(&self) -> bool {
        self.meas_handle != ATT_HANDLE_INVALID || self.cccd_handle != ATT_HANDLE_INVALID
    }
}

impl Default for PeerRecord {
    fn default() -> Self {
        Self::INVALID
    }
}

/// Events surfaced to the application handler.
#[derive(Debug, Clone)]
pub enum BiosigClientEvent {
    /// The peer's biosignal service was discovered and its handles resolved.
    DiscoveryComplete { conn_handle: u16, peer: PeerRecord },
    /// A measurement notification was decoded.
    Measurement {
        conn_handle: u16,
        measurement: DecodedMeasurement,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum ClientError {
    /// Required handle or argument missing/invalid; checked at entry.
    InvalidParam,
    /// No connection associated with this instance.
    NoConnection,
    /// The shared GATT operation queue refused the request.
    Queue(QueueError),
}

pub struct BiosigClient {
    conn_handle: Option<u16>,
    peer: PeerRecord,
}

impl BiosigClient {
    pub const fn new() -> Self {
        Self { conn_handle: None, peer: PeerRecord::INVALID }
    }

    /// Associate a connection with this instance, optionally with
    /// caller-provided handles. Explicit handles take precedence over
    /// whatever a later discovery pass reports.
    pub fn handles_assign(&mut self, conn_handle: u16, peer: Option<PeerRecord>) {
        self.conn_handle = Some(conn_handle);
        if let Some(peer) = peer {
            self.peer = peer;
        }
    }

    /// Consume a discovery-complete result: linear scan for the measurement
    /// characteristic UUID, then populate the peer record, but only when no
    /// explicit handles were assigned first (first writer wins, so discovery
    /// never clobbers caller-provided values).
    pub fn on_discovery_complete(&mut self, result: &DiscoveryResult) -> Option<BiosigClientEvent> {
        if result.service_uuid16 != BIOSIG_SERVICE_UUID {
            return None;
        }

        let mut discovered = PeerRecord::INVALID;
        for characteristic in &result.characteristics {
            if characteristic.uuid16 == BIOSIG_MEASUREMENT_CHAR_UUID {
                discovered = PeerRecord {
                    meas_handle: characteristic.value_handle,
                    cccd_handle: characteristic.cccd_handle,
                };
                break;
            }
        }

        if self.conn_handle.is_some() && !self.peer.is_populated() {
            self.peer = discovered;
            debug!(
                "biosig client: handles resolved, value={} cccd={}",
                discovered.meas_handle, discovered.cccd_handle
            );
        }

        info!("biosig client: discovery complete on conn {}", result.conn_handle);
        Some(BiosigClientEvent::DiscoveryComplete {
            conn_handle: result.conn_handle,
            peer: discovered,
        })
    }

    /// Feed one stack event through the client, returning a decoded
    /// measurement when a notification from the tracked peer arrives.
    pub fn on_ble_event(&mut self, event: &BleEvent) -> Option<BiosigClientEvent> {
        match event {
            BleEvent::Hvx { conn_handle, handle, data } => {
                // Ignore traffic from other links and other characteristics.
                if self.conn_handle != Some(*conn_handle) {
                    debug!("biosig client: HVX on foreign link {}, ignored", conn_handle);
                    return None;
                }
                if *handle != self.peer.meas_handle || self.peer.meas_handle == ATT_HANDLE_INVALID
                {
                    return None;
                }

                match decode_frame(data) {
                    Ok(measurement) => Some(BiosigClientEvent::Measurement {
                        conn_handle: *conn_handle,
                        measurement,
                    }),
                    Err(e) => {
                        warn!("biosig client: undecodable notification: {:?}", e);
                        None
                    }
                }
            }
            BleEvent::Disconnected { conn_handle } => {
                if self.conn_handle == Some(*conn_handle) {
                    self.conn_handle = None;
                    self.peer = PeerRecord::INVALID;
                    debug!("biosig client: disconnected, peer record cleared");
                }
                None
            }
            _ => None,
        }
    }

    /// Subscribe to measurement notifications: a 2-byte little-endian CCCD
    /// write enqueued on the shared serialized queue.
    pub fn enable_notifications(&self, queue: &mut GattOpQueue) -> Result<(), ClientError> {
        self.write_cccd(queue, CCCD_NOTIFICATIONS_ENABLE)
    }

    pub fn disable_notifications(&self, queue: &mut GattOpQueue) -> Result<(), ClientError> {
        self.write_cccd(queue, CCCD_DISABLE)
    }

    fn write_cccd(&self, queue: &mut GattOpQueue, value: u16) -> Result<(), ClientError> {
        let conn_handle = self.conn_handle.ok_or(ClientError::NoConnection)?;
        if self.peer.cccd_handle == ATT_HANDLE_INVALID {
            return Err(ClientError::InvalidParam);
        }

        let mut payload = Vec::new();
        // 2 bytes always fit MAX_WRITE_LEN
        let _ = payload.extend_from_slice(&value.to_le_bytes());

        queue
            .enqueue(GattWriteRequest {
                conn_handle,
                att_handle: self.peer.cccd_handle,
                value: payload,
            })
            .map_err(ClientError::Queue)
    }

    pub fn conn_handle(&self) -> Option<u16> {
        self.conn_handle
    }

    pub fn peer(&self) -> PeerRecord {
        self.peer
    }
}

impl Default for BiosigClient {
    fn default() -> Self {
        Self::new()
    }
}
