//! BLE Biosignal Measurement Service (peripheral role)
//!
//! Owns the characteristic handles, the tracked connection and the payload
//! budget derived from the negotiated MTU, and drives the notification send
//! path with its bounded flow-control retry.
//!
//! State machine: Disconnected → (connect) → Connected at the default MTU →
//! (MTU update) → Connected at the negotiated MTU → (disconnect) →
//! Disconnected. The peer's notification subscription is an orthogonal
//! flag, reset on disconnect together with the flow-control state.

use defmt::{debug, info, warn};

use super::events::{BleEvent, ATT_MTU_DEFAULT, ATT_NOTIFICATION_OVERHEAD};
use super::measurement::{encode_frame, MeasurementFrame, MAX_BIOSIG_LEN};
use super::stack::{
    BleUuid, CharacteristicHandles, HvxError, NotificationSender, ServiceRegistrar, HVN_TX_DONE,
};
use super::{SendStatus, ServiceError};

/// Vendor base UUID of the biosignal service, little-endian.
pub const BIOSIG_BASE_UUID: [u8; 16] = [
    0x9b, 0x05, 0x00, 0x00, 0x6f, 0x92, 0x40, 0xda, 0xbf, 0xfe, 0xb0, 0x80, 0x9c, 0x5d, 0xd2,
    0xa2,
];

pub const BIOSIG_SERVICE_UUID: u16 = 0x0A00;
pub const BIOSIG_MEASUREMENT_CHAR_UUID: u16 = 0x0B00;

/// Samples in the all-zero initial characteristic value.
const INITIAL_FRAME_SAMPLES: usize = 38;

/// Subscription changes surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum BiosigServiceEvent {
    NotificationsEnabled,
    NotificationsDisabled,
}

pub struct BiosigService {
    conn_handle: Option<u16>,
    service_handle: u16,
    handles: CharacteristicHandles,
    /// Current payload budget: effective MTU minus the 3-byte ATT overhead.
    max_payload_len: usize,
    notify_enabled: bool,
}

impl BiosigService {
    /// Register the service and its notify-only measurement characteristic,
    /// installing an encoded all-zero initial value.
    ///
    /// The first registration failure aborts and propagates; a service left
    /// without its characteristic stays in the attribute table, since init
    /// failure is fatal at boot anyway.
    pub fn init<R: ServiceRegistrar>(registrar: &mut R) -> Result<Self, ServiceError> {
        let service_uuid = BleUuid::vendor(BIOSIG_BASE_UUID, BIOSIG_SERVICE_UUID);
        let char_uuid = BleUuid::vendor(BIOSIG_BASE_UUID, BIOSIG_MEASUREMENT_CHAR_UUID);

        let service_handle = registrar
            .register_service(service_uuid)
            .map_err(ServiceError::Register)?;

        let initial_frame = MeasurementFrame::zeroed(0, INITIAL_FRAME_SAMPLES);
        let mut initial = [0u8; MAX_BIOSIG_LEN];
        let init_len = encode_frame(&initial_frame, MAX_BIOSIG_LEN, &mut initial);

        let handles = registrar
            .add_notify_characteristic(
                service_handle,
                char_uuid,
                MAX_BIOSIG_LEN as u16,
                &initial[..init_len],
            )
            .map_err(ServiceError::Register)?;

        info!(
            "biosig service registered: service={} value={} cccd={}",
            service_handle, handles.value_handle, handles.cccd_handle
        );

        Ok(Self {
            conn_handle: None,
            service_handle,
            handles,
            max_payload_len: (ATT_MTU_DEFAULT as usize) - ATT_NOTIFICATION_OVERHEAD,
            notify_enabled: false,
        })
    }

    /// Feed one stack event through the service's state machine, returning
    /// a subscription event when the peer toggled the measurement CCCD.
    pub fn on_ble_event(&mut self, event: &BleEvent) -> Option<BiosigServiceEvent> {
        match event {
            BleEvent::Connected { conn_handle } => {
                self.conn_handle = Some(*conn_handle);
                self.max_payload_len = (ATT_MTU_DEFAULT as usize) - ATT_NOTIFICATION_OVERHEAD;
                // a completion latched on a dead link must not release the
                // first wait on this one
                HVN_TX_DONE.reset();
                debug!("biosig service: connected, handle {}", conn_handle);
                None
            }
            BleEvent::Disconnected { .. } => {
                self.conn_handle = None;
                self.notify_enabled = false;
                HVN_TX_DONE.reset();
                debug!("biosig service: disconnected");
                None
            }
            BleEvent::GattsWrite { handle, data, .. } => self.on_cccd_write(*handle, data),
            BleEvent::MtuUpdated { conn_handle, effective_mtu } => {
                self.on_mtu_updated(*conn_handle, *effective_mtu);
                None
            }
            BleEvent::HvnTxComplete { .. } => {
                HVN_TX_DONE.signal();
                None
            }
            BleEvent::Hvx { .. } => None,
        }
    }

    /// Recompute the payload budget after MTU negotiation. Events tagged
    /// with another link's handle are stale and ignored.
    pub fn on_mtu_updated(&mut self, conn_handle: u16, effective_mtu: u16) {
        if self.conn_handle == Some(conn_handle) {
            self.max_payload_len = (effective_mtu as usize) - ATT_NOTIFICATION_OVERHEAD;
            debug!(
                "biosig service: mtu {} -> payload budget {}",
                effective_mtu, self.max_payload_len
            );
        }
    }

    fn on_cccd_write(&mut self, handle: u16, data: &[u8]) -> Option<BiosigServiceEvent> {
        if handle != self.handles.cccd_handle || data.len() != 2 {
            return None;
        }

        let value = u16::from_le_bytes([data[0], data[1]]);
        self.notify_enabled = value & 0x0001 != 0;

        Some(if self.notify_enabled {
            info!("biosig service: notifications enabled");
            BiosigServiceEvent::NotificationsEnabled
        } else {
            info!("biosig service: notifications disabled");
            BiosigServiceEvent::NotificationsDisabled
        })
    }

    /// Encode `frame` and send it as one notification.
    ///
    /// Outcomes: `Sent` on a clean send; `DataSizeMismatch` when the stack
    /// accepted fewer bytes than requested; `FlushNeeded` when the transmit
    /// buffer was exhausted. On exhaustion the send is retried exactly once
    /// after a previous notification completes, and the caller must discard
    /// its sensor backlog rather than queue behind a congested link.
    pub async fn send_measurement<S: NotificationSender>(
        &mut self,
        sender: &mut S,
        frame: &MeasurementFrame,
    ) -> Result<SendStatus, ServiceError> {
        let conn_handle = self.conn_handle.ok_or(ServiceError::InvalidState)?;

        let mut buf = [0u8; MAX_BIOSIG_LEN];
        let len = encode_frame(frame, self.max_payload_len, &mut buf);
        if len == 0 {
            return Err(ServiceError::DataSizeMismatch);
        }
        let data = &buf[..len];

        match sender.notify(conn_handle, self.handles.value_handle, data) {
            Ok(written) if written == len => Ok(SendStatus::Sent),
            Ok(written) => {
                warn!("biosig service: stack truncated {} -> {} bytes", len, written);
                Err(ServiceError::DataSizeMismatch)
            }
            Err(HvxError::Resources) => {
                debug!("biosig service: tx buffers full, waiting for completion");
                sender.tx_done().await;

                // One bounded retry. Either way the producer has fallen
                // behind and must flush; a second failure drops this frame
                // with the rest of the backlog.
                if let Err(e) = sender.notify(conn_handle, self.handles.value_handle, data) {
                    warn!("biosig service: retry failed ({:?}), frame dropped", e);
                }
                Ok(SendStatus::FlushNeeded)
            }
            Err(HvxError::InvalidState) => Err(ServiceError::InvalidState),
            Err(e) => Err(ServiceError::Hvx(e)),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.conn_handle.is_some()
    }

    pub fn conn_handle(&self) -> Option<u16> {
        self.conn_handle
    }

    pub fn notify_enabled(&self) -> bool {
        self.notify_enabled
    }

    pub fn max_payload_len(&self) -> usize {
        self.max_payload_len
    }

    pub fn service_handle(&self) -> u16 {
        self.service_handle
    }

    pub fn handles(&self) -> CharacteristicHandles {
        self.handles
    }
}
