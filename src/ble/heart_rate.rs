//! Heart-Rate Variant Service
//!
//! Streams heart-rate sample batches instead of raw biosignal frames:
//! `[u32 total-count LE][u8 timer-period][u8 count][count x u16 LE]`.
//! Also buffers R-to-R intervals in a fixed ring that evicts the oldest
//! entry on overflow, and carries the optional body-sensor-location
//! characteristic.

use defmt::{info, warn};

use super::events::{BleEvent, ATT_MTU_DEFAULT, ATT_NOTIFICATION_OVERHEAD};
use super::stack::{
    BleUuid, CharacteristicHandles, HvxError, NotificationSender, ServiceRegistrar,
};
use super::ServiceError;

pub const HEART_RATE_SERVICE_UUID: u16 = 0x180D;
pub const HEART_RATE_MEASUREMENT_CHAR_UUID: u16 = 0x2A37;
pub const BODY_SENSOR_LOCATION_CHAR_UUID: u16 = 0x2A38;

/// Largest encodable measurement at the stack's configured MTU.
pub const MAX_HRM_LEN: usize = 244;

/// `[u32 total-count][u8 timer-period][u8 count]`.
pub const HRM_HEADER_LEN: usize = 6;

/// R-to-R intervals retained between sends.
pub const MAX_BUFFERED_RR_INTERVALS: usize = 20;

/// Encode a heart-rate batch, dropping trailing samples that exceed
/// `max_payload`. Returns the encoded length, zero if the header itself
/// does not fit.
pub fn encode_heart_rate(
    samples: &[u16],
    total_count: u32,
    timer_period: u8,
    max_payload: usize,
    buf: &mut [u8],
) -> usize {
    let budget = max_payload.min(buf.len());
    if budget < HRM_HEADER_LEN {
        return 0;
    }

    let fit = (budget - HRM_HEADER_LEN) / 2;
    let count = samples.len().min(fit).min(u8::MAX as usize);

    buf[0..4].copy_from_slice(&total_count.to_le_bytes());
    buf[4] = timer_period;
    buf[5] = count as u8;

    let mut len = HRM_HEADER_LEN;
    for sample in &samples[..count] {
        buf[len..len + 2].copy_from_slice(&sample.to_le_bytes());
        len += 2;
    }

    len
}

/// Fixed-capacity R-to-R interval buffer with oldest-first eviction.
pub struct RrBuffer {
    intervals: [u16; MAX_BUFFERED_RR_INTERVALS],
    count: usize,
}

impl RrBuffer {
    pub const fn new() -> Self {
        Self { intervals: [0; MAX_BUFFERED_RR_INTERVALS], count: 0 }
    }

    /// Append an interval; when full, the oldest value is shifted out so
    /// the most recent `MAX_BUFFERED_RR_INTERVALS` survive in order.
    pub fn push(&mut self, rr_interval: u16) {
        if self.count == MAX_BUFFERED_RR_INTERVALS {
            self.intervals.copy_within(1.., 0);
            self.count -= 1;
        }
        self.intervals[self.count] = rr_interval;
        self.count += 1;
    }

    pub fn is_full(&self) -> bool {
        self.count == MAX_BUFFERED_RR_INTERVALS
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn as_slice(&self) -> &[u16] {
        &self.intervals[..self.count]
    }

    pub fn clear(&mut self) {
        self.count = 0;
    }
}

impl Default for RrBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Subscription changes surfaced to the application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub enum HeartRateEvent {
    NotificationsEnabled,
    NotificationsDisabled,
}

/// Init-time options.
pub struct HeartRateConfig {
    /// Registers the body-sensor-location characteristic when set.
    pub body_sensor_location: Option<u8>,
    pub sensor_contact_supported: bool,
}

pub struct HeartRateService {
    conn_handle: Option<u16>,
    service_handle: u16,
    hrm_handles: CharacteristicHandles,
    bsl_handle: Option<u16>,
    max_hrm_len: usize,
    notify_enabled: bool,
    rr: RrBuffer,
    sensor_contact_supported: bool,
    sensor_contact_detected: bool,
}

impl HeartRateService {
    /// Register the heart-rate service. The first failure propagates with
    /// no rollback, like the biosignal service.
    pub fn init<R: ServiceRegistrar>(
        registrar: &mut R,
        config: &HeartRateConfig,
    ) -> Result<Self, ServiceError> {
        let service_handle = registrar
            .register_service(BleUuid::Uuid16(HEART_RATE_SERVICE_UUID))
            .map_err(ServiceError::Register)?;

        let mut initial = [0u8; MAX_HRM_LEN];
        let init_len = encode_heart_rate(&[0u16; 32], 0, 5, MAX_HRM_LEN, &mut initial);

        let hrm_handles = registrar
            .add_notify_characteristic(
                service_handle,
                BleUuid::Uuid16(HEART_RATE_MEASUREMENT_CHAR_UUID),
                MAX_HRM_LEN as u16,
                &initial[..init_len],
            )
            .map_err(ServiceError::Register)?;

        let bsl_handle = match config.body_sensor_location {
            Some(location) => {
                let handles = registrar
                    .add_read_characteristic(
                        service_handle,
                        BleUuid::Uuid16(BODY_SENSOR_LOCATION_CHAR_UUID),
                        &[location],
                    )
                    .map_err(ServiceError::Register)?;
                Some(handles.value_handle)
            }
            None => None,
        };

        info!("heart-rate service registered: service={}", service_handle);

        Ok(Self {
            conn_handle: None,
            service_handle,
            hrm_handles,
            bsl_handle,
            max_hrm_len: (ATT_MTU_DEFAULT as usize) - ATT_NOTIFICATION_OVERHEAD,
            notify_enabled: false,
            rr: RrBuffer::new(),
            sensor_contact_supported: config.sensor_contact_supported,
            sensor_contact_detected: false,
        })
    }

    pub fn on_ble_event(&mut self, event: &BleEvent) -> Option<HeartRateEvent> {
        match event {
            BleEvent::Connected { conn_handle } => {
                self.conn_handle = Some(*conn_handle);
                self.max_hrm_len = (ATT_MTU_DEFAULT as usize) - ATT_NOTIFICATION_OVERHEAD;
                None
            }
            BleEvent::Disconnected { .. } => {
                self.conn_handle = None;
                self.notify_enabled = false;
                None
            }
            BleEvent::GattsWrite { handle, data, .. } => {
                if *handle != self.hrm_handles.cccd_handle || data.len() != 2 {
                    return None;
                }
                let value = u16::from_le_bytes([data[0], data[1]]);
                self.notify_enabled = value & 0x0001 != 0;
                Some(if self.notify_enabled {
                    HeartRateEvent::NotificationsEnabled
                } else {
                    HeartRateEvent::NotificationsDisabled
                })
            }
            BleEvent::MtuUpdated { conn_handle, effective_mtu } => {
                if self.conn_handle == Some(*conn_handle) {
                    self.max_hrm_len = (*effective_mtu as usize) - ATT_NOTIFICATION_OVERHEAD;
                }
                None
            }
            _ => None,
        }
    }

    /// Send one heart-rate batch. No flow-control retry on this path: a
    /// congested link surfaces as an error and the caller skips the batch.
    pub fn send_measurement<S: NotificationSender>(
        &mut self,
        sender: &mut S,
        samples: &[u16],
        total_count: u32,
        timer_period: u8,
    ) -> Result<(), ServiceError> {
        let conn_handle = self.conn_handle.ok_or(ServiceError::InvalidState)?;

        let mut buf = [0u8; MAX_HRM_LEN];
        let len = encode_heart_rate(samples, total_count, timer_period, self.max_hrm_len, &mut buf);
        if len == 0 {
            return Err(ServiceError::DataSizeMismatch);
        }

        match sender.notify(conn_handle, self.hrm_handles.value_handle, &buf[..len]) {
            Ok(written) if written == len => Ok(()),
            Ok(written) => {
                warn!("heart-rate service: stack truncated {} -> {}", len, written);
                Err(ServiceError::DataSizeMismatch)
            }
            Err(HvxError::InvalidState) => Err(ServiceError::InvalidState),
            Err(e) => Err(ServiceError::Hvx(e)),
        }
    }

    /// Buffer an R-to-R interval for the next send.
    pub fn rr_interval_add(&mut self, rr_interval: u16) {
        self.rr.push(rr_interval);
    }

    pub fn rr_buffer(&self) -> &RrBuffer {
        &self.rr
    }

    pub fn rr_buffer_mut(&mut self) -> &mut RrBuffer {
        &mut self.rr
    }

    /// Only allowed while disconnected; the supported flag is part of the
    /// advertised characteristic semantics.
    pub fn set_sensor_contact_supported(&mut self, supported: bool) -> Result<(), ServiceError> {
        if self.conn_handle.is_some() {
            return Err(ServiceError::InvalidState);
        }
        self.sensor_contact_supported = supported;
        Ok(())
    }

    pub fn set_sensor_contact_detected(&mut self, detected: bool) {
        self.sensor_contact_detected = detected;
    }

    pub fn sensor_contact_supported(&self) -> bool {
        self.sensor_contact_supported
    }

    pub fn sensor_contact_detected(&self) -> bool {
        self.sensor_contact_detected
    }

    pub fn notify_enabled(&self) -> bool {
        self.notify_enabled
    }

    pub fn max_hrm_len(&self) -> usize {
        self.max_hrm_len
    }

    pub fn service_handle(&self) -> u16 {
        self.service_handle
    }

    pub fn hrm_handles(&self) -> CharacteristicHandles {
        self.hrm_handles
    }

    pub fn body_sensor_location_handle(&self) -> Option<u16> {
        self.bsl_handle
    }
}
