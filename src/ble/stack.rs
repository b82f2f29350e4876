//! Link-Stack Primitives
//!
//! The SoftDevice is consumed through three narrow contracts: service and
//! characteristic registration, the notification-send primitive, and the
//! TX-complete rendezvous used by the flow-control path. The traits here
//! are those contracts; [`SoftdeviceRegistrar`] and [`SoftdeviceNotifier`]
//! implement them over `nrf-softdevice`, and tests substitute scripted
//! implementations.

use defmt::Format;
use embassy_futures::select::select;
use embassy_time::Timer;
use nrf_softdevice::ble::gatt_server::{self, NotifyValueError};
use nrf_softdevice::ble::Connection;
use nrf_softdevice::{raw, RawError};

use crate::transport::Completion;

/// UUIDs used for registration and discovery matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum BleUuid {
    Uuid16(u16),
    /// Vendor UUID, little-endian, with the 16-bit short code occupying
    /// bytes 12..14.
    Uuid128([u8; 16]),
}

impl BleUuid {
    /// Vendor-specific UUID: insert the short code into bytes 12..14 of the
    /// little-endian 128-bit base.
    pub const fn vendor(base: [u8; 16], short: u16) -> Self {
        let mut uuid = base;
        uuid[12] = short as u8;
        uuid[13] = (short >> 8) as u8;
        BleUuid::Uuid128(uuid)
    }

    /// The 16-bit code carried inside the UUID.
    pub const fn short(&self) -> u16 {
        match self {
            BleUuid::Uuid16(short) => *short,
            BleUuid::Uuid128(bytes) => u16::from_le_bytes([bytes[12], bytes[13]]),
        }
    }
}

/// Handles of one registered characteristic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub struct CharacteristicHandles {
    pub value_handle: u16,
    /// `ATT_HANDLE_INVALID` when the characteristic has no CCCD.
    pub cccd_handle: u16,
}

/// Registration failure, carrying the stack's raw error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum RegisterError {
    UuidAdd(u32),
    ServiceAdd(u32),
    CharacteristicAdd(u32),
}

/// The characteristic-registration primitive.
///
/// Callers issue the calls in order and stop at the first failure; nothing
/// here rolls a partially registered service back.
pub trait ServiceRegistrar {
    fn register_service(&mut self, uuid: BleUuid) -> Result<u16, RegisterError>;

    /// Add a notify-only, variable-length characteristic with its CCCD.
    fn add_notify_characteristic(
        &mut self,
        service_handle: u16,
        uuid: BleUuid,
        max_len: u16,
        initial: &[u8],
    ) -> Result<CharacteristicHandles, RegisterError>;

    /// Add a fixed-length read-only characteristic.
    fn add_read_characteristic(
        &mut self,
        service_handle: u16,
        uuid: BleUuid,
        initial: &[u8],
    ) -> Result<CharacteristicHandles, RegisterError>;
}

/// Notification-send failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Format)]
pub enum HvxError {
    /// The stack's transmit buffer is full; retry after a TX completion.
    Resources,
    /// The link cannot carry a notification right now (disconnected, or
    /// the peer has not enabled notifications).
    InvalidState,
    /// Any other stack error, unmapped.
    Raw(u32),
}

/// The notification-send primitive plus the TX-complete rendezvous.
pub trait NotificationSender {
    /// Issue a handle-value notification. Returns the number of bytes the
    /// stack accepted, which can be less than `data.len()` when the stack
    /// truncates to its internal limit.
    fn notify(
        &mut self,
        conn_handle: u16,
        value_handle: u16,
        data: &[u8],
    ) -> Result<usize, HvxError>;

    /// Resolve once a previously queued notification has left the transmit
    /// buffer. Callers use this after [`HvxError::Resources`].
    async fn tx_done(&mut self);
}

/// Completion slot released by `BleEvent::HvnTxComplete`. Whoever dispatches
/// stack events signals it through the service's event intake; the sender
/// adapters wait on it.
pub static HVN_TX_DONE: Completion = Completion::new();

fn sec_mode_open() -> raw::ble_gap_conn_sec_mode_t {
    let mut mode: raw::ble_gap_conn_sec_mode_t = unsafe { core::mem::zeroed() };
    mode.set_sm(1);
    mode.set_lv(1);
    mode
}

/// Registration adapter over the raw SoftDevice attribute-table calls,
/// the same two-phase service-add/characteristic-add sequence the GATT
/// server exposes.
pub struct SoftdeviceRegistrar {
    /// Vendor base already registered with the stack, short bytes masked.
    vs_base: Option<([u8; 16], u8)>,
}

impl SoftdeviceRegistrar {
    pub fn new() -> Self {
        Self { vs_base: None }
    }

    /// Resolve a [`BleUuid`] to the stack's `ble_uuid_t`, registering the
    /// vendor base on first use.
    fn resolve_uuid(&mut self, uuid: BleUuid) -> Result<raw::ble_uuid_t, RegisterError> {
        match uuid {
            BleUuid::Uuid16(short) => Ok(raw::ble_uuid_t {
                uuid: short,
                type_: raw::BLE_UUID_TYPE_BLE as u8,
            }),
            BleUuid::Uuid128(bytes) => {
                let mut base = bytes;
                base[12] = 0;
                base[13] = 0;

                let type_ = match self.vs_base {
                    Some((registered, type_)) if registered == base => type_,
                    _ => {
                        let vs = raw::ble_uuid128_t { uuid128: base };
                        let mut type_: u8 = 0;
                        let ret = unsafe { raw::sd_ble_uuid_vs_add(&vs, &mut type_) };
                        if ret != raw::NRF_SUCCESS {
                            return Err(RegisterError::UuidAdd(ret));
                        }
                        self.vs_base = Some((base, type_));
                        type_
                    }
                };

                Ok(raw::ble_uuid_t { uuid: uuid.short(), type_ })
            }
        }
    }

    fn add_characteristic(
        &mut self,
        service_handle: u16,
        uuid: BleUuid,
        max_len: u16,
        initial: &[u8],
        notify: bool,
    ) -> Result<CharacteristicHandles, RegisterError> {
        let char_uuid = self.resolve_uuid(uuid)?;

        let mut cccd_md: raw::ble_gatts_attr_md_t = unsafe { core::mem::zeroed() };
        cccd_md.read_perm = sec_mode_open();
        cccd_md.write_perm = sec_mode_open();
        cccd_md.set_vloc(raw::BLE_GATTS_VLOC_STACK as u8);

        let mut char_md: raw::ble_gatts_char_md_t = unsafe { core::mem::zeroed() };
        if notify {
            char_md.char_props.set_notify(1);
            char_md.p_cccd_md = &mut cccd_md;
        } else {
            char_md.char_props.set_read(1);
        }

        let mut attr_md: raw::ble_gatts_attr_md_t = unsafe { core::mem::zeroed() };
        attr_md.read_perm = sec_mode_open();
        attr_md.write_perm = sec_mode_open();
        attr_md.set_vloc(raw::BLE_GATTS_VLOC_STACK as u8);
        attr_md.set_vlen(notify as u8);

        let mut attr_value: raw::ble_gatts_attr_t = unsafe { core::mem::zeroed() };
        attr_value.p_uuid = &char_uuid;
        attr_value.p_attr_md = &attr_md;
        attr_value.init_len = initial.len() as u16;
        attr_value.init_offs = 0;
        attr_value.max_len = max_len;
        attr_value.p_value = initial.as_ptr() as *mut u8;

        let mut handles: raw::ble_gatts_char_handles_t = unsafe { core::mem::zeroed() };
        let ret = unsafe {
            raw::sd_ble_gatts_characteristic_add(
                service_handle,
                &char_md,
                &attr_value,
                &mut handles,
            )
        };
        if ret != raw::NRF_SUCCESS {
            return Err(RegisterError::CharacteristicAdd(ret));
        }

        Ok(CharacteristicHandles {
            value_handle: handles.value_handle,
            cccd_handle: handles.cccd_handle,
        })
    }
}

impl Default for SoftdeviceRegistrar {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceRegistrar for SoftdeviceRegistrar {
    fn register_service(&mut self, uuid: BleUuid) -> Result<u16, RegisterError> {
        let service_uuid = self.resolve_uuid(uuid)?;
        let mut handle: u16 = 0;
        let ret = unsafe {
            raw::sd_ble_gatts_service_add(
                raw::BLE_GATTS_SRVC_TYPE_PRIMARY as u8,
                &service_uuid,
                &mut handle,
            )
        };
        if ret != raw::NRF_SUCCESS {
            return Err(RegisterError::ServiceAdd(ret));
        }
        Ok(handle)
    }

    fn add_notify_characteristic(
        &mut self,
        service_handle: u16,
        uuid: BleUuid,
        max_len: u16,
        initial: &[u8],
    ) -> Result<CharacteristicHandles, RegisterError> {
        self.add_characteristic(service_handle, uuid, max_len, initial, true)
    }

    fn add_read_characteristic(
        &mut self,
        service_handle: u16,
        uuid: BleUuid,
        initial: &[u8],
    ) -> Result<CharacteristicHandles, RegisterError> {
        self.add_characteristic(service_handle, uuid, initial.len() as u16, initial, false)
    }
}

/// Upper bound on the TX-complete wait. The binding consumes
/// `HVN_TX_COMPLETE` internally, so when no event plumbing signals
/// [`HVN_TX_DONE`] the adapter falls back to waiting out roughly one
/// connection event.
const TX_DONE_FALLBACK_MS: u64 = 30;

/// Notification adapter bound to one live connection.
pub struct SoftdeviceNotifier<'a> {
    conn: &'a Connection,
}

impl<'a> SoftdeviceNotifier<'a> {
    pub fn new(conn: &'a Connection) -> Self {
        Self { conn }
    }
}

impl NotificationSender for SoftdeviceNotifier<'_> {
    fn notify(
        &mut self,
        _conn_handle: u16,
        value_handle: u16,
        data: &[u8],
    ) -> Result<usize, HvxError> {
        match gatt_server::notify_value(self.conn, value_handle, data) {
            // The binding checks the accepted length itself, so a
            // successful return means the full payload went out.
            Ok(()) => Ok(data.len()),
            Err(NotifyValueError::Raw(RawError::Resources)) => Err(HvxError::Resources),
            Err(NotifyValueError::Raw(RawError::InvalidState)) => Err(HvxError::InvalidState),
            Err(NotifyValueError::Raw(raw)) => Err(HvxError::Raw(raw as u32)),
            // Disconnected and friends: nothing to retry on this link.
            Err(_) => Err(HvxError::InvalidState),
        }
    }

    async fn tx_done(&mut self) {
        select(HVN_TX_DONE.wait(), Timer::after_millis(TX_DONE_FALLBACK_MS)).await;
    }
}
