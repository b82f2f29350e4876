//! Common test utilities and setup for embedded tests
//!
//! Shared by all defmt-test based test binaries:
//! - Critical section implementation and panic/logger hookup
//! - Heap setup for proptest's alloc feature
//! - Scripted mocks for the sensor bus and the link-stack primitives

// Re-export commonly used items for tests (except conflicting macros)
pub use defmt_rtt as _; // global logger
// Use nrf-softdevice which provides both interrupt vectors and critical section
pub use nrf_softdevice as _;
pub use panic_probe as _; // panic handler
pub use {embassy_futures as _, embassy_nrf as _, embassy_sync as _, embassy_time as _};

// Global allocator for proptest (required for alloc feature in no_std)
pub extern crate alloc;
use core::sync::atomic::{AtomicBool, Ordering};

pub use embedded_alloc::LlffHeap as Heap;
use heapless::index_map::FnvIndexMap;
use heapless::Vec;

use nrf52832_s132_biosig::afe::registers;
use nrf52832_s132_biosig::ble::events::BleEvent;
use nrf52832_s132_biosig::ble::stack::{
    BleUuid, CharacteristicHandles, HvxError, NotificationSender, RegisterError,
    ServiceRegistrar,
};
use nrf52832_s132_biosig::transport::{SensorBus, TransportError};

#[global_allocator]
pub static HEAP: Heap = Heap::empty();

// Global allocator backing store - 8KB heap
pub static mut HEAP_MEM: [u8; 8192] = [0; 8192];

static HEAP_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Ensure heap is initialized exactly once (thread-safe)
pub fn ensure_heap_initialized() {
    if !HEAP_INITIALIZED.swap(true, Ordering::Relaxed) {
        unsafe {
            let ptr = core::ptr::addr_of_mut!(HEAP_MEM) as *mut u8;
            HEAP.init(ptr as usize, HEAP_MEM.len());
        }
    }
}

/// Byte the mock clocks out while the command byte shifts in. Deliberately
/// junk: drivers must discard it.
pub const MOCK_ECHO_BYTE: u8 = 0x5A;

/// FIFO word with the empty tag; the voltage field is meaningless.
pub const MOCK_FIFO_EMPTY: u32 = 0x6 << 3;

/// Build an ECG_FIFO word from a sample voltage and a 3-bit tag.
pub fn fifo_word(sample: i16, tag: u8) -> u32 {
    ((sample as u16 as u32) << 8) | (((tag & 0x7) as u32) << 3)
}

/// Scripted in-memory sensor bus speaking the 4-byte register transaction
/// format: register writes land in a map and an ordered log, register reads
/// serve from the map, ECG_FIFO reads pop a scripted word sequence.
pub struct MockBus {
    regs: FnvIndexMap<u8, u32, 32>,
    /// Register writes in issue order.
    pub writes: Vec<(u8, u32), 64>,
    /// Raw TX buffers exactly as sent.
    pub raw_tx: Vec<[u8; 4], 64>,
    fifo_script: Vec<u32, 64>,
    fifo_at: usize,
    /// Fail the next transfer with this error, once.
    pub fail_next: Option<TransportError>,
}

impl MockBus {
    pub fn new() -> Self {
        Self {
            regs: FnvIndexMap::new(),
            writes: Vec::new(),
            raw_tx: Vec::new(),
            fifo_script: Vec::new(),
            fifo_at: 0,
            fail_next: None,
        }
    }

    /// Queue FIFO words returned by successive ECG_FIFO reads; once
    /// exhausted the FIFO reads as empty.
    pub fn script_fifo(&mut self, words: &[u32]) {
        self.fifo_script.clear();
        self.fifo_at = 0;
        for &word in words {
            self.fifo_script.push(word).unwrap();
        }
    }

    pub fn reg(&self, addr: u8) -> Option<u32> {
        self.regs.get(&addr).copied()
    }

    /// Addresses written, in order.
    pub fn written_addrs(&self) -> Vec<u8, 64> {
        let mut addrs = Vec::new();
        for &(addr, _) in &self.writes {
            addrs.push(addr).unwrap();
        }
        addrs
    }

    fn next_fifo_word(&mut self) -> u32 {
        match self.fifo_script.get(self.fifo_at) {
            Some(&word) => {
                self.fifo_at += 1;
                word
            }
            None => MOCK_FIFO_EMPTY,
        }
    }
}

impl SensorBus for MockBus {
    async fn transfer(
        &mut self,
        _device: usize,
        tx: &[u8],
        rx: &mut [u8],
    ) -> Result<(), TransportError> {
        if let Some(error) = self.fail_next.take() {
            return Err(error);
        }

        let mut raw = [0u8; 4];
        raw[..tx.len().min(4)].copy_from_slice(&tx[..tx.len().min(4)]);
        self.raw_tx.push(raw).unwrap();

        let command = tx[0];
        let addr = command >> 1;

        if command & registers::READ_FLAG != 0 {
            let value = if addr == registers::ECG_FIFO {
                self.next_fifo_word()
            } else {
                self.reg(addr).unwrap_or(0)
            };
            rx[0] = MOCK_ECHO_BYTE;
            rx[1] = (value >> 16) as u8;
            rx[2] = (value >> 8) as u8;
            rx[3] = value as u8;
        } else {
            let value =
                ((tx[1] as u32) << 16) | ((tx[2] as u32) << 8) | (tx[3] as u32);
            self.writes.push((addr, value)).unwrap();
            let _ = self.regs.insert(addr, value);

            if addr == registers::FIFO_RST {
                // Hardware drops whatever the queue still held.
                self.fifo_script.clear();
                self.fifo_at = 0;
            }
        }

        Ok(())
    }
}

/// One scripted outcome for a notify call.
#[derive(Clone, Copy)]
pub enum NotifyOutcome {
    Accept,
    /// Stack accepted only this many bytes.
    AcceptPartial(usize),
    Fail(HvxError),
}

/// Scripted notification sender. Outcomes are consumed in order; once the
/// script runs dry every notify succeeds.
pub struct MockSender {
    script: Vec<NotifyOutcome, 8>,
    script_at: usize,
    /// Every notify attempt: connection, value handle, payload copy.
    pub sent: Vec<(u16, u16, Vec<u8, 256>), 8>,
    pub notify_calls: usize,
    pub tx_done_calls: usize,
}

impl MockSender {
    pub fn new() -> Self {
        Self {
            script: Vec::new(),
            script_at: 0,
            sent: Vec::new(),
            notify_calls: 0,
            tx_done_calls: 0,
        }
    }

    pub fn with_script(outcomes: &[NotifyOutcome]) -> Self {
        let mut sender = Self::new();
        for &outcome in outcomes {
            sender.script.push(outcome).unwrap();
        }
        sender
    }

    pub fn last_payload(&self) -> &[u8] {
        let (_, _, payload) = self.sent.last().unwrap();
        payload
    }
}

impl NotificationSender for MockSender {
    fn notify(
        &mut self,
        conn_handle: u16,
        value_handle: u16,
        data: &[u8],
    ) -> Result<usize, HvxError> {
        self.notify_calls += 1;

        let mut copy = Vec::new();
        copy.extend_from_slice(data).unwrap();
        self.sent.push((conn_handle, value_handle, copy)).unwrap();

        let outcome = self
            .script
            .get(self.script_at)
            .copied()
            .unwrap_or(NotifyOutcome::Accept);
        self.script_at += 1;

        match outcome {
            NotifyOutcome::Accept => Ok(data.len()),
            NotifyOutcome::AcceptPartial(n) => Ok(n),
            NotifyOutcome::Fail(error) => Err(error),
        }
    }

    async fn tx_done(&mut self) {
        self.tx_done_calls += 1;
    }
}

/// Recording service registrar handing out deterministic handles.
pub struct MockRegistrar {
    pub services: Vec<(BleUuid, u16), 4>,
    pub characteristics: Vec<(u16, BleUuid, u16, Vec<u8, 256>), 4>,
    next_handle: u16,
    pub fail_service_add: Option<u32>,
    pub fail_characteristic_add: Option<u32>,
}

impl MockRegistrar {
    pub fn new() -> Self {
        Self {
            services: Vec::new(),
            characteristics: Vec::new(),
            next_handle: 0x10,
            fail_service_add: None,
            fail_characteristic_add: None,
        }
    }

    fn record_characteristic(
        &mut self,
        service_handle: u16,
        uuid: BleUuid,
        max_len: u16,
        initial: &[u8],
    ) -> Result<CharacteristicHandles, RegisterError> {
        if let Some(code) = self.fail_characteristic_add {
            return Err(RegisterError::CharacteristicAdd(code));
        }

        let mut value = Vec::new();
        value.extend_from_slice(initial).unwrap();
        self.characteristics
            .push((service_handle, uuid, max_len, value))
            .unwrap();

        let value_handle = self.next_handle;
        self.next_handle += 2;
        Ok(CharacteristicHandles { value_handle, cccd_handle: value_handle + 1 })
    }
}

impl ServiceRegistrar for MockRegistrar {
    fn register_service(&mut self, uuid: BleUuid) -> Result<u16, RegisterError> {
        if let Some(code) = self.fail_service_add {
            return Err(RegisterError::ServiceAdd(code));
        }
        let handle = self.next_handle;
        self.next_handle += 2;
        self.services.push((uuid, handle)).unwrap();
        Ok(handle)
    }

    fn add_notify_characteristic(
        &mut self,
        service_handle: u16,
        uuid: BleUuid,
        max_len: u16,
        initial: &[u8],
    ) -> Result<CharacteristicHandles, RegisterError> {
        self.record_characteristic(service_handle, uuid, max_len, initial)
    }

    fn add_read_characteristic(
        &mut self,
        service_handle: u16,
        uuid: BleUuid,
        initial: &[u8],
    ) -> Result<CharacteristicHandles, RegisterError> {
        self.record_characteristic(service_handle, uuid, initial.len() as u16, initial)
    }
}

/// A peer CCCD write event, 2 bytes little-endian.
pub fn cccd_write(conn_handle: u16, handle: u16, value: u16) -> BleEvent {
    let mut data = Vec::new();
    data.extend_from_slice(&value.to_le_bytes()).unwrap();
    BleEvent::GattsWrite { conn_handle, handle, data }
}
