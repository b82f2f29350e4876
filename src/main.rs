#![no_std]
#![no_main]

//! Biosignal wearable firmware: one ECG AFE streaming into the BLE
//! measurement service.
//!
//! Control flow: the AFE's watermark interrupt signals the data-ready slot;
//! the sampling task drains the FIFO into a timestamped frame and hands it
//! to the BLE task over a bounded channel; the BLE task encodes and
//! notifies, and raises the flush signal back to the sampling task when the
//! stack's transmit buffers fill up.

use defmt::{error, info, unwrap, warn};
use defmt_rtt as _;
use embassy_executor::Spawner;
use embassy_futures::select::{select, Either};
use embassy_nrf::gpio::{Input, Level, Output, OutputDrive, Pull};
use embassy_nrf::gpiote::{InputChannel, InputChannelPolarity};
use embassy_nrf::{bind_interrupts, interrupt, peripherals, spim};
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use embassy_sync::signal::Signal;
use embassy_time::Instant;
use heapless::Vec;
use nrf_softdevice::ble::advertisement_builder::{
    Flag, LegacyAdvertisementBuilder, LegacyAdvertisementPayload,
};
use nrf_softdevice::ble::{gatt_server, Connection};
use nrf_softdevice::{Config as SdConfig, Softdevice};
use panic_probe as _;

use nrf52832_s132_biosig::afe::max30003::{Max30003, FIFO_CAPACITY};
use nrf52832_s132_biosig::afe::irq;
use nrf52832_s132_biosig::ble::biosig_service::{BiosigService, BiosigServiceEvent};
use nrf52832_s132_biosig::ble::events::{BleEvent, MAX_EVENT_DATA};
use nrf52832_s132_biosig::ble::measurement::{MeasurementFrame, SampleTriplet};
use nrf52832_s132_biosig::ble::stack::{SoftdeviceNotifier, SoftdeviceRegistrar};
use nrf52832_s132_biosig::ble::SendStatus;
use nrf52832_s132_biosig::transport::{Completion, SpimBus};

bind_interrupts!(struct Irqs {
    TWISPI0 => spim::InterruptHandler<peripherals::TWISPI0>;
});

/// AFE wiring (pca10040 layout).
const AFE_DEVICE: usize = 0;
const AFE_INTB_PIN: u8 = 25;

type SensorSpi = SpimBus<'static, peripherals::TWISPI0, 1>;

/// Data-ready rendezvous signaled from the INTB edge.
static DATA_READY: Completion = Completion::new();

/// Frames queued toward the BLE task. Capacity 2: when the link stalls we
/// drop at the producer rather than buffer without bound.
static FRAME_CHANNEL: Channel<CriticalSectionRawMutex, MeasurementFrame, 2> = Channel::new();

/// Raised by the BLE task when the stack exhausted its transmit buffers;
/// the sampling task discards its backlog instead of falling behind.
static FLUSH_REQUEST: Signal<CriticalSectionRawMutex, ()> = Signal::new();

/// Stack events pending dispatch into the service state machine.
static BLE_EVENT_CHANNEL: Channel<CriticalSectionRawMutex, BleEvent, 8> = Channel::new();

/// GATT server surface: translates attribute writes into [`BleEvent`]s.
struct BiosigServer;

impl gatt_server::Server for BiosigServer {
    type Event = BleEvent;

    fn on_write(
        &self,
        conn: &Connection,
        handle: u16,
        _op: gatt_server::WriteOp,
        _offset: usize,
        data: &[u8],
    ) -> Option<Self::Event> {
        let conn_handle = conn.handle().unwrap_or(0);
        let mut payload: Vec<u8, MAX_EVENT_DATA> = Vec::new();
        if payload.extend_from_slice(data).is_err() {
            warn!("gatt write of {} bytes exceeds event buffer", data.len());
            return None;
        }
        Some(BleEvent::GattsWrite { conn_handle, handle, data: payload })
    }
}

#[embassy_executor::main]
async fn main(spawner: Spawner) {
    info!("starting biosignal firmware");

    let mut nrf_config = embassy_nrf::config::Config::default();
    // Keep app interrupts off the SoftDevice's reserved priority levels.
    nrf_config.gpiote_interrupt_priority = interrupt::Priority::P2;
    nrf_config.time_interrupt_priority = interrupt::Priority::P2;
    let p = embassy_nrf::init(nrf_config);

    let sd_config = SdConfig {
        clock: Some(nrf_softdevice::raw::nrf_clock_lf_cfg_t {
            source: nrf_softdevice::raw::NRF_CLOCK_LF_SRC_XTAL as u8,
            rc_ctiv: 0,
            rc_temp_ctiv: 0,
            accuracy: nrf_softdevice::raw::NRF_CLOCK_LF_ACCURACY_20_PPM as u8,
        }),
        conn_gap: Some(nrf_softdevice::raw::ble_gap_conn_cfg_t {
            conn_count: 1,
            event_length: 24,
        }),
        conn_gatt: Some(nrf_softdevice::raw::ble_gatt_conn_cfg_t { att_mtu: 247 }),
        gatts_attr_tab_size: Some(nrf_softdevice::raw::ble_gatts_cfg_attr_tab_size_t {
            attr_tab_size: 1408,
        }),
        gap_role_count: Some(nrf_softdevice::raw::ble_gap_cfg_role_count_t {
            adv_set_count: 1,
            periph_role_count: 1,
            central_role_count: 0,
            central_sec_count: 0,
            _bitfield_1: Default::default(),
        }),
        ..Default::default()
    };

    let sd = Softdevice::enable(&sd_config);

    let mut registrar = SoftdeviceRegistrar::new();
    let service = match BiosigService::init(&mut registrar) {
        Ok(service) => service,
        Err(e) => {
            // Fatal: a half-registered service is not worth running with.
            error!("biosig service init failed: {:?}", e);
            defmt::panic!("service registration failed");
        }
    };

    // Sensor bus: SPIM with a dedicated chip-select per AFE instance.
    let mut spi_config = spim::Config::default();
    spi_config.frequency = spim::Frequency::M1;
    spi_config.mode = spim::MODE_0;
    let spi = spim::Spim::new(p.TWISPI0, Irqs, p.P0_26, p.P0_29, p.P0_27, spi_config);
    let cs = Output::new(p.P0_28, Level::High, OutputDrive::Standard);
    let bus = SpimBus::new(spi, [cs]);
    let afe = Max30003::new(bus, AFE_DEVICE);

    // INTB: falling edge on the open-drain interrupt line.
    let intb = InputChannel::new(
        p.GPIOTE_CH0,
        Input::new(p.P0_25, Pull::Up),
        InputChannelPolarity::HiToLo,
    );

    unwrap!(spawner.spawn(softdevice_task(sd)));
    unwrap!(spawner.spawn(intb_task(intb)));
    unwrap!(spawner.spawn(sampling_task(afe)));
    unwrap!(spawner.spawn(ble_task(sd, service)));

    info!("system initialized");
}

#[embassy_executor::task]
async fn softdevice_task(sd: &'static Softdevice) -> ! {
    sd.run().await
}

/// Bridge the INTB edge into the data-ready dispatch registry.
#[embassy_executor::task]
async fn intb_task(intb: InputChannel<'static>) -> ! {
    loop {
        intb.wait().await;
        irq::dispatch(AFE_INTB_PIN);
    }
}

/// Drain the AFE on every watermark interrupt and queue frames for the BLE
/// task. Honors flush requests by discarding the drained backlog.
#[embassy_executor::task]
async fn sampling_task(mut afe: Max30003<SensorSpi>) {
    if let Err(e) = irq::with_registry(|r| r.register(AFE_DEVICE, AFE_INTB_PIN, &DATA_READY)) {
        error!("data-ready registration failed: {:?}", e);
        return;
    }

    if let Err(e) = afe.init().await {
        error!("AFE init failed: {:?}", e);
        irq::with_registry(|r| r.unregister(AFE_DEVICE));
        return;
    }

    if let Err(e) = afe.start_data().await {
        error!("AFE start failed: {:?}", e);
        return;
    }

    let mut dropped: u32 = 0;
    loop {
        DATA_READY.wait().await;

        let mut samples: Vec<i16, FIFO_CAPACITY> = Vec::new();
        let report = match afe.drain_fifo(&mut samples).await {
            Ok(report) => report,
            Err(e) => {
                error!("FIFO drain failed: {:?}", e);
                continue;
            }
        };

        if FLUSH_REQUEST.try_take().is_some() {
            // The link fell behind; this drain restarts the watermark
            // interrupt, the samples go to the floor.
            info!("flushing {} backlogged samples", report.read);
            continue;
        }

        if report.overflowed {
            warn!("sample loss: AFE FIFO overflowed");
        }

        if samples.is_empty() {
            continue;
        }

        // Wire cells carry three 16-bit lanes; the single ECG channel packs
        // three consecutive samples per cell, order preserved.
        let mut frame = MeasurementFrame::new(Instant::now().as_micros());
        for lanes in samples.chunks(3) {
            let cell = SampleTriplet::new(
                lanes[0],
                lanes.get(1).copied().unwrap_or(0),
                lanes.get(2).copied().unwrap_or(0),
            );
            if !frame.push(cell) {
                break;
            }
        }

        if FRAME_CHANNEL.try_send(frame).is_err() {
            dropped = dropped.wrapping_add(1);
            warn!("frame queue full, dropped (total {})", dropped);
        }
    }
}

/// Advertise, then pump stack events and measurement frames through the
/// service until the peer disconnects.
#[embassy_executor::task]
async fn ble_task(sd: &'static Softdevice, mut service: BiosigService) {
    static ADV_DATA: LegacyAdvertisementPayload = LegacyAdvertisementBuilder::new()
        .flags(&[Flag::GeneralDiscovery, Flag::LE_Only])
        .full_name("BioSig-ECG")
        .build();
    static SCAN_DATA: LegacyAdvertisementPayload = LegacyAdvertisementBuilder::new().build();

    let server = BiosigServer;

    loop {
        let config = nrf_softdevice::ble::peripheral::Config::default();
        let adv = nrf_softdevice::ble::peripheral::ConnectableAdvertisement::ScannableUndirected {
            adv_data: &ADV_DATA,
            scan_data: &SCAN_DATA,
        };

        let conn =
            match nrf_softdevice::ble::peripheral::advertise_connectable(sd, adv, &config).await {
                Ok(conn) => conn,
                Err(e) => {
                    error!("advertising failed: {:?}", defmt::Debug2Format(&e));
                    continue;
                }
            };

        let conn_handle = conn.handle().unwrap_or(0);
        info!("peer connected, handle {}", conn_handle);

        service.on_ble_event(&BleEvent::Connected { conn_handle });
        service.on_mtu_updated(conn_handle, conn.att_mtu());

        let mut sender = SoftdeviceNotifier::new(&conn);

        let gatt_fut = gatt_server::run(&conn, &server, |event| {
            if BLE_EVENT_CHANNEL.try_send(event).is_err() {
                warn!("ble event queue full, event dropped");
            }
        });

        let pump_fut = async {
            loop {
                match select(BLE_EVENT_CHANNEL.receive(), FRAME_CHANNEL.receive()).await {
                    Either::First(event) => {
                        if let Some(evt) = service.on_ble_event(&event) {
                            match evt {
                                BiosigServiceEvent::NotificationsEnabled => {
                                    info!("streaming enabled by peer")
                                }
                                BiosigServiceEvent::NotificationsDisabled => {
                                    info!("streaming disabled by peer")
                                }
                            }
                        }
                    }
                    Either::Second(frame) => {
                        if !service.notify_enabled() {
                            continue;
                        }
                        match service.send_measurement(&mut sender, &frame).await {
                            Ok(SendStatus::Sent) => {}
                            Ok(SendStatus::FlushNeeded) => FLUSH_REQUEST.signal(()),
                            Err(e) => warn!("measurement send failed: {:?}", e),
                        }
                    }
                }
            }
        };

        match select(gatt_fut, pump_fut).await {
            Either::First(e) => {
                info!("gatt server exited: {:?}", defmt::Debug2Format(&e));
            }
            Either::Second(_) => {}
        }

        service.on_ble_event(&BleEvent::Disconnected { conn_handle });
    }
}
