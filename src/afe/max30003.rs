//! MAX30003 Register Protocol and FIFO Handling
//!
//! The chip speaks fixed four-byte transactions: one command byte
//! (`address << 1 | direction`) followed by three data bytes, MSB first.
//! Reads clock the 24-bit register value out while the command shifts in,
//! so the first received byte is discarded.
//!
//! Transaction failures propagate the transport error unchanged; retry, if
//! any, belongs to the transport layer.

use defmt::{debug, info, warn};
use embassy_time::Timer;
use heapless::Vec;

use super::registers::{self, Etag, Status};
use crate::transport::{SensorBus, TransportError};

/// ECG sample rate configured by [`Max30003::init`]. Must agree with the
/// CNFG_ECG rate selector written there.
pub const SAMPLE_RATE_SPS: u32 = 256;

/// Sample period derived from the configured rate.
pub const SAMPLE_PERIOD_NS: u32 = 1_000_000_000 / SAMPLE_RATE_SPS;

/// The chip's sample queue holds at most 32 records.
pub const FIFO_CAPACITY: usize = 32;

/// Settle time after software reset before the chip accepts configuration.
const RESET_SETTLE_MS: u64 = 100;

/// R-to-R interval LSB in milliseconds (7.8125 ms at FMSTR = 32768 Hz).
pub const RTOR_LSB_MS_NUM: u32 = 625;
pub const RTOR_LSB_MS_DEN: u32 = 80;

/// Outcome of one FIFO drain pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, defmt::Format)]
pub struct DrainReport {
    /// Samples appended to the caller's buffer.
    pub read: usize,
    /// The drain hit the overflow tag; the FIFO was reset and samples
    /// acquired before the reset may have been lost.
    pub overflowed: bool,
}

/// Driver for one MAX30003 instance on a shared sensor bus.
pub struct Max30003<B: SensorBus> {
    bus: B,
    device: usize,
}

impl<B: SensorBus> Max30003<B> {
    pub fn new(bus: B, device: usize) -> Self {
        Self { bus, device }
    }

    /// Chip-select index of this instance on the bus.
    pub fn device(&self) -> usize {
        self.device
    }

    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// Read a 24-bit register.
    pub async fn read_register(&mut self, reg: u8) -> Result<u32, TransportError> {
        let tx = [(reg << 1) | registers::READ_FLAG, 0xFF, 0xFF, 0xFF];
        let mut rx = [0u8; registers::XFER_LEN];

        self.bus.transfer(self.device, &tx, &mut rx).await?;

        // rx[0] arrived while the command byte was shifting in; the register
        // value is the remaining three bytes, big-endian.
        Ok(((rx[1] as u32) << 16) | ((rx[2] as u32) << 8) | (rx[3] as u32))
    }

    /// Write a 24-bit register.
    pub async fn write_register(&mut self, reg: u8, value: u32) -> Result<(), TransportError> {
        let tx = [
            (reg << 1) | registers::WRITE_FLAG,
            (value >> 16) as u8,
            (value >> 8) as u8,
            value as u8,
        ];
        let mut rx = [0u8; registers::XFER_LEN];

        self.bus.transfer(self.device, &tx, &mut rx).await
    }

    /// Software reset, clearing all configuration registers.
    pub async fn reset(&mut self) -> Result<(), TransportError> {
        info!("AFE[{}]: software reset", self.device);
        self.write_register(registers::SW_RST, 0).await
    }

    pub async fn status(&mut self) -> Result<Status, TransportError> {
        self.read_register(registers::STATUS).await.map(Status)
    }

    /// Revision/part identification register.
    pub async fn info(&mut self) -> Result<u32, TransportError> {
        self.read_register(registers::INFO).await
    }

    pub async fn calibration(&mut self) -> Result<u32, TransportError> {
        self.read_register(registers::CNFG_CAL).await
    }

    /// Latest R-to-R interval in RTOR LSB units.
    pub async fn rtor(&mut self) -> Result<u32, TransportError> {
        let raw = self.read_register(registers::RTOR).await?;
        Ok(raw >> registers::RTOR_VALUE_SHIFT)
    }

    /// Flush the sample queue after an overflow or before (re)starting
    /// acquisition.
    pub async fn reset_fifo(&mut self) -> Result<(), TransportError> {
        self.write_register(registers::FIFO_RST, 0).await
    }

    /// Latch the configuration and start the synchronized sample clock.
    /// Data-ready interrupts begin after this; the caller must have
    /// registered its completion slot with [`super::irq`] first.
    pub async fn start_data(&mut self) -> Result<(), TransportError> {
        self.write_register(registers::SYNCH, 0).await
    }

    /// Bring the chip from power-on to streaming-ready.
    ///
    /// The write order matters: channel enable and bias routing (CNFG_GEN)
    /// must be in place before the mux connects the electrodes (CNFG_EMUX),
    /// and SYNCH must come last to latch everything at once.
    pub async fn init(&mut self) -> Result<(), TransportError> {
        self.reset().await?;
        Timer::after_millis(RESET_SETTLE_MS).await;

        // The datasheet requires one throwaway command between reset and
        // INFO; STATUS also clears sticky interrupt bits left from power-on.
        let status = self.status().await?;
        debug!("AFE[{}]: post-reset status {=u32:x}", self.device, status.0);

        let info = self.info().await?;
        info!("AFE[{}]: part info {=u32:x}", self.device, info);

        let cal = self.calibration().await?;
        debug!("AFE[{}]: calibration {=u32:x}", self.device, cal);

        let cnfg_gen = registers::GeneralConfig::new()
            .with_fmstr(0) // 32768 Hz master clock
            .with_en_ecg(true)
            .with_rbiasn(true)
            .with_rbiasp(true)
            .with_en_rbias(1)
            .with_imag(2) // 10 nA lead-off current
            .with_en_dcloff(1);
        self.write_register(registers::CNFG_GEN, cnfg_gen.bits()).await?;

        let cnfg_ecg = registers::EcgConfig::new()
            .with_dlpf(1) // 40 Hz low-pass
            .with_dhpf(true) // 0.5 Hz high-pass
            .with_gain(3) // 160 V/V
            .with_rate(1); // 256 sps, must match SAMPLE_RATE_SPS
        self.write_register(registers::CNFG_ECG, cnfg_ecg.bits()).await?;

        let mngr_int = registers::InterruptManagement::new()
            .with_efit(31) // assert EINT with a full 32-sample FIFO
            .with_clr_rrint(1); // clear RRINT on RTOR readback
        self.write_register(registers::MNGR_INT, mngr_int.bits()).await?;

        let en_int = registers::InterruptEnable::new()
            .with_en_eint(true)
            .with_en_rrint(false)
            .with_intb_type(3); // open-drain with internal pullup
        self.write_register(registers::EN_INT, en_int.bits()).await?;

        let cnfg_cal = registers::CalConfig::new()
            .with_thigh(0)
            .with_fifty(true)
            .with_fcal(2)
            .with_vmag(true)
            .with_vmode(true)
            .with_en_vcal(false);
        self.write_register(registers::CNFG_CAL, cnfg_cal.bits()).await?;

        let mngr_dyn = registers::DynamicModes::new().with_fast(0);
        self.write_register(registers::MNGR_DYN, mngr_dyn.bits()).await?;

        let cnfg_mux = registers::MuxConfig::new()
            .with_caln_sel(0)
            .with_calp_sel(0)
            .with_openn(false) // ECGN connected to the AFE channel
            .with_openp(false) // ECGP connected to the AFE channel
            .with_pol(false);
        self.write_register(registers::CNFG_EMUX, cnfg_mux.bits()).await?;

        self.write_register(registers::SYNCH, 0).await?;

        info!("AFE[{}]: configured, {} sps", self.device, SAMPLE_RATE_SPS);
        Ok(())
    }

    /// Read the sample queue until a terminal tag is seen.
    ///
    /// Valid and fast-recovery samples are appended to `samples` in arrival
    /// order. On the overflow tag the FIFO is reset and the report flags the
    /// loss so the caller can resynchronize its timestamps.
    pub async fn drain_fifo(
        &mut self,
        samples: &mut Vec<i16, FIFO_CAPACITY>,
    ) -> Result<DrainReport, TransportError> {
        let mut report = DrainReport { read: 0, overflowed: false };

        loop {
            let word = self.read_register(registers::ECG_FIFO).await?;
            let tag = Etag::from_fifo_word(word);

            if tag.carries_sample() {
                // A full caller buffer means EFIT was configured past the
                // caller's capacity; drop the rest rather than grow.
                if samples.push(registers::fifo_voltage(word)).is_ok() {
                    report.read += 1;
                }
            }

            if let Etag::Overflow = tag {
                warn!("AFE[{}]: FIFO overflow, resetting", self.device);
                self.reset_fifo().await?;
                report.overflowed = true;
            }

            if tag.is_terminal() {
                break;
            }
        }

        debug!("AFE[{}]: drained {} samples", self.device, report.read);
        Ok(report)
    }
}
