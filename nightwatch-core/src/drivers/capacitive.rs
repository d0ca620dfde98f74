//! Capacitive / BCG board driver (I²C ADC).
//!
//! The under-mattress board exposes one 16-bit conversion register. We poll
//! it at the configured rate (100 Hz default) and hand the detector 100 ms
//! blocks. The driver is generic over the `embedded-hal` I²C trait so tests
//! run against a scripted fake bus; production uses `linux-embedded-hal`.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use embedded_hal::i2c::I2c;

use crate::clock::SharedClock;
use crate::drivers::{AdcBlock, DriverError, SensorDriver};
use crate::events::DetectorId;

/// Conversion register of the ADC.
const CONVERSION_REG: u8 = 0x00;

/// Samples per `read()` block (100 ms at the configured rate).
const BLOCK_FRACTION: u32 = 10;

/// Calibration pass length.
const CALIBRATION_SECS: u64 = 5;

type Opener<B> = Box<dyn FnMut() -> Result<B, DriverError> + Send>;

pub struct CapacitiveDriver<B: I2c + Send> {
    open: Opener<B>,
    bus: Option<B>,
    address: u8,
    sample_rate: u32,
    clock: SharedClock,
    ticker: Option<tokio::time::Interval>,
}

impl<B: I2c + Send> CapacitiveDriver<B> {
    pub fn new(
        open: Opener<B>,
        address: u8,
        sample_rate: u32,
        clock: SharedClock,
    ) -> Self {
        Self {
            open,
            bus: None,
            address,
            sample_rate: sample_rate.max(1),
            clock,
            ticker: None,
        }
    }

    fn sample(&mut self) -> Result<f32, DriverError> {
        let bus = self
            .bus
            .as_mut()
            .ok_or_else(|| DriverError::Fatal("adc not connected".into()))?;
        let mut raw = [0u8; 2];
        bus.write_read(self.address, &[CONVERSION_REG], &mut raw)
            .map_err(|e| DriverError::Transient(format!("i2c read: {e:?}")))?;
        let value = i16::from_be_bytes(raw);
        Ok(value as f32 / i16::MAX as f32)
    }

    async fn collect(&mut self, count: usize) -> Result<Vec<f32>, DriverError> {
        let mut samples = Vec::with_capacity(count);
        for _ in 0..count {
            self.ticker
                .as_mut()
                .ok_or_else(|| DriverError::Fatal("adc not connected".into()))?
                .tick()
                .await;
            samples.push(self.sample()?);
        }
        Ok(samples)
    }
}

#[cfg(feature = "i2c-linux")]
impl CapacitiveDriver<linux_embedded_hal::I2cdev> {
    /// Production constructor over a Linux I²C character device.
    pub fn linux(
        bus_path: impl Into<String>,
        address: u8,
        sample_rate: u32,
        clock: SharedClock,
    ) -> Self {
        let path = bus_path.into();
        Self::new(
            Box::new(move || {
                linux_embedded_hal::I2cdev::new(&path)
                    .map_err(|e| DriverError::Fatal(format!("open {path}: {e}")))
            }),
            address,
            sample_rate,
            clock,
        )
    }
}

#[async_trait]
impl<B: I2c + Send> SensorDriver for CapacitiveDriver<B> {
    type Frame = AdcBlock;

    fn id(&self) -> DetectorId {
        DetectorId::Capacitive
    }

    async fn connect(&mut self) -> Result<(), DriverError> {
        let mut bus = (self.open)()?;
        // Probe transaction: a dead or mis-addressed board fails here, not
        // mid-session.
        let mut raw = [0u8; 2];
        bus.write_read(self.address, &[CONVERSION_REG], &mut raw)
            .map_err(|e| DriverError::Fatal(format!("adc probe at 0x{:02x}: {e:?}", self.address)))?;
        self.bus = Some(bus);

        let period = Duration::from_secs_f64(1.0 / self.sample_rate as f64);
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        self.ticker = Some(ticker);
        tracing::info!(address = self.address, rate = self.sample_rate, "adc connected");
        Ok(())
    }

    async fn disconnect(&mut self) {
        self.bus = None;
        self.ticker = None;
    }

    async fn read(&mut self) -> Result<AdcBlock, DriverError> {
        let count = (self.sample_rate / BLOCK_FRACTION).max(1) as usize;
        let samples = self.collect(count).await?;
        Ok(AdcBlock {
            timestamp: self.clock.now_monotonic(),
            samples,
            sample_rate: self.sample_rate,
        })
    }

    /// Learn bed-occupancy levels.
    ///
    /// Samples for a few seconds while the operator follows the in/out
    /// prompt, then derives empty and occupied RMS levels from the quietest
    /// and loudest half-second chunks.
    async fn calibrate(&mut self) -> Result<BTreeMap<String, f64>, DriverError> {
        if self.bus.is_none() {
            self.connect().await?;
        }
        let total = (self.sample_rate as u64 * CALIBRATION_SECS) as usize;
        let samples = self.collect(total).await?;

        let chunk = (self.sample_rate as usize / 2).max(1);
        let mut levels: Vec<f32> = samples
            .chunks(chunk)
            .map(crate::dsp::stats::rms)
            .collect();
        levels.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));

        let empty = *levels.first().unwrap_or(&0.0) as f64;
        let occupied = *levels.last().unwrap_or(&0.0) as f64;
        // A flat pass (nobody moved) falls back to a multiple of the floor.
        let threshold = if occupied > empty * 2.0 {
            (empty + occupied) / 2.0
        } else {
            (empty * 3.0).max(1e-4)
        };

        let mut params = BTreeMap::new();
        params.insert("empty_rms".to_string(), empty);
        params.insert("occupied_rms".to_string(), occupied);
        params.insert("occupancy_threshold".to_string(), threshold);
        Ok(params)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use embedded_hal::i2c::{ErrorType, Operation};

    /// Scripted bus: returns a sine sweep, big-endian i16 per conversion.
    struct FakeI2c {
        n: usize,
        amplitude: f32,
    }

    impl ErrorType for FakeI2c {
        type Error = core::convert::Infallible;
    }

    impl I2c for FakeI2c {
        fn transaction(
            &mut self,
            _address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            for op in operations {
                if let Operation::Read(buf) = op {
                    let phase = self.n as f32 * 0.1;
                    let value = (phase.sin() * self.amplitude * i16::MAX as f32) as i16;
                    buf.copy_from_slice(&value.to_be_bytes());
                    self.n += 1;
                }
            }
            Ok(())
        }
    }

    fn driver(amplitude: f32) -> CapacitiveDriver<FakeI2c> {
        CapacitiveDriver::new(
            Box::new(move || Ok(FakeI2c { n: 0, amplitude })),
            0x48,
            100,
            ManualClock::shared(0.0),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn read_yields_hundred_ms_blocks() {
        let mut d = driver(0.5);
        d.connect().await.expect("connect");
        let block = d.read().await.expect("block");
        assert_eq!(block.samples.len(), 10);
        assert_eq!(block.sample_rate, 100);
        assert!(block.samples.iter().any(|&s| s.abs() > 0.01));
    }

    #[tokio::test(start_paused = true)]
    async fn read_without_connect_is_fatal() {
        let mut d = driver(0.5);
        let err = d.read().await.expect_err("must fail");
        assert!(err.is_fatal());
    }

    #[tokio::test(start_paused = true)]
    async fn calibrate_learns_a_positive_threshold() {
        let mut d = driver(0.4);
        let params = d.calibrate().await.expect("calibrate");
        let threshold = params["occupancy_threshold"];
        assert!(threshold > 0.0);
        assert!(params["occupied_rms"] >= params["empty_rms"]);
    }
}
