//! OBC housekeeping: power-bus voltages and currents from the board ADC.

use crate::config::HousekeepingConfig;
use crate::dispatcher::get_current_timestamp_ns;
use crate::shutdown::ShutdownListener;
use crate::sink::TelemetrySink;
use cdh_shared::LineBuilder;
use std::error::Error;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

pub type AdcError = Box<dyn Error + Send + Sync>;

pub const ADC_CHANNELS: usize = 8;
/// Single-ended conversion command for channel 0; channel n adds `0x10 * n`.
#[cfg_attr(not(feature = "raspberry_pi"), allow(dead_code))]
pub const ADC_COMMAND: u8 = 0x8C;
const ADC_VREF: f64 = 2.5;
const ADC_FULL_SCALE: f64 = 4096.0;

pub trait AdcSource: Send {
    /// Put the converter in its sampling mode.
    fn setup(&mut self) -> Result<(), AdcError>;
    /// Raw 12-bit count of one channel.
    fn read_channel(&mut self, channel: u8) -> Result<u16, AdcError>;
}

#[cfg(feature = "raspberry_pi")]
mod real {
    use super::{ADC_COMMAND, AdcError, AdcSource};
    use rppal::i2c::I2c;
    use std::time::Duration;

    pub struct I2cAdc {
        bus: I2c,
    }

    impl I2cAdc {
        pub fn open(bus: u8, address: u16) -> Result<Self, AdcError> {
            let mut bus = I2c::with_bus(bus)?;
            bus.set_slave_address(address)?;
            Ok(Self { bus })
        }
    }

    impl AdcSource for I2cAdc {
        fn setup(&mut self) -> Result<(), AdcError> {
            self.bus.write(&[ADC_COMMAND])?;
            std::thread::sleep(Duration::from_millis(5));
            Ok(())
        }

        fn read_channel(&mut self, channel: u8) -> Result<u16, AdcError> {
            let mut raw = [0u8; 2];
            self.bus
                .write_read(&[ADC_COMMAND + 0x10 * channel], &mut raw)?;
            Ok(u16::from_be_bytes(raw))
        }
    }
}

#[cfg(feature = "raspberry_pi")]
pub fn open_adc(cfg: &HousekeepingConfig) -> Result<Box<dyn AdcSource>, AdcError> {
    Ok(Box::new(real::I2cAdc::open(cfg.i2c_bus, cfg.i2c_address)?))
}

#[cfg(not(feature = "raspberry_pi"))]
pub fn open_adc(_cfg: &HousekeepingConfig) -> Result<Box<dyn AdcSource>, AdcError> {
    Err("built without raspberry_pi support, no ADC available".into())
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ObcReading {
    pub vb: f64,
    pub ib: f64,
    pub v5: f64,
    pub i5: f64,
}

fn to_volts(raw: u16) -> f64 {
    f64::from(raw) * ADC_VREF / ADC_FULL_SCALE
}

impl ObcReading {
    pub fn from_raw(raw: &[u16; ADC_CHANNELS]) -> Self {
        let v = raw.map(to_volts);
        Self {
            v5: v[0] * 2.0,
            vb: v[1] * 5.255319,
            i5: v[4] * 5.255319,
            ib: v[5] / 0.30060,
        }
    }

    pub fn to_line(&self, timestamp_ns: u64) -> String {
        let mut line = LineBuilder::new("housekeepingOBC").tag("source", "OBC");
        line.field("VB", self.vb)
            .field("IB", self.ib)
            .field("V5", self.v5)
            .field("I5", self.i5);
        line.finish(timestamp_ns)
    }
}

/// Read every channel. A failed read re-arms the ADC and zeroes the sample.
pub fn sample(adc: &mut dyn AdcSource) -> [u16; ADC_CHANNELS] {
    let mut raw = [0u16; ADC_CHANNELS];
    for (channel, slot) in (0u8..).zip(raw.iter_mut()) {
        match adc.read_channel(channel) {
            Ok(value) => *slot = value,
            Err(e) => {
                warn!(channel, "ADC read failed, re-running setup: {e}");
                if let Err(e) = adc.setup() {
                    debug!("ADC setup failed: {e}");
                }
                return [0; ADC_CHANNELS];
            }
        }
    }
    raw
}

/// Time until the next wall-clock multiple of `period`.
fn until_next_boundary(period: Duration) -> Duration {
    let period_ns = period.as_nanos().max(1);
    let now_ns = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    let wait = period_ns - now_ns % period_ns;
    Duration::from_nanos(u64::try_from(wait).unwrap_or(u64::MAX))
}

pub async fn housekeeping_task(
    adc: Box<dyn AdcSource>,
    period: Duration,
    sink: TelemetrySink,
    mut shutdown: ShutdownListener,
) -> anyhow::Result<()> {
    // Bus transfers and the setup settle time block, so they run off the runtime.
    let mut adc = tokio::task::spawn_blocking(move || {
        let mut adc = adc;
        if let Err(e) = adc.setup() {
            warn!("ADC setup failed, will retry after the first failed read: {e}");
        }
        adc
    })
    .await?;
    info!(period_secs = period.as_secs(), "OBC housekeeping started");
    loop {
        tokio::select! {
            _ = shutdown.triggered() => break,
            _ = tokio::time::sleep(until_next_boundary(period)) => {}
        }
        let (returned, raw) = tokio::task::spawn_blocking(move || {
            let raw = sample(adc.as_mut());
            (adc, raw)
        })
        .await?;
        adc = returned;
        let reading = ObcReading::from_raw(&raw);
        debug!(?reading, "OBC housekeeping sample");
        sink.publish(reading.to_line(get_current_timestamp_ns()));
    }
    info!("OBC housekeeping stopped");
    Ok(())
}
