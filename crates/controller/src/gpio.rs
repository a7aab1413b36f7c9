//! Hardware I/O capability: channel addressing and the board behind it.
//! The `gpio` feature gates the real MCP3008 + relay driver; without it, a
//! simulated board with fixed baselines is compiled in so the controller
//! runs anywhere.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Mutex;

use serde::{Serialize, Serializer};

// ---------------------------------------------------------------------------
// Zone and channel identifiers
// ---------------------------------------------------------------------------

/// One of the four monitored soil areas sharing the single pump.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ZoneId(u8);

impl ZoneId {
    pub const ALL: [ZoneId; 4] = [ZoneId(1), ZoneId(2), ZoneId(3), ZoneId(4)];

    pub fn new(n: u8) -> Option<Self> {
        (1..=4).contains(&n).then_some(ZoneId(n))
    }

    pub fn get(self) -> u8 {
        self.0
    }

    /// Zero-based index for the fixed-size zone tables.
    pub fn index(self) -> usize {
        (self.0 - 1) as usize
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A readable sensor channel. Soil and level are percentage channels and
/// need calibration bounds; board temperature is a fixed transform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Channel {
    Soil(ZoneId),
    Level,
    BoardTemp,
}

impl Channel {
    pub fn all() -> [Channel; 6] {
        [
            Channel::Soil(ZoneId::ALL[0]),
            Channel::Soil(ZoneId::ALL[1]),
            Channel::Soil(ZoneId::ALL[2]),
            Channel::Soil(ZoneId::ALL[3]),
            Channel::Level,
            Channel::BoardTemp,
        ]
    }

    /// Percentage channels are the ones the calibration wizard applies to.
    pub fn is_percentage(self) -> bool {
        !matches!(self, Channel::BoardTemp)
    }

    /// MCP3008 input index for analog channels (soil on 0-3, level on 4).
    #[cfg(feature = "gpio")]
    fn adc_index(self) -> Option<u8> {
        match self {
            Channel::Soil(zone) => Some(zone.index() as u8),
            Channel::Level => Some(4),
            Channel::BoardTemp => None,
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Channel::Soil(zone) => write!(f, "soil{zone}"),
            Channel::Level => write!(f, "level"),
            Channel::BoardTemp => write!(f, "temp"),
        }
    }
}

impl FromStr for Channel {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "level" => Ok(Channel::Level),
            "temp" => Ok(Channel::BoardTemp),
            _ => {
                let zone = s
                    .strip_prefix("soil")
                    .and_then(|n| n.parse::<u8>().ok())
                    .and_then(ZoneId::new)
                    .ok_or(())?;
                Ok(Channel::Soil(zone))
            }
        }
    }
}

impl Serialize for Channel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IoError {
    /// Transport-level failure (SPI/GPIO bus).
    Bus(String),
    /// The bounded read window expired.
    Timeout,
    /// The source does not exist on this machine (e.g. no thermal sensor).
    Unavailable(String),
}

impl fmt::Display for IoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoError::Bus(e) => write!(f, "bus error: {e}"),
            IoError::Timeout => write!(f, "i/o timed out"),
            IoError::Unavailable(what) => write!(f, "unavailable: {what}"),
        }
    }
}

impl std::error::Error for IoError {}

// ---------------------------------------------------------------------------
// The board capability
// ---------------------------------------------------------------------------

/// Bounded-time access to the sensor channels and the single pump output.
/// The pump interlock is the only caller of the pump methods.
pub trait Board: Send + Sync {
    fn read_raw(&self, channel: Channel) -> Result<i64, IoError>;
    fn set_pump(&self, on: bool) -> Result<(), IoError>;
    /// Read-back path so the interlock can confirm the relay state.
    fn pump_is_on(&self) -> Result<bool, IoError>;
}

/// Board temperature in millidegrees Celsius via the host's thermal
/// sensors. Missing sensors surface as `Unavailable`, which the reader
/// turns into an invalid reading rather than a crash.
fn read_cpu_temp_millis() -> Result<i64, IoError> {
    let components = sysinfo::Components::new_with_refreshed_list();
    let component = components
        .iter()
        .find(|c| {
            let label = c.label().to_ascii_lowercase();
            label.contains("cpu") || label.contains("package") || label.contains("soc")
        })
        .or_else(|| components.iter().next())
        .ok_or_else(|| IoError::Unavailable("no temperature component".to_string()))?;
    Ok((f64::from(component.temperature()) * 1000.0) as i64)
}

// ---------------------------------------------------------------------------
// Real board (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------

#[cfg(feature = "gpio")]
pub use real::RelayBoard;

#[cfg(feature = "gpio")]
mod real {
    use super::*;
    use rppal::gpio::{Gpio, OutputPin};
    use rppal::spi::{Bus, Mode, SlaveSelect, Spi};

    /// MCP3008 over SPI for the analog channels, one relay output pin for
    /// the pump. Many relay boards are active-low.
    pub struct RelayBoard {
        spi: Mutex<Spi>,
        relay: Mutex<OutputPin>,
        active_low: bool,
    }

    impl RelayBoard {
        pub fn new(relay_pin: u8, active_low: bool) -> anyhow::Result<Self> {
            let spi = Spi::new(Bus::Spi0, SlaveSelect::Ss0, 1_350_000, Mode::Mode0)?;
            let mut relay = Gpio::new()?.get(relay_pin)?.into_output();

            // Fail-safe: pump OFF before anything else runs
            if active_low {
                relay.set_high();
            } else {
                relay.set_low();
            }

            tracing::info!(relay_pin, active_low, "relay board initialised");

            Ok(Self {
                spi: Mutex::new(spi),
                relay: Mutex::new(relay),
                active_low,
            })
        }

        /// Single-ended MCP3008 read: start bit, channel select, 10-bit
        /// result in the low bits of the reply.
        fn read_adc(&self, index: u8) -> Result<i64, IoError> {
            let mut spi = self.spi.lock().unwrap_or_else(|p| p.into_inner());
            let tx = [1u8, (8 + index) << 4, 0];
            let mut rx = [0u8; 3];
            spi.transfer(&mut rx, &tx)
                .map_err(|e| IoError::Bus(e.to_string()))?;
            Ok(i64::from(rx[1] & 0x03) << 8 | i64::from(rx[2]))
        }
    }

    impl Board for RelayBoard {
        fn read_raw(&self, channel: Channel) -> Result<i64, IoError> {
            match channel.adc_index() {
                Some(index) => self.read_adc(index),
                None => read_cpu_temp_millis(),
            }
        }

        fn set_pump(&self, on: bool) -> Result<(), IoError> {
            let mut relay = self.relay.lock().unwrap_or_else(|p| p.into_inner());
            // active-low relay: LOW = ON, HIGH = OFF
            if on != self.active_low {
                relay.set_high();
            } else {
                relay.set_low();
            }
            Ok(())
        }

        fn pump_is_on(&self) -> Result<bool, IoError> {
            let relay = self.relay.lock().unwrap_or_else(|p| p.into_inner());
            Ok(relay.is_set_high() != self.active_low)
        }
    }
}

// ---------------------------------------------------------------------------
// Simulated board (development — no hardware)
// ---------------------------------------------------------------------------

/// Fixed analog baselines spanning the default calibration range, real
/// board temperature from the host. Zone 2 starts dry so a dev run has
/// something to do once it is calibrated.
pub struct SimBoard {
    values: Mutex<HashMap<Channel, i64>>,
    pump_on: Mutex<bool>,
}

impl SimBoard {
    pub fn new() -> Self {
        let mut values = HashMap::new();
        values.insert(Channel::Soil(ZoneId::ALL[0]), 450);
        values.insert(Channel::Soil(ZoneId::ALL[1]), 650);
        values.insert(Channel::Soil(ZoneId::ALL[2]), 350);
        values.insert(Channel::Soil(ZoneId::ALL[3]), 550);
        values.insert(Channel::Level, 512);
        Self {
            values: Mutex::new(values),
            pump_on: Mutex::new(false),
        }
    }
}

impl Board for SimBoard {
    fn read_raw(&self, channel: Channel) -> Result<i64, IoError> {
        if channel == Channel::BoardTemp {
            return read_cpu_temp_millis();
        }
        let values = self.values.lock().unwrap_or_else(|p| p.into_inner());
        values
            .get(&channel)
            .copied()
            .ok_or_else(|| IoError::Unavailable(format!("channel {channel}")))
    }

    fn set_pump(&self, on: bool) -> Result<(), IoError> {
        let mut pump = self.pump_on.lock().unwrap_or_else(|p| p.into_inner());
        *pump = on;
        tracing::debug!(on, "[sim] pump output set");
        Ok(())
    }

    fn pump_is_on(&self) -> Result<bool, IoError> {
        Ok(*self.pump_on.lock().unwrap_or_else(|p| p.into_inner()))
    }
}

// ---------------------------------------------------------------------------
// Mock board (tests — full control over values and failure modes)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use mock::MockBoard;

#[cfg(test)]
mod mock {
    use super::*;
    use std::collections::HashSet;

    #[derive(Default)]
    struct MockInner {
        values: HashMap<Channel, i64>,
        fail_reads: HashSet<Channel>,
        fail_pump: bool,
        pump_on: bool,
        readback: Option<bool>,
        pump_writes: Vec<bool>,
    }

    pub struct MockBoard {
        inner: Mutex<MockInner>,
    }

    impl MockBoard {
        /// All channels readable with sane defaults: moist soil, half tank,
        /// 45 °C board.
        pub fn new() -> Self {
            let mut values = HashMap::new();
            values.insert(Channel::Soil(ZoneId::ALL[0]), 450);
            values.insert(Channel::Soil(ZoneId::ALL[1]), 650);
            values.insert(Channel::Soil(ZoneId::ALL[2]), 350);
            values.insert(Channel::Soil(ZoneId::ALL[3]), 550);
            values.insert(Channel::Level, 512);
            values.insert(Channel::BoardTemp, 45_000);
            Self {
                inner: Mutex::new(MockInner {
                    values,
                    ..MockInner::default()
                }),
            }
        }

        pub fn set_value(&self, channel: Channel, raw: i64) {
            let mut g = self.inner.lock().unwrap();
            g.values.insert(channel, raw);
        }

        pub fn fail_read(&self, channel: Channel) {
            self.inner.lock().unwrap().fail_reads.insert(channel);
        }

        pub fn fail_pump(&self, fail: bool) {
            self.inner.lock().unwrap().fail_pump = fail;
        }

        /// Force what `pump_is_on` reports, regardless of actual writes.
        pub fn set_readback(&self, forced: Option<bool>) {
            self.inner.lock().unwrap().readback = forced;
        }

        pub fn pump_on(&self) -> bool {
            self.inner.lock().unwrap().pump_on
        }

        pub fn pump_writes(&self) -> Vec<bool> {
            self.inner.lock().unwrap().pump_writes.clone()
        }
    }

    impl Board for MockBoard {
        fn read_raw(&self, channel: Channel) -> Result<i64, IoError> {
            let g = self.inner.lock().unwrap();
            if g.fail_reads.contains(&channel) {
                return Err(IoError::Timeout);
            }
            g.values
                .get(&channel)
                .copied()
                .ok_or_else(|| IoError::Unavailable(format!("channel {channel}")))
        }

        fn set_pump(&self, on: bool) -> Result<(), IoError> {
            let mut g = self.inner.lock().unwrap();
            if g.fail_pump {
                return Err(IoError::Bus("relay write failed".to_string()));
            }
            g.pump_on = on;
            g.pump_writes.push(on);
            Ok(())
        }

        fn pump_is_on(&self) -> Result<bool, IoError> {
            let g = self.inner.lock().unwrap();
            Ok(g.readback.unwrap_or(g.pump_on))
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
