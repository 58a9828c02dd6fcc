use std::fmt;
use time::{Duration, OffsetDateTime};

/// Two samples closer than this many seconds are the same logical sample.
pub const TIME_RESOLUTION_SECS: i64 = 5;

/// Battery level reported for samples that come from the device history.
pub const BATTERY_UNKNOWN: i16 = -1;

/// Coarse air quality classification derived from the CO2 concentration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Quality {
    Good,
    Average,
    Bad,
}

impl Quality {
    /// Classify a CO2 concentration in ppm
    pub fn from_co2(co2: u16) -> Self {
        match co2 {
            0..=999 => Quality::Good,
            1000..=1399 => Quality::Average,
            _ => Quality::Bad,
        }
    }

    /// Map the quality code the device reports alongside a live reading
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            1 => Some(Quality::Good),
            2 => Some(Quality::Average),
            3 => Some(Quality::Bad),
            _ => None,
        }
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Quality::Good => "good",
            Quality::Average => "average",
            Quality::Bad => "bad",
        };
        f.write_str(s)
    }
}

/// One environmental measurement
///
/// Built either from a live read or as one element of a reconstructed
/// history batch. Quality is not stored: it is always recomputed from `co2`.
#[derive(Debug, Clone, PartialEq)]
pub struct Sample {
    pub time: OffsetDateTime,
    pub co2: u16,
    pub temperature: f64,
    pub pressure: f64,
    pub humidity: u8,
    pub battery: i16,
    pub interval: Duration,
}

impl Sample {
    pub fn quality(&self) -> Quality {
        Quality::from_co2(self.co2)
    }

    /// Whether `self` lies strictly before `other`, outside the tolerance window
    pub fn is_before(&self, other: &Sample) -> bool {
        let a = self.time.unix_timestamp();
        let b = other.time.unix_timestamp();
        if (a - b).abs() < TIME_RESOLUTION_SECS {
            return false;
        }
        a < b
    }
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: CO2={} ppm ({}), T={:.2}°C, H={}%, P={:.1} hPa, battery={}%, interval={}s",
            crate::utils::format_datetime(&self.time),
            self.co2,
            self.quality(),
            self.temperature,
            self.humidity,
            self.pressure,
            self.battery,
            self.interval.whole_seconds(),
        )
    }
}

/// Sort samples ascending by time
pub fn sort_by_time(samples: &mut [Sample]) {
    samples.sort_by_key(|s| s.time);
}
