/// High-level access to one Aranet4 device over a link session
use log::{debug, info, warn};
use std::collections::HashSet;
use std::time::Duration as StdDuration;
use time::Duration;

use crate::bluetooth::history::{self, HistoryInfo};
use crate::bluetooth::link::{Attribute, Link, LinkError, LinkSession};
use crate::bluetooth::protocol::{self, CurrentReading};
use crate::error::Result;
use crate::models::Sample;

pub struct Aranet4<S: LinkSession> {
    address: String,
    session: S,
    attributes: HashSet<Attribute>,
}

impl<S: LinkSession> Aranet4<S> {
    /// Connect to `address` and discover its attributes
    pub async fn open<L>(link: &L, address: &str, timeout: StdDuration) -> Result<Self>
    where
        L: Link<Session = S>,
    {
        let mut session = link.connect(address, timeout).await?;
        info!("Connected to device {}", address);

        let attributes = match session.discover().await {
            Ok(attributes) => attributes,
            Err(e) => {
                if let Err(e) = session.disconnect().await {
                    warn!("Failed to disconnect from {}: {}", address, e);
                }
                return Err(e.into());
            }
        };
        debug!("Discovered {} attributes on {}", attributes.len(), address);

        Ok(Aranet4 {
            address: address.to_string(),
            session,
            attributes,
        })
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    async fn read(&mut self, attribute: Attribute) -> Result<Vec<u8>> {
        if !self.attributes.contains(&attribute) {
            return Err(LinkError::AttributeNotFound(attribute).into());
        }
        Ok(self.session.read(attribute).await?)
    }

    async fn read_seconds(&mut self, attribute: Attribute) -> Result<Duration> {
        let raw = self.read(attribute).await?;
        let secs = protocol::decode_u16(&raw, "seconds value")?;
        Ok(Duration::seconds(secs as i64))
    }

    /// Advertised device name
    pub async fn name(&mut self) -> Result<String> {
        let raw = self.read(Attribute::DeviceName).await?;
        Ok(String::from_utf8_lossy(&raw).trim_end_matches('\0').to_string())
    }

    /// Firmware revision string
    pub async fn version(&mut self) -> Result<String> {
        let raw = self.read(Attribute::FirmwareRevision).await?;
        Ok(String::from_utf8_lossy(&raw).trim_end_matches('\0').to_string())
    }

    /// Read the most recent measurement
    pub async fn read_current(&mut self) -> Result<CurrentReading> {
        let now = crate::utils::now_utc_secs();
        let raw = self.read(Attribute::CurrentReadings).await?;
        Ok(protocol::decode_current(&raw, now)?)
    }

    /// Read the most recent measurement as a sample
    pub async fn read_sample(&mut self) -> Result<Sample> {
        Ok(self.read_current().await?.sample)
    }

    /// Number of samples stored on the device
    pub async fn num_data(&mut self) -> Result<usize> {
        let raw = self.read(Attribute::TotalReadings).await?;
        Ok(protocol::decode_u16(&raw, "total readings")? as usize)
    }

    /// Time elapsed since the last measurement
    pub async fn since(&mut self) -> Result<Duration> {
        self.read_seconds(Attribute::SinceUpdate).await
    }

    /// Configured refresh interval
    pub async fn interval(&mut self) -> Result<Duration> {
        self.read_seconds(Attribute::Interval).await
    }

    /// Download and reconstruct the full stored history
    pub async fn read_all(&mut self, channel_timeout: StdDuration) -> Result<Vec<Sample>> {
        let now = crate::utils::now_utc_secs();
        let ago = self.since().await?;
        let delta = self.interval().await?;
        let count = self.num_data().await?;

        for attribute in [Attribute::Command, Attribute::History] {
            if !self.attributes.contains(&attribute) {
                return Err(LinkError::AttributeNotFound(attribute).into());
            }
        }

        let info = HistoryInfo { count, ago, delta };
        info!(
            "Reading {} samples from {} (interval {}s, last {}s ago)",
            count,
            self.address,
            delta.whole_seconds(),
            ago.whole_seconds()
        );
        history::reconstruct(&mut self.session, &info, now, channel_timeout).await
    }

    /// Disconnect from the device
    pub async fn close(mut self) -> Result<()> {
        self.session.disconnect().await?;
        info!("Disconnected from device {}", self.address);
        Ok(())
    }
}
