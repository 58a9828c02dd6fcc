/// BlueZ-backed link sessions using bluer
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{debug, error, info, warn};
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::{sleep, timeout as with_timeout, Instant};

use crate::bluetooth::link::{Attribute, Link, LinkError, LinkSession, Notifications};

const DISCOVERY_POLL_MS: u64 = 250; // How often to look for the target while scanning

/// Default BlueZ adapter, powered on
pub struct BluezLink {
    _session: bluer::Session,
    adapter: bluer::Adapter,
}

impl BluezLink {
    pub async fn new() -> Result<Self, LinkError> {
        // Initialize Bluetooth session
        let session = match bluer::Session::new().await {
            Ok(session) => session,
            Err(e) => {
                error!("Failed to create Bluetooth session: {}", e);
                return Err(LinkError::Adapter(e.to_string()));
            }
        };

        // Get the default Bluetooth adapter
        let adapter = match session.default_adapter().await {
            Ok(adapter) => adapter,
            Err(e) => {
                error!("Failed to get default Bluetooth adapter: {}", e);
                return Err(LinkError::Adapter(e.to_string()));
            }
        };

        // Ensure Bluetooth adapter is powered on
        if let Err(e) = adapter.set_powered(true).await {
            error!("Failed to power on adapter: {}", e);
            return Err(LinkError::Adapter(e.to_string()));
        }

        info!("Using Bluetooth adapter {}", adapter.name());
        Ok(BluezLink {
            _session: session,
            adapter,
        })
    }

    /// Scan until BlueZ knows about `addr`
    async fn discover_device(&self, addr: bluer::Address, budget: Duration) -> Result<(), LinkError> {
        if let Ok(known) = self.adapter.device_addresses().await {
            if known.contains(&addr) {
                return Ok(());
            }
        }

        // Configure discovery filter for Low Energy devices only
        let filter = bluer::DiscoveryFilter {
            transport: bluer::DiscoveryTransport::Le,
            duplicate_data: false,
            ..Default::default()
        };

        // Apply the discovery filter (warn if it fails, but continue)
        if let Err(e) = self.adapter.set_discovery_filter(filter).await {
            warn!("Failed to set discovery filter: {}", e);
        }

        // Start device discovery in background
        let discovery_handle = match self.adapter.discover_devices().await {
            Ok(discovery_stream) => tokio::spawn(async move {
                let mut stream = discovery_stream;
                while let Some(event) = stream.next().await {
                    debug!("Discovery event: {:?}", event);
                }
            }),
            Err(e) => {
                error!("Failed to start device discovery: {}", e);
                return Err(LinkError::Adapter(e.to_string()));
            }
        };

        let deadline = Instant::now() + budget;
        let found = loop {
            match self.adapter.device_addresses().await {
                Ok(known) if known.contains(&addr) => break true,
                Ok(_) => {}
                Err(e) => debug!("Failed to get device addresses: {}", e),
            }
            if Instant::now() >= deadline {
                break false;
            }
            sleep(Duration::from_millis(DISCOVERY_POLL_MS)).await;
        };

        // Stop discovery
        discovery_handle.abort();

        if found {
            Ok(())
        } else {
            Err(LinkError::Timeout(budget))
        }
    }
}

#[async_trait]
impl Link for BluezLink {
    type Session = BluezSession;

    async fn connect(&self, address: &str, timeout: Duration) -> Result<BluezSession, LinkError> {
        let addr: bluer::Address = address.parse().map_err(|e: bluer::InvalidAddress| {
            LinkError::Connect {
                address: address.to_string(),
                reason: e.to_string(),
            }
        })?;

        let started = Instant::now();
        self.discover_device(addr, timeout).await?;

        let device = self.adapter.device(addr).map_err(|e| LinkError::Connect {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        let remaining = timeout.saturating_sub(started.elapsed());
        match with_timeout(remaining, device.connect()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(LinkError::Connect {
                    address: address.to_string(),
                    reason: e.to_string(),
                })
            }
            Err(_) => return Err(LinkError::Timeout(timeout)),
        }

        Ok(BluezSession {
            device,
            characteristics: HashMap::new(),
        })
    }
}

/// A connected device and the characteristics found on it
pub struct BluezSession {
    device: bluer::Device,
    characteristics: HashMap<Attribute, bluer::gatt::remote::Characteristic>,
}

impl BluezSession {
    fn characteristic(
        &self,
        attribute: Attribute,
    ) -> Result<&bluer::gatt::remote::Characteristic, LinkError> {
        self.characteristics
            .get(&attribute)
            .ok_or(LinkError::AttributeNotFound(attribute))
    }
}

fn io_error(op: &'static str, attribute: Attribute, e: bluer::Error) -> LinkError {
    LinkError::Io {
        op,
        attribute,
        reason: e.to_string(),
    }
}

fn adapter_error(e: bluer::Error) -> LinkError {
    LinkError::Adapter(e.to_string())
}

#[async_trait]
impl LinkSession for BluezSession {
    async fn discover(&mut self) -> Result<HashSet<Attribute>, LinkError> {
        self.characteristics.clear();
        for service in self.device.services().await.map_err(adapter_error)? {
            for characteristic in service.characteristics().await.map_err(adapter_error)? {
                let uuid = characteristic.uuid().await.map_err(adapter_error)?;
                if let Some(attribute) = Attribute::from_uuid(uuid) {
                    debug!("Found {} characteristic {}", attribute, uuid);
                    self.characteristics.insert(attribute, characteristic);
                }
            }
        }
        Ok(self.characteristics.keys().copied().collect())
    }

    async fn read(&mut self, attribute: Attribute) -> Result<Vec<u8>, LinkError> {
        let characteristic = self.characteristic(attribute)?;
        characteristic
            .read()
            .await
            .map_err(|e| io_error("read", attribute, e))
    }

    async fn write(&mut self, attribute: Attribute, value: &[u8]) -> Result<(), LinkError> {
        let characteristic = self.characteristic(attribute)?;
        characteristic
            .write(value)
            .await
            .map_err(|e| io_error("write", attribute, e))
    }

    async fn subscribe(&mut self, attribute: Attribute) -> Result<Notifications, LinkError> {
        let characteristic = self.characteristic(attribute)?;
        let stream = characteristic
            .notify()
            .await
            .map_err(|e| io_error("subscribe", attribute, e))?;
        Ok(stream.boxed())
    }

    async fn unsubscribe(&mut self, attribute: Attribute) -> Result<(), LinkError> {
        // BlueZ stops notifying once the last stream is dropped
        self.characteristic(attribute)?;
        debug!("Unsubscribed from {}", attribute);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.device.disconnect().await.map_err(adapter_error)?;
        self.characteristics.clear();
        Ok(())
    }
}
