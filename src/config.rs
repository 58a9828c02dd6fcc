use std::env;
use std::path::PathBuf;
use std::time::Duration;
use url::Url;

const DEFAULT_STORE: &str = "aranet4.db";
const DEFAULT_RETRIES: usize = 3;
const DEFAULT_CONNECT_TIMEOUT_SECS: u64 = 15;
const DEFAULT_CHANNEL_TIMEOUT_SECS: u64 = 10;
const DEFAULT_CYCLE_TIMEOUT_SECS: u64 = 60;

/// Where samples are written
#[derive(Debug, Clone, PartialEq)]
pub enum StoreLocation {
    Embedded(PathBuf),
    Postgres(String),
}

impl StoreLocation {
    pub fn parse(value: &str) -> Result<Self, Box<dyn std::error::Error>> {
        if value.starts_with("postgres://") || value.starts_with("postgresql://") {
            let url = Url::parse(value).map_err(|e| format!("invalid store URL: {}", e))?;
            if url.host_str().map_or(true, str::is_empty) {
                return Err("store URL has no host".into());
            }
            Ok(StoreLocation::Postgres(value.to_string()))
        } else if value.is_empty() {
            Err("ARANET4_STORE is empty".into())
        } else {
            Ok(StoreLocation::Embedded(PathBuf::from(value)))
        }
    }
}

#[derive(Debug, Clone)]
pub struct DaqConfig {
    pub device: String,
    pub store: StoreLocation,
    pub poll: Option<Duration>,
    pub retries: usize,
    pub connect_timeout: Duration,
    pub channel_timeout: Duration,
    pub cycle_timeout: Duration,
}

fn parse_number<T: std::str::FromStr>(
    name: &str,
    value: Option<String>,
) -> Result<Option<T>, Box<dyn std::error::Error>> {
    match value {
        Some(v) if !v.trim().is_empty() => v
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| format!("{} must be a non-negative integer, got '{}'", name, v).into()),
        _ => Ok(None),
    }
}

impl DaqConfig {
    pub fn new() -> Result<Self, Box<dyn std::error::Error>> {
        // Load environment variables
        dotenv::dotenv().ok();
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from any key lookup
    pub fn from_lookup<F>(get: F) -> Result<Self, Box<dyn std::error::Error>>
    where
        F: Fn(&str) -> Option<String>,
    {
        let device = get("ARANET4_DEVICE")
            .map(|d| d.trim().to_string())
            .filter(|d| !d.is_empty())
            .ok_or("ARANET4_DEVICE environment variable not set")?;

        let store = get("ARANET4_STORE").unwrap_or_else(|| DEFAULT_STORE.to_string());
        let store = StoreLocation::parse(store.trim())?;

        let poll = parse_number::<u64>("ARANET4_POLL_SECS", get("ARANET4_POLL_SECS"))?
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs);

        let retries = parse_number("ARANET4_RETRIES", get("ARANET4_RETRIES"))?
            .unwrap_or(DEFAULT_RETRIES);

        let secs = |name: &str, default: u64| -> Result<Duration, Box<dyn std::error::Error>> {
            Ok(Duration::from_secs(
                parse_number(name, get(name))?.unwrap_or(default),
            ))
        };

        Ok(DaqConfig {
            device,
            store,
            poll,
            retries,
            connect_timeout: secs("ARANET4_CONNECT_TIMEOUT_SECS", DEFAULT_CONNECT_TIMEOUT_SECS)?,
            channel_timeout: secs("ARANET4_CHANNEL_TIMEOUT_SECS", DEFAULT_CHANNEL_TIMEOUT_SECS)?,
            cycle_timeout: secs("ARANET4_CYCLE_TIMEOUT_SECS", DEFAULT_CYCLE_TIMEOUT_SECS)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Result<DaqConfig, Box<dyn std::error::Error>> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        DaqConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults() {
        let cfg = config(&[("ARANET4_DEVICE", "F5:6C:BE:D5:61:47")]).unwrap();
        assert_eq!(cfg.device, "F5:6C:BE:D5:61:47");
        assert_eq!(cfg.store, StoreLocation::Embedded(PathBuf::from("aranet4.db")));
        assert_eq!(cfg.poll, None);
        assert_eq!(cfg.retries, 3);
        assert_eq!(cfg.connect_timeout, Duration::from_secs(15));
        assert_eq!(cfg.channel_timeout, Duration::from_secs(10));
        assert_eq!(cfg.cycle_timeout, Duration::from_secs(60));
    }

    #[test]
    fn device_is_required() {
        assert!(config(&[]).is_err());
        assert!(config(&[("ARANET4_DEVICE", "  ")]).is_err());
    }

    #[test]
    fn overrides() {
        let cfg = config(&[
            ("ARANET4_DEVICE", "dev1"),
            ("ARANET4_STORE", "postgres://u:p@localhost/aranet?sslrootcert=/ca.pem"),
            ("ARANET4_POLL_SECS", "120"),
            ("ARANET4_RETRIES", "5"),
            ("ARANET4_CYCLE_TIMEOUT_SECS", "90"),
        ])
        .unwrap();
        assert_eq!(
            cfg.store,
            StoreLocation::Postgres("postgres://u:p@localhost/aranet?sslrootcert=/ca.pem".to_string())
        );
        assert_eq!(cfg.poll, Some(Duration::from_secs(120)));
        assert_eq!(cfg.retries, 5);
        assert_eq!(cfg.cycle_timeout, Duration::from_secs(90));
    }

    #[test]
    fn zero_poll_falls_back_to_device_interval() {
        let cfg = config(&[("ARANET4_DEVICE", "dev1"), ("ARANET4_POLL_SECS", "0")]).unwrap();
        assert_eq!(cfg.poll, None);
    }

    #[test]
    fn bad_numbers_are_rejected() {
        assert!(config(&[("ARANET4_DEVICE", "dev1"), ("ARANET4_RETRIES", "many")]).is_err());
        assert!(config(&[("ARANET4_DEVICE", "dev1"), ("ARANET4_POLL_SECS", "-1")]).is_err());
    }

    #[test]
    fn store_locations() {
        assert_eq!(
            StoreLocation::parse("/var/lib/aranet4/data.db").unwrap(),
            StoreLocation::Embedded(PathBuf::from("/var/lib/aranet4/data.db"))
        );
        assert!(matches!(
            StoreLocation::parse("postgresql://db.local/aranet").unwrap(),
            StoreLocation::Postgres(_)
        ));
        assert!(StoreLocation::parse("postgres://").is_err());
        assert!(StoreLocation::parse("").is_err());
    }
}
