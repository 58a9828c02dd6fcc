mod config;

use log::{error, info, warn};
use std::fmt;
use time::OffsetDateTime;
use tokio::sync::oneshot;
use tokio::time::{interval, timeout, MissedTickBehavior};

use aranet4_etl::bluetooth::{BluezLink, Link};
use aranet4_etl::retry::retry_if;
use aranet4_etl::utils::{duration_to_seconds, format_datetime, to_std};
use aranet4_etl::{Aranet4, EmbeddedStore, Error, PostgresStore, Sample, Store};
use config::{DaqConfig, StoreLocation};

const HISTORY_EVERY_TICKS: u32 = 12; // Full history re-download cadence, in poll ticks

#[derive(Debug, Clone, Copy, PartialEq)]
enum Cycle {
    History,
    Current,
}

impl fmt::Display for Cycle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Cycle::History => write!(f, "history download"),
            Cycle::Current => write!(f, "current reading"),
        }
    }
}

/// Picks the cycle to run on each poll tick
///
/// History is downloaded on the first tick, after any failed cycle, and
/// every `HISTORY_EVERY_TICKS` ticks. The store merges overlapping uploads.
#[derive(Debug)]
struct Schedule {
    history_pending: bool,
    since_history: u32,
}

impl Schedule {
    fn new() -> Self {
        Schedule {
            history_pending: true,
            since_history: 0,
        }
    }

    fn next(&self) -> Cycle {
        if self.history_pending || self.since_history >= HISTORY_EVERY_TICKS {
            Cycle::History
        } else {
            Cycle::Current
        }
    }

    fn record(&mut self, cycle: Cycle, ok: bool) {
        match cycle {
            Cycle::History if ok => {
                self.history_pending = false;
                self.since_history = 0;
            }
            Cycle::History => self.history_pending = true,
            Cycle::Current => {
                self.since_history += 1;
                if !ok {
                    self.history_pending = true;
                }
            }
        }
    }
}

/// One connection to the device: connect, read, disconnect
async fn download<L: Link>(
    link: &L,
    config: &DaqConfig,
    cycle: Cycle,
) -> aranet4_etl::Result<Vec<Sample>> {
    let mut device = Aranet4::open(link, &config.device, config.connect_timeout).await?;
    let result = match cycle {
        Cycle::History => device.read_all(config.channel_timeout).await,
        Cycle::Current => device.read_sample().await.map(|s| vec![s]),
    };
    if let Err(e) = device.close().await {
        warn!("Failed to disconnect from {}: {}", config.device, e);
    }
    result
}

async fn device_interval<L: Link>(
    link: &L,
    config: &DaqConfig,
) -> aranet4_etl::Result<time::Duration> {
    let mut device = Aranet4::open(link, &config.device, config.connect_timeout).await?;
    let result = device.interval().await;
    if let Err(e) = device.close().await {
        warn!("Failed to disconnect from {}: {}", config.device, e);
    }
    result
}

/// Run one cycle and store what it produced
///
/// Failures are logged and reported as `false`.
async fn run_cycle<L: Link, S: Store>(
    link: &L,
    store: &S,
    config: &DaqConfig,
    cycle: Cycle,
) -> bool {
    let start_time = OffsetDateTime::now_utc();
    let what = cycle.to_string();
    let attempt = retry_if(config.retries, &what, Error::is_transient, || {
        download(link, config, cycle)
    });

    let samples = match timeout(config.cycle_timeout, attempt).await {
        Ok(Ok(samples)) => samples,
        Ok(Err(e)) => {
            error!("{} from {} failed: {}", cycle, config.device, e);
            return false;
        }
        Err(_) => {
            error!(
                "{} from {} timed out after {} seconds",
                cycle,
                config.device,
                config.cycle_timeout.as_secs()
            );
            return false;
        }
    };

    let newest = samples.iter().max_by_key(|s| s.time).cloned();
    let received = samples.len();
    let written = match store.put_data(&config.device, samples).await {
        Ok(written) => written,
        Err(e) => {
            error!("Failed to store samples for {}: {}", config.device, e);
            return false;
        }
    };

    let elapsed = duration_to_seconds(OffsetDateTime::now_utc() - start_time);
    info!(
        "{} complete at {} ({}s): {} samples received, {} new",
        cycle,
        format_datetime(&OffsetDateTime::now_utc()),
        elapsed,
        received,
        written
    );
    match newest {
        Some(sample) => info!("  Newest: {}", sample),
        None => warn!("No samples received during this cycle!"),
    }
    true
}

async fn run<S: Store>(
    store: S,
    config: &DaqConfig,
    mut shutdown: oneshot::Receiver<()>,
) -> Result<(), Box<dyn std::error::Error>> {
    let link = BluezLink::new().await?;

    if !store.devices().await?.contains(&config.device) {
        store.add_device(&config.device).await?;
    }

    let poll = match config.poll {
        Some(poll) => poll,
        None => {
            info!("Retrieving refresh interval of {}", config.device);
            let attempt = retry_if(config.retries, "interval read", Error::is_transient, || {
                device_interval(&link, config)
            });
            let freq = timeout(config.cycle_timeout, attempt)
                .await
                .map_err(|_| "timed out reading the refresh interval")??;
            to_std(freq)
        }
    };
    if poll.is_zero() {
        return Err("device reports a zero refresh interval".into());
    }
    info!("Polling {} every {} seconds", config.device, poll.as_secs());

    let mut schedule = Schedule::new();
    let mut ticker = interval(poll);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut listening = true;
    loop {
        tokio::select! {
            signal = &mut shutdown, if listening => match signal {
                Ok(()) => {
                    info!("Program terminated by user. Exiting gracefully.");
                    break;
                }
                Err(_) => listening = false,
            },
            _ = ticker.tick() => {
                let cycle = schedule.next();
                let ok = run_cycle(&link, &store, config, cycle).await;
                schedule.record(cycle, ok);
            }
        }
    }

    store.close().await?;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .format_timestamp_secs()
        .init();

    // Load configuration
    let config = match DaqConfig::new() {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };

    // Handle Ctrl+C between cycles
    let (tx, rx) = oneshot::channel();
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                let _ = tx.send(());
            }
            Err(e) => error!("Failed to listen for Ctrl+C: {}", e),
        }
    });

    info!("Starting Aranet4 data collection for {}", config.device);
    let result = match &config.store {
        StoreLocation::Embedded(path) => run(EmbeddedStore::open(path)?, &config, rx).await,
        StoreLocation::Postgres(url) => {
            run(PostgresStore::connect(url, config.retries).await?, &config, rx).await
        }
    };

    match result {
        Ok(()) => info!("Program completed successfully"),
        Err(e) => {
            error!("Fatal error: {}", e);
            return Err(e);
        }
    }
    Ok(())
}
