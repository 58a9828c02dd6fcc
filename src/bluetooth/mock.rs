use async_trait::async_trait;
use futures_util::stream::{self, StreamExt};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::bluetooth::link::{Attribute, Link, LinkError, LinkSession, Notifications};
use crate::bluetooth::protocol::Channel;

/// Values per notification frame
const CHUNK_LEN: usize = 2;

/// (co2, temperature, pressure, humidity)
pub type Row = (u16, f64, f64, u8);

/// Scripted device session
#[derive(Clone, Debug, Default)]
pub struct MockSession {
    pub connected: bool,
    reads: HashMap<Attribute, Vec<u8>>,
    history: Vec<Row>,
    stalled: Option<Channel>,
    foreign: Option<Channel>,
    commands: Vec<Vec<u8>>,
    unsubscribes: usize,
}

impl MockSession {
    pub fn with_history(rows: &[Row]) -> Self {
        let mut reads = HashMap::new();
        reads.insert(Attribute::TotalReadings, (rows.len() as u16).to_le_bytes().to_vec());
        reads.insert(Attribute::Interval, 300u16.to_le_bytes().to_vec());
        reads.insert(Attribute::SinceUpdate, 30u16.to_le_bytes().to_vec());
        reads.insert(
            Attribute::CurrentReadings,
            vec![
                0x20, 0x03, 0xae, 0x01, 0x8b, 0x27, 45, 87, 1, 0x2c, 0x01, 0x1e, 0x00,
            ],
        );
        reads.insert(Attribute::DeviceName, b"Aranet4 1A2B3".to_vec());
        reads.insert(Attribute::FirmwareRevision, b"v1.4.19".to_vec());

        MockSession {
            connected: true,
            reads,
            history: rows.to_vec(),
            ..Default::default()
        }
    }

    /// Never send the end-of-stream chunk for `channel`
    pub fn without_terminator(mut self, channel: Channel) -> Self {
        self.stalled = Some(channel);
        self
    }

    /// Answer requests for `channel` with a frame tagged for another channel
    pub fn with_foreign_frame(mut self, channel: Channel) -> Self {
        self.foreign = Some(channel);
        self
    }

    pub fn with_read(mut self, attribute: Attribute, value: Vec<u8>) -> Self {
        self.reads.insert(attribute, value);
        self
    }

    pub fn without(mut self, attribute: Attribute) -> Self {
        self.reads.remove(&attribute);
        self
    }

    pub fn commands(&self) -> &[Vec<u8>] {
        &self.commands
    }

    pub fn unsubscribes(&self) -> usize {
        self.unsubscribes
    }

    fn frames(&self, channel: Channel) -> Vec<Vec<u8>> {
        let id = match self.foreign {
            Some(c) if c == channel => channel.id() % 4 + 1,
            _ => channel.id(),
        };

        let mut frames = Vec::new();
        for (n, rows) in self.history.chunks(CHUNK_LEN).enumerate() {
            let start = (n * CHUNK_LEN + 1) as u16;
            let mut frame = vec![id];
            frame.extend_from_slice(&start.to_le_bytes());
            frame.push(rows.len() as u8);
            for (co2, t, p, h) in rows {
                match channel {
                    Channel::Temperature => {
                        frame.extend_from_slice(&((t * 20.0).round() as u16).to_le_bytes())
                    }
                    Channel::Humidity => frame.push(*h),
                    Channel::Pressure => {
                        frame.extend_from_slice(&((p * 10.0).round() as u16).to_le_bytes())
                    }
                    Channel::Co2 => frame.extend_from_slice(&co2.to_le_bytes()),
                }
            }
            frames.push(frame);
        }
        frames.push(vec![id, 0, 0, 0]);
        frames
    }
}

#[async_trait]
impl LinkSession for MockSession {
    async fn discover(&mut self) -> Result<HashSet<Attribute>, LinkError> {
        let mut found: HashSet<Attribute> = self.reads.keys().copied().collect();
        found.insert(Attribute::Command);
        found.insert(Attribute::History);
        Ok(found)
    }

    async fn read(&mut self, attribute: Attribute) -> Result<Vec<u8>, LinkError> {
        self.reads
            .get(&attribute)
            .cloned()
            .ok_or(LinkError::AttributeNotFound(attribute))
    }

    async fn write(&mut self, attribute: Attribute, value: &[u8]) -> Result<(), LinkError> {
        if attribute != Attribute::Command {
            return Err(LinkError::Io {
                op: "write",
                attribute,
                reason: "read-only".to_string(),
            });
        }
        self.commands.push(value.to_vec());
        Ok(())
    }

    async fn subscribe(&mut self, attribute: Attribute) -> Result<Notifications, LinkError> {
        let channel = self
            .commands
            .last()
            .and_then(|cmd| Channel::from_id(cmd[1]))
            .ok_or(LinkError::Io {
                op: "subscribe",
                attribute,
                reason: "no pending command".to_string(),
            })?;

        let mut frames = self.frames(channel);
        if self.stalled == Some(channel) {
            frames.pop();
            return Ok(stream::iter(frames).chain(stream::pending()).boxed());
        }
        Ok(stream::iter(frames).boxed())
    }

    async fn unsubscribe(&mut self, _attribute: Attribute) -> Result<(), LinkError> {
        self.unsubscribes += 1;
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<(), LinkError> {
        self.connected = false;
        Ok(())
    }
}

/// Hands out copies of a scripted session, optionally failing the first connects
#[derive(Clone, Debug)]
pub struct MockLink {
    pub template: MockSession,
    pub address: String,
    failures: Arc<AtomicUsize>,
    connects: Arc<AtomicUsize>,
}

impl MockLink {
    pub fn new(address: &str, template: MockSession) -> Self {
        MockLink {
            template,
            address: address.to_string(),
            failures: Arc::new(AtomicUsize::new(0)),
            connects: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_first(self, n: usize) -> Self {
        self.failures.store(n, Ordering::SeqCst);
        self
    }

    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Link for MockLink {
    type Session = MockSession;

    async fn connect(&self, address: &str, _timeout: Duration) -> Result<MockSession, LinkError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if address != self.address {
            return Err(LinkError::Connect {
                address: address.to_string(),
                reason: "device not found".to_string(),
            });
        }
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(LinkError::Connect {
                address: address.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        Ok(self.template.clone())
    }
}
