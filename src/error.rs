use std::time::Duration;
use thiserror::Error;

use crate::bluetooth::link::LinkError;
use crate::bluetooth::protocol::{Channel, ProtocolError};
use crate::database::StoreError;

/// Error type for one acquisition cycle.
#[derive(Error, Debug)]
pub enum Error {
    #[error("link error: {0}")]
    Link(#[from] LinkError),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("no end-of-stream chunk for {channel} within {timeout:?}")]
    ReconstructionTimeout { channel: Channel, timeout: Duration },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl Error {
    /// Whether a fresh attempt on a new connection may succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Link(_) | Error::Protocol(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;
