//! Aranet4 history download and time-series storage
//!
//! The device is reached through the `bluetooth::link` traits, its history is
//! rebuilt by `bluetooth::history`, and samples end up in a `database::Store`.
pub mod bluetooth;
pub mod database;
pub mod error;
pub mod models;
pub mod retry;
pub mod utils;

pub use bluetooth::Aranet4;
pub use database::{EmbeddedStore, PostgresStore, Store, StoreError};
pub use error::{Error, Result};
pub use models::{Quality, Sample};
