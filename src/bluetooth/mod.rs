pub mod bluez;
pub mod device;
pub mod history;
pub mod link;
#[cfg(test)]
pub mod mock;
pub mod protocol;

pub use bluez::{BluezLink, BluezSession};
pub use device::Aranet4;
pub use link::{Attribute, Link, LinkError, LinkSession};
pub use protocol::{Channel, ProtocolError};
