mod error;
mod net;
mod time_sync;

pub use error::FirmwareError;
pub use net::{ConnId, ConnState, HandleId, NetError};
pub use time_sync::TimeReference;
