mod connection;
mod endpoint;
pub(crate) mod http;
mod registry;
mod server;
mod transport;

pub use connection::{Connection, EventOutcome, Role};
pub use endpoint::{Endpoint, EndpointError, Scheme};
pub use registry::{Registry, RegistryError, RequestHandler};
pub use server::{ChannelView, StatusServer, StatusSource};
pub use transport::{
    Resolution, RxChunk, Transport, TransportEvent, TransportEventKind, RX_CHUNK_MAX,
};
