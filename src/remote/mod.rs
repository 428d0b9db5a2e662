pub mod connection;
pub mod request;
pub mod session;
pub mod subscription;
pub mod transport;

pub use connection::DEFAULT_TIMEOUT;
pub use session::{ConnectionState, SessionHandle, HEARTBEAT_INTERVAL};
pub use subscription::CollectionUpdate;
pub use transport::{InProcessTransport, MessageTransport, WebSocketTransport};
