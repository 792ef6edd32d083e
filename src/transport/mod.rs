pub mod channel;
pub mod connection;
pub mod sip_addr;
pub mod stream;
pub mod tcp;
pub mod tcp_listener;
pub mod transport_layer;
pub mod udp;
pub use connection::SipConnection;
pub use connection::TransportEvent;
pub use sip_addr::SipAddr;
pub use transport_layer::TransportLayer;
