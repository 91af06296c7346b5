//! Concrete feed transports

pub mod tcp;

pub use tcp::TcpConnector;
