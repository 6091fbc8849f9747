pub mod connection;
pub mod extensions;
pub mod handshake;
pub mod message;
pub mod session;
