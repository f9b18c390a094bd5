pub mod connection;
pub mod events;
pub mod stream;
pub mod transfer;
