pub mod ingest;
pub mod irc;
pub mod message;
pub mod worker;

pub use ingest::{ChatIngest, RoomDirectory};
pub use worker::ChatWorker;
