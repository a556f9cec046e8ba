pub mod client;
pub mod config;
pub mod consts;
pub mod error;
pub mod event;
pub mod logger;
pub mod manager;
pub mod pubsub;
pub mod connection;

pub use client::{connect, Client, ClientState};
pub use config::Config;
pub use connection::pipeline::Reply;
pub use error::{RelinkClientError, RelinkConnectionError, RelinkParseError};
pub use event::ClientEvent;
pub use manager::State;
pub use pubsub::{Ack, MessageCallback, PubsubClient, PubsubMessage};
