pub mod frame;
pub mod monitor;
pub mod pipeline;
pub mod reader;
pub mod transport;
