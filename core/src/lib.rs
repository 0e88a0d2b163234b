mod codec;
pub use codec::Codec;
mod config;
pub use config::NetConfig;
pub mod error;
pub mod message;
