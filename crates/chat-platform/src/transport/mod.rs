pub mod channel;

pub use channel::{ChannelTransport, RemoteEnd};
