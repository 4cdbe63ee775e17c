pub mod event_bus;
pub mod ports;
pub mod classify;
pub mod extract;
pub mod stream;
pub mod status;
pub mod router;
pub mod history;
pub mod connection;
pub mod engine;
pub mod projection;

#[cfg(test)]
mod tests;
