pub mod http;

pub use http::{HttpHistoryClient, parse_listing};
