pub mod client;

pub use client::{ClientState, ResilientStreamClient, DEFAULT_INBOUND_CAPACITY};
