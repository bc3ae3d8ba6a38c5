pub mod service;

pub use service::{download_into, upload, TransferClient};
