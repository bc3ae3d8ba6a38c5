pub mod bus;
pub mod config_apply;
pub mod stream;
pub mod transfer;
