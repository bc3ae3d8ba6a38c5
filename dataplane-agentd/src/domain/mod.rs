pub mod config_apply;
pub mod messages;
pub mod transfer;
