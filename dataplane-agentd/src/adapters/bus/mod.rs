pub mod broadcast;

pub use broadcast::BroadcastBus;
