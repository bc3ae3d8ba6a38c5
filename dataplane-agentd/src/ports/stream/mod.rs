pub mod connector;

pub use connector::{InboundStream, StreamConnector, StreamSession, StreamSink};
