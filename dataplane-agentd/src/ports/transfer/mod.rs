pub mod transport;

pub use transport::{FrameStream, TransferPort, UploadAck};
