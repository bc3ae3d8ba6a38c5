pub mod codec;
pub mod frame;

pub use codec::{checksum, encode_frames, FrameAssembler, TransferError, DEFAULT_FRAME_SIZE};
pub use frame::{Frame, TransferMeta};
