mod checksum;
mod codec;
mod constants;
mod delta;
mod error;
mod frame;
mod frame_pool;
mod ring_buffer;
mod segment;

pub mod util;

pub use checksum::rolling_hash;
pub use constants::*;
pub use delta::{Delta, PositionChange, angle_distance, dequantize_angle, flags, quantize_angle};
pub use error::FormatError;
pub use frame::{BlockAction, Frame, Movement, Stance};
pub use frame_pool::{FramePool, PoolStats, PooledFrame};
pub use ring_buffer::RingBuffer;
pub use segment::{Frames, Segment, SegmentBuilder, SegmentCursor, SegmentHeader};
pub use util::PseudoRandom;
