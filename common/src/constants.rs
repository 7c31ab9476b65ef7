/// Magic bytes at the start of every segment file ("RBX1")
pub const SEGMENT_MAGIC: [u8; 4] = *b"RBX1";

/// Current segment format version
pub const SEGMENT_VERSION: u8 = 1;

/// Fixed size of the segment header in bytes, including padding
pub const SEGMENT_HEADER_SIZE: usize = 64;

/// Hard cap on the serialized size of one segment (header + compressed payload)
pub const SEGMENT_MAX_BYTES: usize = 16 * 1024 * 1024;

/// File extension used for segment files
pub const SEGMENT_FILE_EXTENSION: &str = "rbx";

/// Position deltas are stored as i16 scaled by this factor
pub const POSITION_SCALE: f64 = 4096.0;

/// Velocities are stored as i16 scaled by this factor
pub const VELOCITY_SCALE: f64 = 8000.0;

/// Angle steps per full revolution
pub const ANGLE_STEPS: f32 = 256.0;

/// Squared displacement above which a position change is recorded
pub const POSITION_EPSILON_SQ: f64 = 0.001;

/// Per-component velocity change above which a velocity change is recorded
pub const VELOCITY_EPSILON: f64 = 0.01;

/// Rotation change in degrees above which a rotation change is recorded
pub const ROTATION_EPSILON: f32 = 0.1;

/// Default number of recycled frames a pool keeps around
pub const DEFAULT_POOL_CAPACITY: usize = 4096;
