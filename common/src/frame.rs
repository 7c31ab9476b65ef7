use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::codec::ByteReader;
use crate::error::FormatError;

/// Body posture of a player at the moment a frame was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[repr(u8)]
pub enum Stance {
    #[default]
    Standing = 0,
    Sneaking = 1,
    Swimming = 2,
    Crawling = 3,
    Gliding = 4,
    Sleeping = 5,
    Riding = 6,
}

impl Stance {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Stance::Standing),
            1 => Some(Stance::Sneaking),
            2 => Some(Stance::Swimming),
            3 => Some(Stance::Crawling),
            4 => Some(Stance::Gliding),
            5 => Some(Stance::Sleeping),
            6 => Some(Stance::Riding),
            _ => None,
        }
    }
}

/// A block interaction (dig, place, use) that happened on exactly one frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockAction {
    pub x: i32,
    pub y: i32,
    pub z: i32,
    pub action: u8,
}

/// The six movement booleans, packed into one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Movement {
    pub on_ground: bool,
    pub sprinting: bool,
    pub sneaking: bool,
    pub swimming: bool,
    pub flying: bool,
    pub gliding: bool,
}

impl Movement {
    pub fn pack(&self) -> u8 {
        (self.on_ground as u8)
            | (self.sprinting as u8) << 1
            | (self.sneaking as u8) << 2
            | (self.swimming as u8) << 3
            | (self.flying as u8) << 4
            | (self.gliding as u8) << 5
    }

    /// Unused high bits are ignored.
    pub fn unpack(bits: u8) -> Self {
        Self {
            on_ground: bits & 0x01 != 0,
            sprinting: bits & 0x02 != 0,
            sneaking: bits & 0x04 != 0,
            swimming: bits & 0x08 != 0,
            flying: bits & 0x10 != 0,
            gliding: bits & 0x20 != 0,
        }
    }
}

/// One player's sampled state at one instant.
///
/// Frames are pooled (see [`crate::FramePool`]) and mutated in place by the
/// sampler, so every field is public plain data and [`Frame::reset`] returns
/// the value to its default before it is handed out again.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Frame {
    /// Milliseconds since the unix epoch
    pub timestamp: i64,
    pub player_id: Uuid,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub yaw: f32,
    pub pitch: f32,
    pub vx: f64,
    pub vy: f64,
    pub vz: f64,
    pub stance: Stance,
    pub animation: u8,
    pub held_item_slot: u8,
    pub held_item_id: u32,
    pub health: f32,
    pub armor: f32,
    pub status_effects: u32,
    /// 0 means no action on this frame
    pub action_code: u16,
    pub block_action: Option<BlockAction>,
    pub movement: Movement,
}

impl Frame {
    pub fn new(player_id: Uuid, timestamp: i64) -> Self {
        Self {
            player_id,
            timestamp,
            ..Self::default()
        }
    }

    /// Clear every field so nothing leaks into the next player that receives
    /// this frame from the pool.
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn position(&self) -> (f64, f64, f64) {
        (self.x, self.y, self.z)
    }

    pub fn velocity(&self) -> (f64, f64, f64) {
        (self.vx, self.vy, self.vz)
    }

    /// Copy the persistent state of `other` into `self` without reallocating.
    pub fn copy_from(&mut self, other: &Frame) {
        self.clone_from(other);
    }

    pub(crate) fn write_keyframe(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.timestamp.to_be_bytes());
        out.extend_from_slice(&self.x.to_be_bytes());
        out.extend_from_slice(&self.y.to_be_bytes());
        out.extend_from_slice(&self.z.to_be_bytes());
        out.extend_from_slice(&self.yaw.to_be_bytes());
        out.extend_from_slice(&self.pitch.to_be_bytes());
        out.extend_from_slice(&self.vx.to_be_bytes());
        out.extend_from_slice(&self.vy.to_be_bytes());
        out.extend_from_slice(&self.vz.to_be_bytes());
        out.push(self.stance.as_u8());
        out.push(self.animation);
        out.push(self.held_item_slot);
        out.extend_from_slice(&self.held_item_id.to_be_bytes());
        out.extend_from_slice(&self.health.to_be_bytes());
        out.extend_from_slice(&self.armor.to_be_bytes());
        out.extend_from_slice(&self.status_effects.to_be_bytes());
        out.extend_from_slice(&self.action_code.to_be_bytes());
        match &self.block_action {
            Some(block) => {
                out.push(1);
                write_block_action(block, out);
            }
            None => out.push(0),
        }
        out.push(self.movement.pack());
    }

    pub(crate) fn read_keyframe(
        reader: &mut ByteReader<'_>,
        player_id: Uuid,
    ) -> Result<Frame, FormatError> {
        let timestamp = reader.i64()?;
        let x = reader.f64()?;
        let y = reader.f64()?;
        let z = reader.f64()?;
        let yaw = reader.f32()?;
        let pitch = reader.f32()?;
        let vx = reader.f64()?;
        let vy = reader.f64()?;
        let vz = reader.f64()?;
        let stance_raw = reader.u8()?;
        let stance = Stance::from_u8(stance_raw).ok_or(FormatError::InvalidStance(stance_raw))?;
        let animation = reader.u8()?;
        let held_item_slot = reader.u8()?;
        let held_item_id = reader.u32()?;
        let health = reader.f32()?;
        let armor = reader.f32()?;
        let status_effects = reader.u32()?;
        let action_code = reader.u16()?;
        let block_action = match reader.u8()? {
            0 => None,
            _ => Some(read_block_action(reader)?),
        };
        let movement = Movement::unpack(reader.u8()?);

        Ok(Frame {
            timestamp,
            player_id,
            x,
            y,
            z,
            yaw,
            pitch,
            vx,
            vy,
            vz,
            stance,
            animation,
            held_item_slot,
            held_item_id,
            health,
            armor,
            status_effects,
            action_code,
            block_action,
            movement,
        })
    }
}

pub(crate) fn write_block_action(block: &BlockAction, out: &mut Vec<u8>) {
    out.extend_from_slice(&block.x.to_be_bytes());
    out.extend_from_slice(&block.y.to_be_bytes());
    out.extend_from_slice(&block.z.to_be_bytes());
    out.push(block.action);
}

pub(crate) fn read_block_action(reader: &mut ByteReader<'_>) -> Result<BlockAction, FormatError> {
    Ok(BlockAction {
        x: reader.i32()?,
        y: reader.i32()?,
        z: reader.i32()?,
        action: reader.u8()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn busy_frame() -> Frame {
        Frame {
            timestamp: 1_700_000_000_123,
            player_id: Uuid::new_v4(),
            x: 10.5,
            y: 64.0,
            z: -3.25,
            yaw: 91.0,
            pitch: -12.5,
            vx: 0.2,
            vy: -0.08,
            vz: 0.0,
            stance: Stance::Sneaking,
            animation: 3,
            held_item_slot: 4,
            held_item_id: 276,
            health: 17.5,
            armor: 8.0,
            status_effects: 0b1010,
            action_code: 7,
            block_action: Some(BlockAction { x: 10, y: 63, z: -4, action: 2 }),
            movement: Movement { on_ground: true, sneaking: true, ..Movement::default() },
        }
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut frame = busy_frame();
        frame.reset();
        assert_eq!(frame, Frame::default());
        assert!(frame.block_action.is_none());
        assert_eq!(frame.player_id, Uuid::nil());
    }

    #[test]
    fn test_movement_pack_uses_six_bits() {
        let all = Movement {
            on_ground: true,
            sprinting: true,
            sneaking: true,
            swimming: true,
            flying: true,
            gliding: true,
        };
        assert_eq!(all.pack(), 0b0011_1111);
        assert_eq!(Movement::unpack(0xff), all);
        assert_eq!(
            Movement::unpack(0b0001_0001),
            Movement {
                on_ground: true,
                flying: true,
                ..Movement::default()
            }
        );
    }

    #[test]
    fn test_keyframe_layout_is_exact() {
        let frame = busy_frame();
        let mut out = Vec::new();
        frame.write_keyframe(&mut out);

        let mut reader = ByteReader::new(&out);
        let decoded = Frame::read_keyframe(&mut reader, frame.player_id).unwrap();
        assert_eq!(decoded, frame);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_stance_rejects_unknown() {
        assert_eq!(Stance::from_u8(6), Some(Stance::Riding));
        assert_eq!(Stance::from_u8(42), None);
    }
}
