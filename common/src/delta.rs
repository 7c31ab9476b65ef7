//! Quantized, flag-tagged differences between two frames.
//!
//! Wire layout of one delta: `u16 flags`, zigzag varint timestamp gap, then every
//! flagged field in flag-bit order. Persistent fields that are not flagged
//! carry forward from the base frame; the action code and block action are
//! pulses that only exist on the frame where they were flagged.

use crate::codec::{ByteReader, put_varint, unzigzag, varint_len, zigzag};
use crate::constants::{
    ANGLE_STEPS, POSITION_EPSILON_SQ, POSITION_SCALE, ROTATION_EPSILON, VELOCITY_EPSILON,
    VELOCITY_SCALE,
};
use crate::error::FormatError;
use crate::frame::{BlockAction, Frame, Movement, Stance, read_block_action, write_block_action};

pub mod flags {
    pub const POSITION: u16 = 1 << 0;
    pub const POSITION_ABSOLUTE: u16 = 1 << 1;
    pub const ROTATION: u16 = 1 << 2;
    pub const VELOCITY: u16 = 1 << 3;
    pub const STANCE: u16 = 1 << 4;
    pub const ANIMATION: u16 = 1 << 5;
    pub const HELD_ITEM: u16 = 1 << 6;
    pub const HEALTH: u16 = 1 << 7;
    pub const ARMOR: u16 = 1 << 8;
    pub const STATUS_EFFECTS: u16 = 1 << 9;
    pub const ACTION: u16 = 1 << 10;
    pub const BLOCK_ACTION: u16 = 1 << 11;
    pub const MOVEMENT: u16 = 1 << 12;

    pub const ALL: u16 = (1 << 13) - 1;
}

/// How a changed position is stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PositionChange {
    /// Offset from the base position in 1/4096 units
    Relative([i16; 3]),
    /// Used when an offset does not fit in 16 bits (teleports, respawns)
    Absolute([f64; 3]),
}

/// The encoded difference between two frames. A field is `Some` exactly when
/// its flag bit is set on the wire.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Delta {
    /// Milliseconds since the base frame; negative when the clock went back
    pub time_delta: i64,
    pub position: Option<PositionChange>,
    /// Yaw and pitch in 1/256 revolution steps
    pub rotation: Option<[i8; 2]>,
    /// Absolute velocity in 1/8000 units
    pub velocity: Option<[i16; 3]>,
    pub stance: Option<Stance>,
    pub animation: Option<u8>,
    pub held_item: Option<(u8, u32)>,
    pub health: Option<f32>,
    pub armor: Option<f32>,
    pub status_effects: Option<u32>,
    pub action_code: Option<u16>,
    pub block_action: Option<BlockAction>,
    pub movement: Option<Movement>,
}

pub fn quantize_angle(degrees: f32) -> i8 {
    let steps = (degrees / 360.0 * ANGLE_STEPS).round() as i64;
    steps.rem_euclid(256) as u8 as i8
}

pub fn dequantize_angle(step: i8) -> f32 {
    step as f32 * 360.0 / ANGLE_STEPS
}

/// Smallest absolute difference between two angles, in degrees
pub fn angle_distance(a: f32, b: f32) -> f32 {
    let d = (a - b).rem_euclid(360.0);
    if d > 180.0 { 360.0 - d } else { d }
}

pub fn quantize_velocity(v: f64) -> i16 {
    (v * VELOCITY_SCALE).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

pub fn dequantize_velocity(q: i16) -> f64 {
    q as f64 / VELOCITY_SCALE
}

fn quantize_offset(d: f64) -> Option<i16> {
    let q = (d * POSITION_SCALE).round();
    if q >= i16::MIN as f64 && q <= i16::MAX as f64 {
        Some(q as i16)
    } else {
        None
    }
}

impl Delta {
    /// Describe how `current` differs from `base`. Callers encoding a run of
    /// frames should pass the *reconstructed* previous frame as `base` so
    /// quantization error does not accumulate.
    pub fn compute(base: &Frame, current: &Frame) -> Delta {
        let mut delta = Delta {
            time_delta: current.timestamp.wrapping_sub(base.timestamp),
            ..Delta::default()
        };

        let (dx, dy, dz) = (current.x - base.x, current.y - base.y, current.z - base.z);
        if dx * dx + dy * dy + dz * dz > POSITION_EPSILON_SQ {
            let quantized = (quantize_offset(dx), quantize_offset(dy), quantize_offset(dz));
            delta.position = Some(match quantized {
                (Some(qx), Some(qy), Some(qz)) => PositionChange::Relative([qx, qy, qz]),
                _ => PositionChange::Absolute([current.x, current.y, current.z]),
            });
        }

        let yaw_moved = angle_distance(current.yaw, base.yaw) > ROTATION_EPSILON;
        let pitch_moved = angle_distance(current.pitch, base.pitch) > ROTATION_EPSILON;
        if yaw_moved || pitch_moved {
            let stored = [quantize_angle(current.yaw), quantize_angle(current.pitch)];
            // A change smaller than one step would decode to the same angles.
            if stored != [quantize_angle(base.yaw), quantize_angle(base.pitch)]
                || dequantize_angle(stored[0]) != base.yaw
                || dequantize_angle(stored[1]) != base.pitch
            {
                delta.rotation = Some(stored);
            }
        }

        if (current.vx - base.vx).abs() > VELOCITY_EPSILON
            || (current.vy - base.vy).abs() > VELOCITY_EPSILON
            || (current.vz - base.vz).abs() > VELOCITY_EPSILON
        {
            delta.velocity = Some([
                quantize_velocity(current.vx),
                quantize_velocity(current.vy),
                quantize_velocity(current.vz),
            ]);
        }

        if current.stance != base.stance {
            delta.stance = Some(current.stance);
        }
        if current.animation != base.animation {
            delta.animation = Some(current.animation);
        }
        if current.held_item_slot != base.held_item_slot
            || current.held_item_id != base.held_item_id
        {
            delta.held_item = Some((current.held_item_slot, current.held_item_id));
        }
        if current.health.to_bits() != base.health.to_bits() {
            delta.health = Some(current.health);
        }
        if current.armor.to_bits() != base.armor.to_bits() {
            delta.armor = Some(current.armor);
        }
        if current.status_effects != base.status_effects {
            delta.status_effects = Some(current.status_effects);
        }
        if current.movement != base.movement {
            delta.movement = Some(current.movement);
        }

        if current.action_code != 0 {
            delta.action_code = Some(current.action_code);
        }
        delta.block_action = current.block_action;

        delta
    }

    pub fn flags(&self) -> u16 {
        let mut bits = 0;
        match self.position {
            Some(PositionChange::Relative(_)) => bits |= flags::POSITION,
            Some(PositionChange::Absolute(_)) => bits |= flags::POSITION_ABSOLUTE,
            None => {}
        }
        let optional = [
            (self.rotation.is_some(), flags::ROTATION),
            (self.velocity.is_some(), flags::VELOCITY),
            (self.stance.is_some(), flags::STANCE),
            (self.animation.is_some(), flags::ANIMATION),
            (self.held_item.is_some(), flags::HELD_ITEM),
            (self.health.is_some(), flags::HEALTH),
            (self.armor.is_some(), flags::ARMOR),
            (self.status_effects.is_some(), flags::STATUS_EFFECTS),
            (self.action_code.is_some(), flags::ACTION),
            (self.block_action.is_some(), flags::BLOCK_ACTION),
            (self.movement.is_some(), flags::MOVEMENT),
        ];
        for (present, bit) in optional {
            if present {
                bits |= bit;
            }
        }
        bits
    }

    /// True when the delta only advances time.
    pub fn is_empty(&self) -> bool {
        self.flags() == 0
    }

    /// Write the frame `base` + `self` into `target`, reusing its storage.
    pub fn apply(&self, base: &Frame, target: &mut Frame) {
        target.copy_from(base);
        self.apply_in_place(target);
    }

    /// Advance `frame` (the base) by this delta.
    pub fn apply_in_place(&self, frame: &mut Frame) {
        frame.timestamp = frame.timestamp.wrapping_add(self.time_delta);

        match self.position {
            Some(PositionChange::Relative([qx, qy, qz])) => {
                frame.x += qx as f64 / POSITION_SCALE;
                frame.y += qy as f64 / POSITION_SCALE;
                frame.z += qz as f64 / POSITION_SCALE;
            }
            Some(PositionChange::Absolute([x, y, z])) => {
                frame.x = x;
                frame.y = y;
                frame.z = z;
            }
            None => {}
        }
        if let Some([yaw, pitch]) = self.rotation {
            frame.yaw = dequantize_angle(yaw);
            frame.pitch = dequantize_angle(pitch);
        }
        if let Some([vx, vy, vz]) = self.velocity {
            frame.vx = dequantize_velocity(vx);
            frame.vy = dequantize_velocity(vy);
            frame.vz = dequantize_velocity(vz);
        }
        if let Some(stance) = self.stance {
            frame.stance = stance;
        }
        if let Some(animation) = self.animation {
            frame.animation = animation;
        }
        if let Some((slot, id)) = self.held_item {
            frame.held_item_slot = slot;
            frame.held_item_id = id;
        }
        if let Some(health) = self.health {
            frame.health = health;
        }
        if let Some(armor) = self.armor {
            frame.armor = armor;
        }
        if let Some(mask) = self.status_effects {
            frame.status_effects = mask;
        }
        if let Some(movement) = self.movement {
            frame.movement = movement;
        }

        frame.action_code = self.action_code.unwrap_or(0);
        frame.block_action = self.block_action;
    }

    pub fn encoded_len(&self) -> usize {
        let mut len = 2 + varint_len(zigzag(self.time_delta));
        len += match self.position {
            Some(PositionChange::Relative(_)) => 6,
            Some(PositionChange::Absolute(_)) => 24,
            None => 0,
        };
        len += self.rotation.map_or(0, |_| 2);
        len += self.velocity.map_or(0, |_| 6);
        len += self.stance.map_or(0, |_| 1);
        len += self.animation.map_or(0, |_| 1);
        len += self.held_item.map_or(0, |_| 5);
        len += self.health.map_or(0, |_| 4);
        len += self.armor.map_or(0, |_| 4);
        len += self.status_effects.map_or(0, |_| 4);
        len += self.action_code.map_or(0, |_| 2);
        len += self.block_action.map_or(0, |_| 13);
        len += self.movement.map_or(0, |_| 1);
        len
    }

    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.flags().to_be_bytes());
        put_varint(out, zigzag(self.time_delta));

        match self.position {
            Some(PositionChange::Relative(offsets)) => {
                for q in offsets {
                    out.extend_from_slice(&q.to_be_bytes());
                }
            }
            Some(PositionChange::Absolute(coords)) => {
                for c in coords {
                    out.extend_from_slice(&c.to_be_bytes());
                }
            }
            None => {}
        }
        if let Some([yaw, pitch]) = self.rotation {
            out.push(yaw as u8);
            out.push(pitch as u8);
        }
        if let Some(velocity) = self.velocity {
            for q in velocity {
                out.extend_from_slice(&q.to_be_bytes());
            }
        }
        if let Some(stance) = self.stance {
            out.push(stance.as_u8());
        }
        if let Some(animation) = self.animation {
            out.push(animation);
        }
        if let Some((slot, id)) = self.held_item {
            out.push(slot);
            out.extend_from_slice(&id.to_be_bytes());
        }
        if let Some(health) = self.health {
            out.extend_from_slice(&health.to_be_bytes());
        }
        if let Some(armor) = self.armor {
            out.extend_from_slice(&armor.to_be_bytes());
        }
        if let Some(mask) = self.status_effects {
            out.extend_from_slice(&mask.to_be_bytes());
        }
        if let Some(code) = self.action_code {
            out.extend_from_slice(&code.to_be_bytes());
        }
        if let Some(block) = &self.block_action {
            write_block_action(block, out);
        }
        if let Some(movement) = self.movement {
            out.push(movement.pack());
        }
    }

    pub(crate) fn decode(reader: &mut ByteReader<'_>) -> Result<Delta, FormatError> {
        let bits = reader.u16()?;
        if bits & !flags::ALL != 0
            || (bits & flags::POSITION != 0 && bits & flags::POSITION_ABSOLUTE != 0)
        {
            return Err(FormatError::InvalidFlags(bits));
        }
        let has = |flag: u16| bits & flag != 0;

        let mut delta = Delta {
            time_delta: unzigzag(reader.varint()?),
            ..Delta::default()
        };

        if has(flags::POSITION) {
            let offset = [reader.i16()?, reader.i16()?, reader.i16()?];
            delta.position = Some(PositionChange::Relative(offset));
        } else if has(flags::POSITION_ABSOLUTE) {
            let position = [reader.f64()?, reader.f64()?, reader.f64()?];
            delta.position = Some(PositionChange::Absolute(position));
        }
        if has(flags::ROTATION) {
            delta.rotation = Some([reader.i8()?, reader.i8()?]);
        }
        if has(flags::VELOCITY) {
            delta.velocity = Some([reader.i16()?, reader.i16()?, reader.i16()?]);
        }
        if has(flags::STANCE) {
            let raw = reader.u8()?;
            delta.stance = Some(Stance::from_u8(raw).ok_or(FormatError::InvalidStance(raw))?);
        }
        if has(flags::ANIMATION) {
            delta.animation = Some(reader.u8()?);
        }
        if has(flags::HELD_ITEM) {
            delta.held_item = Some((reader.u8()?, reader.u32()?));
        }
        if has(flags::HEALTH) {
            delta.health = Some(reader.f32()?);
        }
        if has(flags::ARMOR) {
            delta.armor = Some(reader.f32()?);
        }
        if has(flags::STATUS_EFFECTS) {
            delta.status_effects = Some(reader.u32()?);
        }
        if has(flags::ACTION) {
            delta.action_code = Some(reader.u16()?);
        }
        if has(flags::BLOCK_ACTION) {
            delta.block_action = Some(read_block_action(reader)?);
        }
        if has(flags::MOVEMENT) {
            delta.movement = Some(Movement::unpack(reader.u8()?));
        }

        Ok(delta)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn base() -> Frame {
        let mut frame = Frame::new(Uuid::new_v4(), 1_000);
        frame.x = 100.0;
        frame.y = 64.0;
        frame.z = -20.0;
        frame.health = 20.0;
        frame.held_item_slot = 1;
        frame.held_item_id = 267;
        frame
    }

    fn round_trip(delta: &Delta) -> Delta {
        let mut out = Vec::new();
        delta.encode(&mut out);
        assert_eq!(out.len(), delta.encoded_len());
        let mut reader = ByteReader::new(&out);
        let decoded = Delta::decode(&mut reader).unwrap();
        assert_eq!(reader.remaining(), 0);
        decoded
    }

    #[test]
    fn test_unchanged_frame_is_time_only() {
        let base = base();
        let mut current = base.clone();
        current.timestamp += 50;

        let delta = Delta::compute(&base, &current);
        assert!(delta.is_empty());
        assert_eq!(delta.time_delta, 50);
        // flags + one varint byte
        assert_eq!(delta.encoded_len(), 3);
    }

    #[test]
    fn test_small_move_is_suppressed() {
        let base = base();
        let mut current = base.clone();
        current.x += 0.01;
        assert!(Delta::compute(&base, &current).position.is_none());

        current.x = base.x + 1.0;
        let delta = Delta::compute(&base, &current);
        assert_eq!(delta.position, Some(PositionChange::Relative([4096, 0, 0])));
    }

    #[test]
    fn test_large_jump_uses_absolute_position() {
        let base = base();
        let mut current = base.clone();
        current.x = 5_000.25;
        let delta = Delta::compute(&base, &current);
        assert!(matches!(delta.position, Some(PositionChange::Absolute(_))));
        assert_eq!(delta.flags() & flags::POSITION_ABSOLUTE, flags::POSITION_ABSOLUTE);

        let mut out = Frame::default();
        round_trip(&delta).apply(&base, &mut out);
        assert_eq!(out.x, 5_000.25);
    }

    #[test]
    fn test_apply_carries_unflagged_fields_forward() {
        let base = base();
        let mut current = base.clone();
        current.timestamp += 50;
        current.health = 15.5;

        let delta = Delta::compute(&base, &current);
        assert_eq!(delta.flags(), flags::HEALTH);

        let mut out = Frame::default();
        round_trip(&delta).apply(&base, &mut out);
        assert_eq!(out, current);
    }

    #[test]
    fn test_pulse_fields_do_not_persist() {
        let mut base = base();
        base.action_code = 9;
        base.block_action = Some(BlockAction { x: 1, y: 2, z: 3, action: 1 });

        let mut current = base.clone();
        current.timestamp += 50;
        current.action_code = 0;
        current.block_action = None;

        let delta = Delta::compute(&base, &current);
        assert!(delta.action_code.is_none());
        assert!(delta.block_action.is_none());

        let mut out = Frame::default();
        delta.apply(&base, &mut out);
        assert_eq!(out.action_code, 0);
        assert!(out.block_action.is_none());

        // a repeated pulse is emitted again even though it did not change
        current.action_code = 9;
        let delta = Delta::compute(&base, &current);
        assert_eq!(delta.action_code, Some(9));
    }

    #[test]
    fn test_quantization_bounds() {
        let base = base();
        let mut current = base.clone();
        current.x += 1.23456;
        current.y -= 0.98765;
        current.vx = 0.4321;
        current.vy = -3.0;
        current.yaw = 123.4;
        current.pitch = -45.6;
        current.movement.sprinting = true;

        let delta = round_trip(&Delta::compute(&base, &current));
        let mut out = Frame::default();
        delta.apply(&base, &mut out);

        assert!((out.x - current.x).abs() <= 1.0 / POSITION_SCALE);
        assert!((out.y - current.y).abs() <= 1.0 / POSITION_SCALE);
        assert!((out.vx - current.vx).abs() <= 1.0 / VELOCITY_SCALE);
        assert!((out.vy - current.vy).abs() <= 1.0 / VELOCITY_SCALE);
        assert!(angle_distance(out.yaw, current.yaw) <= 360.0 / ANGLE_STEPS);
        assert!(angle_distance(out.pitch, current.pitch) <= 360.0 / ANGLE_STEPS);
        assert!(out.movement.sprinting);
    }

    #[test]
    fn test_angle_helpers() {
        assert_eq!(quantize_angle(0.0), 0);
        assert_eq!(quantize_angle(90.0), 64);
        assert_eq!(quantize_angle(-90.0), -64);
        assert_eq!(quantize_angle(270.0), -64);
        assert_eq!(dequantize_angle(64), 90.0);
        assert!((angle_distance(179.0, -179.0) - 2.0).abs() < 1e-4);
    }

    #[test]
    fn test_static_rotation_not_reemitted() {
        let mut base = base();
        base.yaw = dequantize_angle(quantize_angle(91.0));
        let mut current = base.clone();
        current.yaw = 91.0;
        // 91.0 rounds to the step base already sits on
        assert!(Delta::compute(&base, &current).rotation.is_none());
    }

    #[test]
    fn test_invalid_flags_rejected() {
        let bytes = [0xff, 0xff, 0x00];
        let mut reader = ByteReader::new(&bytes);
        assert_eq!(Delta::decode(&mut reader), Err(FormatError::InvalidFlags(0xffff)));

        let both = (flags::POSITION | flags::POSITION_ABSOLUTE).to_be_bytes();
        let bytes = [both[0], both[1], 0x00];
        let mut reader = ByteReader::new(&bytes);
        assert!(matches!(Delta::decode(&mut reader), Err(FormatError::InvalidFlags(_))));
    }
}
