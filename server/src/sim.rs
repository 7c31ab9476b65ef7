//! Simulated players for running the engine without a game attached.
//!
//! Players wander around a flat arena with some jumping, sneaking and the
//! odd swing. The binary uses this as its live-state source; tests use it to
//! produce realistic movement.

use std::collections::HashMap;
use std::sync::Mutex;

use common::{BlockAction, Movement, PseudoRandom, Stance};
use uuid::Uuid;

use crate::orchestrator::{LivePlayerState, PlayerSnapshot};

const ARENA_HALF_WIDTH: f64 = 48.0;
const GROUND_Y: f64 = 64.0;
const WALK_SPEED: f64 = 0.2;
const GRAVITY: f64 = 0.08;

#[derive(Debug, Clone)]
pub struct SimPlayer {
    pub id: Uuid,
    pub name: String,
    snapshot: PlayerSnapshot,
    heading: f32,
}

struct World {
    rng: PseudoRandom,
    players: HashMap<Uuid, SimPlayer>,
    tps: f64,
}

/// Thread-safe simulated world. `step` advances every player by one tick.
pub struct SimulatedWorld {
    inner: Mutex<World>,
}

impl SimulatedWorld {
    pub fn new(seed: u64) -> Self {
        Self {
            inner: Mutex::new(World {
                rng: PseudoRandom::new(seed),
                players: HashMap::new(),
                tps: 20.0,
            }),
        }
    }

    fn world(&self) -> std::sync::MutexGuard<'_, World> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn spawn(&self, name: &str) -> Uuid {
        let mut world = self.world();
        let id = Uuid::new_v4();
        let x = world.rng.next_range(-ARENA_HALF_WIDTH, ARENA_HALF_WIDTH);
        let z = world.rng.next_range(-ARENA_HALF_WIDTH, ARENA_HALF_WIDTH);
        let heading = world.rng.next_range(0.0, 360.0) as f32;

        let mut snapshot = PlayerSnapshot::at(x, GROUND_Y, z);
        snapshot.yaw = heading;
        snapshot.movement.on_ground = true;
        snapshot.held_item_id = 1;
        world.players.insert(
            id,
            SimPlayer {
                id,
                name: name.to_string(),
                snapshot,
                heading,
            },
        );
        id
    }

    pub fn despawn(&self, id: Uuid) -> Option<SimPlayer> {
        self.world().players.remove(&id)
    }

    pub fn players(&self) -> Vec<(Uuid, String)> {
        self.world()
            .players
            .values()
            .map(|p| (p.id, p.name.clone()))
            .collect()
    }

    pub fn set_tps(&self, tps: f64) {
        self.world().tps = tps;
    }

    /// Advance the world by one server tick.
    pub fn step(&self) {
        let mut world = self.world();
        let World { rng, players, .. } = &mut *world;
        for player in players.values_mut() {
            step_player(rng, player);
        }
    }

    /// Roll for a random event on one player; true with probability `p`.
    pub fn roll(&self, p: f64) -> Option<Uuid> {
        let mut world = self.world();
        if world.players.is_empty() || !world.rng.chance(p) {
            return None;
        }
        let index = (world.rng.next_u32() as usize) % world.players.len();
        world.players.keys().nth(index).copied()
    }
}

fn step_player(rng: &mut PseudoRandom, player: &mut SimPlayer) {
    let s = &mut player.snapshot;

    // pulses last a single tick
    s.action_code = 0;
    s.block_action = None;

    if rng.chance(0.05) {
        player.heading = (player.heading + rng.next_range(-60.0, 60.0) as f32).rem_euclid(360.0);
    }
    let sneaking = if rng.chance(0.01) {
        !s.movement.sneaking
    } else {
        s.movement.sneaking
    };
    let sprinting = !sneaking && rng.chance(0.3);
    let speed = if sneaking {
        WALK_SPEED * 0.3
    } else if sprinting {
        WALK_SPEED * 1.3
    } else {
        WALK_SPEED
    };

    let radians = (player.heading as f64).to_radians();
    s.vx = -radians.sin() * speed;
    s.vz = radians.cos() * speed;

    if s.movement.on_ground && rng.chance(0.03) {
        s.vy = 0.42;
    } else if !s.movement.on_ground {
        s.vy -= GRAVITY;
    } else {
        s.vy = 0.0;
    }

    s.x = (s.x + s.vx).clamp(-ARENA_HALF_WIDTH, ARENA_HALF_WIDTH);
    s.z = (s.z + s.vz).clamp(-ARENA_HALF_WIDTH, ARENA_HALF_WIDTH);
    s.y += s.vy;
    if s.y <= GROUND_Y {
        s.y = GROUND_Y;
        s.vy = 0.0;
    }

    s.yaw = player.heading + rng.next_range(-2.0, 2.0) as f32;
    s.pitch = (s.pitch + rng.next_range(-1.5, 1.5) as f32).clamp(-90.0, 90.0);
    s.movement = Movement {
        on_ground: s.y <= GROUND_Y,
        sprinting,
        sneaking,
        ..s.movement
    };
    s.stance = if sneaking { Stance::Sneaking } else { Stance::Standing };

    if rng.chance(0.05) {
        s.action_code = 1;
        s.animation = 1;
    } else {
        s.animation = 0;
    }
    if rng.chance(0.01) {
        s.block_action = Some(BlockAction {
            x: s.x.floor() as i32,
            y: GROUND_Y as i32 - 1,
            z: s.z.floor() as i32,
            action: 0,
        });
    }
    if rng.chance(0.01) {
        s.health = (s.health - 1.0).max(1.0);
    }
    if rng.chance(0.02) {
        s.held_item_slot = (rng.next_u32() % 9) as u8;
    }
}

impl LivePlayerState for SimulatedWorld {
    fn snapshot(&self, player_id: Uuid) -> Option<PlayerSnapshot> {
        self.world().players.get(&player_id).map(|p| p.snapshot)
    }

    fn server_tps(&self) -> f64 {
        self.world().tps
    }
}
