use glam::{Quat, Vec3};
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use voxel_kernel::{Entity, EntityError, EntityRegistry};

/// A connected player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Player {
    pub id: Uuid,
    pub name: String,
    pub position: Vec3,
    pub rotation: Quat,
    /// Blocks per second.
    pub velocity: Vec3,
}

impl Player {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            position: Vec3::ZERO,
            rotation: Quat::IDENTITY,
            velocity: Vec3::ZERO,
        }
    }

    pub fn at(mut self, position: Vec3) -> Self {
        self.position = position;
        self
    }

    /// Advance the position by `dt` seconds of the current velocity.
    pub fn integrate(&mut self, dt: f32) {
        self.position += self.velocity * dt;
    }
}

impl Entity for Player {
    fn world_id(&self) -> String {
        self.id.to_string()
    }
}

/// A 16x16 column of terrain, identified by its chunk coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub x: i32,
    pub z: i32,
    /// Surface height in blocks.
    pub height: u8,
}

impl Chunk {
    pub const SIZE: u32 = 16;

    const BASE_HEIGHT: u8 = 48;
    const HEIGHT_RANGE: u64 = 32;

    /// Deterministic chunk for `seed` at `(x, z)`.
    pub fn generate(seed: u64, x: i32, z: i32) -> Self {
        let coords = (u64::from(x as u32) << 32) | u64::from(z as u32);
        let noise = splitmix64(seed ^ splitmix64(coords));
        Self {
            x,
            z,
            height: Self::BASE_HEIGHT + (noise % Self::HEIGHT_RANGE) as u8,
        }
    }

    pub fn id_for(x: i32, z: i32) -> String {
        format!("chunk_{x}_{z}")
    }
}

impl Entity for Chunk {
    fn world_id(&self) -> String {
        Self::id_for(self.x, self.z)
    }
}

/// Registry with every game entity type under its stable tag.
pub fn entity_registry() -> Result<EntityRegistry, EntityError> {
    let mut registry = EntityRegistry::new();
    registry.register_as::<Player>("Player")?;
    registry.register_as::<Chunk>("Chunk")?;
    Ok(registry)
}

fn splitmix64(mut state: u64) -> u64 {
    state = state.wrapping_add(0x9e37_79b9_7f4a_7c15);
    let mut z = state;
    z = (z ^ (z >> 30)).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94d0_49bb_1331_11eb);
    z ^ (z >> 31)
}

#[cfg(test)]
mod tests {
    use super::*;
    use voxel_kernel::World;

    #[test]
    fn chunk_ids_use_signed_coordinates() {
        assert_eq!(Chunk::generate(1, 3, -2).world_id(), "chunk_3_-2");
    }

    #[test]
    fn chunk_generation_is_deterministic() {
        for (x, z) in [(0, 0), (-5, 7), (i32::MAX, i32::MIN)] {
            let a = Chunk::generate(42, x, z);
            assert_eq!(a, Chunk::generate(42, x, z));
            assert!((48..80).contains(&a.height));
        }
        let heights: Vec<u8> = (0..16).map(|x| Chunk::generate(42, x, 0).height).collect();
        assert!(heights.iter().any(|h| *h != heights[0]));
    }

    #[test]
    fn player_integrates_velocity() {
        let mut player = Player::new("steve").at(Vec3::new(1.0, 64.0, 1.0));
        player.velocity = Vec3::new(2.0, 0.0, -4.0);
        player.integrate(0.5);
        assert_eq!(player.position, Vec3::new(2.0, 64.0, -1.0));
    }

    #[test]
    fn world_with_game_entities_survives_serialization() {
        let registry = entity_registry().unwrap();
        let mut player = Player::new("alex").at(Vec3::new(0.5, 70.0, -3.25));
        player.velocity = Vec3::new(0.0, -9.5, 0.0);
        let player_id = player.world_id();

        let mut world = World::new();
        world.add_entity(Chunk::generate(7, 0, 0));
        world.add_entity(player.clone());
        world.add_entity(Chunk::generate(7, 1, 0));

        let data = world.serialize(&registry).unwrap();
        assert_eq!(data.entities[1]["__t"], "Player");
        assert_eq!(data.entities[0]["__t"], "Chunk");

        let restored = World::deserialize(&registry, data).unwrap();
        assert_eq!(restored.len(), 3);
        assert_eq!(restored.get::<Player>(&player_id), Some(&player));
        assert_eq!(restored.get::<Chunk>("chunk_1_0"), Some(&Chunk::generate(7, 1, 0)));
        assert_eq!(
            restored.ids().collect::<Vec<_>>(),
            vec!["chunk_0_0", player_id.as_str(), "chunk_1_0"]
        );
    }

    #[test]
    fn registry_rejects_reregistration() {
        let mut registry = entity_registry().unwrap();
        assert!(registry.register::<Player>().is_err());
    }
}
