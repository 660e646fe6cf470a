//! Math types carried on the wire.
//!
//! Kept small: the simulation owns real transform math, the replication core
//! only moves values around and compares them.

use serde::{Deserialize, Serialize};

use crate::codec::{Decode, DecodeError, Encode, PacketReader, PacketWriter};

/// 3D vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Vec3 {
    pub x: f32,
    pub y: f32,
    pub z: f32,
}

impl Vec3 {
    pub const ZERO: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
    };

    pub const fn new(x: f32, y: f32, z: f32) -> Self {
        Self { x, y, z }
    }

    pub fn dot(self, rhs: Self) -> f32 {
        self.x * rhs.x + self.y * rhs.y + self.z * rhs.z
    }

    pub fn len_sq(self) -> f32 {
        self.dot(self)
    }

    pub fn distance_sq(self, rhs: Self) -> f32 {
        (self - rhs).len_sq()
    }

    pub fn lerp(self, to: Self, t: f32) -> Self {
        let t = t.clamp(0.0, 1.0);
        Self::new(
            self.x + (to.x - self.x) * t,
            self.y + (to.y - self.y) * t,
            self.z + (to.z - self.z) * t,
        )
    }
}

impl std::ops::Sub for Vec3 {
    type Output = Vec3;

    fn sub(self, rhs: Self) -> Self::Output {
        Vec3::new(self.x - rhs.x, self.y - rhs.y, self.z - rhs.z)
    }
}

impl std::ops::Add for Vec3 {
    type Output = Vec3;

    fn add(self, rhs: Self) -> Self::Output {
        Vec3::new(self.x + rhs.x, self.y + rhs.y, self.z + rhs.z)
    }
}

impl Encode for Vec3 {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_f32(self.x);
        w.put_f32(self.y);
        w.put_f32(self.z);
    }
}

impl Decode for Vec3 {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Vec3::new(r.get_f32()?, r.get_f32()?, r.get_f32()?))
    }
}

/// Rotation quaternion, `w` last as on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Quat {
    pub x: f32,
    pub y: f32,
    pub z: f32,
    pub w: f32,
}

impl Quat {
    pub const IDENTITY: Self = Self {
        x: 0.0,
        y: 0.0,
        z: 0.0,
        w: 1.0,
    };

    pub const fn new(x: f32, y: f32, z: f32, w: f32) -> Self {
        Self { x, y, z, w }
    }
}

impl Default for Quat {
    fn default() -> Self {
        Self::IDENTITY
    }
}

impl Encode for Quat {
    fn encode(&self, w: &mut PacketWriter) {
        w.put_f32(self.x);
        w.put_f32(self.y);
        w.put_f32(self.z);
        w.put_f32(self.w);
    }
}

impl Decode for Quat {
    fn decode(r: &mut PacketReader<'_>) -> Result<Self, DecodeError> {
        Ok(Quat::new(r.get_f32()?, r.get_f32()?, r.get_f32()?, r.get_f32()?))
    }
}
