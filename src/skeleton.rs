//! Reference skeleton and channel ordering.
//!
//! Every motion frame carries, per skeletal transform, six numeric channels
//! in the fixed order position x/y/z then rotation x/y/z. The skeleton
//! pins the transform order, so a character's channel block is always
//! `transform_count() * 6` values long on the wire and in text lines.

use serde::{Deserialize, Serialize};

use crate::error::CodecError;

/// Per-transform channels, in wire order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DataChannel {
    PosX,
    PosY,
    PosZ,
    RotX,
    RotY,
    RotZ,
}

/// The fixed channel order within one transform's block.
pub const DATA_CHANNEL_ORDER: [DataChannel; 6] = [
    DataChannel::PosX,
    DataChannel::PosY,
    DataChannel::PosZ,
    DataChannel::RotX,
    DataChannel::RotY,
    DataChannel::RotZ,
];

/// Number of numeric channels per transform.
pub const DATA_CHANNELS: usize = DATA_CHANNEL_ORDER.len();

/// Transform names of the standard humanoid reference skeleton, in the
/// order their channel blocks appear on the wire.
pub const STANDARD_TRANSFORMS: [&str; 21] = [
    "Hips",
    "Spine",
    "Spine1",
    "Spine2",
    "Neck",
    "Head",
    "RightShoulder",
    "RightArm",
    "RightForeArm",
    "RightHand",
    "LeftShoulder",
    "LeftArm",
    "LeftForeArm",
    "LeftHand",
    "RightUpLeg",
    "RightLeg",
    "RightFoot",
    "LeftUpLeg",
    "LeftLeg",
    "LeftFoot",
    "Hips_end",
];

/// An ordered set of uniquely named skeletal transforms.
///
/// The codec is parameterized on a skeleton rather than a process-wide
/// constant: standard frames use [`Skeleton::standard`], raw capture
/// sources supply their own order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Skeleton {
    transforms: Vec<String>,
}

impl Skeleton {
    /// Build a skeleton from an explicit transform order.
    ///
    /// Fails if the list is empty or contains a duplicate name.
    pub fn new<I, S>(transforms: I) -> Result<Self, CodecError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let transforms: Vec<String> = transforms.into_iter().map(Into::into).collect();
        if transforms.is_empty() {
            return Err(CodecError::EmptySkeleton);
        }
        for (i, name) in transforms.iter().enumerate() {
            if transforms[..i].contains(name) {
                return Err(CodecError::DuplicateTransform { name: name.clone() });
            }
        }
        Ok(Self { transforms })
    }

    /// The fixed reference skeleton shared by all standard frames.
    pub fn standard() -> Self {
        Self {
            transforms: STANDARD_TRANSFORMS.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Transform names in wire order.
    pub fn transform_order(&self) -> &[String] {
        &self.transforms
    }

    /// Number of transforms.
    pub fn transform_count(&self) -> usize {
        self.transforms.len()
    }

    /// Numeric values per character: `transform_count() * 6`.
    pub fn block_size(&self) -> usize {
        self.transforms.len() * DATA_CHANNELS
    }
}
