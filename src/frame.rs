//! Motion frame data model and its text-line serialization.
//!
//! One [`Frame`] is a single time-sample for one named subject: a set of
//! uniquely named segments, each carrying the six channels of
//! [`DATA_CHANNEL_ORDER`]. The line format is what capture/playback tooling
//! speaks over UDP:
//!
//! ```text
//! <index> <name> <v1> <v2> ... <vK> ||
//! ```
//!
//! with `K = transform_count * 6` and every value formatted to exactly two
//! decimal digits. Round-trips are lossy beyond that precision by design.

use std::collections::HashMap;
use std::fmt::Write as _;

use serde::{Deserialize, Serialize};

use crate::error::CodecError;
use crate::skeleton::{DataChannel, Skeleton, DATA_CHANNELS, DATA_CHANNEL_ORDER};

/// Decimal digits kept when formatting channel values.
pub const PRECISION: usize = 2;

/// Record terminator in the line format.
pub const RECORD_SENTINEL: &str = " ||";

/// Six numeric channels of one skeletal segment.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub posx: f32,
    pub posy: f32,
    pub posz: f32,
    pub rotx: f32,
    pub roty: f32,
    pub rotz: f32,
}

impl Segment {
    /// Value of one channel.
    pub fn channel(&self, channel: DataChannel) -> f32 {
        match channel {
            DataChannel::PosX => self.posx,
            DataChannel::PosY => self.posy,
            DataChannel::PosZ => self.posz,
            DataChannel::RotX => self.rotx,
            DataChannel::RotY => self.roty,
            DataChannel::RotZ => self.rotz,
        }
    }

    fn from_channels(values: &[f32]) -> Self {
        debug_assert_eq!(values.len(), DATA_CHANNELS);
        Self {
            posx: values[0],
            posy: values[1],
            posz: values[2],
            rotx: values[3],
            roty: values[4],
            rotz: values[5],
        }
    }
}

/// One subject's motion sample: a name plus per-segment channels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub name: String,
    pub segments: HashMap<String, Segment>,
}

impl Frame {
    /// Serialize a standard frame whose segment names follow `skeleton`.
    ///
    /// Missing segments and non-finite channel values are normalized to `0`
    /// before formatting, so a partially captured frame still serializes.
    pub fn to_line(&self, skeleton: &Skeleton) -> String {
        self.line_with(skeleton, |transform| self.segments.get(transform))
    }

    /// Serialize a raw frame whose segment names are mapped through
    /// `name_table` (standard transform name -> raw segment name).
    pub fn to_line_mapped(&self, skeleton: &Skeleton, name_table: &HashMap<String, String>) -> String {
        self.line_with(skeleton, |transform| {
            name_table.get(transform).and_then(|raw| self.segments.get(raw))
        })
    }

    fn line_with<'a, F>(&self, skeleton: &Skeleton, lookup: F) -> String
    where
        F: Fn(&str) -> Option<&'a Segment>,
    {
        let mut line = String::with_capacity(16 + skeleton.block_size() * 8);
        write!(line, "0 {}", self.name).expect("writing to a String cannot fail");
        for transform in skeleton.transform_order() {
            let segment = lookup(transform);
            for channel in DATA_CHANNEL_ORDER {
                let value = segment.map(|s| s.channel(channel)).unwrap_or(0.0);
                let value = if value.is_finite() { value } else { 0.0 };
                write!(line, " {value:.prec$}", prec = PRECISION)
                    .expect("writing to a String cannot fail");
            }
        }
        line.push_str(RECORD_SENTINEL);
        line
    }

    /// Parse one line back into a frame, assigning the trailing channel
    /// block to `skeleton`'s transforms in order.
    ///
    /// The name is every token before the trailing fixed-size numeric
    /// block, so the leading frame index stays part of the parsed name.
    pub fn from_line(line: &str, skeleton: &Skeleton) -> Result<Self, CodecError> {
        let body = line.strip_suffix(RECORD_SENTINEL).unwrap_or(line);
        let tokens: Vec<&str> = body.split_whitespace().collect();
        let block = skeleton.block_size();
        if tokens.len() < block {
            return Err(CodecError::TruncatedRecord { channels: block });
        }

        let split = tokens.len() - block;
        let name = tokens[..split].join(" ");
        let values = parse_channels(&tokens[split..])?;

        let segments = skeleton
            .transform_order()
            .iter()
            .enumerate()
            .map(|(i, transform)| {
                let channels = &values[i * DATA_CHANNELS..(i + 1) * DATA_CHANNELS];
                (transform.clone(), Segment::from_channels(channels))
            })
            .collect();

        Ok(Self { name, segments })
    }
}

/// Parse a run of channel tokens, rejecting anything non-numeric.
pub(crate) fn parse_channels(tokens: &[&str]) -> Result<Vec<f32>, CodecError> {
    tokens
        .iter()
        .map(|token| {
            token.parse::<f32>().map_err(|_| CodecError::NonNumericChannel {
                token: (*token).to_string(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_bone_skeleton() -> Skeleton {
        Skeleton::new(["Hips", "Head"]).unwrap()
    }

    fn segment(base: f32) -> Segment {
        Segment {
            posx: base,
            posy: base + 0.1,
            posz: base + 0.2,
            rotx: base + 0.3,
            roty: base + 0.4,
            rotz: base + 0.5,
        }
    }

    #[test]
    fn line_round_trip_within_precision() {
        let skeleton = two_bone_skeleton();
        let frame = Frame {
            name: "Avatar".into(),
            segments: HashMap::from([
                ("Hips".into(), segment(1.0)),
                ("Head".into(), segment(-2.0)),
            ]),
        };

        let line = frame.to_line(&skeleton);
        assert!(line.starts_with("0 Avatar "));
        assert!(line.ends_with(" ||"));

        let parsed = Frame::from_line(&line, &skeleton).unwrap();
        // The leading index stays part of the parsed name.
        assert_eq!(parsed.name, "0 Avatar");
        let hips = parsed.segments["Hips"];
        assert!((hips.posx - 1.0).abs() < 0.005);
        assert!((hips.rotz - 1.5).abs() < 0.005);
    }

    #[test]
    fn non_finite_channels_serialize_as_zero() {
        let skeleton = Skeleton::new(["Hips"]).unwrap();
        let frame = Frame {
            name: "A".into(),
            segments: HashMap::from([(
                "Hips".into(),
                Segment {
                    posx: f32::NAN,
                    posy: f32::INFINITY,
                    ..Segment::default()
                },
            )]),
        };
        assert_eq!(frame.to_line(&skeleton), "0 A 0.00 0.00 0.00 0.00 0.00 0.00 ||");
    }

    #[test]
    fn missing_segment_serializes_as_zeros() {
        let skeleton = two_bone_skeleton();
        let frame = Frame {
            name: "A".into(),
            segments: HashMap::from([("Hips".into(), segment(1.0))]),
        };
        let line = frame.to_line(&skeleton);
        assert!(line.ends_with("0.00 0.00 0.00 0.00 0.00 0.00 ||"));
    }

    #[test]
    fn mapped_frame_reads_raw_segment_names() {
        let skeleton = Skeleton::new(["Hips"]).unwrap();
        let frame = Frame {
            name: "A".into(),
            segments: HashMap::from([("pelvis".into(), segment(3.0))]),
        };
        let table = HashMap::from([("Hips".to_string(), "pelvis".to_string())]);
        assert_eq!(
            frame.to_line_mapped(&skeleton, &table),
            "0 A 3.00 3.10 3.20 3.30 3.40 3.50 ||"
        );
    }

    #[test]
    fn multi_word_names_survive_parsing() {
        let skeleton = Skeleton::new(["Hips"]).unwrap();
        let line = "0 Motion Capture Subject 1.00 2.00 3.00 4.00 5.00 6.00 ||";
        let parsed = Frame::from_line(line, &skeleton).unwrap();
        assert_eq!(parsed.name, "0 Motion Capture Subject");
    }

    #[test]
    fn short_line_is_rejected() {
        let skeleton = two_bone_skeleton();
        let err = Frame::from_line("0 A 1.00 2.00 ||", &skeleton).unwrap_err();
        assert!(matches!(err, CodecError::TruncatedRecord { channels: 12 }));
    }

    #[test]
    fn non_numeric_channel_is_rejected() {
        let skeleton = Skeleton::new(["Hips"]).unwrap();
        let err = Frame::from_line("A 1.0 2.0 x 4.0 5.0 6.0 ||", &skeleton).unwrap_err();
        assert!(matches!(err, CodecError::NonNumericChannel { token } if token == "x"));
    }
}
