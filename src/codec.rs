//! Wire codec between line-oriented frame blocks and addressed messages.
//!
//! A [`WireMessage`] carries one or more characters' channel blocks under a
//! single address:
//!
//! ```text
//! "/" [ pct(prefix) ":" ] pct(id_1) "&" pct(id_2) ... "&" pct(id_n)
//! ```
//!
//! Components are percent-encoded with the `encodeURIComponent` escape set,
//! so the `:` and `&` separators can never appear unescaped inside a prefix
//! or character id — the prefix split is an unambiguous single right-hand
//! split. Args are a flat numeric sequence, `n * transform_count * 6` values
//! in character order, then transform order, then channel order.
//!
//! On the wire a message is standard OSC 1.0 framing: NUL-terminated
//! 4-byte-padded address, a `,fff...` type-tag string, then big-endian f32
//! arguments.

use std::fmt::Write as _;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use percent_encoding::{percent_decode_str, utf8_percent_encode, AsciiSet, NON_ALPHANUMERIC};

use crate::error::CodecError;
use crate::frame::{parse_channels, PRECISION, RECORD_SENTINEL};
use crate::skeleton::Skeleton;

/// Separates the optional address prefix from the character ids.
pub const PREFIX_SEPARATOR: char = ':';

/// Separates character ids within one address.
pub const CHAR_ID_SEPARATOR: char = '&';

/// `encodeURIComponent`'s escape set: everything except ASCII alphanumerics
/// and `- _ . ! ~ * ' ( )`.
const COMPONENT: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'-')
    .remove(b'_')
    .remove(b'.')
    .remove(b'!')
    .remove(b'~')
    .remove(b'*')
    .remove(b'\'')
    .remove(b'(')
    .remove(b')');

/// The addressed numeric message carried over UDP and mesh links.
#[derive(Debug, Clone, PartialEq)]
pub struct WireMessage {
    pub address: String,
    pub args: Vec<f32>,
}

impl WireMessage {
    /// Serialize to the binary wire form.
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(
            padded_len(self.address.len()) + padded_len(1 + self.args.len()) + self.args.len() * 4,
        );
        put_padded_str(&mut buf, &self.address);

        let mut tags = String::with_capacity(1 + self.args.len());
        tags.push(',');
        for _ in &self.args {
            tags.push('f');
        }
        put_padded_str(&mut buf, &tags);

        for arg in &self.args {
            buf.put_f32(*arg);
        }
        buf.freeze()
    }

    /// Parse the binary wire form.
    pub fn from_bytes(mut buf: &[u8]) -> Result<Self, CodecError> {
        let address = read_padded_str(&mut buf)?;
        if !address.starts_with('/') {
            return Err(CodecError::BadAddress { address });
        }

        let tags = read_padded_str(&mut buf)?;
        let Some(tags) = tags.strip_prefix(',') else {
            return Err(CodecError::Truncated);
        };

        let mut args = Vec::with_capacity(tags.len());
        for tag in tags.chars() {
            match tag {
                'f' => {
                    if buf.remaining() < 4 {
                        return Err(CodecError::Truncated);
                    }
                    args.push(buf.get_f32());
                }
                other => return Err(CodecError::UnsupportedArg { tag: other }),
            }
        }

        Ok(Self { address, args })
    }
}

/// String length padded to the next multiple of 4, counting the NUL.
fn padded_len(len: usize) -> usize {
    (len / 4 + 1) * 4
}

fn put_padded_str(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    for _ in s.len()..padded_len(s.len()) {
        buf.put_u8(0);
    }
}

fn read_padded_str(buf: &mut &[u8]) -> Result<String, CodecError> {
    let nul = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or(CodecError::Truncated)?;
    let s = std::str::from_utf8(&buf[..nul])
        .map_err(|_| CodecError::InvalidUtf8)?
        .to_string();
    let consumed = padded_len(nul);
    if consumed > buf.len() {
        return Err(CodecError::Truncated);
    }
    buf.advance(consumed);
    Ok(s)
}

/// How a frame block should be packed into wire messages.
#[derive(Debug, Clone, Copy, Default)]
pub struct EncodeOptions<'a> {
    /// Optional routing prefix, percent-encoded into the address.
    pub address_prefix: Option<&'a str>,
    /// Emit one message per character instead of a single combined message.
    pub split_per_character: bool,
}

/// A decoded wire message: the routing prefix and one text record per
/// character, values formatted to two decimals.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedFrames {
    pub address_prefix: Option<String>,
    pub records: Vec<String>,
}

/// Encode a text frame block into wire messages.
///
/// The block holds one or more character records, each terminated by the
/// `" ||"` sentinel; whatever trails the final sentinel is discarded. Each
/// record's trailing `transform_count * 6` tokens are the channel block and
/// everything before them is the character id.
///
/// With `split_per_character` one message per character is returned;
/// otherwise a single combined message (a one-element vec).
pub fn encode_frames(
    block: &str,
    skeleton: &Skeleton,
    options: &EncodeOptions<'_>,
) -> Result<Vec<WireMessage>, CodecError> {
    let block_size = skeleton.block_size();

    let mut pieces: Vec<&str> = block.split(RECORD_SENTINEL).collect();
    // The fragment after the final sentinel is incomplete by definition.
    pieces.pop();

    let mut ids: Vec<String> = Vec::with_capacity(pieces.len());
    let mut blocks: Vec<Vec<f32>> = Vec::with_capacity(pieces.len());
    for piece in pieces {
        let tokens: Vec<&str> = piece.split_whitespace().collect();
        if tokens.len() <= block_size {
            return Err(CodecError::TruncatedRecord {
                channels: block_size,
            });
        }
        let split = tokens.len() - block_size;
        ids.push(tokens[..split].join(" "));
        blocks.push(parse_channels(&tokens[split..])?);
    }
    if ids.is_empty() {
        return Err(CodecError::EmptyBlock);
    }

    let prefix = options
        .address_prefix
        .map(|p| format!("{}{}", utf8_percent_encode(p, COMPONENT), PREFIX_SEPARATOR))
        .unwrap_or_default();

    if options.split_per_character {
        Ok(ids
            .into_iter()
            .zip(blocks)
            .map(|(id, args)| WireMessage {
                address: format!("/{prefix}{}", utf8_percent_encode(&id, COMPONENT)),
                args,
            })
            .collect())
    } else {
        let address = format!(
            "/{prefix}{}",
            ids.iter()
                .map(|id| utf8_percent_encode(id, COMPONENT).to_string())
                .collect::<Vec<_>>()
                .join(&CHAR_ID_SEPARATOR.to_string())
        );
        Ok(vec![WireMessage {
            address,
            args: blocks.into_iter().flatten().collect(),
        }])
    }
}

/// Decode a wire message back into per-character text records.
pub fn decode_frames(
    message: &WireMessage,
    skeleton: &Skeleton,
) -> Result<DecodedFrames, CodecError> {
    let rest = message
        .address
        .strip_prefix('/')
        .ok_or_else(|| CodecError::BadAddress {
            address: message.address.clone(),
        })?;
    if rest.is_empty() {
        return Err(CodecError::BadAddress {
            address: message.address.clone(),
        });
    }

    // A single right-hand split: encoded components cannot contain a bare
    // separator, so the rightmost `:` is always the prefix boundary.
    let (address_prefix, ids_part) = match rest.rsplit_once(PREFIX_SEPARATOR) {
        Some((prefix, ids)) => (Some(decode_component(prefix)?), ids),
        None => (None, rest),
    };

    let ids = ids_part
        .split(CHAR_ID_SEPARATOR)
        .map(decode_component)
        .collect::<Result<Vec<_>, _>>()?;

    let block_size = skeleton.block_size();
    if message.args.len() != ids.len() * block_size {
        return Err(CodecError::UnevenArgs {
            got: message.args.len(),
            block: block_size,
        });
    }

    let records = ids
        .into_iter()
        .enumerate()
        .map(|(i, id)| {
            let mut record = id;
            for value in &message.args[i * block_size..(i + 1) * block_size] {
                write!(record, " {value:.prec$}", prec = PRECISION)
                    .expect("writing to a String cannot fail");
            }
            record.push_str(RECORD_SENTINEL);
            record
        })
        .collect();

    Ok(DecodedFrames {
        address_prefix,
        records,
    })
}

fn decode_component(component: &str) -> Result<String, CodecError> {
    percent_decode_str(component)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| CodecError::InvalidEscape)
}
