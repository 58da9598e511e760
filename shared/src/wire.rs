//! bincode settings shared by every structured section on the wire.
//!
//! Integers are fixed width and little endian so header sizes are constants.
//! Trailing bytes are allowed because token sections are zero padded.

use bincode::Options;
use serde::{Deserialize, Serialize};

fn options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
        .allow_trailing_bytes()
}

pub(crate) fn serialize<T: Serialize>(value: &T) -> bincode::Result<Vec<u8>> {
    options().serialize(value)
}

pub(crate) fn serialize_into<T: Serialize>(out: &mut Vec<u8>, value: &T) -> bincode::Result<()> {
    options().serialize_into(out, value)
}

pub(crate) fn deserialize<'a, T: Deserialize<'a>>(bytes: &'a [u8]) -> bincode::Result<T> {
    options()
        .with_limit(bytes.len() as u64)
        .deserialize(bytes)
}
