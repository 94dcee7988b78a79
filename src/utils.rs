use anyhow::{bail, Context, Result};
use prost::Message;

/// Encode the given u64 as an array of big-endian bytes.
pub fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u64.
pub fn decode_u64(val: &[u8]) -> Result<u64> {
    match val {
        [b0, b1, b2, b3, b4, b5, b6, b7] => Ok(u64::from_be_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, *b7])),
        _ => bail!("invalid byte array given to decode as u64, invalid len {} needed 8", val.len()),
    }
}

/// Encode the given i64 as an array of big-endian bytes which sort in numeric order.
///
/// The sign bit is flipped so that negative values sort before positive values when compared
/// lexicographically, which plain two's complement encoding does not do.
pub fn encode_i64_ordered(val: i64) -> [u8; 8] {
    ((val as u64) ^ (1 << 63)).to_be_bytes()
}

/// Decode the given bytes as an i64 encoded via `encode_i64_ordered`.
pub fn decode_i64_ordered(val: &[u8]) -> Result<i64> {
    decode_u64(val).map(|raw| (raw ^ (1 << 63)) as i64)
}

/// Encode the given u32 as an array of big-endian bytes.
pub fn encode_u32(val: u32) -> [u8; 4] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u32.
pub fn decode_u32(val: &[u8]) -> Result<u32> {
    match val {
        [b0, b1, b2, b3] => Ok(u32::from_be_bytes([*b0, *b1, *b2, *b3])),
        _ => bail!("invalid byte array given to decode as u32, invalid len {} needed 4", val.len()),
    }
}

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Message>(model: &M) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(model.encoded_len());
    model.encode(&mut buf).context("error serializing data model")?;
    Ok(buf)
}

/// Decode an object from the given buffer.
pub fn decode_model<M: Message + Default>(data: &[u8]) -> Result<M> {
    M::decode(data).context("error decoding object from storage")
}

/// The current time as milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
