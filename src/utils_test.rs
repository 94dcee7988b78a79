use anyhow::{Context, Result};

use crate::config::Config;
use crate::database::Database;
use crate::utils;

const ERR_MSG_ITER: &str = "error iterating scanned data";
const PREFIX_A: u8 = b'a';
/// We use this in tests as it is middle in lexicographical sort order.
const PREFIX_B: u8 = b'b';
const PREFIX_C: u8 = b'c';

#[tokio::test]
async fn test_ordered_i64_keys_scan_in_numeric_order() -> Result<()> {
    let (config, _tmpdir) = Config::new_test()?;
    let db = Database::new(config.clone()).await?;
    let tree = db.get_partition_tree(1).await?;

    // Load signed keys distributed across three key prefixes. Negative keys must sort before
    // positive keys for prefix scans to visit them in numeric order.
    let keys: Vec<i64> = (-500..=500).chain([i64::MIN, i64::MAX]).collect();
    for prefix in [PREFIX_A, PREFIX_B, PREFIX_C] {
        let mut batch = sled::Batch::default();
        for key in keys.iter() {
            let encoded: Vec<u8> = std::iter::once(prefix).chain(utils::encode_i64_ordered(*key)).collect();
            batch.insert(encoded, &utils::encode_u64(*key as u64));
        }
        tree.apply_batch(batch).context("error inserting data")?;
    }

    let mut expected = keys.clone();
    expected.sort_unstable();
    let mut scanned = Vec::with_capacity(expected.len());
    for kv_res in tree.scan_prefix([PREFIX_B]) {
        let (key, val) = kv_res.context(ERR_MSG_ITER)?;
        assert_eq!(key[0], PREFIX_B, "bad key prefix: got {}; expected: {};", key[0], PREFIX_B);
        let key = utils::decode_i64_ordered(&key[1..])?;
        let val = utils::decode_u64(&val)? as i64;
        assert_eq!(key, val, "stored value does not match its key, expected {} got {}", key, val);
        scanned.push(key);
    }
    assert_eq!(
        scanned, expected,
        "expected prefix scan to yield {} keys in numeric order, got {} keys",
        expected.len(),
        scanned.len()
    );

    Ok(())
}

#[test]
fn test_fixed_width_decoders_reject_bad_lengths() {
    assert!(utils::decode_u64(&[0u8; 7]).is_err(), "expected decode_u64 to reject a 7 byte input");
    assert!(utils::decode_u32(&[0u8; 5]).is_err(), "expected decode_u32 to reject a 5 byte input");
    assert!(utils::decode_i64_ordered(&[]).is_err(), "expected decode_i64_ordered to reject an empty input");
    let encoded = utils::encode_u32(42);
    let decoded = utils::decode_u32(&encoded).unwrap_or_default();
    assert_eq!(decoded, 42, "expected u32 to decode to {} got {}", 42, decoded);
}
