//! Persisted layout of lock rows and claim columns.
//!
//! ```text
//! lock row key : u32 BE key length | key bytes | column bytes
//! claim column : u64 BE timestamp nanos | rid bytes
//! claim value  : tag (0 = plain, 1 = fingerprinted) [| u64 BE xxh64 of expected value]
//! ```
//!
//! Putting the rid in the column lets claims by different instances at the
//! same instant coexist in one row, and makes column order equal
//! `(timestamp, rid)` order.

use bytes::Bytes;
use xxhash_rust::xxh64::xxh64;

use crate::primitives::bytes::ord::{self, U64_LEN};
use crate::primitives::time::Timestamp;
use crate::types::{ClaimError, KeyColumn, Result, Rid};

const TAG_PLAIN: u8 = 0;
const TAG_FINGERPRINT: u8 = 1;

/// Suffix appended to a data store's name to form its lock store's name.
pub const LOCK_STORE_SUFFIX: &str = "_lock_";

/// A decoded claim. Ordering is by timestamp first, then rid; the smallest
/// live claim holds the lock.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimestampRid {
    pub timestamp: Timestamp,
    pub rid: Rid,
}

pub fn lock_store_name(data_store: &str) -> String {
    format!("{data_store}{LOCK_STORE_SUFFIX}")
}

/// Row under which every claim on `kc` is written.
pub fn lock_row_key(kc: &KeyColumn) -> Bytes {
    let mut buf = Vec::with_capacity(4 + kc.key().len() + kc.column().len());
    ord::put_bytes_key(&mut buf, kc.key());
    buf.extend_from_slice(kc.column());
    Bytes::from(buf)
}

pub fn claim_column(timestamp: Timestamp, rid: &Rid) -> Bytes {
    let mut buf = Vec::with_capacity(U64_LEN + rid.len());
    ord::put_u64_be(&mut buf, timestamp.as_nanos());
    buf.extend_from_slice(rid.as_bytes());
    Bytes::from(buf)
}

pub fn parse_claim_column(column: &[u8]) -> Result<TimestampRid> {
    let timestamp = Timestamp::from_nanos(ord::get_u64_be(column)?);
    let rid_bytes = &column[U64_LEN..];
    if rid_bytes.is_empty() {
        return Err(ClaimError::Corruption("claim column carries no rid"));
    }
    let rid = Rid::new(Bytes::copy_from_slice(rid_bytes))?;
    Ok(TimestampRid { timestamp, rid })
}

/// Fingerprint of the value a claimant expects the protected cell to hold.
pub fn fingerprint(expected: &[u8]) -> u64 {
    xxh64(expected, 0)
}

pub fn claim_value(fingerprint: Option<u64>) -> Bytes {
    match fingerprint {
        None => Bytes::from_static(&[TAG_PLAIN]),
        Some(fp) => {
            let mut buf = Vec::with_capacity(1 + U64_LEN);
            buf.push(TAG_FINGERPRINT);
            ord::put_u64_be(&mut buf, fp);
            Bytes::from(buf)
        }
    }
}

pub fn parse_claim_value(value: &[u8]) -> Result<Option<u64>> {
    match value.split_first() {
        Some((&TAG_PLAIN, [])) => Ok(None),
        Some((&TAG_FINGERPRINT, rest)) if rest.len() == U64_LEN => Ok(Some(ord::get_u64_be(rest)?)),
        _ => Err(ClaimError::Corruption("unrecognised claim value")),
    }
}
