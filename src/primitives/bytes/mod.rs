#![forbid(unsafe_code)]
//! Encoding helpers for keys, columns and fixed-width values stored in the KCV layer.

pub mod ord {
    //! Order-preserving encoders for numeric and byte-string keys.

    use core::convert::TryInto;

    use crate::types::{ClaimError, Result};

    pub(crate) const U64_LEN: usize = core::mem::size_of::<u64>();

    /// Big-endian encoding for lexicographic order preservation.
    pub fn put_u64_be(dst: &mut Vec<u8>, v: u64) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Appends a big-endian u32.
    pub fn put_u32_be(dst: &mut Vec<u8>, v: u32) {
        dst.extend_from_slice(&v.to_be_bytes());
    }

    /// Decodes a u64 from big-endian byte order.
    pub fn get_u64_be(src: &[u8]) -> Result<u64> {
        let head = src
            .get(..U64_LEN)
            .ok_or(ClaimError::Corruption("u64 source shorter than 8 bytes"))?;
        let bytes: [u8; U64_LEN] = head
            .try_into()
            .map_err(|_| ClaimError::Corruption("u64 source shorter than 8 bytes"))?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Appends a length-prefixed byte string to a byte vector.
    pub fn put_bytes_key(dst: &mut Vec<u8>, bytes: &[u8]) {
        assert!(
            bytes.len() <= u32::MAX as usize,
            "byte key too long (>{} bytes)",
            u32::MAX
        );
        put_u32_be(dst, bytes.len() as u32);
        dst.extend_from_slice(bytes);
    }
}

pub mod bound {
    //! Slice bounds over raw byte columns.

    /// Returns the smallest byte string strictly greater than `column`.
    pub fn next_column(column: &[u8]) -> Vec<u8> {
        let mut next = column.to_vec();
        next.push(0);
        next
    }
}
