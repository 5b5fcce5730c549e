//! Low-level primitives shared by the locking and id-allocation layers.
//!
//! Includes byte encoders for keys and columns, and the timestamp
//! sources every claim is ordered by.

/// Byte-level utilities and encoding/decoding.
///
/// Order-preserving encoders for counter keys, lock rows and claim columns.
pub mod bytes;

/// Timestamp providers.
///
/// Monotonic wall-clock and manually driven clocks behind one trait.
pub mod time;
