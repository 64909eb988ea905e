//! Test utilities shared by the unit tests.
//!
//! Provides a small sample class hierarchy, a code arena context and the lock
//! that serializes tests touching the process-wide image reservation.
