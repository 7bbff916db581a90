//! Repository methods over the audit tables.

pub mod records;
