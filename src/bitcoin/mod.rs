//! Bitcoin primitives: key derivation, address codec, transaction builder
//! and PSBT signing.

pub mod address;
pub mod keys;
pub mod psbt;
pub mod transaction;
