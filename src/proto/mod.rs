//! Wire types for the lease service.
//!
//! `sequence.rs` is the `tonic-build` output for `proto/sequence.proto`,
//! checked in so builds do not need a protobuf toolchain. Regenerate with
//! `tonic_build::compile_protos("proto/sequence.proto")` after changing
//! the proto file.

#[rustfmt::skip]
#[allow(clippy::pedantic, clippy::nursery)]
mod sequence;

pub use sequence::*;
