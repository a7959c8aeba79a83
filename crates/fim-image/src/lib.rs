//! # fim-image
//!
//! Layer management for fim.
//!
//! Handles:
//! - **Layers**: gzip-compressed tar codec.
//! - **Embedded**: layers appended after the ELF image of the binary.
//! - **Store**: resolution of embedded, managed and external layers.
//! - **Cache**: extracted layers and whiteout-aware composition.
//! - **Commit**: snapshots of the upper directory into new layers.
//! - **Lock**: advisory lock around layer mutations.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod cache;
pub mod commit;
pub mod embedded;
pub mod hash;
pub mod layer;
pub mod lock;
pub mod store;
pub mod whiteout;
