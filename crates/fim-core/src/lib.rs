//! # fim-core
//!
//! Linux primitives for the fim runtime.
//!
//! This crate provides:
//! - **Filesystem**: overlay backends (bubblewrap native, `fuse-overlayfs`,
//!   `unionfs-fuse`), FUSE readiness and teardown, casefold via `ciopfs`.
//! - **Sandbox**: bubblewrap argument construction from permissions,
//!   unshare options and user bindings.
//! - **Identity**: uid/gid/user/home/shell resolution and the synthesized
//!   `/etc/passwd`.
//! - **Namespace**: procfs inspection used to join running instances.
//!
//! The only unsafe code is the `pre_exec` hook arming `PR_SET_PDEATHSIG`,
//! documented with a `// SAFETY:` comment.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used, clippy::panic))]

pub mod filesystem;
pub mod host;
pub mod identity;
pub mod namespace;
pub mod sandbox;
