//! Instance lifecycle for fim: records, instance registry, boot engine and
//! recipes.

#![cfg_attr(test, allow(clippy::expect_used, clippy::unwrap_used))]

pub mod engine;
pub mod exec;
pub mod instance;
pub mod recipe;
pub mod records;
