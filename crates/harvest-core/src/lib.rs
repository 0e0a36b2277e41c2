//! # Harvest Core
//!
//! Runtime-free building blocks shared by every harvest component: the
//! deterministic record identity, the wrapped [`models::Record`], the error
//! taxonomy, the [`store::IndexStore`] contract with an in-memory
//! implementation, and the cursor-driven [`reader::ItemReader`].
//!
//! This crate contains no tokio, sqlx, HTTP, or filesystem dependencies.

pub mod error;
pub mod identity;
pub mod models;
pub mod reader;
pub mod store;
pub mod time;

pub use error::{HarvestError, Result};
pub use models::Record;
