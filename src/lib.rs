//! Keyed query cache with optimistic mutations, background staleness and eviction, and
//! derived views, plus cached hooks for a scholarship portal built on top of it.

pub mod cache;
pub mod config;
pub mod logging;
pub mod portal;
pub mod query;
pub mod views;
