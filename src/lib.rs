// src/lib.rs

//! Personal content archiver library.
//!
//! Pulls a user's content from several publishing platforms, normalizes it
//! into one model and keeps it in a local SQLite archive with incremental,
//! resumable syncs.

pub mod config;
pub mod error;
pub mod models;
pub mod pipeline;
pub mod services;
pub mod storage;
pub mod utils;
