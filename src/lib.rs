//! Sparkify lake build: turns raw song-catalog and user-activity JSON into a
//! partitioned Parquet star schema (songs, artists, users, time, songplays).

pub mod activity;
pub mod calendar;
pub mod catalog;
pub mod config;
pub mod dedup;
pub mod error;
pub mod identity;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod safety;
pub mod songplays;
pub mod source;
pub mod tables;
pub mod writer;

pub use error::{EtlError, Result};
