//! # playlist-etl
//!
//! A scheduled extract-transform-load job for Spotify playlist metadata.
//!
//! Each run fetches one playlist's items from the Spotify Web API, lands the
//! raw JSON in an S3 "pending" prefix, derives album, artist and song tables
//! from every pending document, publishes them as CSV, and finally moves the
//! raw documents to a "processed" prefix.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌────────────┐   ┌────────────┐
//! │ Spotify  │──▶│ S3       │──▶│ Normalizer │──▶│ S3         │
//! │ Web API  │   │ pending/ │   │ 3 tables   │   │ transformed│
//! └──────────┘   └────┬─────┘   └────────────┘   └────────────┘
//!                     │  after all three tables are stored
//!                     ▼
//!                ┌──────────┐
//!                │ S3       │
//!                │processed/│
//!                └──────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |
//! | [`models`] | Raw document and table row types |
//! | [`catalog`] | Spotify Web API client |
//! | [`store`] | Object store trait, S3 and in-memory backends |
//! | [`normalize`] | Raw documents → deduplicated CSV tables |
//! | [`pipeline`] | Task graph, stage functions, scheduling loop |

pub mod catalog;
pub mod config;
pub mod error;
pub mod models;
pub mod normalize;
pub mod pipeline;
pub mod store;
