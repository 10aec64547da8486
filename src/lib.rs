#![forbid(unsafe_code)]

//! Library half of tubeharvest: URL classification, metadata extraction,
//! pacing, storage, persistence and the job machinery shared by the
//! `server`, `worker` and `backfill` binaries.

use std::{future::Future, pin::Pin};

pub mod admission;
pub mod catalog;
pub mod classifier;
pub mod collection;
pub mod config;
pub mod error;
pub mod extractor;
pub mod jobs;
pub mod pacing;
pub mod page_api;
pub mod pipeline;
pub mod queue;
pub mod security;
pub mod storage;
pub mod worker;
pub mod ytdlp;

/// Boxed future used by the capability traits so they stay object safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;
