#![forbid(unsafe_code)]

//! Public entry point for the zero-downloader crate.
//!
//! The HTTP service hands URLs to `yt-dlp` (or `instaloader` for Instagram),
//! stores the results in a single download directory, serves them back, and
//! sweeps them once they get old. The binaries under `src/bin` are thin
//! wrappers around these modules.

pub mod cleanup;
pub mod config;
pub mod downloader;
pub mod logging;
pub mod platform;
pub mod security;
pub mod server;
pub mod store;
