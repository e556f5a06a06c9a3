#![forbid(unsafe_code)]

//! Groovify download service: wraps yt-dlp to search for tracks, download
//! them as MP3 into a shared directory and serve the results over HTTP.

pub mod api;
pub mod config;
pub mod engine;
pub mod error;
pub mod files;
pub mod resolve;
pub mod sanitize;
pub mod security;
pub mod service;
pub mod tasks;
