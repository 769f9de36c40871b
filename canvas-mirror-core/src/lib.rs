#![doc = "canvas-mirror-core: sync engine for mirroring Canvas LMS courses into a local or Google Drive store."]

//! This crate contains the whole sync pipeline: resource discovery, change
//! detection, HTML rendering and PDF assembly, and the storage backends.
//! The CLI crate only loads configuration, picks courses and prints the summary.
//!
//! # Usage
//! Build a [`download::CanvasClient`] and a [`storage::Backend`] from a
//! [`config::SyncConfig`], then call [`synchronise::synchronise`].

pub mod change;
pub mod config;
pub mod contract;
pub mod discovery;
pub mod download;
pub mod error;
pub mod markup;
pub mod pdf;
pub mod preprocess;
pub mod render;
pub mod storage;
pub mod summary;
pub mod synchronise;
