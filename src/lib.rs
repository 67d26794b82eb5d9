//! Collection Scanner - keeps a music collection database in sync with disk.
//!
//! An external scanner binary walks the collection folders and reports what
//! it finds as a streaming XML document. This crate supervises that process,
//! parses its reports, reconciles them with the stored collection and
//! watches the folders for changes that need a rescan.

pub mod config;
pub mod db;
pub mod error;
pub mod model;
pub mod processor;
pub mod scanner;
pub mod storage;
#[cfg(test)]
pub mod test_utils;
