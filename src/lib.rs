//! Synchronizes articles, media and tags from the Hail content API into a
//! local SQLite database.

pub mod config;
pub mod db;
pub mod fetch;
pub mod hail;
pub mod importer;
pub mod model;
pub mod notice;
