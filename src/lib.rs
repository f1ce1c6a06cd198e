//! rss-digest: mails new RSS/Atom items as one HTML digest per feed.
//!
//! A run loads the config, fetches every feed concurrently, keeps the items
//! newer than each feed's watermark, renders them, mails one digest per feed
//! in config order, and advances a feed's watermark only after its digest
//! was delivered.
//!
//! - [`config`] - TOML config file and the watermark store
//! - [`feed`] - date normalization, fetching, parsing
//! - [`digest`] - HTML rendering and SMTP delivery
//! - [`runner`] - fan-out, join, ordered delivery and commit

pub mod config;
pub mod digest;
pub mod feed;
pub mod runner;
