//! Feed retrieval and decoding.
//!
//! - **Dates**: every timestamp layout the feeds and the config file use
//! - **Fetching**: one HTTP GET per source per run, bounded body size
//! - **Parsing**: RSS 2.0 and Atom into [`ParsedFeed`], filtered by watermark
//!
//! # Example
//!
//! ```ignore
//! use rss_digest::feed::{build_client, fetch, parse};
//!
//! let client = build_client()?;
//! let bytes = fetch(&client, &source.url).await?;
//! let feed = parse(&bytes, source.watermark, &source.name)?;
//! ```

pub mod date;
mod fetcher;
mod parser;

pub use date::{format_watermark, normalize, DateFormatError};
pub use fetcher::{build_client, fetch, FetchError};
pub use parser::{parse, ChannelMeta, FeedItem, ParseError, ParsedFeed};
