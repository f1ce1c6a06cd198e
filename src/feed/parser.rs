use chrono::{DateTime, Utc};
use quick_xml::events::{BytesText, Event};
use quick_xml::Reader;
use thiserror::Error;

use super::date;

/// Maximum element nesting accepted inside a feed document.
const MAX_DEPTH: usize = 64;

/// Errors that make a feed document unusable.
#[derive(Debug, Error)]
pub enum ParseError {
    #[error("XML parse error: {0}")]
    Xml(String),
    #[error("Document has no root element")]
    Empty,
    #[error("Unsupported root element <{0}>")]
    UnsupportedRoot(String),
    #[error("RSS document has no <channel>")]
    MissingChannel,
    #[error("Document ends inside <{0}>")]
    Truncated(String),
    #[error("Nesting depth exceeds maximum of {0} levels")]
    MaxDepthExceeded(usize),
    #[error("Atom parse error: {0}")]
    Atom(String),
}

/// One entry of a feed, as it will appear in a digest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedItem {
    pub title: String,
    pub link: String,
    pub author: String,
    pub guid: String,
    /// Feed-supplied HTML fragment.
    pub description: String,
    /// `None` when the item's own date could not be parsed. Such items count
    /// as newer than any watermark.
    pub published_at: Option<DateTime<Utc>>,
}

/// What a feed says about itself. Display-only.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChannelMeta {
    pub title: String,
    pub link: String,
    pub updated: Option<DateTime<Utc>>,
}

/// Watermark-filtered view of one configured source.
#[derive(Debug, Clone)]
pub struct ParsedFeed {
    /// Configured source name. Takes precedence over `channel.title`.
    pub source_name: String,
    pub channel: ChannelMeta,
    pub items: Vec<FeedItem>,
}

impl ParsedFeed {
    /// Watermark to persist once this feed's digest is delivered.
    ///
    /// The newest retained item's date, never lower than `previous`. Items
    /// without a date do not move it.
    pub fn next_watermark(&self, previous: DateTime<Utc>) -> DateTime<Utc> {
        self.items
            .iter()
            .filter_map(|item| item.published_at)
            .fold(previous, |newest, at| newest.max(at))
    }
}

/// Decodes a feed document and keeps only items newer than `watermark`.
///
/// RSS 2.0 (`<rss>` root) is streamed with `quick-xml`; Atom (`<feed>` root)
/// is handed to `feed-rs`. An item is kept when its date is strictly after
/// `watermark` or when its date cannot be parsed at all.
///
/// # Errors
///
/// Returns [`ParseError`] for malformed or truncated XML, an unknown root
/// element, or an RSS document without `<channel>`.
pub fn parse(
    raw: &[u8],
    watermark: DateTime<Utc>,
    source_name: &str,
) -> Result<ParsedFeed, ParseError> {
    let (channel, items) = match root_name(raw)?.as_str() {
        "rss" => decode_rss(raw, source_name)?,
        "feed" => decode_atom(raw)?,
        other => return Err(ParseError::UnsupportedRoot(other.to_string())),
    };

    let total = items.len();
    let items: Vec<FeedItem> = items
        .into_iter()
        .filter(|item| item.published_at.map_or(true, |at| at > watermark))
        .collect();

    tracing::debug!(
        source = %source_name,
        total = total,
        new = items.len(),
        "Filtered feed items by watermark"
    );

    Ok(ParsedFeed {
        source_name: source_name.to_string(),
        channel,
        items,
    })
}

fn root_name(raw: &[u8]) -> Result<String, ParseError> {
    let mut reader = Reader::from_reader(raw);
    let mut buf = Vec::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Ok(String::from_utf8_lossy(e.name().as_ref()).into_owned());
            }
            Ok(Event::Eof) => return Err(ParseError::Empty),
            Err(e) => return Err(ParseError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }
}

/// Raw item fields as they appear in the document, before date handling.
#[derive(Default)]
struct RawItem {
    title: String,
    link: String,
    author: String,
    creator: String,
    guid: String,
    description: String,
    encoded: String,
    pub_date: String,
    dc_date: String,
}

impl RawItem {
    fn finish(self, source_name: &str) -> FeedItem {
        let raw_date = first_non_empty(&self.pub_date, &self.dc_date).trim();
        let published_at = match date::normalize(raw_date) {
            Ok(at) => Some(at),
            // Counted and reported once per feed by the caller.
            Err(_) if raw_date.is_empty() => None,
            Err(e) => {
                tracing::warn!(
                    source = %source_name,
                    title = %self.title,
                    error = %e,
                    "Item date unparseable, treating item as new"
                );
                None
            }
        };

        FeedItem {
            author: first_non_empty(&self.author, &self.creator).to_string(),
            description: first_non_empty(&self.description, &self.encoded).to_string(),
            title: self.title,
            link: self.link,
            guid: self.guid,
            published_at,
        }
    }
}

#[derive(Default)]
struct RawChannel {
    title: String,
    link: String,
    last_build_date: String,
    pub_date: String,
}

fn first_non_empty<'a>(primary: &'a str, fallback: &'a str) -> &'a str {
    if primary.trim().is_empty() {
        fallback
    } else {
        primary
    }
}

fn decode_rss(raw: &[u8], source_name: &str) -> Result<(ChannelMeta, Vec<FeedItem>), ParseError> {
    let mut reader = Reader::from_reader(raw);

    let mut buf = Vec::new();
    let mut stack: Vec<Vec<u8>> = Vec::new();
    let mut text = String::new();
    let mut channel: Option<RawChannel> = None;
    let mut current: Option<RawItem> = None;
    let mut items = Vec::new();
    let mut undated = 0usize;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(e)) => {
                if !inside_field(&stack) {
                    text.clear();
                }
                let name = e.name().as_ref().to_vec();
                match (stack.as_slice(), name.as_slice()) {
                    ([root], b"channel") if root.as_slice() == b"rss" => {
                        channel.get_or_insert_with(RawChannel::default);
                    }
                    ([_, ch], b"item") if ch.as_slice() == b"channel" => {
                        current = Some(RawItem::default());
                    }
                    _ => {}
                }
                stack.push(name);
                if stack.len() > MAX_DEPTH {
                    return Err(ParseError::MaxDepthExceeded(MAX_DEPTH));
                }
            }
            Ok(Event::Empty(e)) => {
                if e.name().as_ref() == b"channel" && stack.len() == 1 {
                    channel.get_or_insert_with(RawChannel::default);
                }
                if !inside_field(&stack) {
                    text.clear();
                }
            }
            Ok(Event::Text(e)) => text.push_str(&unescape_lossy(&e)),
            Ok(Event::CData(e)) => text.push_str(&String::from_utf8_lossy(&e.into_inner())),
            Ok(Event::End(_)) => {
                let Some(name) = stack.pop() else {
                    return Err(ParseError::Xml("unbalanced end tag".to_string()));
                };
                // Markup nested in a field keeps accumulating into the field.
                let value = if inside_field(&stack) {
                    None
                } else {
                    Some(std::mem::take(&mut text))
                };
                match (stack.len(), value) {
                    // rss > channel > item > field
                    (3, Some(value)) if stack[2].as_slice() == b"item" => {
                        if let Some(item) = current.as_mut() {
                            assign_item_field(item, &name, value);
                        }
                    }
                    // rss > channel > (item | field)
                    (2, Some(_)) if name.as_slice() == b"item" => {
                        if let Some(item) = current.take() {
                            if item.pub_date.trim().is_empty() && item.dc_date.trim().is_empty() {
                                undated += 1;
                            }
                            items.push(item.finish(source_name));
                        }
                    }
                    (2, Some(value)) if stack[1].as_slice() == b"channel" => {
                        if let Some(ch) = channel.as_mut() {
                            assign_channel_field(ch, &name, value);
                        }
                    }
                    _ => {}
                }
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(ParseError::Xml(e.to_string())),
            _ => {}
        }
        buf.clear();
    }

    if let Some(open) = stack.last() {
        return Err(ParseError::Truncated(
            String::from_utf8_lossy(open).into_owned(),
        ));
    }

    if undated > 0 {
        tracing::warn!(
            source = %source_name,
            undated = undated,
            "Items without a date are treated as new and resent every run"
        );
    }

    let raw_channel = channel.ok_or(ParseError::MissingChannel)?;
    let channel_date = first_non_empty(&raw_channel.last_build_date, &raw_channel.pub_date).trim();
    let updated = if channel_date.is_empty() {
        None
    } else {
        match date::normalize(channel_date) {
            Ok(at) => Some(at),
            Err(e) => {
                tracing::debug!(source = %source_name, error = %e, "Channel date unparseable");
                None
            }
        }
    };

    Ok((
        ChannelMeta {
            title: raw_channel.title,
            link: raw_channel.link,
            updated,
        },
        items,
    ))
}

/// True when the open elements end inside an item field
/// (`rss > channel > item > field > ...`) or a channel field
/// (`rss > channel > field > ...`).
fn inside_field(stack: &[Vec<u8>]) -> bool {
    match stack {
        [_, _, item, _, ..] if item.as_slice() == b"item" => true,
        [_, channel, field, ..] => channel.as_slice() == b"channel" && field.as_slice() != b"item",
        _ => false,
    }
}

fn assign_item_field(item: &mut RawItem, name: &[u8], value: String) {
    let slot = match name {
        b"title" => &mut item.title,
        b"link" => &mut item.link,
        b"author" => &mut item.author,
        b"dc:creator" => &mut item.creator,
        b"guid" => &mut item.guid,
        b"description" => &mut item.description,
        b"content:encoded" => &mut item.encoded,
        b"pubDate" => &mut item.pub_date,
        b"dc:date" => &mut item.dc_date,
        _ => return,
    };
    *slot = value.trim().to_string();
}

fn assign_channel_field(channel: &mut RawChannel, name: &[u8], value: String) {
    let slot = match name {
        b"title" => &mut channel.title,
        b"link" => &mut channel.link,
        b"lastBuildDate" => &mut channel.last_build_date,
        b"pubDate" => &mut channel.pub_date,
        _ => return,
    };
    *slot = value.trim().to_string();
}

/// Unescapes XML entities, keeping the raw text when an entity is unknown
/// (HTML entities such as `&nbsp;` show up in sloppy feeds).
fn unescape_lossy(e: &BytesText<'_>) -> String {
    match e.unescape() {
        Ok(s) => s.into_owned(),
        Err(_) => String::from_utf8_lossy(e).into_owned(),
    }
}

fn decode_atom(raw: &[u8]) -> Result<(ChannelMeta, Vec<FeedItem>), ParseError> {
    let feed = feed_rs::parser::parse(raw).map_err(|e| ParseError::Atom(e.to_string()))?;

    let channel = ChannelMeta {
        title: feed.title.map(|t| t.content).unwrap_or_default(),
        link: feed
            .links
            .iter()
            .find(|l| l.rel.as_deref() != Some("self"))
            .or_else(|| feed.links.first())
            .map(|l| l.href.clone())
            .unwrap_or_default(),
        updated: feed.updated,
    };

    let items = feed
        .entries
        .into_iter()
        .map(|entry| FeedItem {
            title: entry.title.map(|t| t.content).unwrap_or_default(),
            link: entry
                .links
                .first()
                .map(|l| l.href.clone())
                .unwrap_or_default(),
            author: entry
                .authors
                .first()
                .map(|p| p.name.clone())
                .unwrap_or_default(),
            guid: entry.id,
            description: entry
                .summary
                .map(|s| s.content)
                .or_else(|| entry.content.and_then(|c| c.body))
                .unwrap_or_default(),
            published_at: entry.published.or(entry.updated),
        })
        .collect();

    Ok((channel, items))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use pretty_assertions::assert_eq;

    fn watermark(y: i32, m: u32, d: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, 0, 0, 0).unwrap()
    }

    fn rss(items: &str) -> String {
        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0" xmlns:atom="http://www.w3.org/2005/Atom"
     xmlns:dc="http://purl.org/dc/elements/1.1/"
     xmlns:content="http://purl.org/rss/1.0/modules/content/">
  <channel>
    <title>Self-declared Title</title>
    <link>https://example.com/</link>
    <atom:link href="https://example.com/rss.xml" rel="self" type="application/rss+xml"/>
    <lastBuildDate>Wed, 03 Jan 2024 09:00:00 +0000</lastBuildDate>
    {items}
  </channel>
</rss>"#
        )
    }

    fn item(title: &str, date: &str) -> String {
        format!(
            "<item><title>{title}</title><link>https://example.com/{title}</link>\
             <guid isPermaLink=\"false\">{title}</guid>\
             <description>&lt;p&gt;{title} body&lt;/p&gt;</description>\
             <pubDate>{date}</pubDate></item>"
        )
    }

    #[test]
    fn test_parse_channel_and_items() {
        let doc = rss(&item("first", "Tue, 02 Jan 2024 10:00:00 +0000"));
        let feed = parse(doc.as_bytes(), watermark(2024, 1, 1), "Blog").unwrap();

        assert_eq!(feed.source_name, "Blog");
        assert_eq!(feed.channel.title, "Self-declared Title");
        assert_eq!(feed.channel.link, "https://example.com/");
        assert_eq!(
            feed.channel.updated,
            Some(Utc.with_ymd_and_hms(2024, 1, 3, 9, 0, 0).unwrap())
        );
        assert_eq!(feed.items.len(), 1);

        let first = &feed.items[0];
        assert_eq!(first.title, "first");
        assert_eq!(first.link, "https://example.com/first");
        assert_eq!(first.guid, "first");
        assert_eq!(first.description, "<p>first body</p>");
        assert_eq!(
            first.published_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_watermark_filter_is_strict() {
        let items = [
            item("newer", "Tue, 02 Jan 2024 00:00:00 +0000"),
            item("boundary", "Mon, 01 Jan 2024 00:00:00 +0000"),
            item("older", "Sun, 31 Dec 2023 00:00:00 +0000"),
        ]
        .concat();
        let feed = parse(rss(&items).as_bytes(), watermark(2024, 1, 1), "Blog").unwrap();

        let titles: Vec<_> = feed.items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["newer"]);
    }

    #[test]
    fn test_unparseable_item_date_is_kept() {
        let doc = rss(&item("mystery", "not-a-date"));
        let feed = parse(doc.as_bytes(), watermark(2099, 1, 1), "Blog").unwrap();

        assert_eq!(feed.items.len(), 1);
        assert_eq!(feed.items[0].published_at, None);
    }

    #[test]
    fn test_wrong_weekday_date_is_filtered_normally() {
        // 2 Jan 2024 was a Tuesday.
        let doc = rss(&item("january", "Mon, 02 Jan 2024 10:00:00 +0000"));

        let later = parse(doc.as_bytes(), watermark(2024, 6, 1), "Blog").unwrap();
        assert!(later.items.is_empty());

        let earlier = parse(doc.as_bytes(), watermark(2024, 1, 1), "Blog").unwrap();
        assert_eq!(
            earlier.items[0].published_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap())
        );
        assert_eq!(
            earlier.next_watermark(watermark(2024, 1, 1)),
            Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap()
        );
    }

    #[test]
    fn test_item_without_date_is_kept_undated() {
        let doc = rss("<item><title>a</title></item><item><title>b</title></item>");
        let feed = parse(doc.as_bytes(), watermark(2099, 1, 1), "Blog").unwrap();
        assert_eq!(feed.items.len(), 2);
        assert!(feed.items.iter().all(|i| i.published_at.is_none()));
    }

    #[test]
    fn test_nested_markup_keeps_all_field_text() {
        let doc = rss(
            "<item><title>x</title>             <description>Hello <b>World</b> tail<br/>end</description>             <pubDate>Tue, 02 Jan 2024 10:00:00 +0000</pubDate></item>",
        );
        let feed = parse(doc.as_bytes(), watermark(2024, 1, 1), "Blog").unwrap();
        assert_eq!(feed.items[0].description, "Hello World tailend");
        assert_eq!(feed.items[0].title, "x");
    }

    #[test]
    fn test_nested_markup_in_channel_title() {
        let doc = r#"<rss><channel><title>My <i>own</i> feed</title></channel></rss>"#;
        let feed = parse(doc.as_bytes(), watermark(2024, 1, 1), "Blog").unwrap();
        assert_eq!(feed.channel.title, "My own feed");
    }

    #[test]
    fn test_pub_date_whitespace_trimmed() {
        let doc = rss("<item><title>a</title><pubDate>\n   Tue, 02 Jan 2024 10:00:00 GMT\n </pubDate></item>");
        let feed = parse(doc.as_bytes(), watermark(2024, 1, 1), "Blog").unwrap();
        assert!(feed.items[0].published_at.is_some());
    }

    #[test]
    fn test_document_order_preserved() {
        let items = [
            item("b", "Wed, 03 Jan 2024 00:00:00 +0000"),
            item("a", "Thu, 04 Jan 2024 00:00:00 +0000"),
            item("c", "Tue, 02 Jan 2024 00:00:00 +0000"),
        ]
        .concat();
        let feed = parse(rss(&items).as_bytes(), watermark(2024, 1, 1), "Blog").unwrap();
        let titles: Vec<_> = feed.items.iter().map(|i| i.title.as_str()).collect();
        assert_eq!(titles, vec!["b", "a", "c"]);
    }

    #[test]
    fn test_cdata_and_fallback_fields() {
        let doc = rss(
            "<item><title><![CDATA[Q&A]]></title>\
             <dc:creator>Jane</dc:creator>\
             <content:encoded><![CDATA[<b>bold</b>]]></content:encoded>\
             <dc:date>2024-01-02T10:00:00Z</dc:date></item>",
        );
        let feed = parse(doc.as_bytes(), watermark(2024, 1, 1), "Blog").unwrap();
        let only = &feed.items[0];
        assert_eq!(only.title, "Q&A");
        assert_eq!(only.author, "Jane");
        assert_eq!(only.description, "<b>bold</b>");
        assert_eq!(
            only.published_at,
            Some(Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap())
        );
    }

    #[test]
    fn test_atom_link_does_not_override_channel_link() {
        let doc = rss("");
        let feed = parse(doc.as_bytes(), watermark(2024, 1, 1), "Blog").unwrap();
        assert_eq!(feed.channel.link, "https://example.com/");
    }

    #[test]
    fn test_empty_channel_yields_no_items() {
        let doc = r#"<?xml version="1.0"?><rss version="2.0"><channel></channel></rss>"#;
        let feed = parse(doc.as_bytes(), watermark(2024, 1, 1), "Blog").unwrap();
        assert!(feed.items.is_empty());
        assert_eq!(feed.channel.updated, None);
    }

    #[test]
    fn test_bad_channel_date_is_not_fatal() {
        let doc = r#"<rss><channel><lastBuildDate>yesterday</lastBuildDate>
            <item><title>x</title><pubDate>Tue, 02 Jan 2024 10:00:00 +0000</pubDate></item>
            </channel></rss>"#;
        let feed = parse(doc.as_bytes(), watermark(2024, 1, 1), "Blog").unwrap();
        assert_eq!(feed.channel.updated, None);
        assert_eq!(feed.items.len(), 1);
    }

    #[test]
    fn test_missing_channel_is_error() {
        let doc = r#"<?xml version="1.0"?><rss version="2.0"></rss>"#;
        let err = parse(doc.as_bytes(), watermark(2024, 1, 1), "Blog").unwrap_err();
        assert!(matches!(err, ParseError::MissingChannel));
    }

    #[test]
    fn test_unknown_root_is_error() {
        let err = parse(b"<html><body/></html>", watermark(2024, 1, 1), "Blog").unwrap_err();
        assert!(matches!(err, ParseError::UnsupportedRoot(name) if name == "html"));
    }

    #[test]
    fn test_malformed_xml_is_error() {
        assert!(parse(b"<not valid xml", watermark(2024, 1, 1), "Blog").is_err());
        assert!(parse(b"", watermark(2024, 1, 1), "Blog").is_err());
        assert!(parse(b"plain text", watermark(2024, 1, 1), "Blog").is_err());
    }

    #[test]
    fn test_truncated_document_is_error() {
        let doc = r#"<rss><channel><item><title>cut"#;
        assert!(parse(doc.as_bytes(), watermark(2024, 1, 1), "Blog").is_err());
    }

    #[test]
    fn test_atom_feed() {
        let doc = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Atom Blog</title>
  <link href="https://example.org/"/>
  <id>urn:uuid:60a76c80-d399-11d9-b93C-0003939e0af6</id>
  <updated>2024-01-03T00:00:00Z</updated>
  <entry>
    <title>Fresh</title>
    <link href="https://example.org/fresh"/>
    <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6a</id>
    <updated>2024-01-02T10:00:00Z</updated>
    <summary>Some text.</summary>
    <author><name>Ann</name></author>
  </entry>
  <entry>
    <title>Stale</title>
    <link href="https://example.org/stale"/>
    <id>urn:uuid:1225c695-cfb8-4ebb-aaaa-80da344efa6b</id>
    <updated>2023-12-30T10:00:00Z</updated>
  </entry>
</feed>"#;
        let feed = parse(doc.as_bytes(), watermark(2024, 1, 1), "Atom").unwrap();
        assert_eq!(feed.channel.title, "Atom Blog");
        assert_eq!(feed.items.len(), 1);
        assert_eq!(feed.items[0].title, "Fresh");
        assert_eq!(feed.items[0].link, "https://example.org/fresh");
        assert_eq!(feed.items[0].author, "Ann");
    }

    #[test]
    fn test_next_watermark_takes_newest_dated_item() {
        let items = [
            item("a", "Tue, 02 Jan 2024 00:00:00 +0000"),
            item("b", "not-a-date"),
            item("c", "Fri, 05 Jan 2024 00:00:00 +0000"),
        ]
        .concat();
        let feed = parse(rss(&items).as_bytes(), watermark(2024, 1, 1), "Blog").unwrap();
        assert_eq!(feed.next_watermark(watermark(2024, 1, 1)), watermark(2024, 1, 5));
    }

    #[test]
    fn test_next_watermark_never_moves_backwards() {
        let feed = parse(
            rss(&item("undated", "garbage")).as_bytes(),
            watermark(2024, 1, 1),
            "Blog",
        )
        .unwrap();
        assert_eq!(feed.next_watermark(watermark(2024, 1, 1)), watermark(2024, 1, 1));
    }
}
