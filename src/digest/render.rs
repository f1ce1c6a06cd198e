use chrono::{DateTime, Utc};
use handlebars::Handlebars;
use serde::Serialize;
use std::borrow::Cow;
use thiserror::Error;

use crate::config::DescriptionMode;
use crate::feed::ParsedFeed;

const TEMPLATE_NAME: &str = "digest";

/// Title, link, author and date go through handlebars' HTML escaping.
/// The description is triple-stashed: it is feed markup and is meant to
/// render as such, after the [`Sanitizer`] has had its say.
const DIGEST_TEMPLATE: &str = r#"<!DOCTYPE html>
<html>
<head>
<meta charset="UTF-8">
<title>{{title}}</title>
</head>
<body>
<div><b>{{title}}</b>{{#if channel_link}} <a href="{{channel_link}}">{{channel_link}}</a>{{/if}}</div>
<hr>
{{#each items}}
<div>
<a href="{{link}}"><b>{{title}}</b> /{{published}}/</a>{{#if author}} {{author}}{{/if}}<br>
<div>
{{{description}}}
</div>
</div>
<hr>
{{/each}}
</body>
</html>
"#;

#[derive(Debug, Error)]
pub enum RenderError {
    #[error("Invalid digest template: {0}")]
    Template(#[from] Box<handlebars::TemplateError>),
    #[error("Failed to render digest: {0}")]
    Render(#[from] handlebars::RenderError),
}

/// The mailable unit for one source in one run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Digest {
    /// Configured source name.
    pub title: String,
    /// Watermark to persist once this digest is delivered.
    pub new_watermark: DateTime<Utc>,
    pub body_html: String,
    pub item_count: usize,
}

/// Hook applied to every feed-supplied description before it is embedded.
pub trait Sanitizer: Send + Sync {
    fn sanitize<'a>(&self, html: &'a str) -> Cow<'a, str>;
}

/// Leaves descriptions untouched.
pub struct RawHtml;

impl Sanitizer for RawHtml {
    fn sanitize<'a>(&self, html: &'a str) -> Cow<'a, str> {
        Cow::Borrowed(html)
    }
}

/// Escapes descriptions so markup shows as text.
pub struct EscapeHtml;

impl Sanitizer for EscapeHtml {
    fn sanitize<'a>(&self, html: &'a str) -> Cow<'a, str> {
        Cow::Owned(handlebars::html_escape(html))
    }
}

#[derive(Serialize)]
struct DigestView<'a> {
    title: &'a str,
    channel_link: &'a str,
    items: Vec<ItemView<'a>>,
}

#[derive(Serialize)]
struct ItemView<'a> {
    title: &'a str,
    link: &'a str,
    author: &'a str,
    published: String,
    description: Cow<'a, str>,
}

/// Turns filtered feeds into HTML digests.
pub struct Renderer {
    handlebars: Handlebars<'static>,
    sanitizer: Box<dyn Sanitizer>,
}

impl Renderer {
    /// # Errors
    ///
    /// Returns [`RenderError::Template`] if the embedded template is invalid.
    pub fn new(sanitizer: Box<dyn Sanitizer>) -> Result<Self, RenderError> {
        let mut handlebars = Handlebars::new();
        handlebars
            .register_template_string(TEMPLATE_NAME, DIGEST_TEMPLATE)
            .map_err(Box::new)?;
        Ok(Self {
            handlebars,
            sanitizer,
        })
    }

    pub fn for_mode(mode: DescriptionMode) -> Result<Self, RenderError> {
        match mode {
            DescriptionMode::Raw => Self::new(Box::new(RawHtml)),
            DescriptionMode::Escape => Self::new(Box::new(EscapeHtml)),
        }
    }

    /// Renders the digest for one feed.
    ///
    /// Returns `Ok(None)` when the feed has no items: nothing new means no
    /// mail and no watermark change.
    pub fn render(
        &self,
        feed: &ParsedFeed,
        new_watermark: DateTime<Utc>,
    ) -> Result<Option<Digest>, RenderError> {
        if feed.items.is_empty() {
            return Ok(None);
        }

        let view = DigestView {
            title: &feed.source_name,
            channel_link: &feed.channel.link,
            items: feed
                .items
                .iter()
                .map(|item| ItemView {
                    title: &item.title,
                    link: &item.link,
                    author: &item.author,
                    published: item
                        .published_at
                        .map(|at| at.format("%Y-%m-%d %H:%M:%S %Z").to_string())
                        .unwrap_or_else(|| "unknown date".to_string()),
                    description: self.sanitizer.sanitize(&item.description),
                })
                .collect(),
        };

        let body_html = self.handlebars.render(TEMPLATE_NAME, &view)?;

        Ok(Some(Digest {
            title: feed.source_name.clone(),
            new_watermark,
            body_html,
            item_count: feed.items.len(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::{ChannelMeta, FeedItem};
    use chrono::TimeZone;

    fn item(title: &str, description: &str, day: Option<u32>) -> FeedItem {
        FeedItem {
            title: title.to_string(),
            link: format!("https://example.com/{title}"),
            author: String::new(),
            guid: title.to_string(),
            description: description.to_string(),
            published_at: day.map(|d| Utc.with_ymd_and_hms(2024, 1, d, 10, 0, 0).unwrap()),
        }
    }

    fn feed(items: Vec<FeedItem>) -> ParsedFeed {
        ParsedFeed {
            source_name: "Blog".to_string(),
            channel: ChannelMeta {
                title: "Ignored Title".to_string(),
                link: "https://example.com/".to_string(),
                updated: None,
            },
            items,
        }
    }

    #[test]
    fn test_empty_feed_renders_nothing() {
        let renderer = Renderer::for_mode(DescriptionMode::Raw).unwrap();
        let result = renderer.render(&feed(vec![]), DateTime::UNIX_EPOCH).unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn test_digest_structure() {
        let renderer = Renderer::for_mode(DescriptionMode::Raw).unwrap();
        let at = Utc.with_ymd_and_hms(2024, 1, 2, 10, 0, 0).unwrap();
        let digest = renderer
            .render(&feed(vec![item("first", "<p>Hello</p>", Some(2))]), at)
            .unwrap()
            .unwrap();

        assert_eq!(digest.title, "Blog");
        assert_eq!(digest.new_watermark, at);
        assert_eq!(digest.item_count, 1);

        let html = &digest.body_html;
        assert!(html.contains("<b>Blog</b>"));
        assert!(!html.contains("Ignored Title"));
        assert!(html.contains("<hr>"));
        assert!(html.contains(r#"<a href="https://example.com/first"><b>first</b> /2024-01-02 10:00:00 UTC/</a>"#));
        assert!(html.contains("<p>Hello</p>"), "description embedded as markup");
    }

    #[test]
    fn test_items_keep_feed_order() {
        let renderer = Renderer::for_mode(DescriptionMode::Raw).unwrap();
        let digest = renderer
            .render(
                &feed(vec![item("zeta", "", Some(3)), item("alpha", "", Some(5))]),
                DateTime::UNIX_EPOCH,
            )
            .unwrap()
            .unwrap();
        let zeta = digest.body_html.find("zeta").unwrap();
        let alpha = digest.body_html.find("alpha").unwrap();
        assert!(zeta < alpha);
    }

    #[test]
    fn test_title_is_escaped() {
        let renderer = Renderer::for_mode(DescriptionMode::Raw).unwrap();
        let digest = renderer
            .render(
                &feed(vec![item("<script>alert(1)</script>", "", Some(2))]),
                DateTime::UNIX_EPOCH,
            )
            .unwrap()
            .unwrap();
        assert!(!digest.body_html.contains("<script>"));
        assert!(digest.body_html.contains("&lt;script&gt;"));
    }

    #[test]
    fn test_escape_mode_neutralizes_description() {
        let renderer = Renderer::for_mode(DescriptionMode::Escape).unwrap();
        let digest = renderer
            .render(&feed(vec![item("a", "<img src=x onerror=y>", Some(2))]), DateTime::UNIX_EPOCH)
            .unwrap()
            .unwrap();
        assert!(!digest.body_html.contains("<img"));
        assert!(digest.body_html.contains("&lt;img"));
    }

    #[test]
    fn test_undated_item_shows_placeholder() {
        let renderer = Renderer::for_mode(DescriptionMode::Raw).unwrap();
        let digest = renderer
            .render(&feed(vec![item("a", "", None)]), DateTime::UNIX_EPOCH)
            .unwrap()
            .unwrap();
        assert!(digest.body_html.contains("/unknown date/"));
    }

    #[test]
    fn test_custom_sanitizer_is_applied() {
        struct Shout;
        impl Sanitizer for Shout {
            fn sanitize<'a>(&self, html: &'a str) -> Cow<'a, str> {
                Cow::Owned(html.to_uppercase())
            }
        }

        let renderer = Renderer::new(Box::new(Shout)).unwrap();
        let digest = renderer
            .render(&feed(vec![item("a", "quiet words", Some(2))]), DateTime::UNIX_EPOCH)
            .unwrap()
            .unwrap();
        assert!(digest.body_html.contains("QUIET WORDS"));
    }
}
