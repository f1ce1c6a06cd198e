//! Digest rendering and delivery.
//!
//! - [`render`] turns a filtered feed into an HTML [`Digest`]
//! - [`mailer`] sends one digest per SMTP session

pub mod mailer;
pub mod render;

pub use mailer::{MailError, Mailer, SmtpMailer};
pub use render::{Digest, EscapeHtml, RawHtml, RenderError, Renderer, Sanitizer};
