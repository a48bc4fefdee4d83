//! Source-reference parsing
//!
//! Accepts the two `t.me` link forms:
//!
//! - `https://t.me/c/<internalChatId>/<itemId>` — private; the canonical chat
//!   id is `-100` prefixed onto the internal id (`c/123456789/42` names chat
//!   `-100123456789`).
//! - `https://t.me/<publicHandle>/<itemId>` — public; the chat is addressed
//!   by handle.
//!
//! The scheme is optional, a trailing slash or `?query` tail is tolerated,
//! and surrounding whitespace is trimmed. Everything else is an invalid
//! reference, including `t.me/c/...` shapes with a non-numeric chat part
//! (`c` is reserved, never a public handle).

use crate::error::{Error, Result};
use crate::types::{ChatRef, SourceRef};
use regex::Regex;
use std::sync::LazyLock;

static PRIVATE_LINK: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a literal, checked by tests
    Regex::new(r"^(?:https?://)?t\.me/c/(\d+)/(\d+)/?(?:\?\S*)?$").unwrap()
});

static PUBLIC_LINK: LazyLock<Regex> = LazyLock::new(|| {
    #[allow(clippy::unwrap_used)] // pattern is a literal, checked by tests
    Regex::new(r"^(?:https?://)?t\.me/([A-Za-z0-9_]+)/(\d+)/?(?:\?\S*)?$").unwrap()
});

/// Parse requester-supplied text into a [`SourceRef`].
///
/// Returns [`Error::InvalidReference`] for anything that does not match the
/// two link forms exactly.
pub fn parse_source_ref(link: &str) -> Result<SourceRef> {
    let trimmed = link.trim();

    if let Some(caps) = PRIVATE_LINK.captures(trimmed) {
        let chat_id = canonical_private_id(&caps[1])
            .ok_or_else(|| Error::InvalidReference(trimmed.to_string()))?;
        let item: i64 = caps[2]
            .parse()
            .map_err(|_| Error::InvalidReference(trimmed.to_string()))?;
        return Ok(SourceRef {
            chat: ChatRef::Private(chat_id),
            item,
        });
    }

    if let Some(caps) = PUBLIC_LINK.captures(trimmed) {
        let handle = &caps[1];
        // `t.me/c/<non-numeric>/...` falls through the private form; never
        // treat the `c` path segment as a channel handle.
        if handle == "c" {
            return Err(Error::InvalidReference(trimmed.to_string()));
        }
        let item: i64 = caps[2]
            .parse()
            .map_err(|_| Error::InvalidReference(trimmed.to_string()))?;
        return Ok(SourceRef {
            chat: ChatRef::Public(handle.to_string()),
            item,
        });
    }

    Err(Error::InvalidReference(trimmed.to_string()))
}

/// `-100`-prefix the internal id digits, e.g. `123456789` → `-100123456789`.
///
/// None when the prefixed value overflows i64.
fn canonical_private_id(internal_digits: &str) -> Option<i64> {
    format!("-100{internal_digits}").parse::<i64>().ok()
}
