//! Tag definition documents
//!
//! A tag is published as an Atom feed. Feed-level elements describe the tag,
//! each `<entry>` is a training example:
//!
//! ```xml
//! <feed xmlns="http://www.w3.org/2005/Atom" xmlns:classifier="http://peerworks.org/classifier">
//!   <id>http://example.org/jo/tags/rust</id>
//!   <updated>2026-03-30T01:24:18Z</updated>
//!   <classifier:classified>2026-04-15T01:16:23Z</classifier:classified>
//!   <classifier:bias>1.2</classifier:bias>
//!   <category term="rust" scheme="http://example.org/jo/tags/"/>
//!   <link rel="self" href="http://example.org/jo/tags/rust/training.atom"/>
//!   <link rel="http://peerworks.org/classifier/edit" href="http://example.org/results"/>
//!   <entry>
//!     <id>urn:peerworks.org:entry#42</id>
//!     <category term="rust" scheme="http://example.org/jo/tags/"/>
//!   </entry>
//!   <entry>
//!     <id>urn:peerworks.org:entry#43</id>
//!     <link rel="http://peerworks.org/classifier/negative-example" href="..."/>
//!   </entry>
//! </feed>
//! ```

use chrono::{DateTime, Utc};
use tagstream_core::{Error, ItemId, Result};
use tagstream_store::atom::{fragment_id, parse_timestamp};
use tagstream_store::Element;
use tracing::debug;

/// Link relation of the URL taggings are published to
pub const EDIT_REL: &str = "http://peerworks.org/classifier/edit";

/// Link relation marking a negative training example
pub const NEGATIVE_EXAMPLE_REL: &str = "http://peerworks.org/classifier/negative-example";

/// Parsed tag definition
#[derive(Debug, Clone, PartialEq)]
pub struct TagDefinition {
    pub tag_id: String,
    pub term: String,
    pub scheme: String,
    pub bias: f64,
    pub training_url: Option<String>,
    pub classifier_taggings_url: Option<String>,
    pub last_classified: Option<DateTime<Utc>>,
    pub updated: Option<DateTime<Utc>>,
    pub positive_examples: Vec<ItemId>,
    pub negative_examples: Vec<ItemId>,
}

impl TagDefinition {
    /// Parse a tag definition document
    pub fn from_atom(xml: &str) -> Result<Self> {
        let feed = Element::parse(xml)
            .map_err(|e| Error::validation(format!("invalid tag definition: {}", e)))?;
        if feed.name != "feed" {
            return Err(Error::validation(format!(
                "tag definition must be an Atom feed, found <{}>",
                feed.name
            )));
        }

        let tag_id = feed
            .child_text("id")
            .ok_or_else(|| Error::validation("tag definition has no id"))?
            .to_string();

        let category = feed.child("category");
        let term = category.and_then(|c| c.attr("term")).unwrap_or_default().to_string();
        let scheme = category.and_then(|c| c.attr("scheme")).unwrap_or_default().to_string();

        let bias = match feed.child_text("bias") {
            Some(raw) => raw
                .parse::<f64>()
                .ok()
                .filter(|b| b.is_finite() && *b > 0.0)
                .ok_or_else(|| Error::validation(format!("invalid bias {raw:?}")))?,
            None => 1.0,
        };

        let mut positive_examples = Vec::new();
        let mut negative_examples = Vec::new();
        for entry in feed.children_named("entry") {
            let Some(id) = entry.child_text("id").and_then(fragment_id) else {
                debug!(tag_id = %tag_id, "Skipping training entry without an item id");
                continue;
            };
            let positive = entry.children_named("category").any(|c| {
                c.attr("term") == Some(term.as_str()) && c.attr("scheme") == Some(scheme.as_str())
            });
            if positive {
                positive_examples.push(id);
            } else if entry.link_href(NEGATIVE_EXAMPLE_REL).is_some() {
                negative_examples.push(id);
            }
        }

        Ok(Self {
            training_url: feed.link_href("self").map(str::to_string),
            classifier_taggings_url: feed.link_href(EDIT_REL).map(str::to_string),
            last_classified: feed.child_text("classified").and_then(parse_timestamp),
            updated: feed.child_text("updated").and_then(parse_timestamp),
            tag_id,
            term,
            scheme,
            bias,
            positive_examples,
            negative_examples,
        })
    }
}
