//! Atom document parsing
//!
//! Documents are read into a small element tree (local names only) which the
//! entry, feed and tag-definition readers walk.

use chrono::{DateTime, Utc};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use tagstream_core::{Feed, FeedId, ItemId};
use thiserror::Error;

/// Failures turning a request body into an entry or feed
#[derive(Debug, Error)]
pub enum ParseError {
    /// The body is not well-formed XML
    #[error("malformed XML: {0}")]
    Xml(String),

    /// Well-formed XML that does not describe a usable entry
    #[error("bad entry: {0}")]
    BadEntry(String),
}

impl From<ParseError> for tagstream_core::Error {
    fn from(err: ParseError) -> Self {
        tagstream_core::Error::validation(err.to_string())
    }
}

/// One XML element with its attributes, direct text and children
#[derive(Debug, Clone, Default)]
pub struct Element {
    pub name: String,
    pub attributes: Vec<(String, String)>,
    pub text: String,
    pub children: Vec<Element>,
}

impl Element {
    /// Parse a whole document and return its root element
    pub fn parse(xml: &str) -> Result<Element, ParseError> {
        let mut reader = Reader::from_str(xml);
        reader.trim_text(true);

        let mut stack: Vec<Element> = Vec::new();
        let mut root: Option<Element> = None;

        loop {
            match reader.read_event() {
                Ok(Event::Start(start)) => stack.push(Element::open(&start)?),
                Ok(Event::Empty(start)) => {
                    let element = Element::open(&start)?;
                    attach(&mut stack, &mut root, element);
                }
                Ok(Event::End(_)) => {
                    let element = stack
                        .pop()
                        .ok_or_else(|| ParseError::Xml("unbalanced closing tag".into()))?;
                    attach(&mut stack, &mut root, element);
                }
                Ok(Event::Text(text)) => {
                    if let Some(top) = stack.last_mut() {
                        let text = text.unescape().map_err(|e| ParseError::Xml(e.to_string()))?;
                        top.text.push_str(&text);
                    }
                }
                Ok(Event::CData(data)) => {
                    if let Some(top) = stack.last_mut() {
                        top.text.push_str(&String::from_utf8_lossy(&data.into_inner()));
                    }
                }
                Ok(Event::Eof) => break,
                Ok(_) => {}
                Err(e) => return Err(ParseError::Xml(e.to_string())),
            }
        }

        if !stack.is_empty() {
            return Err(ParseError::Xml("unexpected end of document".into()));
        }
        root.ok_or_else(|| ParseError::Xml("empty document".into()))
    }

    fn open(start: &BytesStart<'_>) -> Result<Element, ParseError> {
        let name = String::from_utf8_lossy(start.local_name().as_ref()).into_owned();
        let mut attributes = Vec::new();
        for attr in start.attributes() {
            let attr = attr.map_err(|e| ParseError::Xml(e.to_string()))?;
            let key = String::from_utf8_lossy(attr.key.local_name().as_ref()).into_owned();
            let value = attr
                .unescape_value()
                .map_err(|e| ParseError::Xml(e.to_string()))?
                .into_owned();
            attributes.push((key, value));
        }
        Ok(Element {
            name,
            attributes,
            ..Default::default()
        })
    }

    pub fn attr(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// First direct child with the given local name
    pub fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }

    pub fn children_named<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a Element> + 'a {
        self.children.iter().filter(move |c| c.name == name)
    }

    /// Trimmed text of the first child with the given name
    pub fn child_text(&self, name: &str) -> Option<&str> {
        self.child(name)
            .map(|c| c.text.trim())
            .filter(|t| !t.is_empty())
    }

    /// Text of this element and all of its descendants
    pub fn text_content(&self) -> String {
        let mut out = self.text.clone();
        for child in &self.children {
            if !out.is_empty() {
                out.push(' ');
            }
            out.push_str(&child.text_content());
        }
        out
    }

    /// `href` of the first `link` child whose `rel` matches
    pub fn link_href(&self, rel: &str) -> Option<&str> {
        self.children_named("link")
            .find(|link| link.attr("rel").unwrap_or("alternate") == rel)
            .and_then(|link| link.attr("href"))
    }
}

fn attach(stack: &mut [Element], root: &mut Option<Element>, element: Element) {
    match stack.last_mut() {
        Some(parent) => parent.children.push(element),
        None => {
            if root.is_none() {
                *root = Some(element);
            }
        }
    }
}

/// Numeric id carried in the fragment of an Atom id, e.g. `urn:peerworks.org:entry#1111`
pub fn fragment_id(atom_id: &str) -> Option<u64> {
    let (_, fragment) = atom_id.trim().rsplit_once('#')?;
    fragment.parse::<u64>().ok().filter(|id| *id > 0)
}

/// Parse an RFC 3339 timestamp
pub fn parse_timestamp(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

/// A content entry as submitted by a feed collector
#[derive(Debug, Clone, PartialEq)]
pub struct Entry {
    pub id: ItemId,
    pub title: String,
    pub author: Option<String>,
    pub link: Option<String>,
    pub updated: DateTime<Utc>,
    pub content: String,
    pub feed_id: Option<FeedId>,
}

impl Entry {
    /// Read an `<entry>` document
    pub fn from_atom(xml: &str) -> Result<Entry, ParseError> {
        let root = Element::parse(xml)?;
        Entry::from_element(&root)
    }

    pub fn from_element(element: &Element) -> Result<Entry, ParseError> {
        if element.name != "entry" {
            return Err(ParseError::BadEntry(format!(
                "expected <entry>, found <{}>",
                element.name
            )));
        }

        let raw_id = element
            .child_text("id")
            .ok_or_else(|| ParseError::BadEntry("missing id".into()))?;
        let id = fragment_id(raw_id)
            .ok_or_else(|| ParseError::BadEntry(format!("id {raw_id:?} has no numeric fragment")))?;

        let updated = match element.child_text("updated") {
            Some(value) => parse_timestamp(value)
                .ok_or_else(|| ParseError::BadEntry(format!("invalid updated time {value:?}")))?,
            None => Utc::now(),
        };

        let content = element
            .child("content")
            .or_else(|| element.child("summary"))
            .map(Element::text_content)
            .unwrap_or_default();

        Ok(Entry {
            id,
            title: element.child_text("title").unwrap_or_default().to_string(),
            author: element
                .child("author")
                .and_then(|a| a.child_text("name"))
                .map(str::to_string),
            link: element.link_href("alternate").map(str::to_string),
            updated,
            content,
            feed_id: None,
        })
    }

    pub fn with_feed(mut self, feed_id: FeedId) -> Self {
        self.feed_id = Some(feed_id);
        self
    }
}

/// Read feed metadata from an Atom `<entry>` or `<feed>` document
pub fn parse_feed(xml: &str) -> Result<Feed, ParseError> {
    let root = Element::parse(xml)?;
    if root.name != "entry" && root.name != "feed" {
        return Err(ParseError::BadEntry(format!("unexpected <{}>", root.name)));
    }
    let raw_id = root
        .child_text("id")
        .ok_or_else(|| ParseError::BadEntry("feed has no id".into()))?;
    let id = fragment_id(raw_id)
        .ok_or_else(|| ParseError::BadEntry(format!("feed id {raw_id:?} has no numeric fragment")))?;
    Ok(Feed::new(id, root.child_text("title").unwrap_or_default()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ENTRY: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<entry xmlns="http://www.w3.org/2005/Atom">
  <id>urn:peerworks.org:entry#1111</id>
  <title>Rust &amp; friends</title>
  <author><name>Jo</name></author>
  <link rel="alternate" href="http://example.com/1111"/>
  <updated>2026-10-01T12:00:00Z</updated>
  <content type="html">&lt;p&gt;Hello &lt;b&gt;world&lt;/b&gt;&lt;/p&gt;</content>
</entry>"#;

    #[test]
    fn test_parse_entry() {
        let entry = Entry::from_atom(ENTRY).unwrap();
        assert_eq!(entry.id, 1111);
        assert_eq!(entry.title, "Rust & friends");
        assert_eq!(entry.author.as_deref(), Some("Jo"));
        assert_eq!(entry.link.as_deref(), Some("http://example.com/1111"));
        assert_eq!(entry.updated.to_rfc3339(), "2026-10-01T12:00:00+00:00");
        assert_eq!(entry.content, "<p>Hello <b>world</b></p>");
    }

    #[test]
    fn test_malformed_xml() {
        let err = Entry::from_atom("<entry><id>urn:x#1</entry>").unwrap_err();
        assert!(matches!(err, ParseError::Xml(_)));
        assert!(matches!(Entry::from_atom(""), Err(ParseError::Xml(_))));
    }

    #[test]
    fn test_entry_without_numeric_id() {
        let err = Entry::from_atom("<entry><id>urn:peerworks.org:entry</id></entry>").unwrap_err();
        assert!(matches!(err, ParseError::BadEntry(_)));
        let err = Entry::from_atom("<entry><title>no id</title></entry>").unwrap_err();
        assert!(matches!(err, ParseError::BadEntry(_)));
        let err = Entry::from_atom("<feed><id>urn:x#1</id></feed>").unwrap_err();
        assert!(matches!(err, ParseError::BadEntry(_)));
    }

    #[test]
    fn test_parse_feed() {
        let feed = parse_feed("<entry><id>urn:peerworks.org:feed#27</id><title>News</title></entry>")
            .unwrap();
        assert_eq!(feed, Feed::new(27, "News"));
        assert!(matches!(
            parse_feed("<entry><title>News</title></entry>"),
            Err(ParseError::BadEntry(_))
        ));
    }

    #[test]
    fn test_fragment_id() {
        assert_eq!(fragment_id("urn:peerworks.org:entry#42"), Some(42));
        assert_eq!(fragment_id("urn:peerworks.org:entry#0"), None);
        assert_eq!(fragment_id("urn:peerworks.org:entry#abc"), None);
        assert_eq!(fragment_id("42"), None);
    }
}
