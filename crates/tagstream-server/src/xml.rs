//! XML documents returned by the HTTP surface

use quick_xml::escape::escape;
use std::fmt::Write;
use tagstream_engine::{JobSnapshot, JobState};

pub const CONTENT_TYPE: &str = "application/xml";

pub const NOT_FOUND: &str = "Resource not found.";
pub const BAD_XML: &str = "Badly formatted XML.";
pub const MISSING_TAG_URL: &str = "Missing tag url in job description";

const HEADER: &str = "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n";

/// `<errors>` document with a single message
pub fn errors(message: &str) -> String {
    format!(
        "{HEADER}<errors>\n  <error>{}</error>\n</errors>\n",
        escape(message)
    )
}

/// `<info>` document
pub fn info(message: &str) -> String {
    format!("{HEADER}<info>{}</info>\n", escape(message))
}

/// Server identification
pub fn about() -> String {
    format!(
        "{HEADER}<classifier>\n  <version type=\"string\">{}</version>\n</classifier>\n",
        env!("CARGO_PKG_VERSION")
    )
}

/// Job status document. Progress is reported as a percentage.
pub fn job(snapshot: &JobSnapshot) -> String {
    let mut doc = String::from(HEADER);
    doc.push_str("<job>\n");
    let _ = writeln!(doc, "  <id>{}</id>", escape(snapshot.id.as_str()));
    let _ = writeln!(doc, "  <tag-url>{}</tag-url>", escape(snapshot.tag_url.as_str()));
    if snapshot.state == JobState::Error {
        let message = snapshot.error_message.as_deref().unwrap_or_default();
        let _ = writeln!(doc, "  <error-message>{}</error-message>", escape(message));
    }
    let _ = writeln!(doc, "  <duration type=\"float\">{:.2}</duration>", snapshot.duration);
    let _ = writeln!(
        doc,
        "  <progress type=\"float\">{:.1}</progress>",
        snapshot.progress * 100.0
    );
    let _ = writeln!(
        doc,
        "  <items-classified type=\"integer\">{}</items-classified>",
        snapshot.items_classified
    );
    let _ = writeln!(doc, "  <taggings type=\"integer\">{}</taggings>", snapshot.taggings);
    let _ = writeln!(doc, "  <status>{}</status>", snapshot.state);
    doc.push_str("</job>\n");
    doc
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn snapshot(state: JobState) -> JobSnapshot {
        JobSnapshot {
            id: "5f0c".to_string(),
            tag_url: "http://example.com/tags/a&b".to_string(),
            state,
            progress: 0.4567,
            error_message: Some("tag fetch <failed>".to_string()),
            duration: 1.23456,
            items_classified: 12,
            taggings: 3,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_job_document() {
        let doc = job(&snapshot(JobState::Running));
        assert!(doc.contains("<id>5f0c</id>"));
        assert!(doc.contains("<duration type=\"float\">1.23</duration>"));
        assert!(doc.contains("<progress type=\"float\">45.7</progress>"));
        assert!(doc.contains("<status>Running</status>"));
        assert!(doc.contains("a&amp;b"));
        assert!(!doc.contains("error-message"));
    }

    #[test]
    fn test_error_message_only_for_failed_jobs() {
        let doc = job(&snapshot(JobState::Error));
        assert!(doc.contains("<error-message>tag fetch &lt;failed&gt;</error-message>"));
        assert!(doc.contains("<status>Error</status>"));
    }

    #[test]
    fn test_errors_document() {
        assert!(errors(NOT_FOUND).contains("<error>Resource not found.</error>"));
        assert!(about().contains(env!("CARGO_PKG_VERSION")));
    }
}
