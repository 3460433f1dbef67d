//! Document ingestion and requirement-file parsing.
//!
//! Ingestion turns document sections into vector store records: each
//! section is embedded once and upserted into its `(document, chapter,
//! kind)` slot, so re-ingesting an unchanged document costs no provider
//! calls beyond the embeddings for sections that actually changed text.
//! (Unchanged sections are still embedded here; the store's hash check
//! only dedups the write. Callers that ingest very large corpora should
//! batch at a higher level.)
//!
//! Requirement files are plain text, one requirement per line. Blank
//! lines, and lines that are only section numbering, are skipped; leading
//! ordinals like `1.`, `2)`, `(3)` are stripped.

use std::sync::Arc;

use crate::error::Result;
use crate::models::{ContentKind, NewEmbedding, Requirement};
use crate::providers::Embedder;
use crate::store::{Upserted, VectorStore};

/// Sections shorter than this are noise (page numbers, stray headings)
/// and are skipped.
pub const MIN_SECTION_CHARS: usize = 10;

const SUMMARY_CHARS: usize = 200;

/// One ingestible piece of a document.
#[derive(Debug, Clone)]
pub struct Section {
    pub chapter_id: Option<String>,
    pub kind: ContentKind,
    pub text: String,
}

/// Counts from one ingestion run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestStats {
    pub inserted: usize,
    pub unchanged: usize,
    pub skipped: usize,
}

/// Embed and store a document's sections.
pub async fn ingest_sections(
    store: &VectorStore,
    embedder: &Arc<dyn Embedder>,
    document_id: &str,
    sections: &[Section],
) -> Result<IngestStats> {
    let mut stats = IngestStats::default();

    for section in sections {
        let text = section.text.trim();
        if text.chars().count() < MIN_SECTION_CHARS {
            stats.skipped += 1;
            continue;
        }

        let vector = embedder.embed(text).await?;
        let new = NewEmbedding {
            document_id: document_id.to_string(),
            chapter_id: section.chapter_id.clone(),
            content_kind: section.kind,
            content_text: text.to_string(),
            content_summary: Some(summarize(text)),
            vector,
            model: embedder.model_name().to_string(),
            metadata: serde_json::json!({}),
        };

        match store.upsert(&new).await? {
            Upserted { inserted: true, .. } => stats.inserted += 1,
            Upserted { inserted: false, .. } => stats.unchanged += 1,
        }
    }

    tracing::info!(
        document_id,
        inserted = stats.inserted,
        unchanged = stats.unchanged,
        skipped = stats.skipped,
        "document ingested"
    );
    Ok(stats)
}

/// Parse a requirements file: one requirement per non-empty line, with
/// numbering and pure section-heading lines dropped.
pub fn parse_requirements(text: &str) -> Vec<Requirement> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || is_section_number(line) {
                return None;
            }
            let content = strip_ordinal(line);
            if content.is_empty() {
                return None;
            }
            Some(Requirement::from_content(content))
        })
        .collect()
}

/// A short leading excerpt used as the answer text for document matches.
fn summarize(text: &str) -> String {
    if text.chars().count() <= SUMMARY_CHARS {
        return text.to_string();
    }
    let cut: String = text.chars().take(SUMMARY_CHARS).collect();
    format!("{cut}...")
}

/// True for lines that are nothing but section numbering (`3`, `2.1`,
/// `1.4.2`).
fn is_section_number(line: &str) -> bool {
    !line.is_empty()
        && line
            .chars()
            .all(|c| c.is_ascii_digit() || c == '.')
        && line.chars().any(|c| c.is_ascii_digit())
}

/// Strip a leading ordinal marker: `1.`, `12)`, `(3)`, or a bare `4 ` at
/// the start of a line.
fn strip_ordinal(line: &str) -> &str {
    let trimmed = line.trim_start_matches('(');
    let digits = trimmed.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 0 {
        return line;
    }
    let rest = &trimmed[digits..];
    let rest = rest
        .strip_prefix('.')
        .or_else(|| rest.strip_prefix(')'))
        .unwrap_or(rest);
    let rest = rest.trim_start();
    if rest.is_empty() {
        line
    } else {
        rest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_skips_blank_and_numbering() {
        let text = "\n3.1\nSupports TLS 1.3\n\n2. Encrypts data at rest\n";
        let reqs = parse_requirements(text);
        assert_eq!(reqs.len(), 2);
        assert_eq!(reqs[0].content, "Supports TLS 1.3");
        assert_eq!(reqs[1].content, "Encrypts data at rest");
    }

    #[test]
    fn test_strip_ordinal_variants() {
        assert_eq!(strip_ordinal("1. foo"), "foo");
        assert_eq!(strip_ordinal("12) bar"), "bar");
        assert_eq!(strip_ordinal("(3) baz"), "baz");
        assert_eq!(strip_ordinal("no number"), "no number");
        // Version-like content is not an ordinal to strip blindly.
        assert_eq!(strip_ordinal("2 factor auth"), "factor auth");
    }

    #[test]
    fn test_section_number_detection() {
        assert!(is_section_number("3"));
        assert!(is_section_number("2.1"));
        assert!(is_section_number("1.4.2"));
        assert!(!is_section_number("3a"));
        assert!(!is_section_number("..."));
        assert!(!is_section_number("Supports TLS"));
    }

    #[test]
    fn test_summarize_truncates() {
        let long = "x".repeat(300);
        let summary = summarize(&long);
        assert_eq!(summary.chars().count(), 203);
        assert!(summary.ends_with("..."));
        assert_eq!(summarize("short"), "short");
    }
}
