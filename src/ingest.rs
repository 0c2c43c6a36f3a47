//! Admin ingestion pipeline.
//!
//! Combines uploaded documents and pasted text into one knowledge blob:
//! documents first in upload order, then the trimmed pasted text after a
//! blank line. The result is truncated to the store's limit and written
//! only if it is not blank. A document that fails extraction is reported
//! and skipped; it never aborts the batch.

use crate::extract::{extract_text, resolve_content_type};
use crate::knowledge::{truncate_chars, KnowledgeStore};

/// One uploaded file.
#[derive(Debug, Clone)]
pub struct Upload {
    pub file_name: String,
    /// Declared MIME type; may be empty, in which case the extension decides.
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Upload {
    pub fn new(
        file_name: impl Into<String>,
        content_type: impl Into<String>,
        bytes: Vec<u8>,
    ) -> Self {
        Self {
            file_name: file_name.into(),
            content_type: content_type.into(),
            bytes,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct IngestFailure {
    pub file_name: String,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct IngestReport {
    pub chars_saved: usize,
    pub truncated: bool,
    pub documents_used: usize,
    pub failures: Vec<IngestFailure>,
}

#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    #[error("no content to save")]
    NoContent { failures: Vec<IngestFailure> },
    /// Writing the knowledge file failed.
    #[error(transparent)]
    Store(#[from] anyhow::Error),
}

/// Text produced by [`combine`] before it is persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Combined {
    pub text: String,
    pub truncated: bool,
    pub documents_used: usize,
    pub failures: Vec<IngestFailure>,
}

pub fn combine(uploads: &[Upload], pasted: Option<&str>, max_chars: usize) -> Combined {
    let mut text = String::new();
    let mut documents_used = 0;
    let mut failures = Vec::new();

    for upload in uploads {
        let content_type = resolve_content_type(&upload.content_type, &upload.file_name);
        match extract_text(&upload.bytes, &content_type) {
            Ok(extracted) => {
                if !extracted.is_empty() {
                    documents_used += 1;
                }
                text.push_str(&extracted);
            }
            Err(e) => {
                tracing::warn!(file = %upload.file_name, error = %e, "skipping upload");
                failures.push(IngestFailure {
                    file_name: upload.file_name.clone(),
                    reason: e.to_string(),
                });
            }
        }
    }

    if let Some(pasted) = pasted.map(str::trim).filter(|p| !p.is_empty()) {
        text.push_str("\n\n");
        text.push_str(pasted);
    }

    let kept = truncate_chars(&text, max_chars);
    let truncated = kept.len() < text.len();
    let text = kept.to_string();

    Combined {
        text,
        truncated,
        documents_used,
        failures,
    }
}

/// Runs the pipeline and replaces the knowledge blob.
pub fn save_knowledge(
    store: &KnowledgeStore,
    uploads: &[Upload],
    pasted: Option<&str>,
) -> Result<IngestReport, IngestError> {
    let combined = combine(uploads, pasted, store.max_chars());

    if combined.text.trim().is_empty() {
        return Err(IngestError::NoContent {
            failures: combined.failures,
        });
    }

    let chars_saved = store.save(&combined.text)?;
    tracing::info!(
        chars = chars_saved,
        truncated = combined.truncated,
        documents = combined.documents_used,
        failed = combined.failures.len(),
        path = %store.path().display(),
        "knowledge saved"
    );

    Ok(IngestReport {
        chars_saved,
        truncated: combined.truncated,
        documents_used: combined.documents_used,
        failures: combined.failures,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extract::{sample_pdf, MIME_PDF, MIME_TEXT};
    use tempfile::TempDir;

    fn text_upload(name: &str, body: &str) -> Upload {
        Upload::new(name, MIME_TEXT, body.as_bytes().to_vec())
    }

    #[test]
    fn documents_then_pasted_text() {
        let uploads = vec![text_upload("a.txt", "alpha "), text_upload("b.txt", "beta")];
        let c = combine(&uploads, Some("  pasted  "), 4500);
        assert_eq!(c.text, "alpha beta\n\npasted");
        assert_eq!(c.documents_used, 2);
        assert!(!c.truncated);
        assert!(c.failures.is_empty());
    }

    #[test]
    fn blank_pasted_text_adds_no_separator() {
        let c = combine(&[text_upload("a.txt", "alpha")], Some(" \n\t "), 4500);
        assert_eq!(c.text, "alpha");
    }

    #[test]
    fn pasted_text_alone_keeps_leading_separator() {
        let c = combine(&[], Some("only this"), 4500);
        assert_eq!(c.text, "\n\nonly this");
    }

    #[test]
    fn combined_text_is_capped() {
        let uploads = vec![text_upload("big.txt", &"a".repeat(40))];
        let c = combine(&uploads, Some(&"b".repeat(40)), 50);
        assert_eq!(c.text.chars().count(), 50);
        assert!(c.truncated);
        assert!(c.text.starts_with(&"a".repeat(40)));
    }

    #[test]
    fn failing_file_is_reported_and_skipped() {
        let uploads = vec![
            Upload::new("broken.pdf", MIME_PDF, b"not a pdf".to_vec()),
            text_upload("good.txt", "Bilal is a software engineer."),
            Upload::new("photo.png", "image/png", vec![0x89, 0x50]),
        ];
        let c = combine(&uploads, None, 4500);
        assert_eq!(c.text, "Bilal is a software engineer.");
        assert_eq!(c.documents_used, 1);
        let names: Vec<&str> = c.failures.iter().map(|f| f.file_name.as_str()).collect();
        assert_eq!(names, vec!["broken.pdf", "photo.png"]);
    }

    #[test]
    fn pdf_text_precedes_pasted_text() {
        let pdf = sample_pdf("Bilal is a software engineer.", "WinAnsiEncoding");
        let uploads = vec![Upload::new("cv.pdf", "", pdf)];
        let c = combine(&uploads, Some("He lives in Lahore."), 4500);

        assert!(c.failures.is_empty(), "{:?}", c.failures);
        assert_eq!(c.documents_used, 1);
        assert!(c.text.ends_with("\n\nHe lives in Lahore."));
        let doc = &c.text[..c.text.len() - "\n\nHe lives in Lahore.".len()];
        let doc_words = doc.split_whitespace().collect::<Vec<_>>().join(" ");
        assert!(doc_words.contains("Bilal is a software engineer."), "{:?}", c.text);
    }

    #[test]
    fn panicking_pdf_does_not_lose_the_batch() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::new(tmp.path().join("knowledge.txt"), 4500);
        let uploads = vec![
            Upload::new("weird.pdf", MIME_PDF, sample_pdf("Hello", "BogusEncoding")),
            text_upload("good.txt", "Bilal is a software engineer."),
        ];

        let report = save_knowledge(&store, &uploads, None).unwrap();
        assert_eq!(report.documents_used, 1);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].file_name, "weird.pdf");
        assert_eq!(store.load().unwrap(), "Bilal is a software engineer.");
    }

    #[test]
    fn whitespace_only_input_never_writes() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::new(tmp.path().join("knowledge.txt"), 4500);
        let uploads = vec![text_upload("blank.txt", "   \n  ")];

        let err = save_knowledge(&store, &uploads, Some("\t")).unwrap_err();
        assert!(matches!(err, IngestError::NoContent { .. }));
        assert!(!store.path().exists());
    }

    #[test]
    fn no_content_carries_failures() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::new(tmp.path().join("knowledge.txt"), 4500);
        let uploads = vec![Upload::new("broken.pdf", MIME_PDF, b"garbage".to_vec())];

        match save_knowledge(&store, &uploads, None) {
            Err(IngestError::NoContent { failures }) => assert_eq!(failures.len(), 1),
            other => panic!("expected NoContent, got {:?}", other),
        }
    }

    #[test]
    fn write_failure_is_a_store_error() {
        let tmp = TempDir::new().unwrap();
        let blocker = tmp.path().join("not-a-dir");
        std::fs::write(&blocker, "file").unwrap();
        let store = KnowledgeStore::new(blocker.join("knowledge.txt"), 4500);

        let err = save_knowledge(&store, &[text_upload("a.txt", "facts")], None).unwrap_err();
        assert!(matches!(err, IngestError::Store(_)), "{:?}", err);
    }

    #[test]
    fn save_replaces_previous_knowledge() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::new(tmp.path().join("knowledge.txt"), 4500);
        save_knowledge(&store, &[text_upload("a.txt", "old facts")], None).unwrap();
        let report = save_knowledge(&store, &[text_upload("b.txt", "new facts")], None).unwrap();

        assert_eq!(report.chars_saved, 9);
        assert_eq!(store.load().unwrap(), "new facts");
    }

    #[test]
    fn persisted_length_never_exceeds_limit() {
        let tmp = TempDir::new().unwrap();
        let store = KnowledgeStore::new(tmp.path().join("knowledge.txt"), 64);
        let long_doc = "z".repeat(100);
        let long_paste = "p".repeat(80);
        for doc in ["", "short", "ünïcödé ", long_doc.as_str()] {
            for pasted in [None, Some(""), Some("pasted"), Some(long_paste.as_str())] {
                let uploads = vec![text_upload("d.txt", doc), text_upload("e.txt", doc)];
                if save_knowledge(&store, &uploads, pasted).is_ok() {
                    assert!(store.load().unwrap().chars().count() <= 64);
                }
            }
        }
    }
}
