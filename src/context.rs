//! Context assembly: turn search results into a bounded, citation-ready
//! prompt block.
//!
//! Q&A answers are the primary evidence. The first `max_answers` of them
//! (by similarity) become numbered passages `[1]`, `[2]`, … in a fixed
//! template that asks the model to cite `[n]`. Document results at or
//! above the similarity floor fill the template's related-documents field.
//!
//! Sources are the documents owning the cited answers, deduplicated by id
//! in first-citation order and fetched with one batch lookup, followed by
//! any related documents not already cited.
//!
//! Lengths are counted in `char`s. Text over the limit is cut and ends
//! with [`TRUNCATION_MARKER`].

use std::collections::HashSet;

use crate::config::Config;
use crate::models::{
    ContextStatus, Document, QaPair, RagContext, RecordKind, SearchResult, Source, VectorRecord,
};
use crate::store::DocumentLookup;

pub const NO_PASSAGES: &str = "No relevant passages found.";
pub const TRUNCATION_MARKER: &str = "\n[context truncated]";
pub const NO_RESULTS_ERROR: &str = "No relevant information found for this query.";

const ELLIPSIS: &str = "...";

#[derive(Debug, Clone, PartialEq)]
pub struct ContextOptions {
    pub max_answers: usize,
    pub excerpt_length: usize,
    /// Minimum similarity for a document result to count as evidence.
    pub document_similarity_floor: f32,
}

impl Default for ContextOptions {
    fn default() -> Self {
        Self {
            max_answers: 10,
            excerpt_length: 200,
            document_similarity_floor: 0.5,
        }
    }
}

impl ContextOptions {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_answers: config.context.max_answers,
            excerpt_length: config.context.excerpt_length,
            document_similarity_floor: config.retrieval.document_similarity_floor,
        }
    }
}

/// Whether `results` hold anything worth answering from.
pub fn has_quality_results(results: &[SearchResult], floor: f32) -> bool {
    !results.is_empty()
        && results.iter().any(|r| match r.record {
            VectorRecord::Document(_) => r.similarity >= floor,
            VectorRecord::Qa(_) => true,
        })
}

/// Assemble the context for `query` from `results`.
///
/// Never fails outright: a lookup error yields a context with
/// [`ContextStatus::Failed`], and a result set without quality evidence
/// yields [`ContextStatus::NoResults`]. Both have `success == false`.
pub async fn build_context(
    lookup: &dyn DocumentLookup,
    query: &str,
    results: &[SearchResult],
    max_context_length: usize,
    options: &ContextOptions,
) -> RagContext {
    if !has_quality_results(results, options.document_similarity_floor) {
        return RagContext {
            text: String::new(),
            sources: Vec::new(),
            success: false,
            error: Some(NO_RESULTS_ERROR.to_string()),
            status: ContextStatus::NoResults,
            truncated: false,
        };
    }

    let mut ordered: Vec<&SearchResult> = results.iter().collect();
    ordered.sort_by(|a, b| {
        b.similarity
            .partial_cmp(&a.similarity)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.record.id().cmp(b.record.id()))
    });

    let answers: Vec<(&QaPair, f32)> = ordered
        .iter()
        .filter_map(|r| match &r.record {
            VectorRecord::Qa(qa) => Some((qa, r.similarity)),
            VectorRecord::Document(_) => None,
        })
        .take(options.max_answers)
        .collect();

    let mut seen_documents = HashSet::new();
    let related: Vec<(&Document, f32)> = ordered
        .iter()
        .filter_map(|r| match &r.record {
            VectorRecord::Document(doc) if r.similarity >= options.document_similarity_floor => {
                Some((doc, r.similarity))
            }
            _ => None,
        })
        .filter(|&(doc, _)| seen_documents.insert(doc.id.as_str()))
        .collect();

    let passages = answers
        .iter()
        .enumerate()
        .map(|(i, (qa, _))| format!("[{}] {}", i + 1, excerpt(&qa.answer, options.excerpt_length)))
        .collect::<Vec<_>>()
        .join("\n\n");
    let documents = related
        .iter()
        .map(|(doc, _)| document_line(doc))
        .collect::<Vec<_>>()
        .join("\n");

    let text = render(query, &passages, &documents);
    let (text, truncated) = truncate_context(&text, max_context_length);

    let sources = match collect_sources(lookup, &answers, &related, options).await {
        Ok(sources) => sources,
        Err(e) => {
            tracing::warn!(error = %e, "document lookup failed while building context");
            return RagContext::failed(e.to_string());
        }
    };

    RagContext {
        text,
        sources,
        success: true,
        error: None,
        status: ContextStatus::Answered,
        truncated,
    }
}

async fn collect_sources(
    lookup: &dyn DocumentLookup,
    answers: &[(&QaPair, f32)],
    related: &[(&Document, f32)],
    options: &ContextOptions,
) -> crate::error::CoreResult<Vec<Source>> {
    let mut seen = HashSet::new();
    let mut cited: Vec<(&str, f32)> = Vec::new();
    for (qa, similarity) in answers {
        if let Some(doc_id) = qa.document_id.as_deref() {
            if seen.insert(doc_id) {
                cited.push((doc_id, *similarity));
            }
        }
    }

    let mut sources = Vec::with_capacity(cited.len() + related.len());
    if !cited.is_empty() {
        let ids: Vec<String> = cited.iter().map(|(id, _)| id.to_string()).collect();
        let documents = lookup.get_documents(&ids).await?;
        for (id, similarity) in &cited {
            if let Some(doc) = documents.get(*id) {
                sources.push(source_for(doc, *similarity, options.excerpt_length));
            }
        }
    }

    for (doc, similarity) in related {
        if seen.insert(doc.id.as_str()) {
            sources.push(source_for(doc, *similarity, options.excerpt_length));
        }
    }
    Ok(sources)
}

fn source_for(doc: &Document, similarity: f32, excerpt_length: usize) -> Source {
    Source {
        id: doc.id.clone(),
        title: doc.title.clone(),
        excerpt: excerpt(&doc.content, excerpt_length),
        kind: RecordKind::Document,
        similarity: Some(similarity),
        url: doc.url.clone(),
        year: doc.year,
        specialty: doc.specialty.clone(),
    }
}

fn document_line(doc: &Document) -> String {
    match doc.year {
        Some(year) => format!("- {} ({})", doc.title, year),
        None => format!("- {}", doc.title),
    }
}

fn render(query: &str, passages: &str, documents: &str) -> String {
    let or_placeholder = |field: &str| {
        if field.trim().is_empty() {
            NO_PASSAGES.to_string()
        } else {
            field.to_string()
        }
    };
    format!(
        "You are a medical reference assistant. Answer the question using the \
numbered context passages below. When you use a passage, cite it as [n]. If the context does \
not answer the question, say so.

Question: {query}

Context passages:
{passages}

Related documents:
{documents}",
        query = query.trim(),
        passages = or_placeholder(passages),
        documents = or_placeholder(documents),
    )
}

/// First `max_chars` characters of `text`, with an ellipsis when cut.
pub fn excerpt(text: &str, max_chars: usize) -> String {
    let text = text.trim();
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{}{}", cut.trim_end(), ELLIPSIS)
}

/// Cut `text` to at most `max_chars`, ending with the truncation marker.
///
/// When the limit is shorter than the marker itself only a prefix of the
/// marker fits; the returned flag still reports the cut.
pub fn truncate_context(text: &str, max_chars: usize) -> (String, bool) {
    if text.chars().count() <= max_chars {
        return (text.to_string(), false);
    }
    let marker_len = TRUNCATION_MARKER.chars().count();
    if max_chars < marker_len {
        return (TRUNCATION_MARKER.chars().take(max_chars).collect(), true);
    }
    let mut cut: String = text.chars().take(max_chars - marker_len).collect();
    cut.push_str(TRUNCATION_MARKER);
    (cut, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CoreResult;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// In-memory lookup that records each batch it is asked for.
    struct FakeLookup {
        documents: HashMap<String, Document>,
        calls: Mutex<Vec<Vec<String>>>,
    }

    impl FakeLookup {
        fn new(docs: Vec<Document>) -> Self {
            Self {
                documents: docs.into_iter().map(|d| (d.id.clone(), d)).collect(),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl DocumentLookup for FakeLookup {
        async fn get_documents(&self, ids: &[String]) -> CoreResult<HashMap<String, Document>> {
            self.calls.lock().unwrap().push(ids.to_vec());
            Ok(ids
                .iter()
                .filter_map(|id| self.documents.get(id).map(|d| (id.clone(), d.clone())))
                .collect())
        }
    }

    struct FailingLookup;

    #[async_trait]
    impl DocumentLookup for FailingLookup {
        async fn get_documents(&self, _ids: &[String]) -> CoreResult<HashMap<String, Document>> {
            Err(crate::error::CoreError::Search("disk I/O error".to_string()))
        }
    }

    fn document(id: &str, title: &str) -> Document {
        Document {
            id: id.to_string(),
            title: title.to_string(),
            content: format!("{} content", title),
            url: Some(format!("https://example.org/{}", id)),
            year: Some(2021),
            specialty: Some("endocrinology".to_string()),
        }
    }

    fn doc_result(id: &str, similarity: f32) -> SearchResult {
        SearchResult {
            record: VectorRecord::Document(document(id, &format!("Title {}", id))),
            similarity,
        }
    }

    fn qa_result(id: &str, doc_id: Option<&str>, answer: &str, similarity: f32) -> SearchResult {
        SearchResult {
            record: VectorRecord::Qa(QaPair {
                id: id.to_string(),
                question: format!("question {}", id),
                answer: answer.to_string(),
                document_id: doc_id.map(str::to_string),
            }),
            similarity,
        }
    }

    #[tokio::test]
    async fn empty_results_are_not_a_failure() {
        let lookup = FakeLookup::new(vec![]);
        let ctx = build_context(&lookup, "diabetes", &[], 4000, &ContextOptions::default()).await;
        assert!(!ctx.success);
        assert_eq!(ctx.status, ContextStatus::NoResults);
        assert!(ctx.error.is_some());
        assert!(ctx.sources.is_empty());
    }

    #[tokio::test]
    async fn weak_documents_alone_are_not_quality() {
        let lookup = FakeLookup::new(vec![]);
        let results = vec![doc_result("doc1", 0.4)];
        let ctx = build_context(&lookup, "q", &results, 4000, &ContextOptions::default()).await;
        assert_eq!(ctx.status, ContextStatus::NoResults);
    }

    #[tokio::test]
    async fn any_qa_counts_as_quality() {
        let lookup = FakeLookup::new(vec![]);
        let results = vec![qa_result("qa1", None, "Rest and fluids.", 0.1)];
        let ctx = build_context(&lookup, "q", &results, 4000, &ContextOptions::default()).await;
        assert!(ctx.success);
        assert!(ctx.text.contains("[1] Rest and fluids."));
        assert!(ctx.text.contains(&format!("Related documents:\n{}", NO_PASSAGES)));
    }

    #[tokio::test]
    async fn strong_document_without_answers_uses_placeholder() {
        let lookup = FakeLookup::new(vec![]);
        let results = vec![doc_result("doc1", 0.9)];
        let ctx = build_context(&lookup, "q", &results, 4000, &ContextOptions::default()).await;
        assert!(ctx.success);
        assert!(ctx.text.contains(&format!("Context passages:\n{}", NO_PASSAGES)));
        assert!(ctx.text.contains("- Title doc1 (2021)"));
        assert_eq!(ctx.sources.len(), 1);
        assert!(lookup.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn sources_dedup_in_first_citation_order() {
        let lookup = FakeLookup::new(vec![document("docA", "A"), document("docB", "B")]);
        let results = vec![
            qa_result("qa1", Some("docB"), "first", 0.9),
            qa_result("qa2", Some("docA"), "second", 0.8),
            qa_result("qa3", Some("docB"), "third", 0.7),
        ];
        let ctx = build_context(&lookup, "q", &results, 4000, &ContextOptions::default()).await;

        let ids: Vec<&str> = ctx.sources.iter().map(|s| s.id.as_str()).collect();
        assert_eq!(ids, vec!["docB", "docA"]);
        let calls = lookup.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], vec!["docB".to_string(), "docA".to_string()]);
    }

    #[tokio::test]
    async fn answers_capped_and_excerpted() {
        let lookup = FakeLookup::new(vec![]);
        let long = "x".repeat(500);
        let results: Vec<SearchResult> = (0..15)
            .map(|i| qa_result(&format!("qa{:02}", i), None, &long, 0.9 - i as f32 * 0.01))
            .collect();
        let ctx = build_context(&lookup, "q", &results, 100_000, &ContextOptions::default()).await;

        assert!(ctx.text.contains("[10] "));
        assert!(!ctx.text.contains("[11] "));
        let expected = format!("[1] {}{}", "x".repeat(200), ELLIPSIS);
        assert!(ctx.text.contains(&expected));
        assert!(!ctx.truncated);
    }

    #[tokio::test]
    async fn context_never_exceeds_limit() {
        let lookup = FakeLookup::new(vec![document("doc1", "Diabetes")]);
        let results = vec![
            qa_result("qa1", Some("doc1"), &"insulin ".repeat(40), 0.95),
            doc_result("doc1", 0.9),
        ];
        let full = build_context(&lookup, "diabetes", &results, usize::MAX, &ContextOptions::default())
            .await
            .text
            .chars()
            .count();
        let marker_len = TRUNCATION_MARKER.chars().count();

        for max in (0..full + 5).step_by(7).chain([marker_len, full, full - 1]) {
            let ctx = build_context(&lookup, "diabetes", &results, max, &ContextOptions::default()).await;
            assert!(ctx.text.chars().count() <= max, "limit {}", max);
            if max < full {
                assert!(ctx.truncated);
                if max >= marker_len {
                    assert!(ctx.text.ends_with(TRUNCATION_MARKER));
                }
            } else {
                assert!(!ctx.truncated);
            }
        }
    }

    #[tokio::test]
    async fn literal_braces_in_fields_are_kept() {
        let lookup = FakeLookup::new(vec![]);
        let results = vec![qa_result("qa1", None, "Use {documents} and {query} verbatim.", 0.9)];
        let ctx = build_context(
            &lookup,
            "explain {passages} please",
            &results,
            4000,
            &ContextOptions::default(),
        )
        .await;

        assert!(ctx.success);
        assert!(ctx.text.contains("Question: explain {passages} please"));
        assert!(ctx.text.contains("[1] Use {documents} and {query} verbatim."));
        assert!(ctx.text.contains(&format!("Related documents:\n{}", NO_PASSAGES)));
    }

    #[tokio::test]
    async fn lookup_failure_is_reported() {
        let results = vec![qa_result("qa1", Some("doc1"), "answer", 0.9)];
        let ctx = build_context(&FailingLookup, "q", &results, 4000, &ContextOptions::default()).await;
        assert!(!ctx.success);
        assert_eq!(ctx.status, ContextStatus::Failed);
        assert!(ctx.error.unwrap().contains("disk I/O error"));
    }

    #[test]
    fn excerpt_counts_characters() {
        assert_eq!(excerpt("héllo wörld", 5), "héllo...");
        assert_eq!(excerpt("short", 200), "short");
    }

    #[test]
    fn truncation_is_char_safe() {
        let (text, cut) = truncate_context(&"é".repeat(50), 30);
        assert!(cut);
        assert_eq!(text.chars().count(), 30);
        assert!(text.ends_with(TRUNCATION_MARKER));
    }
}
