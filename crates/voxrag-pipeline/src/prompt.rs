//! RAG prompt assembly.
//!
//! Pure functions: the same query and documents always produce the same prompt.

use voxrag_core::types::{RagPrompt, RetrievedDocument};

/// Below this many remaining characters a document is dropped instead of cut.
pub const MIN_TRUNCATED_CHARS: usize = 200;

const ELLIPSIS: char = '…';
const SEPARATOR: &str = "\n\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PromptLimits {
    pub max_documents: usize,
    pub max_context_chars: usize,
}

impl Default for PromptLimits {
    fn default() -> Self {
        Self {
            max_documents: 5,
            max_context_chars: 12_000,
        }
    }
}

/// Build the prompt for `query`, grounded in `documents` when there are any.
pub fn build_rag_prompt(
    query: &str,
    documents: &[RetrievedDocument],
    limits: &PromptLimits,
) -> RagPrompt {
    let query = query.trim();
    let (context, used) = build_context(documents, limits);

    match context {
        None => RagPrompt {
            query: query.to_string(),
            context: None,
            text: general_knowledge_prompt(query),
            fallback: true,
            documents_used: 0,
        },
        Some(context) => RagPrompt {
            query: query.to_string(),
            text: grounded_prompt(query, &context),
            context: Some(context),
            fallback: false,
            documents_used: used,
        },
    }
}

fn general_knowledge_prompt(query: &str) -> String {
    format!(
        "You are an intelligent assistant. Answer the following question based on your knowledge:\n\n\
         Question: {query}\n\
         Answer:"
    )
}

fn grounded_prompt(query: &str, context: &str) -> String {
    format!(
        "You are an intelligent assistant. Use the following context to answer the question as accurately as possible. \
         If the context doesn't contain enough information to answer the question, say so and provide what relevant information you can.\n\n\
         Context:\n{context}\n\n\
         Question: {query}\n\n\
         Instructions:\n\
         - Answer based primarily on the provided context\n\
         - If the context is insufficient, acknowledge this limitation\n\
         - Keep your answer concise but comprehensive\n\
         - Cite sources when relevant\n\n\
         Answer:"
    )
}

fn entry(source: &str, content: &str) -> String {
    format!("Source: {source}\nContent: {content}")
}

/// Append documents in order until the character budget runs out.
fn build_context(documents: &[RetrievedDocument], limits: &PromptLimits) -> (Option<String>, usize) {
    let mut context = String::new();
    let mut used_chars = 0usize;
    let mut used_docs = 0usize;

    for doc in documents
        .iter()
        .filter(|d| !d.content.trim().is_empty())
        .take(limits.max_documents)
    {
        let sep_chars = if used_docs == 0 { 0 } else { SEPARATOR.len() };
        let full = entry(&doc.source, doc.content.trim());
        let full_chars = full.chars().count();
        let remaining = limits
            .max_context_chars
            .saturating_sub(used_chars + sep_chars);

        if full_chars <= remaining {
            if sep_chars > 0 {
                context.push_str(SEPARATOR);
            }
            context.push_str(&full);
            used_chars += sep_chars + full_chars;
            used_docs += 1;
            continue;
        }

        if remaining >= MIN_TRUNCATED_CHARS {
            let header_chars = entry(&doc.source, "").chars().count();
            let room = remaining.saturating_sub(header_chars + 1);
            if room > 0 {
                let cut: String = doc.content.trim().chars().take(room).collect();
                if sep_chars > 0 {
                    context.push_str(SEPARATOR);
                }
                context.push_str(&entry(&doc.source, &format!("{cut}{ELLIPSIS}")));
                used_docs += 1;
            }
        }
        break;
    }

    if used_docs == 0 {
        (None, 0)
    } else {
        (Some(context), used_docs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn doc(content: &str, source: &str) -> RetrievedDocument {
        RetrievedDocument {
            content: content.into(),
            source: source.into(),
            score: 1.0,
        }
    }

    #[test]
    fn test_no_documents_uses_general_knowledge() {
        let prompt = build_rag_prompt("What is Rust?", &[], &PromptLimits::default());
        assert!(prompt.fallback);
        assert!(prompt.context.is_none());
        assert!(!prompt.text.contains("Context:"));
        assert!(prompt.text.contains("Question: What is Rust?"));
        assert!(prompt.text.ends_with("Answer:"));
    }

    #[test]
    fn test_context_lists_documents_in_order() {
        let docs = vec![doc("30 day returns", "policy.pdf"), doc("Free shipping", "faq.md")];
        let prompt = build_rag_prompt("  return policy?  ", &docs, &PromptLimits::default());
        assert!(!prompt.fallback);
        assert_eq!(prompt.documents_used, 2);
        assert_eq!(prompt.query, "return policy?");
        let context = prompt.context.as_deref().unwrap();
        assert_eq!(
            context,
            "Source: policy.pdf\nContent: 30 day returns\n\nSource: faq.md\nContent: Free shipping"
        );
        assert!(prompt.text.contains("Context:\nSource: policy.pdf"));
        assert!(prompt.text.contains("- Cite sources when relevant"));
        let policy = prompt.text.find("policy.pdf").unwrap();
        let faq = prompt.text.find("faq.md").unwrap();
        assert!(policy < faq);
    }

    #[test]
    fn test_deterministic() {
        let docs = vec![doc("a", "x"), doc("b", "y")];
        let limits = PromptLimits::default();
        assert_eq!(
            build_rag_prompt("q", &docs, &limits),
            build_rag_prompt("q", &docs, &limits)
        );
    }

    #[test]
    fn test_document_cap() {
        let docs: Vec<_> = (0..8).map(|i| doc(&format!("content {i}"), &format!("s{i}"))).collect();
        let limits = PromptLimits {
            max_documents: 3,
            max_context_chars: 12_000,
        };
        let prompt = build_rag_prompt("q", &docs, &limits);
        assert_eq!(prompt.documents_used, 3);
        assert!(!prompt.text.contains("content 3"));
    }

    #[test]
    fn test_budget_truncates_with_ellipsis() {
        let docs = vec![doc(&"a".repeat(200), "first"), doc(&"b".repeat(5000), "second")];
        let limits = PromptLimits {
            max_documents: 5,
            max_context_chars: 1000,
        };
        let prompt = build_rag_prompt("q", &docs, &limits);
        let context = prompt.context.unwrap();
        assert_eq!(prompt.documents_used, 2);
        assert!(context.ends_with('…'));
        assert!(context.chars().count() <= 1000);
    }

    #[test]
    fn test_budget_drops_when_too_little_room() {
        let docs = vec![
            doc(&"a".repeat(900), "first"),
            doc(&"b".repeat(500), "second"),
            doc("tiny", "third"),
        ];
        let limits = PromptLimits {
            max_documents: 5,
            max_context_chars: 1000,
        };
        let prompt = build_rag_prompt("q", &docs, &limits);
        assert_eq!(prompt.documents_used, 1);
        let context = prompt.context.unwrap();
        assert!(!context.contains("second"));
        // later documents are dropped too, even if they would fit
        assert!(!context.contains("third"));
    }

    #[test]
    fn test_blank_documents_are_skipped() {
        let docs = vec![doc("   ", "empty"), doc("", "also empty")];
        let prompt = build_rag_prompt("q", &docs, &PromptLimits::default());
        assert!(prompt.fallback);
    }

    #[test]
    fn test_truncation_respects_char_boundaries() {
        let docs = vec![doc(&"é".repeat(3000), "accents")];
        let limits = PromptLimits {
            max_documents: 5,
            max_context_chars: 500,
        };
        let prompt = build_rag_prompt("q", &docs, &limits);
        let context = prompt.context.unwrap();
        assert_eq!(context.chars().count(), 500);
    }
}
