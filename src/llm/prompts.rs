// src/llm/prompts.rs
// Prompt templates for background intelligence and context injection

/// Sentinel used when summarization has not run or failed. Consumers treat
/// it as "no summary" (it is never injected into prompts).
pub const DEFAULT_SUMMARY: &str = "(no summary yet)";

/// Short conversation summary. The trailing Topics line is parsed off by
/// the context-window builder.
pub const CONV_SUMMARY_SHORT: &str = r#"Summarize this conversation in 1-2 sentences. Focus on what the user is trying to accomplish and any decisions made.

After the summary, add one final line of the form:
Topics: topic1, topic2, topic3

Respond with ONLY the summary and the Topics line, no preamble."#;

/// Full conversation summary for longer conversations.
pub const CONV_SUMMARY_FULL: &str = r#"Write a detailed summary of this conversation. Cover:
- The user's goals and how they evolved
- Key facts, constraints, and resources mentioned
- Decisions made and their rationale
- Open questions or next steps

Keep it under 300 words. Respond with ONLY the summary, no preamble."#;

/// Project-level summary aggregated from conversation summaries.
pub const PROJECT_SUMMARY: &str = r#"These are summaries of the conversations in one project. Combine them into a single project summary covering the project's purpose, current state, and open threads.

Keep it under 200 words. Respond with ONLY the summary, no preamble."#;

/// Conversation title generation.
pub const TITLE_PROMPT: &str = r#"Generate a short title for this conversation. Rules:
- At most 6 words
- No quotes, no trailing punctuation
- Describe the subject, not the participants

Respond with ONLY the title."#;

/// The closed set of user-profile categories. Extraction output naming any
/// other category is rejected.
pub const PROFILE_CATEGORIES: [&str; 10] = [
    "identity",
    "preferences",
    "work",
    "projects",
    "skills",
    "interests",
    "relationships",
    "goals",
    "habits",
    "context",
];

/// Extract profile facts from one exchange. JSON-only contract.
pub const PROFILE_EXTRACTION_PROMPT: &str = r#"Extract durable facts about the user from this exchange. Only include facts worth remembering across conversations.

Return ONLY a JSON array. Each item:
- "text": the fact as a clear standalone statement
- "category": one of "identity", "preferences", "work", "projects", "skills", "interests", "relationships", "goals", "habits", "context"
- "confidence": number between 0 and 1

Example:
[
  {"text": "Works as a data engineer", "category": "work", "confidence": 0.9}
]

If nothing is worth remembering, return: []

Respond with ONLY the JSON array, no other text."#;

/// Merge newly accepted facts into the existing profile, deduping and
/// re-phrasing in place.
pub const PROFILE_MERGE_PROMPT: &str = r#"You maintain a user profile as a bulleted list of facts. Merge the new facts into the existing list:
- Drop duplicates and near-duplicates (keep the more specific phrasing)
- Update facts the new information contradicts
- Keep every bullet in the form: category: fact text

Respond with ONLY the merged bullet list, one fact per line, each starting with "- "."#;

/// Vision prompt for image resource summaries.
pub const IMAGE_SUMMARY_PROMPT: &str = r#"Describe this image in 2-3 sentences so it can be referenced in conversation without seeing it. Mention any visible text.

Respond with ONLY the description."#;

/// Text-extraction summary prompt for document resources.
pub const DOC_SUMMARY_PROMPT: &str = r#"Summarize this document in 2-3 sentences, then list its key points as short bullets (at most 5).

Respond with ONLY the summary and bullets."#;

/// Render the user-profile system block from category → texts pairs.
/// Categories come in profile order; empty categories are skipped.
pub fn render_user_profile(sections: &[(&str, Vec<String>)]) -> String {
    let mut out = String::from("What is known about the user:\n");
    let mut any = false;
    for (category, texts) in sections {
        if texts.is_empty() {
            continue;
        }
        any = true;
        out.push_str(&format!("\n{}:\n", category));
        for text in texts {
            out.push_str(&format!("- {}\n", text));
        }
    }
    if !any {
        return String::new();
    }
    out
}

/// Render the context-memory system block from project and conversation
/// summaries. Returns None when neither side has anything to say.
pub fn render_context_memory(
    project: Option<(&str, &str, &[String])>,
    conversation_summary: Option<&str>,
    topics: &[String],
    conversation_resources: &[String],
) -> Option<String> {
    let mut sections: Vec<String> = Vec::new();

    if let Some((name, summary, resources)) = project {
        if !summary.is_empty() && summary != DEFAULT_SUMMARY {
            let mut block = format!("Project \"{}\": {}", name, summary);
            if !resources.is_empty() {
                block.push_str(&format!("\nProject resources: {}", resources.join(", ")));
            }
            sections.push(block);
        }
    }

    if let Some(summary) = conversation_summary {
        if !summary.is_empty() && summary != DEFAULT_SUMMARY {
            let mut block = format!("Earlier in this conversation: {}", summary);
            if !topics.is_empty() {
                block.push_str(&format!("\nTopics so far: {}", topics.join(", ")));
            }
            if !conversation_resources.is_empty() {
                block.push_str(&format!(
                    "\nReferenced resources: {}",
                    conversation_resources.join(", ")
                ));
            }
            sections.push(block);
        }
    }

    if sections.is_empty() {
        None
    } else {
        Some(format!("Context memory:\n\n{}", sections.join("\n\n")))
    }
}

/// Templated text part referencing attached resources by id when they are
/// not (or cannot be) inlined. Relies on resource summaries prepared
/// separately.
pub fn render_resource_reference(labels_and_ids: &[(String, String)]) -> String {
    let refs: Vec<String> = labels_and_ids
        .iter()
        .map(|(label, id)| format!("{} [Resource-{}]", label, id))
        .collect();
    format!(
        "Attached resources (see their summary notes): {}",
        refs.join(", ")
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_profile_categories_are_ten_unique() {
        let set: std::collections::HashSet<_> = PROFILE_CATEGORIES.iter().collect();
        assert_eq!(set.len(), 10);
    }

    #[test]
    fn test_render_user_profile_skips_empty() {
        let rendered = render_user_profile(&[
            ("identity", vec!["Name is Sam".into()]),
            ("work", vec![]),
            ("habits", vec!["Writes daily notes".into(), "Reviews weekly".into()]),
        ]);
        assert!(rendered.contains("identity:"));
        assert!(!rendered.contains("work:"));
        assert!(rendered.contains("- Writes daily notes"));
    }

    #[test]
    fn test_render_user_profile_all_empty() {
        assert!(render_user_profile(&[("identity", vec![])]).is_empty());
    }

    #[test]
    fn test_render_context_memory_both_sides() {
        let resources = vec!["abcd1234".to_string()];
        let block = render_context_memory(
            Some(("Research", "Comparing vector stores", &resources)),
            Some("User asked about sqlite-vec"),
            &["sqlite".into(), "vectors".into()],
            &[],
        )
        .unwrap();
        assert!(block.contains("Project \"Research\""));
        assert!(block.contains("Topics so far: sqlite, vectors"));
    }

    #[test]
    fn test_render_context_memory_nothing() {
        assert!(render_context_memory(None, None, &[], &[]).is_none());
        // The default sentinel counts as nothing
        assert!(render_context_memory(None, Some(DEFAULT_SUMMARY), &[], &[]).is_none());
    }

    #[test]
    fn test_render_resource_reference() {
        let text = render_resource_reference(&[("design.md".into(), "abcd1234".into())]);
        assert!(text.contains("design.md [Resource-abcd1234]"));
    }
}
