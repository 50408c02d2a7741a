//! Extractive summaries built from the opening of the text.

use async_trait::async_trait;

use super::{Summarizer, truncate_chars};
use crate::error::CapabilityError;

/// Summarizes by keeping the leading sentences, up to `max_chars`
pub struct LeadSummarizer {
    max_chars: usize,
    max_input_chars: usize,
}

impl LeadSummarizer {
    pub fn new(max_chars: usize, max_input_chars: usize) -> Self {
        Self {
            max_chars,
            max_input_chars,
        }
    }

    fn lead(&self, text: &str) -> String {
        let text = truncate_chars(text.trim(), self.max_input_chars);
        let collapsed = text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        if collapsed.chars().count() <= self.max_chars {
            return collapsed;
        }

        let head = truncate_chars(&collapsed, self.max_chars);

        // Prefer ending on a sentence, as long as that keeps at least half
        let sentence_end = head
            .char_indices()
            .filter(|(_, c)| matches!(c, '.' | '!' | '?'))
            .map(|(idx, c)| idx + c.len_utf8())
            .last()
            .filter(|end| *end >= head.len() / 2);

        match sentence_end {
            Some(end) => head[..end].to_string(),
            None => match head.rfind(char::is_whitespace) {
                Some(idx) if idx > 0 => head[..idx].trim_end().to_string(),
                _ => head.to_string(),
            },
        }
    }
}

#[async_trait]
impl Summarizer for LeadSummarizer {
    async fn summarize(&self, text: &str) -> Result<String, CapabilityError> {
        if text.trim().is_empty() {
            return Ok(String::new());
        }
        Ok(self.lead(text))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_short_text_is_kept_whole() {
        let summarizer = LeadSummarizer::new(100, 15000);
        assert_eq!(
            summarizer.summarize("One line.\n\nTwo lines.").await.unwrap(),
            "One line. Two lines."
        );
        assert_eq!(summarizer.summarize("   ").await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_long_text_ends_on_sentence() {
        let summarizer = LeadSummarizer::new(30, 15000);
        let summary = summarizer
            .summarize("The first sentence. The second sentence runs long.")
            .await
            .unwrap();
        assert_eq!(summary, "The first sentence.");
    }

    #[tokio::test]
    async fn test_long_text_without_sentences_ends_on_word() {
        let summarizer = LeadSummarizer::new(12, 15000);
        let summary = summarizer
            .summarize("alpha beta gamma delta")
            .await
            .unwrap();
        assert_eq!(summary, "alpha beta");
    }
}
