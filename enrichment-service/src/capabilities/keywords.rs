//! Frequency-based keyword tagging.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet};

use super::{TagExtractor, dedupe_tags, truncate_chars};
use crate::error::CapabilityError;

/// Tokens shorter than this are never tags
const MIN_WORD_CHARS: usize = 3;

/// Body text contributes only its opening when combined with summary and captions
const TEXT_SNIPPET_CHARS: usize = 1000;

const STOPWORDS: &[&str] = &[
    // English
    "the", "and", "or", "but", "for", "with", "from", "to", "in", "on", "at", "by", "of", "is",
    "are", "was", "were", "been", "have", "has", "had", "this", "that", "these", "those", "not",
    "you", "your", "they", "their", "them", "will", "would", "can", "could", "there", "which",
    "what", "when", "where", "who", "into", "about", "also", "than", "then", "its", "our",
    // Turkish
    "ve", "veya", "ile", "ama", "fakat", "ancak", "bir", "bu", "şu", "için", "gibi", "kadar",
    "daha", "en", "çok", "da", "de", "mi", "mı", "mu", "mü", "ki", "ne", "nasıl", "neden", "olan",
    "olarak", "üzere", "sonra", "önce", "arasında", "karşı",
];

/// Ranks words by frequency across summary, captions and the opening of the
/// text, ignoring stopwords. Ties keep first-occurrence order.
pub struct KeywordTagger {
    stopwords: HashSet<String>,
}

impl KeywordTagger {
    pub fn new() -> Self {
        Self {
            stopwords: STOPWORDS.iter().map(|w| w.to_string()).collect(),
        }
    }

    fn rank(&self, combined: &str, top_n: usize) -> Vec<String> {
        let lowered = combined.to_lowercase();
        let mut counts: HashMap<&str, (usize, usize)> = HashMap::new();

        let words = lowered
            .split(|c: char| !(c.is_alphanumeric() || c == '_'))
            .filter(|w| w.chars().count() >= MIN_WORD_CHARS)
            .filter(|w| !self.stopwords.contains(*w));

        for (position, word) in words.enumerate() {
            let entry = counts.entry(word).or_insert((0, position));
            entry.0 += 1;
        }

        let mut ranked: Vec<(&str, usize, usize)> = counts
            .into_iter()
            .map(|(word, (count, first))| (word, count, first))
            .collect();
        ranked.sort_by(|a, b| b.1.cmp(&a.1).then(a.2.cmp(&b.2)));

        dedupe_tags(ranked.into_iter().map(|(word, _, _)| word.to_string()), top_n)
    }
}

impl Default for KeywordTagger {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TagExtractor for KeywordTagger {
    async fn extract_tags(
        &self,
        text: &str,
        summary: &str,
        captions: &[String],
        top_n: usize,
    ) -> Result<Vec<String>, CapabilityError> {
        let mut parts: Vec<&str> = Vec::new();
        if !summary.is_empty() {
            parts.push(summary);
        }
        parts.extend(captions.iter().map(String::as_str));
        if !text.is_empty() {
            parts.push(truncate_chars(text, TEXT_SNIPPET_CHARS));
        }

        Ok(self.rank(&parts.join(" "), top_n))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_frequency_ranking_skips_stopwords_and_short_words() {
        let tagger = KeywordTagger::new();
        let tags = tagger
            .extract_tags(
                "The cat and the dog. A cat is on the mat with another cat and a dog.",
                "",
                &[],
                3,
            )
            .await
            .unwrap();

        assert_eq!(tags, vec!["cat", "dog", "mat"]);
    }

    #[tokio::test]
    async fn test_captions_and_summary_contribute() {
        let tagger = KeywordTagger::new();
        let tags = tagger
            .extract_tags("", "Sunset over harbor", &["harbor boats".to_string()], 10)
            .await
            .unwrap();

        assert_eq!(tags, vec!["harbor", "sunset", "over", "boats"]);
    }

    #[tokio::test]
    async fn test_empty_input_yields_no_tags() {
        let tags = KeywordTagger::new()
            .extract_tags("", "", &[], 10)
            .await
            .unwrap();
        assert!(tags.is_empty());
    }
}
