use crate::config::FilterConfig;
use crate::types::RawCandidate;
use chrono::{Duration, Utc};
use tracing::debug;

/// Why a candidate was turned away before persistence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterVerdict {
    Accept,
    /// No primary-topic keyword matched.
    NoPrimaryMatch,
    /// Primary matched but no audience-domain keyword did.
    NoSecondaryMatch,
    TooShort,
    TooOld,
    Spam,
}

/// Counters for one filtering pass.
#[derive(Debug, Clone, Copy, Default)]
pub struct FilterStats {
    pub accepted: usize,
    pub no_primary: usize,
    pub no_secondary: usize,
    pub too_short: usize,
    pub too_old: usize,
    pub spam: usize,
}

impl FilterStats {
    pub fn record(&mut self, verdict: FilterVerdict) {
        match verdict {
            FilterVerdict::Accept => self.accepted += 1,
            FilterVerdict::NoPrimaryMatch => self.no_primary += 1,
            FilterVerdict::NoSecondaryMatch => self.no_secondary += 1,
            FilterVerdict::TooShort => self.too_short += 1,
            FilterVerdict::TooOld => self.too_old += 1,
            FilterVerdict::Spam => self.spam += 1,
        }
    }

    pub fn rejected(&self) -> usize {
        self.no_primary + self.no_secondary + self.too_short + self.too_old + self.spam
    }
}

/// Keyword-conjunction relevance filter with quality gates. A candidate
/// passes only when at least one primary AND at least one secondary
/// keyword match its title or body.
pub struct RelevanceFilter {
    config: FilterConfig,
}

impl RelevanceFilter {
    pub fn new(config: FilterConfig) -> Self {
        Self { config }
    }

    pub fn classify(&self, candidate: &RawCandidate) -> FilterVerdict {
        let text = format!(
            "{} {}",
            candidate.title.to_lowercase(),
            candidate.body.to_lowercase()
        );

        if self
            .config
            .spam_markers
            .iter()
            .any(|m| text.contains(m.as_str()))
        {
            return FilterVerdict::Spam;
        }

        if candidate.body.chars().count() < self.config.min_content_length {
            return FilterVerdict::TooShort;
        }

        // Items without a published date pass the age gate.
        if let Some(published) = candidate.published_at {
            let cutoff = Utc::now() - Duration::hours(self.config.max_age_hours);
            if published < cutoff {
                return FilterVerdict::TooOld;
            }
        }

        if !any_keyword_matches(&text, &self.config.primary_keywords) {
            return FilterVerdict::NoPrimaryMatch;
        }
        if !any_keyword_matches(&text, &self.config.secondary_keywords) {
            return FilterVerdict::NoSecondaryMatch;
        }

        FilterVerdict::Accept
    }

    pub fn is_relevant(&self, candidate: &RawCandidate) -> bool {
        let verdict = self.classify(candidate);
        if verdict != FilterVerdict::Accept {
            debug!("Filtered out '{}': {:?}", candidate.title, verdict);
        }
        verdict == FilterVerdict::Accept
    }
}

/// Multi-word keywords match as substrings; single words match whole
/// tokens (with a prefix allowance for plural/inflected forms). Short
/// keywords like "ai" require an exact token so they never fire inside
/// unrelated words ("air", "said").
fn any_keyword_matches(text: &str, keywords: &[String]) -> bool {
    let tokens: Vec<&str> = text
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .collect();

    keywords.iter().any(|kw| {
        if kw.contains(' ') {
            text.contains(kw.as_str())
        } else if kw.len() < 4 {
            tokens.iter().any(|t| *t == kw.as_str())
        } else {
            tokens
                .iter()
                .any(|t| t.starts_with(kw.as_str()) && t.len() <= kw.len() + 2)
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn candidate(title: &str, body: &str) -> RawCandidate {
        RawCandidate {
            dedup_key: format!("https://example.com/{}", title.len()),
            title: title.to_string(),
            body: body.to_string(),
            source_name: "test".to_string(),
            published_at: Some(Utc::now()),
            fetched_at: Utc::now(),
        }
    }

    fn filler(topic_line: &str) -> String {
        // Pads past the minimum-length gate without adding keywords.
        format!("{} {}", topic_line, "x".repeat(400))
    }

    #[test]
    fn primary_only_is_rejected() {
        let f = RelevanceFilter::new(FilterConfig::default());
        let c = candidate(
            "New protein-folding model released",
            &filler("Researchers describe the system in a preprint."),
        );
        assert_eq!(f.classify(&c), FilterVerdict::NoSecondaryMatch);
    }

    #[test]
    fn primary_and_secondary_is_accepted() {
        let f = RelevanceFilter::new(FilterConfig::default());
        let c = candidate(
            "Court rules on AI-generated evidence admissibility",
            &filler("The ruling addresses machine learning systems in litigation."),
        );
        assert_eq!(f.classify(&c), FilterVerdict::Accept);
    }

    #[test]
    fn secondary_only_is_rejected() {
        let f = RelevanceFilter::new(FilterConfig::default());
        let c = candidate(
            "Court backlog grows in commercial litigation",
            &filler("Judges warn of contract dispute delays."),
        );
        assert_eq!(f.classify(&c), FilterVerdict::NoPrimaryMatch);
    }

    #[test]
    fn short_keyword_does_not_fire_inside_words() {
        let f = RelevanceFilter::new(FilterConfig::default());
        // "said", "air", "train" must not satisfy the "ai" keyword.
        let c = candidate(
            "Court said air train regulation holds",
            &filler("The judge said the air train contract stands."),
        );
        assert_eq!(f.classify(&c), FilterVerdict::NoPrimaryMatch);
    }

    #[test]
    fn quality_gates_precede_keywords() {
        let f = RelevanceFilter::new(FilterConfig::default());

        let short = candidate("AI court ruling", "too short");
        assert_eq!(f.classify(&short), FilterVerdict::TooShort);

        let mut old = candidate(
            "Court rules on AI evidence",
            &filler("Machine learning in litigation."),
        );
        old.published_at = Some(Utc::now() - chrono::Duration::hours(100));
        assert_eq!(f.classify(&old), FilterVerdict::TooOld);

        let spam = candidate(
            "AI court ruling: limited time offer",
            &filler("Buy now! Machine learning litigation bargains."),
        );
        assert_eq!(f.classify(&spam), FilterVerdict::Spam);
    }

    #[test]
    fn undated_items_pass_the_age_gate() {
        let f = RelevanceFilter::new(FilterConfig::default());
        let mut c = candidate(
            "Court rules on AI evidence",
            &filler("Machine learning in litigation."),
        );
        c.published_at = None;
        assert_eq!(f.classify(&c), FilterVerdict::Accept);
    }

    #[test]
    fn stats_tally_verdicts() {
        let mut stats = FilterStats::default();
        stats.record(FilterVerdict::Accept);
        stats.record(FilterVerdict::NoSecondaryMatch);
        stats.record(FilterVerdict::Spam);
        assert_eq!(stats.accepted, 1);
        assert_eq!(stats.rejected(), 2);
    }
}
