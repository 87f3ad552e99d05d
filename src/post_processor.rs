//! Text post-processing for decoded output
//!
//! Whisper-class models loop under silence or noise ("ok ok ok ok …"), and
//! the local translator occasionally echoes n-gram patterns. Every decoded or
//! translated text runs through the same three-pass repetition cleaner before
//! leaving the engine.

/// Result of cleaning one decoded text
#[derive(Debug, Clone)]
pub struct CleanOutcome {
    pub text: String,
    /// Set when cleaning removed more than 30% of the raw text. The audio
    /// behind such output is untrustworthy and must not be revisited.
    pub hallucinated: bool,
}

/// Run the repetition cleaner and flag likely hallucinations.
pub fn clean_with_flag(raw: &str) -> CleanOutcome {
    let cleaned = clean_repetitions(raw);
    let hallucinated =
        !raw.trim().is_empty() && (cleaned.chars().count() as f32) < 0.7 * (raw.chars().count() as f32);
    CleanOutcome {
        text: cleaned,
        hallucinated,
    }
}

/// Three-pass repetition cleaner.
///
/// 1. Collapse runs of the same word to at most two occurrences.
/// 2. Collapse consecutive n-gram repeats (n = 2..=10), re-scanning until a
///    full sweep finds nothing.
/// 3. If one word dominates (>40% of >5 words), truncate at its fourth
///    occurrence.
///
/// All comparisons are case-insensitive. Idempotent: cleaning cleaned text is
/// a no-op.
pub fn clean_repetitions(text: &str) -> String {
    if text.len() < 5 {
        return text.to_string();
    }

    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() < 3 {
        return words.join(" ");
    }

    let words = collapse_singletons(&words);
    if words.len() < 4 {
        return words.join(" ");
    }

    let words = collapse_ngrams(words);
    if words.len() < 2 {
        return words.join(" ");
    }

    let words = trim_dominant_word(words);
    words.join(" ")
}

/// Pass 1: runs of the same word shrink to two occurrences
fn collapse_singletons<'a>(words: &[&'a str]) -> Vec<&'a str> {
    let mut out: Vec<&str> = Vec::with_capacity(words.len());
    let mut run_len = 0usize;

    for &word in words {
        match out.last() {
            Some(last) if eq_ci(last, word) => {
                run_len += 1;
                if run_len < 2 {
                    out.push(word);
                }
            }
            _ => {
                run_len = 0;
                out.push(word);
            }
        }
    }
    out
}

/// Pass 2: consecutive n-gram repeats keep a single copy
fn collapse_ngrams<'a>(mut words: Vec<&'a str>) -> Vec<&'a str> {
    let mut found = true;
    while found {
        found = false;
        let max_n = (words.len() / 2).min(10);
        for n in 2..=max_n {
            let mut out: Vec<&str> = Vec::with_capacity(words.len());
            let mut i = 0;
            while i < words.len() {
                if i + 2 * n <= words.len() && blocks_eq(&words[i..i + n], &words[i + n..i + 2 * n])
                {
                    // Keep one copy of the pattern and skip every further
                    // consecutive copy, including a truncated trailing copy
                    // ("work with humans and work with humans and work with
                    // humans" ends mid-pattern).
                    out.extend_from_slice(&words[i..i + n]);
                    let mut pos = i + n;
                    while pos + n <= words.len() && blocks_eq(&words[pos..pos + n], &words[i..i + n])
                    {
                        pos += n;
                    }
                    let tail = &words[pos..];
                    let partial_copy = !tail.is_empty()
                        && tail.len() < n
                        && blocks_eq(tail, &words[i..i + tail.len()]);
                    if !partial_copy {
                        out.extend_from_slice(tail);
                    }
                    found = true;
                    break;
                }
                out.push(words[i]);
                i += 1;
            }
            words = out;
            if found {
                break;
            }
        }
    }
    words
}

/// Pass 3: a word making up >40% of an output longer than five words marks a
/// loop; cut at its fourth occurrence.
fn trim_dominant_word<'a>(words: Vec<&'a str>) -> Vec<&'a str> {
    let total = words.len();
    if total <= 5 {
        return words;
    }

    let mut counts: std::collections::HashMap<String, usize> = std::collections::HashMap::new();
    for &word in &words {
        *counts.entry(word.to_lowercase()).or_insert(0) += 1;
    }

    let Some((dominant, count)) = counts.into_iter().max_by_key(|&(_, c)| c) else {
        return words;
    };
    if (count as f32) <= total as f32 * 0.4 {
        return words;
    }

    tracing::debug!(
        "Dominant word '{}' ({}/{} occurrences), trimming output",
        dominant,
        count,
        total
    );

    let mut out: Vec<&str> = Vec::new();
    let mut seen = 0usize;
    for &word in &words {
        if word.to_lowercase() == dominant {
            seen += 1;
        }
        if seen > 3 {
            break;
        }
        out.push(word);
    }
    out
}

/// Cap the word count at `max(5, ceil(duration_secs * 5.0))`. Five words per
/// second is generous for natural speech at any rate; anything past that is
/// decoder runaway.
pub fn enforce_word_limit(text: &str, audio_duration_secs: f32) -> String {
    let limit = ((audio_duration_secs * 5.0).ceil() as usize).max(5);
    let words: Vec<&str> = text.split_whitespace().collect();
    if words.len() <= limit {
        return text.to_string();
    }

    tracing::debug!(
        "Trimming {} words to {} for {:.2}s of audio",
        words.len(),
        limit,
        audio_duration_secs
    );
    words[..limit].join(" ")
}

fn eq_ci(a: &str, b: &str) -> bool {
    a.to_lowercase() == b.to_lowercase()
}

fn blocks_eq(a: &[&str], b: &[&str]) -> bool {
    a.len() == b.len() && a.iter().zip(b).all(|(x, y)| eq_ci(x, y))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn singleton_collapse_keeps_two() {
        assert_eq!(
            clean_repetitions("positive positive positive positive"),
            "positive positive"
        );
    }

    #[test]
    fn singleton_collapse_case_insensitive() {
        assert_eq!(clean_repetitions("Ok ok OK ok again"), "Ok ok again");
    }

    #[test]
    fn ngram_collapse() {
        assert_eq!(
            clean_repetitions("work with humans and work with humans and work with humans"),
            "work with humans and"
        );
    }

    #[test]
    fn ngram_collapse_drops_truncated_trailing_copy() {
        assert_eq!(clean_repetitions("one two one two one"), "one two");
    }

    #[test]
    fn ngram_collapse_with_tail() {
        assert_eq!(
            clean_repetitions("I think so I think so but maybe not"),
            "I think so but maybe not"
        );
    }

    #[test]
    fn dominant_word_trimmed_at_fourth() {
        // "ok" dominates after the singleton pass leaves alternating words
        let cleaned = clean_repetitions("ok yes ok no ok maybe ok sure ok fine");
        let ok_count = cleaned
            .split_whitespace()
            .filter(|w| w.eq_ignore_ascii_case("ok"))
            .count();
        assert!(ok_count <= 3, "got {:?}", cleaned);
        assert_eq!(cleaned, "ok yes ok no ok maybe");
    }

    #[test]
    fn clean_is_idempotent() {
        let inputs = [
            "positive positive positive positive",
            "work with humans and work with humans and work with humans",
            "ok yes ok no ok maybe ok sure ok fine",
            "a normal sentence with no repeats at all",
            "one two one two one two three",
            "",
            "hi",
        ];
        for input in inputs {
            let once = clean_repetitions(input);
            let twice = clean_repetitions(&once);
            assert_eq!(once, twice, "not idempotent for {:?}", input);
        }
    }

    #[test]
    fn untouched_text_passes_through() {
        let text = "the quick brown fox jumps over the lazy dog";
        assert_eq!(clean_repetitions(text), text);
    }

    #[test]
    fn hallucination_flag() {
        let raw = "ok ok ok ok ok ok ok ok ok ok";
        let outcome = clean_with_flag(raw);
        assert!(outcome.hallucinated);
        assert_eq!(outcome.text, "ok ok");

        let outcome = clean_with_flag("a perfectly ordinary sentence");
        assert!(!outcome.hallucinated);
    }

    #[test]
    fn word_limit_exact() {
        let text = (0..100).map(|i| format!("w{}", i)).collect::<Vec<_>>().join(" ");
        for duration in [0.2f32, 1.0, 2.5, 10.0] {
            let limited = enforce_word_limit(&text, duration);
            let expected = ((duration * 5.0).ceil() as usize).max(5);
            assert_eq!(limited.split_whitespace().count(), expected);
        }
    }

    #[test]
    fn word_limit_no_op_for_short_text() {
        assert_eq!(enforce_word_limit("hello world", 0.5), "hello world");
    }
}
