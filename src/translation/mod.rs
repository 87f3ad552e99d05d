//! Translation backends and routing
//!
//! Two implementations sit behind the router: a stateless HTTP client against
//! a public translation endpoint, and a local Marian-class model running on
//! CTranslate2. The router owns failover between them.

pub mod local;
pub mod online;
pub mod router;

use std::fmt;

pub use router::TranslationRouter;

/// Which backend produced a translation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendKind {
    Online,
    Local,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Online => write!(f, "online"),
            BackendKind::Local => write!(f, "local"),
        }
    }
}

/// One translation request, spawned per non-empty final transcript
#[derive(Debug, Clone)]
pub struct TranslationJob {
    pub text: String,
    pub source_lang: String,
    pub target_lang: String,
    /// Entry id of the final segment this job belongs to
    pub entry_id: Option<u64>,
}

/// Translation result. `translated_text` is empty when every backend failed;
/// the pipeline then suppresses the translation branch of that message.
#[derive(Debug, Clone)]
pub struct TranslationOutcome {
    pub source_text: String,
    pub translated_text: String,
    pub backend: Option<BackendKind>,
    pub entry_id: Option<u64>,
}

/// Split text into sentence-sized pieces for better MT quality: sentence
/// boundaries first, then commas for anything still over `max_length`.
pub fn split_sentences(text: &str, max_length: usize) -> Vec<String> {
    if text.len() <= max_length {
        return vec![text.to_string()];
    }

    let parts = split_keeping_delimiters(text, &['.', '!', '?', ';']);

    let mut sentences: Vec<String> = Vec::new();
    let mut current = String::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        if !current.is_empty() && current.len() + part.len() + 1 > max_length {
            sentences.push(std::mem::take(&mut current));
            current = part.to_string();
        } else if current.is_empty() {
            current = part.to_string();
        } else {
            current.push(' ');
            current.push_str(part);
        }
    }
    if !current.is_empty() {
        sentences.push(current);
    }

    // Comma fallback for run-on sentences
    let mut final_pieces: Vec<String> = Vec::new();
    for sentence in sentences {
        if sentence.len() <= max_length {
            final_pieces.push(sentence);
            continue;
        }
        let mut chunk = String::new();
        for piece in sentence.split(',') {
            let piece = piece.trim();
            if piece.is_empty() {
                continue;
            }
            if !chunk.is_empty() && chunk.len() + piece.len() + 2 > max_length {
                final_pieces.push(std::mem::take(&mut chunk));
                chunk = piece.to_string();
            } else if chunk.is_empty() {
                chunk = piece.to_string();
            } else {
                chunk.push_str(", ");
                chunk.push_str(piece);
            }
        }
        if !chunk.is_empty() {
            final_pieces.push(chunk);
        }
    }

    if final_pieces.is_empty() {
        vec![text.to_string()]
    } else {
        final_pieces
    }
}

/// Recombine split sentences into requests of at most `max_request` chars,
/// joined with single spaces.
pub fn combine_requests(sentences: &[String], max_request: usize) -> Vec<String> {
    let mut requests: Vec<String> = Vec::new();
    let mut current = String::new();

    for sentence in sentences {
        if sentence.is_empty() {
            continue;
        }
        if !current.is_empty() && current.len() + sentence.len() + 1 > max_request {
            requests.push(std::mem::take(&mut current));
            current = sentence.clone();
        } else if current.is_empty() {
            current = sentence.clone();
        } else {
            current.push(' ');
            current.push_str(sentence);
        }
    }
    if !current.is_empty() {
        requests.push(current);
    }
    requests
}

/// Split on delimiters, keeping each delimiter attached to its sentence
fn split_keeping_delimiters(text: &str, delimiters: &[char]) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    for c in text.chars() {
        current.push(c);
        if delimiters.contains(&c) {
            parts.push(std::mem::take(&mut current));
        }
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_untouched() {
        assert_eq!(split_sentences("hello there", 200), vec!["hello there"]);
    }

    #[test]
    fn splits_on_sentence_boundaries() {
        let text = "a".repeat(150) + ". " + &"b".repeat(150) + "!";
        let pieces = split_sentences(&text, 200);
        assert_eq!(pieces.len(), 2);
        assert!(pieces[0].ends_with('.'));
        assert!(pieces[1].ends_with('!'));
        assert!(pieces.iter().all(|p| p.len() <= 200));
    }

    #[test]
    fn falls_back_to_commas() {
        let text = format!("{}, {}, {}", "x".repeat(90), "y".repeat(90), "z".repeat(90));
        let pieces = split_sentences(&text, 200);
        assert!(pieces.len() >= 2);
        assert!(pieces.iter().all(|p| p.len() <= 200));
    }

    #[test]
    fn combine_respects_request_cap() {
        let sentences: Vec<String> = (0..6).map(|_| "s".repeat(120)).collect();
        let requests = combine_requests(&sentences, 300);
        assert!(requests.iter().all(|r| r.len() <= 300));
        // Two 120-char sentences fit per request
        assert_eq!(requests.len(), 3);
    }

    #[test]
    fn combine_joins_with_single_spaces() {
        let sentences = vec!["one.".to_string(), "two.".to_string()];
        let requests = combine_requests(&sentences, 300);
        assert_eq!(requests, vec!["one. two."]);
    }
}
