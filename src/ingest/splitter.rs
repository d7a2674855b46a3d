use std::collections::VecDeque;

use crate::models::SourceDocument;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Recursive character splitter measured in chars.
#[derive(Debug, Clone, Copy)]
pub struct TextSplitter {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

impl Default for TextSplitter {
    fn default() -> Self {
        Self {
            chunk_size: 500,
            chunk_overlap: 20,
        }
    }
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        let chunk_size = chunk_size.max(1);
        Self {
            chunk_size,
            chunk_overlap: chunk_overlap.min(chunk_size.saturating_sub(1)),
        }
    }

    /// Every chunk carries a copy of its page's metadata.
    pub fn split_documents(&self, documents: &[SourceDocument]) -> Vec<SourceDocument> {
        documents
            .iter()
            .flat_map(|document| {
                self.split_text(&document.page_content)
                    .into_iter()
                    .map(|chunk| SourceDocument {
                        page_content: chunk,
                        metadata: document.metadata.clone(),
                    })
            })
            .collect()
    }

    pub fn split_text(&self, text: &str) -> Vec<String> {
        self.split_with(text, &SEPARATORS)
    }

    fn split_with(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let position = separators
            .iter()
            .position(|sep| sep.is_empty() || text.contains(sep))
            .unwrap_or(separators.len().saturating_sub(1));
        let separator = separators.get(position).copied().unwrap_or("");
        let remaining = separators.get(position + 1..).unwrap_or(&[]);

        let splits: Vec<String> = if separator.is_empty() {
            text.chars().map(String::from).collect()
        } else {
            text.split(separator)
                .filter(|piece| !piece.is_empty())
                .map(str::to_string)
                .collect()
        };

        let mut chunks = Vec::new();
        let mut fitting: Vec<String> = Vec::new();

        for piece in splits {
            if char_len(&piece) < self.chunk_size {
                fitting.push(piece);
                continue;
            }

            if !fitting.is_empty() {
                chunks.extend(self.merge(&fitting, separator));
                fitting.clear();
            }

            if remaining.is_empty() {
                chunks.push(piece);
            } else {
                chunks.extend(self.split_with(&piece, remaining));
            }
        }

        if !fitting.is_empty() {
            chunks.extend(self.merge(&fitting, separator));
        }

        chunks
    }

    /// Greedily packs pieces into windows, carrying up to `chunk_overlap` chars forward.
    fn merge(&self, pieces: &[String], separator: &str) -> Vec<String> {
        let separator_len = char_len(separator);
        let mut out = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(piece);

            if !window.is_empty() && total + separator_len + len > self.chunk_size {
                push_joined(&mut out, &window, separator);

                while let Some(first) = window.front() {
                    let fits = total + separator_len + len <= self.chunk_size;
                    if total <= self.chunk_overlap && fits {
                        break;
                    }
                    let joiner = if window.len() > 1 { separator_len } else { 0 };
                    total -= char_len(first) + joiner;
                    window.pop_front();
                }
            }

            if !window.is_empty() {
                total += separator_len;
            }
            total += len;
            window.push_back(piece);
        }

        push_joined(&mut out, &window, separator);
        out
    }
}

fn push_joined(out: &mut Vec<String>, window: &VecDeque<&str>, separator: &str) {
    let joined = window.iter().copied().collect::<Vec<_>>().join(separator);
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
