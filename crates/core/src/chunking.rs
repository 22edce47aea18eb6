use crate::error::IndexError;
use crate::models::Chunk;
use regex::Regex;
use sha2::{Digest, Sha256};
use std::sync::OnceLock;

/// How raw document text is cut into chunks. Sizes are in characters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkingStrategy {
    Fixed {
        chunk_size: usize,
    },
    Overlap {
        chunk_size: usize,
        overlap: usize,
    },
    NaturalBreak {
        chunk_size: usize,
    },
    SentenceOverlap {
        chunk_size: usize,
        sentences_to_overlap: usize,
    },
}

impl Default for ChunkingStrategy {
    fn default() -> Self {
        Self::Overlap {
            chunk_size: 512,
            overlap: 32,
        }
    }
}

impl ChunkingStrategy {
    pub fn fixed() -> Self {
        Self::Fixed { chunk_size: 512 }
    }

    pub fn natural_break() -> Self {
        Self::NaturalBreak { chunk_size: 256 }
    }

    pub fn sentence_overlap() -> Self {
        Self::SentenceOverlap {
            chunk_size: 256,
            sentences_to_overlap: 1,
        }
    }

    pub fn validate(&self) -> Result<(), IndexError> {
        let chunk_size = match *self {
            Self::Fixed { chunk_size }
            | Self::NaturalBreak { chunk_size }
            | Self::SentenceOverlap { chunk_size, .. } => chunk_size,
            Self::Overlap {
                chunk_size,
                overlap,
            } => {
                if overlap == 0 {
                    return Err(IndexError::InvalidChunkConfig(
                        "overlap must be greater than 0".to_string(),
                    ));
                }
                if chunk_size <= overlap {
                    return Err(IndexError::InvalidChunkConfig(format!(
                        "chunk size {chunk_size} must be greater than overlap {overlap}"
                    )));
                }
                chunk_size
            }
        };

        if chunk_size == 0 {
            return Err(IndexError::InvalidChunkConfig(
                "chunk size must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn split(&self, text: &str) -> Result<Vec<String>, IndexError> {
        self.validate()?;

        let pieces = match *self {
            Self::Fixed { chunk_size } => char_windows(text, chunk_size, chunk_size),
            Self::Overlap {
                chunk_size,
                overlap,
            } => char_windows(text, chunk_size, chunk_size - overlap),
            Self::NaturalBreak { chunk_size } => pack_sentences(text, chunk_size),
            Self::SentenceOverlap {
                chunk_size,
                sentences_to_overlap,
            } => sentence_windows(text, chunk_size, sentences_to_overlap),
        };

        Ok(pieces)
    }
}

pub fn clean_text(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn char_windows(text: &str, size: usize, step: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let mut windows = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let end = (start + size).min(chars.len());
        let piece = clean_text(&chars[start..end].iter().collect::<String>());
        if !piece.is_empty() {
            windows.push(piece);
        }
        start += step;
    }

    windows
}

fn sentence_boundary() -> &'static Regex {
    static BOUNDARY: OnceLock<Regex> = OnceLock::new();
    BOUNDARY.get_or_init(|| Regex::new(r"[.!?]\s+").expect("sentence boundary pattern is valid"))
}

pub fn split_sentences(text: &str) -> Vec<String> {
    let mut sentences = Vec::new();
    let mut last = 0;

    for boundary in sentence_boundary().find_iter(text) {
        // keep the terminating punctuation with its sentence
        let sentence = clean_text(&text[last..boundary.start() + 1]);
        if !sentence.is_empty() {
            sentences.push(sentence);
        }
        last = boundary.end();
    }

    let tail = clean_text(&text[last..]);
    if !tail.is_empty() {
        sentences.push(tail);
    }

    sentences
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

fn pack_sentences(text: &str, chunk_size: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();

    for sentence in split_sentences(text) {
        if current.is_empty() {
            current = sentence;
            continue;
        }

        if char_len(&current) + 1 + char_len(&sentence) > chunk_size {
            chunks.push(std::mem::replace(&mut current, sentence));
        } else {
            current.push(' ');
            current.push_str(&sentence);
        }
    }

    if !current.is_empty() {
        chunks.push(current);
    }

    chunks
}

fn sentence_windows(text: &str, chunk_size: usize, sentences_to_overlap: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current: Vec<String> = Vec::new();

    for sentence in split_sentences(text) {
        current.push(sentence);
        let joined = current.join(" ");
        if char_len(&joined) >= chunk_size {
            chunks.push(joined);
            if sentences_to_overlap > 0 && sentences_to_overlap < current.len() {
                current.drain(..current.len() - sentences_to_overlap);
            } else {
                current.clear();
            }
        }
    }

    if !current.is_empty() {
        chunks.push(current.join(" "));
    }

    chunks
}

/// Splits `text` and assigns positions starting at `first_position`.
pub fn build_chunks(
    source: &str,
    text: &str,
    strategy: &ChunkingStrategy,
    first_position: usize,
) -> Result<Vec<Chunk>, IndexError> {
    let chunks = strategy
        .split(text)?
        .into_iter()
        .enumerate()
        .map(|(offset, piece)| {
            let position = first_position + offset;
            Chunk {
                chunk_id: make_chunk_id(source, position, &piece),
                source: source.to_string(),
                position,
                text: piece,
            }
        })
        .collect();

    Ok(chunks)
}

fn make_chunk_id(source: &str, position: usize, text: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update((position as u64).to_le_bytes());
    hasher.update(text.as_bytes());
    format!("{:x}", hasher.finalize())
}
