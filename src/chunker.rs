//! Token-accurate text chunking.
//!
//! Splits on paragraphs (blank lines), then sentences, and greedily packs
//! sentences into chunks of at most `chunk_size` tokens. When a chunk
//! closes, the trailing `overlap` tokens (ending at a sentence boundary)
//! seed the next chunk so retrieval never loses context at a cut. Token
//! counts use the cl100k_base encoding matched to the embedding model.

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tiktoken_rs::{cl100k_base, CoreBPE};

static ENCODER: Lazy<CoreBPE> = Lazy::new(|| cl100k_base().expect("cl100k_base tokenizer"));

static PARAGRAPH_SPLIT: Lazy<Regex> = Lazy::new(|| Regex::new(r"\n\s*\n").unwrap());
static SENTENCE_BOUNDARY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)(.*?[.!?])(\s+|$)").unwrap());

pub fn count_tokens(text: &str) -> usize {
    ENCODER.encode_ordinary(text).len()
}

#[derive(Debug, Clone, PartialEq)]
pub struct Chunk {
    pub text: String,
    pub index: usize,
    pub token_count: usize,
    pub paragraph_index: usize,
    pub metadata: Value,
}

#[derive(Debug, Clone)]
pub struct Chunker {
    chunk_size: usize,
    overlap: usize,
}

impl Chunker {
    /// `overlap` must be strictly smaller than `chunk_size`; both in tokens.
    pub fn new(chunk_size: usize, overlap: usize) -> anyhow::Result<Self> {
        if chunk_size == 0 {
            anyhow::bail!("chunk_size must be positive");
        }
        if overlap >= chunk_size {
            anyhow::bail!("overlap must be smaller than chunk_size");
        }
        Ok(Self {
            chunk_size,
            overlap,
        })
    }

    pub fn chunk(&self, text: &str, metadata: &Value) -> Vec<Chunk> {
        let mut chunks = Vec::new();
        if text.trim().is_empty() {
            return chunks;
        }

        // Carried into the next chunk as its prefix.
        let mut overlap_sentences: Vec<String> = Vec::new();
        let mut current: Vec<String> = Vec::new();
        let mut current_tokens = 0usize;
        let mut current_paragraph = 0usize;

        let mut close_chunk = |current: &mut Vec<String>,
                               current_tokens: &mut usize,
                               overlap_sentences: &mut Vec<String>,
                               paragraph: usize,
                               chunks: &mut Vec<Chunk>| {
            if current.is_empty() {
                return;
            }
            let text = current.join(" ");
            let token_count = count_tokens(&text);
            chunks.push(Chunk {
                text,
                index: chunks.len(),
                token_count,
                paragraph_index: paragraph,
                metadata: metadata.clone(),
            });

            // Collect trailing sentences up to the overlap budget, keeping
            // sentence boundaries intact.
            overlap_sentences.clear();
            let mut budget = self.overlap;
            for sentence in current.iter().rev() {
                let tokens = count_tokens(sentence);
                if tokens > budget {
                    break;
                }
                budget -= tokens;
                overlap_sentences.insert(0, sentence.clone());
            }
            current.clear();
            *current_tokens = 0;
        };

        for (paragraph_index, paragraph) in PARAGRAPH_SPLIT
            .split(text)
            .filter(|p| !p.trim().is_empty())
            .enumerate()
        {
            for sentence in split_sentences(paragraph) {
                let sentence_tokens = count_tokens(&sentence);

                // A single sentence that cannot fit in any chunk is split on
                // raw token boundaries rather than dropped.
                if sentence_tokens > self.chunk_size {
                    close_chunk(
                        &mut current,
                        &mut current_tokens,
                        &mut overlap_sentences,
                        current_paragraph,
                        &mut chunks,
                    );
                    for piece in hard_split(&sentence, self.chunk_size) {
                        let token_count = count_tokens(&piece);
                        chunks.push(Chunk {
                            text: piece,
                            index: chunks.len(),
                            token_count,
                            paragraph_index,
                            metadata: metadata.clone(),
                        });
                    }
                    overlap_sentences.clear();
                    continue;
                }

                if current.is_empty() && !overlap_sentences.is_empty() {
                    carry_overlap(
                        &mut overlap_sentences,
                        &mut current,
                        &mut current_tokens,
                        sentence_tokens,
                        self.chunk_size,
                    );
                }

                if current_tokens + sentence_tokens > self.chunk_size && !current.is_empty() {
                    close_chunk(
                        &mut current,
                        &mut current_tokens,
                        &mut overlap_sentences,
                        current_paragraph,
                        &mut chunks,
                    );
                    carry_overlap(
                        &mut overlap_sentences,
                        &mut current,
                        &mut current_tokens,
                        sentence_tokens,
                        self.chunk_size,
                    );
                }

                current_paragraph = paragraph_index;
                current_tokens += sentence_tokens;
                current.push(sentence);
            }
        }

        close_chunk(
            &mut current,
            &mut current_tokens,
            &mut overlap_sentences,
            current_paragraph,
            &mut chunks,
        );

        chunks
    }
}

/// Moves carried overlap sentences into the new chunk, but only as many as
/// still leave room for the sentence about to be appended.
fn carry_overlap(
    overlap_sentences: &mut Vec<String>,
    current: &mut Vec<String>,
    current_tokens: &mut usize,
    upcoming_tokens: usize,
    chunk_size: usize,
) {
    let budget = chunk_size.saturating_sub(upcoming_tokens);
    let mut carried_tokens = 0usize;
    let mut kept = Vec::new();
    for sentence in overlap_sentences.drain(..).rev() {
        let tokens = count_tokens(&sentence);
        if carried_tokens + tokens > budget {
            break;
        }
        carried_tokens += tokens;
        kept.insert(0, sentence);
    }
    for sentence in kept {
        *current_tokens += count_tokens(&sentence);
        current.push(sentence);
    }
}

fn split_sentences(paragraph: &str) -> Vec<String> {
    let trimmed = paragraph.trim();
    if trimmed.is_empty() {
        return Vec::new();
    }

    let mut sentences = Vec::new();
    let mut consumed = 0;
    for capture in SENTENCE_BOUNDARY.captures_iter(trimmed) {
        let sentence = capture.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if !sentence.is_empty() {
            sentences.push(sentence.to_string());
        }
        consumed = capture.get(0).map(|m| m.end()).unwrap_or(consumed);
    }

    // Trailing text without terminal punctuation is still a sentence.
    let rest = trimmed[consumed..].trim();
    if !rest.is_empty() {
        sentences.push(rest.to_string());
    }
    sentences
}

/// Token-boundary split for sentences longer than a whole chunk.
fn hard_split(sentence: &str, chunk_size: usize) -> Vec<String> {
    let tokens = ENCODER.encode_ordinary(sentence);
    tokens
        .chunks(chunk_size)
        .filter_map(|window| ENCODER.decode(window.to_vec()).ok())
        .map(|piece| piece.trim().to_string())
        .filter(|piece| !piece.is_empty())
        .collect()
}
