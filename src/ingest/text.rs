use std::collections::VecDeque;

use anyhow::Result;
use regex::Regex;

use crate::models::QaPair;

const SEPARATORS: [&str; 4] = ["\n\n", "\n", " ", ""];

/// Replaces everything outside the Arabic blocks, ASCII digits and basic
/// ASCII punctuation with spaces, then collapses whitespace.
pub fn clean_text(text: &str) -> String {
    let filtered: String = text
        .chars()
        .map(|c| if is_kept_char(c) { c } else { ' ' })
        .collect();

    filtered.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_kept_char(c: char) -> bool {
    matches!(
        c,
        '\u{0600}'..='\u{06FF}'
            | '\u{0750}'..='\u{077F}'
            | '\u{08A0}'..='\u{08FF}'
            | '\u{FB50}'..='\u{FDFF}'
            | '\u{FE70}'..='\u{FEFF}'
            | '\u{0020}'..='\u{002F}'
            | '0'..='9'
    )
}

/// Recursive character splitter. Lengths are counted in chars, separators
/// stay attached to the start of the piece that follows them.
#[derive(Debug, Clone)]
pub struct TextSplitter {
    chunk_size: usize,
    chunk_overlap: usize,
}

impl TextSplitter {
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Result<Self> {
        anyhow::ensure!(chunk_size > 0, "chunk size must be positive");
        anyhow::ensure!(
            chunk_overlap <= chunk_size,
            "chunk overlap ({chunk_overlap}) is larger than chunk size ({chunk_size})"
        );

        Ok(Self {
            chunk_size,
            chunk_overlap,
        })
    }

    pub fn split(&self, text: &str) -> Vec<String> {
        self.split_recursive(text, &SEPARATORS)
    }

    fn split_recursive(&self, text: &str, separators: &[&str]) -> Vec<String> {
        let mut separator = "";
        let mut remaining: &[&str] = &[];
        for (idx, candidate) in separators.iter().enumerate() {
            if candidate.is_empty() {
                break;
            }
            if text.contains(candidate) {
                separator = *candidate;
                remaining = &separators[idx + 1..];
                break;
            }
        }

        let mut chunks = Vec::new();
        let mut pending: Vec<String> = Vec::new();

        for piece in split_keeping_separator(text, separator) {
            if char_len(&piece) < self.chunk_size {
                pending.push(piece);
                continue;
            }

            if !pending.is_empty() {
                chunks.extend(self.merge_pieces(&pending));
                pending.clear();
            }

            if remaining.is_empty() {
                chunks.push(piece);
            } else {
                chunks.extend(self.split_recursive(&piece, remaining));
            }
        }

        if !pending.is_empty() {
            chunks.extend(self.merge_pieces(&pending));
        }

        chunks
    }

    fn merge_pieces(&self, pieces: &[String]) -> Vec<String> {
        let mut merged = Vec::new();
        let mut window: VecDeque<&str> = VecDeque::new();
        let mut total = 0usize;

        for piece in pieces {
            let len = char_len(piece);

            if total + len > self.chunk_size && !window.is_empty() {
                push_window(&mut merged, &window);

                while total > self.chunk_overlap || (total + len > self.chunk_size && total > 0) {
                    let Some(front) = window.pop_front() else {
                        break;
                    };
                    total -= char_len(front);
                }
            }

            window.push_back(piece);
            total += len;
        }

        push_window(&mut merged, &window);
        merged
    }
}

fn push_window(out: &mut Vec<String>, window: &VecDeque<&str>) {
    let joined: String = window.iter().copied().collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        out.push(trimmed.to_string());
    }
}

fn split_keeping_separator(text: &str, separator: &str) -> Vec<String> {
    if separator.is_empty() {
        return text.chars().map(String::from).collect();
    }

    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, _) in text.match_indices(separator) {
        if idx > start {
            pieces.push(text[start..idx].to_string());
        }
        start = idx;
    }
    if start < text.len() {
        pieces.push(text[start..].to_string());
    }

    pieces
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}

/// Pulls `س<n>: ... جواب: ...` pairs out of FAQ text. Segments without an
/// answer marker, or that clean down to nothing, are dropped.
pub fn extract_qa_pairs(text: &str) -> Result<Vec<QaPair>> {
    let marker = Regex::new(r"س\d+:")?;
    let starts: Vec<(usize, usize)> = marker.find_iter(text).map(|m| (m.start(), m.end())).collect();

    let mut pairs = Vec::new();
    for (idx, (_, body_start)) in starts.iter().enumerate() {
        let body_end = starts
            .get(idx + 1)
            .map(|(next_start, _)| *next_start)
            .unwrap_or(text.len());
        let segment = &text[*body_start..body_end];

        let Some((question, answer)) = segment.split_once("جواب:") else {
            continue;
        };

        let question = clean_text(question);
        let answer = clean_text(answer);
        if question.is_empty() || answer.is_empty() {
            continue;
        }

        pairs.push(QaPair { question, answer });
    }

    Ok(pairs)
}
