use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use tokio::sync::Semaphore;

use crate::config::{AppConfig, DEFAULT_NO_ANSWER_MSG};
use crate::ollama::{GenerateOptions, OllamaClient};
use crate::retrieval::Retriever;

/// Answers shorter than this are treated as a failed generation.
const MIN_ANSWER_CHARS: usize = 10;
const MIN_KEYWORD_CHARS: usize = 4;

#[derive(Clone)]
pub struct QueryEngine {
    config: AppConfig,
    ollama: OllamaClient,
    retriever: Retriever,
    generation_limit: Arc<Semaphore>,
}

impl QueryEngine {
    /// Fails when no vector database has been built yet.
    pub async fn new(
        config: AppConfig,
        ollama: OllamaClient,
        retriever: Retriever,
        generation_limit: Arc<Semaphore>,
    ) -> Result<Self> {
        let index = retriever.vector_store().load().await?;
        tracing::info!(
            "loaded vector database from {} ({} vectors)",
            retriever.vector_store().dir().display(),
            index.len()
        );
        if index.embedding_model() != config.models.embedding_model {
            tracing::warn!(
                "vector database was built with {} but EMBEDDING_MODEL is {}; re-run ingest",
                index.embedding_model(),
                config.models.embedding_model
            );
        }

        Ok(Self {
            config,
            ollama,
            retriever,
            generation_limit,
        })
    }

    pub async fn relevant_context(&self, question: &str) -> Result<Option<String>> {
        let results = self
            .retriever
            .retrieve(question, self.config.retrieval.top_k)
            .await?;

        let context = results
            .iter()
            .map(|result| result.chunk.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");

        if context.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(context))
    }

    pub async fn answer_question(&self, question: &str) -> Result<String> {
        let started = Instant::now();
        let question = question.trim();
        if question.is_empty() {
            return Ok(DEFAULT_NO_ANSWER_MSG.to_string());
        }

        let Some(context) = self.relevant_context(question).await? else {
            tracing::info!("no context retrieved");
            return Ok(DEFAULT_NO_ANSWER_MSG.to_string());
        };

        let keywords = query_keywords(question);
        if !context_mentions_any(&context, &keywords) {
            tracing::info!("retrieved context shares no keywords with the question");
            return Ok(DEFAULT_NO_ANSWER_MSG.to_string());
        }

        let prompt = format_prompt(question, &context);
        let generated = {
            let _permit = self.generation_limit.acquire().await?;
            self.ollama
                .generate_text(
                    &self.config.models.answer_model,
                    &prompt,
                    GenerateOptions {
                        num_predict: self.config.generation.max_output_tokens,
                        temperature: self.config.generation.temperature,
                        top_p: self.config.generation.top_p,
                    },
                )
                .await
        };

        let answer = match generated {
            Ok(text) => finalize_answer(&text, &prompt, &context, &keywords),
            Err(err) => {
                tracing::error!("error generating answer: {err:#}");
                sentence_fallback(&context, &keywords)
            }
        };

        tracing::info!("answered in {} ms", started.elapsed().as_millis());
        Ok(answer)
    }
}

pub fn format_prompt(question: &str, context: &str) -> String {
    format!(
        "استنادًا إلى المعلومات التالية:\n\n\
         {context}\n\n\
         أجب على السؤال التالي باللغة العربية:\n\
         {question}\n\n\
         إذا كانت المعلومات المقدمة لا تحتوي على إجابة للسؤال، فقل: \"{DEFAULT_NO_ANSWER_MSG}\"\n\n\
         الإجابة:\n"
    )
}

/// Lowercased words of the question longer than three characters.
fn query_keywords(question: &str) -> Vec<String> {
    question
        .to_lowercase()
        .split_whitespace()
        .filter(|word| word.chars().count() >= MIN_KEYWORD_CHARS)
        .map(str::to_string)
        .collect()
}

fn context_mentions_any(context: &str, keywords: &[String]) -> bool {
    let lower = context.to_lowercase();
    keywords.iter().any(|keyword| lower.contains(keyword.as_str()))
}

fn finalize_answer(generated: &str, prompt: &str, context: &str, keywords: &[String]) -> String {
    let answer = generated.strip_prefix(prompt).unwrap_or(generated).trim();

    if answer.chars().count() < MIN_ANSWER_CHARS {
        return most_relevant_segment(context.split('\n'), keywords).to_string();
    }
    answer.to_string()
}

fn sentence_fallback(context: &str, keywords: &[String]) -> String {
    format!("{}.", most_relevant_segment(context.split('.'), keywords).trim())
}

/// The segment with the most keyword hits; the earliest wins ties.
fn most_relevant_segment<'a>(segments: impl Iterator<Item = &'a str>, keywords: &[String]) -> &'a str {
    let mut best = "";
    let mut best_hits = None;

    for segment in segments {
        let lower = segment.to_lowercase();
        let hits = keywords
            .iter()
            .filter(|keyword| lower.contains(keyword.as_str()))
            .count();
        if best_hits.map_or(true, |current| hits > current) {
            best = segment;
            best_hits = Some(hits);
        }
    }

    best
}
