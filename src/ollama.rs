use anyhow::{Context, Result};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};

#[derive(Clone)]
pub struct OllamaClient {
    client: Client,
    base_url: String,
}

#[derive(Debug, Clone, Copy)]
pub struct GenerateOptions {
    pub num_predict: usize,
    pub temperature: f32,
    pub top_p: f32,
}

impl OllamaClient {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub async fn embed(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        let input = text.trim();
        if input.is_empty() {
            anyhow::bail!("cannot embed empty text input");
        }

        let mut vectors = self.embed_batch(model, &[input.to_string()]).await?;
        vectors
            .pop()
            .ok_or_else(|| anyhow::anyhow!("ollama returned no embedding"))
    }

    /// Embeds all inputs, one vector per input in order.
    ///
    /// Newer Ollama releases expose batched `/api/embed`; older ones only have
    /// `/api/embeddings`, which takes a single prompt.
    pub async fn embed_batch(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        if inputs.is_empty() {
            return Ok(vec![]);
        }

        match self.embed_modern(model, inputs).await {
            Ok(vectors) => Ok(vectors),
            Err(modern_err) => {
                tracing::debug!("/api/embed failed, trying /api/embeddings: {modern_err:#}");
                let mut vectors = Vec::with_capacity(inputs.len());
                for input in inputs {
                    let vector = self.embed_legacy(model, input).await.map_err(|legacy_err| {
                        anyhow::anyhow!(
                            "ollama embedding failed via /api/embed and /api/embeddings. \
                             modern error: {modern_err:#}; legacy error: {legacy_err:#}; \
                             ensure the embedding model is pulled (`ollama pull {model}`)"
                        )
                    })?;
                    vectors.push(vector);
                }
                Ok(vectors)
            }
        }
    }

    async fn embed_modern(&self, model: &str, inputs: &[String]) -> Result<Vec<Vec<f32>>> {
        #[derive(Serialize)]
        struct EmbedReq<'a> {
            model: &'a str,
            input: &'a [String],
        }

        #[derive(Deserialize)]
        struct EmbedResp {
            embeddings: Vec<Vec<f32>>,
        }

        let url = format!("{}/api/embed", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&EmbedReq {
                model,
                input: inputs,
            })
            .send()
            .await
            .context("failed to call ollama embed endpoint")?;

        let response = check_status(response, "/api/embed").await?;
        let response = response
            .json::<EmbedResp>()
            .await
            .context("failed to decode ollama /api/embed response")?;

        if response.embeddings.len() != inputs.len() {
            anyhow::bail!(
                "ollama /api/embed returned {} embeddings for {} inputs",
                response.embeddings.len(),
                inputs.len()
            );
        }

        Ok(response.embeddings)
    }

    async fn embed_legacy(&self, model: &str, text: &str) -> Result<Vec<f32>> {
        #[derive(Serialize)]
        struct EmbeddingReq<'a> {
            model: &'a str,
            prompt: &'a str,
        }

        #[derive(Deserialize)]
        struct EmbeddingResp {
            embedding: Vec<f32>,
        }

        let url = format!("{}/api/embeddings", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&EmbeddingReq {
                model,
                prompt: text,
            })
            .send()
            .await
            .context("failed to call ollama embeddings endpoint")?;

        let response = check_status(response, "/api/embeddings").await?;
        let response = response
            .json::<EmbeddingResp>()
            .await
            .context("failed to decode ollama embeddings response")?;

        Ok(response.embedding)
    }

    pub async fn generate_text(
        &self,
        model: &str,
        prompt: &str,
        options: GenerateOptions,
    ) -> Result<String> {
        #[derive(Serialize)]
        struct GenerateReq<'a> {
            model: &'a str,
            prompt: &'a str,
            stream: bool,
            options: ReqOptions,
        }

        #[derive(Serialize)]
        struct ReqOptions {
            num_predict: usize,
            temperature: f32,
            top_p: f32,
        }

        #[derive(Deserialize)]
        struct GenerateResp {
            response: String,
        }

        let url = format!("{}/api/generate", self.base_url);
        let response = self
            .client
            .post(url)
            .json(&GenerateReq {
                model,
                prompt,
                stream: false,
                options: ReqOptions {
                    num_predict: options.num_predict,
                    temperature: options.temperature,
                    top_p: options.top_p,
                },
            })
            .send()
            .await
            .context("failed to call ollama generate endpoint")?;

        let response = check_status(response, "/api/generate")
            .await?
            .json::<GenerateResp>()
            .await
            .context("failed to decode ollama generate response")?;

        Ok(response.response)
    }

    /// Names of the locally installed models, as reported by `/api/tags`.
    pub async fn list_models(&self) -> Result<Vec<String>> {
        #[derive(Deserialize)]
        struct TagsResp {
            models: Vec<TagModel>,
        }

        #[derive(Deserialize)]
        struct TagModel {
            name: String,
        }

        let url = format!("{}/api/tags", self.base_url);
        let response = self
            .client
            .get(url)
            .send()
            .await
            .with_context(|| format!("failed to reach ollama at {}", self.base_url))?;

        let response = check_status(response, "/api/tags")
            .await?
            .json::<TagsResp>()
            .await
            .context("failed to decode ollama tags response")?;

        Ok(response.models.into_iter().map(|m| m.name).collect())
    }
}

/// True when `installed` contains `wanted`, treating a missing tag as `latest`.
pub fn model_is_installed(installed: &[String], wanted: &str) -> bool {
    let with_tag = |name: &str| {
        if name.contains(':') {
            name.to_string()
        } else {
            format!("{name}:latest")
        }
    };
    let wanted = with_tag(wanted);
    installed.iter().any(|name| with_tag(name) == wanted)
}

async fn check_status(response: reqwest::Response, endpoint: &str) -> Result<reqwest::Response> {
    if response.status() == StatusCode::OK {
        return Ok(response);
    }

    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    anyhow::bail!(
        "ollama {endpoint} returned {status}: {}",
        normalize_err_body(&body)
    )
}

fn normalize_err_body(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.is_empty() {
        return "<empty body>".to_string();
    }

    if let Ok(json) = serde_json::from_str::<serde_json::Value>(trimmed) {
        if let Some(err) = json.get("error").and_then(|v| v.as_str()) {
            return err.to_string();
        }
    }

    trimmed.to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_body_prefers_json_error_field() {
        assert_eq!(
            normalize_err_body(r#"{"error":"model \"bge-m3\" not found"}"#),
            "model \"bge-m3\" not found"
        );
        assert_eq!(normalize_err_body("  "), "<empty body>");
        assert_eq!(normalize_err_body("bad gateway"), "bad gateway");
    }

    #[test]
    fn untagged_model_names_match_latest() {
        let installed = vec!["bge-m3:latest".to_string(), "qwen2.5:7b-instruct".to_string()];
        assert!(model_is_installed(&installed, "bge-m3"));
        assert!(model_is_installed(&installed, "qwen2.5:7b-instruct"));
        assert!(!model_is_installed(&installed, "qwen2.5:14b-instruct"));
    }

    #[test]
    fn trailing_slash_is_dropped_from_base_url() {
        let client = OllamaClient::new("http://127.0.0.1:11434/");
        assert_eq!(client.base_url(), "http://127.0.0.1:11434");
    }
}
