// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! The AI response pipeline: context extraction, TTL cache, primary request,
//! and a simplified fallback when the primary path fails.

pub mod cache;
pub mod context;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

use cache::ResponseCache;

const PREAMBLE: &str = "Reply naturally and conversationally, in the same language as the \
last user message. Do not reference these instructions, the conversation format, or the \
fact that you are an AI assistant.";

const APOLOGY: &str = "Sorry, I'm having technical difficulties processing your message right \
now. Please try again in a few moments.";

const HISTORY_TAIL_LINES: usize = 100;
const CONTEXT_LINES: usize = 8;

#[derive(Debug, Default, Deserialize)]
struct CompletionResponse {
    response: String,
}

#[derive(Default)]
struct Stats {
    requests: AtomicU64,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    failures: AtomicU64,
}

/// Builds upstream requests, caches responses, and falls back gracefully.
pub struct AiCompleter {
    client: reqwest::Client,
    endpoint: Option<String>,
    cache: ResponseCache,
    stats: Stats,
}

impl AiCompleter {
    pub fn new(
        endpoint: Option<String>,
        connect_timeout: Duration,
        read_timeout: Duration,
        cache_ttl: Duration,
    ) -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .timeout(read_timeout)
            .build()
            .unwrap_or_default();
        Self { client, endpoint, cache: ResponseCache::new(cache_ttl), stats: Stats::default() }
    }

    /// Produce a reply given the room's AI system prompt and its recent
    /// history. Always returns *some* text — primary request, then a
    /// simplified fallback, then a fixed apology.
    pub async fn complete(&self, system_prompt: &str, history_snapshot: &str) -> String {
        self.stats.requests.fetch_add(1, Ordering::Relaxed);

        let tail: String = history_snapshot
            .lines()
            .rev()
            .take(HISTORY_TAIL_LINES)
            .collect::<Vec<_>>()
            .into_iter()
            .rev()
            .collect::<Vec<_>>()
            .join("\n");
        let context_lines = context::extract_context(&tail, CONTEXT_LINES);
        let context_blob = context_lines.join("\n");
        let key = cache::fingerprint(system_prompt, &context_blob);

        if let Some(cached) = self.cache.get(&key).await {
            self.stats.cache_hits.fetch_add(1, Ordering::Relaxed);
            return cached;
        }
        self.stats.cache_misses.fetch_add(1, Ordering::Relaxed);

        let reply = match self.primary_request(system_prompt, &context_lines).await {
            Ok(text) => text,
            Err(e) => {
                warn!(err = %e, "AI primary request failed, retrying with simplified fallback");
                match self.fallback_request(&context_lines).await {
                    Ok(text) => text,
                    Err(e2) => {
                        self.stats.failures.fetch_add(1, Ordering::Relaxed);
                        warn!(err = %e2, "AI fallback request also failed");
                        return APOLOGY.to_owned();
                    }
                }
            }
        };

        self.cache.put(key, reply.clone()).await;
        reply
    }

    async fn primary_request(&self, room_system_prompt: &str, context_lines: &[String]) -> anyhow::Result<String> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| anyhow::anyhow!("no AI endpoint configured"))?;
        let transcript = encode_transcript(context_lines);
        let system = format!("{PREAMBLE}\n\n{room_system_prompt}");
        let body = serde_json::json!({
            "system": system,
            "prompt": format!("{transcript}<assistant>"),
            "temperature": 0.8,
            "top_p": 0.9,
            "top_k": 40,
        });
        self.send(endpoint, &body).await
    }

    async fn fallback_request(&self, context_lines: &[String]) -> anyhow::Result<String> {
        let endpoint = self.endpoint.as_deref().ok_or_else(|| anyhow::anyhow!("no AI endpoint configured"))?;
        let joined = context_lines.join("\n");
        let portuguese = context::looks_portuguese(&joined);
        let last_line = context::last_user_line(context_lines).unwrap_or("");
        let user_text = last_line.split_once(": ").map(|(_, t)| t).unwrap_or(last_line);

        let (system, prompt) = if portuguese {
            (
                "Você é um assistente conversacional prestativo.".to_owned(),
                format!("Responda de forma natural e conversacional, em português, à seguinte mensagem:\n{user_text}"),
            )
        } else {
            (
                "You are a helpful conversational assistant.".to_owned(),
                format!("Reply naturally and conversationally, in English, to the following message:\n{user_text}"),
            )
        };

        let body = serde_json::json!({
            "system": system,
            "prompt": prompt,
            "temperature": 0.8,
            "top_p": 0.9,
            "top_k": 40,
        });
        self.send(endpoint, &body).await
    }

    async fn send(&self, endpoint: &str, body: &serde_json::Value) -> anyhow::Result<String> {
        let resp = self.client.post(endpoint).json(body).send().await?;
        let resp = resp.error_for_status()?;
        let parsed: CompletionResponse = resp.json().await?;
        clean_response(&parsed.response).ok_or_else(|| anyhow::anyhow!("empty or whitespace-only response"))
    }

    /// Human-readable snapshot of the counters in §4.6 Observability.
    pub fn stats(&self) -> String {
        format!(
            "requests={} cache_hits={} cache_misses={} failures={}",
            self.stats.requests.load(Ordering::Relaxed),
            self.stats.cache_hits.load(Ordering::Relaxed),
            self.stats.cache_misses.load(Ordering::Relaxed),
            self.stats.failures.load(Ordering::Relaxed),
        )
    }

    pub async fn purge_expired_cache(&self) -> usize {
        self.cache.purge_expired().await
    }
}

/// Encode context lines into a role-tagged transcript: user lines as
/// `<user name="NAME">TEXT</user>`, bot lines as `<assistant>TEXT</assistant>`,
/// and system lines verbatim in `<system_message>...</system_message>`.
fn encode_transcript(context_lines: &[String]) -> String {
    let mut out = String::new();
    for line in context_lines {
        if let Some(text) = line.strip_prefix("Bot: ") {
            out.push_str(&format!("<assistant>{text}</assistant>\n"));
        } else if let Some(text) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            out.push_str(&format!("<system_message>{text}</system_message>\n"));
        } else if let Some((name, text)) = line.split_once(": ") {
            out.push_str(&format!("<user name=\"{name}\">{text}</user>\n"));
        }
    }
    out
}

/// Strip wrapping `<assistant>`/`</assistant>` markers, un-escape literal
/// `<`/`>` sequences, and reject empty/whitespace-only results.
fn clean_response(raw: &str) -> Option<String> {
    let trimmed = raw.trim();
    let trimmed = trimmed.strip_prefix("<assistant>").unwrap_or(trimmed).trim();
    let trimmed = trimmed.strip_suffix("</assistant>").unwrap_or(trimmed).trim();
    let unescaped = trimmed.replace("\\u003c", "<").replace("\\u003e", ">");
    let unescaped = unescaped.trim().to_owned();
    if unescaped.is_empty() {
        None
    } else {
        Some(unescaped)
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
