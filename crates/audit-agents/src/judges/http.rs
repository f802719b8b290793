//! HTTP judge backed by an OpenAI-compatible chat-completions endpoint

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::debug;
use tribunal::state::Metadata;
use tribunal::{CollaboratorError, EvidenceRecord, JudgeId, JudgmentCollaborator, RawOpinion, ScoreRange};

use crate::config::JudgeConfig;

#[derive(Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    max_tokens: u32,
    temperature: f32,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Deserialize)]
struct ResponseMessage {
    content: Option<String>,
}

pub struct HttpJudge {
    http: reqwest::Client,
    endpoint: String,
    model: String,
    api_key: Option<String>,
    temperature: f32,
    max_tokens: u32,
    range: ScoreRange,
}

impl HttpJudge {
    pub fn new(config: &JudgeConfig, range: ScoreRange) -> Result<Self, reqwest::Error> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(config.request_timeout_secs.max(1)))
                .build()?,
            endpoint: completions_url(&config.url),
            model: config.model.clone(),
            api_key: config.api_key.clone(),
            temperature: config.temperature,
            max_tokens: config.max_tokens,
            range,
        })
    }

    async fn complete(&self, messages: Vec<ChatMessage>) -> Result<String, CollaboratorError> {
        let request = ChatRequest {
            model: self.model.clone(),
            messages,
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        };

        let mut builder = self.http.post(&self.endpoint).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        let response = builder.send().await.map_err(|e| {
            if e.is_timeout() {
                CollaboratorError::timeout(format!("judge request timed out: {e}"))
            } else {
                CollaboratorError::unavailable(format!("judge request failed: {e}"))
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(CollaboratorError::unavailable(format!(
                "judge endpoint error ({}): {}",
                status, body
            )));
        }

        let chat: ChatResponse = response
            .json()
            .await
            .map_err(|e| CollaboratorError::malformed(format!("unreadable completion: {e}")))?;
        chat.choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or_else(|| CollaboratorError::malformed("completion carried no content"))
    }
}

#[async_trait]
impl JudgmentCollaborator for HttpJudge {
    async fn deliberate(
        &self,
        judge: JudgeId,
        evidence: &[EvidenceRecord],
        metadata: &Metadata,
    ) -> Result<RawOpinion, CollaboratorError> {
        let messages = vec![
            ChatMessage {
                role: "system".into(),
                content: persona_prompt(judge, &self.range),
            },
            ChatMessage {
                role: "user".into(),
                content: evidence_brief(evidence, metadata),
            },
        ];
        let content = self.complete(messages).await?;
        debug!(judge = %judge, chars = content.len(), "Judge completion received");
        parse_opinion(&content, judge)
    }
}

/// Accept a base URL or a full `/chat/completions` URL
fn completions_url(url: &str) -> String {
    let trimmed = url.trim_end_matches('/');
    if trimmed.ends_with("/chat/completions") {
        trimmed.to_string()
    } else {
        format!("{trimmed}/chat/completions")
    }
}

pub fn persona_prompt(judge: JudgeId, range: &ScoreRange) -> String {
    let persona = match judge {
        JudgeId::Prosecutor => {
            "You are the PROSECUTOR. Assume the project cut corners until the evidence \
             proves otherwise. Linear pipelines sold as parallel orchestration and claims \
             the code does not back up are violations."
        }
        JudgeId::Defense => {
            "You are the DEFENSE. Look for intent and partial progress. Credit work that \
             is clearly underway even where it is unfinished."
        }
        JudgeId::TechLead => {
            "You are the TECH LEAD. Judge whether the implementation actually works and \
             can be maintained: structure, state handling, and technical debt."
        }
    };
    format!(
        "{persona}\n\nRespond with a single JSON object and nothing else:\n\
         {{\"judge\": \"{}\", \"score\": <number from {} to {}>, \"rationale\": \"<argument>\", \
         \"cited_evidence\": [\"<goal>\", ...]}}",
        judge.as_str(),
        range.min,
        range.max
    )
}

pub fn evidence_brief(evidence: &[EvidenceRecord], metadata: &Metadata) -> String {
    let mut brief = String::from("FORENSIC EVIDENCE:\n");
    if evidence.is_empty() {
        brief.push_str("- (none)\n");
    }
    for record in evidence {
        brief.push_str(&format!(
            "- {} | found: {} | confidence: {:.2} | location: {} | {}\n",
            record.goal(),
            record.found(),
            record.confidence(),
            record.location(),
            record.rationale()
        ));
    }
    if let Some(status) = metadata.get("evidence_status").and_then(|v| v.as_str()) {
        brief.push_str(&format!("\nEVIDENCE STATUS: {status}\n"));
    }
    brief
}

/// Extract the outermost JSON object from a completion
pub fn parse_opinion(content: &str, judge: JudgeId) -> Result<RawOpinion, CollaboratorError> {
    let (Some(start), Some(end)) = (content.find('{'), content.rfind('}')) else {
        return Err(CollaboratorError::malformed("completion contains no JSON object"));
    };
    if end < start {
        return Err(CollaboratorError::malformed("completion contains no JSON object"));
    }
    let mut raw: RawOpinion = serde_json::from_str(&content[start..=end])
        .map_err(|e| CollaboratorError::malformed(format!("invalid judgment JSON: {e}")))?;
    if raw.judge.trim().is_empty() {
        raw.judge = judge.as_str().to_string();
    }
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tribunal::FailureKind;

    #[test]
    fn test_completions_url() {
        assert_eq!(
            completions_url("http://localhost:8080/v1/"),
            "http://localhost:8080/v1/chat/completions"
        );
        assert_eq!(
            completions_url("http://h/v1/chat/completions"),
            "http://h/v1/chat/completions"
        );
    }

    #[test]
    fn test_parse_fenced_json() {
        let content = "Here is my ruling:\n```json\n{\"score\": 4, \"rationale\": \"solid\", \
                       \"cited_evidence\": [\"1.1\"]}\n```";
        let raw = parse_opinion(content, JudgeId::Defense).unwrap();
        assert_eq!(raw.judge, "defense");
        assert_eq!(raw.score, 4.0);
        assert_eq!(raw.cited_evidence, vec!["1.1"]);
    }

    #[test]
    fn test_reported_judge_kept_for_validation() {
        let raw = parse_opinion(r#"{"judge": "Prosecutor", "score": 2}"#, JudgeId::Defense).unwrap();
        assert_eq!(raw.judge, "Prosecutor");
        let err = tribunal::validate_opinion(raw, JudgeId::Defense, &ScoreRange::default())
            .unwrap_err();
        assert_eq!(err.kind, FailureKind::Malformed);
    }

    #[test]
    fn test_unparseable_completion_is_malformed() {
        for content in ["no json here", "} backwards {", "{\"score\": \"high\"}"] {
            let err = parse_opinion(content, JudgeId::TechLead).unwrap_err();
            assert_eq!(err.kind, FailureKind::Malformed, "{content}");
        }
    }

    #[test]
    fn test_prompt_states_range_and_identity() {
        let prompt = persona_prompt(JudgeId::TechLead, &ScoreRange::default());
        assert!(prompt.contains("TECH LEAD"));
        assert!(prompt.contains("\"tech_lead\""));
        assert!(prompt.contains("from 1 to 5"));
    }

    #[test]
    fn test_brief_lists_evidence_and_status() {
        let record = EvidenceRecord::new("1.1 Graph orchestration", true, "src/graph.py:3").unwrap();
        let mut metadata = Metadata::new();
        metadata.insert("evidence_status".into(), serde_json::json!("insufficient"));
        let brief = evidence_brief(&[record], &metadata);
        assert!(brief.contains("1.1 Graph orchestration | found: true"));
        assert!(brief.contains("EVIDENCE STATUS: insufficient"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_unavailable() {
        let config = JudgeConfig {
            url: "http://127.0.0.1:9".into(),
            request_timeout_secs: 2,
            ..JudgeConfig::default()
        };
        let judge = HttpJudge::new(&config, ScoreRange::default()).unwrap();
        let err = judge
            .deliberate(JudgeId::Defense, &[], &Metadata::new())
            .await
            .unwrap_err();
        assert!(matches!(err.kind, FailureKind::Unavailable | FailureKind::Timeout));
    }
}
