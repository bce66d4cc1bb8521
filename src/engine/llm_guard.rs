//! Classifier-backed check using Meta Llama Guard via OpenRouter.
//!
//! Transport or API failures surface as rule execution errors, which the
//! evaluator turns into `error` findings. A classifier outage therefore
//! routes content to review instead of approving it.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use crate::config::LlmConfig;
use crate::domain::{NormalizedContent, Outcome};
use crate::engine::checks::{CheckResult, GuidelineCheck};
use crate::error::{EngineError, EngineResult};

/// Request to OpenRouter API.
#[derive(Debug, Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<ChatMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    max_tokens: Option<u32>,
}

#[derive(Debug, Serialize)]
struct ChatMessage {
    role: String,
    content: String,
}

/// Response from OpenRouter API.
#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<Choice>,
}

#[derive(Debug, Deserialize)]
struct Choice {
    message: ResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ResponseMessage {
    content: String,
}

/// Llama Guard safety categories (MLCommons hazard taxonomy).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyCategory {
    /// S1
    ViolentCrimes,
    /// S2
    NonViolentCrimes,
    /// S3
    SexCrimes,
    /// S4
    ChildExploitation,
    /// S5
    Defamation,
    /// S6
    SpecializedAdvice,
    /// S7
    Privacy,
    /// S8
    IntellectualProperty,
    /// S9
    IndiscriminateWeapons,
    /// S10
    Hate,
    /// S11
    SelfHarm,
    /// S12
    SexualContent,
    /// S13
    Elections,
    /// S14
    CodeInterpreterAbuse,
    Unknown(String),
}

impl SafetyCategory {
    fn from_code(code: &str) -> Self {
        match code.trim().to_uppercase().as_str() {
            "S1" => SafetyCategory::ViolentCrimes,
            "S2" => SafetyCategory::NonViolentCrimes,
            "S3" => SafetyCategory::SexCrimes,
            "S4" => SafetyCategory::ChildExploitation,
            "S5" => SafetyCategory::Defamation,
            "S6" => SafetyCategory::SpecializedAdvice,
            "S7" => SafetyCategory::Privacy,
            "S8" => SafetyCategory::IntellectualProperty,
            "S9" => SafetyCategory::IndiscriminateWeapons,
            "S10" => SafetyCategory::Hate,
            "S11" => SafetyCategory::SelfHarm,
            "S12" => SafetyCategory::SexualContent,
            "S13" => SafetyCategory::Elections,
            "S14" => SafetyCategory::CodeInterpreterAbuse,
            other => SafetyCategory::Unknown(other.to_string()),
        }
    }

    fn description(&self) -> &str {
        match self {
            SafetyCategory::ViolentCrimes => "Violent crimes",
            SafetyCategory::NonViolentCrimes => "Non-violent crimes",
            SafetyCategory::SexCrimes => "Sex-related crimes",
            SafetyCategory::ChildExploitation => "Child sexual exploitation",
            SafetyCategory::Defamation => "Defamation",
            SafetyCategory::SpecializedAdvice => "Specialized advice",
            SafetyCategory::Privacy => "Privacy violation",
            SafetyCategory::IntellectualProperty => "Intellectual property violation",
            SafetyCategory::IndiscriminateWeapons => "Indiscriminate weapons",
            SafetyCategory::Hate => "Hate speech",
            SafetyCategory::SelfHarm => "Suicide & self-harm",
            SafetyCategory::SexualContent => "Sexual content",
            SafetyCategory::Elections => "Election misinformation",
            SafetyCategory::CodeInterpreterAbuse => "Code interpreter abuse",
            SafetyCategory::Unknown(s) => s.as_str(),
        }
    }

    /// Categories that fail content outright rather than flag it.
    fn is_critical(&self) -> bool {
        matches!(
            self,
            SafetyCategory::ChildExploitation
                | SafetyCategory::IndiscriminateWeapons
                | SafetyCategory::ViolentCrimes
                | SafetyCategory::Hate
        )
    }
}

/// Parsed classification from Llama Guard.
#[derive(Debug, Clone)]
pub struct GuardResult {
    pub is_safe: bool,
    pub violated_categories: Vec<SafetyCategory>,
}

impl GuardResult {
    /// Parse Llama Guard response format.
    ///
    /// Llama Guard outputs:
    /// - "safe" if content is safe
    /// - "unsafe\nS1,S2,..." if content violates categories
    fn parse(response: &str) -> Self {
        let response = response.trim().to_lowercase();

        if response.starts_with("safe") {
            return GuardResult {
                is_safe: true,
                violated_categories: Vec::new(),
            };
        }

        let mut categories = Vec::new();
        let lines: Vec<&str> = response.lines().collect();

        for line in lines.iter().skip(1) {
            for code in line.split(',') {
                let code = code.trim();
                if !code.is_empty() {
                    categories.push(SafetyCategory::from_code(code));
                }
            }
        }

        // Inline form: "unsafe S1, S2"
        if categories.is_empty() && lines.len() == 1 {
            for part in response.split_whitespace().skip(1) {
                let code = part.trim_matches(|c| c == ',' || c == '.');
                if code.starts_with('s') && code.len() <= 3 {
                    categories.push(SafetyCategory::from_code(code));
                }
            }
        }

        GuardResult {
            is_safe: false,
            violated_categories: categories,
        }
    }

    /// Map a classification onto a check result.
    fn to_check_result(&self) -> CheckResult {
        if self.is_safe {
            return CheckResult::pass(0.9, "Classifier judged content safe");
        }

        let names: Vec<&str> = self
            .violated_categories
            .iter()
            .map(SafetyCategory::description)
            .collect();
        let reason = if names.is_empty() {
            "Classifier judged content unsafe".to_string()
        } else {
            format!("Classifier judged content unsafe: {}", names.join(", "))
        };

        if self.violated_categories.iter().any(SafetyCategory::is_critical) {
            CheckResult::new(Outcome::Fail, 0.95, reason)
        } else {
            CheckResult::new(Outcome::Flag, 0.75, reason)
        }
    }
}

/// HTTP client for the OpenRouter chat completions API.
#[derive(Clone)]
pub struct LlamaGuardClient {
    api_key: String,
    endpoint: String,
    client: Client,
}

impl LlamaGuardClient {
    /// Create a client, or `None` when no API key is configured.
    pub fn from_config(config: &LlmConfig) -> EngineResult<Option<Self>> {
        if config.openrouter_api_key.is_empty() {
            return Ok(None);
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| EngineError::Config(format!("Failed to create HTTP client: {}", e)))?;

        Ok(Some(Self {
            api_key: config.openrouter_api_key.clone(),
            endpoint: config.endpoint.clone(),
            client,
        }))
    }

    /// Classify content with the given model.
    pub async fn classify(&self, model: &str, content: &str) -> EngineResult<GuardResult> {
        let prompt = format!(
            r#"<|begin_of_text|><|start_header_id|>user<|end_header_id|>

Task: Check if there is unsafe content in 'User' messages in conversations according to our safety policy.

<BEGIN CONVERSATION>

User: {}

<END CONVERSATION>

Provide your safety assessment for the User message.
- First line must read 'safe' or 'unsafe'.
- If unsafe, a second line must include a comma-separated list of violated categories.<|eot_id|><|start_header_id|>assistant<|end_header_id|>"#,
            content
        );

        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![ChatMessage {
                role: "user".to_string(),
                content: prompt,
            }],
            max_tokens: Some(100),
        };

        let response = self
            .client
            .post(&self.endpoint)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .json(&request)
            .send()
            .await
            .map_err(|e| EngineError::RuleExecution(format!("classifier request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EngineError::RuleExecution(format!(
                "classifier API error {}: {}",
                status, body
            )));
        }

        let chat_response: ChatResponse = response.json().await.map_err(|e| {
            EngineError::RuleExecution(format!("failed to parse classifier response: {}", e))
        })?;

        let content = chat_response
            .choices
            .first()
            .map(|c| c.message.content.as_str())
            .ok_or_else(|| EngineError::RuleExecution("classifier returned no choices".into()))?;

        Ok(GuardResult::parse(content))
    }
}

/// Guideline check delegating to Llama Guard.
pub struct LlamaGuardCheck {
    client: Option<LlamaGuardClient>,
    model: String,
}

impl LlamaGuardCheck {
    pub fn new(client: Option<LlamaGuardClient>, model: String) -> Self {
        Self { client, model }
    }
}

#[async_trait]
impl GuidelineCheck for LlamaGuardCheck {
    async fn evaluate(&self, content: &NormalizedContent) -> EngineResult<CheckResult> {
        let client = self.client.as_ref().ok_or_else(|| {
            EngineError::RuleExecution("classifier is not configured".to_string())
        })?;

        let text = content.scannable_text();
        if text.is_empty() {
            return Ok(CheckResult::pass(1.0, "Nothing for the classifier to read"));
        }

        tracing::debug!(model = %self.model, content_len = text.len(), "Calling classifier");
        let result = client.classify(&self.model, &text).await?;
        tracing::debug!(
            is_safe = result.is_safe,
            categories = ?result.violated_categories,
            "Classifier response received"
        );

        Ok(result.to_check_result())
    }
}
