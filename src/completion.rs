use serde_json::{json, Value};

use crate::{configuration::LlmConfig, execution::ToolError};

#[derive(Debug, thiserror::Error)]
pub enum CompletionError {
    #[error("cannot resolve {0}")]
    Resolve(String),
    #[error("cannot connect: {0}")]
    Connect(String),
    #[error("completion request failed: {0}")]
    Transport(String),
    #[error("completion service answered {status}: {body}")]
    Status { status: u16, body: String },
    #[error("malformed completion response: {0}")]
    Malformed(String),
}

/// Prompt text in, completion text out.
pub trait Complete: Send + Sync {
    fn complete(&self, prompt: &str) -> Result<String, CompletionError>;
}

/// Client for a local text-completion endpoint.
pub struct HttpCompletion {
    agent: ureq::Agent,
    endpoint: String,
    url: String,
    model: String,
    max_tokens: u32,
    temperature: f64,
}

impl HttpCompletion {
    pub fn new(config: &LlmConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .timeout_read(config.request_timeout)
            .timeout_write(config.request_timeout)
            .build();

        HttpCompletion {
            agent,
            endpoint: config.endpoint.clone(),
            url: format!("http://{}{}", config.endpoint, config.path),
            model: config.model.clone(),
            max_tokens: config.max_tokens,
            temperature: config.temperature,
        }
    }

    fn transport_error(&self, transport: ureq::Transport) -> CompletionError {
        match transport.kind() {
            ureq::ErrorKind::Dns => CompletionError::Resolve(self.endpoint.clone()),
            ureq::ErrorKind::ConnectionFailed => CompletionError::Connect(transport.to_string()),
            _ => CompletionError::Transport(transport.to_string()),
        }
    }

    /// Startup check that an HTTP service answers on the endpoint. Any status counts.
    pub fn check_available(&self) -> Result<(), ToolError> {
        match self.agent.get(&format!("http://{}/", self.endpoint)).call() {
            Ok(_) | Err(ureq::Error::Status(..)) => Ok(()),
            Err(ureq::Error::Transport(transport)) => Err(ToolError::Unavailable {
                program: format!("completion service at {}", self.endpoint),
                reason: self.transport_error(transport).to_string(),
            }),
        }
    }
}

impl Complete for HttpCompletion {
    fn complete(&self, prompt: &str) -> Result<String, CompletionError> {
        let request = json!({
            "model": self.model,
            "prompt": prompt,
            "max_tokens": self.max_tokens,
            "temperature": self.temperature,
            "stream": false,
        });

        let response = match self.agent.post(&self.url).send_json(request) {
            Ok(response) => response,
            Err(ureq::Error::Status(status, response)) => {
                let body = response.into_string().unwrap_or_default();
                return Err(CompletionError::Status {
                    status,
                    body: body.chars().take(200).collect(),
                });
            }
            Err(ureq::Error::Transport(transport)) => return Err(self.transport_error(transport)),
        };

        let value: Value = response
            .into_json()
            .map_err(|e| CompletionError::Malformed(e.to_string()))?;
        completion_text(&value)
            .map(str::to_string)
            .ok_or_else(|| CompletionError::Malformed("no completion text".to_string()))
    }
}

/// Accepts the common completion response shapes.
fn completion_text(value: &Value) -> Option<&str> {
    let choice = value.get("choices").and_then(|c| c.get(0));
    choice
        .and_then(|c| c.get("text"))
        .or_else(|| choice.and_then(|c| c.get("message")).and_then(|m| m.get("content")))
        .or_else(|| value.get("content"))
        .or_else(|| value.get("response"))
        .and_then(Value::as_str)
}
