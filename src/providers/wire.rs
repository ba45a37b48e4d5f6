//! Wire types shared by the OpenAI-compatible APIs (xAI and OpenAI)

use super::Completion;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: &str) -> Self {
        Self {
            role: "system".to_string(),
            content: content.to_string(),
        }
    }

    pub fn user(content: &str) -> Self {
        Self {
            role: "user".to_string(),
            content: content.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct ChatCompletionRequest<'a> {
    pub model: &'a str,
    pub messages: Vec<ChatMessage>,
    pub temperature: f32,
    pub max_tokens: u32,
}

//
// ================= Chat Completions =================
//

#[derive(Debug, Deserialize)]
pub(crate) struct ChatCompletionResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    prompt_tokens: Option<u64>,
    completion_tokens: Option<u64>,
}

impl ChatCompletionResponse {
    pub fn into_completion(self) -> Option<Completion> {
        let text = self.choices.into_iter().next()?.message.content?;
        let (input, output) = self
            .usage
            .map(|u| (u.prompt_tokens, u.completion_tokens))
            .unwrap_or((None, None));
        Completion::new(text, input, output)
    }
}

//
// ================= Responses API =================
//

#[derive(Debug, Deserialize)]
pub(crate) struct ResponsesApiResponse {
    #[serde(default)]
    output: Vec<OutputItem>,
    usage: Option<ResponsesUsage>,
}

#[derive(Debug, Deserialize)]
struct OutputItem {
    #[serde(rename = "type")]
    kind: String,
    role: Option<String>,
    #[serde(default)]
    content: Vec<OutputContent>,
}

#[derive(Debug, Deserialize)]
struct OutputContent {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponsesUsage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

impl ResponsesApiResponse {
    /// First non-empty `output_text` of an assistant message
    pub fn into_completion(self) -> Option<Completion> {
        let text = self
            .output
            .into_iter()
            .filter(|item| item.kind == "message" && item.role.as_deref() == Some("assistant"))
            .flat_map(|item| item.content)
            .filter(|c| c.kind == "output_text")
            .filter_map(|c| c.text)
            .find(|t| !t.trim().is_empty())?;

        let (input, output) = self
            .usage
            .map(|u| (u.input_tokens, u.output_tokens))
            .unwrap_or((None, None));
        Completion::new(text, input, output)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_responses_output_text_skips_tool_calls() {
        let body = json!({
            "output": [
                { "type": "web_search_call", "status": "completed" },
                { "type": "message", "role": "assistant", "content": [
                    { "type": "output_text", "text": "Report body" }
                ]}
            ],
            "usage": { "input_tokens": 120, "output_tokens": 45 }
        });
        let response: ResponsesApiResponse = serde_json::from_value(body).unwrap();
        let completion = response.into_completion().unwrap();

        assert_eq!(completion.text, "Report body");
        assert_eq!(completion.input_tokens, Some(120));
        assert_eq!(completion.output_tokens, Some(45));
    }

    #[test]
    fn test_responses_without_text() {
        let body = json!({ "output": [{ "type": "reasoning", "content": [] }] });
        let response: ResponsesApiResponse = serde_json::from_value(body).unwrap();
        assert!(response.into_completion().is_none());
    }

    #[test]
    fn test_chat_completion_without_usage() {
        let body = json!({ "choices": [{ "message": { "role": "assistant", "content": "Hi" } }] });
        let response: ChatCompletionResponse = serde_json::from_value(body).unwrap();
        let completion = response.into_completion().unwrap();

        assert_eq!(completion.text, "Hi");
        assert_eq!(completion.input_tokens, None);
    }

    #[test]
    fn test_chat_completion_empty_choices() {
        let response: ChatCompletionResponse = serde_json::from_value(json!({ "choices": [] })).unwrap();
        assert!(response.into_completion().is_none());
    }
}
