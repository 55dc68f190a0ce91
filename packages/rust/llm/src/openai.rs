//! OpenAI-compatible chat completions client with structured output.
//!
//! Every call asks for a `json_schema` response format, so answers arrive as a
//! single JSON document in the first choice's message content.

use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bbqscan_shared::{
    BbqScanError, CoarseCategory, CoarseVerdict, GrillVerdict, OpenAiConfig, ProductRecord, Result,
};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::{debug, instrument, warn};
use url::Url;

use crate::capability::{
    ClassificationService, ExtractionService, PageImage, parse_coarse_answer, parse_grill_answer,
    parse_products_answer,
};
use crate::prompts;

/// User-Agent string for capability requests.
const USER_AGENT: &str = concat!("bbqscan/", env!("CARGO_PKG_VERSION"));

/// Client for the OpenAI chat completions endpoint.
#[derive(Clone)]
pub struct OpenAiClient {
    http: Client,
    endpoint: String,
    api_key: String,
    model: String,
    temperature: f32,
}

impl OpenAiClient {
    /// Build a client from the `[openai]` config section and a resolved API key.
    pub fn new(config: &OpenAiConfig, api_key: String) -> Result<Self> {
        let base = Url::parse(config.base_url.trim_end_matches('/')).map_err(|e| {
            BbqScanError::config(format!("invalid openai.base_url {}: {e}", config.base_url))
        })?;
        let endpoint = format!("{}/chat/completions", base.as_str().trim_end_matches('/'));

        let http = Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| BbqScanError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            http,
            endpoint,
            api_key: api_key.trim().to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
        })
    }

    /// Send one structured-output request and return the parsed JSON answer.
    async fn complete(
        &self,
        messages: Value,
        schema_name: &str,
        schema: Value,
        temperature: Option<f32>,
    ) -> Result<Value> {
        let mut body = json!({
            "model": self.model,
            "messages": messages,
            "response_format": {
                "type": "json_schema",
                "json_schema": { "name": schema_name, "strict": true, "schema": schema }
            }
        });
        if let Some(t) = temperature {
            body["temperature"] = json!(t);
        }

        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(classify_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            warn!(%status, error = %error_text, "capability request failed");
            return Err(classify_status(status, &error_text));
        }

        let raw: ChatResponseRaw = response
            .json()
            .await
            .map_err(|e| BbqScanError::Capability(format!("unreadable response body: {e}")))?;

        let message = raw
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| BbqScanError::Capability("response has no choices".into()))?;

        if let Some(refusal) = message.refusal {
            return Err(BbqScanError::Capability(format!("model refused: {refusal}")));
        }
        let content = message
            .content
            .ok_or_else(|| BbqScanError::Capability("response has no content".into()))?;

        serde_json::from_str(&content)
            .map_err(|e| BbqScanError::Capability(format!("answer is not valid JSON: {e}")))
    }

    fn image_part(image: &PageImage) -> Value {
        let encoded = STANDARD.encode(&image.bytes);
        json!({
            "type": "image_url",
            "image_url": { "url": format!("data:{};base64,{encoded}", image.media_type) }
        })
    }
}

#[async_trait]
impl ExtractionService for OpenAiClient {
    #[instrument(skip_all, fields(page = %image.name))]
    async fn extract(&self, image: &PageImage) -> Result<Vec<Value>> {
        let messages = json!([{
            "role": "user",
            "content": [
                { "type": "text", "text": prompts::EXTRACTION_PROMPT },
                Self::image_part(image),
            ]
        }]);
        let answer = self
            .complete(messages, "leaflet_products", products_schema(), None)
            .await?;
        let products = parse_products_answer(&answer)?;
        debug!(count = products.len(), "extracted products");
        Ok(products)
    }

    #[instrument(skip_all, fields(page = %image.name, products = primary.len()))]
    async fn validate(&self, image: &PageImage, primary: &[ProductRecord]) -> Result<Vec<Value>> {
        let messages = json!([
            { "role": "system", "content": prompts::VALIDATION_SYSTEM_PROMPT },
            {
                "role": "user",
                "content": [
                    { "type": "text", "text": prompts::validation_user_prompt(primary) },
                    Self::image_part(image),
                ]
            }
        ]);
        let answer = self
            .complete(messages, "leaflet_products", products_schema(), None)
            .await?;
        parse_products_answer(&answer)
    }
}

#[async_trait]
impl ClassificationService for OpenAiClient {
    fn model_id(&self) -> &str {
        &self.model
    }

    #[instrument(skip_all, fields(batch = names.len()))]
    async fn categorize(&self, names: &[String]) -> Result<Vec<CoarseVerdict>> {
        let messages = json!([
            { "role": "system", "content": prompts::coarse_system_prompt() },
            { "role": "user", "content": prompts::names_user_prompt(names) }
        ]);
        let answer = self
            .complete(messages, "coarse_categories", coarse_schema(), Some(self.temperature))
            .await?;
        parse_coarse_answer(&answer)
    }

    #[instrument(skip_all, fields(category = %category, batch = names.len()))]
    async fn classify_grill(
        &self,
        category: CoarseCategory,
        names: &[String],
    ) -> Result<Vec<GrillVerdict>> {
        let messages = json!([
            { "role": "system", "content": prompts::grill_system_prompt(category) },
            { "role": "user", "content": prompts::names_user_prompt(names) }
        ]);
        let answer = self
            .complete(messages, "grill_suitability", grill_schema(), Some(self.temperature))
            .await?;
        parse_grill_answer(&answer)
    }
}

// ---------------------------------------------------------------------------
// Wire types and schemas
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ChatResponseRaw {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    content: Option<String>,
    #[serde(default)]
    refusal: Option<String>,
}

fn nullable(kind: &str) -> Value {
    json!({ "type": [kind, "null"] })
}

fn products_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "all_products": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "product_name": { "type": "string" },
                        "original_price": nullable("string"),
                        "discount_price": nullable("string"),
                        "percentage_discount": nullable("number"),
                        "discount_details": nullable("string")
                    },
                    "required": ["product_name", "original_price", "discount_price",
                                 "percentage_discount", "discount_details"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["all_products"],
        "additionalProperties": false
    })
}

fn coarse_schema() -> Value {
    let labels: Vec<&str> = CoarseCategory::ALL.iter().map(|c| c.label()).collect();
    json!({
        "type": "object",
        "properties": {
            "results": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "category": { "type": "string", "enum": labels },
                        "certainty": { "type": "number" }
                    },
                    "required": ["category", "certainty"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["results"],
        "additionalProperties": false
    })
}

fn grill_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "results": {
                "type": "array",
                "items": {
                    "type": "object",
                    "properties": {
                        "is_grill": { "type": "boolean" },
                        "certainty_is_grill": { "type": "number" }
                    },
                    "required": ["is_grill", "certainty_is_grill"],
                    "additionalProperties": false
                }
            }
        },
        "required": ["results"],
        "additionalProperties": false
    })
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

fn classify_send_error(e: reqwest::Error) -> BbqScanError {
    if e.is_timeout() {
        BbqScanError::Timeout(e.to_string())
    } else if e.is_connect() {
        BbqScanError::Unavailable(e.to_string())
    } else {
        BbqScanError::Network(e.to_string())
    }
}

fn classify_status(status: StatusCode, body: &str) -> BbqScanError {
    let detail = format!("HTTP {status}: {body}");
    match status {
        StatusCode::TOO_MANY_REQUESTS => BbqScanError::RateLimited(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => BbqScanError::Timeout(detail),
        s if s.is_server_error() => BbqScanError::Unavailable(detail),
        _ => BbqScanError::Network(detail),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> OpenAiClient {
        let config = OpenAiConfig {
            base_url: format!("{}/v1", server.uri()),
            timeout_secs: 5,
            ..OpenAiConfig::default()
        };
        OpenAiClient::new(&config, "sk-test".into()).expect("client")
    }

    fn chat_answer(content: Value) -> ResponseTemplate {
        ResponseTemplate::new(200).set_body_json(json!({
            "choices": [{ "message": { "role": "assistant", "content": content.to_string() } }]
        }))
    }

    #[tokio::test]
    async fn categorize_parses_structured_answer() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .and(header("authorization", "Bearer sk-test"))
            .respond_with(chat_answer(json!({"results": [
                {"category": "Geflügel", "certainty": 90},
                {"category": "Käse", "certainty": 95}
            ]})))
            .expect(1)
            .mount(&server)
            .await;

        let client = client_for(&server);
        let verdicts = client
            .categorize(&["Poulet Flügel".into(), "Halloumi".into()])
            .await
            .unwrap();
        assert_eq!(verdicts.len(), 2);
        assert_eq!(verdicts[0].category, "Geflügel");
        assert_eq!(verdicts[1].certainty, 95);
    }

    #[tokio::test]
    async fn extract_sends_image_as_data_url() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/chat/completions"))
            .respond_with(chat_answer(json!({"all_products": [
                {"product_name": "Cervelat", "original_price": "2.–", "discount_price": null,
                 "percentage_discount": null, "discount_details": null}
            ]})))
            .mount(&server)
            .await;

        let client = client_for(&server);
        let image = PageImage::new("page-1.png", vec![1, 2, 3]);
        let products = client.extract(&image).await.unwrap();
        assert_eq!(products.len(), 1);

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        let url = body["messages"][0]["content"][1]["image_url"]["url"]
            .as_str()
            .unwrap();
        assert_eq!(url, "data:image/png;base64,AQID");
        assert_eq!(body["response_format"]["type"], "json_schema");
    }

    #[tokio::test]
    async fn rate_limit_maps_to_transient_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .classify_grill(CoarseCategory::Beef, &["Entrecôte".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, BbqScanError::RateLimited(_)));
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn auth_failure_is_not_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401).set_body_string("bad key"))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .categorize(&["Bratwurst".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, BbqScanError::Network(_)));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn server_error_is_transient() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .categorize(&["Bratwurst".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, BbqScanError::Unavailable(_)));
    }

    #[tokio::test]
    async fn refusal_is_capability_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "choices": [{ "message": { "content": null, "refusal": "cannot help" } }]
            })))
            .mount(&server)
            .await;

        let err = client_for(&server)
            .categorize(&["Bratwurst".into()])
            .await
            .unwrap_err();
        assert!(matches!(err, BbqScanError::Capability(_)));
    }

    #[test]
    fn invalid_base_url_is_config_error() {
        let config = OpenAiConfig {
            base_url: "not a url".into(),
            ..OpenAiConfig::default()
        };
        let err = OpenAiClient::new(&config, "sk".into()).err().unwrap();
        assert!(matches!(err, BbqScanError::Config { .. }));
    }
}
