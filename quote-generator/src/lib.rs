use reqwest::Client;
use serde::{Deserialize, Serialize};
use symbol_detector::ClassTally;
use tracing::{info, warn};

const GENERATIVE_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta/models";

const DEFAULT_MODEL: &str = "gemini-2.5-pro";

/// Fixed audit instruction for the quoting model. Component pricing follows
/// Philippine standards; the model may construct product search URLs itself.
const SYSTEM_INSTRUCTION: &str = "You are tasked to audit electrical components, \
the electrical components are to be of Philippine standards, \
you are free to create the search url with the product name.";

/// Client for the hosted quote-generation model.
///
/// Sends a class tally as the sole user-turn content and asks for a priced
/// bill of materials constrained by a structured-output response schema.
pub struct QuoteGenerator {
    client: Client,
    api_key: String,
    model: String,
}

/// Priced bill of materials decoded from the model's structured output.
///
/// Schema conformance is the service's responsibility; every field here is
/// optional so a malformed document degrades to absent values, not a crash.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuoteResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub electrical_specifications: Option<ElectricalSpecifications>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ElectricalSpecifications {
    #[serde(default)]
    pub components: Vec<QuoteComponent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_quote: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuoteComponent {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quantity: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub product_price: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

impl QuoteGenerator {
    /// Create a new quote client.
    ///
    /// # Arguments
    /// * `api_key` - generative API credential (from GEMINI_API_KEY)
    /// * `model` - model to use (default: "gemini-2.5-pro")
    pub fn new(api_key: String, model: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            model: model.unwrap_or_else(|| DEFAULT_MODEL.to_string()),
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("GEMINI_API_KEY")
            .map_err(|_| anyhow::anyhow!("GEMINI_API_KEY environment variable not set"))?;
        let model = std::env::var("QUOTE_MODEL").ok();
        Ok(Self::new(api_key, model))
    }

    /// Generate a priced quote for the tallied symbol classes.
    ///
    /// The tally is serialized to JSON text and handed to the model as the
    /// only user-turn content. One request, no retry; transport errors,
    /// non-success statuses, and an empty response all surface as one error.
    pub async fn generate_quote(&self, tally: &ClassTally) -> anyhow::Result<QuoteResult> {
        let tally_json = serde_json::to_string_pretty(tally)?;

        info!(
            "Requesting quote for {} symbol class(es) (model: {})",
            tally.len(),
            self.model
        );

        let url = format!("{}/{}:generateContent", GENERATIVE_API_BASE, self.model);

        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
            .header("Content-Type", "application/json")
            .json(&build_request_body(&tally_json))
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            warn!("Quote service error: {} - {}", status, error_text);
            return Err(anyhow::anyhow!(
                "Quote service error: {} - {}",
                status,
                error_text
            ));
        }

        let envelope: GenerateContentResponse = response.json().await?;

        let text = first_text(&envelope)
            .ok_or_else(|| anyhow::anyhow!("Quote response contained no text part"))?;

        let document = extract_json_from_response(text);

        let quote: QuoteResult = serde_json::from_str(&document).map_err(|e| {
            anyhow::anyhow!("Failed to parse quote document: {}. Response: {}", e, document)
        })?;

        let components = quote
            .electrical_specifications
            .as_ref()
            .map(|spec| spec.components.len())
            .unwrap_or(0);
        info!("Quote received with {} component(s)", components);

        Ok(quote)
    }
}

/// Assemble the full generation request: fixed system instruction, the tally
/// text as the sole user turn, and the structured-output configuration.
fn build_request_body(tally_json: &str) -> serde_json::Value {
    serde_json::json!({
        "system_instruction": {
            "parts": [{ "text": SYSTEM_INSTRUCTION }]
        },
        "contents": [{
            "role": "user",
            "parts": [{ "text": tally_json }]
        }],
        "generationConfig": {
            "thinkingConfig": { "thinkingBudget": -1 },
            "responseMimeType": "application/json",
            "responseSchema": response_schema()
        }
    })
}

/// Response schema the service enforces: a components list with per-item
/// pricing plus an overall total.
fn response_schema() -> serde_json::Value {
    serde_json::json!({
        "type": "OBJECT",
        "required": ["electrical_specifications"],
        "properties": {
            "electrical_specifications": {
                "type": "OBJECT",
                "required": ["components", "total_quote"],
                "properties": {
                    "components": {
                        "type": "ARRAY",
                        "items": {
                            "type": "OBJECT",
                            "required": [
                                "name",
                                "quantity",
                                "product_url",
                                "product_price",
                                "class_name",
                                "total"
                            ],
                            "properties": {
                                "name": { "type": "STRING" },
                                "quantity": { "type": "INTEGER" },
                                "product_url": { "type": "STRING" },
                                "product_price": { "type": "INTEGER" },
                                "class_name": { "type": "STRING" },
                                "total": { "type": "INTEGER" }
                            }
                        }
                    },
                    "total_quote": { "type": "INTEGER" }
                }
            }
        }
    })
}

fn first_text(envelope: &GenerateContentResponse) -> Option<&str> {
    envelope
        .candidates
        .first()?
        .content
        .as_ref()?
        .parts
        .first()?
        .text
        .as_deref()
}

/// Unwrap a markdown code fence if the model added one around its JSON.
fn extract_json_from_response(content: &str) -> String {
    let trimmed = content.trim();

    if trimmed.starts_with("```") {
        trimmed
            .lines()
            .skip(1)
            .take_while(|line| !line.starts_with("```"))
            .collect::<Vec<_>>()
            .join("\n")
    } else {
        trimmed.to_string()
    }
}
