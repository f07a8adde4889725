use base64::{engine::general_purpose, Engine as _};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub mod tally;

pub use tally::{count_symbol_classes, ClassTally};

/// Production workflow endpoint for electrical symbol detection
const DEFAULT_WORKFLOW_URL: &str =
    "https://serverless.roboflow.com/infer/workflows/architronix-detection/small-object-detection-sahi";

/// Opaque reference to a floor-plan image, as the detection workflow expects
/// it: either a remote URL or a `data:` URI built from uploaded bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ImageReference(String);

impl ImageReference {
    /// Wrap an already-hosted image URL (or a prebuilt data URI).
    pub fn from_url(url: impl Into<String>) -> Self {
        Self(url.into())
    }

    /// Encode raw image bytes into a `data:image/...;base64,` URI.
    ///
    /// The format is sniffed from the bytes so the MIME type matches what
    /// was actually uploaded.
    pub fn from_image_bytes(bytes: &[u8]) -> anyhow::Result<Self> {
        let format = image::guess_format(bytes)
            .map_err(|e| anyhow::anyhow!("Unrecognized image format: {}", e))?;
        let encoded = general_purpose::STANDARD.encode(bytes);
        Ok(Self(format!(
            "data:{};base64,{}",
            format.to_mime_type(),
            encoded
        )))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Raw structured result of one detection workflow run.
///
/// The workflow response is treated as partially known: every nested field
/// is optional and absent substructure reads as empty, never as an error.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectionResult {
    #[serde(default)]
    pub outputs: Vec<WorkflowOutput>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkflowOutput {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predictions: Option<PredictionSet>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_image: Option<OutputImage>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PredictionSet {
    #[serde(default)]
    pub predictions: Vec<Prediction>,
}

/// A single detected symbol. Only the class label is consumed downstream;
/// confidence is carried through for display.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Prediction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub class: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f64>,
}

/// Annotated image rendered by the workflow, delivered as a base64 payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OutputImage {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
}

impl DetectionResult {
    /// Decode the annotated PNG the workflow rendered for the first output,
    /// if one was returned and its payload decodes.
    pub fn annotated_image_png(&self) -> Option<Vec<u8>> {
        let payload = self
            .outputs
            .first()?
            .output_image
            .as_ref()?
            .value
            .as_deref()?;
        match general_purpose::STANDARD.decode(payload) {
            Ok(bytes) => Some(bytes),
            Err(e) => {
                warn!("Annotated image payload did not decode: {}", e);
                None
            }
        }
    }
}

/// Client for the hosted symbol-detection workflow.
pub struct SymbolDetector {
    client: Client,
    api_key: String,
    workflow_url: String,
}

impl SymbolDetector {
    /// Create a new detector client.
    ///
    /// # Arguments
    /// * `api_key` - workflow service credential (from ROBOFLOW_API_KEY)
    /// * `workflow_url` - override for the workflow endpoint (default: production workflow)
    pub fn new(api_key: String, workflow_url: Option<String>) -> Self {
        Self {
            client: Client::new(),
            api_key,
            workflow_url: workflow_url.unwrap_or_else(|| DEFAULT_WORKFLOW_URL.to_string()),
        }
    }

    /// Create from environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        let api_key = std::env::var("ROBOFLOW_API_KEY")
            .map_err(|_| anyhow::anyhow!("ROBOFLOW_API_KEY environment variable not set"))?;
        let workflow_url = std::env::var("DETECTION_WORKFLOW_URL").ok();
        Ok(Self::new(api_key, workflow_url))
    }

    /// Run the detection workflow on one image.
    ///
    /// Issues a single POST and returns the parsed response without
    /// re-shaping. Transport errors and non-success statuses surface as one
    /// error; there is no retry.
    pub async fn detect(&self, image: &ImageReference) -> anyhow::Result<DetectionResult> {
        info!("Submitting image to detection workflow");

        let request_body = serde_json::json!({
            "api_key": self.api_key,
            "inputs": {
                "image": {
                    "type": "url",
                    "value": image.as_str()
                }
            }
        });

        let response = self
            .client
            .post(&self.workflow_url)
            .header("Content-Type", "application/json")
            .json(&request_body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await?;
            warn!("Detection workflow error: {} - {}", status, error_text);
            return Err(anyhow::anyhow!(
                "Detection workflow error: {} - {}",
                status,
                error_text
            ));
        }

        let result: DetectionResult = response.json().await?;

        info!(
            "Detection workflow returned {} output(s)",
            result.outputs.len()
        );

        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_reference_from_url() {
        let image = ImageReference::from_url("https://example.com/plan.png");
        assert_eq!(image.as_str(), "https://example.com/plan.png");
        assert!(!image.is_empty());
    }

    #[test]
    fn test_image_reference_from_png_bytes() {
        let mut buf = std::io::Cursor::new(Vec::new());
        image::RgbImage::new(2, 2)
            .write_to(&mut buf, image::ImageFormat::Png)
            .unwrap();

        let image = ImageReference::from_image_bytes(buf.get_ref()).unwrap();
        assert!(image.as_str().starts_with("data:image/png;base64,"));
    }

    #[test]
    fn test_image_reference_rejects_non_image_bytes() {
        assert!(ImageReference::from_image_bytes(b"not an image").is_err());
    }

    #[test]
    fn test_detection_result_tolerates_unknown_fields() {
        let result: DetectionResult = serde_json::from_value(serde_json::json!({
            "outputs": [{
                "predictions": {
                    "predictions": [
                        {"class": "outlet", "confidence": 0.91, "x": 10.0, "y": 20.0}
                    ],
                    "image": {"width": 640, "height": 640}
                },
                "output_image": {"type": "base64", "value": "aGVsbG8="}
            }],
            "profiler_trace": []
        }))
        .unwrap();

        assert_eq!(result.outputs.len(), 1);
        let predictions = result.outputs[0].predictions.as_ref().unwrap();
        assert_eq!(predictions.predictions[0].class.as_deref(), Some("outlet"));
    }

    #[test]
    fn test_detection_result_missing_fields_read_as_empty() {
        let result: DetectionResult = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(result.outputs.is_empty());
        assert!(result.annotated_image_png().is_none());
    }

    #[test]
    fn test_annotated_image_decodes_base64_payload() {
        let result: DetectionResult = serde_json::from_value(serde_json::json!({
            "outputs": [{
                "output_image": {"type": "base64", "value": general_purpose::STANDARD.encode(b"png bytes")}
            }]
        }))
        .unwrap();

        assert_eq!(result.annotated_image_png().unwrap(), b"png bytes");
    }

    #[test]
    fn test_annotated_image_invalid_payload_is_none() {
        let result: DetectionResult = serde_json::from_value(serde_json::json!({
            "outputs": [{
                "output_image": {"type": "base64", "value": "%%% not base64 %%%"}
            }]
        }))
        .unwrap();

        assert!(result.annotated_image_png().is_none());
    }
}
