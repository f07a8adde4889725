use async_trait::async_trait;
use quote_generator::{QuoteGenerator, QuoteResult};
use serde::{Deserialize, Serialize};
use symbol_detector::{
    count_symbol_classes, ClassTally, DetectionResult, ImageReference, SymbolDetector,
};
use tokio::sync::watch;
use tracing::{info, warn};

/// Seam over the hosted symbol-detection workflow.
#[async_trait]
pub trait DetectSymbols: Send + Sync {
    async fn detect(&self, image: &ImageReference) -> anyhow::Result<DetectionResult>;
}

/// Seam over the hosted quote-generation model.
#[async_trait]
pub trait GenerateQuote: Send + Sync {
    async fn generate_quote(&self, tally: &ClassTally) -> anyhow::Result<QuoteResult>;
}

#[async_trait]
impl DetectSymbols for SymbolDetector {
    async fn detect(&self, image: &ImageReference) -> anyhow::Result<DetectionResult> {
        SymbolDetector::detect(self, image).await
    }
}

#[async_trait]
impl GenerateQuote for QuoteGenerator {
    async fn generate_quote(&self, tally: &ClassTally) -> anyhow::Result<QuoteResult> {
        QuoteGenerator::generate_quote(self, tally).await
    }
}

/// Stage of one detect-to-quote run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStage {
    Idle,
    Detecting,
    Tallying,
    Quoting,
    Done,
    Failed,
}

impl RunStage {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Detecting | Self::Tallying | Self::Quoting)
    }
}

/// Observable progress of the current run. Written only by the
/// orchestrator; everyone else reads snapshots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunState {
    pub stage: RunStage,
    pub label: String,
    pub percent: u8,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            stage: RunStage::Idle,
            label: "Idle".to_string(),
            percent: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NoticeLevel {
    Info,
    Success,
    Error,
}

/// Transient user-facing message, queued by the orchestrator and drained by
/// the presentation layer (toast semantics).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notice {
    pub level: NoticeLevel,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Please upload an image")]
    NoImageSelected,
    #[error("A detection run is already in progress")]
    RunInProgress,
    #[error("Symbol detection failed")]
    Detection(#[source] anyhow::Error),
    #[error("Quote generation failed")]
    Quote(#[source] anyhow::Error),
}

/// Drives one image through detect, tally and quote in strict order.
///
/// Exactly one run may be in flight at a time; a second trigger is rejected
/// with a notice, never queued. A failed quote stage leaves the already
/// computed tally readable.
pub struct QuoteOrchestrator<D, Q> {
    detector: D,
    quoter: Q,
    image: Option<ImageReference>,
    state: RunState,
    detection: Option<DetectionResult>,
    tally: Option<ClassTally>,
    quote: Option<QuoteResult>,
    notices: Vec<Notice>,
    progress: watch::Sender<RunState>,
}

impl<D, Q> QuoteOrchestrator<D, Q>
where
    D: DetectSymbols,
    Q: GenerateQuote,
{
    pub fn new(detector: D, quoter: Q) -> Self {
        let (progress, _) = watch::channel(RunState::default());
        Self {
            detector,
            quoter,
            image: None,
            state: RunState::default(),
            detection: None,
            tally: None,
            quote: None,
            notices: Vec::new(),
            progress,
        }
    }

    /// Select the image for the next run, discarding any previous results.
    ///
    /// Rejected with a notice while a run is in flight.
    pub fn select_image(&mut self, image: ImageReference) {
        if self.state.stage.is_in_flight() {
            self.push_notice(
                NoticeLevel::Info,
                "Please wait for the previous detection to complete",
            );
            return;
        }

        self.image = Some(image);
        self.detection = None;
        self.tally = None;
        self.quote = None;
        self.set_state(RunStage::Idle, "Image uploaded", 0);
    }

    pub fn image(&self) -> Option<&ImageReference> {
        self.image.as_ref()
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    /// Snapshot channel for progress observers; does not require holding a
    /// reference to the orchestrator while a run is in flight.
    pub fn watch_progress(&self) -> watch::Receiver<RunState> {
        self.progress.subscribe()
    }

    pub fn detection(&self) -> Option<&DetectionResult> {
        self.detection.as_ref()
    }

    pub fn tally(&self) -> Option<&ClassTally> {
        self.tally.as_ref()
    }

    pub fn quote(&self) -> Option<&QuoteResult> {
        self.quote.as_ref()
    }

    pub fn notices(&self) -> &[Notice] {
        &self.notices
    }

    pub fn drain_notices(&mut self) -> Vec<Notice> {
        std::mem::take(&mut self.notices)
    }

    /// Run the full pipeline on the selected image.
    ///
    /// Guards: an image must be selected and no run may be in flight; a
    /// violated guard emits exactly one notice and changes nothing else.
    pub async fn run(&mut self) -> Result<(), PipelineError> {
        if self.state.stage.is_in_flight() {
            let error = PipelineError::RunInProgress;
            self.push_notice(NoticeLevel::Info, error.to_string());
            return Err(error);
        }

        let Some(image) = self.image.clone() else {
            let error = PipelineError::NoImageSelected;
            self.push_notice(NoticeLevel::Error, error.to_string());
            return Err(error);
        };

        self.detection = None;
        self.tally = None;
        self.quote = None;

        self.enter_stage(RunStage::Detecting, "Detecting Symbols...", 25);
        let detection = match self.detector.detect(&image).await {
            Ok(detection) => detection,
            Err(e) => return Err(self.fail(PipelineError::Detection(e))),
        };
        info!(
            "Detection complete: {} output(s)",
            detection.outputs.len()
        );

        self.enter_stage(RunStage::Tallying, "Counting Components...", 50);
        let tally = count_symbol_classes(&detection);
        info!("Tallied {} symbol class(es)", tally.len());
        self.detection = Some(detection);
        self.tally = Some(tally.clone());

        self.enter_stage(RunStage::Quoting, "Generating Quote...", 75);
        let quote = match self.quoter.generate_quote(&tally).await {
            Ok(quote) => quote,
            Err(e) => return Err(self.fail(PipelineError::Quote(e))),
        };
        self.quote = Some(quote);

        self.set_state(RunStage::Done, "Quote Generated", 100);
        self.push_notice(NoticeLevel::Success, "Quote Generated");
        Ok(())
    }

    fn enter_stage(&mut self, stage: RunStage, label: &str, percent: u8) {
        info!("Pipeline stage: {}", label);
        self.set_state(stage, label, percent);
        self.push_notice(NoticeLevel::Info, label);
    }

    fn set_state(&mut self, stage: RunStage, label: &str, percent: u8) {
        self.state = RunState {
            stage,
            label: label.to_string(),
            percent,
        };
        self.progress.send_replace(self.state.clone());
    }

    fn fail(&mut self, error: PipelineError) -> PipelineError {
        warn!("Pipeline run failed: {:?}", error);
        self.state.stage = RunStage::Failed;
        self.state.label = error.to_string();
        self.progress.send_replace(self.state.clone());
        self.push_notice(NoticeLevel::Error, error.to_string());
        error
    }

    fn push_notice(&mut self, level: NoticeLevel, message: impl Into<String>) {
        self.notices.push(Notice {
            level,
            message: message.into(),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct StubDetector {
        response: Result<serde_json::Value, String>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl DetectSymbols for StubDetector {
        async fn detect(&self, _image: &ImageReference) -> anyhow::Result<DetectionResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(value) => Ok(serde_json::from_value(value.clone()).unwrap()),
                Err(message) => Err(anyhow::anyhow!("{}", message)),
            }
        }
    }

    struct StubQuoter {
        response: Result<serde_json::Value, String>,
        calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl GenerateQuote for StubQuoter {
        async fn generate_quote(&self, _tally: &ClassTally) -> anyhow::Result<QuoteResult> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            match &self.response {
                Ok(value) => Ok(serde_json::from_value(value.clone()).unwrap()),
                Err(message) => Err(anyhow::anyhow!("{}", message)),
            }
        }
    }

    struct Harness {
        orchestrator: QuoteOrchestrator<StubDetector, StubQuoter>,
        detector_calls: Arc<AtomicUsize>,
        quoter_calls: Arc<AtomicUsize>,
    }

    fn harness(
        detection: Result<serde_json::Value, String>,
        quote: Result<serde_json::Value, String>,
    ) -> Harness {
        let detector_calls = Arc::new(AtomicUsize::new(0));
        let quoter_calls = Arc::new(AtomicUsize::new(0));

        let orchestrator = QuoteOrchestrator::new(
            StubDetector {
                response: detection,
                calls: detector_calls.clone(),
            },
            StubQuoter {
                response: quote,
                calls: quoter_calls.clone(),
            },
        );

        Harness {
            orchestrator,
            detector_calls,
            quoter_calls,
        }
    }

    fn sample_detection() -> serde_json::Value {
        json!({
            "outputs": [{
                "predictions": {
                    "predictions": [
                        {"class": "outlet"},
                        {"class": "outlet"},
                        {"class": "switch"}
                    ]
                }
            }]
        })
    }

    fn sample_quote() -> serde_json::Value {
        json!({
            "electrical_specifications": {
                "components": [{
                    "name": "Duplex convenience outlet",
                    "quantity": 2,
                    "product_url": "https://store.example.ph/outlet",
                    "product_price": 150,
                    "class_name": "outlet",
                    "total": 300
                }],
                "total_quote": 300
            }
        })
    }

    fn error_notices(orchestrator: &QuoteOrchestrator<StubDetector, StubQuoter>) -> usize {
        orchestrator
            .notices()
            .iter()
            .filter(|n| n.level == NoticeLevel::Error)
            .count()
    }

    #[tokio::test]
    async fn test_successful_run_reaches_done() {
        let mut h = harness(Ok(sample_detection()), Ok(sample_quote()));
        h.orchestrator
            .select_image(ImageReference::from_url("https://example.com/plan.png"));

        h.orchestrator.run().await.unwrap();

        assert_eq!(h.orchestrator.state().stage, RunStage::Done);
        assert_eq!(h.orchestrator.state().percent, 100);

        let tally = h.orchestrator.tally().unwrap();
        assert_eq!(tally["outlet"], 2);
        assert_eq!(tally["switch"], 1);

        let quote = h.orchestrator.quote().unwrap();
        let spec = quote.electrical_specifications.as_ref().unwrap();
        assert_eq!(spec.total_quote, Some(300));

        assert_eq!(h.detector_calls.load(Ordering::SeqCst), 1);
        assert_eq!(h.quoter_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stage_labels_announced_in_order() {
        let mut h = harness(Ok(sample_detection()), Ok(sample_quote()));
        h.orchestrator
            .select_image(ImageReference::from_url("https://example.com/plan.png"));

        h.orchestrator.run().await.unwrap();

        let messages: Vec<&str> = h
            .orchestrator
            .notices()
            .iter()
            .map(|n| n.message.as_str())
            .collect();
        assert_eq!(
            messages,
            vec![
                "Detecting Symbols...",
                "Counting Components...",
                "Generating Quote...",
                "Quote Generated"
            ]
        );
    }

    #[tokio::test]
    async fn test_run_without_image_stays_idle() {
        let mut h = harness(Ok(sample_detection()), Ok(sample_quote()));

        let error = h.orchestrator.run().await.unwrap_err();

        assert!(matches!(error, PipelineError::NoImageSelected));
        assert_eq!(h.orchestrator.state().stage, RunStage::Idle);
        assert_eq!(h.orchestrator.notices().len(), 1);
        assert_eq!(h.detector_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_run_while_in_flight_is_rejected() {
        let mut h = harness(Ok(sample_detection()), Ok(sample_quote()));
        h.orchestrator
            .select_image(ImageReference::from_url("https://example.com/plan.png"));
        h.orchestrator.state.stage = RunStage::Detecting;

        let error = h.orchestrator.run().await.unwrap_err();

        assert!(matches!(error, PipelineError::RunInProgress));
        assert_eq!(h.orchestrator.notices().len(), 1);
        assert_eq!(h.detector_calls.load(Ordering::SeqCst), 0);
        assert_eq!(h.quoter_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_detection_failure_produces_no_results() {
        let mut h = harness(Err("connection refused".to_string()), Ok(sample_quote()));
        h.orchestrator
            .select_image(ImageReference::from_url("https://example.com/plan.png"));

        let error = h.orchestrator.run().await.unwrap_err();

        assert!(matches!(error, PipelineError::Detection(_)));
        assert_eq!(h.orchestrator.state().stage, RunStage::Failed);
        assert_eq!(h.orchestrator.state().percent, 25);
        assert!(h.orchestrator.tally().is_none());
        assert!(h.orchestrator.quote().is_none());
        assert_eq!(error_notices(&h.orchestrator), 1);
        assert_eq!(h.quoter_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_quote_failure_keeps_tally_readable() {
        let mut h = harness(Ok(sample_detection()), Err("rate limited".to_string()));
        h.orchestrator
            .select_image(ImageReference::from_url("https://example.com/plan.png"));

        let error = h.orchestrator.run().await.unwrap_err();

        assert!(matches!(error, PipelineError::Quote(_)));
        assert_eq!(h.orchestrator.state().stage, RunStage::Failed);
        assert_eq!(h.orchestrator.state().percent, 75);
        assert_eq!(h.orchestrator.tally().unwrap()["outlet"], 2);
        assert!(h.orchestrator.quote().is_none());
        assert_eq!(error_notices(&h.orchestrator), 1);
    }

    #[tokio::test]
    async fn test_select_image_during_run_is_rejected() {
        let mut h = harness(Ok(sample_detection()), Ok(sample_quote()));
        h.orchestrator
            .select_image(ImageReference::from_url("https://example.com/first.png"));
        h.orchestrator.state.stage = RunStage::Quoting;

        h.orchestrator
            .select_image(ImageReference::from_url("https://example.com/second.png"));

        assert_eq!(
            h.orchestrator.image().unwrap().as_str(),
            "https://example.com/first.png"
        );
        assert_eq!(h.orchestrator.notices().len(), 1);
    }

    #[tokio::test]
    async fn test_select_image_resets_previous_results() {
        let mut h = harness(Ok(sample_detection()), Ok(sample_quote()));
        h.orchestrator
            .select_image(ImageReference::from_url("https://example.com/plan.png"));
        h.orchestrator.run().await.unwrap();
        assert!(h.orchestrator.tally().is_some());

        h.orchestrator
            .select_image(ImageReference::from_url("https://example.com/other.png"));

        assert_eq!(h.orchestrator.state().stage, RunStage::Idle);
        assert!(h.orchestrator.detection().is_none());
        assert!(h.orchestrator.tally().is_none());
        assert!(h.orchestrator.quote().is_none());
    }

    #[tokio::test]
    async fn test_progress_watch_tracks_the_run() {
        let mut h = harness(Ok(sample_detection()), Ok(sample_quote()));
        let progress = h.orchestrator.watch_progress();
        assert_eq!(progress.borrow().stage, RunStage::Idle);

        h.orchestrator
            .select_image(ImageReference::from_url("https://example.com/plan.png"));
        h.orchestrator.run().await.unwrap();

        assert_eq!(progress.borrow().stage, RunStage::Done);
        assert_eq!(progress.borrow().percent, 100);
    }

    #[tokio::test]
    async fn test_failed_run_can_be_retriggered() {
        let mut h = harness(Err("boom".to_string()), Ok(sample_quote()));
        h.orchestrator
            .select_image(ImageReference::from_url("https://example.com/plan.png"));

        h.orchestrator.run().await.unwrap_err();
        assert_eq!(h.orchestrator.state().stage, RunStage::Failed);

        // Terminal stages accept a new trigger without re-selecting an image.
        h.orchestrator.run().await.unwrap_err();
        assert_eq!(h.detector_calls.load(Ordering::SeqCst), 2);
    }
}
