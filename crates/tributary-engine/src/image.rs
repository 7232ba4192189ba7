use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, bail, Result};
use serde_json::{json, Value};
use tracing::{debug, info, warn};
use tributary_contracts::events::{EventEmitter, PipeEvent, StatusLevel};
use tributary_contracts::image::{calculate_dimensions, parse_settings_stepwise, PromptSettings};
use tributary_contracts::messages::{PipeOutput, PipeRequest};
use tributary_contracts::valves::ImageValves;

use crate::status::emit_best_effort;
use crate::transport::{PredictionsApi, ReplicateHttpApi};
use crate::{error_chain_text, Pipe};

pub const MISSING_PROMPT_NOTICE: &str = "Please provide a prompt for image generation.";

/// Wait 2s, check, wait 3s, check, wait 3s, final check.
pub const DEFAULT_POLL_SCHEDULE: [Duration; 3] = [
    Duration::from_secs(2),
    Duration::from_secs(3),
    Duration::from_secs(3),
];

/// Generates images with a FLUX LoRA hosted on Replicate.
pub struct ImagePipe {
    valves: ImageValves,
    api: Arc<dyn PredictionsApi>,
    poll_schedule: Vec<Duration>,
}

#[derive(Debug, Clone, PartialEq)]
struct GenerationPlan {
    settings: PromptSettings,
    width: u32,
    height: u32,
    output_format: &'static str,
}

#[derive(Debug, Clone, PartialEq)]
struct CompletedPrediction {
    id: Option<String>,
    urls: Vec<String>,
    predict_time: Option<f64>,
}

impl ImagePipe {
    pub fn new(valves: ImageValves) -> Result<Self> {
        Ok(Self::with_api(valves, Arc::new(ReplicateHttpApi::new()?)))
    }

    pub fn with_api(valves: ImageValves, api: Arc<dyn PredictionsApi>) -> Self {
        Self {
            valves,
            api,
            poll_schedule: DEFAULT_POLL_SCHEDULE.to_vec(),
        }
    }

    pub fn with_poll_schedule(mut self, schedule: Vec<Duration>) -> Self {
        self.poll_schedule = schedule;
        self
    }

    fn plan(&self, text: &str) -> GenerationPlan {
        let settings = parse_settings_stepwise(text, self.valves.default_num_outputs);
        let (width, height) = calculate_dimensions(
            settings.aspect_ratio_or_square(),
            settings.num_outputs,
            self.valves.max_total_megapixels,
            self.valves.base_dimension,
        );
        let output_format = normalize_output_format(&self.valves.output_format);
        GenerationPlan {
            settings,
            width,
            height,
            output_format,
        }
    }

    fn prediction_payload(&self, plan: &GenerationPlan) -> Value {
        let trigger = self.valves.trigger_word.trim();
        let prompt = if trigger.is_empty() {
            plan.settings.prompt.clone()
        } else {
            format!("{trigger} {}", plan.settings.prompt)
        };
        json!({
            "version": self.valves.model_version,
            "input": {
                "width": plan.width,
                "height": plan.height,
                "aspect_ratio": "custom",
                "num_outputs": plan.settings.num_outputs,
                "output_format": plan.output_format,
                "prompt": prompt,
                "model": "dev",
                "lora_scale": 1,
                "guidance_scale": 3.5,
                "output_quality": 90,
                "prompt_strength": 0.8,
                "extra_lora_scale": 1,
                "num_inference_steps": 28,
            }
        })
    }

    fn generate(&self, plan: &GenerationPlan, emitter: &dyn EventEmitter) -> Result<()> {
        let token = self.valves.replicate_api_token.trim();
        if token.is_empty() {
            bail!("REPLICATE_API_TOKEN not set");
        }
        if self.valves.model_version.trim().is_empty() {
            bail!("Replicate model version not configured");
        }

        emit_best_effort(
            emitter,
            PipeEvent::status(
                StatusLevel::Info,
                format!(
                    "Generating {} image(s) at {}x{}...",
                    plan.settings.num_outputs, plan.width, plan.height
                ),
                false,
            ),
        );

        let payload = self.prediction_payload(plan);
        let url = self.valves.predictions_url.as_str();
        info!(
            url,
            width = plan.width,
            height = plan.height,
            num_outputs = plan.settings.num_outputs,
            "submitting prediction"
        );
        let prediction = self
            .api
            .create_prediction(url, token, &payload, self.valves.request_timeout())?
            .json_or_error("Replicate")?;

        let prediction = match prediction_status(&prediction).as_str() {
            "succeeded" => prediction,
            "failed" | "canceled" => bail!(prediction_failure_text(&prediction)),
            _ => {
                let poll_url = prediction
                    .get("urls")
                    .and_then(Value::as_object)
                    .and_then(|urls| urls.get("get"))
                    .and_then(Value::as_str)
                    .map(str::trim)
                    .filter(|value| !value.is_empty())
                    .ok_or_else(|| anyhow!("Replicate prediction missing poll URL"))?
                    .to_string();
                self.wait_for_prediction(&poll_url, token)?
            }
        };

        let completed = completed_prediction(&prediction)?;
        for (idx, image_url) in completed.urls.iter().enumerate() {
            emit_best_effort(
                emitter,
                PipeEvent::message(format!("![Generated image {}]({image_url})", idx + 1)),
            );
        }
        emit_best_effort(
            emitter,
            PipeEvent::message(metadata_message(plan, &completed)),
        );
        emit_best_effort(
            emitter,
            PipeEvent::status(StatusLevel::Info, "Image generation complete", true),
        );
        Ok(())
    }

    fn wait_for_prediction(&self, poll_url: &str, token: &str) -> Result<Value> {
        for (attempt, delay) in self.poll_schedule.iter().enumerate() {
            thread::sleep(*delay);
            let prediction = self
                .api
                .get_prediction(poll_url, token, self.valves.request_timeout())?
                .json_or_error("Replicate poll")?;
            let status = prediction_status(&prediction);
            debug!(attempt = attempt + 1, status = %status, "prediction poll");
            match status.as_str() {
                "succeeded" => return Ok(prediction),
                "failed" | "canceled" => bail!(prediction_failure_text(&prediction)),
                _ => {}
            }
        }
        bail!("Image generation did not complete in time")
    }
}

impl Pipe for ImagePipe {
    fn id(&self) -> &str {
        "flux_replicate_pipe"
    }

    fn name(&self) -> &str {
        "FLUX Replicate Pipe"
    }

    fn pipe(&self, request: PipeRequest, emitter: Arc<dyn EventEmitter>) -> PipeOutput {
        let text = request.body.last_content().unwrap_or_default();
        let plan = self.plan(&text);
        if plan.settings.prompt.trim().is_empty() {
            emit_best_effort(
                emitter.as_ref(),
                PipeEvent::status(StatusLevel::Error, MISSING_PROMPT_NOTICE, true),
            );
            return PipeOutput::Chunks(vec![MISSING_PROMPT_NOTICE.to_string()]);
        }

        match self.generate(&plan, emitter.as_ref()) {
            Ok(()) => PipeOutput::Chunks(Vec::new()),
            Err(err) => {
                let text = format!("Error: {}", error_chain_text(&err, 1024));
                warn!(error = %text, "image generation failed");
                emit_best_effort(
                    emitter.as_ref(),
                    PipeEvent::status(StatusLevel::Error, text.clone(), true),
                );
                PipeOutput::Chunks(vec![text])
            }
        }
    }
}

fn prediction_status(prediction: &Value) -> String {
    prediction
        .get("status")
        .and_then(Value::as_str)
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default()
}

fn prediction_failure_text(prediction: &Value) -> String {
    let status = prediction_status(prediction);
    match prediction
        .get("error")
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
    {
        Some(reason) => format!("Image generation {status}: {reason}"),
        None => format!("Image generation {status}"),
    }
}

fn completed_prediction(prediction: &Value) -> Result<CompletedPrediction> {
    let mut urls = Vec::new();
    if let Some(output) = prediction.get("output") {
        extract_output_urls(output, &mut urls);
    }
    if urls.is_empty() {
        bail!("Replicate response returned no image URLs");
    }
    Ok(CompletedPrediction {
        id: prediction
            .get("id")
            .and_then(Value::as_str)
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string),
        urls,
        predict_time: prediction
            .get("metrics")
            .and_then(|metrics| metrics.get("predict_time"))
            .and_then(Value::as_f64),
    })
}

fn extract_output_urls(value: &Value, out: &mut Vec<String>) {
    match value {
        Value::String(url) => {
            let trimmed = url.trim();
            if trimmed.starts_with("http") && !out.iter().any(|existing| existing == trimmed) {
                out.push(trimmed.to_string());
            }
        }
        Value::Array(rows) => {
            for row in rows {
                extract_output_urls(row, out);
            }
        }
        Value::Object(obj) => {
            if let Some(url) = obj.get("url") {
                extract_output_urls(url, out);
            }
        }
        _ => {}
    }
}

fn metadata_message(plan: &GenerationPlan, completed: &CompletedPrediction) -> String {
    let mut lines = vec![
        format!("**Prompt:** {}", plan.settings.prompt),
        format!("**Aspect ratio:** {}", plan.settings.aspect_ratio_label()),
        format!("**Size:** {}x{}", plan.width, plan.height),
        format!("**Format:** {}", plan.output_format),
        format!("**Images:** {}", completed.urls.len()),
    ];
    if let Some(id) = completed.id.as_deref() {
        lines.push(format!("**Prediction:** {id}"));
    }
    if let Some(seconds) = completed.predict_time {
        lines.push(format!("**Generation time:** {seconds:.1}s"));
    }
    lines.join("\n")
}

/// Maps the configured format onto what the model accepts. Unknown values fall
/// back to webp.
pub fn normalize_output_format(raw: &str) -> &'static str {
    let mut lowered = raw.trim().to_ascii_lowercase();
    if let Some(value) = lowered.strip_prefix("image/") {
        lowered = value.to_string();
    }
    match lowered.as_str() {
        "webp" => "webp",
        "jpg" | "jpeg" => "jpg",
        "png" => "png",
        _ => {
            if !lowered.is_empty() {
                warn!(output_format = %raw, "unsupported output format; using webp");
            }
            "webp"
        }
    }
}
