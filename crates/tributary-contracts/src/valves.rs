use std::env;
use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub const DEFAULT_REPLICATE_PREDICTIONS_URL: &str = "https://api.replicate.com/v1/predictions";
pub const DEFAULT_BASE_DIMENSION: u32 = 1440;
pub const MAX_NUM_OUTPUTS: u32 = 4;

/// Valves for the n8n workflow pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowValves {
    pub n8n_url: String,
    pub n8n_status_url: String,
    pub n8n_bearer_token: String,
    pub input_field: String,
    pub response_field: String,
    /// Seconds between status-webhook polls.
    pub status_poll_interval: f64,
    pub request_timeout: f64,
    pub status_timeout: f64,
    /// Minimum seconds between two non-terminal status events.
    pub emit_interval: f64,
    pub enable_status_indicator: bool,
}

impl Default for WorkflowValves {
    fn default() -> Self {
        Self {
            n8n_url: "https://n8n.example.com/webhook/chat".to_string(),
            n8n_status_url: "https://n8n.example.com/webhook/chat-status".to_string(),
            n8n_bearer_token: String::new(),
            input_field: "chatInput".to_string(),
            response_field: "output".to_string(),
            status_poll_interval: 2.0,
            request_timeout: 120.0,
            status_timeout: 10.0,
            emit_interval: 2.0,
            enable_status_indicator: true,
        }
    }
}

impl WorkflowValves {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut valves: Self = read_valves_file(path)?;
        valves.apply_overrides(non_empty_env);
        Ok(valves.normalized())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_string(&mut self.n8n_url, lookup("N8N_URL"));
        override_string(&mut self.n8n_status_url, lookup("N8N_STATUS_URL"));
        override_string(&mut self.n8n_bearer_token, lookup("N8N_BEARER_TOKEN"));
        override_string(&mut self.input_field, lookup("N8N_INPUT_FIELD"));
        override_string(&mut self.response_field, lookup("N8N_RESPONSE_FIELD"));
        override_f64(
            &mut self.status_poll_interval,
            lookup("N8N_STATUS_POLL_INTERVAL"),
        );
        override_f64(&mut self.request_timeout, lookup("N8N_REQUEST_TIMEOUT"));
        override_f64(&mut self.status_timeout, lookup("N8N_STATUS_TIMEOUT"));
        override_f64(&mut self.emit_interval, lookup("N8N_EMIT_INTERVAL"));
        if let Some(flag) = lookup("N8N_ENABLE_STATUS_INDICATOR").and_then(|raw| parse_bool(&raw))
        {
            self.enable_status_indicator = flag;
        }
    }

    pub fn normalized(mut self) -> Self {
        self.status_poll_interval = clamp_finite(self.status_poll_interval, 2.0, 0.05, 60.0);
        self.request_timeout = clamp_finite(self.request_timeout, 120.0, 1.0, 600.0);
        self.status_timeout = clamp_finite(self.status_timeout, 10.0, 1.0, 600.0);
        self.emit_interval = clamp_finite(self.emit_interval, 2.0, 0.0, 600.0);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs_f64(self.status_poll_interval)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout)
    }

    pub fn status_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.status_timeout)
    }

    pub fn emit_interval(&self) -> Duration {
        Duration::from_secs_f64(self.emit_interval)
    }
}

/// Valves for the Replicate FLUX image pipe.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ImageValves {
    pub replicate_api_token: String,
    pub predictions_url: String,
    pub model_version: String,
    /// Prepended to every prompt so the LoRA activates.
    pub trigger_word: String,
    pub output_format: String,
    pub default_num_outputs: u32,
    pub max_total_megapixels: f64,
    pub base_dimension: u32,
    pub request_timeout: f64,
}

impl Default for ImageValves {
    fn default() -> Self {
        Self {
            replicate_api_token: String::new(),
            predictions_url: DEFAULT_REPLICATE_PREDICTIONS_URL.to_string(),
            model_version: String::new(),
            trigger_word: "TOK".to_string(),
            output_format: "webp".to_string(),
            default_num_outputs: 1,
            max_total_megapixels: 4.7,
            base_dimension: DEFAULT_BASE_DIMENSION,
            request_timeout: 60.0,
        }
    }
}

impl ImageValves {
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut valves: Self = read_valves_file(path)?;
        valves.apply_overrides(non_empty_env);
        Ok(valves.normalized())
    }

    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        override_string(
            &mut self.replicate_api_token,
            lookup("REPLICATE_API_TOKEN").or_else(|| lookup("REPLICATE_API_KEY")),
        );
        if let Some(base) = lookup("REPLICATE_API_BASE") {
            self.predictions_url = format!("{}/predictions", base.trim().trim_end_matches('/'));
        }
        override_string(&mut self.model_version, lookup("REPLICATE_MODEL_VERSION"));
        override_string(&mut self.trigger_word, lookup("REPLICATE_TRIGGER_WORD"));
        override_string(&mut self.output_format, lookup("REPLICATE_OUTPUT_FORMAT"));
        if let Some(count) = lookup("REPLICATE_NUM_OUTPUTS").and_then(|raw| raw.trim().parse().ok())
        {
            self.default_num_outputs = count;
        }
        override_f64(
            &mut self.max_total_megapixels,
            lookup("REPLICATE_MAX_TOTAL_MP"),
        );
        if let Some(base) = lookup("REPLICATE_BASE_DIMENSION").and_then(|raw| raw.trim().parse().ok())
        {
            self.base_dimension = base;
        }
        override_f64(&mut self.request_timeout, lookup("REPLICATE_REQUEST_TIMEOUT"));
    }

    pub fn normalized(mut self) -> Self {
        self.default_num_outputs = self.default_num_outputs.clamp(1, MAX_NUM_OUTPUTS);
        self.max_total_megapixels = clamp_finite(self.max_total_megapixels, 4.7, 0.1, 64.0);
        self.base_dimension = self.base_dimension.clamp(64, 4096);
        self.request_timeout = clamp_finite(self.request_timeout, 60.0, 1.0, 600.0);
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout)
    }
}

fn read_valves_file<T>(path: Option<&Path>) -> Result<T>
where
    T: Default + for<'de> Deserialize<'de>,
{
    let Some(path) = path else {
        return Ok(T::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("failed reading valves file {}", path.display()))?;
    serde_json::from_str(&raw)
        .with_context(|| format!("invalid valves JSON in {}", path.display()))
}

pub fn non_empty_env(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn override_string(target: &mut String, value: Option<String>) {
    if let Some(value) = value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
    {
        *target = value;
    }
}

fn override_f64(target: &mut f64, value: Option<String>) {
    if let Some(parsed) = value.and_then(|raw| raw.trim().parse::<f64>().ok()) {
        *target = parsed;
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn clamp_finite(value: f64, default: f64, min: f64, max: f64) -> f64 {
    if value.is_finite() {
        value.clamp(min, max)
    } else {
        default
    }
}
