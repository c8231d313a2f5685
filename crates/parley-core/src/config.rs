use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::error::{ParleyError, Result};

/// Context sizes offered to the user.
pub const CONTEXT_SIZE_OPTIONS: [u32; 4] = [8192, 16384, 24576, 32768];
/// VRAM budgets in MB.
pub const VRAM_OPTIONS: [u32; 12] = [
    1024, 2048, 3072, 4096, 6144, 8192, 10240, 12288, 16384, 20480, 24576, 32768,
];
pub const BATCH_OPTIONS: [u32; 6] = [128, 256, 512, 1024, 2048, 4096];
pub const TEMPERATURE_OPTIONS: [f32; 6] = [0.1, 0.33, 0.5, 0.66, 0.75, 1.0];
pub const REPEAT_PENALTY_OPTIONS: [f32; 6] = [1.0, 1.1, 1.2, 1.3, 1.4, 1.5];
pub const HISTORY_SLOT_OPTIONS: [usize; 5] = [4, 8, 10, 12, 16];
pub const ATTACH_SLOT_OPTIONS: [usize; 5] = [2, 4, 6, 8, 10];

/// Top-level configuration for the Parley application.
///
/// Loaded from `~/.parley/config.toml` by default. Missing sections and keys
/// fall back to built-in defaults; unknown keys are ignored.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParleyConfig {
    #[serde(default)]
    pub general: GeneralConfig,
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub backend: BackendConfig,
    #[serde(default)]
    pub roleplay: RoleplayConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
}

impl ParleyConfig {
    /// Load configuration from a TOML file.
    ///
    /// Returns an error if the file cannot be read or parsed. Values outside
    /// the offered options are replaced by defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ParleyConfig = toml::from_str(&content)?;
        config.normalize();
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Load configuration from a TOML file, falling back to defaults if the
    /// file does not exist or cannot be parsed.
    pub fn load_or_default(path: &Path) -> Self {
        match Self::load(path) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "Failed to load config from {}: {}. Using defaults.",
                    path.display(),
                    e
                );
                Self::default()
            }
        }
    }

    /// Save the current configuration to a TOML file.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        info!("Configuration saved to {}", path.display());
        Ok(())
    }

    /// Replace values that are not among the offered options with defaults.
    pub fn normalize(&mut self) {
        let defaults = ModelConfig::default();
        let model = &mut self.model;
        if !CONTEXT_SIZE_OPTIONS.contains(&model.context_size) {
            warn!(value = model.context_size, "context_size not offered, using default");
            model.context_size = defaults.context_size;
        }
        if !VRAM_OPTIONS.contains(&model.vram_size) {
            warn!(value = model.vram_size, "vram_size not offered, using default");
            model.vram_size = defaults.vram_size;
        }
        if !BATCH_OPTIONS.contains(&model.batch_size) {
            warn!(value = model.batch_size, "batch_size not offered, using default");
            model.batch_size = defaults.batch_size;
        }
        if !contains_float(&TEMPERATURE_OPTIONS, model.temperature) {
            warn!(value = model.temperature, "temperature not offered, using default");
            model.temperature = defaults.temperature;
        }
        if !contains_float(&REPEAT_PENALTY_OPTIONS, model.repeat_penalty) {
            warn!(value = model.repeat_penalty, "repeat_penalty not offered, using default");
            model.repeat_penalty = defaults.repeat_penalty;
        }
        if !HISTORY_SLOT_OPTIONS.contains(&model.max_history_slots) {
            warn!(
                value = model.max_history_slots,
                "max_history_slots not offered, using first option"
            );
            model.max_history_slots = HISTORY_SLOT_OPTIONS[0];
        }
        if !ATTACH_SLOT_OPTIONS.contains(&model.max_attach_slots) {
            warn!(
                value = model.max_attach_slots,
                "max_attach_slots not offered, using first option"
            );
            model.max_attach_slots = ATTACH_SLOT_OPTIONS[0];
        }

        let retrieval_defaults = RetrievalConfig::default();
        if self.retrieval.chunk_size_divider == 0 {
            self.retrieval.chunk_size_divider = retrieval_defaults.chunk_size_divider;
        }
        if self.retrieval.chunk_overlap_divider == 0 {
            self.retrieval.chunk_overlap_divider = retrieval_defaults.chunk_overlap_divider;
        }
        if self.retrieval.top_k == 0 {
            self.retrieval.top_k = retrieval_defaults.top_k;
        }
        if self.pipeline.token_queue_capacity == 0 {
            self.pipeline.token_queue_capacity = PipelineConfig::default().token_queue_capacity;
        }
    }

    /// Update one named setting.
    ///
    /// Returns `Ok(true)` when the change only takes effect after the model is
    /// reloaded (context size, GPU layers, VRAM, model folder or name).
    pub fn apply_setting(&mut self, key: &str, value: &str) -> Result<bool> {
        let value = value.trim();
        let mut reload_required = false;
        match key {
            "temperature" => {
                self.model.temperature = offered_float(key, value, &TEMPERATURE_OPTIONS)?
            }
            "repeat_penalty" => {
                self.model.repeat_penalty = offered_float(key, value, &REPEAT_PENALTY_OPTIONS)?
            }
            "context_size" => {
                self.model.context_size = offered(key, value, &CONTEXT_SIZE_OPTIONS)?;
                reload_required = true;
            }
            "n_gpu_layers" => {
                self.model.gpu_layers = parse_value(key, value)?;
                reload_required = true;
            }
            "vram_size" => {
                self.model.vram_size = offered(key, value, &VRAM_OPTIONS)?;
                reload_required = true;
            }
            "dynamic_gpu_layers" => {
                self.model.dynamic_gpu_layers = parse_value(key, value)?;
                reload_required = true;
            }
            "batch_size" | "n_batch" => {
                self.model.batch_size = offered(key, value, &BATCH_OPTIONS)?
            }
            "mmap" => self.model.mmap = parse_value(key, value)?,
            "mlock" => self.model.mlock = parse_value(key, value)?,
            "stream_output" => self.model.stream_output = parse_value(key, value)?,
            "afterthought_time" => self.model.afterthought_time = parse_value(key, value)?,
            "model_dir" | "model_folder" => {
                self.model.model_dir = value.to_string();
                reload_required = true;
            }
            "model_name" => {
                self.model.model_name = value.to_string();
                reload_required = true;
            }
            "max_history_slots" => {
                self.model.max_history_slots = offered(key, value, &HISTORY_SLOT_OPTIONS)?
            }
            "max_attach_slots" => {
                self.model.max_attach_slots = offered(key, value, &ATTACH_SLOT_OPTIONS)?
            }
            "llama_bin_path" => self.backend.llama_bin_path = value.to_string(),
            "backend_type" => self.backend.backend_type = value.to_string(),
            "rp_location" | "location" => self.roleplay.location = value.to_string(),
            "user_name" => self.roleplay.user_name = value.to_string(),
            "user_role" => self.roleplay.user_role = value.to_string(),
            "ai_npc" => self.roleplay.ai_npc = value.to_string(),
            "ai_npc_role" => self.roleplay.ai_npc_role = value.to_string(),
            _ => return Err(ParleyError::Config(format!("unknown setting '{key}'"))),
        }
        info!(key, value, reload_required, "setting updated");
        Ok(reload_required)
    }
}

fn contains_float(options: &[f32], value: f32) -> bool {
    options.iter().any(|o| (o - value).abs() < 1e-4)
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse::<T>()
        .map_err(|_| ParleyError::Config(format!("invalid value '{value}' for '{key}'")))
}

fn not_offered<T: std::fmt::Display>(key: &str, value: &str, options: &[T]) -> ParleyError {
    let offered: Vec<String> = options.iter().map(|o| o.to_string()).collect();
    ParleyError::Config(format!(
        "'{value}' is not an offered value for '{key}' (one of {})",
        offered.join(", ")
    ))
}

fn offered<T>(key: &str, value: &str, options: &[T]) -> Result<T>
where
    T: std::str::FromStr + PartialEq + Copy + std::fmt::Display,
{
    let parsed: T = parse_value(key, value)?;
    if options.contains(&parsed) {
        Ok(parsed)
    } else {
        Err(not_offered(key, value, options))
    }
}

fn offered_float(key: &str, value: &str, options: &[f32]) -> Result<f32> {
    let parsed: f32 = parse_value(key, value)?;
    if contains_float(options, parsed) {
        Ok(parsed)
    } else {
        Err(not_offered(key, value, options))
    }
}

/// General application settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GeneralConfig {
    /// Data directory holding `history/` and `temp/`.
    pub data_dir: String,
    /// Log level: trace, debug, info, warn, error.
    pub log_level: String,
}

impl Default for GeneralConfig {
    fn default() -> Self {
        Self {
            data_dir: "~/.parley/data".to_string(),
            log_level: "info".to_string(),
        }
    }
}

/// Model and generation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    pub model_dir: String,
    pub model_name: String,
    pub context_size: u32,
    pub temperature: f32,
    pub repeat_penalty: f32,
    pub batch_size: u32,
    /// VRAM budget in MB.
    pub vram_size: u32,
    /// GPU layers to offload; ignored when `dynamic_gpu_layers` is set.
    pub gpu_layers: u32,
    pub mmap: bool,
    pub mlock: bool,
    /// Size GPU offload from the model's layer count and `vram_size`.
    pub dynamic_gpu_layers: bool,
    pub stream_output: bool,
    /// Scale the pre-generation countdown by input size.
    pub afterthought_time: bool,
    pub max_history_slots: usize,
    pub max_attach_slots: usize,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: "models".to_string(),
            model_name: String::new(),
            context_size: 8192,
            temperature: 0.5,
            repeat_penalty: 1.0,
            batch_size: 1024,
            vram_size: 8192,
            gpu_layers: 0,
            mmap: true,
            mlock: true,
            dynamic_gpu_layers: true,
            stream_output: true,
            afterthought_time: true,
            max_history_slots: 12,
            max_attach_slots: 6,
        }
    }
}

/// Inference backend settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Free-form backend label, e.g. "CPU Only" or "GPU/CPU - Vulkan".
    pub backend_type: String,
    /// Path to the `llama-cli` executable.
    pub llama_bin_path: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            backend_type: "CPU Only".to_string(),
            llama_bin_path: "llama-cli".to_string(),
        }
    }
}

/// Role-play prompt settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleplayConfig {
    pub location: String,
    pub user_name: String,
    pub user_role: String,
    pub ai_npc: String,
    pub ai_npc_role: String,
}

impl Default for RoleplayConfig {
    fn default() -> Self {
        Self {
            location: "Public".to_string(),
            user_name: "Human".to_string(),
            user_role: "Lead Roleplayer".to_string(),
            ai_npc: "Robot".to_string(),
            ai_npc_role: "Randomers".to_string(),
        }
    }
}

/// Turn pipeline timing and streaming policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Countdown for inputs of 10 or more lines.
    pub long_countdown_secs: u32,
    /// Countdown for inputs of 5 to 9 lines.
    pub medium_countdown_secs: u32,
    /// Countdown for shorter inputs.
    pub short_countdown_secs: u32,
    /// Countdown when `afterthought_time` is off.
    pub disabled_countdown_secs: u32,
    /// Length of one countdown unit.
    pub tick_millis: u64,
    /// Duration of the synthetic thinking indicator.
    pub thinking_millis: u64,
    /// Insert a space between streamed increments.
    pub join_with_space: bool,
    /// Bound of the channel between a response source and the pipeline.
    pub token_queue_capacity: usize,
    /// Maximum wait for one increment; 0 disables the limit.
    pub generation_timeout_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            long_countdown_secs: 6,
            medium_countdown_secs: 4,
            short_countdown_secs: 2,
            disabled_countdown_secs: 1,
            tick_millis: 1000,
            thinking_millis: 2500,
            join_with_space: true,
            token_queue_capacity: 64,
            generation_timeout_secs: 0,
        }
    }
}

impl PipelineConfig {
    /// Countdown length in ticks for an input of `line_count` lines.
    pub fn countdown_ticks(&self, line_count: usize, afterthought_time: bool) -> u32 {
        if !afterthought_time {
            return self.disabled_countdown_secs;
        }
        if line_count >= 10 {
            self.long_countdown_secs
        } else if line_count >= 5 {
            self.medium_countdown_secs
        } else {
            self.short_countdown_secs
        }
    }
}

/// Document retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrievalConfig {
    /// Chunk size is `context_size / chunk_size_divider` characters.
    pub chunk_size_divider: u32,
    /// Chunk overlap is `context_size / chunk_overlap_divider` characters.
    pub chunk_overlap_divider: u32,
    /// Passages retrieved per query.
    pub top_k: usize,
    /// File extensions accepted for indexing, without the dot.
    pub allowed_extensions: Vec<String>,
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            chunk_size_divider: 4,
            chunk_overlap_divider: 32,
            top_k: 4,
            allowed_extensions: ["bat", "py", "ps1", "txt", "json", "yaml", "psd1", "xaml", "md"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}
