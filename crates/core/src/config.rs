use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub llm: LlmConfig,
    pub engine: EngineConfig,
    pub context: ContextConfig,
    pub tools: ToolNamesConfig,
    pub guard: GuardConfig,
    pub validator: ValidatorConfig,
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug)]
pub struct LlmConfig {
    pub provider: LlmProvider,
    pub api_key: Option<SecretString>,
    pub base_url: Option<String>,
    pub model: String,
    pub timeout_secs: u64,
    pub max_retries: u32,
}

/// Budgets that bound every loop of a turn.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_clarifications: u32,
    pub max_replans: u32,
    pub max_step_attempts: u32,
    pub max_steps_per_plan: usize,
    pub max_answer_rewrites: u32,
    pub max_validation_escalations: u32,
    pub tool_timeout_secs: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ContextConfig {
    pub trigger_tokens: usize,
    pub recent_window: usize,
    pub summary_max_chars: usize,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ToolNamesConfig {
    pub baseline: String,
    pub query: String,
    pub schema: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct GuardConfig {
    pub model_check: bool,
    pub default_analysis_method: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ValidatorConfig {
    pub model_check: bool,
    pub min_answer_chars: usize,
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormat,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LlmProvider {
    #[serde(rename = "openai")]
    OpenAi,
    Ollama,
}

impl LlmProvider {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OpenAi => "openai",
            Self::Ollama => "ollama",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    Compact,
    Pretty,
    Json,
}

impl LogFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Compact => "compact",
            Self::Pretty => "pretty",
            Self::Json => "json",
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    pub log_level: Option<String>,
    pub log_format: Option<LogFormat>,
    pub llm_provider: Option<LlmProvider>,
    pub llm_model: Option<String>,
    pub llm_base_url: Option<String>,
    pub llm_api_key: Option<String>,
    pub max_step_attempts: Option<u32>,
}

#[derive(Clone, Debug, Default)]
pub struct LoadOptions {
    pub config_path: Option<PathBuf>,
    pub require_file: bool,
    pub overrides: ConfigOverrides,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("could not read config file `{path}`: {source}")]
    ReadFile { path: PathBuf, source: std::io::Error },
    #[error("could not parse config file `{path}`: {source}")]
    ParseFile { path: PathBuf, source: toml::de::Error },
    #[error("required config file was not found: `{0}`")]
    MissingConfigFile(PathBuf),
    #[error("environment variable interpolation failed for `{var}`")]
    MissingEnvInterpolation { var: String },
    #[error("unterminated environment interpolation expression")]
    UnterminatedInterpolation,
    #[error("invalid environment override for `{key}`: `{value}`")]
    InvalidEnvOverride { key: String, value: String },
    #[error("configuration validation failed: {0}")]
    Validation(String),
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            llm: LlmConfig {
                provider: LlmProvider::Ollama,
                api_key: None,
                base_url: Some("http://localhost:11434/v1".to_string()),
                model: "llama3.1".to_string(),
                timeout_secs: 60,
                max_retries: 2,
            },
            engine: EngineConfig {
                max_clarifications: 1,
                max_replans: 1,
                max_step_attempts: 2,
                max_steps_per_plan: 8,
                max_answer_rewrites: 1,
                max_validation_escalations: 1,
                tool_timeout_secs: 30,
            },
            context: ContextConfig { trigger_tokens: 6000, recent_window: 16, summary_max_chars: 2000 },
            tools: ToolNamesConfig {
                baseline: "analyze_target".to_string(),
                query: "sql_query".to_string(),
                schema: "schema_reference".to_string(),
            },
            guard: GuardConfig {
                model_check: false,
                default_analysis_method: Some("baseline analysis".to_string()),
            },
            validator: ValidatorConfig { model_check: false, min_answer_chars: 20 },
            logging: LoggingConfig { level: "info".to_string(), format: LogFormat::Compact },
        }
    }
}

fn secret_value(value: String) -> SecretString {
    value.into()
}

impl std::str::FromStr for LlmProvider {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Ok(Self::OpenAi),
            "ollama" => Ok(Self::Ollama),
            other => Err(ConfigError::Validation(format!(
                "unsupported llm provider `{other}` (expected openai|ollama)"
            ))),
        }
    }
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" => Ok(Self::Compact),
            "pretty" => Ok(Self::Pretty),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::Validation(format!(
                "unsupported log format `{other}` (expected compact|pretty|json)"
            ))),
        }
    }
}

impl AppConfig {
    pub fn load(options: LoadOptions) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        let maybe_path = resolve_config_path(options.config_path.as_deref());

        if let Some(path) = maybe_path {
            let patch = read_patch(&path)?;
            config.apply_patch(patch);
        } else if options.require_file {
            let expected = options.config_path.unwrap_or_else(|| PathBuf::from("stepwise.toml"));
            return Err(ConfigError::MissingConfigFile(expected));
        }

        config.apply_env_overrides()?;
        config.apply_overrides(options.overrides);
        config.validate()?;

        Ok(config)
    }

    fn apply_patch(&mut self, patch: ConfigPatch) {
        if let Some(llm) = patch.llm {
            if let Some(provider) = llm.provider {
                self.llm.provider = provider;
            }
            if let Some(api_key) = llm.api_key {
                self.llm.api_key = Some(secret_value(api_key));
            }
            if let Some(base_url) = llm.base_url {
                self.llm.base_url = Some(base_url);
            }
            if let Some(model) = llm.model {
                self.llm.model = model;
            }
            if let Some(timeout_secs) = llm.timeout_secs {
                self.llm.timeout_secs = timeout_secs;
            }
            if let Some(max_retries) = llm.max_retries {
                self.llm.max_retries = max_retries;
            }
        }

        if let Some(engine) = patch.engine {
            if let Some(value) = engine.max_clarifications {
                self.engine.max_clarifications = value;
            }
            if let Some(value) = engine.max_replans {
                self.engine.max_replans = value;
            }
            if let Some(value) = engine.max_step_attempts {
                self.engine.max_step_attempts = value;
            }
            if let Some(value) = engine.max_steps_per_plan {
                self.engine.max_steps_per_plan = value;
            }
            if let Some(value) = engine.max_answer_rewrites {
                self.engine.max_answer_rewrites = value;
            }
            if let Some(value) = engine.max_validation_escalations {
                self.engine.max_validation_escalations = value;
            }
            if let Some(value) = engine.tool_timeout_secs {
                self.engine.tool_timeout_secs = value;
            }
        }

        if let Some(context) = patch.context {
            if let Some(value) = context.trigger_tokens {
                self.context.trigger_tokens = value;
            }
            if let Some(value) = context.recent_window {
                self.context.recent_window = value;
            }
            if let Some(value) = context.summary_max_chars {
                self.context.summary_max_chars = value;
            }
        }

        if let Some(tools) = patch.tools {
            if let Some(value) = tools.baseline {
                self.tools.baseline = value;
            }
            if let Some(value) = tools.query {
                self.tools.query = value;
            }
            if let Some(value) = tools.schema {
                self.tools.schema = value;
            }
        }

        if let Some(guard) = patch.guard {
            if let Some(value) = guard.model_check {
                self.guard.model_check = value;
            }
            if let Some(value) = guard.default_analysis_method {
                let trimmed = value.trim();
                self.guard.default_analysis_method =
                    (!trimmed.is_empty()).then(|| trimmed.to_string());
            }
        }

        if let Some(validator) = patch.validator {
            if let Some(value) = validator.model_check {
                self.validator.model_check = value;
            }
            if let Some(value) = validator.min_answer_chars {
                self.validator.min_answer_chars = value;
            }
        }

        if let Some(logging) = patch.logging {
            if let Some(level) = logging.level {
                self.logging.level = level;
            }
            if let Some(format) = logging.format {
                self.logging.format = format;
            }
        }
    }

    fn apply_env_overrides(&mut self) -> Result<(), ConfigError> {
        if let Some(value) = read_env("STEPWISE_LLM_PROVIDER") {
            self.llm.provider = value.parse()?;
        }
        if let Some(value) = read_env("STEPWISE_LLM_API_KEY") {
            self.llm.api_key = Some(secret_value(value));
        }
        if let Some(value) = read_env("STEPWISE_LLM_BASE_URL") {
            self.llm.base_url = Some(value);
        }
        if let Some(value) = read_env("STEPWISE_LLM_MODEL") {
            self.llm.model = value;
        }
        if let Some(value) = read_env("STEPWISE_LLM_TIMEOUT_SECS") {
            self.llm.timeout_secs = parse_u64("STEPWISE_LLM_TIMEOUT_SECS", &value)?;
        }
        if let Some(value) = read_env("STEPWISE_LLM_MAX_RETRIES") {
            self.llm.max_retries = parse_u32("STEPWISE_LLM_MAX_RETRIES", &value)?;
        }

        if let Some(value) = read_env("STEPWISE_ENGINE_MAX_CLARIFICATIONS") {
            self.engine.max_clarifications =
                parse_u32("STEPWISE_ENGINE_MAX_CLARIFICATIONS", &value)?;
        }
        if let Some(value) = read_env("STEPWISE_ENGINE_MAX_REPLANS") {
            self.engine.max_replans = parse_u32("STEPWISE_ENGINE_MAX_REPLANS", &value)?;
        }
        if let Some(value) = read_env("STEPWISE_ENGINE_MAX_STEP_ATTEMPTS") {
            self.engine.max_step_attempts = parse_u32("STEPWISE_ENGINE_MAX_STEP_ATTEMPTS", &value)?;
        }
        if let Some(value) = read_env("STEPWISE_ENGINE_MAX_STEPS_PER_PLAN") {
            self.engine.max_steps_per_plan =
                parse_usize("STEPWISE_ENGINE_MAX_STEPS_PER_PLAN", &value)?;
        }
        if let Some(value) = read_env("STEPWISE_ENGINE_TOOL_TIMEOUT_SECS") {
            self.engine.tool_timeout_secs = parse_u64("STEPWISE_ENGINE_TOOL_TIMEOUT_SECS", &value)?;
        }

        if let Some(value) = read_env("STEPWISE_CONTEXT_TRIGGER_TOKENS") {
            self.context.trigger_tokens = parse_usize("STEPWISE_CONTEXT_TRIGGER_TOKENS", &value)?;
        }
        if let Some(value) = read_env("STEPWISE_GUARD_MODEL_CHECK") {
            self.guard.model_check = parse_bool("STEPWISE_GUARD_MODEL_CHECK", &value)?;
        }
        if let Some(value) = read_env("STEPWISE_VALIDATOR_MODEL_CHECK") {
            self.validator.model_check = parse_bool("STEPWISE_VALIDATOR_MODEL_CHECK", &value)?;
        }

        let log_level =
            read_env("STEPWISE_LOGGING_LEVEL").or_else(|| read_env("STEPWISE_LOG_LEVEL"));
        if let Some(value) = log_level {
            self.logging.level = value;
        }
        let log_format =
            read_env("STEPWISE_LOGGING_FORMAT").or_else(|| read_env("STEPWISE_LOG_FORMAT"));
        if let Some(value) = log_format {
            self.logging.format = value.parse()?;
        }

        Ok(())
    }

    fn apply_overrides(&mut self, overrides: ConfigOverrides) {
        if let Some(log_level) = overrides.log_level {
            self.logging.level = log_level;
        }
        if let Some(log_format) = overrides.log_format {
            self.logging.format = log_format;
        }
        if let Some(llm_provider) = overrides.llm_provider {
            self.llm.provider = llm_provider;
        }
        if let Some(llm_model) = overrides.llm_model {
            self.llm.model = llm_model;
        }
        if let Some(llm_base_url) = overrides.llm_base_url {
            self.llm.base_url = Some(llm_base_url);
        }
        if let Some(llm_api_key) = overrides.llm_api_key {
            self.llm.api_key = Some(secret_value(llm_api_key));
        }
        if let Some(max_step_attempts) = overrides.max_step_attempts {
            self.engine.max_step_attempts = max_step_attempts;
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_llm(&self.llm)?;
        validate_engine(&self.engine)?;
        validate_context(&self.context)?;
        validate_tools(&self.tools)?;
        validate_logging(&self.logging)?;
        Ok(())
    }

    /// Effective configuration as `key = value` lines with secrets masked.
    pub fn redacted_lines(&self) -> Vec<String> {
        let api_key = match &self.llm.api_key {
            Some(key) if !key.expose_secret().is_empty() => "<redacted>",
            _ => "<unset>",
        };
        vec![
            format!("llm.provider = {}", self.llm.provider.as_str()),
            format!("llm.api_key = {api_key}"),
            format!("llm.base_url = {}", self.llm.base_url.as_deref().unwrap_or("<unset>")),
            format!("llm.model = {}", self.llm.model),
            format!("llm.timeout_secs = {}", self.llm.timeout_secs),
            format!("llm.max_retries = {}", self.llm.max_retries),
            format!("engine.max_clarifications = {}", self.engine.max_clarifications),
            format!("engine.max_replans = {}", self.engine.max_replans),
            format!("engine.max_step_attempts = {}", self.engine.max_step_attempts),
            format!("engine.max_steps_per_plan = {}", self.engine.max_steps_per_plan),
            format!("engine.max_answer_rewrites = {}", self.engine.max_answer_rewrites),
            format!(
                "engine.max_validation_escalations = {}",
                self.engine.max_validation_escalations
            ),
            format!("engine.tool_timeout_secs = {}", self.engine.tool_timeout_secs),
            format!("context.trigger_tokens = {}", self.context.trigger_tokens),
            format!("context.recent_window = {}", self.context.recent_window),
            format!("context.summary_max_chars = {}", self.context.summary_max_chars),
            format!("tools.baseline = {}", self.tools.baseline),
            format!("tools.query = {}", self.tools.query),
            format!("tools.schema = {}", self.tools.schema),
            format!("guard.model_check = {}", self.guard.model_check),
            format!(
                "guard.default_analysis_method = {}",
                self.guard.default_analysis_method.as_deref().unwrap_or("<unset>")
            ),
            format!("validator.model_check = {}", self.validator.model_check),
            format!("validator.min_answer_chars = {}", self.validator.min_answer_chars),
            format!("logging.level = {}", self.logging.level),
            format!("logging.format = {}", self.logging.format.as_str()),
        ]
    }
}

fn resolve_config_path(explicit_path: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit_path {
        return path.exists().then_some(path.to_path_buf());
    }

    [PathBuf::from("stepwise.toml"), PathBuf::from("config/stepwise.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn read_patch(path: &Path) -> Result<ConfigPatch, ConfigError> {
    let raw = fs::read_to_string(path)
        .map_err(|source| ConfigError::ReadFile { path: path.to_path_buf(), source })?;

    let interpolated = interpolate_env_vars(&raw)?;
    toml::from_str::<ConfigPatch>(&interpolated)
        .map_err(|source| ConfigError::ParseFile { path: path.to_path_buf(), source })
}

fn interpolate_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut output = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(ch) = chars.next() {
        if ch == '$' && matches!(chars.peek(), Some('{')) {
            chars.next();
            let mut key = String::new();

            loop {
                match chars.next() {
                    Some('}') => break,
                    Some(next) => key.push(next),
                    None => return Err(ConfigError::UnterminatedInterpolation),
                }
            }

            let value = env::var(&key)
                .map_err(|_| ConfigError::MissingEnvInterpolation { var: key.clone() })?;
            output.push_str(&value);
            continue;
        }

        output.push(ch);
    }

    Ok(output)
}

fn validate_llm(llm: &LlmConfig) -> Result<(), ConfigError> {
    if llm.timeout_secs == 0 || llm.timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "llm.timeout_secs must be in range 1..=600".to_string(),
        ));
    }
    if llm.model.trim().is_empty() {
        return Err(ConfigError::Validation("llm.model must not be empty".to_string()));
    }

    match llm.provider {
        LlmProvider::OpenAi => {
            let missing = llm
                .api_key
                .as_ref()
                .map(|value| value.expose_secret().trim().is_empty())
                .unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.api_key is required for the openai provider".to_string(),
                ));
            }
        }
        LlmProvider::Ollama => {
            let missing =
                llm.base_url.as_ref().map(|value| value.trim().is_empty()).unwrap_or(true);
            if missing {
                return Err(ConfigError::Validation(
                    "llm.base_url is required for the ollama provider".to_string(),
                ));
            }
        }
    }

    if let Some(base_url) = &llm.base_url {
        if !base_url.starts_with("http://") && !base_url.starts_with("https://") {
            return Err(ConfigError::Validation(
                "llm.base_url must start with http:// or https://".to_string(),
            ));
        }
    }

    Ok(())
}

fn validate_engine(engine: &EngineConfig) -> Result<(), ConfigError> {
    if engine.max_step_attempts == 0 {
        return Err(ConfigError::Validation(
            "engine.max_step_attempts must be greater than zero".to_string(),
        ));
    }
    if engine.max_steps_per_plan == 0 {
        return Err(ConfigError::Validation(
            "engine.max_steps_per_plan must be greater than zero".to_string(),
        ));
    }
    if engine.tool_timeout_secs == 0 || engine.tool_timeout_secs > 600 {
        return Err(ConfigError::Validation(
            "engine.tool_timeout_secs must be in range 1..=600".to_string(),
        ));
    }
    Ok(())
}

fn validate_context(context: &ContextConfig) -> Result<(), ConfigError> {
    if context.trigger_tokens == 0 {
        return Err(ConfigError::Validation(
            "context.trigger_tokens must be greater than zero".to_string(),
        ));
    }
    if context.summary_max_chars < 16 {
        return Err(ConfigError::Validation(
            "context.summary_max_chars must be at least 16".to_string(),
        ));
    }
    Ok(())
}

fn validate_tools(tools: &ToolNamesConfig) -> Result<(), ConfigError> {
    for (key, value) in
        [("tools.baseline", &tools.baseline), ("tools.query", &tools.query), ("tools.schema", &tools.schema)]
    {
        if value.trim().is_empty() {
            return Err(ConfigError::Validation(format!("{key} must not be empty")));
        }
    }
    Ok(())
}

fn validate_logging(logging: &LoggingConfig) -> Result<(), ConfigError> {
    let level = logging.level.trim().to_ascii_lowercase();
    match level.as_str() {
        "trace" | "debug" | "info" | "warn" | "error" => Ok(()),
        _ => Err(ConfigError::Validation(
            "logging.level must be one of trace|debug|info|warn|error".to_string(),
        )),
    }
}

fn read_env(key: &str) -> Option<String> {
    env::var(key).ok().filter(|value| !value.trim().is_empty())
}

fn parse_u32(key: &str, value: &str) -> Result<u32, ConfigError> {
    value.parse::<u32>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_u64(key: &str, value: &str) -> Result<u64, ConfigError> {
    value.parse::<u64>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_usize(key: &str, value: &str) -> Result<usize, ConfigError> {
    value.parse::<usize>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    value.parse::<bool>().map_err(|_| ConfigError::InvalidEnvOverride {
        key: key.to_string(),
        value: value.to_string(),
    })
}

#[derive(Debug, Default, Deserialize)]
struct ConfigPatch {
    llm: Option<LlmPatch>,
    engine: Option<EnginePatch>,
    context: Option<ContextPatch>,
    tools: Option<ToolNamesPatch>,
    guard: Option<GuardPatch>,
    validator: Option<ValidatorPatch>,
    logging: Option<LoggingPatch>,
}

#[derive(Debug, Default, Deserialize)]
struct LlmPatch {
    provider: Option<LlmProvider>,
    api_key: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    timeout_secs: Option<u64>,
    max_retries: Option<u32>,
}

#[derive(Debug, Default, Deserialize)]
struct EnginePatch {
    max_clarifications: Option<u32>,
    max_replans: Option<u32>,
    max_step_attempts: Option<u32>,
    max_steps_per_plan: Option<usize>,
    max_answer_rewrites: Option<u32>,
    max_validation_escalations: Option<u32>,
    tool_timeout_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct ContextPatch {
    trigger_tokens: Option<usize>,
    recent_window: Option<usize>,
    summary_max_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct ToolNamesPatch {
    baseline: Option<String>,
    query: Option<String>,
    schema: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct GuardPatch {
    model_check: Option<bool>,
    default_analysis_method: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct ValidatorPatch {
    model_check: Option<bool>,
    min_answer_chars: Option<usize>,
}

#[derive(Debug, Default, Deserialize)]
struct LoggingPatch {
    level: Option<String>,
    format: Option<LogFormat>,
}
