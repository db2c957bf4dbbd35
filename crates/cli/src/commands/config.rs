use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use stepwise_core::config::{AppConfig, LoadOptions};
use toml::Value;

use super::CommandResult;

pub fn run(config_path: Option<&Path>) -> CommandResult {
    let options = LoadOptions { config_path: config_path.map(Path::to_path_buf), ..LoadOptions::default() };
    let config = match AppConfig::load(options) {
        Ok(config) => config,
        Err(error) => {
            return CommandResult::failure(
                "config",
                "config_validation",
                format!("config validation failed: {error}"),
                2,
            );
        }
    };

    let file_path = detect_config_path(config_path);
    let file_doc = load_config_file_doc(file_path.as_deref());

    let mut lines = vec!["effective config (source precedence: env > file > default):".to_string()];
    for line in config.redacted_lines() {
        let Some((key, value)) = line.split_once(" = ") else {
            continue;
        };
        let source = field_source(key, file_doc.as_ref(), file_path.as_deref());
        lines.push(format!("- {key} = {value} (source: {source})"));
    }

    CommandResult { exit_code: 0, output: lines.join("\n") }
}

fn detect_config_path(explicit: Option<&Path>) -> Option<PathBuf> {
    if let Some(path) = explicit {
        return path.exists().then(|| path.to_path_buf());
    }
    [PathBuf::from("stepwise.toml"), PathBuf::from("config/stepwise.toml")]
        .into_iter()
        .find(|path| path.exists())
}

fn load_config_file_doc(path: Option<&Path>) -> Option<Value> {
    let path = path?;
    let raw = fs::read_to_string(path).ok()?;
    raw.parse::<Value>().ok()
}

/// `llm.model` is overridden by `STEPWISE_LLM_MODEL`; logging also honours
/// the short `STEPWISE_LOG_*` aliases.
fn env_keys(key_path: &str) -> Vec<String> {
    let primary = format!("STEPWISE_{}", key_path.replace('.', "_").to_ascii_uppercase());
    match key_path {
        "logging.level" => vec![primary, "STEPWISE_LOG_LEVEL".to_string()],
        "logging.format" => vec![primary, "STEPWISE_LOG_FORMAT".to_string()],
        _ => vec![primary],
    }
}

fn field_source(key_path: &str, file_doc: Option<&Value>, file_path: Option<&Path>) -> String {
    if let Some(env_key) = env_keys(key_path).into_iter().find(|key| env::var_os(key).is_some()) {
        return format!("env ({env_key})");
    }

    if let Some(doc) = file_doc {
        if contains_path(doc, key_path) {
            let file_path = file_path
                .map(|path| path.display().to_string())
                .unwrap_or_else(|| "config file".to_string());
            return format!("file ({file_path})");
        }
    }

    "default".to_string()
}

fn contains_path(root: &Value, key_path: &str) -> bool {
    let mut current = root;
    for key in key_path.split('.') {
        let Some(next) = current.get(key) else {
            return false;
        };
        current = next;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::{contains_path, env_keys};

    #[test]
    fn env_keys_follow_section_and_field() {
        assert_eq!(env_keys("engine.max_replans"), vec!["STEPWISE_ENGINE_MAX_REPLANS"]);
        assert_eq!(env_keys("logging.level"), vec!["STEPWISE_LOGGING_LEVEL", "STEPWISE_LOG_LEVEL"]);
    }

    #[test]
    fn dotted_paths_resolve_in_toml_documents() {
        let doc = "[llm]\nmodel = \"gpt-4o-mini\"\n".parse::<toml::Value>().expect("toml parses");
        assert!(contains_path(&doc, "llm.model"));
        assert!(!contains_path(&doc, "llm.base_url"));
    }
}
