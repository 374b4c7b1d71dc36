use std::env;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub conversation_model: String,
    pub structuring_model: String,
}

#[derive(Clone, Debug)]
pub struct TokenConfig {
    pub intake_tokens: usize,
    pub planning_tokens: usize,
    pub draft_tokens: usize,
    pub reflection_tokens: usize,
    pub guide_tokens: usize,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub ollama_base_url: String,
    pub reference_dir: Option<PathBuf>,
    pub request_timeout: Duration,
    pub max_upload_bytes: usize,
    pub models: ModelConfig,
    pub tokens: TokenConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env::var("REPORT_WRITER_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));

        let conversation_model = env::var("CONVERSATION_MODEL")
            .unwrap_or_else(|_| "qwen2.5:14b-instruct".to_string());

        Self {
            bind_addr: env::var("REPORT_WRITER_BIND")
                .unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            data_dir,
            ollama_base_url: env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            reference_dir: env::var("REPORT_WRITER_REFERENCE_DIR")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from),
            request_timeout: Duration::from_secs(env_number("REQUEST_TIMEOUT_SECS", 180) as u64),
            max_upload_bytes: env_number("MAX_UPLOAD_BYTES", 20 * 1024 * 1024),
            models: ModelConfig {
                structuring_model: env::var("STRUCTURING_MODEL")
                    .unwrap_or_else(|_| conversation_model.clone()),
                conversation_model,
            },
            tokens: TokenConfig {
                intake_tokens: env_number("INTAKE_TOKENS", 1_000),
                planning_tokens: env_number("PLANNING_TOKENS", 1_000),
                draft_tokens: env_number("DRAFT_TOKENS", 2_000),
                reflection_tokens: env_number("REFLECTION_TOKENS", 1_000),
                guide_tokens: env_number("GUIDE_TOKENS", 8_000),
            },
        }
    }

    pub fn reference_index_dir(&self) -> PathBuf {
        self.data_dir.join("reference_index")
    }

    pub fn sqlite_dsn(&self) -> String {
        format!(
            "sqlite://{}",
            self.data_dir.join("report_writer.sqlite3").display()
        )
    }
}

impl Default for TokenConfig {
    fn default() -> Self {
        Self {
            intake_tokens: 1_000,
            planning_tokens: 1_000,
            draft_tokens: 2_000,
            reflection_tokens: 1_000,
            guide_tokens: 8_000,
        }
    }
}

fn env_number(key: &str, default: usize) -> usize {
    env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}
