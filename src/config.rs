use std::env;
use std::path::PathBuf;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum LlmProvider {
    Ollama,
    Gemini,
}

impl LlmProvider {
    fn from_env_value(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "gemini" | "google" => LlmProvider::Gemini,
            _ => LlmProvider::Ollama,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ModelConfig {
    pub provider: LlmProvider,
    pub answer_model: String,
    pub embedding_model: String,
    pub gemini_model: String,
    pub google_api_key: Option<String>,
    pub temperature: f32,
    pub max_concurrent_generations: usize,
}

#[derive(Clone, Debug)]
pub struct RetrievalConfig {
    pub global_top_k: usize,
    pub user_top_k: usize,
    pub max_hops: usize,
}

#[derive(Clone, Debug)]
pub struct ChunkingConfig {
    pub chunk_size: usize,
    pub chunk_overlap: usize,
}

#[derive(Clone, Debug)]
pub struct AppConfig {
    pub bind_addr: String,
    pub data_dir: PathBuf,
    pub upload_dir: PathBuf,
    pub database_url: String,
    pub ollama_base_url: String,
    pub qdrant_base_url: String,
    pub qdrant_collection: String,
    pub max_upload_bytes: usize,
    pub models: ModelConfig,
    pub retrieval: RetrievalConfig,
    pub chunking: ChunkingConfig,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let data_dir = env::var("MEDBOT_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("./data"));
        let upload_dir = env::var("MEDBOT_UPLOAD_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("uploads"));
        let database_url = env::var("DATABASE_URL").unwrap_or_else(|_| {
            format!(
                "sqlite://{}",
                data_dir.join("medical_chatbot.sqlite3").display()
            )
        });

        Self {
            bind_addr: env::var("MEDBOT_BIND").unwrap_or_else(|_| "127.0.0.1:8080".to_string()),
            data_dir,
            upload_dir,
            database_url,
            ollama_base_url: env::var("OLLAMA_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:11434".to_string()),
            qdrant_base_url: env::var("QDRANT_BASE_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:6333".to_string()),
            qdrant_collection: env::var("QDRANT_COLLECTION")
                .unwrap_or_else(|_| "medical-chatbot".to_string()),
            max_upload_bytes: env_parse("MAX_UPLOAD_BYTES", 16 * 1024 * 1024),
            models: ModelConfig {
                provider: env::var("LLM_PROVIDER")
                    .map(|v| LlmProvider::from_env_value(&v))
                    .unwrap_or(LlmProvider::Ollama),
                answer_model: env::var("ANSWER_MODEL")
                    .unwrap_or_else(|_| "llama3.1:8b-instruct".to_string()),
                embedding_model: env::var("EMBEDDING_MODEL")
                    .unwrap_or_else(|_| "all-minilm".to_string()),
                gemini_model: env::var("GEMINI_MODEL")
                    .unwrap_or_else(|_| "gemini-2.5-flash".to_string()),
                google_api_key: env::var("GOOGLE_API_KEY")
                    .ok()
                    .filter(|key| !key.trim().is_empty()),
                temperature: env_parse("LLM_TEMPERATURE", 0.7),
                max_concurrent_generations: env_parse("MAX_CONCURRENT_GENERATIONS", 4),
            },
            retrieval: RetrievalConfig {
                global_top_k: env_parse("GLOBAL_TOP_K", 5),
                user_top_k: env_parse("USER_TOP_K", 8),
                max_hops: env_parse("MAX_HOPS", 2),
            },
            chunking: ChunkingConfig {
                chunk_size: env_parse("CHUNK_SIZE", 500),
                chunk_overlap: env_parse("CHUNK_OVERLAP", 20),
            },
        }
    }

    /// Same defaults as `from_env`, rooted at `data_dir`, with an in-memory database.
    pub fn for_data_dir(data_dir: impl Into<PathBuf>) -> Self {
        let data_dir = data_dir.into();
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            upload_dir: data_dir.join("uploads"),
            data_dir,
            database_url: "sqlite::memory:".to_string(),
            ollama_base_url: "http://127.0.0.1:11434".to_string(),
            qdrant_base_url: "http://127.0.0.1:6333".to_string(),
            qdrant_collection: "medical-chatbot".to_string(),
            max_upload_bytes: 16 * 1024 * 1024,
            models: ModelConfig {
                provider: LlmProvider::Ollama,
                answer_model: "llama3.1:8b-instruct".to_string(),
                embedding_model: "all-minilm".to_string(),
                gemini_model: "gemini-2.5-flash".to_string(),
                google_api_key: None,
                temperature: 0.7,
                max_concurrent_generations: 4,
            },
            retrieval: RetrievalConfig {
                global_top_k: 5,
                user_top_k: 8,
                max_hops: 2,
            },
            chunking: ChunkingConfig {
                chunk_size: 500,
                chunk_overlap: 20,
            },
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}
