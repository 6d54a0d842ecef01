use std::env;
use std::path::PathBuf;

/// Which embedding function backs the index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmbedderBackend {
    /// Deterministic feature hashing. Needs no model files.
    Hashing,
    /// Sentence bi-encoder served through ONNX Runtime.
    Onnx,
}

impl EmbedderBackend {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::parse(&env::var("EMBEDDER").unwrap_or_default())
    }

    fn parse(value: &str) -> anyhow::Result<Self> {
        match value.trim().to_lowercase().as_str() {
            "" | "hashing" => Ok(Self::Hashing),
            "onnx" | "bi-encoder" | "model" => Ok(Self::Onnx),
            other => anyhow::bail!("Unknown EMBEDDER `{}` (expected `hashing` or `onnx`)", other),
        }
    }

    /// Floor suited to the backend's score distribution.
    ///
    /// Hashed vectors of unrelated text are near-orthogonal, while sentence
    /// bi-encoders score even gibberish well above zero.
    pub fn default_similarity_floor(self) -> f32 {
        match self {
            Self::Hashing => 0.1,
            Self::Onnx => 0.5,
        }
    }
}

/// Log output format for the fmt layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

impl LogFormat {
    pub fn from_env() -> Self {
        match env::var("LOG_FORMAT")
            .unwrap_or_default()
            .to_lowercase()
            .as_str()
        {
            "json" => Self::Json,
            _ => Self::Text,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
    /// Optional JSON manifest overriding the built-in descriptor metadata.
    pub catalogue_path: Option<PathBuf>,
    pub embedder: EmbedderBackend,
    /// Path to bi-encoder ONNX model (used when `embedder` is `Onnx`).
    pub bi_encoder_model_path: PathBuf,
    /// Path to bi-encoder tokenizer.
    pub bi_encoder_tokenizer_path: PathBuf,
    pub max_sequence_length: usize,
    /// Optional override for the ONNX session pool size. If None, uses available parallelism.
    pub pool_size: Option<usize>,
    /// Number of threads per ONNX session for intra-op parallelism.
    pub intra_threads: usize,
    /// Where the built index and its catalogue fingerprint are persisted.
    pub index_cache_path: PathBuf,
    /// Minimum raw similarity for a candidate to count as a match.
    /// Defaults per backend, see [`EmbedderBackend::default_similarity_floor`].
    pub similarity_floor: f32,
    /// Additive bonus for candidates sharing the category of the session's last function.
    pub context_boost: f32,
    pub execution_timeout_ms: u64,
    /// How long a request waits for a free embedding slot before a 503.
    pub embed_queue_timeout_ms: u64,
    /// Upper bound on `num_functions` for a multi execution.
    pub max_functions: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8080,
            shutdown_timeout_secs: 30,
            catalogue_path: None,
            embedder: EmbedderBackend::Hashing,
            bi_encoder_model_path: PathBuf::from("./bi-encoder-model/model_int8.onnx"),
            bi_encoder_tokenizer_path: PathBuf::from("./bi-encoder-model/tokenizer.json"),
            max_sequence_length: 512,
            pool_size: None,
            intra_threads: 1,
            index_cache_path: PathBuf::from(".actuator/index.bin"),
            similarity_floor: EmbedderBackend::Hashing.default_similarity_floor(),
            context_boost: 0.1,
            execution_timeout_ms: 30_000,
            embed_queue_timeout_ms: 10_000,
            max_functions: 20,
        }
    }
}

impl Config {
    /// Load configuration from environment variables with sensible defaults.
    ///
    /// `EMBEDDER` selects the embedding backend:
    /// - `hashing` (default): deterministic feature hashing, no model files
    /// - `onnx`: bi-encoder at `BI_ENCODER_MODEL_PATH` / `BI_ENCODER_TOKENIZER_PATH`
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let embedder = EmbedderBackend::from_env()?;

        let similarity_floor: f32 = match env::var("SIMILARITY_FLOOR") {
            Ok(value) => value.parse()?,
            Err(_) => embedder.default_similarity_floor(),
        };
        let context_boost: f32 = env::var("CONTEXT_BOOST")
            .unwrap_or_else(|_| defaults.context_boost.to_string())
            .parse()?;
        if !similarity_floor.is_finite() || !context_boost.is_finite() || context_boost < 0.0 {
            anyhow::bail!("SIMILARITY_FLOOR and CONTEXT_BOOST must be finite, CONTEXT_BOOST non-negative");
        }

        Ok(Self {
            host: env::var("HOST").unwrap_or(defaults.host),
            port: env::var("PORT")
                .unwrap_or_else(|_| "8080".to_string())
                .parse()?,
            shutdown_timeout_secs: env::var("SHUTDOWN_TIMEOUT")
                .unwrap_or_else(|_| "30".to_string())
                .parse()?,
            catalogue_path: env::var("CATALOGUE_PATH").ok().map(PathBuf::from),
            embedder,
            bi_encoder_model_path: env::var("BI_ENCODER_MODEL_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.bi_encoder_model_path),
            bi_encoder_tokenizer_path: env::var("BI_ENCODER_TOKENIZER_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.bi_encoder_tokenizer_path),
            max_sequence_length: env::var("MAX_SEQ_LENGTH")
                .unwrap_or_else(|_| "512".to_string())
                .parse()?,
            pool_size: env::var("POOL_SIZE").ok().and_then(|s| s.parse().ok()),
            intra_threads: env::var("INTRA_THREADS")
                .unwrap_or_else(|_| "1".to_string())
                .parse()?,
            index_cache_path: env::var("INDEX_CACHE_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.index_cache_path),
            similarity_floor,
            context_boost,
            execution_timeout_ms: env::var("EXECUTION_TIMEOUT_MS")
                .unwrap_or_else(|_| "30000".to_string())
                .parse()?,
            embed_queue_timeout_ms: env::var("EMBED_QUEUE_TIMEOUT_MS")
                .unwrap_or_else(|_| "10000".to_string())
                .parse()?,
            max_functions: env::var("MAX_FUNCTIONS")
                .unwrap_or_else(|_| "20".to_string())
                .parse()?,
        })
    }
}
