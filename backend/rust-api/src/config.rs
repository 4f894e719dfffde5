use serde::Deserialize;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub mongo_uri: String,
    pub redis_uri: String,
    pub mongo_database: String,
    pub jwt_secret: String,
    pub scorer: ScorerSettings,
    pub pipeline: PipelineSettings,
    pub object_storage: Option<ObjectStorageSettings>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScorerSettings {
    pub base_url: String,
    pub writing_timeout_secs: u64,
    pub speaking_timeout_secs: u64,
    pub transcription_timeout_secs: u64,
    pub language: String,
}

impl ScorerSettings {
    pub fn writing_timeout(&self) -> Duration {
        Duration::from_secs(self.writing_timeout_secs)
    }

    pub fn speaking_timeout(&self) -> Duration {
        Duration::from_secs(self.speaking_timeout_secs)
    }

    /// Audio scoring transcribes first, so it gets both budgets.
    pub fn audio_timeout(&self) -> Duration {
        Duration::from_secs(self.speaking_timeout_secs + self.transcription_timeout_secs)
    }
}

impl Default for ScorerSettings {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000".to_string(),
            writing_timeout_secs: 60,
            speaking_timeout_secs: 30,
            transcription_timeout_secs: 60,
            language: "en".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PipelineSettings {
    pub max_retries: u32,
    pub worker_concurrency: usize,
    pub sweep_interval_secs: u64,
    pub sweep_batch_size: usize,
    pub speaking_fallback_enabled: bool,
    pub dispatch_queue: String,
}

impl PipelineSettings {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }
}

impl Default for PipelineSettings {
    fn default() -> Self {
        Self {
            max_retries: 3,
            worker_concurrency: 4,
            sweep_interval_secs: 15,
            sweep_batch_size: 20,
            speaking_fallback_enabled: true,
            dispatch_queue: "scoring:dispatch".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ObjectStorageSettings {
    pub bucket: String,
    pub region: String,
    pub endpoint: Option<String>,
    pub access_key: String,
    pub secret_key: String,
    pub media_prefix: String,
}

impl Config {
    pub fn load() -> Result<Self, config::ConfigError> {
        // Load environment variables from root .env file (two levels up)
        // Try root .env first, then fallback to local .env
        let skip_root_env = env::var("SKIP_ROOT_ENV").is_ok();
        if skip_root_env {
            dotenvy::dotenv().ok();
        } else if dotenvy::from_path("../../.env").is_err() {
            dotenvy::dotenv().ok();
        }

        // Determine environment (defaults to dev)
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "dev".to_string());

        // Build configuration from config/*.toml + ENV overrides
        let settings = config::Config::builder()
            .add_source(config::File::with_name(&format!("config/{}", app_env)).required(false))
            .add_source(config::Environment::with_prefix("APP").separator("__"))
            .build()?;

        let mongo_uri = settings
            .get_string("database.mongo_uri")
            .or_else(|_| env::var("MONGO_URI"))
            .unwrap_or_else(|_| "mongodb://localhost:27017".to_string());

        let redis_uri = settings
            .get_string("redis.uri")
            .or_else(|_| env::var("REDIS_URI"))
            .unwrap_or_else(|_| {
                let host = env::var("REDIS_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
                let port = env::var("REDIS_PORT").unwrap_or_else(|_| "6379".to_string());
                format!("redis://{}:{}/0", host, port)
            });

        let mongo_database = settings
            .get_string("database.mongo_database")
            .or_else(|_| env::var("MONGO_DATABASE"))
            .unwrap_or_else(|_| "bandscore".to_string());

        let jwt_secret = match settings
            .get_string("auth.jwt_secret")
            .or_else(|_| env::var("JWT_SECRET"))
        {
            Ok(secret) => secret,
            Err(_) if app_env == "prod" => {
                return Err(config::ConfigError::Message(
                    "JWT_SECRET must be set in production".to_string(),
                ))
            }
            Err(_) => {
                eprintln!("WARNING: Using default JWT_SECRET (dev mode only!)");
                "dev-secret-only-for-local-testing".to_string()
            }
        };

        let scorer_defaults = ScorerSettings::default();
        let scorer = ScorerSettings {
            base_url: settings
                .get_string("scorer.base_url")
                .or_else(|_| env::var("SCORER_BASE_URL"))
                .unwrap_or(scorer_defaults.base_url),
            writing_timeout_secs: read_u64(
                &settings,
                "scorer.writing_timeout_secs",
                "SCORER_WRITING_TIMEOUT_SECS",
                scorer_defaults.writing_timeout_secs,
            ),
            speaking_timeout_secs: read_u64(
                &settings,
                "scorer.speaking_timeout_secs",
                "SCORER_SPEAKING_TIMEOUT_SECS",
                scorer_defaults.speaking_timeout_secs,
            ),
            transcription_timeout_secs: read_u64(
                &settings,
                "scorer.transcription_timeout_secs",
                "SCORER_TRANSCRIPTION_TIMEOUT_SECS",
                scorer_defaults.transcription_timeout_secs,
            ),
            language: settings
                .get_string("scorer.language")
                .or_else(|_| env::var("SCORER_LANGUAGE"))
                .unwrap_or(scorer_defaults.language),
        };

        let pipeline_defaults = PipelineSettings::default();
        let pipeline = PipelineSettings {
            max_retries: read_u64(
                &settings,
                "pipeline.max_retries",
                "SCORING_MAX_RETRIES",
                pipeline_defaults.max_retries as u64,
            ) as u32,
            worker_concurrency: read_u64(
                &settings,
                "pipeline.worker_concurrency",
                "SCORING_WORKER_CONCURRENCY",
                pipeline_defaults.worker_concurrency as u64,
            )
            .max(1) as usize,
            sweep_interval_secs: read_u64(
                &settings,
                "pipeline.sweep_interval_secs",
                "SCORING_SWEEP_INTERVAL_SECS",
                pipeline_defaults.sweep_interval_secs,
            )
            .max(1),
            sweep_batch_size: read_u64(
                &settings,
                "pipeline.sweep_batch_size",
                "SCORING_SWEEP_BATCH_SIZE",
                pipeline_defaults.sweep_batch_size as u64,
            ) as usize,
            speaking_fallback_enabled: settings
                .get_bool("pipeline.speaking_fallback_enabled")
                .ok()
                .or_else(|| {
                    env::var("SCORING_SPEAKING_FALLBACK")
                        .ok()
                        .and_then(|value| value.parse().ok())
                })
                .unwrap_or(pipeline_defaults.speaking_fallback_enabled),
            dispatch_queue: settings
                .get_string("pipeline.dispatch_queue")
                .or_else(|_| env::var("SCORING_DISPATCH_QUEUE"))
                .unwrap_or(pipeline_defaults.dispatch_queue),
        };

        // Object storage is optional; without a bucket media stays in process memory
        let object_storage = settings
            .get_string("object_storage.bucket")
            .or_else(|_| env::var("OBJECT_STORAGE_BUCKET"))
            .ok()
            .map(|bucket| ObjectStorageSettings {
                bucket,
                region: settings
                    .get_string("object_storage.region")
                    .or_else(|_| env::var("OBJECT_STORAGE_REGION"))
                    .unwrap_or_else(|_| "us-east-1".to_string()),
                endpoint: settings
                    .get_string("object_storage.endpoint")
                    .or_else(|_| env::var("OBJECT_STORAGE_ENDPOINT"))
                    .ok(),
                access_key: settings
                    .get_string("object_storage.access_key")
                    .or_else(|_| env::var("OBJECT_STORAGE_ACCESS_KEY"))
                    .unwrap_or_default(),
                secret_key: settings
                    .get_string("object_storage.secret_key")
                    .or_else(|_| env::var("OBJECT_STORAGE_SECRET_KEY"))
                    .unwrap_or_default(),
                media_prefix: settings
                    .get_string("object_storage.media_prefix")
                    .or_else(|_| env::var("OBJECT_STORAGE_MEDIA_PREFIX"))
                    .unwrap_or_else(|_| "media".to_string()),
            });

        Ok(Config {
            mongo_uri,
            redis_uri,
            mongo_database,
            jwt_secret,
            scorer,
            pipeline,
            object_storage,
        })
    }

    /// Configuration for tests and in-memory runs.
    pub fn for_memory(jwt_secret: impl Into<String>) -> Self {
        Config {
            mongo_uri: String::new(),
            redis_uri: String::new(),
            mongo_database: "bandscore".to_string(),
            jwt_secret: jwt_secret.into(),
            scorer: ScorerSettings::default(),
            pipeline: PipelineSettings::default(),
            object_storage: None,
        }
    }
}

fn read_u64(settings: &config::Config, key: &str, env_key: &str, default: u64) -> u64 {
    settings
        .get_int(key)
        .ok()
        .and_then(|value| u64::try_from(value).ok())
        .or_else(|| env::var(env_key).ok().and_then(|value| value.parse().ok()))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn audio_timeout_combines_budgets() {
        let scorer = ScorerSettings::default();
        assert_eq!(scorer.writing_timeout(), Duration::from_secs(60));
        assert_eq!(scorer.speaking_timeout(), Duration::from_secs(30));
        assert_eq!(scorer.audio_timeout(), Duration::from_secs(90));
    }

    #[test]
    #[serial_test::serial]
    fn env_overrides_pipeline_settings() {
        std::env::set_var("SKIP_ROOT_ENV", "1");
        std::env::set_var("APP_ENV", "test-config");
        std::env::set_var("SCORING_MAX_RETRIES", "5");
        std::env::set_var("SCORING_SPEAKING_FALLBACK", "false");

        let config = Config::load().unwrap();
        assert_eq!(config.pipeline.max_retries, 5);
        assert!(!config.pipeline.speaking_fallback_enabled);
        assert_eq!(config.pipeline.dispatch_queue, "scoring:dispatch");

        std::env::remove_var("SCORING_MAX_RETRIES");
        std::env::remove_var("SCORING_SPEAKING_FALLBACK");
        std::env::remove_var("APP_ENV");
        std::env::remove_var("SKIP_ROOT_ENV");
    }
}
