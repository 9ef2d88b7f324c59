use std::sync::Arc;

use candle_core::Device;
use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::config::AppConfig;
use crate::engine::{self, CandleEngine, GenerationParams, InferenceEngine, Offloaded};
use crate::error::ServiceError;
use crate::reply::{self, GENERATION_FALLBACK};

/// Shared state behind every route:
/// - the compute device, chosen once and used for both reporting and loading
/// - the engine slot, written once by `load`/`attach` and only read afterwards
/// - the random source used for sampling seeds and reply shaping
pub struct ModelService {
    config: AppConfig,
    device: Device,
    engine: RwLock<Option<Arc<dyn InferenceEngine>>>,
    rng: Mutex<StdRng>,
}

impl ModelService {
    pub fn new(config: AppConfig) -> Arc<Self> {
        Self::with_parts(config, engine::select_device(), StdRng::from_entropy())
    }

    pub fn with_parts(config: AppConfig, device: Device, rng: StdRng) -> Arc<Self> {
        Arc::new(Self {
            config,
            device,
            engine: RwLock::new(None),
            rng: Mutex::new(rng),
        })
    }

    #[cfg(test)]
    pub fn seeded(config: AppConfig, seed: u64) -> Arc<Self> {
        Self::with_parts(config, Device::Cpu, StdRng::seed_from_u64(seed))
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn model_name(&self) -> &str {
        &self.config.model_name
    }

    pub fn device(&self) -> &'static str {
        engine::device_label(&self.device)
    }

    #[cfg(test)]
    pub fn compute_device(&self) -> &Device {
        &self.device
    }

    /// Download and build the model. Failures are logged, never propagated.
    pub fn load(&self) -> bool {
        tracing::info!("Loading model: {}", self.config.model_name);
        match CandleEngine::load(&self.config, self.device.clone()) {
            Ok(engine) => {
                self.attach(Offloaded::new(engine));
                tracing::info!("Model loaded successfully on {}", self.device());
                true
            }
            Err(e) => {
                tracing::error!("Error loading model: {e:#}");
                false
            }
        }
    }

    /// Install an engine. Later calls are ignored; the first engine wins.
    pub fn attach(&self, engine: Arc<dyn InferenceEngine>) {
        let mut guard = self.engine.write();
        if guard.is_some() {
            tracing::warn!("model already loaded, ignoring second engine");
            return;
        }
        *guard = Some(engine);
    }

    pub fn is_loaded(&self) -> bool {
        self.engine.read().is_some()
    }

    pub fn model_location(&self) -> Option<String> {
        self.is_loaded()
            .then(|| self.config.model_location().display().to_string())
    }

    /// Generate a reply, mapping engine failures to their error kinds.
    pub async fn try_generate(&self, message: &str) -> Result<String, ServiceError> {
        let engine = self
            .engine
            .read()
            .clone()
            .ok_or(ServiceError::ModelUnavailable)?;

        let prompt = reply::build_prompt(message);
        let params = GenerationParams {
            seed: self.rng.lock().gen(),
            ..GenerationParams::default()
        };

        let decoded = engine.generate(&prompt, &params).await?;
        let extracted = reply::extract_reply(&decoded, &prompt);

        let mut rng = self.rng.lock();
        Ok(reply::post_process(&extracted, message, &mut *rng))
    }

    /// Like `try_generate`, but generation failures become the fallback reply.
    /// Only a missing model is reported as an error.
    pub async fn reply(&self, message: &str) -> Result<String, ServiceError> {
        match self.try_generate(message).await {
            Ok(text) => Ok(text),
            Err(ServiceError::Generation(e)) => {
                tracing::error!("Error generating response: {e:#}");
                Ok(GENERATION_FALLBACK.to_string())
            }
            Err(e) => Err(e),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn block_on<F: std::future::Future>(fut: F) -> F::Output {
        tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap()
            .block_on(fut)
    }

    #[test]
    fn reported_device_is_the_load_device() {
        let service = ModelService::seeded(test_config(), 1);
        assert!(matches!(service.compute_device(), Device::Cpu));
        assert_eq!(service.device(), "cpu");
    }

    #[test]
    fn starts_unloaded() {
        let service = ModelService::seeded(test_config(), 1);
        assert!(!service.is_loaded());
        assert_eq!(service.model_location(), None);
        assert!(matches!(
            block_on(service.reply("hello")),
            Err(ServiceError::ModelUnavailable)
        ));
    }

    #[test]
    fn attach_marks_loaded_and_exposes_location() {
        let service = ModelService::seeded(test_config(), 1);
        service.attach(CannedEngine::new("User: hi\nAI: hello there friend"));
        assert!(service.is_loaded());
        assert_eq!(
            service.model_location().as_deref(),
            Some("/tmp/models/org_test-model")
        );
    }

    #[test]
    fn first_engine_wins() {
        let service = ModelService::seeded(test_config(), 1);
        let first = CannedEngine::new("AI: from the first engine");
        let second = CannedEngine::new("AI: from the second engine");
        service.attach(first.clone());
        service.attach(second.clone());

        block_on(service.reply("hi")).unwrap();
        assert_eq!(first.prompts.lock().len(), 1);
        assert!(second.prompts.lock().is_empty());
    }

    #[test]
    fn reply_extracts_model_turn() {
        let service = ModelService::seeded(test_config(), 7);
        let engine = CannedEngine::new(
            "User: I feel sad today\nAI: You've got this! Tomorrow will be brighter.",
        );
        service.attach(engine.clone());

        let out = block_on(service.reply("I feel sad today")).unwrap();
        assert!(
            out.starts_with("You've got this! Tomorrow will be brighter."),
            "{out}"
        );
        assert_eq!(
            engine.prompts.lock().as_slice(),
            ["User: I feel sad today\nAI:".to_string()]
        );
    }

    #[test]
    fn same_seed_same_reply() {
        let decoded = "User: hey\nAI: Keep smiling. Life is good. Really good";
        let run = |seed| {
            let service = ModelService::seeded(test_config(), seed);
            service.attach(CannedEngine::new(decoded));
            block_on(service.reply("hey")).unwrap()
        };
        for seed in 0..8 {
            assert_eq!(run(seed), run(seed));
        }
    }

    #[test]
    fn generation_failure_uses_fallback() {
        let service = ModelService::seeded(test_config(), 3);
        service.attach(Arc::new(FailingEngine));

        assert_eq!(
            block_on(service.reply("anything")).unwrap(),
            GENERATION_FALLBACK
        );
        assert!(matches!(
            block_on(service.try_generate("anything")),
            Err(ServiceError::Generation(_))
        ));
    }
}
