use std::path::Path;
use std::sync::Arc;
use std::time::Instant;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;

use candle_core::quantized::gguf_file;
use candle_core::{Device, Tensor};
use candle_transformers::generation::{LogitsProcessor, Sampling};
use candle_transformers::models::quantized_llama as qllama;
use candle_transformers::utils::apply_repeat_penalty;
use hf_hub::api::sync::ApiBuilder;
use tokenizers::{PaddingParams, Tokenizer};

use crate::config::AppConfig;

/// Decoding knobs for a single generation call.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f64,
    pub top_p: f64,
    pub top_k: usize,
    pub repeat_penalty: f32,
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self {
            max_new_tokens: 100,
            temperature: 0.7,
            top_p: 0.9,
            top_k: 50,
            repeat_penalty: 1.2,
            seed: 42,
        }
    }
}

/// Anything that can turn a prompt into decoded text.
///
/// The returned string is the decoded prompt plus continuation, with special
/// tokens skipped.
#[async_trait]
pub trait InferenceEngine: Send + Sync {
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String>;
}

/// A synchronous backend whose generation is CPU/GPU-bound.
pub trait BlockingGenerator: Send + Sync + 'static {
    fn generate_blocking(&self, prompt: &str, params: &GenerationParams) -> Result<String>;
}

/// Runs a `BlockingGenerator` on tokio's blocking pool so async workers stay free.
pub struct Offloaded<G> {
    generator: Arc<G>,
}

impl<G: BlockingGenerator> Offloaded<G> {
    pub fn new(generator: G) -> Arc<Self> {
        Arc::new(Self {
            generator: Arc::new(generator),
        })
    }
}

#[async_trait]
impl<G: BlockingGenerator> InferenceEngine for Offloaded<G> {
    async fn generate(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let generator = Arc::clone(&self.generator);
        let prompt = prompt.to_string();
        let params = params.clone();
        tokio::task::spawn_blocking(move || generator.generate_blocking(&prompt, &params)).await?
    }
}

/// Compute device: CUDA when available, CPU otherwise.
pub fn select_device() -> Device {
    match Device::cuda_if_available(0) {
        Ok(device) => device,
        Err(e) => {
            tracing::warn!("CUDA probe failed ({e}), using CPU");
            Device::Cpu
        }
    }
}

pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

pub struct CandleEngine {
    model_name: String,
    device: Device,
    model: Mutex<qllama::ModelWeights>,
    tokenizer: Tokenizer,
    eos_token: u32,
}

impl CandleEngine {
    /// Fetch weights and tokenizer into the model's cache directory and build
    /// the model on `device`.
    pub fn load(config: &AppConfig, device: Device) -> Result<Self> {
        let cache_dir = config.model_location();
        std::fs::create_dir_all(&cache_dir)?;

        let api = ApiBuilder::new()
            .with_cache_dir(cache_dir)
            .build()?;

        tracing::info!("loading tokenizer from {}", config.tokenizer_repo);
        let tokenizer_path = api
            .model(config.tokenizer_repo.clone())
            .get("tokenizer.json")?;
        let mut tokenizer = Tokenizer::from_file(&tokenizer_path)
            .map_err(|e| anyhow!("Error loading tokenizer: {e}"))?;

        let eos_token = ["</s>", "<|endoftext|>"]
            .iter()
            .find_map(|t| tokenizer.token_to_id(t))
            .ok_or_else(|| anyhow!("tokenizer has no end-of-sequence token"))?;
        pad_with_eos(&mut tokenizer, eos_token);

        tracing::info!("loading model {}/{}", config.model_name, config.model_file);
        let model_path = api
            .model(config.model_name.clone())
            .get(&config.model_file)?;
        let model = load_gguf(&model_path, &device)?;

        Ok(Self {
            model_name: config.model_name.clone(),
            device,
            model: Mutex::new(model),
            tokenizer,
            eos_token,
        })
    }
}

impl BlockingGenerator for CandleEngine {
    fn generate_blocking(&self, prompt: &str, params: &GenerationParams) -> Result<String> {
        let tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(|e| anyhow!("Error encoding prompt: {e}"))?;
        let mut prompt_tokens = tokens.get_ids().to_vec();
        if prompt_tokens.is_empty() {
            return Err(anyhow!("prompt encoded to zero tokens"));
        }

        let budget = params.max_new_tokens;
        if prompt_tokens.len() + budget > qllama::MAX_SEQ_LEN - 10 {
            let to_remove = prompt_tokens.len() + budget + 10 - qllama::MAX_SEQ_LEN;
            prompt_tokens = prompt_tokens[to_remove.min(prompt_tokens.len())..].to_vec();
        }

        let mut logits_processor = LogitsProcessor::from_sampling(
            params.seed,
            Sampling::TopKThenTopP {
                k: params.top_k,
                p: params.top_p,
                temperature: params.temperature,
            },
        );

        let mut model = self.model.lock();
        let mut all_tokens = prompt_tokens.clone();

        let input = Tensor::new(prompt_tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        let mut logits = model.forward(&input, 0)?.squeeze(0)?;

        for step in 0..budget {
            let penalized = apply_repeat_penalty(&logits, params.repeat_penalty, &all_tokens)?;
            let next_token = logits_processor.sample(&penalized)?;
            if next_token == self.eos_token {
                break;
            }
            all_tokens.push(next_token);
            if step + 1 == budget {
                break;
            }

            let input = Tensor::new(&[next_token], &self.device)?.unsqueeze(0)?;
            logits = model.forward(&input, all_tokens.len() - 1)?.squeeze(0)?;
        }

        tracing::debug!(
            "{} generated {} tokens",
            self.model_name,
            all_tokens.len() - prompt_tokens.len()
        );

        self.tokenizer
            .decode(&all_tokens, true)
            .map_err(|e| anyhow!("Error decoding: {e}"))
    }
}

fn load_gguf(path: &Path, device: &Device) -> Result<qllama::ModelWeights> {
    let mut file = std::fs::File::open(path)?;
    let start = Instant::now();

    let content = gguf_file::Content::read(&mut file)?;
    let total_size_in_bytes: usize = content
        .tensor_infos
        .values()
        .map(|t| t.shape.elem_count() * t.ggml_dtype.type_size() / t.ggml_dtype.block_size())
        .sum();
    tracing::info!(
        "loaded {} tensors ({}) in {:.2}s",
        content.tensor_infos.len(),
        format_size(total_size_in_bytes),
        start.elapsed().as_secs_f32(),
    );

    Ok(qllama::ModelWeights::from_gguf(content, &mut file, device)?)
}

/// Use the end-of-sequence token for padding unless the tokenizer already pads.
fn pad_with_eos(tokenizer: &mut Tokenizer, eos_token: u32) {
    if tokenizer.get_padding().is_some() {
        return;
    }
    let pad_token = tokenizer.id_to_token(eos_token).unwrap_or_default();
    tokenizer.with_padding(Some(PaddingParams {
        pad_id: eos_token,
        pad_token,
        ..Default::default()
    }));
}

fn format_size(size: usize) -> String {
    const KB: f64 = 1024.0;
    const MB: f64 = KB * 1024.0;
    const GB: f64 = MB * 1024.0;
    let size_f = size as f64;
    if size_f > GB {
        format!("{:.2} GiB", size_f / GB)
    } else if size_f > MB {
        format!("{:.2} MiB", size_f / MB)
    } else if size_f > KB {
        format!("{:.2} KiB", size_f / KB)
    } else {
        format!("{size} B")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::mpsc;
    use std::time::Duration;

    use super::*;

    /// Blocks until the async side opens the gate.
    struct GatedGenerator {
        gate: Mutex<mpsc::Receiver<()>>,
    }

    impl BlockingGenerator for GatedGenerator {
        fn generate_blocking(&self, prompt: &str, _params: &GenerationParams) -> Result<String> {
            self.gate
                .lock()
                .recv_timeout(Duration::from_secs(5))
                .map_err(|e| anyhow!("gate never opened: {e}"))?;
            Ok(format!("{prompt} done"))
        }
    }

    #[test]
    fn blocking_generation_leaves_the_runtime_free() {
        let (open, gate) = mpsc::channel();
        let engine = Offloaded::new(GatedGenerator {
            gate: Mutex::new(gate),
        });
        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();

        // Single runtime thread: generation inline would block before the
        // gate is opened and time out.
        let params = GenerationParams::default();
        let (out, _) = runtime.block_on(async {
            tokio::join!(
                engine.generate("User: hi\nAI:", &params),
                async { open.send(()).unwrap() },
            )
        });
        assert_eq!(out.unwrap(), "User: hi\nAI: done");
    }

    #[test]
    fn blocking_errors_propagate() {
        struct Broken;
        impl BlockingGenerator for Broken {
            fn generate_blocking(&self, _: &str, _: &GenerationParams) -> Result<String> {
                Err(anyhow!("out of memory"))
            }
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .build()
            .unwrap();
        let err = runtime
            .block_on(Offloaded::new(Broken).generate("x", &GenerationParams::default()))
            .unwrap_err();
        assert_eq!(err.to_string(), "out of memory");
    }

    #[test]
    fn default_params_match_service_decoding() {
        let p = GenerationParams::default();
        assert_eq!(p.max_new_tokens, 100);
        assert_eq!(p.temperature, 0.7);
        assert_eq!(p.top_p, 0.9);
        assert_eq!(p.top_k, 50);
        assert_eq!(p.repeat_penalty, 1.2);
    }

    #[test]
    fn cpu_label() {
        assert_eq!(device_label(&Device::Cpu), "cpu");
    }

    #[test]
    fn sizes_are_human_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.00 KiB");
        assert_eq!(format_size(3 * 1024 * 1024), "3.00 MiB");
    }
}
