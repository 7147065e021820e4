//! End-to-end tests: model files on disk, loading, and text generation.

use gpt_rs::tokenizer::VOCAB_SIZE;
use gpt_rs::{
    Engine, GenerationParams, GptConfig, GptError, GptWeights, LoadError, Model,
    PositionalEncoding, StopReason, load_model,
};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::tempdir;

fn config() -> GptConfig {
    GptConfig {
        vocab_size: VOCAB_SIZE,
        dim: 16,
        n_layers: 2,
        n_heads: 4,
        seq_len: 32,
        positional: PositionalEncoding::Sinusoidal,
    }
}

fn write_random_model(dir: &Path, config: GptConfig, seed: u64) -> PathBuf {
    let weights = GptWeights::random(&config, &mut StdRng::seed_from_u64(seed)).unwrap();
    let model = Model::new(config, weights).unwrap();
    let path = dir.join("model.bin");
    model.save(&path).unwrap();
    path
}

#[test]
fn test_load_and_generate() {
    let dir = tempdir().unwrap();
    let path = write_random_model(dir.path(), config(), 1);

    let engine = Engine::load(&path).unwrap();
    assert_eq!(engine.model().config(), &config());

    let params = GenerationParams {
        seed: Some(3),
        ..GenerationParams::new(16, 0.8)
    };
    let a = engine.generate_with("Once upon a time", &params).unwrap();
    let b = engine.generate_with("Once upon a time", &params).unwrap();
    assert_eq!(a, b);
    assert!(a.completion_tokens <= 16);
    assert!(a.prompt_tokens + a.completion_tokens <= 32);
}

#[test]
fn test_saved_model_reproduces_logits() {
    let dir = tempdir().unwrap();
    let config = GptConfig {
        positional: PositionalEncoding::Learned,
        ..config()
    };
    let weights = GptWeights::random(&config, &mut StdRng::seed_from_u64(8)).unwrap();
    let model = Model::new(config, weights).unwrap();
    let path = dir.path().join("learned.bin");
    model.save(&path).unwrap();

    let loaded = load_model(&path).unwrap();
    let tokens = [10, 20, 30, 40];
    assert_eq!(loaded.logits(&tokens).unwrap(), model.logits(&tokens).unwrap());
}

#[test]
fn test_missing_file() {
    let dir = tempdir().unwrap();
    let err = load_model(dir.path().join("absent.bin")).unwrap_err();
    assert!(matches!(err, LoadError::Open { .. }));

    let err = Engine::load(dir.path().join("absent.bin")).unwrap_err();
    assert!(matches!(err, GptError::Load(LoadError::Open { .. })));
}

#[test]
fn test_truncated_mid_embedding() {
    let dir = tempdir().unwrap();
    let path = write_random_model(dir.path(), config(), 2);

    // Header (32 bytes) + region prefix (8 bytes) + half of the embedding.
    let bytes = fs::read(&path).unwrap();
    let embedding_bytes = VOCAB_SIZE * 16 * 4;
    let cut = 32 + 8 + embedding_bytes / 2;
    fs::write(&path, &bytes[..cut]).unwrap();

    let err = load_model(&path).unwrap_err();
    match err {
        LoadError::Truncated {
            region,
            expected,
            actual,
        } => {
            assert_eq!(region, "embedding");
            assert_eq!(expected, embedding_bytes);
            assert_eq!(actual, embedding_bytes / 2);
        }
        other => panic!("expected truncation, got {:?}", other),
    }
}

#[test]
fn test_truncated_last_region() {
    let dir = tempdir().unwrap();
    let path = write_random_model(dir.path(), config(), 2);
    let bytes = fs::read(&path).unwrap();
    fs::write(&path, &bytes[..bytes.len() - 1]).unwrap();

    assert!(matches!(
        load_model(&path),
        Err(LoadError::Truncated {
            region: "feed_forward",
            ..
        })
    ));
}

#[test]
fn test_tokenize_detokenize() {
    let dir = tempdir().unwrap();
    let engine = Engine::load(write_random_model(dir.path(), config(), 4)).unwrap();

    let text = "XYZ 42!";
    let tokens = engine.tokenize(text);
    assert_eq!(tokens.len(), text.len());
    assert_eq!(engine.detokenize(&tokens), text);
}

#[test]
fn test_zero_budget() {
    let dir = tempdir().unwrap();
    let engine = Engine::load(write_random_model(dir.path(), config(), 5)).unwrap();
    assert_eq!(engine.generate("abc", 0, 1.0).unwrap(), "");
}

#[test]
fn test_concurrent_requests_are_independent() {
    let dir = tempdir().unwrap();
    let engine = Engine::load(write_random_model(dir.path(), config(), 6)).unwrap();

    let prompts = ["alpha", "bravo", "charlie", "delta"];
    let sequential: Vec<_> = prompts
        .iter()
        .enumerate()
        .map(|(i, p)| {
            let params = GenerationParams {
                seed: Some(i as u64),
                ..GenerationParams::new(12, 1.0)
            };
            engine.generate_with(p, &params).unwrap()
        })
        .collect();

    let parallel: Vec<_> = std::thread::scope(|scope| {
        let handles: Vec<_> = prompts
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let engine = engine.clone();
                scope.spawn(move || {
                    let params = GenerationParams {
                        seed: Some(i as u64),
                        ..GenerationParams::new(12, 1.0)
                    };
                    engine.generate_with(p, &params).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    assert_eq!(sequential, parallel);
}

#[test]
fn test_stop_reasons_are_reported() {
    let dir = tempdir().unwrap();
    let engine = Engine::load(write_random_model(dir.path(), config(), 7)).unwrap();
    let params = GenerationParams {
        seed: Some(1),
        ..GenerationParams::new(100, 1.0)
    };
    let c = engine.generate_with("0123456789", &params).unwrap();
    match c.stop {
        StopReason::Eos => assert!(c.completion_tokens <= 22),
        StopReason::ContextFull => assert_eq!(c.prompt_tokens + c.completion_tokens, 32),
        StopReason::MaxTokens => panic!("budget exceeds the context"),
    }
}
