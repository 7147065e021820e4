use clap::{Parser, Subcommand, ValueEnum};
use gpt_rs::tokenizer::VOCAB_SIZE;
use gpt_rs::{Engine, GenerationParams, GptConfig, GptWeights, Model, PositionalEncoding, Tokenizer};
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::io::{self, Write};
use std::path::PathBuf;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "gpt-rs", version, about = "Small GPT inference engine")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Generate a continuation of a prompt
    Generate {
        /// Model file
        #[arg(long, env = "GPT_MODEL")]
        model: PathBuf,
        /// Prompt text
        #[arg(long, default_value = "")]
        prompt: String,
        /// Max tokens to generate
        #[arg(long, env = "GPT_MAX_TOKENS", default_value_t = 256)]
        max_tokens: usize,
        /// Sampling temperature, > 0
        #[arg(long, env = "GPT_TEMPERATURE", default_value_t = 0.7)]
        temperature: f32,
        /// Keep only the k most likely tokens
        #[arg(long, env = "GPT_TOP_K")]
        top_k: Option<usize>,
        /// Nucleus sampling mass in (0, 1]
        #[arg(long, env = "GPT_TOP_P")]
        top_p: Option<f32>,
        /// Penalty for repeated tokens, 1.0 = off
        #[arg(long, env = "GPT_REPETITION_PENALTY", default_value_t = 1.0)]
        repetition_penalty: f32,
        /// Random seed
        #[arg(long, env = "GPT_SEED")]
        seed: Option<u64>,
    },
    /// Print the token ids of a text
    Tokenize {
        #[arg(long)]
        text: String,
        /// Stop after this many tokens
        #[arg(long, default_value_t = 256)]
        max_context: usize,
    },
    /// Write a randomly initialized model file
    Init {
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value_t = 64)]
        dim: usize,
        #[arg(long, default_value_t = 2)]
        layers: usize,
        #[arg(long, default_value_t = 4)]
        heads: usize,
        #[arg(long, default_value_t = 256)]
        seq_len: usize,
        #[arg(long, value_enum, default_value_t = Positional::Sinusoidal)]
        positional: Positional,
        #[arg(long, default_value_t = 0)]
        seed: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Positional {
    None,
    Sinusoidal,
    Learned,
}

impl From<Positional> for PositionalEncoding {
    fn from(p: Positional) -> Self {
        match p {
            Positional::None => PositionalEncoding::None,
            Positional::Sinusoidal => PositionalEncoding::Sinusoidal,
            Positional::Learned => PositionalEncoding::Learned,
        }
    }
}

/// Writes streamed text as it arrives. The first write error stops further
/// output and is returned by [`StreamSink::finish`].
struct StreamSink<W: Write> {
    out: W,
    error: Option<io::Error>,
}

impl<W: Write> StreamSink<W> {
    fn new(out: W) -> Self {
        StreamSink { out, error: None }
    }

    fn push(&mut self, text: &str) {
        if self.error.is_some() {
            return;
        }
        if let Err(e) = self.out.write_all(text.as_bytes()).and_then(|_| self.out.flush()) {
            self.error = Some(e);
        }
    }

    fn finish(mut self) -> io::Result<()> {
        match self.error.take() {
            Some(e) => Err(e),
            None => writeln!(self.out),
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("gpt_rs=info")),
        )
        .with_writer(io::stderr)
        .init();

    match Cli::parse().command {
        Command::Generate {
            model,
            prompt,
            max_tokens,
            temperature,
            top_k,
            top_p,
            repetition_penalty,
            seed,
        } => {
            let engine = Engine::load(&model)?;
            let params = GenerationParams {
                max_new_tokens: max_tokens,
                temperature,
                top_k,
                top_p,
                repetition_penalty,
                seed,
            };

            let mut sink = StreamSink::new(io::stdout().lock());
            sink.push(&prompt);
            engine.generate_streaming(&prompt, &params, |piece| sink.push(piece))?;
            sink.finish()?;
        }
        Command::Tokenize { text, max_context } => {
            let tokenizer = Tokenizer::new(max_context);
            let tokens = tokenizer.encode(text.as_bytes());
            println!("{:?}", tokens);
        }
        Command::Init {
            out,
            dim,
            layers,
            heads,
            seq_len,
            positional,
            seed,
        } => {
            let config = GptConfig {
                vocab_size: VOCAB_SIZE,
                dim,
                n_layers: layers,
                n_heads: heads,
                seq_len,
                positional: positional.into(),
            };
            let weights = GptWeights::random(&config, &mut StdRng::seed_from_u64(seed))?;
            let model = Model::new(config, weights)?;
            model.save(&out)?;
            info!(path = %out.display(), params = model.weights().param_count(), "wrote model");
        }
    }

    Ok(())
}
