use std::{
    fs::File,
    io::{BufWriter, Read, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{bail, Result};
use clap::{command, CommandFactory, Parser, Subcommand};
use rwkv_feed_core::{
    binidx::{MmapIndexedDataset, MmapIndexedDatasetBuilder},
    worker_rng, Corpus, DecodeMode, NucleusSampler, ParallelConfig, Tokenizer, VocabDescriptor,
    Vocabulary, WindowedDataset, NUM_GPUS_VAR,
};

use crate::config::{Config, CorpusKind};

mod config;

const DEFAULT_CONFIG: &str = "assets/configs/Config.toml";

pub fn load_config(path: impl AsRef<Path>) -> Result<Config> {
    let contents = read_text(path)?;
    Ok(toml::from_str(&contents)?)
}

fn read_text(path: impl AsRef<Path>) -> Result<String> {
    let mut contents = String::new();
    File::open(path.as_ref())?.read_to_string(&mut contents)?;
    Ok(contents)
}

#[derive(Parser, Debug, Clone)]
#[command(author, version, about, long_about = None)]
pub struct Args {
    #[arg(long, short, value_name = "FILE")]
    config: Option<PathBuf>,
    /// Overrides the seed of the config.
    #[arg(long, short)]
    seed: Option<u64>,
    /// Index of this worker among `RWKV_NUM_GPUS`.
    #[arg(long, default_value_t = 0)]
    rank: usize,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, Clone)]
enum Command {
    /// Build the char vocabulary of a text corpus and persist it.
    Vocab {
        #[arg(long, value_name = "FILE")]
        corpus: Option<PathBuf>,
        #[arg(long, short, value_name = "FILE")]
        output: Option<PathBuf>,
    },
    /// Print random training windows as JSON lines.
    Windows {
        #[arg(long, short = 'n')]
        count: Option<usize>,
    },
    /// Encode a text corpus with a char vocabulary into a `.idx`/`.bin` pair, one document per line.
    Binidx {
        #[arg(long, value_name = "FILE")]
        corpus: PathBuf,
        #[arg(long, value_name = "FILE")]
        vocab: PathBuf,
        #[arg(long, short, value_name = "PREFIX")]
        output: PathBuf,
    },
    /// Sample one token per row of a JSON `[[f32]]` logits file.
    Sample {
        #[arg(long, value_name = "FILE")]
        logits: PathBuf,
        #[arg(long)]
        context: Option<String>,
    },
}

fn build_dataset(config: &Config, parallel: ParallelConfig) -> Result<WindowedDataset> {
    let dataset = &config.dataset;
    log::info!("reading corpus {}...", dataset.path.to_string_lossy());
    let corpus = match dataset.kind {
        CorpusKind::Text => {
            let corpus = Corpus::from_text(&read_text(&dataset.path)?);
            if let (Some(path), Some(vocab)) = (&dataset.vocab_output, corpus.vocab()) {
                vocab.save(path)?;
            }
            corpus
        }
        CorpusKind::Binidx => {
            let store = MmapIndexedDataset::open(&dataset.path)?;
            Corpus::indexed(Arc::new(store), dataset.vocab_size)
        }
    };
    Ok(WindowedDataset::new(corpus, dataset.options, parallel.num_gpus)?)
}

fn vocab(corpus: &Path, output: &Path) -> Result<()> {
    let text = read_text(corpus)?;
    let vocab = Vocabulary::from_chars(text.chars());
    vocab.save(output)
}

fn windows(dataset: &WindowedDataset, count: usize, rng: fastrand::Rng) -> Result<()> {
    let mut out = BufWriter::new(std::io::stdout().lock());
    for window in dataset.windows(rng).take(count) {
        serde_json::to_writer(&mut out, &window?)?;
        writeln!(out)?;
    }
    out.flush()?;
    Ok(())
}

fn binidx(corpus: &Path, vocab: &Path, output: &Path) -> Result<()> {
    let tokenizer = Tokenizer::new(&VocabDescriptor::Char { path: vocab.into() })?;
    let text = read_text(corpus)?;

    let mut builder = MmapIndexedDatasetBuilder::new();
    for line in text.split_inclusive('\n') {
        let tokens = tokenizer
            .encode(line)?
            .into_iter()
            .map(u16::try_from)
            .collect::<Result<Vec<_>, _>>()?;
        builder.add_document(&tokens);
    }
    builder.finish(output)
}

fn sample(config: &Config, logits: &Path, context: &str, mut rng: fastrand::Rng) -> Result<()> {
    let tokenizer = Tokenizer::new(&config.tokenizer)?;
    let sampler = NucleusSampler::new(config.sampler)?;

    let context = tokenizer.refine_context(context);
    let mut emitted = tokenizer.encode(&context)?;
    let prompt_len = emitted.len();

    let steps: Vec<Vec<f32>> = serde_json::from_str(&read_text(logits)?)?;
    for (step, logits) in steps.iter().enumerate() {
        if logits.len() != tokenizer.vocab_size() {
            bail!(
                "step {step} has {} logits for a vocabulary of {}",
                logits.len(),
                tokenizer.vocab_size()
            );
        }
        let token = sampler.sample(&tokenizer, logits, &emitted, &mut rng)?;
        log::debug!("[step: {step}][token: {token}]");
        emitted.push(token);
    }

    let output = tokenizer.decode(&emitted[prompt_len..])?;
    match tokenizer.mode() {
        DecodeMode::Char => print!("{output}"),
        DecodeMode::Bpe => println!("{output}"),
    }
    log::info!("sampled {} tokens", emitted.len() - prompt_len);
    Ok(())
}

fn main() -> Result<()> {
    simple_logger::SimpleLogger::new()
        .with_level(log::LevelFilter::Warn)
        .with_module_level("rwkv_feed", log::LevelFilter::Info)
        .with_module_level("rwkv_feed_core", log::LevelFilter::Info)
        .init()
        .expect("start logger");

    let args = Args::parse();

    let cmd = Args::command();
    let version = cmd.get_version().unwrap_or("0.0.1");
    let bin_name = cmd.get_bin_name().unwrap_or("rwkv-feed");
    log::info!("{}\tversion: {}", bin_name, version);

    let config = match &args.config {
        Some(path) => {
            log::info!("reading config {}...", path.to_string_lossy());
            load_config(path)?
        }
        None if Path::new(DEFAULT_CONFIG).exists() => {
            log::info!("reading config {}...", DEFAULT_CONFIG);
            load_config(DEFAULT_CONFIG)?
        }
        None => {
            log::warn!("no config found, using defaults");
            Config::default()
        }
    };

    let parallel = ParallelConfig::from_env_value(std::env::var(NUM_GPUS_VAR).ok().as_deref());
    if args.rank >= parallel.num_gpus {
        bail!("rank {} out of {} workers", args.rank, parallel.num_gpus);
    }
    let seed = args
        .seed
        .or(config.seed)
        .unwrap_or_else(|| fastrand::u64(..));
    log::info!("[seed: {seed}][rank: {}][num_gpus: {}]", args.rank, parallel.num_gpus);
    let rng = worker_rng(seed, args.rank);

    match args.command {
        Command::Vocab { corpus, output } => {
            let corpus = corpus.unwrap_or_else(|| config.dataset.path.clone());
            let output = output
                .or_else(|| config.dataset.vocab_output.clone())
                .unwrap_or_else(|| "vocab.json".into());
            vocab(&corpus, &output)
        }
        Command::Windows { count } => {
            let dataset = build_dataset(&config, parallel)?;
            windows(&dataset, count.unwrap_or(dataset.len()), rng)
        }
        Command::Binidx {
            corpus,
            vocab,
            output,
        } => binidx(&corpus, &vocab, &output),
        Command::Sample { logits, context } => {
            sample(&config, &logits, &context.unwrap_or_default(), rng)
        }
    }
}
