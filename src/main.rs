//! Command-line entrypoint: resolve weights and configuration, then hand the
//! terminal to the editor.

use eyre::{Result, eyre};

pub mod buffer;
pub mod config;
pub mod discovery;
pub mod editor;
pub mod engine;
pub mod logging;
pub mod queue;
pub mod schedule;
pub mod tree;

struct CliArgs {
    file: Option<std::path::PathBuf>,
    model: Option<String>,
    snapshot_freq: Option<u32>,
    predict_main: Option<u32>,
    predict_alt: Option<u32>,
}

const USAGE: &str = "usage: arbor [file] [--model weights.gguf] \
[--snapshot-freq N] [--predict-main N] [--predict-alt N]";

fn parse_args() -> Result<CliArgs> {
    let mut args = std::env::args().skip(1);
    let mut parsed = CliArgs {
        file: None,
        model: None,
        snapshot_freq: None,
        predict_main: None,
        predict_alt: None,
    };

    fn next_value(args: &mut impl Iterator<Item = String>, flag: &str) -> Result<String> {
        args.next().ok_or_else(|| eyre!("{flag} needs a value"))
    }

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--model" => parsed.model = Some(next_value(&mut args, "--model")?),
            "--snapshot-freq" => {
                parsed.snapshot_freq = Some(next_value(&mut args, "--snapshot-freq")?.parse()?);
            }
            "--predict-main" => {
                parsed.predict_main = Some(next_value(&mut args, "--predict-main")?.parse()?);
            }
            "--predict-alt" => {
                parsed.predict_alt = Some(next_value(&mut args, "--predict-alt")?.parse()?);
            }
            "--help" | "-h" => {
                return Err(eyre!(USAGE));
            }
            _ if arg.starts_with('-') => {
                return Err(eyre!("unknown flag {arg}\n{USAGE}"));
            }
            _ => {
                if parsed.file.is_some() {
                    return Err(eyre!("only one file argument is supported\n{USAGE}"));
                }
                parsed.file = Some(arg.into());
            }
        }
    }
    Ok(parsed)
}

#[tokio::main]
async fn main() -> Result<()> {
    let log_rx = logging::install();
    let args = parse_args()?;

    if !atty::is(atty::Stream::Stdout) || !atty::is(atty::Stream::Stderr) {
        return Err(eyre!("arbor needs an interactive terminal"));
    }

    let mut config = config::Config::load();
    if let Some(model) = args.model {
        config.model_path = Some(model);
    }
    if let Some(freq) = args.snapshot_freq {
        config.snapshot_freq = freq.max(1);
    }
    if let Some(main) = args.predict_main {
        config.predict_main = main;
    }
    if let Some(alt) = args.predict_alt {
        config.predict_alt = alt;
    }

    let model_path = config
        .model_path
        .clone()
        .or_else(|| discovery::choose_best_model_path().map(|p| p.to_string_lossy().to_string()))
        .ok_or_else(|| {
            eyre!("no weights found; drop a .gguf under ~/.arbor/weights or pass --model")
        })?;

    tracing::info!(%model_path, "loading model");
    let rig = engine::llama::load(&model_path)?;

    config.model_path = Some(model_path);
    if let Err(e) = config.save() {
        tracing::warn!(%e, "could not persist config");
    }

    let vocab: std::sync::Arc<dyn engine::Vocab> = rig.vocab;
    let engine: Box<dyn engine::Engine> = rig.engine;
    editor::run(vocab, engine, rig.info, config, args.file, log_rx).await
}
