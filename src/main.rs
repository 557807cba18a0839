// rmtpp-train: fit an RMTPP model to event sequences stored as JSON.
//
//   rmtpp-train --data=events.json --numCategories=5 --epochs=3 --bptt=20
//
// Every `--key=value` that is not `data` or `epochs` is a model override.

use std::env;
use std::fs;
use std::process;

use rmtpp::{Result, Rmtpp, RmtppConfig, RmtppError, TrainingData};
use tracing::{error, info};
use tracing_subscriber::{fmt, EnvFilter};

struct Args {
    data_path: String,
    epochs: usize,
    config: RmtppConfig,
}

impl Args {
    fn parse(args: impl Iterator<Item = String>) -> Result<Self> {
        let mut data_path = None;
        let mut epochs = 1;
        let mut config = RmtppConfig::default();
        for arg in args {
            let arg = arg.trim_start_matches("--");
            let Some((key, value)) = arg.split_once('=') else {
                return Err(RmtppError::InvalidArgument(format!("expected --key=value, got '{}'", arg)));
            };
            match key.to_lowercase().as_str() {
                "data" => data_path = Some(value.to_string()),
                "epochs" => {
                    epochs = value
                        .parse()
                        .map_err(|_| RmtppError::InvalidArgument(format!("invalid epochs '{}'", value)))?
                }
                _ => {
                    if !config.apply_arg(key, value)? {
                        return Err(RmtppError::InvalidArgument(format!("unknown option --{}", key)));
                    }
                }
            }
        }
        let data_path = data_path.ok_or_else(|| RmtppError::InvalidArgument("--data=<file> is required".into()))?;
        Ok(Args { data_path, epochs, config })
    }
}

fn run() -> Result<()> {
    let args = Args::parse(env::args().skip(1))?;
    let data: TrainingData = serde_json::from_str(&fs::read_to_string(&args.data_path)?)?;
    info!(
        path = %args.data_path,
        sequences = data.num_sequences(),
        seq_len = data.seq_len(),
        "Loaded training data"
    );

    let mut model = Rmtpp::new(args.config)?;
    model.initialize(true);
    let reports = model.train(&data, args.epochs, false)?;
    if let Some(last) = reports.last() {
        info!(
            epochs = model.last_epoch(),
            global_step = model.global_step(),
            loss = last.mean_loss,
            "Training complete"
        );
    }
    Ok(())
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).with_target(false).with_writer(std::io::stdout).init();

    if let Err(e) = run() {
        error!("{}", e);
        eprintln!("Usage: rmtpp-train --data=<file.json> --numCategories=K [--epochs=N] [--bptt=T] ...");
        process::exit(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Result<Args> {
        Args::parse(list.iter().map(|s| s.to_string()))
    }

    #[test]
    fn splits_run_options_from_model_overrides() {
        let a = args(&["--data=seq.json", "--epochs=4", "--numCategories=7", "--hiddenLayerSize=16"]).unwrap();
        assert_eq!(a.data_path, "seq.json");
        assert_eq!(a.epochs, 4);
        assert_eq!(a.config.num_categories, Some(7));
        assert_eq!(a.config.hidden_layer_size, 16);
    }

    #[test]
    fn rejects_unknown_and_malformed_options() {
        assert!(args(&["--data=x.json", "--bogus=1"]).is_err());
        assert!(args(&["--data"]).is_err());
        assert!(args(&["--epochs=2"]).is_err());
    }
}
