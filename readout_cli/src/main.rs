//! Command-line front end for readout training and reservoir grading.
//!
//! Examples:
//!   readout train topo.json data.csv labels.txt 0.1 0.0 4 10 10 '[0]' '[1]' balanced:100 2 42
//!   readout grade topo.json data.csv labels.txt 4 '[0]' '[1]' bin:8 2
//!   readout ranges data.csv
//!
//! Logs go to stderr (`RUST_LOG`, default `info`); results go to stdout.

use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process;

use spike_readout::dataset::{Dataset, FeatureRanges, LabelBase};
use spike_readout::encoder::{EncoderBank, EncoderKind};
use spike_readout::error::{DatasetError, SimError, TrainError};
use spike_readout::grade::{class_separation, collect_responses, min_pairwise_angle, GradeOptions};
use spike_readout::simulator::{ReservoirTopology, SpikingReservoir};
use spike_readout::storage;
use spike_readout::trainer::{train, ReportWindow, TrainerConfig};
use thiserror::Error;
use tracing::info;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Debug, Error)]
enum CliError {
    #[error("{path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{path}: {source}")]
    Dataset {
        path: PathBuf,
        #[source]
        source: DatasetError,
    },

    #[error("{path}: {source}")]
    Topology {
        path: PathBuf,
        #[source]
        source: SimError,
    },

    #[error(transparent)]
    Run(#[from] TrainError),

    #[error("cannot serialize report: {0}")]
    Json(#[from] serde_json::Error),
}

fn usage() -> ! {
    eprintln!("readout: train a linear readout over a spiking reservoir");
    eprintln!("Usage: readout <command> [args]\n");
    eprintln!("Commands:");
    eprintln!("  train <topology.json> <data> <labels> <learning_rate> <lambda> <threads> <epochs>");
    eprintln!("        <batch_size> <d_min> <d_max> <encoder> <num_classes> [seed]");
    eprintln!("        [--json <path>] [--save <path>] [--steps <n>] [--one-based]");
    eprintln!("        [--clamp <limit>] [--window batch|epoch] [--scale <divisor>] [--train-fraction <p>]");
    eprintln!("  grade <topology.json> <data> <labels> <threads> <d_min> <d_max> <encoder> <num_classes>");
    eprintln!("        [--steps <n>] [--one-based] [--all-neurons] [--grid <points_per_feature>] [--scale <divisor>]");
    eprintln!("  ranges <data>                Print per-feature min and max");
    eprintln!();
    eprintln!("  d_min / d_max are JSON arrays, one entry per feature, e.g. '[0.0, -1.5]'");
    eprintln!("  encoder is balanced:<timesteps> or bin:<num_bins>");
    process::exit(1);
}

fn make_error(msg: &str) -> ! {
    eprintln!("{msg}");
    process::exit(1);
}

/// Positional arguments plus the `--flag [value]` options pulled out of them.
struct Args {
    positional: Vec<String>,
    json: Option<PathBuf>,
    save: Option<PathBuf>,
    steps: Option<u32>,
    grid: Option<usize>,
    clamp: Option<f64>,
    window: Option<ReportWindow>,
    scale: Option<f64>,
    train_fraction: Option<f64>,
    one_based: bool,
    all_neurons: bool,
}

fn parse_args(raw: Vec<String>) -> Args {
    let mut args = Args {
        positional: Vec::new(),
        json: None,
        save: None,
        steps: None,
        grid: None,
        clamp: None,
        window: None,
        scale: None,
        train_fraction: None,
        one_based: false,
        all_neurons: false,
    };
    let mut it = raw.into_iter();
    while let Some(a) = it.next() {
        match a.as_str() {
            "--json" => args.json = Some(it.next().unwrap_or_else(|| usage()).into()),
            "--save" => args.save = Some(it.next().unwrap_or_else(|| usage()).into()),
            "--steps" => {
                let v = it.next().unwrap_or_else(|| usage());
                args.steps = Some(v.parse().unwrap_or_else(|_| make_error("--steps must be a positive integer")));
            }
            "--grid" => {
                let v = it.next().unwrap_or_else(|| usage());
                args.grid = Some(v.parse().unwrap_or_else(|_| make_error("--grid must be a positive integer")));
            }
            "--clamp" => args.clamp = Some(num(&it.next().unwrap_or_else(|| usage()), "--clamp")),
            "--window" => {
                let v = it.next().unwrap_or_else(|| usage());
                args.window = Some(window_arg(&v).unwrap_or_else(|| make_error("--window must be batch or epoch")));
            }
            "--scale" => args.scale = Some(num(&it.next().unwrap_or_else(|| usage()), "--scale")),
            "--train-fraction" => {
                args.train_fraction = Some(num(&it.next().unwrap_or_else(|| usage()), "--train-fraction"));
            }
            "--one-based" => args.one_based = true,
            "--all-neurons" => args.all_neurons = true,
            "-h" | "--help" => usage(),
            _ => args.positional.push(a),
        }
    }
    args
}

fn num<T: std::str::FromStr>(s: &str, what: &str) -> T {
    s.parse()
        .unwrap_or_else(|_| make_error(&format!("{what} must be a number, got `{s}`")))
}

fn ranges_arg(s: &str, what: &str) -> Vec<f64> {
    serde_json::from_str(s).unwrap_or_else(|_| make_error(&format!("{what} must be a JSON array of numbers")))
}

fn encoder_arg(s: &str) -> EncoderKind {
    EncoderKind::parse(s).unwrap_or_else(|| make_error("encoder must be balanced:<timesteps> or bin:<num_bins>"))
}

fn window_arg(s: &str) -> Option<ReportWindow> {
    match s {
        "batch" => Some(ReportWindow::Batch),
        "epoch" => Some(ReportWindow::Epoch),
        _ => None,
    }
}

/// Fold the optional numerics flags into `cfg`; unset flags keep the defaults.
fn with_numerics(mut cfg: TrainerConfig, args: &Args) -> TrainerConfig {
    if let Some(steps) = args.steps {
        cfg = cfg.with_sim_steps(steps);
    }
    if let Some(limit) = args.clamp {
        cfg = cfg.with_weight_clamp(limit);
    }
    if let Some(window) = args.window {
        cfg = cfg.with_report_window(window);
    }
    if let Some(scale) = args.scale {
        cfg = cfg.with_activation_scale(scale);
    }
    if let Some(fraction) = args.train_fraction {
        cfg = cfg.with_train_fraction(fraction);
    }
    cfg
}

fn open(path: &Path) -> Result<BufReader<File>, CliError> {
    File::open(path).map(BufReader::new).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn load_topology(path: &Path) -> Result<ReservoirTopology, CliError> {
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    ReservoirTopology::from_json(&text).map_err(|source| CliError::Topology {
        path: path.to_path_buf(),
        source,
    })
}

fn load_dataset(data: &Path, labels: &Path, base: LabelBase, num_classes: usize) -> Result<Dataset, CliError> {
    Dataset::from_readers(open(data)?, open(labels)?, base, num_classes).map_err(|source| CliError::Dataset {
        path: data.to_path_buf(),
        source,
    })
}

fn label_base(args: &Args) -> LabelBase {
    if args.one_based {
        LabelBase::One
    } else {
        LabelBase::Zero
    }
}

fn cmd_train(args: &Args) -> Result<(), CliError> {
    let p = &args.positional;
    if p.len() < 13 || p.len() > 14 {
        usage();
    }
    let topology = load_topology(Path::new(&p[1]))?;
    let num_classes: usize = num(&p[12], "num_classes");
    let bank = EncoderBank::from_ranges(encoder_arg(&p[11]), &ranges_arg(&p[9], "d_min"), &ranges_arg(&p[10], "d_max"))
        .map_err(TrainError::from)?;

    let cfg = TrainerConfig::default()
        .with_learning_rate(num(&p[4], "learning_rate"))
        .with_l2(num(&p[5], "lambda"))
        .with_threads(num(&p[6], "threads"))
        .with_epochs(num(&p[7], "epochs"))
        .with_batch_size(num(&p[8], "batch_size"))
        .with_num_classes(num_classes)
        .with_label_base(label_base(args));
    let mut cfg = with_numerics(cfg, args);
    if let Some(seed) = p.get(13) {
        cfg = cfg.with_seed(num(seed, "seed"));
    }
    cfg.validate().map_err(TrainError::from)?;

    let data = load_dataset(Path::new(&p[2]), Path::new(&p[3]), cfg.label_base, num_classes)?;
    info!(rows = data.len(), features = data.num_features(), "dataset loaded");

    let report = train::<SpikingReservoir>(&topology, data, &bank, &cfg)?;

    let stdout = io::stdout();
    let mut out = stdout.lock();
    let io_err = |source: io::Error| CliError::Io {
        path: PathBuf::from("<stdout>"),
        source,
    };
    writeln!(out, "Train accuracy: {:.4}", report.final_train_accuracy).map_err(io_err)?;
    if let Some(last) = report.windows.last() {
        write!(out, "Train confusion (last window):\n{}", last.confusion).map_err(io_err)?;
    }
    if let Some(test) = &report.test {
        writeln!(out, "Test accuracy: {:.4} (loss {:.4})", test.accuracy, test.loss).map_err(io_err)?;
        write!(out, "Test confusion:\n{}", test.confusion).map_err(io_err)?;
    }

    if let Some(path) = &args.json {
        let io_err = |source: io::Error| CliError::Io {
            path: path.clone(),
            source,
        };
        let mut w = BufWriter::new(File::create(path).map_err(io_err)?);
        serde_json::to_writer_pretty(&mut w, &report)?;
        w.flush().map_err(io_err)?;
        info!(path = %path.display(), "report written");
    }
    if let Some(path) = &args.save {
        let io_err = |source: io::Error| CliError::Io {
            path: path.clone(),
            source,
        };
        let mut w = BufWriter::new(File::create(path).map_err(io_err)?);
        storage::save_weights_to(&report.weights, &mut w).map_err(io_err)?;
        w.flush().map_err(io_err)?;
        info!(path = %path.display(), "weights saved");
    }
    Ok(())
}

fn cmd_grade(args: &Args) -> Result<(), CliError> {
    let p = &args.positional;
    if p.len() != 9 {
        usage();
    }
    let topology = load_topology(Path::new(&p[1]))?;
    let num_classes: usize = num(&p[8], "num_classes");
    let ranges = FeatureRanges {
        min: ranges_arg(&p[5], "d_min"),
        max: ranges_arg(&p[6], "d_max"),
    };
    let bank = EncoderBank::from_ranges(encoder_arg(&p[7]), &ranges.min, &ranges.max).map_err(TrainError::from)?;
    let mut options = GradeOptions {
        threads: num(&p[4], "threads"),
        all_neurons: args.all_neurons,
        ..GradeOptions::default()
    };
    if let Some(steps) = args.steps {
        options.sim_steps = steps;
    }

    let data = load_dataset(Path::new(&p[2]), Path::new(&p[3]), label_base(args), num_classes)?;
    let inputs: Vec<Vec<f64>> = data.observations().iter().map(|o| o.features.clone()).collect();
    let labels: Vec<usize> = data.observations().iter().map(|o| o.label).collect();

    let responses = collect_responses::<SpikingReservoir>(&topology, &bank, &inputs, &options)?;
    let matrix = class_separation(&responses, &labels, num_classes);
    println!("{matrix}");

    if let Some(points) = args.grid {
        let tests = vec![points; ranges.min.len()];
        let scale = with_numerics(TrainerConfig::default(), args).activation_scale;
        match min_pairwise_angle::<SpikingReservoir>(&topology, &bank, &ranges, &tests, scale, &options)? {
            Some(angle) => println!("Minimum pairwise angle: {angle:.6} rad"),
            None => println!("Minimum pairwise angle: n/a (fewer than two grid points)"),
        }
    }
    Ok(())
}

fn cmd_ranges(args: &Args) -> Result<(), CliError> {
    let p = &args.positional;
    if p.len() != 2 {
        usage();
    }
    let path = Path::new(&p[1]);
    // Labels are irrelevant here: one placeholder per line.
    let text = std::fs::read_to_string(path).map_err(|source| CliError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let placeholders = "0\n".repeat(text.lines().count());
    let data = Dataset::from_readers(text.as_bytes(), placeholders.as_bytes(), LabelBase::Zero, 1).map_err(|source| {
        CliError::Dataset {
            path: path.to_path_buf(),
            source,
        }
    })?;
    let ranges = FeatureRanges::scan(&data);
    println!("{}", serde_json::to_string(&ranges.min)?);
    println!("{}", serde_json::to_string(&ranges.max)?);
    Ok(())
}

fn main() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_writer(io::stderr).with_env_filter(filter).with_target(false).init();

    let args = parse_args(std::env::args().skip(1).collect());
    let Some(cmd) = args.positional.first() else {
        usage();
    };

    let result = match cmd.as_str() {
        "train" => cmd_train(&args),
        "grade" => cmd_grade(&args),
        "ranges" => cmd_ranges(&args),
        _ => usage(),
    };
    if let Err(e) = result {
        make_error(&format!("error: {e}"));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(line: &str) -> Args {
        parse_args(line.split_whitespace().map(String::from).collect())
    }

    #[test]
    fn numerics_flags_reach_the_config() {
        let args = parse("train --clamp 2.5 --window batch --scale 50 --train-fraction 0.5 --steps 30");
        assert_eq!(args.positional, vec!["train"]);

        let cfg = with_numerics(TrainerConfig::default(), &args);
        assert_eq!(cfg.weight_clamp, Some(2.5));
        assert_eq!(cfg.report_window, ReportWindow::Batch);
        assert_eq!(cfg.activation_scale, 50.0);
        assert_eq!(cfg.train_fraction, 0.5);
        assert_eq!(cfg.sim_steps, 30);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn unset_flags_keep_defaults() {
        let args = parse("grade a b c 4 [0] [1] bin:8 2 --all-neurons");
        assert_eq!(args.positional.len(), 9);
        assert!(args.all_neurons);

        let cfg = with_numerics(TrainerConfig::default(), &args);
        let defaults = TrainerConfig::default();
        assert_eq!(cfg.weight_clamp, None);
        assert_eq!(cfg.report_window, defaults.report_window);
        assert_eq!(cfg.activation_scale, defaults.activation_scale);
        assert_eq!(cfg.train_fraction, defaults.train_fraction);
    }

    #[test]
    fn window_names() {
        assert_eq!(window_arg("epoch"), Some(ReportWindow::Epoch));
        assert_eq!(window_arg("batch"), Some(ReportWindow::Batch));
        assert_eq!(window_arg("step"), None);
    }
}
