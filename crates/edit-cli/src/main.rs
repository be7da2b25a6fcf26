use anyhow::{anyhow, Result};
use clap::{Parser, Subcommand, ValueEnum};
use edit_core::{load_dataset, DatasetKind, HyperParams, ParamStore, Tensor};
use edit_runner::analysis::{summarize_run, write_summary};
use edit_runner::selection::{sample_mask, sample_unique_subjects};
use edit_runner::{
    run_editing, CommandEvaluator, DownstreamEvaluator, Editor, Globals, NullEvaluator,
    RankOneEditor, RunConfig, RunInputs, RunReport,
};
use serde_json::{json, Value};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "medit", version, about = "Sequential model editing runner")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum AlgArg {
    #[value(name = "ROME", alias = "rome")]
    Rome,
}

impl AlgArg {
    fn as_str(&self) -> &'static str {
        match self {
            AlgArg::Rome => "ROME",
        }
    }

    fn editor(&self) -> Box<dyn Editor> {
        match self {
            AlgArg::Rome => Box::new(RankOneEditor),
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum DsArg {
    #[value(name = "cf")]
    Cf,
    #[value(name = "mcf")]
    Mcf,
    #[value(name = "zsre")]
    Zsre,
}

impl From<DsArg> for DatasetKind {
    fn from(value: DsArg) -> Self {
        match value {
            DsArg::Cf => DatasetKind::CounterFact,
            DsArg::Mcf => DatasetKind::MultiCounterFact,
            DsArg::Zsre => DatasetKind::Zsre,
        }
    }
}

#[derive(Subcommand)]
enum Commands {
    Run {
        #[arg(long, value_enum, default_value = "ROME")]
        alg_name: AlgArg,
        #[arg(long, default_value = "gpt2-xl")]
        model_name: String,
        #[arg(long)]
        model_path: Option<PathBuf>,
        #[arg(long, default_value = "gpt2-xl.json")]
        hparams_fname: String,
        #[arg(long, value_enum, default_value = "cf")]
        ds_name: DsArg,
        #[arg(long)]
        dataset_path: Option<PathBuf>,
        #[arg(long)]
        selection_path: Option<PathBuf>,
        #[arg(long)]
        continue_from_run: Option<String>,
        #[arg(long)]
        dataset_size_limit: Option<usize>,
        #[arg(long)]
        skip_generation_tests: bool,
        #[arg(long, default_value_t = 1, allow_hyphen_values = true)]
        generation_test_interval: i64,
        #[arg(long, default_value_t = 20)]
        downstream_eval_interval: u64,
        /// Benchmark command run against each downstream snapshot.
        #[arg(long, num_args = 1.., allow_hyphen_values = true)]
        downstream_command: Vec<String>,
        #[arg(long)]
        conserve_memory: bool,
        #[arg(long, default_value_t = 1)]
        num_edits: usize,
        #[arg(long)]
        use_cache: bool,
        #[arg(long)]
        sequential: bool,
        #[arg(long)]
        globals: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    Sample {
        #[arg(long)]
        dataset_path: PathBuf,
        #[arg(long)]
        n_samples: usize,
        #[arg(long, default_value_t = 37)]
        seed: u64,
        #[arg(long)]
        unique_subjects: bool,
        #[arg(long)]
        out: PathBuf,
        #[arg(long)]
        json: bool,
    },
    SynthModel {
        #[arg(long)]
        hparams: PathBuf,
        #[arg(long)]
        out: PathBuf,
        #[arg(long, default_value = "synthetic")]
        name: String,
        #[arg(long, default_value_t = 16)]
        rows: usize,
        #[arg(long, default_value_t = 32)]
        cols: usize,
        #[arg(long)]
        json: bool,
    },
    Summarize {
        #[arg(long)]
        run_dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
}

fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let json_mode = command_json_mode(&cli.command);
    let result = run_command(cli.command);
    match result {
        Ok(Some(payload)) => {
            emit_json(&payload);
            Ok(())
        }
        Ok(None) => Ok(()),
        Err(err) => {
            if json_mode {
                emit_json(&json_error("command_failed", format!("{:#}", err)));
                std::process::exit(1);
            }
            Err(err)
        }
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

fn run_command(command: Commands) -> Result<Option<Value>> {
    match command {
        Commands::Run {
            alg_name,
            model_name,
            model_path,
            hparams_fname,
            ds_name,
            dataset_path,
            selection_path,
            continue_from_run,
            dataset_size_limit,
            skip_generation_tests,
            generation_test_interval,
            downstream_eval_interval,
            downstream_command,
            conserve_memory,
            num_edits,
            use_cache,
            sequential,
            globals,
            json,
        } => {
            let globals = Globals::load(globals.as_deref())?;
            let config = RunConfig {
                alg_name: alg_name.as_str().to_string(),
                model_name,
                hparams_fname,
                ds_name: ds_name.into(),
                dataset_size_limit,
                continue_from_run,
                skip_generation_tests,
                generation_test_interval,
                downstream_eval_interval,
                conserve_memory,
                sequential,
                num_edits,
                use_cache,
                dir_name: alg_name.as_str().to_string(),
            };
            let inputs = RunInputs {
                model_path,
                dataset_path,
                selection_path,
            };
            let mut downstream: Box<dyn DownstreamEvaluator> = if downstream_command.is_empty() {
                Box::new(NullEvaluator)
            } else {
                let work_dir = globals
                    .results_dir
                    .join(&config.dir_name)
                    .join("downstream_work");
                Box::new(CommandEvaluator::new(downstream_command, &work_dir)?)
            };
            let editor = alg_name.editor();
            let report = run_editing(&config, &globals, &inputs, editor.as_ref(), downstream.as_mut())?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "run",
                    "mode": config.mode().as_str(),
                    "run": run_report_to_json(&report)
                })));
            }
            print_report(&report);
        }
        Commands::Sample {
            dataset_path,
            n_samples,
            seed,
            unique_subjects,
            out,
            json,
        } => {
            let dataset = load_dataset(&dataset_path, None)?;
            if n_samples > dataset.len() {
                return Err(anyhow!(
                    "cannot sample {} of {} records",
                    n_samples,
                    dataset.len()
                ));
            }
            let mask = if unique_subjects {
                sample_unique_subjects(&dataset, n_samples, seed)
            } else {
                sample_mask(dataset.len(), n_samples, seed)
            };
            mask.save(&out)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "sample",
                    "out": out.display().to_string(),
                    "entries": mask.len(),
                    "selected": mask.selected_count(),
                    "digest": mask.digest()
                })));
            }
            println!("mask: {}", out.display());
            println!("selected: {} of {}", mask.selected_count(), mask.len());
        }
        Commands::SynthModel {
            hparams,
            out,
            name,
            rows,
            cols,
            json,
        } => {
            let hparams = HyperParams::from_path(&hparams)?;
            let tracked = hparams.tracked_parameters();
            if tracked.is_empty() {
                return Err(anyhow!("hyperparameters list no layers"));
            }
            let mut store = ParamStore::new(&name);
            for (_, param) in tracked.iter() {
                store.insert(
                    param.clone(),
                    Tensor::seeded(&[rows, cols], &format!("{}:{}", name, param)),
                );
            }
            store.save(&out)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "synth-model",
                    "out": out.display().to_string(),
                    "parameters": tracked.iter().map(|(_, p)| p.clone()).collect::<Vec<_>>()
                })));
            }
            println!("model: {}", out.display());
            for (key, param) in tracked.iter() {
                println!("  {} -> {} [{}x{}]", key, param, rows, cols);
            }
        }
        Commands::Summarize { run_dir, json } => {
            let summary = summarize_run(&run_dir)?;
            let path = write_summary(&run_dir, &summary)?;
            if json {
                return Ok(Some(json!({
                    "ok": true,
                    "command": "summarize",
                    "summary_path": path.display().to_string(),
                    "summary": summary
                })));
            }
            println!("summary: {}", path.display());
            println!("cases: {}", summary.case_count);
            for (task, metrics) in summary.glue.iter() {
                for (metric, series) in metrics.iter() {
                    println!("  {}.{}: {} points", task, metric, series.len());
                }
            }
        }
    }
    Ok(None)
}

fn emit_json(value: &Value) {
    match serde_json::to_string(value) {
        Ok(s) => println!("{}", s),
        Err(_) => println!(
            "{{\"ok\":false,\"error\":{{\"code\":\"serialization_error\",\"message\":\"failed to serialize JSON payload\"}}}}"
        ),
    }
}

fn json_error(code: &str, message: String) -> Value {
    json!({
        "ok": false,
        "error": {
            "code": code,
            "message": message
        }
    })
}

fn command_json_mode(command: &Commands) -> bool {
    match command {
        Commands::Run { json, .. }
        | Commands::Sample { json, .. }
        | Commands::SynthModel { json, .. }
        | Commands::Summarize { json, .. } => *json,
    }
}

fn run_report_to_json(report: &RunReport) -> Value {
    json!({
        "run_id": report.run_id,
        "run_dir": report.run_dir.display().to_string(),
        "continued": report.continued,
        "batches_total": report.batches_total,
        "batches_processed": report.batches_processed,
        "batches_skipped": report.batches_skipped,
        "cases_written": report.cases_written,
        "evaluations": report
            .evaluations
            .iter()
            .map(|p| p.display().to_string())
            .collect::<Vec<_>>()
    })
}

fn print_report(report: &RunReport) {
    println!("run_id: {}", report.run_id);
    println!("run_dir: {}", report.run_dir.display());
    println!("continued: {}", report.continued);
    println!(
        "batches: {} total, {} processed, {} skipped",
        report.batches_total, report.batches_processed, report.batches_skipped
    );
    println!("cases_written: {}", report.cases_written);
    for path in report.evaluations.iter() {
        println!("evaluation: {}", path.display());
    }
}
