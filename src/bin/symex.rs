//! The command-line front end: loads a program description, assembles the
//! engine configuration from the flags, and runs either a standalone
//! exploration or a full cluster.

use std::{path::PathBuf, process::ExitCode, rc::Rc, time::Duration};

use anyhow::{bail, Context};
use clap::Parser;
use rustc_hash::FxHashMap;
use symex_cluster::{
    cluster::run_cluster,
    engine::Engine,
    ir::{Analysis, Program},
    output::OutputHandler,
    search::{RecoverySearchKind, SearchKind},
    watchdog::{DeadlineWatchdog, LazyWatchdog},
    Config,
};

#[derive(Parser)]
#[command(name = "symex", version, about = "Distributed symbolic execution engine")]
struct Cli {
    /// A JSON program description as produced by the loader.
    program: PathBuf,

    /// The entry function.
    #[arg(long, default_value = "main")]
    entry: String,

    /// The directory test cases are written to.
    #[arg(short, long, default_value = "symex-out")]
    output_dir: PathBuf,

    /// The base search strategy.
    #[arg(long, value_enum, default_value_t = SearchKind::Bfs)]
    search: SearchKind,

    /// The recovery-lane search strategy.
    #[arg(long, value_enum, default_value_t = RecoverySearchKind::Dfs)]
    recovery_search: RecoverySearchKind,

    /// Keep recovery states in the base scheduling lane.
    #[arg(long)]
    no_split_search: bool,

    /// The recovery-lane visit ratio, out of 100.
    #[arg(long, default_value_t = 75)]
    split_ratio: u32,

    /// The maximum number of forks (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_forks: u64,

    /// The maximum exploration depth (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_depth: usize,

    /// The memory cap in megabytes (0 = unlimited).
    #[arg(long, default_value_t = 2000)]
    max_memory: usize,

    /// Keep forking even while over the memory cap.
    #[arg(long)]
    no_max_memory_inhibit: bool,

    /// Halt after this many instructions (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    stop_after_n_instructions: u64,

    /// The seed-replay time budget in seconds.
    #[arg(long, default_value_t = 0)]
    seed_time: u64,

    /// Allow external calls to receive symbolic arguments.
    #[arg(long)]
    allow_external_sym_calls: bool,

    /// Emit every error instead of deduplicating per location.
    #[arg(long)]
    emit_all_errors: bool,

    /// Only emit test cases for paths covering new code.
    #[arg(long)]
    only_output_states_covering_new: bool,

    /// Call whole callees in recovery states instead of slices.
    #[arg(long)]
    no_slicer: bool,

    /// Generate slices on first use.
    #[arg(long)]
    lazy_slicing: bool,

    /// Additional functions to skip, as `name` or `name:line1,line2`.
    #[arg(long = "skip-functions", value_delimiter = ';')]
    skip_functions: Vec<String>,

    /// Error locations as `basename:line1,line2`; the run halts once
    /// every listed location was hit.
    #[arg(long = "error-location", value_delimiter = ';')]
    error_locations: Vec<String>,

    /// The master's phase-one bound (0 = derived from the worker count).
    #[arg(long, default_value_t = 0)]
    exploration_depth: usize,

    /// The number of workers; 0 runs standalone without a master.
    #[arg(long, default_value_t = 0)]
    workers: usize,

    /// The global wall-clock budget in seconds (0 = unlimited).
    #[arg(long, default_value_t = 0)]
    max_time: u64,

    /// The per-query solver timeout in milliseconds.
    #[arg(long, default_value_t = 10_000)]
    solver_timeout: u64,

    /// Append every executed instruction to `instructions.txt`.
    #[arg(long)]
    log_instructions: bool,
}

fn parse_location_list(raw: &[String]) -> anyhow::Result<FxHashMap<String, Vec<u32>>> {
    let mut table = FxHashMap::default();
    for entry in raw {
        let (file, lines) = entry
            .split_once(':')
            .with_context(|| format!("malformed error location {entry:?}"))?;
        let lines = lines
            .split(',')
            .map(|line| line.trim().parse::<u32>())
            .collect::<Result<Vec<_>, _>>()
            .with_context(|| format!("malformed line list in {entry:?}"))?;
        table.insert(file.to_owned(), lines);
    }
    Ok(table)
}

fn build_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = Config {
        search: cli.search,
        recovery_search: cli.recovery_search,
        split_search: !cli.no_split_search,
        split_ratio: cli.split_ratio,
        max_forks: if cli.max_forks == 0 {
            u64::MAX
        } else {
            cli.max_forks
        },
        max_depth: cli.max_depth,
        max_memory_mb: cli.max_memory,
        max_memory_inhibit: !cli.no_max_memory_inhibit,
        stop_after_n_instructions: cli.stop_after_n_instructions,
        seed_time_secs: cli.seed_time,
        allow_external_sym_calls: cli.allow_external_sym_calls,
        emit_all_errors: cli.emit_all_errors,
        only_output_states_covering_new: cli.only_output_states_covering_new,
        use_slicer: !cli.no_slicer,
        lazy_slicing: cli.lazy_slicing,
        exploration_depth: cli.exploration_depth,
        error_locations: parse_location_list(&cli.error_locations)?,
        solver_timeout_ms: cli.solver_timeout,
        log_instructions: cli.log_instructions,
        ..Config::default()
    };
    // The config records the plain names; the line filters land in the
    // analysis tables.
    for entry in &cli.skip_functions {
        let name = entry.split_once(':').map_or(entry.as_str(), |(n, _)| n);
        config.skip_functions.push(name.to_owned());
    }
    Ok(config)
}

/// Merges the command-line skip list into the analysis tables.
fn apply_skip_flags(analysis: &mut Analysis, cli: &Cli) {
    for entry in &cli.skip_functions {
        match entry.split_once(':') {
            Some((name, lines)) => {
                let lines = lines
                    .split(',')
                    .filter_map(|line| line.trim().parse::<u32>().ok())
                    .collect();
                analysis.skip_function(name, lines);
                analysis.mark_side_effects(name);
            }
            None => {
                analysis.skip_function(entry.clone(), vec![]);
                analysis.mark_side_effects(entry.clone());
            }
        }
    }
}

fn main() -> anyhow::Result<ExitCode> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = build_config(&cli)?;

    let rendered = std::fs::read_to_string(&cli.program)
        .with_context(|| format!("cannot read {}", cli.program.display()))?;
    let (program, mut analysis) = load_program(&rendered)?;
    apply_skip_flags(&mut analysis, &cli);

    let bug_found = if cli.workers == 0 {
        let outputs = OutputHandler::new(Some(cli.output_dir.clone()))?;
        let watchdog = if cli.max_time == 0 {
            LazyWatchdog.in_rc()
        } else {
            DeadlineWatchdog::new(Duration::from_secs(cli.max_time)).in_rc()
        };
        let mut engine = Engine::new(
            Rc::new(program),
            Rc::new(analysis),
            config,
            watchdog,
            outputs,
            None,
            0,
        );
        let summary = engine.run_standalone(&cli.entry)?;
        println!(
            "done: {} tests ({} errors), {} instructions, {} forks",
            summary.tests_written,
            summary.errors_written,
            summary.stats.instructions,
            summary.stats.forks
        );
        summary.bug_found
    } else {
        let budget = (cli.max_time != 0).then(|| Duration::from_secs(cli.max_time));
        let outcome = run_cluster(
            &program,
            &analysis,
            &config,
            &cli.entry,
            cli.workers,
            Some(cli.output_dir.clone()),
            budget,
        )?;
        let tests: u64 = outcome.summaries.iter().map(|s| s.tests_written).sum();
        let errors: u64 = outcome.summaries.iter().map(|s| s.errors_written).sum();
        println!(
            "done: {} tests ({} errors) across {} nodes",
            tests,
            errors,
            outcome.summaries.len()
        );
        outcome.bug_found
    };

    // Non-zero exactly when a configured exit-on error was observed.
    Ok(if bug_found {
        ExitCode::from(1)
    } else {
        ExitCode::SUCCESS
    })
}

/// The loader's serialised output: the program plus its annotation
/// tables.
#[derive(serde::Deserialize)]
struct ProgramDescription {
    program:  Program,
    #[serde(default)]
    analysis: Analysis,
}

/// Parses the loader's JSON program description.
///
/// The loader itself is an external collaborator; this front end only
/// consumes its serialised output.
fn load_program(rendered: &str) -> anyhow::Result<(Program, Analysis)> {
    let description: ProgramDescription =
        serde_json::from_str(rendered).context("program description is not valid JSON")?;
    if description.program.functions().next().is_none() {
        bail!("program description carries no functions");
    }
    Ok((description.program, description.analysis))
}
