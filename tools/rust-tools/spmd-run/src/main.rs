use std::{path::PathBuf, process, thread, time::Duration};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand, ValueEnum};
use rand::Rng;
use serde::{de::DeserializeOwned, Serialize};
use spmd_launcher::{GlobalOrdinal, LaunchArgs, Launcher, RateTracker, WorkerContext};
use spmd_logging::{logging, LogOutput};
use tracing::{error, info, Level};

#[derive(Parser, Debug)]
#[command(name = "spmd-run")]
#[command(about = "Run a demo task on every device of an SPMD fleet")]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Launch the fleet and print the aggregated result as JSON on stdout
    Run {
        #[command(flatten)]
        launch: LaunchArgs,

        /// What every device slot computes
        #[arg(long, value_enum)]
        task: Task,

        #[command(flatten)]
        faults: Faults,

        #[arg(long, value_enum, default_value_t = LogOutput::Console)]
        logs: LogOutput,

        #[arg(long, default_value_t = Level::INFO)]
        log_level: Level,

        /// Append detailed logs to this file. `WRITE_RUST_LOG` sets its filter
        #[arg(long, env = "SPMD_WRITE_LOG")]
        write_log: Option<PathBuf>,
    },

    // Prints the help, optionally as markdown. Used for docs generation.
    #[clap(hide = true)]
    PrintAllHelp {
        #[arg(long, required = true)]
        markdown: bool,
    },
}

#[derive(clap::Args, Clone, Copy, Debug)]
struct Faults {
    /// Make the slot with this global ordinal fail instead of returning
    #[arg(long)]
    fail_on_ordinal: Option<usize>,

    /// Terminate the worker process hosting this global ordinal
    #[arg(long, hide = true)]
    exit_on_ordinal: Option<usize>,
}

impl Faults {
    fn inject(&self, ctx: &WorkerContext) -> Result<()> {
        let ordinal = Some(ctx.global_ordinal());
        if self.exit_on_ordinal.map(GlobalOrdinal) == ordinal {
            error!(ordinal = %ctx.global_ordinal(), "exiting worker process");
            process::exit(3);
        }
        if self.fail_on_ordinal.map(GlobalOrdinal) == ordinal {
            bail!("injected failure on ordinal {}", ctx.global_ordinal());
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Task {
    /// Each slot returns its global ordinal
    GlobalOrdinal,
    /// Each slot returns its local ordinal
    LocalOrdinal,
    /// Each slot returns the device it is bound to
    Device,
    /// The master draws a random number and every slot returns it
    Broadcast,
    /// Mean of `[1, global ordinal]` across the fleet
    AllReduce,
    /// Mean of every slot's global ordinal, reduced on each slot
    MeshReduce,
    /// Simulated steps per second, measured with a rate tracker
    Throughput,
}

impl Task {
    fn job(&self) -> String {
        match self.to_possible_value() {
            Some(value) => format!("spmd-run/{}", value.get_name()),
            None => "spmd-run".to_string(),
        }
    }
}

fn main() -> Result<()> {
    let args = Args::parse();

    match args.command {
        Commands::Run {
            launch,
            task,
            faults,
            logs,
            log_level,
            write_log,
        } => {
            logging()
                .with_output(logs)
                .with_level(log_level)
                .with_log_file(write_log)
                .init()?;

            let launcher = Launcher::new(launch.into_config()?);
            let job = task.job();
            let output = match task {
                Task::GlobalOrdinal => run(&launcher, &job, faults, |ctx| {
                    Ok(ctx.global_ordinal().get())
                })?,
                Task::LocalOrdinal => run(&launcher, &job, faults, |ctx| {
                    Ok(ctx.local_ordinal().get())
                })?,
                Task::Device => run(&launcher, &job, faults, |ctx| {
                    Ok(ctx.device().to_string())
                })?,
                Task::Broadcast => run(&launcher, &job, faults, |ctx| {
                    let seed: u32 = rand::rng().random_range(0..1_000_000);
                    ctx.master_info(format!("broadcasting {seed}"));
                    Ok(ctx.collective().broadcast_from_master(&seed)?)
                })?,
                Task::AllReduce => run(&launcher, &job, faults, |ctx| {
                    let values = [1.0f64, ctx.global_ordinal().get() as f64];
                    let scale = 1.0 / ctx.world_size() as f64;
                    Ok(ctx.collective().all_reduce_sum(&values, scale)?)
                })?,
                Task::MeshReduce => run(&launcher, &job, faults, |ctx| {
                    let ordinal = ctx.global_ordinal().get() as f64;
                    Ok(ctx
                        .collective()
                        .mesh_reduce("mean_ordinal", &ordinal, |values: Vec<f64>| {
                            values.iter().sum::<f64>() / values.len() as f64
                        })?)
                })?,
                Task::Throughput => run(&launcher, &job, faults, throughput)?,
            };
            println!("{output}");
            Ok(())
        }
        Commands::PrintAllHelp { markdown } => {
            // This is a required argument for the time being.
            assert!(markdown);

            let () = clap_markdown::print_help_markdown::<Args>();

            Ok(())
        }
    }
}

/// Launch `f` on every slot after injecting the requested `faults`.
fn run<T, F>(launcher: &Launcher, job: &str, faults: Faults, f: F) -> Result<serde_json::Value>
where
    T: Serialize + DeserializeOwned + Send + 'static,
    F: Fn(&WorkerContext) -> Result<T> + Send + Sync + 'static,
{
    let result = launcher.run_multiprocess(job, move |ctx| {
        faults.inject(ctx)?;
        f(ctx)
    })?;
    info!(job, results = result.len(), "collected results");
    Ok(serde_json::to_value(&result)?)
}

fn throughput(ctx: &WorkerContext) -> Result<f64> {
    const STEPS: usize = 10;
    const BATCH: u32 = 32;

    let mut tracker = RateTracker::new();
    for step in 0..STEPS {
        thread::sleep(Duration::from_millis(5));
        tracker.add(BATCH);
        if step % 5 == 4 {
            ctx.master_info(format!("step {step}: {:.1} samples/s", tracker.rate()));
        }
    }
    ctx.collective().barrier("throughput")?;
    Ok(tracker.global_rate())
}
