// Dotlanth
// Copyright (C) 2025 Synerthink

// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.

// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU Affero General Public License for more details.

// You should have received a copy of the GNU Affero General Public License
// along with this program.  If not, see <http://www.gnu.org/licenses/>.

//! HazardLab CLI Tool
//!
//! Command-line entry point that loads a scenario, runs the simulation and
//! exits non-zero when a deadlock or a confirmed atomic violation was found.

use std::path::{Path, PathBuf};
use std::process;

use anyhow::Context;
use clap::{Parser, Subcommand, ValueEnum};
use hazardlab_core::{AllocationPolicy, ExecutionMode, PRESETS, Scenario, Simulation, SimulationReport};
use tracing::{error, info};

#[derive(Parser)]
#[command(name = "hazardlab")]
#[command(about = "HazardLab - resource contention simulator and hazard detector")]
#[command(version = "0.1.0")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a scenario from a JSON file
    Run {
        /// Scenario file
        scenario: PathBuf,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a built-in scenario
    Preset {
        /// Preset name (see `presets`)
        name: String,
        /// Override the allocation policy
        #[arg(long, value_enum)]
        policy: Option<PolicyArg>,
        /// Override the execution mode
        #[arg(long, value_enum)]
        mode: Option<ModeArg>,
        /// Override the run duration in milliseconds
        #[arg(long)]
        duration_ms: Option<u64>,
        /// Override the delay seed
        #[arg(long)]
        seed: Option<u64>,
        /// Break confirmed deadlocks by victimizing one actor
        #[arg(long)]
        resolve_deadlocks: bool,
        /// Print the full report as JSON
        #[arg(long)]
        json: bool,
    },
    /// List the built-in scenarios
    Presets,
}

#[derive(Clone, Copy, ValueEnum)]
enum PolicyArg {
    Fifo,
    Priority,
    PriorityAging,
}

impl From<PolicyArg> for AllocationPolicy {
    fn from(arg: PolicyArg) -> Self {
        match arg {
            PolicyArg::Fifo => AllocationPolicy::Fifo,
            PolicyArg::Priority => AllocationPolicy::Priority,
            PolicyArg::PriorityAging => AllocationPolicy::PriorityAging,
        }
    }
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    Guarded,
    Unguarded,
}

impl From<ModeArg> for ExecutionMode {
    fn from(arg: ModeArg) -> Self {
        match arg {
            ModeArg::Guarded => ExecutionMode::Guarded,
            ModeArg::Unguarded => ExecutionMode::Unguarded,
        }
    }
}

fn main() {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Run { scenario, json } => load_scenario(&scenario).and_then(|scenario| handle_run(scenario, json)),
        Commands::Preset {
            name,
            policy,
            mode,
            duration_ms,
            seed,
            resolve_deadlocks,
            json,
        } => Scenario::preset(&name)
            .with_context(|| format!("Failed to load preset {name}"))
            .and_then(|mut scenario| {
                if let Some(policy) = policy {
                    scenario.config.policy = policy.into();
                }
                if let Some(mode) = mode {
                    scenario.config.mode = mode.into();
                }
                if let Some(duration_ms) = duration_ms {
                    scenario.config.run_duration_ms = duration_ms;
                }
                if let Some(seed) = seed {
                    scenario.config.seed = seed;
                }
                scenario.config.resolve_deadlocks |= resolve_deadlocks;
                handle_run(scenario, json)
            }),
        Commands::Presets => {
            handle_list_presets();
            Ok(0)
        }
    };

    match result {
        Ok(code) => process::exit(code),
        Err(e) => {
            error!("Command failed: {:#}", e);
            process::exit(2);
        }
    }
}

fn load_scenario(path: &Path) -> anyhow::Result<Scenario> {
    let json = std::fs::read_to_string(path).with_context(|| format!("Failed to read scenario {}", path.display()))?;
    let scenario = Scenario::from_json(&json).with_context(|| format!("Invalid scenario {}", path.display()))?;
    info!("Loaded scenario {} from {}", scenario.name, path.display());
    Ok(scenario)
}

fn handle_run(scenario: Scenario, json: bool) -> anyhow::Result<i32> {
    let name = scenario.name.clone();
    let simulation = Simulation::new(scenario).with_context(|| format!("Failed to set up scenario {name}"))?;
    let report = simulation.run().with_context(|| format!("Simulation {name} aborted"))?;
    print_report(&report, json)?;
    Ok(report.exit_code())
}

fn print_report(report: &SimulationReport, json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report)?);
    } else {
        print!("{report}");
        for record in &report.violations {
            println!(
                "  [{}] {} at {} involving {:?}",
                record.kind,
                if record.is_confirmed() { "confirmed" } else { "suspected" },
                record.detected_at,
                record.involved_actors
            );
        }
    }
    Ok(())
}

fn handle_list_presets() {
    for (name, description) in PRESETS {
        println!("{name:<16} {description}");
    }
}
