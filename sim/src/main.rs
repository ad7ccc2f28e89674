//! MCL SIM: A simulation harness for the Monte Carlo localization filter.
//!
//! The simulator plays the part of a robot: it drives a point robot through a map made of wall
//! segments, produces noisy wheel odometry and laser scans, feeds them to the localizer cycle by
//! cycle and records the estimate against the ground truth.
//!
//! You can run simulations either by:
//!   1. Loading filter parameters from a configuration file (TOML/JSON/YAML) with `--config`
//!   2. Relying on the built-in defaults
//!
//! Template configuration and map files are written by the `config` and `map` subcommands.

mod common;
mod scenario;

use clap::{Args, Parser, Subcommand};
use common::{ensure_parent_dir, init_logger, trial_output_path, validate_input_file};
use log::{error, info, warn};
use mcl::{InitialPose, LocalizationConfig, Localizer, Pose2D, SegmentMap};
use rayon::prelude::*;
use scenario::{
    Robot, ScenarioConfig, TrialSummary, default_room, log_summary, run_trial, summarize,
    write_particles, write_records,
};
use std::error::Error;
use std::path::{Path, PathBuf};

const LONG_ABOUT: &str = "MCL SIM: A simulation harness for the Monte Carlo localization filter.

A simulated robot drives through a map of wall segments while its noisy odometry and laser scans
are fed to the localizer. One CSV row is written per cycle with the true pose, the estimate, the
position and heading errors, the effective sample size and the outcome of the cycle.

Filter parameters come from a configuration file (TOML/JSON/YAML, see the `config` subcommand)
or from the built-in defaults. The map comes from a map file (see the `map` subcommand) or is a
built-in 8 m x 5 m room with a pillar.";

/// Command line arguments
#[derive(Parser)]
#[command(author, version, about = "A simulation harness for Monte Carlo localization.", long_about = LONG_ABOUT)]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// Log level (off, error, warn, info, debug, trace)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log file path (if not specified, logs to stderr)
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

/// Top-level commands
#[derive(Subcommand, Clone)]
enum Command {
    #[command(
        name = "run",
        about = "Run a localization simulation",
        long_about = "Drive a simulated robot through the map and localize it on every cycle. Several independent trials can be run in parallel with --trials; each gets its own seed and output file."
    )]
    Run(RunArgs),
    #[command(name = "config", about = "Write a template configuration file")]
    CreateConfig(OutputArgs),
    #[command(name = "map", about = "Write the built-in room as a map file")]
    CreateMap(OutputArgs),
}

/// Simulation arguments
#[derive(Args, Clone, Debug)]
struct RunArgs {
    /// Localization configuration file (TOML/JSON/YAML)
    #[arg(short, long, value_parser)]
    config: Option<PathBuf>,

    /// Map file (TOML/JSON/YAML); the built-in room is used if omitted
    #[arg(short, long, value_parser)]
    map: Option<PathBuf>,

    /// Output CSV file path
    /// With several trials, output filenames are generated as: {output_stem}_trial{n}.csv
    #[arg(short, long, value_parser)]
    output: PathBuf,

    /// Number of simulation cycles
    #[arg(long, default_value_t = 300)]
    steps: usize,

    /// Cycle period (s)
    #[arg(long, default_value_t = 0.1)]
    dt: f64,

    /// Forward speed (m/s)
    #[arg(long, default_value_t = 0.3)]
    speed: f64,

    /// Turn rate while driving (rad/s)
    #[arg(long, default_value_t = 0.2)]
    turn_rate: f64,

    /// Odometry noise as a fraction of the commanded motion
    #[arg(long, default_value_t = 0.05)]
    odom_noise: f64,

    /// Standard deviation of the simulated range noise (m)
    #[arg(long, default_value_t = 0.02)]
    range_noise: f64,

    /// Beams per simulated scan (full turn)
    #[arg(long, default_value_t = 180)]
    beams: usize,

    /// Start pose of the robot as `x,y,theta`; also used as the initial estimate unless the
    /// configuration file sets one
    #[arg(
        long,
        value_delimiter = ',',
        allow_hyphen_values = true,
        default_value = "0,0,0"
    )]
    start: Vec<f64>,

    /// RNG seed for the simulated robot (and for the filter unless the configuration sets one)
    #[arg(long, default_value_t = 42)]
    seed: u64,

    /// Number of independent trials, run in parallel
    #[arg(long, default_value_t = 1)]
    trials: usize,

    /// Write the final particle cloud of each trial to this CSV file
    #[arg(long, value_parser)]
    particles: Option<PathBuf>,
}

/// Arguments for the template-writing commands
#[derive(Args, Clone, Debug)]
struct OutputArgs {
    /// Output file path
    /// File extension determines format: .json, .yaml/.yml, or .toml (recommended)
    #[arg(short, long, value_parser)]
    output: PathBuf,
}

impl RunArgs {
    fn start_pose(&self) -> Result<Pose2D, Box<dyn Error>> {
        match self.start.as_slice() {
            [x, y, theta] => Ok(Pose2D::new(*x, *y, *theta)),
            other => Err(format!("--start expects x,y,theta, got {} values", other.len()).into()),
        }
    }

    fn scenario(&self, seed: u64) -> Result<ScenarioConfig, Box<dyn Error>> {
        if !(self.dt > 0.0) {
            return Err(format!("--dt must be positive, got {}", self.dt).into());
        }
        if self.beams == 0 {
            return Err("--beams must be positive".into());
        }
        Ok(ScenarioConfig {
            steps: self.steps,
            dt: self.dt,
            speed: self.speed,
            turn_rate: self.turn_rate,
            odom_noise: self.odom_noise,
            range_noise: self.range_noise,
            beams: self.beams,
            start: self.start_pose()?,
            seed,
            ..ScenarioConfig::default()
        })
    }
}

/// Template configuration written by `config`: the defaults with a fixed seed and initial pose.
fn template_config() -> LocalizationConfig {
    let mut config = LocalizationConfig::default();
    config.filter.seed = Some(42);
    config.initial_pose = Some(InitialPose {
        x: 0.0,
        y: 0.0,
        rz: 0.0,
    });
    config
}

fn load_config(args: &RunArgs) -> Result<LocalizationConfig, Box<dyn Error>> {
    let Some(path) = &args.config else {
        return Ok(LocalizationConfig::default());
    };
    validate_input_file(path)?;
    let config = LocalizationConfig::from_file(path)?;
    info!("loaded configuration from {}", path.display());
    Ok(config)
}

fn load_map(args: &RunArgs) -> Result<SegmentMap, Box<dyn Error>> {
    let Some(path) = &args.map else {
        return Ok(default_room());
    };
    validate_input_file(path)?;
    let map = SegmentMap::from_file(path)?;
    info!(
        "loaded map with {} segments from {}",
        map.segments.len(),
        path.display()
    );
    Ok(map)
}

fn run_single(
    config: &LocalizationConfig,
    scenario: ScenarioConfig,
    world: &SegmentMap,
    output: &Path,
    particles: Option<&Path>,
) -> Result<TrialSummary, Box<dyn Error>> {
    let mut localizer = Localizer::new(config)?;
    if config.initial_pose.is_none() {
        localizer.request_pose(scenario.start);
    }
    let mut robot = Robot::new(scenario);
    let records = run_trial(&mut localizer, &mut robot, world);

    ensure_parent_dir(output)?;
    write_records(output, &records)?;
    info!("wrote {} cycles to {}", records.len(), output.display());
    if let Some(path) = particles {
        ensure_parent_dir(path)?;
        write_particles(path, localizer.filter().particles())?;
        info!(
            "wrote {} particles to {}",
            localizer.filter().len(),
            path.display()
        );
    }
    Ok(summarize(&records))
}

fn run_simulation(args: &RunArgs) -> Result<(), Box<dyn Error>> {
    let config = load_config(args)?;
    let world = load_map(args)?;
    if args.trials == 0 {
        return Err("--trials must be at least 1".into());
    }

    if args.trials == 1 {
        let mut config = config;
        config.filter.seed.get_or_insert(args.seed);
        let summary = run_single(
            &config,
            args.scenario(args.seed)?,
            &world,
            &args.output,
            args.particles.as_deref(),
        )?;
        log_summary("trial", &summary);
        if summary.lost > 0 {
            warn!("localization was lost on {} cycles", summary.lost);
        }
        return Ok(());
    }

    let trials: Vec<(usize, LocalizationConfig, ScenarioConfig)> = (0..args.trials)
        .map(|i| {
            let seed = args.seed.wrapping_add(i as u64);
            let mut config = config.clone();
            config.filter.seed = Some(
                config
                    .filter
                    .seed
                    .map_or(seed, |s| s.wrapping_add(i as u64)),
            );
            args.scenario(seed).map(|scenario| (i, config, scenario))
        })
        .collect::<Result<_, _>>()?;

    let results: Vec<(usize, Result<TrialSummary, String>)> = trials
        .into_par_iter()
        .map(|(i, config, scenario)| {
            let output = trial_output_path(&args.output, i);
            let particles = args.particles.as_ref().map(|p| trial_output_path(p, i));
            let summary = run_single(&config, scenario, &world, &output, particles.as_deref())
                .map_err(|e| e.to_string());
            (i, summary)
        })
        .collect();

    let mut failures = 0;
    for (i, result) in results {
        match result {
            Ok(summary) => log_summary(&format!("trial {i}"), &summary),
            Err(e) => {
                error!("trial {i} failed: {e}");
                failures += 1;
            }
        }
    }
    if failures > 0 {
        return Err(format!("{failures} of {} trials failed", args.trials).into());
    }
    Ok(())
}

fn create_config_file(args: &OutputArgs) -> Result<(), Box<dyn Error>> {
    ensure_parent_dir(&args.output)?;
    template_config().to_file(&args.output)?;
    info!("wrote configuration template to {}", args.output.display());
    Ok(())
}

fn create_map_file(args: &OutputArgs) -> Result<(), Box<dyn Error>> {
    ensure_parent_dir(&args.output)?;
    default_room().to_file(&args.output)?;
    info!("wrote built-in map to {}", args.output.display());
    Ok(())
}

fn main() -> Result<(), Box<dyn Error>> {
    let cli = Cli::parse();
    init_logger(&cli.log_level, cli.log_file.as_ref())?;

    let result = match &cli.command {
        Command::Run(args) => run_simulation(args),
        Command::CreateConfig(args) => create_config_file(args),
        Command::CreateMap(args) => create_map_file(args),
    };
    if let Err(e) = &result {
        error!("{e}");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn run_args(output: PathBuf) -> RunArgs {
        RunArgs {
            config: None,
            map: None,
            output,
            steps: 10,
            dt: 0.1,
            speed: 0.3,
            turn_rate: 0.2,
            odom_noise: 0.05,
            range_noise: 0.02,
            beams: 90,
            start: vec![0.0, 0.0, 0.0],
            seed: 3,
            trials: 1,
            particles: None,
        }
    }

    #[test]
    fn test_cli_parses_run_arguments() {
        let cli = Cli::try_parse_from([
            "mcl-sim",
            "--log-level",
            "debug",
            "run",
            "--output",
            "out.csv",
            "--steps",
            "25",
            "--start",
            "1,2,0.5",
            "--trials",
            "4",
        ])
        .unwrap();
        assert_eq!(cli.log_level, "debug");
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.steps, 25);
        assert_eq!(args.trials, 4);
        assert_eq!(args.start_pose().unwrap(), Pose2D::new(1.0, 2.0, 0.5));
    }

    #[test]
    fn test_cli_start_pose_accepts_negative_and_default_values() {
        let cli = Cli::try_parse_from(["mcl-sim", "run", "-o", "out.csv", "--start", "-1.5,-0.5,-0.25"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.start_pose().unwrap(), Pose2D::new(-1.5, -0.5, -0.25));

        let cli = Cli::try_parse_from(["mcl-sim", "run", "-o", "out.csv"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert_eq!(args.start_pose().unwrap(), Pose2D::identity());

        let cli = Cli::try_parse_from(["mcl-sim", "run", "-o", "out.csv", "--start", "1,2"]).unwrap();
        let Command::Run(args) = cli.command else {
            panic!("expected run command");
        };
        assert!(args.start_pose().is_err());
    }

    #[test]
    fn test_invalid_scenario_arguments() {
        let mut args = run_args(PathBuf::from("out.csv"));
        args.dt = 0.0;
        assert!(args.scenario(1).is_err());
        args.dt = 0.1;
        args.start = vec![1.0];
        assert!(args.scenario(1).is_err());
    }

    #[test]
    fn test_templates_are_readable() {
        let dir = tempdir().unwrap();
        let config_path = dir.path().join("cfg").join("mcl.toml");
        create_config_file(&OutputArgs {
            output: config_path.clone(),
        })
        .unwrap();
        assert_eq!(
            LocalizationConfig::from_file(&config_path).unwrap(),
            template_config()
        );

        let map_path = dir.path().join("room.yaml");
        create_map_file(&OutputArgs {
            output: map_path.clone(),
        })
        .unwrap();
        assert_eq!(SegmentMap::from_file(&map_path).unwrap(), default_room());
    }

    #[test]
    fn test_run_writes_one_file_per_trial() {
        let dir = tempdir().unwrap();
        let mut args = run_args(dir.path().join("out.csv"));
        args.trials = 2;
        args.particles = Some(dir.path().join("cloud.csv"));
        run_simulation(&args).unwrap();
        for i in 0..2 {
            assert!(dir.path().join(format!("out_trial{i}.csv")).is_file());
            assert!(dir.path().join(format!("cloud_trial{i}.csv")).is_file());
        }
        assert!(!dir.path().join("out.csv").exists());
    }

    #[test]
    fn test_single_run_uses_the_output_path() {
        let dir = tempdir().unwrap();
        let args = run_args(dir.path().join("single.csv"));
        run_simulation(&args).unwrap();
        let reader = csv::Reader::from_path(dir.path().join("single.csv")).unwrap();
        assert_eq!(reader.into_records().count(), 11);
    }
}
