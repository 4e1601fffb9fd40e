use std::{path::PathBuf, time::Duration};

use brazo_geom::{ApproachAngle, EncoderPosition, InverseKinematics, Point};
use brazo_planner::{Dispatch, LinearMove, MotionPlanner};
use clap::{ArgAction, Parser, Subcommand};
use indicatif::ProgressBar;
use log::LevelFilter;
use reedline::{DefaultPrompt, DefaultPromptSegment, Prompt, Reedline};

use crate::{
    config::Settings,
    connection::{spawn_bus, BusHandle, DeviceTransport},
    simulator::SimulatedBus,
};

mod config;
mod connection;
mod simulator;

const TICK: Duration = Duration::from_millis(50);

type Planner = MotionPlanner<BusHandle>;

#[derive(Parser)]
#[command(version, about = "Drives a serial-servo robot arm")]
struct Args {
    /// A JSON settings file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// The servo controller's device, overriding the settings file.
    #[arg(long, global = true)]
    device: Option<PathBuf>,
    /// Drive an arm that only exists in memory.
    #[arg(long, global = true)]
    simulate: bool,
    #[arg(long, global = true)]
    speed: Option<f64>,
    /// Either "just_in_time" or "precomputed".
    #[arg(long, global = true)]
    dispatch: Option<Dispatch>,
    /// Log more. Repeat for even more.
    #[arg(short, long, global = true, action = ArgAction::Count)]
    verbose: u8,
    #[command(subcommand)]
    command: Option<Command>,
}

/// A single line typed into the shell.
#[derive(Parser)]
#[command(no_binary_name = true)]
struct ShellLine {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Command {
    /// Moves the arm servos to the given positions, base first.
    Movej {
        base: u16,
        shoulder: u16,
        elbow: u16,
        wrist: u16,
        hand: u16,
        #[arg(long, default_value_t = 1000)]
        time: u32,
    },
    /// Moves the tip of the hand to a point (in millimetres).
    #[command(allow_negative_numbers = true)]
    Movel {
        x: f64,
        y: f64,
        z: f64,
        #[arg(long, default_value_t = 1000)]
        time: u32,
        #[arg(long, default_value_t = 500)]
        orientation: u16,
        /// The angle of the hand, measured up from horizontal. Left out, the
        /// solver picks one.
        #[arg(long)]
        approach_deg: Option<f64>,
        #[arg(long, default_value_t = 1)]
        waypoints: u32,
    },
    /// Prints where the arm is.
    Position {
        #[arg(long)]
        cartesian: bool,
    },
    Grip {
        #[command(subcommand)]
        action: Grip,
    },
    /// Powers up the servos, holding the current pose.
    On,
    /// Powers down the servos.
    Off,
    /// Changes the speed multiplier.
    Speed { value: f64 },
    /// Reads commands interactively. This is the default.
    Shell,
}

#[derive(Subcommand, Debug, PartialEq)]
enum Grip {
    Open,
    Close { value: Option<u16> },
}

#[derive(Debug)]
enum Error {
    Exit,
    Err(anyhow::Error),
}

impl<E> From<E> for Error
where
    E: Into<anyhow::Error>,
{
    fn from(e: E) -> Self {
        Error::Err(e.into())
    }
}

type Result<T> = std::result::Result<T, Error>;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Info,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    pretty_env_logger::formatted_builder()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn load_settings(args: &Args) -> anyhow::Result<Settings> {
    let mut settings = match &args.config {
        Some(path) => Settings::load(path)?,
        None => Settings::default(),
    };
    if let Some(device) = &args.device {
        settings.device = device.clone();
    }
    if let Some(speed) = args.speed {
        settings.speed = speed;
    }
    if let Some(dispatch) = args.dispatch {
        settings.dispatch = dispatch;
    }
    Ok(settings)
}

async fn open_planner(settings: &Settings, simulate: bool) -> anyhow::Result<Planner> {
    let bus_config = settings.bus_config();
    let bus = if simulate {
        log::info!("using a simulated arm");
        spawn_bus(SimulatedBus::default(), bus_config)
    } else {
        let bar = ProgressBar::new_spinner()
            .with_message(format!("Opening {}...", settings.device.display()));
        bar.enable_steady_tick(TICK);
        let transport = DeviceTransport::open(&settings.device, settings.report_id).await?;
        bar.finish_with_message("connected!");
        spawn_bus(transport, bus_config)
    };

    let ik = InverseKinematics::with_config(settings.chain, settings.ik_config());
    let mut planner = MotionPlanner::new(bus, ik, settings.dispatch);
    planner.set_speed(settings.speed)?;
    log::debug!("speed {}, {:?} dispatch", planner.speed(), planner.dispatch());
    Ok(planner)
}

async fn run(planner: &mut Planner, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Movej {
            base,
            shoulder,
            elbow,
            wrist,
            hand,
            time,
        } => {
            let joints = EncoderPosition::from_array([base, shoulder, elbow, wrist, hand]);
            planner.move_joint(joints, time).await?;
        }
        Command::Movel {
            x,
            y,
            z,
            time,
            orientation,
            approach_deg,
            waypoints,
        } => {
            let approach = approach_deg
                .map(ApproachAngle::from_degrees)
                .unwrap_or_default();
            let mv = LinearMove::new(Point::new(x, y, z), time)
                .with_orientation(orientation)
                .with_approach(approach)
                .with_waypoints(waypoints);
            planner.move_linear(&mv).await?;
        }
        Command::Position { cartesian: true } => {
            let p = planner.cartesian_position().await?;
            println!("x: {}, y: {}, z: {}", p.x, p.y, p.z);
        }
        Command::Position { cartesian: false } => {
            let j = planner.position().await?;
            println!(
                "base: {}, shoulder: {}, elbow: {}, wrist: {}, hand: {}",
                j.base, j.shoulder, j.elbow, j.wrist, j.hand
            );
        }
        Command::Grip { action: Grip::Open } => planner.grip_open().await?,
        Command::Grip {
            action: Grip::Close { value },
        } => planner.grip_close(value).await?,
        Command::On => planner.motors_on().await?,
        Command::Off => planner.motors_off().await?,
        Command::Speed { value } => {
            planner.set_speed(value)?;
            log::info!("speed is now {}", planner.speed());
        }
        Command::Shell => eprintln!("already in the shell"),
    }
    Ok(())
}

fn read_cmd(reed: &mut Reedline, prompt: &dyn Prompt) -> Result<String> {
    let s = reed.read_line(prompt)?;
    match s {
        reedline::Signal::Success(s) => Ok(s),
        reedline::Signal::CtrlC | reedline::Signal::CtrlD => Err(Error::Exit),
    }
}

async fn shell(planner: &mut Planner) -> Result<()> {
    let mut reed = Reedline::create();
    let prompt = DefaultPrompt::new(
        DefaultPromptSegment::Basic("brazo".to_owned()),
        DefaultPromptSegment::Empty,
    );
    loop {
        let s = read_cmd(&mut reed, &prompt)?;
        let s = s.trim();

        if s.is_empty() {
            continue;
        } else if s == "quit" || s == "exit" {
            break;
        }

        let line = match ShellLine::try_parse_from(s.split_whitespace()) {
            Ok(line) => line,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };
        if let Err(e) = run(planner, line.command).await {
            eprintln!("error: {e:#}");
        }
    }

    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.verbose);

    let settings = load_settings(&args)?;
    let mut planner = open_planner(&settings, args.simulate).await?;

    match args.command.unwrap_or(Command::Shell) {
        Command::Shell => {
            if let Err(Error::Err(e)) = shell(&mut planner).await {
                return Err(e);
            }
            eprintln!("exiting...");
        }
        command => run(&mut planner, command).await?,
    }

    Ok(())
}
