//! camera_operator: line console for the camera orchestrator.
//!
//! Starts the status polling loop and reads operator commands from stdin.

use anyhow::{anyhow, bail, Context, Result};
use camera_operator::config::Settings;
use camera_operator::observation::format_observation_time;
use camera_operator::polling::spawn_polling;
use camera_operator::runs::CalibrationRun;
use camera_operator::simulator::SimulatedController;
use camera_operator::state::{HvRange, InstrumentState, OnOffState, TriggerSetting};
use camera_operator::Orchestrator;
use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;

#[derive(Parser, Debug)]
#[command(name = "camera_operator")]
#[command(about = "Operate a camera through its camera server")]
struct Args {
    /// TOML settings file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Use the in-process simulated camera server
    #[arg(long)]
    simulate: bool,

    /// Camera address passed to the camera server
    #[arg(long)]
    address: Option<String>,

    /// Do not open the pulse generator
    #[arg(long)]
    no_pulse_generator: bool,
}

const HELP: &str = "\
commands:
  connect | disconnect | status
  goto <state>            request a state transition
  describe <state>        explain a state
  obstime <h:m:s>         duration of the next observation
  triggers <n>            trigger count of the next observation
  hv <low|medium|high>    HV preset (READY only)
  hvon | hvoff | daon | daoff | flasheron | flasheroff
  trigger <label>         e.g. EXTERNAL_600Hz, INTERNAL_HVMED_78pe (READY only)
  apply                   re-apply configuration files
  run <pedestal|tf>       calibration sequence
  quit";

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut settings =
        Settings::load(args.config.as_deref()).context("Failed to load settings")?;
    if let Some(address) = args.address {
        settings.controller.address = address;
    }
    if args.no_pulse_generator || args.simulate {
        settings.pulse_generator.enabled = false;
    }

    let simulator = args
        .simulate
        .then(|| SimulatedController::new(&settings.paths).with_state(InstrumentState::Ready));
    let orchestrator = Orchestrator::from_settings(settings.clone());

    if settings.pulse_generator.enabled {
        orchestrator
            .connect_pulse_generator()
            .await
            .context("Pulse generator is required for external triggering")?;
    }

    let shutdown = CancellationToken::new();
    let poller = spawn_polling(orchestrator.clone(), settings.polling.interval, shutdown.clone());

    info!("camera_operator ready, type 'help' for commands");
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            line = lines.next_line() => line?,
        };
        let Some(line) = line else { break };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if line == "quit" || line == "exit" {
            break;
        }
        if let Err(e) = execute(&orchestrator, simulator.as_ref(), line).await {
            error!("{:#}", e);
        }
    }

    shutdown.cancel();
    if let Err(e) = poller.await {
        warn!("Polling task ended abnormally: {}", e);
    }
    if let Err(e) = orchestrator.disconnect().await {
        warn!("Disconnect failed: {}", e);
    }
    Ok(())
}

async fn execute(
    orchestrator: &Orchestrator,
    simulator: Option<&SimulatedController>,
    line: &str,
) -> Result<()> {
    let (command, argument) = line.split_once(' ').unwrap_or((line, ""));
    let argument = argument.trim();
    match command {
        "help" => println!("{}", HELP),
        "connect" => match simulator {
            Some(simulator) => {
                let (reader, writer) = simulator.connect();
                orchestrator.attach(reader, writer).await?;
            }
            None => orchestrator.connect().await?,
        },
        "disconnect" => orchestrator.disconnect().await?,
        "status" => print_status(orchestrator).await,
        "goto" => orchestrator.go_to_state_named(argument).await?,
        "describe" => {
            let state: InstrumentState = argument
                .parse()
                .map_err(|name| anyhow!("Unknown state '{}'", name))?;
            println!("{}: {}", state, state.description());
        }
        "obstime" => orchestrator.set_observation_time_from_string(argument).await?,
        "triggers" => {
            let count = argument
                .parse()
                .with_context(|| format!("Invalid trigger count '{}'", argument))?;
            orchestrator.set_observation_trigger_count(count).await;
        }
        "hv" => {
            let range: HvRange = argument
                .parse()
                .map_err(|level| anyhow!("Unknown HV level '{}'", level))?;
            orchestrator.set_high_voltage_level(range).await?;
        }
        "hvon" => orchestrator.set_high_voltage(OnOffState::On).await?,
        "hvoff" => orchestrator.set_high_voltage(OnOffState::Off).await?,
        "daon" => orchestrator.set_data_sending(OnOffState::On).await?,
        "daoff" => orchestrator.set_data_sending(OnOffState::Off).await?,
        "flasheron" => orchestrator.set_flasher(OnOffState::On).await?,
        "flasheroff" => orchestrator.set_flasher(OnOffState::Off).await?,
        "trigger" => {
            let setting: TriggerSetting = argument
                .parse()
                .map_err(|label| anyhow!("Unknown trigger setting '{}'", label))?;
            orchestrator.set_trigger(setting).await?;
        }
        "apply" => orchestrator.apply_settings_files().await?,
        "run" => {
            let paths = orchestrator.settings().paths.clone();
            let recipe = match argument {
                "pedestal" => CalibrationRun::pedestal(paths),
                "tf" => CalibrationRun::transfer_function(paths),
                other => bail!("Unknown calibration run '{}'", other),
            };
            let orchestrator = orchestrator.clone();
            tokio::spawn(async move {
                match recipe.run(&orchestrator).await {
                    Ok(outcome) => info!("Calibration finished: {:?}", outcome),
                    Err(e) => error!("Calibration failed: {:#}", e),
                }
            });
        }
        other => bail!("Unknown command '{}', type 'help'", other),
    }
    Ok(())
}

async fn print_status(orchestrator: &Orchestrator) {
    let snapshot = orchestrator.snapshot();
    let transitions: Vec<&str> = snapshot.transitions.iter().map(|s| s.name()).collect();
    println!("state        {}", snapshot.state);
    println!("transitions  {}", transitions.join(" "));
    println!("hv           {} ({:?})", snapshot.high_voltage, snapshot.hv_level);
    println!("flasher      {}", snapshot.flasher);
    println!("data sending {}", snapshot.data_sending);
    println!("trigger      {} (camera {:?})", snapshot.trigger, snapshot.camera_trigger);
    println!("obstime      {}", orchestrator.observation_time_string().await);
    println!("triggers     {}", orchestrator.observation_spec().await.trigger_count);
    if let Some(run) = orchestrator.observation().await {
        let spec = run.spec();
        let since = run
            .started_at()
            .map_or_else(|| "-".to_string(), |t| t.format("%H:%M:%S").to_string());
        println!(
            "observation  {:?} since {} (bounds {}, {} triggers)",
            run.phase(),
            since,
            format_observation_time(spec.duration),
            spec.trigger_count
        );
    }
    for kind in camera_operator::state::ConfigFile::ALL {
        println!("{:<12} {}", kind.to_string(), snapshot.paths.get(kind));
    }
    println!("captured     {}", snapshot.captured_at.format("%H:%M:%S"));
}
