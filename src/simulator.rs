//! In-process stand-in for the camera server.
//!
//! Speaks the same line protocol as the real camera server over an in-memory
//! duplex stream, using the fallback transition table. Hooks let tests make
//! the reported state diverge from what was requested.

use crate::config::DefaultPaths;
use crate::snapshot::ConfigPaths;
use crate::state::{ConfigFile, InstrumentState, OnOffState, TransitionTable};
use log::{debug, warn};
use std::io;
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf};

const BANNER: &str = "Simulated camera server\nTransition table: fallback\n";

struct CameraModel {
    state: InstrumentState,
    table: TransitionTable,
    high_voltage: OnOffState,
    flasher: OnOffState,
    data_sending: OnOffState,
    defaults: ConfigPaths,
    paths: ConfigPaths,
    trigger_count: u64,
    trigger_step: u64,
    frozen: bool,
    exited: bool,
    commands: Vec<String>,
}

/// Simulated camera server. Clones share the same camera.
#[derive(Clone)]
pub struct SimulatedController {
    model: Arc<Mutex<CameraModel>>,
}

impl SimulatedController {
    /// Camera in OFF with every file at its well-known default.
    pub fn new(defaults: &DefaultPaths) -> Self {
        let mut paths = ConfigPaths::default();
        for kind in ConfigFile::ALL {
            *paths.slot_mut(kind) = defaults.config_file(kind).to_string_lossy().into_owned();
        }
        Self {
            model: Arc::new(Mutex::new(CameraModel {
                state: InstrumentState::Off,
                table: TransitionTable::fallback(),
                high_voltage: OnOffState::Off,
                flasher: OnOffState::Off,
                data_sending: OnOffState::Off,
                defaults: paths.clone(),
                paths,
                trigger_count: 0,
                trigger_step: 1,
                frozen: false,
                exited: false,
                commands: Vec::new(),
            })),
        }
    }

    /// Start in `state`.
    pub fn with_state(self, state: InstrumentState) -> Self {
        self.model().state = state;
        self
    }

    fn model(&self) -> MutexGuard<'_, CameraModel> {
        // A poisoned model only means a test panicked mid-command.
        self.model.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Open a session: returns the client's response reader and command writer.
    pub fn connect(&self) -> (ReadHalf<DuplexStream>, WriteHalf<DuplexStream>) {
        let (client, server) = tokio::io::duplex(4096);
        let sim = self.clone();
        tokio::spawn(async move {
            if let Err(e) = sim.serve(server).await {
                warn!("Simulated camera server stopped: {}", e);
            }
        });
        tokio::io::split(client)
    }

    /// Current camera state.
    pub fn state(&self) -> InstrumentState {
        self.model().state
    }

    /// Change the camera state behind the client's back.
    pub fn force_state(&self, state: InstrumentState) {
        self.model().state = state;
    }

    /// Acknowledge transition commands without changing state.
    pub fn freeze_state(&self, frozen: bool) {
        self.model().frozen = frozen;
    }

    /// Make the server exit, without replying, on the next line it receives.
    pub fn exit_on_next_command(&self) {
        self.model().exited = true;
    }

    /// Amount the backplane counter advances per read.
    pub fn set_trigger_step(&self, step: u64) {
        self.model().trigger_step = step;
    }

    /// Current backplane counter.
    pub fn trigger_count(&self) -> u64 {
        self.model().trigger_count
    }

    /// Path currently set for `kind`.
    pub fn path(&self, kind: ConfigFile) -> String {
        self.model().paths.get(kind).to_string()
    }

    /// Data sending status.
    pub fn data_sending(&self) -> OnOffState {
        self.model().data_sending
    }

    /// Every line received so far.
    pub fn commands(&self) -> Vec<String> {
        self.model().commands.clone()
    }

    async fn serve(&self, stream: DuplexStream) -> io::Result<()> {
        let (reader, mut writer) = tokio::io::split(stream);
        let mut lines = BufReader::new(reader).lines();

        writer.write_all(BANNER.as_bytes()).await?;
        writer.write_all(b"CS> ").await?;
        writer.flush().await?;

        while let Some(line) = lines.next_line().await? {
            let command = line.trim();
            if command == "exit" || self.model().exited {
                debug!("Simulated camera server exiting");
                break;
            }
            let reply = self.handle(command);
            writer.write_all(reply.as_bytes()).await?;
            writer.flush().await?;
        }
        Ok(())
    }

    fn handle(&self, command: &str) -> String {
        let mut model = self.model();
        model.commands.push(command.to_string());

        let query = |text: String| format!("CS> {}\ndone\n", text);
        let ack = "done\n".to_string();

        let (keyword, argument) = command.split_once(' ').unwrap_or((command, ""));
        match keyword {
            "state" => query(format!("state {}", model.state)),
            "transition" => {
                let allowed: Vec<&str> = model
                    .table
                    .allowed(model.state)
                    .iter()
                    .map(|s| s.name())
                    .collect();
                query(allowed.join(" "))
            }
            "hvch" => query(format!("hv {}", code(model.high_voltage))),
            "flch" => query(format!("flasher {}", code(model.flasher))),
            "dach" => query(format!("data {}", code(model.data_sending))),
            "trch" => query(format!("trigger {}", trigger_code(model.paths.get(ConfigFile::Trigger)))),
            "bptrig" => {
                let count = model.trigger_count;
                let step = model.trigger_step;
                model.trigger_count = count.saturating_add(step);
                query(format!("bptrig {}", count))
            }
            "hvon" | "hvoff" => {
                model.high_voltage = on_off(keyword == "hvon");
                ack
            }
            "enflasher" | "disflasher" => {
                model.flasher = on_off(keyword == "enflasher");
                ack
            }
            "daon" | "daoff" => {
                model.data_sending = on_off(keyword == "daon");
                ack
            }
            _ => {
                if let Some(kind) = ConfigFile::ALL
                    .into_iter()
                    .find(|kind| kind.get_command() == keyword)
                {
                    return query(format!("{} {}", kind.get_command(), model.paths.get(kind)));
                }
                if let Some(kind) = ConfigFile::from_set_command(keyword) {
                    let path = match argument.trim() {
                        "" => model.defaults.get(kind).to_string(),
                        path => path.to_string(),
                    };
                    *model.paths.slot_mut(kind) = path;
                    return ack;
                }
                if let Some(target) = keyword
                    .strip_prefix("to")
                    .and_then(|name| name.parse::<InstrumentState>().ok())
                {
                    if !model.frozen && model.table.is_allowed(model.state, target) {
                        model.state = target;
                    }
                    return ack;
                }
                warn!("Simulated camera server ignoring '{}'", command);
                ack
            }
        }
    }
}

fn code(state: OnOffState) -> i64 {
    match state {
        OnOffState::Off => 0,
        OnOffState::On => 1,
        OnOffState::Unknown => -1,
    }
}

fn on_off(on: bool) -> OnOffState {
    if on {
        OnOffState::On
    } else {
        OnOffState::Off
    }
}

fn trigger_code(path: &str) -> i64 {
    let name = path.rsplit('/').next().unwrap_or(path);
    if name.contains("external") {
        0
    } else if name.contains("threshold") {
        1
    } else {
        -1
    }
}
