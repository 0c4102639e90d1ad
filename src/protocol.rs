//! Camera server line protocol client.
//!
//! The camera server is a subprocess reading commands on stdin and answering on
//! stdout. Two exchange shapes exist:
//!
//! ```text
//! query:    > state\n            command:  > toready\n
//!           < CS> state READY\n            < done\n
//!           < done\n
//! ```
//!
//! Every read is bounded by the configured timeout. A timeout is reported as
//! [`ProtocolError::Timeout`] and left to the caller; a completion line without
//! the `done` token is a [`ProtocolError::Violation`].
//!
//! Reply lines still owed by a timed-out exchange are read and discarded
//! before the next command is written, so a late reply is never taken as the
//! answer to a later query. End of stream or an I/O error drops the session.

use crate::config::ControllerSettings;
use crate::error::ProtocolError;
use crate::state::{CameraTrigger, ConfigFile, FilePathRequest, InstrumentState, OnOffState};
use log::{debug, error, info, warn};
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, Command};
use tokio::time::timeout;

/// Query returning the backplane trigger counter.
pub const TRIGGER_COUNT_COMMAND: &str = "bptrig";

type CommandSink = Box<dyn AsyncWrite + Send + Unpin>;
type ResponseSource = BufReader<Box<dyn AsyncRead + Send + Unpin>>;

/// Switchable camera subsystems.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Subsystem {
    /// Photosensor high voltage.
    HighVoltage,
    /// LED flasher.
    Flasher,
    /// Event data sending.
    DataSending,
}

impl Subsystem {
    fn status_command(self) -> &'static str {
        match self {
            Subsystem::HighVoltage => "hvch",
            Subsystem::Flasher => "flch",
            Subsystem::DataSending => "dach",
        }
    }

    fn switch_command(self, on: bool) -> &'static str {
        match (self, on) {
            (Subsystem::HighVoltage, true) => "hvon",
            (Subsystem::HighVoltage, false) => "hvoff",
            (Subsystem::Flasher, true) => "enflasher",
            (Subsystem::Flasher, false) => "disflasher",
            (Subsystem::DataSending, true) => "daon",
            (Subsystem::DataSending, false) => "daoff",
        }
    }
}

struct Session {
    writer: CommandSink,
    reader: ResponseSource,
    /// Bytes of the line being read; survives a timed-out read.
    partial: Vec<u8>,
    /// Reply lines of abandoned exchanges not yet consumed.
    stale_lines: usize,
    /// Held so the process handle lives as long as the session.
    _child: Option<Child>,
}

enum BannerStatus {
    Prompt,
    Line,
    Silent,
    Closed,
}

/// Request/response client for the camera server.
///
/// Not safe for unsynchronised concurrent use; the orchestrator owns the only
/// instance and serialises access behind its lock.
pub struct ProtocolClient {
    executable: PathBuf,
    timeout: Duration,
    banner_timeout: Duration,
    prompt: String,
    done_token: String,
    session: Option<Session>,
}

impl ProtocolClient {
    /// Create an unconnected client that will launch `executable`.
    pub fn new(settings: &ControllerSettings, executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            timeout: settings.timeout,
            banner_timeout: settings.banner_timeout,
            prompt: settings.prompt.clone(),
            done_token: settings.done_token.clone(),
            session: None,
        }
    }

    /// Whether a camera server session is attached.
    pub fn is_connected(&self) -> bool {
        self.session.is_some()
    }

    /// Launch the camera server for `address`, logging to `log_path`.
    pub async fn connect(&mut self, address: &str, log_path: &Path) -> Result<(), ProtocolError> {
        if self.is_connected() {
            error!("Server already connected, disconnect first");
            return Err(ProtocolError::AlreadyConnected);
        }

        let command_line = format!(
            "{} {} -f {} --trust",
            self.executable.display(),
            address,
            log_path.display()
        );
        info!("Connecting to camera server: {}", command_line);

        let launch_error = |source: io::Error| ProtocolError::Connection {
            command: command_line.clone(),
            source,
        };

        let mut child = Command::new(&self.executable)
            .arg(address)
            .arg("-f")
            .arg(log_path)
            .arg("--trust")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(launch_error)?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| launch_error(io::Error::new(io::ErrorKind::Other, "stdin not piped")))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| launch_error(io::Error::new(io::ErrorKind::Other, "stdout not piped")))?;

        let stdout: Box<dyn AsyncRead + Send + Unpin> = Box::new(stdout);
        self.session = Some(Session {
            writer: Box::new(stdin),
            reader: BufReader::new(stdout),
            partial: Vec::new(),
            stale_lines: 0,
            _child: Some(child),
        });

        if let Err(e) = self.drain_banner().await {
            self.session = None;
            return Err(match e {
                ProtocolError::Closed(_) => launch_error(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "camera server exited during start-up",
                )),
                other => other,
            });
        }

        info!("Connected to camera server");
        Ok(())
    }

    /// Adopt an already-open response/command stream pair.
    ///
    /// Used for the simulated camera server and for tests.
    pub async fn attach<R, W>(&mut self, reader: R, writer: W) -> Result<(), ProtocolError>
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        if self.is_connected() {
            error!("Server already connected, disconnect first");
            return Err(ProtocolError::AlreadyConnected);
        }
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        self.session = Some(Session {
            writer: Box::new(writer),
            reader: BufReader::new(reader),
            partial: Vec::new(),
            stale_lines: 0,
            _child: None,
        });
        if let Err(e) = self.drain_banner().await {
            self.session = None;
            return Err(e);
        }
        info!("Attached to camera server stream");
        Ok(())
    }

    /// Send `exit` and drop the session without waiting for acknowledgment.
    pub async fn disconnect(&mut self) -> Result<(), ProtocolError> {
        let Some(mut session) = self.session.take() else {
            error!("No camera server connected");
            return Ok(());
        };
        info!("Disconnecting from camera server");
        let sent = async {
            session.writer.write_all(b"exit\n").await?;
            session.writer.flush().await
        };
        if let Err(e) = sent.await {
            warn!("Failed to send exit to camera server: {}", e);
        }
        info!("Disconnected from camera server");
        Ok(())
    }

    /// Issue a query and return its response line with the prompt stripped.
    ///
    /// Returns `Ok(None)` without any I/O when not connected.
    pub async fn query(&mut self, command: &str) -> Result<Option<String>, ProtocolError> {
        if !self.is_connected() {
            return Ok(None);
        }
        self.send(command).await?;
        let line = self.read_reply(command, 2).await?;
        let response = line.replace(&self.prompt, "").trim().to_string();
        let done = self.read_reply(command, 1).await?;
        self.expect_done(command, &done)?;
        debug!("'{}' -> '{}'", command, response);
        Ok(Some(response))
    }

    /// Issue a command that is acknowledged with a completion line only.
    pub async fn command(&mut self, command: &str) -> Result<(), ProtocolError> {
        if !self.is_connected() {
            warn!("No connection to camera server, '{}' not sent", command);
            return Ok(());
        }
        info!("Sending cmd: {}", command);
        self.send(command).await?;
        let done = self.read_reply(command, 1).await?;
        self.expect_done(command, &done)?;
        debug!("'{}' acknowledged", command);
        Ok(())
    }

    /// Current camera state; `Unknown` when not reported.
    pub async fn current_state(&mut self) -> Result<InstrumentState, ProtocolError> {
        Ok(self
            .query("state")
            .await?
            .map_or(InstrumentState::Unknown, |r| parse_state(&r)))
    }

    /// States the camera accepts as the next transition.
    pub async fn allowed_transitions(&mut self) -> Result<Vec<InstrumentState>, ProtocolError> {
        Ok(self
            .query("transition")
            .await?
            .map(|r| parse_transitions(&r))
            .unwrap_or_default())
    }

    /// Status of a switchable subsystem.
    pub async fn status(&mut self, subsystem: Subsystem) -> Result<OnOffState, ProtocolError> {
        Ok(self
            .query(subsystem.status_command())
            .await?
            .and_then(|r| parse_code(&r))
            .map_or(OnOffState::Unknown, OnOffState::from_code))
    }

    /// High-voltage status (`hvch`).
    pub async fn hv_status(&mut self) -> Result<OnOffState, ProtocolError> {
        self.status(Subsystem::HighVoltage).await
    }

    /// Flasher status (`flch`).
    pub async fn flasher_status(&mut self) -> Result<OnOffState, ProtocolError> {
        self.status(Subsystem::Flasher).await
    }

    /// Data sending status (`dach`).
    pub async fn data_sending_status(&mut self) -> Result<OnOffState, ProtocolError> {
        self.status(Subsystem::DataSending).await
    }

    /// Trigger source reported by the camera.
    pub async fn trigger_type(&mut self) -> Result<CameraTrigger, ProtocolError> {
        Ok(self
            .query("trch")
            .await?
            .and_then(|r| parse_code(&r))
            .map_or(CameraTrigger::Unknown, CameraTrigger::from_code))
    }

    /// Backplane trigger counter; 0 when not reported.
    pub async fn backplane_trigger_count(&mut self) -> Result<u64, ProtocolError> {
        Ok(self
            .query(TRIGGER_COUNT_COMMAND)
            .await?
            .and_then(|r| last_token(&r).and_then(|t| t.parse().ok()))
            .unwrap_or(0))
    }

    /// Path of a configuration file; empty when not reported.
    pub async fn file_path(&mut self, kind: ConfigFile) -> Result<String, ProtocolError> {
        Ok(self
            .query(kind.get_command())
            .await?
            .and_then(|r| last_token(&r).map(str::to_string))
            .unwrap_or_default())
    }

    /// Request a state transition. Does not verify the outcome.
    pub async fn go_to_state(&mut self, state: InstrumentState) -> Result<(), ProtocolError> {
        self.command(&state.transition_command()).await
    }

    /// Switch a subsystem on or off.
    pub async fn switch(&mut self, subsystem: Subsystem, on: bool) -> Result<(), ProtocolError> {
        self.command(subsystem.switch_command(on)).await
    }

    /// Point the camera server at a configuration file.
    pub async fn set_file_path(
        &mut self,
        kind: ConfigFile,
        request: &FilePathRequest,
    ) -> Result<(), ProtocolError> {
        let command = match request {
            FilePathRequest::Path(path) => format!("{} {}", kind.set_command(), path),
            FilePathRequest::Default => kind.set_command().to_string(),
        };
        self.command(command.trim()).await
    }

    async fn send(&mut self, command: &str) -> Result<(), ProtocolError> {
        self.discard_stale(command).await?;
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ProtocolError::Closed(command.to_string()))?;
        let line = format!("{}\n", command);
        let write = async {
            session.writer.write_all(line.as_bytes()).await?;
            session.writer.flush().await
        };
        let result = match timeout(self.timeout, write).await {
            Ok(result) => result.map_err(ProtocolError::from),
            Err(_) => Err(ProtocolError::Timeout {
                command: command.to_string(),
                after: self.timeout,
            }),
        };
        result.map_err(|e| self.check_lost(e))
    }

    /// Read one of the `remaining` reply lines of `command`. On timeout the
    /// unread lines are recorded as owed.
    async fn read_reply(&mut self, command: &str, remaining: usize) -> Result<String, ProtocolError> {
        match self.read_line(command).await {
            Err(e @ ProtocolError::Timeout { .. }) => {
                if let Some(session) = self.session.as_mut() {
                    session.stale_lines += remaining;
                }
                Err(e)
            }
            other => other,
        }
    }

    /// Consume reply lines of earlier timed-out exchanges.
    async fn discard_stale(&mut self, command: &str) -> Result<(), ProtocolError> {
        loop {
            match self.session.as_ref() {
                Some(session) if session.stale_lines > 0 => {}
                _ => return Ok(()),
            }
            match self.read_line(command).await {
                Ok(line) => {
                    debug!("Discarding late reply: {}", line.trim_end());
                    if let Some(session) = self.session.as_mut() {
                        session.stale_lines -= 1;
                    }
                }
                Err(ProtocolError::Timeout { .. }) => {
                    let owed = self.session.as_ref().map_or(0, |s| s.stale_lines);
                    error!("Camera server still owes {} reply lines, '{}' not sent", owed, command);
                    return Err(ProtocolError::Violation {
                        command: command.to_string(),
                        line: format!("{} reply lines outstanding", owed),
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn read_line(&mut self, command: &str) -> Result<String, ProtocolError> {
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ProtocolError::Closed(command.to_string()))?;
        // read_until keeps partial input in `partial` if the timeout fires.
        let read = session.reader.read_until(b'\n', &mut session.partial);
        let result = match timeout(self.timeout, read).await {
            Err(_) => {
                warn!("{} timeout", command);
                Err(ProtocolError::Timeout {
                    command: command.to_string(),
                    after: self.timeout,
                })
            }
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(_)) if session.partial.last() != Some(&b'\n') => {
                Err(ProtocolError::Closed(command.to_string()))
            }
            Ok(Ok(_)) => {
                let line = std::mem::take(&mut session.partial);
                Ok(String::from_utf8_lossy(&line).into_owned())
            }
        };
        result.map_err(|e| self.check_lost(e))
    }

    /// Drop the session if `e` means the camera server is gone.
    fn check_lost(&mut self, e: ProtocolError) -> ProtocolError {
        if e.is_connection_lost() && self.session.take().is_some() {
            error!("Lost connection to camera server: {}", e);
        }
        e
    }

    fn expect_done(&self, command: &str, line: &str) -> Result<(), ProtocolError> {
        if line.contains(&self.done_token) {
            Ok(())
        } else {
            error!("{} unexpected readline response: {:?}", command, line);
            Err(ProtocolError::Violation {
                command: command.to_string(),
                line: line.trim().to_string(),
            })
        }
    }

    /// Consume start-up output until the response prompt is next in the stream.
    async fn drain_banner(&mut self) -> Result<(), ProtocolError> {
        let banner_timeout = self.banner_timeout;
        let prompt = self.prompt.as_bytes().to_vec();
        let session = self
            .session
            .as_mut()
            .ok_or_else(|| ProtocolError::Closed("startup".to_string()))?;

        loop {
            let status = match timeout(banner_timeout, session.reader.fill_buf()).await {
                Err(_) => BannerStatus::Silent,
                Ok(Err(e)) => return Err(e.into()),
                Ok(Ok(buf)) if buf.is_empty() => BannerStatus::Closed,
                Ok(Ok(buf)) if buf.starts_with(&prompt) => BannerStatus::Prompt,
                Ok(Ok(_)) => BannerStatus::Line,
            };
            match status {
                BannerStatus::Prompt => return Ok(()),
                BannerStatus::Silent => {
                    debug!("No prompt within {:?}, assuming banner complete", banner_timeout);
                    return Ok(());
                }
                BannerStatus::Closed => return Err(ProtocolError::Closed("startup".to_string())),
                BannerStatus::Line => {
                    let mut line = String::new();
                    match timeout(banner_timeout, session.reader.read_line(&mut line)).await {
                        Ok(read) => {
                            read?;
                        }
                        Err(_) => return Ok(()),
                    }
                    debug!("{}", line.trim_end());
                }
            }
        }
    }
}

fn last_token(response: &str) -> Option<&str> {
    response.split_whitespace().last()
}

fn parse_code(response: &str) -> Option<i64> {
    last_token(response)?.parse().ok()
}

fn parse_state(response: &str) -> InstrumentState {
    match last_token(response) {
        Some(token) => token.parse().unwrap_or_else(|_| {
            warn!("Unrecognised camera state '{}'", token);
            InstrumentState::Unknown
        }),
        None => InstrumentState::Unknown,
    }
}

fn parse_transitions(response: &str) -> Vec<InstrumentState> {
    response
        .split_whitespace()
        .filter_map(|token| match token.parse() {
            Ok(state) => Some(state),
            Err(_) => {
                warn!("Ignoring unrecognised transition '{}'", token);
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::io::Builder;

    fn settings(timeout: Duration) -> ControllerSettings {
        ControllerSettings {
            timeout,
            banner_timeout: timeout,
            ..ControllerSettings::default()
        }
    }

    async fn client_over(mock: tokio_test::io::Mock) -> ProtocolClient {
        let (reader, writer) = tokio::io::split(mock);
        let mut client = ProtocolClient::new(&settings(Duration::from_secs(1)), "control_cs");
        client.attach(reader, writer).await.unwrap();
        client
    }

    #[test]
    fn parses_last_token() {
        assert_eq!(parse_state("Current state: READY"), InstrumentState::Ready);
        assert_eq!(parse_state("state nonsense"), InstrumentState::Unknown);
        assert_eq!(parse_state(""), InstrumentState::Unknown);
        assert_eq!(parse_code("hv status 1"), Some(1));
        assert_eq!(parse_code("hv status -1"), Some(-1));
        assert_eq!(parse_code("hv status x"), None);
    }

    #[test]
    fn parses_transition_list() {
        assert_eq!(
            parse_transitions("ready safe bogus observing"),
            vec![
                InstrumentState::Ready,
                InstrumentState::Safe,
                InstrumentState::Observing
            ]
        );
        assert!(parse_transitions("").is_empty());
    }

    #[tokio::test]
    async fn banner_is_drained_before_first_query() {
        let mock = Builder::new()
            .read(b"Camera server v1.2\nlistening on 0.0.0.0\nCS> ")
            .write(b"state\n")
            .read(b"CS> state READY\n")
            .read(b"done\n")
            .build();
        let mut client = client_over(mock).await;
        assert_eq!(client.current_state().await.unwrap(), InstrumentState::Ready);
    }

    #[tokio::test]
    async fn typed_queries_parse_final_token() {
        let mock = Builder::new()
            .read(b"CS> ")
            .write(b"hvch\n")
            .read(b"CS> hv 1\ndone\n")
            .write(b"gettrigger\n")
            .read(b"CS> trigger file /ci/config/gui_external.cfg\ndone\n")
            .write(b"trch\n")
            .read(b"CS> trigger 0\ndone\n")
            .write(b"bptrig\n")
            .read(b"CS> count 4312\ndone\n")
            .build();
        let mut client = client_over(mock).await;

        assert_eq!(client.status(Subsystem::HighVoltage).await.unwrap(), OnOffState::On);
        assert_eq!(
            client.file_path(ConfigFile::Trigger).await.unwrap(),
            "/ci/config/gui_external.cfg"
        );
        assert_eq!(client.trigger_type().await.unwrap(), CameraTrigger::External);
        assert_eq!(client.backplane_trigger_count().await.unwrap(), 4312);
    }

    #[tokio::test]
    async fn empty_response_yields_sentinels() {
        let mock = Builder::new()
            .read(b"CS> ")
            .write(b"flch\n")
            .read(b"CS> \ndone\n")
            .write(b"getrun\n")
            .read(b"CS> \ndone\n")
            .build();
        let mut client = client_over(mock).await;

        assert_eq!(client.status(Subsystem::Flasher).await.unwrap(), OnOffState::Unknown);
        assert_eq!(client.file_path(ConfigFile::Run).await.unwrap(), "");
    }

    #[tokio::test]
    async fn missing_completion_marker_is_a_violation() {
        let mock = Builder::new()
            .read(b"CS> ")
            .write(b"state\n")
            .read(b"CS> state READY\nCS> state READY\n")
            .build();
        let mut client = client_over(mock).await;

        let err = client.query("state").await.unwrap_err();
        assert!(matches!(err, ProtocolError::Violation { .. }), "{err:?}");
    }

    #[tokio::test]
    async fn command_checks_completion_line() {
        let mock = Builder::new()
            .read(b"CS> ")
            .write(b"configfile /ci/config/checM.cfg\n")
            .read(b"CS> done\n")
            .write(b"monfile\n")
            .read(b"CS> error\n")
            .build();
        let mut client = client_over(mock).await;

        client
            .set_file_path(ConfigFile::Config, &FilePathRequest::path("/ci/config/checM.cfg"))
            .await
            .unwrap();
        let err = client
            .set_file_path(ConfigFile::MonitorConfig, &FilePathRequest::Default)
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Violation { .. }));
    }

    #[tokio::test]
    async fn silent_server_times_out_recoverably() {
        let (client_end, _server_end) = tokio::io::duplex(256);
        let (reader, writer) = tokio::io::split(client_end);
        let mut client = ProtocolClient::new(&settings(Duration::from_millis(50)), "control_cs");
        client.attach(reader, writer).await.unwrap();

        let err = client.query("state").await.unwrap_err();
        assert!(err.is_recoverable(), "{err:?}");
        assert!(client.is_connected());
    }

    /// Client attached to one end of an in-memory stream; the test plays the
    /// camera server on the other end.
    async fn client_over_duplex(timeout: Duration) -> (ProtocolClient, tokio::io::DuplexStream) {
        let (client_end, mut server_end) = tokio::io::duplex(1024);
        server_end.write_all(b"CS> ").await.unwrap();
        let (reader, writer) = tokio::io::split(client_end);
        let mut client = ProtocolClient::new(&settings(timeout), "control_cs");
        client.attach(reader, writer).await.unwrap();
        (client, server_end)
    }

    async fn received(server_end: &mut tokio::io::DuplexStream) -> String {
        let mut buf = vec![0u8; 256];
        let n = tokio::io::AsyncReadExt::read(server_end, &mut buf).await.unwrap();
        String::from_utf8_lossy(&buf[..n]).into_owned()
    }

    #[tokio::test]
    async fn late_reply_is_not_taken_by_next_query() {
        let (mut client, mut server_end) = client_over_duplex(Duration::from_millis(50)).await;

        // Half of the reply arrives before the timeout.
        server_end.write_all(b"CS> state RE").await.unwrap();
        let err = client.current_state().await.unwrap_err();
        assert!(err.is_recoverable(), "{err:?}");
        assert_eq!(received(&mut server_end).await, "state\n");

        server_end.write_all(b"ADY\ndone\n").await.unwrap();
        server_end
            .write_all(b"CS> getconfig /ci/config/checM.cfg\ndone\n")
            .await
            .unwrap();
        assert_eq!(
            client.file_path(ConfigFile::Config).await.unwrap(),
            "/ci/config/checM.cfg"
        );
        assert_eq!(received(&mut server_end).await, "getconfig\n");
    }

    #[tokio::test]
    async fn partial_line_survives_timeout() {
        let (mut client, mut server_end) = client_over_duplex(Duration::from_millis(50)).await;

        server_end.write_all(b"CS> hv ").await.unwrap();
        assert!(client.query("hvch").await.is_err());

        server_end.write_all(b"1\ndone\nCS> hv 0\ndone\n").await.unwrap();
        assert_eq!(client.hv_status().await.unwrap(), OnOffState::Off);
    }

    #[tokio::test]
    async fn outstanding_reply_blocks_next_command() {
        let (mut client, mut server_end) = client_over_duplex(Duration::from_millis(30)).await;

        assert!(client.command("hvon").await.unwrap_err().is_recoverable());
        let err = client.query("state").await.unwrap_err();
        assert!(matches!(err, ProtocolError::Violation { .. }), "{err:?}");
        assert!(client.is_connected());
        // Only the first command reached the server.
        assert_eq!(received(&mut server_end).await, "hvon\n");

        server_end.write_all(b"done\nCS> state SAFE\ndone\n").await.unwrap();
        assert_eq!(client.current_state().await.unwrap(), InstrumentState::Safe);
    }

    #[tokio::test]
    async fn end_of_stream_drops_session() {
        let (mut client, server_end) = client_over_duplex(Duration::from_secs(1)).await;
        drop(server_end);

        let err = client.query("state").await.unwrap_err();
        assert!(err.is_connection_lost(), "{err:?}");
        assert!(!client.is_connected());
        assert_eq!(client.query("state").await.unwrap(), None);
    }

    #[tokio::test]
    async fn unconnected_client_does_no_io() {
        let mut client = ProtocolClient::new(&ControllerSettings::default(), "control_cs");
        assert_eq!(client.query("state").await.unwrap(), None);
        assert_eq!(client.current_state().await.unwrap(), InstrumentState::Unknown);
        assert!(client.allowed_transitions().await.unwrap().is_empty());
        client.command("hvon").await.unwrap();
        client.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn launch_failure_leaves_client_unconnected() {
        let mut client = ProtocolClient::new(
            &ControllerSettings::default(),
            "/nonexistent/build/control_cs",
        );
        let err = client
            .connect("0.0.0.0", Path::new("/tmp/camera_driver.log"))
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::Connection { .. }));
        assert!(!client.is_connected());
    }

    #[tokio::test]
    async fn second_attach_is_refused() {
        let mock = Builder::new().read(b"CS> ").build();
        let mut client = client_over(mock).await;
        let (other, _keep) = tokio::io::duplex(16);
        let (reader, writer) = tokio::io::split(other);
        assert!(matches!(
            client.attach(reader, writer).await,
            Err(ProtocolError::AlreadyConnected)
        ));
    }
}
