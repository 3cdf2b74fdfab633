//! Client command loop and fan-out of requests to every ready replica.

use crate::client::ConnectivityState;
use crate::config::ClientOptions;
use crate::messages::{FarewellMessage, GreetingMessage, IncrementRequest, ProtocolVersion};
use crate::registry::{ConnectionEntry, ConnectionRegistry};
use crate::{Result, TallyError};
use futures::future::join_all;
use std::sync::Arc;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// Messages sent by the `hi` command.
pub const GREETING_SCRIPT: [&str; 3] = ["Hi", "How are you?", "I'm fine, thanks."];

/// Reserved input tokens.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// Run the greeting stream against every ready replica.
    Greet,
    /// Print the readiness of every configured replica.
    Status,
    /// Redial replicas that are missing or not ready.
    Rejoin,
    /// Leave the loop.
    Quit,
}

impl Command {
    pub fn from_token(token: &str) -> Option<Self> {
        match token {
            "hi" => Some(Command::Greet),
            "status" => Some(Command::Status),
            "rejoin" => Some(Command::Rejoin),
            "quit" | "exit" => Some(Command::Quit),
            _ => None,
        }
    }
}

/// What one line of operator input asks for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Input {
    Increment(i64),
    /// A number too wide for the protocol version; never sent.
    OutOfRange { input: String, width: u32 },
    Command(Command),
    /// Anything else; discarded without side effect.
    Ignored,
}

/// Classify a line of input under `version`'s amount width.
pub fn classify(line: &str, version: ProtocolVersion) -> Input {
    let line = line.trim();
    match version.parse_amount(line) {
        Ok(Some(amount)) => Input::Increment(amount),
        Err(TallyError::AmountOutOfRange { input, width }) => Input::OutOfRange { input, width },
        _ => match Command::from_token(line) {
            Some(command) => Input::Command(command),
            None => Input::Ignored,
        },
    }
}

/// Result of sending one increment to one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Acked { new_value: i64 },
    /// The ack is smaller than the amount sent.
    ///
    /// Diagnostic only: concurrent writers, or a negative running total, can
    /// produce this without any replica misbehaving.
    Suspicious { new_value: i64, amount: i64 },
    /// The connection was not ready at dispatch time.
    Skipped { state: ConnectivityState },
    /// The address never joined.
    NotConnected,
    Failed { error: String },
}

/// Per-replica outcomes of one increment, in configured target order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    pub amount: i64,
    pub outcomes: Vec<(String, DispatchOutcome)>,
}

impl DispatchReport {
    pub fn outcome(&self, address: &str) -> Option<&DispatchOutcome> {
        self.outcomes
            .iter()
            .find(|(a, _)| a == address)
            .map(|(_, outcome)| outcome)
    }

    /// Number of replicas that applied the increment.
    pub fn applied(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, o)| {
                matches!(
                    o,
                    DispatchOutcome::Acked { .. } | DispatchOutcome::Suspicious { .. }
                )
            })
            .count()
    }

    /// Operator-facing lines.
    pub fn lines(&self) -> Vec<String> {
        let tagged = self.outcomes.len() > 1;
        self.outcomes
            .iter()
            .map(|(address, outcome)| {
                let text = match outcome {
                    DispatchOutcome::Acked { new_value } => {
                        format!("Success, the new value is now {}", new_value)
                    }
                    DispatchOutcome::Suspicious { new_value, amount } => format!(
                        "Oh no something went wrong :( sent {} but the value is {}",
                        amount, new_value
                    ),
                    DispatchOutcome::Skipped { state } => {
                        format!("Skipped, the connection is {}", state)
                    }
                    DispatchOutcome::NotConnected => "Skipped, not connected".to_string(),
                    DispatchOutcome::Failed { error } => format!("No response: {}", error),
                };
                tag(tagged, address, text)
            })
            .collect()
    }
}

/// Result of running the greeting stream against one replica.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GreetOutcome {
    Farewell(FarewellMessage),
    Skipped { state: ConnectivityState },
    NotConnected,
    Failed { error: String },
}

/// Per-replica outcomes of one greeting exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreetReport {
    pub outcomes: Vec<(String, GreetOutcome)>,
}

impl GreetReport {
    pub fn lines(&self) -> Vec<String> {
        let tagged = self.outcomes.len() > 1;
        self.outcomes
            .iter()
            .map(|(address, outcome)| {
                let text = match outcome {
                    GreetOutcome::Farewell(farewell) => {
                        format!("server says: {}", farewell.message)
                    }
                    GreetOutcome::Skipped { state } => {
                        format!("Skipped, the connection is {}", state)
                    }
                    GreetOutcome::NotConnected => "Skipped, not connected".to_string(),
                    GreetOutcome::Failed { error } => format!("Greeting failed: {}", error),
                };
                tag(tagged, address, text)
            })
            .collect()
    }
}

fn tag(tagged: bool, address: &str, text: String) -> String {
    if tagged {
        format!("[{}] {}", address, text)
    } else {
        text
    }
}

/// Sends operator requests to every configured replica.
pub struct Dispatcher {
    options: ClientOptions,
    registry: Arc<ConnectionRegistry>,
}

impl Dispatcher {
    pub fn new(options: ClientOptions, registry: Arc<ConnectionRegistry>) -> Self {
        Self { options, registry }
    }

    /// Join every target of `options` and build a dispatcher over them.
    pub async fn connect(options: ClientOptions) -> Self {
        info!(
            "Client {}: joining {} server(s)",
            options.name,
            options.targets.len()
        );
        let registry = Arc::new(ConnectionRegistry::join_with(&options).await);
        Self::new(options, registry)
    }

    pub fn options(&self) -> &ClientOptions {
        &self.options
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Configured targets without duplicates, in configured order.
    fn targets(&self) -> Vec<&str> {
        let mut targets: Vec<&str> = Vec::with_capacity(self.options.targets.len());
        for target in &self.options.targets {
            if !targets.contains(&target.as_str()) {
                targets.push(target);
            }
        }
        targets
    }

    /// Look up a target's entry if it is ready, logging why it is skipped otherwise.
    async fn ready_entry(
        &self,
        address: &str,
    ) -> std::result::Result<Arc<ConnectionEntry>, Option<ConnectivityState>> {
        let Some(entry) = self.registry.get(address).await else {
            info!(
                "Client {}: skipping {}, not connected",
                self.options.name, address
            );
            return Err(None);
        };
        let state = entry.readiness();
        if state != ConnectivityState::Ready {
            warn!(
                "Client {}: something was wrong with the connection to {} ({})",
                self.options.name, address, state
            );
            return Err(Some(state));
        }
        Ok(entry)
    }

    /// Send `amount` to every ready replica concurrently.
    pub async fn dispatch_increment(&self, amount: i64) -> DispatchReport {
        let request = IncrementRequest::new(self.options.name.clone(), amount);
        let version = self.options.protocol;

        let calls = self.targets().into_iter().map(|address| {
            let request = &request;
            async move {
                let outcome = match self.ready_entry(address).await {
                    Err(None) => DispatchOutcome::NotConnected,
                    Err(Some(state)) => DispatchOutcome::Skipped { state },
                    Ok(entry) => self.increment_one(&entry, request, version).await,
                };
                (address.to_string(), outcome)
            }
        });

        DispatchReport {
            amount,
            outcomes: join_all(calls).await,
        }
    }

    async fn increment_one(
        &self,
        entry: &ConnectionEntry,
        request: &IncrementRequest,
        version: ProtocolVersion,
    ) -> DispatchOutcome {
        match entry.client().increment(request, version).await {
            Ok(ack) if ack.new_value >= request.amount => {
                debug!("{} acked {}", entry.address(), ack.new_value);
                DispatchOutcome::Acked {
                    new_value: ack.new_value,
                }
            }
            Ok(ack) => {
                warn!(
                    "Client {}: {} returned {} after adding {}",
                    self.options.name,
                    entry.address(),
                    ack.new_value,
                    request.amount
                );
                DispatchOutcome::Suspicious {
                    new_value: ack.new_value,
                    amount: request.amount,
                }
            }
            Err(e) => {
                warn!(
                    "Client {}: no response from {}: {}",
                    self.options.name,
                    entry.address(),
                    e
                );
                DispatchOutcome::Failed {
                    error: e.to_string(),
                }
            }
        }
    }

    /// Run the greeting stream against every ready replica concurrently.
    pub async fn dispatch_greeting(&self, messages: &[&str]) -> GreetReport {
        let greetings: Vec<GreetingMessage> = messages
            .iter()
            .map(|m| GreetingMessage::new(self.options.name.clone(), *m))
            .collect();

        let calls = self.targets().into_iter().map(|address| {
            let greetings = &greetings;
            async move {
                let outcome = match self.ready_entry(address).await {
                    Err(None) => GreetOutcome::NotConnected,
                    Err(Some(state)) => GreetOutcome::Skipped { state },
                    Ok(entry) => match entry.client().greet(greetings).await {
                        Ok(farewell) => GreetOutcome::Farewell(farewell),
                        Err(e) => {
                            warn!("Client {}: greeting {} failed: {}", self.options.name, address, e);
                            GreetOutcome::Failed {
                                error: e.to_string(),
                            }
                        }
                    },
                };
                (address.to_string(), outcome)
            }
        });

        GreetReport {
            outcomes: join_all(calls).await,
        }
    }

    /// Read commands from `input` until it ends or `quit` is entered.
    ///
    /// Results are written to `output`. A read error on `input` is returned;
    /// lines that are not UTF-8 are discarded like any other unknown input,
    /// and every other failure is reported while the loop continues.
    pub async fn run<R, W>(&self, mut input: R, mut output: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut buf = Vec::new();
        write_lines(
            &mut output,
            &[
                "Type the amount you wish to increment with here. Type 0 to get the current value"
                    .to_string(),
                "--------------------".to_string(),
            ],
        )
        .await?;

        loop {
            output.write_all(b"-> ").await?;
            output.flush().await?;

            buf.clear();
            if input.read_until(b'\n', &mut buf).await? == 0 {
                info!("Client {}: end of input", self.options.name);
                return Ok(());
            }
            let Ok(line) = std::str::from_utf8(&buf) else {
                debug!("Ignoring {} bytes of input that is not UTF-8", buf.len());
                continue;
            };

            match classify(line, self.options.protocol) {
                Input::Increment(amount) => {
                    let report = self.dispatch_increment(amount).await;
                    write_lines(&mut output, &report.lines()).await?;
                }
                Input::OutOfRange { input, width } => {
                    warn!("Client {}: {} does not fit {} bits", self.options.name, input, width);
                    write_lines(
                        &mut output,
                        &[format!(
                            "{} does not fit the {}-bit protocol amount, nothing was sent",
                            input, width
                        )],
                    )
                    .await?;
                }
                Input::Command(Command::Greet) => {
                    let report = self.dispatch_greeting(&GREETING_SCRIPT).await;
                    write_lines(&mut output, &report.lines()).await?;
                }
                Input::Command(Command::Status) => {
                    let report = self.registry.readiness_report(&self.targets()).await;
                    let lines: Vec<String> = report
                        .into_iter()
                        .map(|(address, state)| match state {
                            Some(state) => format!("{}: {}", address, state),
                            None => format!("{}: not connected", address),
                        })
                        .collect();
                    write_lines(&mut output, &lines).await?;
                }
                Input::Command(Command::Rejoin) => {
                    let joined = self
                        .registry
                        .rejoin(&self.targets(), self.options.dial_timeout)
                        .await;
                    write_lines(&mut output, &[format!("Rejoined {} server(s)", joined)]).await?;
                }
                Input::Command(Command::Quit) => {
                    info!("Client {}: quitting", self.options.name);
                    return Ok(());
                }
                Input::Ignored => {
                    debug!("Ignoring input {:?}", line);
                }
            }
        }
    }
}

async fn write_lines<W: AsyncWrite + Unpin>(output: &mut W, lines: &[String]) -> Result<()> {
    for line in lines {
        output.write_all(line.as_bytes()).await?;
        output.write_all(b"\n").await?;
    }
    output.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify() {
        let v1 = ProtocolVersion::V1;
        assert_eq!(classify("5", v1), Input::Increment(5));
        assert_eq!(classify("  -3 ", v1), Input::Increment(-3));
        assert_eq!(classify("hi", v1), Input::Command(Command::Greet));
        assert_eq!(classify("status", v1), Input::Command(Command::Status));
        assert_eq!(classify("exit", v1), Input::Command(Command::Quit));
        assert_eq!(classify("five", v1), Input::Ignored);
        assert_eq!(classify("", v1), Input::Ignored);
        assert_eq!(
            classify("3000000000", v1),
            Input::OutOfRange {
                input: "3000000000".into(),
                width: 32
            }
        );
        assert_eq!(
            classify("3000000000", ProtocolVersion::V2),
            Input::Increment(3_000_000_000)
        );
    }

    #[test]
    fn test_report_lines() {
        let single = DispatchReport {
            amount: 2,
            outcomes: vec![("a:1".into(), DispatchOutcome::Acked { new_value: 7 })],
        };
        assert_eq!(single.lines(), vec!["Success, the new value is now 7"]);

        let multi = DispatchReport {
            amount: 2,
            outcomes: vec![
                ("a:1".into(), DispatchOutcome::Acked { new_value: 7 }),
                ("b:2".into(), DispatchOutcome::NotConnected),
            ],
        };
        assert_eq!(
            multi.lines(),
            vec![
                "[a:1] Success, the new value is now 7",
                "[b:2] Skipped, not connected"
            ]
        );
        assert_eq!(multi.applied(), 1);
        assert_eq!(multi.outcome("b:2"), Some(&DispatchOutcome::NotConnected));
    }

    #[tokio::test]
    async fn test_dispatch_with_no_connections_reports_every_target() {
        let options = ClientOptions {
            targets: vec!["127.0.0.1:1".into(), "127.0.0.1:2".into()],
            ..ClientOptions::default()
        };
        let dispatcher = Dispatcher::new(options, Arc::new(ConnectionRegistry::new()));

        let report = dispatcher.dispatch_increment(4).await;
        assert_eq!(report.outcomes.len(), 2);
        assert_eq!(report.applied(), 0);
        assert!(report
            .outcomes
            .iter()
            .all(|(_, o)| *o == DispatchOutcome::NotConnected));
    }

    #[tokio::test]
    async fn test_run_discards_garbage_and_stops_on_quit() {
        let dispatcher = Dispatcher::new(ClientOptions::default(), Arc::new(ConnectionRegistry::new()));
        let input: &[u8] = b"garbage\n3000000000\nquit\n5\n";
        let mut output = Vec::new();

        dispatcher.run(input, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("3000000000 does not fit the 32-bit protocol amount"));
        assert!(!text.contains("Skipped"));
    }

    #[tokio::test]
    async fn test_run_skips_lines_that_are_not_utf8() {
        let dispatcher = Dispatcher::new(ClientOptions::default(), Arc::new(ConnectionRegistry::new()));
        let input: &[u8] = b"\xff\xfe garbage\n3000000000\nquit\n5\n";
        let mut output = Vec::new();

        dispatcher.run(input, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("3000000000 does not fit the 32-bit protocol amount"));
        assert_eq!(text.matches("-> ").count(), 3);
        assert!(!text.contains("Skipped"));
    }

    #[tokio::test]
    async fn test_run_handles_final_line_without_newline() {
        let dispatcher = Dispatcher::new(ClientOptions::default(), Arc::new(ConnectionRegistry::new()));
        let input: &[u8] = b"3000000000";
        let mut output = Vec::new();

        dispatcher.run(input, &mut output).await.unwrap();

        let text = String::from_utf8(output).unwrap();
        assert!(text.contains("3000000000 does not fit the 32-bit protocol amount"));
    }
}
