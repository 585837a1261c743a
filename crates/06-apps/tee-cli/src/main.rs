//! Smoke driver for the command ring: brings up a ring against the simulated
//! remote and pushes commands through it.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use tee_client::{ClientConfig, CommandClient, HostRing, MappedRing, RingTransport, SystemClock};
use tee_remote_sim::{SimConfig, SimMode, SimRemote};

/// Text rendering helpers used by the CLI commands.
mod render {
    use std::fmt::Write;

    use tee_client::{StatsSnapshot, TeeResult};

    /// One line per submitted command.
    pub fn outcome(
        seq: usize,
        command_id: u32,
        result: &TeeResult<u32>,
        response: &[u8],
    ) -> String {
        match result {
            Ok(status) => format!(
                "#{seq} cmd={command_id:#04x} status={status:#x} response={:?}\n",
                String::from_utf8_lossy(response)
            ),
            Err(err) => format!("#{seq} cmd={command_id:#04x} error: {err}\n"),
        }
    }

    pub fn stats(stats: &StatsSnapshot) -> String {
        let mut out = String::new();
        writeln!(
            out,
            "submitted={} completed={} timed_out={} busy={} stale={}",
            stats.submitted, stats.completed, stats.timed_out, stats.busy, stats.stale
        )
        .expect("write stats");
        out
    }
}

/// Drive the coprocessor command ring against a simulated remote.
#[derive(Parser, Debug)]
#[command(author, version, about = "Exercise the TEE command ring", long_about = None)]
struct Cli {
    /// TOML file with ring and timing settings.
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Where the ring memory comes from.
    #[arg(long, value_enum, default_value_t = Variant::Host)]
    variant: Variant,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Submit echo commands and print each response.
    Echo {
        /// Number of commands to submit.
        #[arg(short = 'n', long, default_value_t = 4)]
        count: usize,
        /// Payload sent with every command.
        #[arg(short, long, default_value = "ping")]
        payload: String,
        /// Command identifier (decimal or hex).
        #[arg(long, value_parser = parse_u32, default_value = "0x01")]
        command_id: u32,
        /// Simulated remote latency in milliseconds.
        #[arg(long, default_value_t = 0)]
        latency_ms: u64,
        /// Stall the remote afterwards to show timeout, busy and recovery.
        #[arg(long)]
        stall: bool,
    },
    /// Print the effective configuration as TOML.
    Config,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Variant {
    /// Host allocates the ring and announces it.
    Host,
    /// The ring lives in a fixed window owned by the remote.
    Mapped,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Config => {
            print!("{}", toml::to_string(&config).context("render config")?);
        }
        Command::Echo {
            count,
            payload,
            command_id,
            latency_ms,
            stall,
        } => {
            let remote = SimRemote::new(SimConfig {
                slot_size: config.slot_size,
                latency: Duration::from_millis(latency_ms),
                mode: SimMode::Threaded,
                mapped_slots: (cli.variant == Variant::Mapped).then_some(config.slot_count),
                ..SimConfig::default()
            })
            .context("start simulated remote")?;
            let transport = transport_for(cli.variant, &remote)?;
            let client = CommandClient::connect(
                &config,
                transport.as_ref(),
                remote.clone(),
                Arc::new(SystemClock),
            )
            .context("bring up ring")?;
            info!(
                "ring ready: {} slots, {} payload bytes each",
                client.ring().capacity(),
                client.ring().payload_capacity()
            );

            run_echo(&client, command_id, payload.as_bytes(), count);
            let result = if stall {
                run_stall(&client, &remote, command_id, count)
            } else {
                Ok(())
            };
            print!("{}", render::stats(&client.stats()));
            client.shutdown();
            result?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<ClientConfig> {
    let config = match path {
        Some(path) => {
            let text = fs::read_to_string(path)
                .with_context(|| format!("failed to read config {path:?}"))?;
            toml::from_str(&text).with_context(|| format!("invalid config {path:?}"))?
        }
        None => ClientConfig::default(),
    };
    config.validate().context("invalid ring shape")?;
    Ok(config)
}

fn transport_for(variant: Variant, remote: &SimRemote) -> Result<Box<dyn RingTransport>> {
    match variant {
        Variant::Host => Ok(Box::new(HostRing)),
        Variant::Mapped => {
            let Some((base, len)) = remote.mapped_window() else {
                bail!("remote has no fixed window");
            };
            // SAFETY: the remote owns the window and is dropped after the client.
            Ok(Box::new(unsafe { MappedRing::new(base, len) }))
        }
    }
}

fn run_echo(client: &CommandClient, command_id: u32, payload: &[u8], count: usize) {
    let mut response = vec![0u8; payload.len()];
    for seq in 0..count {
        let result = client.submit_default(command_id, payload, &mut response);
        print!("{}", render::outcome(seq, command_id, &result, &response));
    }
}

/// Holds the remote so one command times out and the next is refused, then
/// lets the late completion through and resumes.
fn run_stall(
    client: &CommandClient,
    remote: &SimRemote,
    command_id: u32,
    mut seq: usize,
) -> Result<()> {
    let mut response = vec![0u8; 8];
    let timeout = Duration::from_millis(50);

    remote.hold();
    for payload in [&b"stalled"[..], b"refused"] {
        let result = client.submit(command_id, payload, &mut response, timeout);
        print!("{}", render::outcome(seq, command_id, &result, &response));
        seq += 1;
    }

    remote.settle();
    remote.release_held();
    if !client.probe() {
        bail!("remote did not recover after releasing held commands");
    }
    println!("remote recovered");

    let result = client.submit(command_id, b"resumed", &mut response, timeout);
    print!("{}", render::outcome(seq, command_id, &result, &response));
    result?;
    Ok(())
}

fn parse_u32(input: &str) -> Result<u32, String> {
    if let Some(stripped) = input.strip_prefix("0x") {
        u32::from_str_radix(stripped, 16).map_err(|_| format!("invalid hex value '{input}'"))
    } else {
        input
            .parse::<u32>()
            .map_err(|_| format!("invalid number '{input}'"))
    }
}

#[cfg(test)]
mod tests {
    use super::{parse_u32, render};
    use insta::assert_snapshot;
    use std::time::Duration;
    use tee_client::{BusyReason, StatsSnapshot, TeeError};

    #[test]
    fn outcome_render_matches_expectation() {
        assert_snapshot!(
            render::outcome(0, 1, &Ok(0), b"ping").trim_end(),
            @r###"#0 cmd=0x01 status=0x0 response="ping""###
        );
        assert_snapshot!(
            render::outcome(
                3,
                0x2a,
                &Err(TeeError::Timeout {
                    command_id: 0x2a,
                    timeout: Duration::from_millis(50)
                }),
                b""
            )
            .trim_end(),
            @"#3 cmd=0x2a error: remote did not complete command 0x2a within 50ms"
        );
        assert_snapshot!(
            render::outcome(
                4,
                1,
                &Err(TeeError::Busy {
                    reason: BusyReason::RemoteUnresponsive
                }),
                b""
            )
            .trim_end(),
            @"#4 cmd=0x01 error: command ring busy: RemoteUnresponsive"
        );
    }

    #[test]
    fn stats_render_matches_expectation() {
        let stats = StatsSnapshot {
            submitted: 5,
            completed: 4,
            timed_out: 1,
            busy: 2,
            stale: 0,
        };
        assert_snapshot!(
            render::stats(&stats).trim_end(),
            @"submitted=5 completed=4 timed_out=1 busy=2 stale=0"
        );
    }

    #[test]
    fn parses_hex_and_decimal_ids() {
        assert_eq!(parse_u32("0x10"), Ok(16));
        assert_eq!(parse_u32("42"), Ok(42));
        assert!(parse_u32("0xZZ").is_err());
    }
}
