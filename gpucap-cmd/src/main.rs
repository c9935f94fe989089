//! `gpucap`: record, inspect and replay capture logs from the command line.

mod client;
mod config;
mod demo;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

use gpucap_driver::DriverKind;
use gpucap_ipc::{
    CounterResult, DrawcallDescription, EventId, GpuCounter, ReplayAnomaly, ReplayCommand,
    ReplayEvent, ReplayMode, ReplayState,
};

use crate::client::ReplayClient;

#[derive(Debug, Parser)]
#[command(name = "gpucap", version, about = "GPU frame capture and replay")]
struct Cli {
    /// Driver to replay on (soft, d3d11).
    #[arg(long, global = true, default_value = "soft", value_parser = parse_driver)]
    driver: DriverKind,

    /// JSON file with replay settings.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Print results as JSON.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Capture the built-in demo scene into a log file.
    Record {
        output: PathBuf,
        #[arg(long, default_value_t = 64)]
        width: u32,
        #[arg(long, default_value_t = 64)]
        height: u32,
    },
    /// Print the header and drawcall tree of a capture.
    Info { capture: PathBuf },
    /// Replay an event range of a capture.
    Replay {
        capture: PathBuf,
        /// First event to replay; defaults to the start of the frame.
        #[arg(long)]
        start: Option<EventId>,
        /// Last event to replay; defaults to the end of the frame.
        #[arg(long)]
        end: Option<EventId>,
        #[arg(long, value_enum, default_value_t = ModeArg::Full)]
        mode: ModeArg,
    },
    /// Measure per-draw GPU durations.
    Counters {
        capture: PathBuf,
        #[arg(long)]
        min: Option<EventId>,
        #[arg(long)]
        max: Option<EventId>,
        /// List the available counters instead of fetching.
        #[arg(long)]
        list: bool,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ModeArg {
    Full,
    UpTo,
    DrawOnly,
}

impl From<ModeArg> for ReplayMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Full => ReplayMode::Full,
            ModeArg::UpTo => ReplayMode::UpToDrawExclusive,
            ModeArg::DrawOnly => ReplayMode::DrawOnly,
        }
    }
}

fn parse_driver(s: &str) -> Result<DriverKind, String> {
    s.parse::<DriverKind>().map_err(|e| e.to_string())
}

#[derive(Debug, Serialize)]
struct CaptureSummary {
    version: u32,
    chunk_count: usize,
    frame_first: EventId,
    frame_last: EventId,
    last_event: EventId,
}

#[derive(Debug, Serialize)]
struct RangeReport {
    state: ReplayState,
    anomalies: Vec<ReplayAnomaly>,
}

#[derive(Debug, Serialize)]
struct CounterTable {
    results: Vec<CounterResult>,
    anomalies: Vec<ReplayAnomaly>,
}

fn init_logging() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            "gpucap=info,gpucap_replay=info,gpucap_capture=info,gpucap_driver=warn,gpucap_log=warn"
                .into()
        }))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging();
    let config = config::load_config(cli.config.as_deref())?;
    info!(driver = cli.driver.name(), "gpucap starting");

    match cli.command {
        Command::Record {
            output,
            width,
            height,
        } => {
            let log = demo::record_to(&output, cli.driver, width, height)?;
            let last_event = log.last_event().unwrap_or_default();
            if cli.json {
                let value = serde_json::json!({
                    "path": output,
                    "version": log.version(),
                    "chunk_count": log.len(),
                    "last_event": last_event,
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!(
                    "Wrote {} ({} chunks, last event {})",
                    output.display(),
                    log.len(),
                    last_event
                );
            }
        }
        Command::Info { capture } => {
            let mut client = ReplayClient::start(config, cli.driver)?;
            let summary = open(&mut client, capture)?;
            let drawcalls = client.request(ReplayCommand::GetDrawcalls, |event| match event {
                ReplayEvent::Drawcalls(list) => Some(list),
                _ => None,
            })?;
            if cli.json {
                let value = serde_json::json!({ "capture": summary, "drawcalls": drawcalls });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!(
                    "Log version {}, {} chunks, frame events {}..={}",
                    summary.version, summary.chunk_count, summary.frame_first, summary.frame_last
                );
                print_tree(&drawcalls, 0);
            }
        }
        Command::Replay {
            capture,
            start,
            end,
            mode,
        } => {
            let mut client = ReplayClient::start(config, cli.driver)?;
            let summary = open(&mut client, capture)?;
            let command = ReplayCommand::ReplayRange {
                start: start.unwrap_or(summary.frame_first),
                end: end.unwrap_or(summary.frame_last),
                mode: mode.into(),
            };
            let anomalies = client.request(command, |event| match event {
                ReplayEvent::RangeReplayed { anomalies } => Some(anomalies),
                _ => None,
            })?;
            let report = RangeReport {
                state: client.state.clone(),
                anomalies,
            };
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("Replay finished: {}", report.state.name());
                print_anomalies(&report.anomalies);
            }
        }
        Command::Counters {
            capture,
            min,
            max,
            list,
        } => {
            let mut client = ReplayClient::start(config, cli.driver)?;
            if list {
                return list_counters(&mut client, cli.json);
            }
            let summary = open(&mut client, capture)?;
            let command = ReplayCommand::FetchCounters {
                counters: vec![GpuCounter::EventGpuDuration],
                min_event: min.unwrap_or(summary.frame_first),
                max_event: max.unwrap_or(summary.frame_last),
            };
            let table = client.request(command, |event| match event {
                ReplayEvent::Counters { results, anomalies } => {
                    Some(CounterTable { results, anomalies })
                }
                _ => None,
            })?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&table)?);
            } else {
                println!("{:>8}  {:>14}", "EID", "Duration (us)");
                for result in &table.results {
                    println!("{:>8}  {:>14.3}", result.event_id, result.value * 1e6);
                }
                print_anomalies(&table.anomalies);
            }
        }
    }

    Ok(())
}

fn open(client: &mut ReplayClient, capture: PathBuf) -> Result<CaptureSummary> {
    client.request(ReplayCommand::OpenCapture { path: capture }, |event| match event {
        ReplayEvent::CaptureOpened {
            version,
            chunk_count,
            frame_first,
            frame_last,
            last_event,
        } => Some(CaptureSummary {
            version,
            chunk_count,
            frame_first,
            frame_last,
            last_event,
        }),
        _ => None,
    })
}

fn list_counters(client: &mut ReplayClient, json: bool) -> Result<()> {
    let counters = client.request(ReplayCommand::EnumerateCounters, |event| match event {
        ReplayEvent::CounterList(list) => Some(list),
        _ => None,
    })?;
    let mut descriptions = Vec::with_capacity(counters.len());
    for counter in counters {
        descriptions.push(client.request(ReplayCommand::DescribeCounter(counter), |event| {
            match event {
                ReplayEvent::CounterDescription(desc) => Some(desc),
                _ => None,
            }
        })?);
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&descriptions)?);
    } else {
        for desc in &descriptions {
            println!("{:<24} {:?}  {}", desc.name, desc.unit, desc.description);
        }
    }
    Ok(())
}

fn print_tree(nodes: &[DrawcallDescription], depth: usize) {
    for node in nodes {
        println!(
            "{:indent$}{:>6}  {:?}  {}",
            "",
            node.event_id,
            node.kind,
            node.name,
            indent = depth * 2
        );
        print_tree(&node.children, depth + 1);
    }
}

fn print_anomalies(anomalies: &[ReplayAnomaly]) {
    for anomaly in anomalies {
        println!("warning: {anomaly}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_replay_arguments() {
        let cli = Cli::try_parse_from([
            "gpucap", "replay", "frame.gcap", "--start", "3", "--end", "7", "--mode", "draw-only",
        ])
        .unwrap();
        assert_eq!(cli.driver, DriverKind::Soft);
        match cli.command {
            Command::Replay {
                start, end, mode, ..
            } => {
                assert_eq!(start, Some(3));
                assert_eq!(end, Some(7));
                assert_eq!(ReplayMode::from(mode), ReplayMode::DrawOnly);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_unknown_driver_rejected() {
        assert!(Cli::try_parse_from(["gpucap", "--driver", "vulkan", "info", "x.gcap"]).is_err());
    }

    #[test]
    fn test_record_then_info_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("demo.gcap");
        demo::record_to(&path, DriverKind::Soft, 8, 8).unwrap();

        let mut client = ReplayClient::start(Default::default(), DriverKind::Soft).unwrap();
        let summary = open(&mut client, path).unwrap();
        assert!(summary.chunk_count > 0);

        let anomalies = client
            .request(
                ReplayCommand::ReplayRange {
                    start: summary.frame_first,
                    end: summary.frame_last,
                    mode: ReplayMode::Full,
                },
                |event| match event {
                    ReplayEvent::RangeReplayed { anomalies } => Some(anomalies),
                    _ => None,
                },
            )
            .unwrap();
        assert!(anomalies.is_empty());
        assert!(client.state.is_done());
    }
}
