//! Minimal operator harness for the sleipnir datapath: loads the kernel
//! object, arms and attaches it, then streams RTT samples and periodic
//! per-host throughput summaries to the log until interrupted.
//!
//! The shaping control plane (populating the prefix trie from a subscriber
//! database) lives elsewhere; this binary only exercises the datapath's
//! contracts.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use sleipnir_ebpf::iteration::read_throughput_stream;
use sleipnir_ebpf::{Datapath, DatapathConfig, DatapathError, Direction};

#[derive(Copy, Clone, Debug, ValueEnum)]
enum DirectionArg {
    /// Interface faces upstream (traffic here is upload).
    Internet,
    /// Interface faces the subscribers (traffic here is download).
    Local,
    /// Single interface, both sides split by VLAN tag.
    Stick,
}

impl From<DirectionArg> for Direction {
    fn from(arg: DirectionArg) -> Self {
        match arg {
            DirectionArg::Internet => Direction::ToInternet,
            DirectionArg::Local => Direction::ToLocal,
            DirectionArg::Stick => Direction::OnAStick,
        }
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "sleipnir datapath agent")]
struct Cli {
    /// Compiled datapath object (sleipnir-ebpf-xdp ELF)
    #[arg(short, long, value_name = "FILE", default_value = "sleipnir.bpf.o")]
    object: PathBuf,

    /// Interfaces to attach the datapath to
    #[arg(short, long, required = true)]
    interface: Vec<String>,

    /// Which way the first interface faces
    #[arg(short, long, value_enum, default_value_t = DirectionArg::Local)]
    direction: DirectionArg,

    /// Internet-side VLAN tag (stick mode)
    #[arg(long, default_value_t = 0)]
    internet_vlan: u16,

    /// Subscriber-side VLAN tag (stick mode)
    #[arg(long, default_value_t = 0)]
    isp_vlan: u16,

    /// CPU/class offset for upload classes (stick mode)
    #[arg(long, default_value_t = 0)]
    stick_offset: u32,

    /// Disable the hot cache in front of the LPM trie
    #[arg(long)]
    no_hot_cache: bool,

    /// Ask the kernel programs for trace-pipe breadcrumbs
    #[arg(long)]
    verbose: bool,

    /// Seconds between throughput summaries
    #[arg(long, default_value_t = 10)]
    summary_interval: u64,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let cli = Cli::parse();
    if let Err(err) = run(cli).await {
        error!(%err, "agent exited with error");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<(), DatapathError> {
    let config = DatapathConfig {
        direction: cli.direction.into(),
        internet_vlan: cli.internet_vlan,
        isp_vlan: cli.isp_vlan,
        stick_offset: cli.stick_offset,
        hot_cache: !cli.no_hot_cache,
        verbose: cli.verbose,
        ..Default::default()
    };

    let mut datapath = Datapath::load(&cli.object, config)?;
    for interface in &cli.interface {
        datapath.attach(interface)?;
    }
    let mut rtt_events = datapath.take_rtt_events()?;

    info!(interfaces = ?cli.interface, "datapath armed; streaming measurements");

    let mut summary = tokio::time::interval(Duration::from_secs(cli.summary_interval.max(1)));
    let mut drain = tokio::time::interval(Duration::from_millis(50));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted; detaching");
                return Ok(());
            }
            _ = drain.tick() => {
                while let Some(event) = rtt_events.next() {
                    info!(
                        flow = %format_flow(&event.key),
                        rtt_us = event.round_trip_time_ns / 1_000,
                        direction = event.effective_direction,
                        "rtt sample"
                    );
                }
            }
            _ = summary.tick() => {
                if let Err(err) = log_throughput(&datapath) {
                    warn!(%err, "throughput summary failed");
                }
            }
        }
    }
}

fn log_throughput(datapath: &Datapath) -> Result<(), DatapathError> {
    let mut stream = Vec::new();
    datapath.stream_throughput(&mut stream)?;
    let records = read_throughput_stream(&mut stream.as_slice())?;
    for record in &records {
        let total = record.total();
        if total.download_packets + total.upload_packets == 0 {
            continue;
        }
        info!(
            host = %record.ip,
            down_bytes = total.download_bytes,
            up_bytes = total.upload_bytes,
            tc_handle = %format!("{:#010x}", total.tc_handle),
            "throughput"
        );
    }
    info!(hosts = records.len(), "throughput summary");
    Ok(())
}

fn format_flow(key: &sleipnir_ebpf_common::flow::FlowKey) -> String {
    format!(
        "{}:{} <-> {}:{} proto {}",
        key.src, key.src_port, key.dst, key.dst_port, key.protocol
    )
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .init();
}
