use std::process;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use anyhow::Context;
use clap::{Arg, ArgAction, Command};
use colored::*;
use log::warn;

use skopos::{
    AgentConfig, ContactResponse, DiscoveryTask, ProbeEngine, ReportSink, StdoutSink,
};

fn print_banner() {
    println!("{}", "skopos :: network discovery agent".bright_blue().bold());
    println!(
        "{}",
        format!("version {}", env!("CARGO_PKG_VERSION")).bright_black()
    );
    println!();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let matches = Command::new("skopos")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Parallel network discovery: ARP, ICMP, NetBIOS and SNMP probing of server-issued IP ranges")
        .arg(
            Arg::new("jobs")
                .value_name("FILE")
                .help("Contact response with the discovery jobs (JSON)")
                .required(true)
                .index(1),
        )
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Agent configuration file (TOML)"),
        )
        .arg(
            Arg::new("deviceid")
                .long("deviceid")
                .value_name("ID")
                .help("Override the agent device id"),
        )
        .arg(
            Arg::new("quiet")
                .short('q')
                .long("quiet")
                .help("Suppress the banner")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    if !matches.get_flag("quiet") {
        print_banner();
    }

    let mut config = match matches.get_one::<String>("config") {
        Some(path) => AgentConfig::load(path).with_context(|| format!("loading {path}"))?,
        None => {
            let mut config = AgentConfig::default();
            config.apply_env();
            config
        }
    };
    if let Some(deviceid) = matches.get_one::<String>("deviceid") {
        config.deviceid = deviceid.clone();
    }

    let jobs_path = matches.get_one::<String>("jobs").expect("required arg");
    let contact_json =
        std::fs::read_to_string(jobs_path).with_context(|| format!("reading {jobs_path}"))?;
    let contact: ContactResponse =
        serde_json::from_str(&contact_json).with_context(|| format!("parsing {jobs_path}"))?;

    let mut task = DiscoveryTask::new(config.clone());
    if !task.is_enabled(&contact) {
        eprintln!("{}", "no valid discovery job assigned, nothing to do".yellow());
        process::exit(1);
    }

    // termination signal flips the cooperative abort flag; in-flight
    // probes finish before the run winds down
    let abort = task.abort_flag();
    tokio::spawn(async move {
        wait_for_termination().await;
        warn!("termination signal received, aborting discovery");
        abort.store(true, Ordering::SeqCst);
    });

    let engine = Arc::new(ProbeEngine::detect());
    let sink: Arc<dyn ReportSink> = Arc::new(StdoutSink::new(config.deviceid.clone()));
    let summary = task.run(engine, sink).await?;

    eprintln!(
        "{} {} address(es) scanned, {} device(s) found{}",
        "done:".bright_green().bold(),
        summary.scanned,
        summary.devices,
        if summary.aborted {
            format!(" {}", "(aborted)".bright_red())
        } else {
            String::new()
        }
    );
    if summary.aborted {
        process::exit(130);
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_termination() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = match signal(SignalKind::terminate()) {
        Ok(term) => term,
        Err(_) => {
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = term.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination() {
    let _ = tokio::signal::ctrl_c().await;
}
