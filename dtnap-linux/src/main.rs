// DTN access-point daemon: opens the configured endpoints on a loopback node, runs echo
// services and reports store usage until SIGINT/SIGTERM.

mod config;
mod echo;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context};
use dtnap_core::admin::{Admin, SpanUpdate};
use dtnap_core::ltp::EngineId;
use dtnap_core::timestamp::parse_timestamp;
use dtnap_core::{Eid, LoopbackNode, OpenOptions, Proxy};
use log::{info, warn};
use time::OffsetDateTime;

use crate::config::Config;

const VERSION: &str = env!("CARGO_PKG_VERSION");

fn main() -> anyhow::Result<()> {
    let mut config_path = None;
    let mut args = std::env::args().skip(1);
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("dtnap-linux {}", VERSION);
                return Ok(());
            }
            "--config" | "-c" => {
                config_path = Some(PathBuf::from(args.next().context("--config needs a path")?));
            }
            other => bail!("unknown argument '{other}'"),
        }
    }

    let cfg = config::load(config_path.as_deref())?;
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(cfg.log.as_str())).init();

    let engine = EngineId(cfg.ltp_engine.unwrap_or(cfg.node));
    let node = LoopbackNode::with_ltp_engine(cfg.node, engine, cfg.store_capacity);
    install(&node, &cfg)?;
    info!(
        "node {} up: store {} bytes, {} endpoints",
        cfg.node,
        cfg.store_capacity,
        cfg.endpoints.len()
    );

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(serve(node, cfg))
}

/// Put the configured endpoints, contacts, ranges and spans into the node's database.
fn install(node: &LoopbackNode, cfg: &Config) -> anyhow::Result<()> {
    let now = OffsetDateTime::now_utc();
    let reference = match &cfg.reference_time {
        Some(text) => parse_timestamp(text, now).context("reference_time")?,
        None => now,
    };
    let admin = Admin::new(Arc::new(node.clone()), reference);
    for ep in &cfg.endpoints {
        admin
            .add_endpoint(&ep.eid, ep.discard)
            .with_context(|| format!("endpoint {}", ep.eid))?;
    }
    for c in &cfg.contacts {
        admin
            .add_contact(c.region, c.from, c.to, &c.start, &c.end, c.rate_bps, c.confidence)
            .with_context(|| format!("contact {}->{}", c.from, c.to))?;
    }
    for r in &cfg.ranges {
        admin
            .add_range(r.from, r.to, &r.start, &r.end, r.owlt)
            .with_context(|| format!("range {}->{}", r.from, r.to))?;
    }
    for s in &cfg.spans {
        node.define_ltp_span(EngineId(s.engine));
        let update = SpanUpdate {
            udp_rate: s.udp_rate,
            max_export_sessions: s.max_export_sessions,
            max_import_sessions: s.max_import_sessions,
            ..SpanUpdate::new(s.engine, s.max_segment_size, s.peer)
        };
        admin
            .update_ltp_span(update)
            .with_context(|| format!("span to engine {}", s.engine))?;
    }
    if let Some(size) = cfg.cfdp_segment_size {
        admin.set_cfdp_segment_size(size)?;
    }
    if cfg.bp_watch {
        admin.bp_watch(true)?;
    }
    Ok(())
}

async fn serve(node: LoopbackNode, cfg: Config) -> anyhow::Result<()> {
    let proxy = Proxy::attach(node.bp(), cfg.node)?;
    let mut echoes = Vec::new();
    for ep in &cfg.endpoints {
        let eid: Eid = ep.eid.parse()?;
        let options = OpenOptions {
            detained: ep.detained,
            admission_control: ep.admission_control,
        };
        let ap = proxy
            .open(eid, options)
            .with_context(|| format!("opening {}", ep.eid))?;
        if ep.echo {
            echoes.push(tokio::spawn(echo::serve(ap)));
        }
    }
    if cfg.endpoints.is_empty() {
        warn!("no endpoints configured");
    }

    let reporter = (cfg.usage_report_secs > 0)
        .then(|| tokio::spawn(report_usage(node.clone(), Duration::from_secs(cfg.usage_report_secs))));

    shutdown_signal().await?;
    info!("shutting down");
    if let Some(reporter) = reporter {
        reporter.abort();
    }
    proxy.shutdown();
    for task in echoes {
        if let Err(e) = task.await {
            warn!("echo task failed: {e}");
        }
    }
    Ok(())
}

async fn report_usage(node: LoopbackNode, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    loop {
        ticker.tick().await;
        let u = node.usage();
        info!(
            "store: {} objects, {}/{} bytes in use, {} pending",
            u.objects, u.bytes_in_use, u.capacity, u.pending
        );
    }
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            r = tokio::signal::ctrl_c() => r?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
