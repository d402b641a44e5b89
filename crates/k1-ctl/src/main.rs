//! k1-ctl — render pattern graphs and drive a K1 device from the terminal.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use bytes::Bytes;

use k1_core::{
    apply_brightness_cap, make_put_plan, Evaluator, GraphExport, K1Config, PixelFrame, PUT_DATA_MAX,
};
use k1_link::{AckReport, CancelFlag, DeviceUrl, LinkHandle, LinkSession, WsConnector};

const DEFAULT_FPS: f64 = 30.0;
const DEFAULT_FRAMES: usize = 60;

// ── Options ───────────────────────────────────────────────────────────────────

#[derive(Default)]
struct Opts {
    url: Option<String>,
    time_ms: f64,
    cap_percent: Option<f64>,
    frames: Option<usize>,
    fps: Option<f64>,
}

fn flag_value<'a>(args: &'a [String], i: usize, flag: &str) -> Result<&'a str> {
    args.get(i)
        .map(String::as_str)
        .with_context(|| format!("{flag} requires a value"))
}

fn parse_args(args: &[String]) -> Result<(Opts, Vec<&str>)> {
    let mut opts = Opts::default();
    let mut remaining = Vec::new();
    let mut i = 0;
    while i < args.len() {
        let flag = args[i].as_str();
        let takes_value = matches!(flag, "--url" | "--time" | "--cap" | "--frames" | "--fps");
        if !takes_value {
            remaining.push(flag);
            i += 1;
            continue;
        }
        let value = flag_value(args, i + 1, flag)?;
        match flag {
            "--url" => opts.url = Some(value.to_string()),
            "--time" => opts.time_ms = value.parse().context("--time must be a number")?,
            "--cap" => opts.cap_percent = Some(value.parse().context("--cap must be a number")?),
            "--frames" => opts.frames = Some(value.parse().context("--frames must be an integer")?),
            _ => opts.fps = Some(value.parse().context("--fps must be a number")?),
        }
        i += 2;
    }
    Ok((opts, remaining))
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn read_graph(path: &str) -> Result<GraphExport> {
    let text = std::fs::read_to_string(path).with_context(|| format!("failed to read {path}"))?;
    GraphExport::from_json(&text).with_context(|| format!("{path} is not a graph document"))
}

fn cap_byte(config: &K1Config, opts: &Opts) -> u8 {
    match opts.cap_percent {
        Some(p) => k1_core::frame::cap_percent_to_byte(p),
        None => config.cap_byte(),
    }
}

fn render_frame(evaluator: &Evaluator, doc: &GraphExport, time_ms: f64, cap: u8) -> Result<PixelFrame> {
    let graph = doc.to_graph();
    let mut frame = evaluator
        .evaluate(&graph, time_ms)
        .context("graph evaluation failed")?;
    apply_brightness_cap(frame.as_bytes_mut(), cap);
    Ok(frame)
}

async fn open_link(config: &K1Config, opts: &Opts) -> Result<LinkHandle> {
    let raw = opts.url.as_deref().unwrap_or(&config.device.url);
    let url = DeviceUrl::parse(raw)?;
    let connector = Arc::new(WsConnector::new(config.link.ack_timeout()));
    let handle = LinkSession::spawn(url.clone(), config.link.clone(), connector);
    handle
        .connect()
        .await
        .with_context(|| format!("failed to connect to {url}"))?;
    Ok(handle)
}

fn print_ack(report: &AckReport) {
    let verdict = if report.is_ok() { "acknowledged" } else { "failed" };
    println!("  Result    : {} ({})", verdict, report.code());
    println!("  Attempts  : {}", report.attempts);
    println!("  Bytes     : {}", report.total_bytes);
    println!("  CRC32     : 0x{:08x}", report.crc);
    if let Some(msg) = &report.reply.message {
        println!("  Message   : {msg}");
    }
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

fn cmd_render(config: &K1Config, opts: &Opts, path: &str) -> Result<()> {
    let engine = config.engine_config()?;
    let channel_len = engine.channel_len.max(1);
    let evaluator = Evaluator::new(engine);
    let doc = read_graph(path)?;
    let cap = cap_byte(config, opts);
    let frame = render_frame(&evaluator, &doc, opts.time_ms, cap)?;

    println!("═══════════════════════════════════════");
    println!("  Rendered {} at t={} ms", path, opts.time_ms);
    println!("═══════════════════════════════════════");
    println!("  Pixels     : {}", frame.pixel_count());
    println!("  Peak       : {}", frame.peak());
    println!("  Cap        : {}", cap);

    let channels = frame.pixel_count().div_ceil(channel_len);
    for n in 0..channels {
        let bytes = frame.channel(n, channel_len);
        let head = &bytes[..bytes.len().min(24)];
        println!("  ┌─ channel {n}");
        println!("  │  pixels : {}", bytes.len() / 3);
        println!("  └─ head   : {}", hex::encode(head));
    }
    Ok(())
}

fn cmd_plan(path: &str) -> Result<()> {
    let payload = std::fs::read(path).with_context(|| format!("failed to read {path}"))?;
    let plan = make_put_plan(&payload, PUT_DATA_MAX)?;
    println!("{}", plan.dry_run_report());
    Ok(())
}

fn build_export(config: &K1Config, opts: &Opts, path: &str) -> Result<GraphExport> {
    let engine = config.engine_config()?;
    let evaluator = Evaluator::new(engine.clone());
    let doc = read_graph(path)?;
    let cap = cap_byte(config, opts);
    let preview = render_frame(&evaluator, &doc, opts.time_ms, cap)?;
    Ok(GraphExport::new(doc.nodes, doc.wires, &engine, opts.fps.unwrap_or(DEFAULT_FPS))
        .with_preview(&preview)
        .with_brightness_cap(cap))
}

fn cmd_export(config: &K1Config, opts: &Opts, path: &str) -> Result<()> {
    let export = build_export(config, opts, path)?;
    println!("{}", export.to_pretty_json()?);
    Ok(())
}

async fn cmd_send(config: &K1Config, opts: &Opts, path: &str) -> Result<()> {
    let payload = build_export(config, opts, path)?.to_payload()?;
    // Validate before touching the network.
    println!("{}", make_put_plan(&payload, PUT_DATA_MAX)?.dry_run_report());

    let link = open_link(config, opts).await?;
    let report = link.send_and_await_ack(payload).await?;

    println!("═══════════════════════════════════════");
    println!("  Upload {}", path);
    println!("═══════════════════════════════════════");
    print_ack(&report);
    link.close().await?;
    if !report.is_ok() {
        bail!("device did not acknowledge the upload");
    }
    Ok(())
}

async fn cmd_stream(config: &K1Config, opts: &Opts, path: &str) -> Result<()> {
    let engine = config.engine_config()?;
    let evaluator = Evaluator::new(engine);
    let doc = read_graph(path)?;
    let cap = cap_byte(config, opts);
    let fps = opts.fps.unwrap_or(DEFAULT_FPS);
    let count = opts.frames.unwrap_or(DEFAULT_FRAMES);
    if !(fps.is_finite() && fps > 0.0) {
        bail!("--fps must be positive");
    }

    let frames = (0..count)
        .map(|i| {
            let t = opts.time_ms + i as f64 * 1000.0 / fps;
            render_frame(&evaluator, &doc, t, cap).map(|f| Bytes::from(f.into_bytes()))
        })
        .collect::<Result<Vec<_>>>()?;

    let link = open_link(config, opts).await?;
    let cancel = CancelFlag::new();
    let on_ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("ctrl-c, stopping after the current frame");
            on_ctrl_c.cancel();
        }
    });

    let report = link.stream_sequence(&frames, fps, &cancel).await?;

    println!("═══════════════════════════════════════");
    println!("  Stream {} @ {} fps", path, fps);
    println!("═══════════════════════════════════════");
    println!("  Sent       : {}", report.sent);
    println!("  Failed     : {}", report.failed);
    println!("  Cancelled  : {}", report.cancelled);
    println!("  Truncated  : {}", report.truncated);
    link.close().await?;
    Ok(())
}

async fn cmd_status(config: &K1Config, opts: &Opts) -> Result<()> {
    let link = open_link(config, opts).await?;
    let status = link.status().await?;

    println!("═══════════════════════════════════════");
    println!("  K1 Device Status");
    println!("═══════════════════════════════════════");
    println!("  Link       : {}", link.state());
    match status {
        Some(s) => {
            let show = |v: Option<String>| v.unwrap_or_else(|| "-".to_string());
            println!("  Version    : {}", show(s.version));
            println!("  LEDs       : {}", show(s.led_count.map(|v| v.to_string())));
            println!("  Storage    : {} bytes", show(s.storage_available.map(|v| v.to_string())));
            println!("  Max chunk  : {}", show(s.max_chunk.map(|v| v.to_string())));
        }
        None => println!("\n  Device did not report status."),
    }
    link.close().await?;
    Ok(())
}

async fn cmd_list(config: &K1Config, opts: &Opts) -> Result<()> {
    let link = open_link(config, opts).await?;
    let patterns = link.list_patterns().await?;

    if patterns.is_empty() {
        println!("No stored patterns.");
    } else {
        println!("═══════════════════════════════════════");
        println!("  Stored Patterns ({})", patterns.len());
        println!("═══════════════════════════════════════");
        for p in &patterns {
            println!("  ┌─ {}", p.name);
            println!("  │  size  : {} bytes", p.size);
            println!("  └─ mtime : {}", p.mtime);
        }
    }
    link.close().await?;
    Ok(())
}

fn print_usage() {
    println!("Usage: k1-ctl [--url <ws-url>] <command>");
    println!();
    println!("Commands:");
    println!("  render <graph.json> [--time <ms>] [--cap <percent>]   Evaluate and summarise a frame");
    println!("  plan <file>                                          Dry-run the upload plan for a file");
    println!("  export <graph.json> [--time <ms>] [--fps <fps>]       Print the export document");
    println!("  send <graph.json>                                    Upload the export document");
    println!("  stream <graph.json> [--frames <n>] [--fps <fps>]      Stream evaluated frames");
    println!("  status                                               Show device status");
    println!("  list                                                 List stored patterns");
    println!();
    println!("Config: {}", K1Config::file_path().display());
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = K1Config::write_default_if_missing() {
        tracing::warn!(error = %e, "could not write default config");
    }
    let config = K1Config::load().context("failed to load config")?;

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (opts, remaining) = parse_args(&args)?;

    match remaining.as_slice() {
        ["render", path] => cmd_render(&config, &opts, path),
        ["plan", path] => cmd_plan(path),
        ["export", path] => cmd_export(&config, &opts, path),
        ["send", path] => cmd_send(&config, &opts, path).await,
        ["stream", path] => cmd_stream(&config, &opts, path).await,
        ["status"] => cmd_status(&config, &opts).await,
        ["list"] => cmd_list(&config, &opts).await,
        ["help"] | ["--help"] | ["-h"] | [] => {
            print_usage();
            Ok(())
        }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
