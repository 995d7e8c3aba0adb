//! tether-ctl — operator command line for a tetherd control plane.

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};

use tether_core::{Device, Packet, PowerAct};

const DEFAULT_SERVER: &str = "http://127.0.0.1:8000";

// ── HTTP helpers ──────────────────────────────────────────────────────────────

struct Ctl {
    http: reqwest::Client,
    server: String,
}

impl Ctl {
    fn url(&self, path: &str) -> String {
        format!("{}/api{}", self.server, path)
    }

    /// POST a JSON body and decode the `Packet` reply. Non-2xx is an error
    /// carrying the server's message.
    async fn call(&self, path: &str, body: Value) -> Result<Packet> {
        let resp = self
            .http
            .post(self.url(path))
            .json(&body)
            .send()
            .await
            .with_context(|| format!("failed to reach tetherd at {}", self.server))?;
        let status = resp.status();
        let packet: Packet = resp.json().await.context("failed to parse response")?;
        if !status.is_success() {
            bail!("{status}: {}", packet.msg);
        }
        Ok(packet)
    }
}

/// `uuid` when the argument looks like a session id, `device` otherwise.
fn target(key: &str) -> Value {
    if key.len() == 36 && key.chars().filter(|c| *c == '-').count() == 4 {
        json!({ "uuid": key })
    } else {
        json!({ "device": key })
    }
}

// ── Subcommand handlers ───────────────────────────────────────────────────────

async fn cmd_devices(ctl: &Ctl) -> Result<()> {
    let reply = ctl.call("/device/list", json!({})).await?;
    let devices: BTreeMap<String, Device> = match reply.data {
        Some(data) => serde_json::from_value(Value::Object(data))?,
        None => BTreeMap::new(),
    };

    if devices.is_empty() {
        println!("No devices online.");
        return Ok(());
    }

    println!("═══════════════════════════════════════");
    println!("  Online Devices ({})", devices.len());
    println!("═══════════════════════════════════════");
    for (session, d) in &devices {
        println!("  ┌─ {} ({})", d.id, d.hostname);
        println!("  │  session  : {}", session);
        println!("  │  os/arch  : {}/{}", d.os, d.arch);
        println!("  │  wan      : {}", d.wan);
        println!("  │  cpu      : {:.1}%", d.cpu.usage);
        println!("  │  ram      : {:.1}%", d.ram.usage);
        println!("  └─ latency  : {}ms", d.latency);
    }
    Ok(())
}

async fn cmd_exec(ctl: &Ctl, device: &str, cmd: &str, args: &[&str]) -> Result<()> {
    let mut body = target(device);
    body["cmd"] = json!(cmd);
    body["args"] = json!(args);
    let reply = ctl.call("/device/exec", body).await?;
    match reply.data {
        Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
        None => println!("ok"),
    }
    Ok(())
}

async fn cmd_power(ctl: &Ctl, act: &str, device: &str) -> Result<()> {
    let act = PowerAct::parse(act).with_context(|| format!("unknown power action: {act}"))?;
    ctl.call(&format!("/device/{}", act.as_str().to_ascii_lowercase()), target(device))
        .await?;
    println!("{} sent to {}.", act.as_str(), device);
    Ok(())
}

async fn cmd_screenshot(ctl: &Ctl, device: &str, out: &str) -> Result<()> {
    let resp = ctl
        .http
        .post(ctl.url("/device/screenshot/get"))
        .json(&target(device))
        .send()
        .await
        .with_context(|| format!("failed to reach tetherd at {}", ctl.server))?;
    if !resp.status().is_success() {
        let status = resp.status();
        let packet: Packet = resp.json().await.unwrap_or_default();
        bail!("{status}: {}", packet.msg);
    }
    let image = resp.bytes().await?;
    tokio::fs::write(out, &image)
        .await
        .with_context(|| format!("failed to write {out}"))?;
    println!("Saved {} bytes to {}.", image.len(), out);
    Ok(())
}

async fn cmd_upload(ctl: &Ctl, device: &str, local: &str, remote: &str) -> Result<()> {
    let contents = tokio::fs::read(local)
        .await
        .with_context(|| format!("failed to read {local}"))?;
    let key = if target(device).get("uuid").is_some() { "uuid" } else { "device" };
    let url = reqwest::Url::parse_with_params(
        &ctl.url("/device/file/upload"),
        &[(key, device), ("file", remote)],
    )?;
    let resp = ctl
        .http
        .post(url)
        .body(contents)
        .send()
        .await
        .with_context(|| format!("failed to reach tetherd at {}", ctl.server))?;
    let status = resp.status();
    let packet: Packet = resp.json().await.context("failed to parse response")?;
    if !status.is_success() {
        bail!("{status}: {}", packet.msg);
    }
    let bytes = packet
        .data
        .as_ref()
        .and_then(|d| d.get("bytes"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    println!("Uploaded {bytes} bytes to {device}:{remote}.");
    Ok(())
}

fn print_usage() {
    println!("Usage: tether-ctl [--server <url>] <command>");
    println!();
    println!("Commands:");
    println!("  devices                           List online devices");
    println!("  exec <device> <cmd> [args...]     Run a command on a device");
    println!("  power <act> <device>              lock|logoff|hibernate|suspend|restart|shutdown|offline");
    println!("  screenshot <device> <out.png>     Save a screenshot");
    println!("  upload <device> <local> <remote>  Send a file to a device");
    println!();
    println!("Options:");
    println!("  --server <url>   Control plane address (default: {})", DEFAULT_SERVER);
    println!();
    println!("<device> is a device id or a session uuid.");
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    let mut server = std::env::var("TETHER_SERVER").unwrap_or_else(|_| DEFAULT_SERVER.to_string());
    let mut remaining: Vec<&str> = Vec::new();
    let mut i = 0;
    while i < args.len() {
        if args[i] == "--server" {
            i += 1;
            server = args.get(i).context("--server requires a value")?.clone();
        } else {
            remaining.push(&args[i]);
        }
        i += 1;
    }

    let ctl = Ctl {
        http: reqwest::Client::new(),
        server: server.trim_end_matches('/').to_string(),
    };

    match remaining.as_slice() {
        ["devices"] | []                       => cmd_devices(&ctl).await,
        ["exec", device, cmd, args @ ..]       => cmd_exec(&ctl, device, cmd, args).await,
        ["power", act, device]                 => cmd_power(&ctl, act, device).await,
        ["screenshot", device, out]            => cmd_screenshot(&ctl, device, out).await,
        ["upload", device, local, remote]      => cmd_upload(&ctl, device, local, remote).await,
        ["help"] | ["--help"] | ["-h"]         => { print_usage(); Ok(()) }
        other => {
            eprintln!("Unknown command: {}", other.join(" "));
            eprintln!();
            print_usage();
            std::process::exit(1);
        }
    }
}
