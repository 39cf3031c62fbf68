// Tether Linux: send files to a peer as chunked objects, or receive them.

mod config;
mod link;
mod receiver;
mod service;

use anyhow::Context;
use tether_core::TetherCore;
use tokio::net::{TcpListener, TcpStream};
use tracing_subscriber::EnvFilter;

use crate::service::TransferOutcome;

const VERSION: &str = env!("CARGO_PKG_VERSION");

const USAGE: &str = "usage: tether-linux [--version] (send FILE... | receive)";

enum Mode {
    Send(Vec<String>),
    Receive,
}

fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1).peekable();
    if args
        .peek()
        .is_some_and(|a| a == "--version" || a == "-V")
    {
        println!("tether-linux {}", VERSION);
        return Ok(());
    }
    let mode = match args.next().as_deref() {
        Some("send") => Mode::Send(args.collect()),
        Some("receive") => Mode::Receive,
        _ => anyhow::bail!(USAGE),
    };
    if let Mode::Send(files) = &mode {
        if files.is_empty() {
            anyhow::bail!(USAGE);
        }
    }

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cfg = config::load();
    cfg.delivery
        .validate()
        .context("invalid [delivery] settings")?;

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(async {
        match mode {
            Mode::Send(files) => send_files(&cfg, files).await,
            Mode::Receive => {
                let listener = TcpListener::bind(("0.0.0.0", cfg.listen_port)).await?;
                tracing::info!(port = cfg.listen_port, dir = %cfg.output_dir.display(), "receiving");
                tokio::select! {
                    res = receiver::run_receiver(listener, cfg.app_uuid, cfg.output_dir.clone()) => res?,
                    res = shutdown_signal() => res?,
                }
                Ok(())
            }
        }
    })
}

async fn send_files(cfg: &config::Config, files: Vec<String>) -> anyhow::Result<()> {
    let mut stream = TcpStream::connect(&cfg.peer_addr)
        .await
        .with_context(|| format!("connect to {}", cfg.peer_addr))?;
    link::handshake(&mut stream, cfg.app_uuid)
        .await
        .context("handshake")?;
    tracing::info!(peer = %cfg.peer_addr, "link up");

    let (reader, writer) = stream.into_split();
    let (handle, mut task) = service::spawn(
        TetherCore::with_config(cfg.delivery.clone()),
        link::spawn_writer(writer),
        link::spawn_reader(reader),
    );

    let transfers = async {
        let mut failed = 0;
        for (i, file) in files.iter().enumerate() {
            let object_id = i as u32 + 1;
            let data = tokio::fs::read(file)
                .await
                .with_context(|| format!("read {file}"))?;
            match handle.send_object(object_id, data).await? {
                TransferOutcome::Complete => tracing::info!(file, object_id, "sent"),
                other => {
                    failed += 1;
                    tracing::warn!(file, object_id, outcome = ?other, "not sent");
                }
            }
        }
        anyhow::Ok(failed)
    };

    let failed = tokio::select! {
        res = transfers => res?,
        res = shutdown_signal() => {
            res?;
            handle.shutdown();
            let _ = (&mut task).await;
            anyhow::bail!("interrupted");
        }
    };
    if failed > 0 {
        anyhow::bail!("{failed} file(s) not sent");
    }
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM (Unix).
async fn shutdown_signal() -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => res?,
            _ = sigterm.recv() => {}
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
    }
    Ok(())
}
