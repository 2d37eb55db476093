use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use fray_proxy::{Direction, ProxyOptions, ProxySpec, Registry, ToxicSpec};
use fray_settings::ConfigLoader;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use crate::error::CliError;

const PAYLOAD_SIZE: usize = 64 * 1024;

pub async fn check(cwd: PathBuf) -> Result<(), CliError> {
    let mut failed = 0;

    // 1. Platform info
    println!("Platform: {}", std::env::consts::OS);
    println!("Architecture: {}", std::env::consts::ARCH);

    // 2. Relay smoke-test, plain and through a toxic chain
    let registry = Registry::new(ProxyOptions::default());
    for (label, toxics) in [("Relay", false), ("Relay (toxics)", true)] {
        print!("{label}: ");
        match relay_round_trip(&registry, toxics).await {
            Ok(()) => println!("OK"),
            Err(e) => {
                println!("FAIL ({e})");
                failed += 1;
            }
        }
    }
    registry.clear_all().await;

    // 3. Config
    let project_path = ConfigLoader::project_config_path(&cwd);

    println!("\nConfig files:");
    match ConfigLoader::global_config_path() {
        Some(global_path) => print_config_status(&global_path),
        None => println!("  global config: no config directory available"),
    }
    print_config_status(&project_path);

    match ConfigLoader::load(&cwd) {
        Ok(config) => println!("Config loaded: OK ({} proxies)", config.proxies.len()),
        Err(e) => {
            println!("Config loaded: FAIL ({e})");
            failed += 1;
        }
    }

    if failed > 0 {
        return Err(CliError::ChecksFailed { failed });
    }

    Ok(())
}

fn print_config_status(path: &std::path::Path) {
    let status = if path.exists() { "found" } else { "not found" };
    println!("  {} ({})", path.display(), status);
}

/// Echo a payload through a fresh proxy and compare it byte for byte.
async fn relay_round_trip(registry: &Registry, with_toxics: bool) -> Result<(), CliError> {
    let echo = spawn_echo().await?;
    let name = if with_toxics { "check-toxics" } else { "check" };
    let proxy = registry
        .add(ProxySpec::new(name, "127.0.0.1:0", echo.to_string()), true)
        .await?;

    if with_toxics {
        proxy.toxics().add(
            ToxicSpec::new("fragment", "slicer", Direction::Upstream)
                .with_attribute("average_size", 1024.0)
                .with_attribute("size_variation", 512.0),
        )?;
        proxy.toxics().add(
            ToxicSpec::new("delay", "latency", Direction::Downstream)
                .with_attribute("latency", 5.0)
                .with_attribute("jitter", 2.0),
        )?;
    }

    let payload: Vec<u8> = (0..PAYLOAD_SIZE).map(|i| (i % 251) as u8).collect();
    let stream = TcpStream::connect(proxy.listen_addr()).await?;
    let (mut reader, mut writer) = stream.into_split();
    let sent = payload.clone();
    let writer = tokio::spawn(async move { writer.write_all(&sent).await });

    let mut received = vec![0u8; PAYLOAD_SIZE];
    tokio::time::timeout(Duration::from_secs(10), reader.read_exact(&mut received))
        .await
        .map_err(|_| CliError::Other("timed out waiting for echo".to_string()))??;
    writer
        .await
        .map_err(|e| CliError::Other(format!("writer task failed: {e}")))??;

    if received != payload {
        return Err(CliError::Other("payload was altered in transit".to_string()));
    }
    registry.remove(name).await?;
    Ok(())
}

async fn spawn_echo() -> Result<SocketAddr, CliError> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            tokio::spawn(async move {
                let (mut reader, mut writer) = socket.split();
                let _ = tokio::io::copy(&mut reader, &mut writer).await;
            });
        }
    });
    Ok(addr)
}
