use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use serde_json::Value;
use tokio::signal;
use tokio::sync::watch as tokio_watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use upath_core::multiplexer;
use upath_core::{BlobStore, DistributedLock, MuxId, Multiplexer};

use upath_local::config::{Command, Config};
use upath_local::LocalStore;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Logs go to stderr; stdout carries ids and elements.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = Config::parse();
    let root = config.effective_root();
    info!("Store root: {}", root.display());
    let store: Arc<dyn BlobStore> = Arc::new(LocalStore::new(&root));

    match config.command.clone() {
        Command::New {
            location,
            tag,
            elements,
        } => {
            let elements: Vec<Value> = elements.iter().map(|e| parse_element(e)).collect();
            let id = Multiplexer::create(store.as_ref(), elements, &location, tag.as_deref()).await?;
            println!("{}", id);
        }
        Command::Session { dataset_id } => {
            let dataset: MuxId = dataset_id.parse()?;
            let id = multiplexer::create_read_session(store.as_ref(), &dataset).await?;
            println!("{}", id);
        }
        Command::Stat { id } => {
            let status = multiplexer::stat(store.as_ref(), &id.parse::<MuxId>()?).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Done { id } => {
            println!("{}", multiplexer::done(store.as_ref(), &id.parse::<MuxId>()?).await?);
        }
        Command::Destroy { id } => {
            let removed = multiplexer::destroy(store.as_ref(), &id.parse::<MuxId>()?).await?;
            info!("Removed {} objects", removed);
        }
        Command::Sessions { dataset_id } => {
            let dataset: MuxId = dataset_id.parse()?;
            for session in multiplexer::list_sessions(store.as_ref(), &dataset).await? {
                println!("{}\t{}", session, dataset.with_session(session.as_str()));
            }
        }
        Command::Work {
            session_id,
            worker_id,
        } => {
            let mut mux = Multiplexer::<Value>::open(store, session_id.parse::<MuxId>()?)?
                .with_lock_config(config.lock_config())
                .with_timeout(config.timeout());
            if let Some(worker_id) = worker_id {
                mux = mux.with_worker_id(worker_id);
            }
            info!("Worker {} joining session", mux.worker_id());

            let mut shutdown_rx = create_shutdown_signal();
            let mut count = 0usize;
            loop {
                tokio::select! {
                    _ = shutdown_rx.wait_for(|&v| v) => {
                        warn!("Interrupted after {} elements", count);
                        break;
                    }
                    element = mux.next() => match element? {
                        Some(element) => {
                            println!("{}", element);
                            count += 1;
                        }
                        None => break,
                    },
                }
            }
            info!("Worker {} received {} elements", mux.worker_id(), count);
        }
        Command::Lock { path, hold_secs } => {
            let lock = DistributedLock::for_resource(store, &path).with_config(config.lock_config());
            let handle = lock.acquire(None).await?;
            info!("Acquired {} (generation {})", handle.path(), handle.generation());

            let mut shutdown_rx = create_shutdown_signal();
            match hold_secs {
                Some(secs) => {
                    tokio::select! {
                        _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
                        _ = shutdown_rx.wait_for(|&v| v) => {}
                    }
                }
                None => {
                    let _ = shutdown_rx.wait_for(|&v| v).await;
                }
            }

            if handle.is_lost() {
                warn!("Lock {} was lost while held", path);
            }
            lock.release(handle).await?;
            info!("Released {}", path);
        }
    }

    Ok(())
}

/// Parse a command line element as JSON, falling back to a plain string.
fn parse_element(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

/// Create a shutdown signal that triggers on Ctrl+C or SIGTERM.
fn create_shutdown_signal() -> tokio_watch::Receiver<bool> {
    let (tx, rx) = tokio_watch::channel(false);

    tokio::spawn(async move {
        let ctrl_c = async {
            if signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C, stopping");
            } else {
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut sigterm) => {
                    sigterm.recv().await;
                    info!("Received SIGTERM, stopping");
                }
                Err(_) => std::future::pending::<()>().await,
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        let _ = tx.send(true);
    });

    rx
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_element() {
        assert_eq!(parse_element("42"), serde_json::json!(42));
        assert_eq!(parse_element(r#"{"a":[1,2]}"#), serde_json::json!({"a": [1, 2]}));
        assert_eq!(parse_element("plain"), Value::String("plain".into()));
    }
}
