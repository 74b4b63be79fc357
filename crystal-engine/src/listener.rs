use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::fanout::MetricFanout;

/// Longest metric line accepted; a producer sending more is disconnected.
pub const MAX_LINE_BYTES: usize = 8 * 1024;

/// TCP listener feeding newline separated metric lines into the fan-out.
pub struct MetricStreamListener {
    listener: TcpListener,
    fanout: MetricFanout,
}

impl MetricStreamListener {
    pub async fn bind(address: &str, fanout: MetricFanout) -> std::io::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        Ok(Self { listener, fanout })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Accepts connections in the background until the returned sender fires
    /// or is dropped. Open connections are closed with it.
    pub fn spawn(self) -> oneshot::Sender<()> {
        let (tx, rx) = oneshot::channel();
        tokio::spawn(self.run(rx));
        tx
    }

    async fn run(self, mut shutdown: oneshot::Receiver<()>) {
        if let Ok(address) = self.listener.local_addr() {
            info!(%address, "metric stream listener started");
        }
        let mut connections = JoinSet::new();
        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                accepted = self.listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "metric producer connected");
                        connections.spawn(read_lines(stream, peer, self.fanout.clone()));
                    }
                    Err(err) => warn!(error = %err, "failed to accept metric connection"),
                },
            }
        }
        connections.shutdown().await;
        info!("metric stream listener stopped");
    }
}

async fn read_lines(stream: TcpStream, peer: SocketAddr, fanout: MetricFanout) {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    loop {
        line.clear();
        let read = (&mut reader)
            .take(MAX_LINE_BYTES as u64 + 1)
            .read_line(&mut line)
            .await;
        match read {
            Ok(0) => break,
            Ok(_) if line.len() > MAX_LINE_BYTES => {
                warn!(%peer, limit = MAX_LINE_BYTES, "metric line too long, closing connection");
                break;
            }
            Ok(_) if line.trim().is_empty() => {}
            Ok(_) => {
                if let Err(err) = fanout.ingest(line.trim_end()) {
                    warn!(%peer, error = %err, "dropping metric line");
                }
            }
            Err(err) => {
                warn!(%peer, error = %err, "metric connection failed");
                break;
            }
        }
    }
    debug!(%peer, "metric producer disconnected");
}
