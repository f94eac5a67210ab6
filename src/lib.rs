pub mod rules;

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use backon::{ExponentialBuilder, Retryable};
use tokio::io::{self, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, Semaphore};
use tokio::task::JoinSet;
use tokio::time;
use tracing::{error, info, warn};

use crate::rules::{Rule, RuleSet};

const GRACEFUL_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(15);

const COPY_BUF_SIZE: usize = 8 * 1024;

/// Per-rule resource bounds.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum in-flight connections per forwarding rule.
    pub max_connections: usize,
    /// Close a connection when one direction sees no traffic for this long.
    /// `None` means connections may stay idle forever.
    pub idle_timeout: Option<Duration>,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_connections: 1024,
            idle_timeout: None,
        }
    }
}

struct Listener {
    rule: Rule,
    limits: Limits,
    shutdown_complete_tx: mpsc::Sender<()>,
}

struct Handler {
    inbound: TcpStream,
    outbound: TcpStream,
    idle_timeout: Option<Duration>,
    _shutdown_complete: mpsc::Sender<()>,
}

/// Serves every rule in the set until `shutdown` completes or all
/// forwarders have stopped.
///
/// Each rule gets its own accept loop; a rule that fails to bind or
/// exhausts its accept retries is logged and dropped without affecting
/// the others. Once `shutdown` resolves, accept loops are cancelled and
/// in-flight connections get [`GRACEFUL_SHUTDOWN_TIMEOUT`] to drain.
pub async fn run(rules: RuleSet, limits: Limits, shutdown: impl Future) {
    let (shutdown_complete_tx, mut shutdown_complete_rx) = mpsc::channel::<()>(1);

    let mut listeners = JoinSet::new();
    for rule in rules.iter() {
        let mut listener = Listener {
            rule,
            limits,
            shutdown_complete_tx: shutdown_complete_tx.clone(),
        };
        listeners.spawn(async move {
            let res = listener.run().await;
            (listener.rule, res)
        });
    }

    drop(shutdown_complete_tx);

    tokio::select! {
        _ = supervise(&mut listeners) => {}
        _ = shutdown => {
            info!("shutting down");
        }
    }

    // Cancel the accept loops; spawned handlers keep running and hold
    // their own clones of the drain channel.
    listeners.shutdown().await;

    if time::timeout(GRACEFUL_SHUTDOWN_TIMEOUT, shutdown_complete_rx.recv())
        .await
        .is_err()
    {
        warn!("graceful shutdown timeout");
    }
}

/// Reaps listener tasks, containing each failure to its own rule.
async fn supervise(listeners: &mut JoinSet<(Rule, Result<()>)>) {
    while let Some(res) = listeners.join_next().await {
        match res {
            Ok((rule, Err(err))) => {
                error!(%rule, cause = %err, "forward stopped");
            }
            Ok((rule, Ok(()))) => {
                info!(%rule, "forward stopped");
            }
            Err(err) => {
                error!(cause = %err, "forward task panicked");
            }
        }
    }
}

impl Listener {
    async fn run(&mut self) -> Result<()> {
        let listener = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.rule.source))
            .await
            .with_context(|| format!("failed to bind source port {}", self.rule.source))?;

        info!(rule = %self.rule, "accepting inbound connections");

        let conn_limit = Arc::new(Semaphore::new(self.limits.max_connections));

        let accept = || async { listener.accept().await };
        let backoff_builder = ExponentialBuilder::default()
            .with_jitter()
            .with_max_times(64);

        loop {
            let permit = conn_limit.clone().acquire_owned().await?;
            let (inbound, peer) = accept.retry(&backoff_builder).await?;

            let rule = self.rule;
            info!(%rule, ?peer, "new connection");

            let idle_timeout = self.limits.idle_timeout;
            let shutdown_complete = self.shutdown_complete_tx.clone();

            tokio::spawn(async move {
                let _permit = permit;
                let mut handler =
                    match Handler::connect(inbound, rule, idle_timeout, shutdown_complete).await {
                        Ok(handler) => handler,
                        Err(err) => {
                            // Inbound socket is dropped here; the rule
                            // keeps serving other connections.
                            error!(%rule, ?peer, cause = %err, "connection error");
                            return;
                        }
                    };
                match handler.run().await {
                    Ok(_) => {
                        info!(%rule, ?peer, "connection closed");
                    }
                    Err(err) => {
                        error!(%rule, ?peer, cause = ?err, "connection error");
                    }
                }
            });
        }
    }
}

impl Handler {
    async fn connect(
        inbound: TcpStream,
        rule: Rule,
        idle_timeout: Option<Duration>,
        shutdown_complete: mpsc::Sender<()>,
    ) -> Result<Self> {
        let outbound = TcpStream::connect((Ipv4Addr::LOCALHOST, rule.destination))
            .await
            .with_context(|| format!("failed to dial destination port {}", rule.destination))?;

        Ok(Handler {
            inbound,
            outbound,
            idle_timeout,
            _shutdown_complete: shutdown_complete,
        })
    }

    async fn run(&mut self) -> Result<()> {
        let idle_timeout = self.idle_timeout;
        let (mut ri, mut wi) = self.inbound.split();
        let (mut ro, mut wo) = self.outbound.split();

        let client_to_server = async {
            copy_half(&mut ri, &mut wo, idle_timeout).await?;
            wo.shutdown().await
        };

        let server_to_client = async {
            copy_half(&mut ro, &mut wi, idle_timeout).await?;
            wi.shutdown().await
        };

        // Either direction ending in error tears down both halves; the
        // sockets close together when the handler is dropped.
        tokio::try_join!(client_to_server, server_to_client)?;

        Ok(())
    }
}

/// Moves bytes from `src` to `dst` until end-of-stream, an I/O error, or
/// (when set) `idle_timeout` elapses with nothing readable. Content,
/// order, and count pass through untouched.
async fn copy_half<R, W>(
    src: &mut R,
    dst: &mut W,
    idle_timeout: Option<Duration>,
) -> io::Result<u64>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; COPY_BUF_SIZE];
    let mut total = 0u64;

    loop {
        let n = match idle_timeout {
            Some(limit) => time::timeout(limit, src.read(&mut buf))
                .await
                .map_err(|_| io::Error::new(io::ErrorKind::TimedOut, "connection idle"))??,
            None => src.read(&mut buf).await?,
        };
        if n == 0 {
            return Ok(total);
        }
        dst.write_all(&buf[..n]).await?;
        total += n as u64;
    }
}
