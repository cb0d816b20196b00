// Long-lived client connections to SMP servers, one per server address

use crate::crypto::{random_id, SignKeyPair};
use crate::smp::address::SmpServer;
use crate::smp::error::{AgentError, BrokerFailure};
use crate::smp::transmission::{read_broker_transmission, write_client_transmission};
use crate::smp::{BrokerMsg, ClientCmd};
use crate::transport::{tls, TransportRead, TransportWrite};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tokio::time::timeout;

/// How long a command waits for its correlated response.
pub const CMD_TIMEOUT: Duration = Duration::from_secs(5);

/// Keepalive interval on an idle connection.
pub const PING_INTERVAL: Duration = Duration::from_secs(15);

const RECONNECT_MIN: Duration = Duration::from_millis(250);
const RECONNECT_MAX: Duration = Duration::from_secs(10);
const CORR_ID_LEN: usize = 16;

/// Something the broker pushed outside a command/response exchange.
#[derive(Debug)]
pub enum InboundEvent {
    Msg {
        server: SmpServer,
        recipient_id: Vec<u8>,
        msg_id: u64,
        timestamp: u64,
        body: Vec<u8>,
    },
    /// Another session took over the subscription.
    End {
        server: SmpServer,
        recipient_id: Vec<u8>,
    },
}

struct WriteReq {
    key: Option<SignKeyPair>,
    corr_id: Vec<u8>,
    queue_id: Vec<u8>,
    cmd: ClientCmd,
}

type Pending = Arc<Mutex<HashMap<Vec<u8>, oneshot::Sender<BrokerMsg>>>>;
type Subscriptions = Arc<Mutex<HashMap<Vec<u8>, SignKeyPair>>>;

/// One long-lived transport to one server. Outbound commands are
/// correlated with responses by random correlation ids; inbound MSG
/// pushes are routed to the shared inbound channel. The connection task
/// reconnects with exponential backoff and reissues SUB for every queue
/// subscribed through this client.
pub struct SmpClient {
    server: SmpServer,
    req_tx: mpsc::UnboundedSender<WriteReq>,
    pending: Pending,
    subscriptions: Subscriptions,
    connected: watch::Receiver<bool>,
}

impl SmpClient {
    pub fn new(server: SmpServer, inbound_tx: mpsc::UnboundedSender<InboundEvent>) -> Arc<Self> {
        let (req_tx, req_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(false);
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));
        let subscriptions: Subscriptions = Arc::new(Mutex::new(HashMap::new()));

        let client = Arc::new(Self {
            server: server.clone(),
            req_tx,
            pending: pending.clone(),
            subscriptions: subscriptions.clone(),
            connected: connected_rx,
        });

        tokio::spawn(connection_task(
            server,
            client.req_tx.clone(),
            req_rx,
            pending,
            subscriptions,
            inbound_tx,
            connected_tx,
        ));

        client
    }

    pub fn server(&self) -> &SmpServer {
        &self.server
    }

    /// Waits for the connection task to have a live transport.
    pub async fn wait_connected(&self) -> Result<(), AgentError> {
        let mut rx = self.connected.clone();
        let result = timeout(CMD_TIMEOUT, async {
            while !*rx.borrow() {
                if rx.changed().await.is_err() {
                    return Err(());
                }
            }
            Ok(())
        })
        .await;
        match result {
            Ok(Ok(())) => Ok(()),
            _ => Err(AgentError::Broker(BrokerFailure::TcpConnection)),
        }
    }

    /// Submits one command and waits for its correlated response.
    /// `ERR <code>` responses surface as `SMP(code)`.
    pub async fn send_command(
        &self,
        key: Option<&SignKeyPair>,
        queue_id: &[u8],
        cmd: ClientCmd,
    ) -> Result<BrokerMsg, AgentError> {
        if !*self.connected.borrow() {
            return Err(AgentError::Broker(BrokerFailure::TcpConnection));
        }
        let corr_id = random_id(CORR_ID_LEN);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(corr_id.clone(), tx);

        let sent = self.req_tx.send(WriteReq {
            key: key.cloned(),
            corr_id: corr_id.clone(),
            queue_id: queue_id.to_vec(),
            cmd,
        });
        if sent.is_err() {
            self.pending.lock().await.remove(&corr_id);
            return Err(AgentError::Broker(BrokerFailure::TcpConnection));
        }

        match timeout(CMD_TIMEOUT, rx).await {
            Err(_) => {
                self.pending.lock().await.remove(&corr_id);
                Err(AgentError::Broker(BrokerFailure::TcpConnection))
            }
            Ok(Err(_)) => Err(AgentError::Broker(BrokerFailure::TcpConnection)),
            Ok(Ok(BrokerMsg::Err(code))) => Err(AgentError::Smp(code)),
            Ok(Ok(msg)) => Ok(msg),
        }
    }

    /// Subscribes to a receive queue and registers it for automatic
    /// resubscription after reconnects.
    pub async fn subscribe(
        &self,
        recipient_id: &[u8],
        key: SignKeyPair,
    ) -> Result<(), AgentError> {
        self.subscriptions
            .lock()
            .await
            .insert(recipient_id.to_vec(), key.clone());
        match self
            .send_command(Some(&key), recipient_id, ClientCmd::Sub)
            .await?
        {
            BrokerMsg::Ok => Ok(()),
            _ => Err(AgentError::Broker(BrokerFailure::Unexpected)),
        }
    }
}

/// Keyed set of server clients shared by the whole agent.
pub struct ClientPool {
    clients: Mutex<HashMap<String, Arc<SmpClient>>>,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
}

impl ClientPool {
    pub fn new(inbound_tx: mpsc::UnboundedSender<InboundEvent>) -> Self {
        Self {
            clients: Mutex::new(HashMap::new()),
            inbound_tx,
        }
    }

    /// The client for `server`, creating and connecting it on first use.
    pub async fn get(&self, server: &SmpServer) -> Arc<SmpClient> {
        let key = server.serialize();
        let mut clients = self.clients.lock().await;
        clients
            .entry(key)
            .or_insert_with(|| SmpClient::new(server.clone(), self.inbound_tx.clone()))
            .clone()
    }
}

#[allow(clippy::too_many_arguments)]
async fn connection_task(
    server: SmpServer,
    req_tx: mpsc::UnboundedSender<WriteReq>,
    req_rx: mpsc::UnboundedReceiver<WriteReq>,
    pending: Pending,
    subscriptions: Subscriptions,
    inbound_tx: mpsc::UnboundedSender<InboundEvent>,
    connected_tx: watch::Sender<bool>,
) {
    let req_rx = Arc::new(Mutex::new(req_rx));
    let mut backoff = RECONNECT_MIN;

    loop {
        let transport = match tls::connect(&server).await {
            Ok(t) => t,
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "connect failed, backing off");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(RECONNECT_MAX);
                continue;
            }
        };
        backoff = RECONNECT_MIN;
        tracing::info!(server = %server, "connected");
        let (read, write) = transport.into_split();

        // reissue SUB for every known receive queue; commands submitted
        // while disconnected were rejected, so these go out first
        {
            let subs = subscriptions.lock().await;
            for (recipient_id, key) in subs.iter() {
                let _ = req_tx.send(WriteReq {
                    key: Some(key.clone()),
                    corr_id: random_id(CORR_ID_LEN),
                    queue_id: recipient_id.clone(),
                    cmd: ClientCmd::Sub,
                });
            }
        }
        let _ = connected_tx.send(true);

        let writer = tokio::spawn(write_loop(write, req_rx.clone()));
        read_loop(read, &server, &pending, &inbound_tx).await;
        writer.abort();
        let _ = writer.await;

        let _ = connected_tx.send(false);
        pending.lock().await.clear();
        tracing::warn!(server = %server, "connection lost, reconnecting");
    }
}

async fn write_loop(
    mut write: Box<dyn TransportWrite>,
    req_rx: Arc<Mutex<mpsc::UnboundedReceiver<WriteReq>>>,
) {
    let mut rx = req_rx.lock().await;
    loop {
        tokio::select! {
            req = rx.recv() => {
                let Some(req) = req else { break };
                let result = write_client_transmission(
                    write.as_mut(),
                    req.key.as_ref(),
                    &req.corr_id,
                    &req.queue_id,
                    &req.cmd,
                )
                .await;
                if result.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(PING_INTERVAL) => {
                if write_client_transmission(write.as_mut(), None, &[], &[], &ClientCmd::Ping)
                    .await
                    .is_err()
                {
                    break;
                }
            }
        }
    }
    write.close().await;
}

async fn read_loop(
    mut read: Box<dyn TransportRead>,
    server: &SmpServer,
    pending: &Pending,
    inbound_tx: &mpsc::UnboundedSender<InboundEvent>,
) {
    loop {
        match read_broker_transmission(read.as_mut()).await {
            Err(e) => {
                tracing::debug!(server = %server, error = %e, "read loop ended");
                return;
            }
            Ok(Err(e)) => {
                tracing::warn!(server = %server, error = %e, "unparseable broker transmission");
            }
            Ok(Ok(t)) => {
                if !t.corr_id.is_empty() {
                    if let Some(waiter) = pending.lock().await.remove(&t.corr_id) {
                        let _ = waiter.send(t.msg);
                        continue;
                    }
                }
                match t.msg {
                    BrokerMsg::Msg {
                        msg_id,
                        timestamp,
                        body,
                    } if !t.queue_id.is_empty() => {
                        let _ = inbound_tx.send(InboundEvent::Msg {
                            server: server.clone(),
                            recipient_id: t.queue_id,
                            msg_id,
                            timestamp,
                            body,
                        });
                    }
                    BrokerMsg::End if !t.queue_id.is_empty() => {
                        let _ = inbound_tx.send(InboundEvent::End {
                            server: server.clone(),
                            recipient_id: t.queue_id,
                        });
                    }
                    BrokerMsg::Pong => {}
                    other => {
                        tracing::debug!(server = %server, msg = ?other, "unpaired broker message")
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // nothing listens here; the connection task stays in its retry loop
    fn dead_server() -> SmpServer {
        SmpServer::new("127.0.0.1", Some(1), None)
    }

    #[tokio::test]
    async fn test_pool_keys_by_address() {
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let pool = ClientPool::new(inbound_tx);

        let a = pool.get(&dead_server()).await;
        let b = pool.get(&dead_server()).await;
        assert!(Arc::ptr_eq(&a, &b), "same address shares one client");

        let other = pool.get(&SmpServer::new("127.0.0.1", Some(2), None)).await;
        assert!(!Arc::ptr_eq(&a, &other));
    }

    #[tokio::test]
    async fn test_commands_fail_fast_while_disconnected() {
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let client = SmpClient::new(dead_server(), inbound_tx);

        // no transport yet, so the command is rejected without waiting
        // out the response timeout
        let started = std::time::Instant::now();
        let result = client.send_command(None, &[], ClientCmd::Ping).await;
        assert!(matches!(
            result,
            Err(AgentError::Broker(BrokerFailure::TcpConnection))
        ));
        assert!(started.elapsed() < CMD_TIMEOUT);
    }

    #[tokio::test]
    async fn test_subscribe_registers_before_sending() {
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let client = SmpClient::new(dead_server(), inbound_tx);
        let key = SignKeyPair::generate();
        let recipient_id = random_id(24);

        // the SUB itself fails while disconnected, but the queue is
        // remembered so the reconnect loop will reissue it
        let result = client.subscribe(&recipient_id, key).await;
        assert!(result.is_err());
        assert!(client
            .subscriptions
            .lock()
            .await
            .contains_key(&recipient_id));
    }

    #[tokio::test]
    async fn test_wait_connected_gives_up() {
        let (inbound_tx, _inbound_rx) = mpsc::unbounded_channel();
        let client = SmpClient::new(dead_server(), inbound_tx);
        assert!(matches!(
            client.wait_connected().await,
            Err(AgentError::Broker(BrokerFailure::TcpConnection))
        ));
    }
}
