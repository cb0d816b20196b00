// Agent front-end: routes client commands and broker pushes to
// per-connection actors

use crate::agent::client::{ClientPool, InboundEvent};
use crate::agent::command::{
    read_agent_transmission, write_agent_event, AgentCmd, AgentEvent, ReplyMode,
};
use crate::agent::config::AgentConfig;
use crate::agent::connection::{spawn_conn_actor, AgentOut, ConnHandle, ConnOp};
use crate::agent::store::AgentStore;
use crate::smp::error::{AgentError, ERR_NO_CONN_ALIAS};
use crate::transport::tcp;
use anyhow::{Context, Result};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use uuid::Uuid;

enum AgentOp {
    Attach {
        client_id: Uuid,
        out: mpsc::UnboundedSender<AgentOut>,
    },
    Detach {
        client_id: Uuid,
    },
    Command {
        client_id: Uuid,
        corr_id: String,
        alias: String,
        cmd: AgentCmd,
    },
}

/// Handle for submitting work to a running agent.
#[derive(Clone)]
pub struct AgentHandle {
    op_tx: mpsc::UnboundedSender<AgentOp>,
}

impl AgentHandle {
    /// Attaches an in-process client: commands go in through the returned
    /// handle, events for its connections come out of its receiver.
    pub fn attach(&self) -> AgentClient {
        let client_id = Uuid::new_v4();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let _ = self.op_tx.send(AgentOp::Attach {
            client_id,
            out: out_tx,
        });
        AgentClient {
            client_id,
            op_tx: self.op_tx.clone(),
            out_rx,
        }
    }
}

/// One attached local client.
pub struct AgentClient {
    client_id: Uuid,
    op_tx: mpsc::UnboundedSender<AgentOp>,
    out_rx: mpsc::UnboundedReceiver<AgentOut>,
}

impl AgentClient {
    pub fn command(&self, corr_id: &str, alias: &str, cmd: AgentCmd) {
        self.commander().command(corr_id, alias, cmd);
    }

    /// A cloneable command submitter for this client, usable from another
    /// task while this handle waits on events.
    pub fn commander(&self) -> AgentCommander {
        AgentCommander {
            client_id: self.client_id,
            op_tx: self.op_tx.clone(),
        }
    }

    pub async fn next_event(&mut self) -> Option<AgentOut> {
        self.out_rx.recv().await
    }
}

#[derive(Clone)]
pub struct AgentCommander {
    client_id: Uuid,
    op_tx: mpsc::UnboundedSender<AgentOp>,
}

impl AgentCommander {
    pub fn command(&self, corr_id: &str, alias: &str, cmd: AgentCmd) {
        let _ = self.op_tx.send(AgentOp::Command {
            client_id: self.client_id,
            corr_id: corr_id.to_string(),
            alias: alias.to_string(),
            cmd,
        });
    }
}

impl Drop for AgentClient {
    fn drop(&mut self) {
        let _ = self.op_tx.send(AgentOp::Detach {
            client_id: self.client_id,
        });
    }
}

/// The running agent: store, server clients, connection actors.
pub struct Agent;

impl Agent {
    /// Starts the agent and, when configured, its local TCP listener.
    pub async fn start(config: AgentConfig) -> Result<AgentHandle> {
        let store = Arc::new(AgentStore::new(&config.database).context("opening agent store")?);
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let pool = Arc::new(ClientPool::new(inbound_tx));
        let (op_tx, op_rx) = mpsc::unbounded_channel();
        let (conn_out_tx, conn_out_rx) = mpsc::unbounded_channel();

        let handle = AgentHandle { op_tx };

        if let Some(port) = config.tcp_port {
            let listener = TcpListener::bind((config.bind_host.as_str(), port))
                .await
                .with_context(|| format!("binding agent {}:{}", config.bind_host, port))?;
            tracing::info!(addr = %listener.local_addr()?, "agent listener started");
            tokio::spawn(serve_clients(listener, handle.clone()));
        }

        let actor = AgentActor {
            store,
            pool,
            default_reply_off: config.default_reply_mode == "off",
            op_rx,
            inbound_rx,
            conn_out_rx,
            conn_out_tx,
            clients: HashMap::new(),
            conns: HashMap::new(),
            owners: HashMap::new(),
        };
        tokio::spawn(actor.run());

        Ok(handle)
    }
}

struct AgentActor {
    store: Arc<AgentStore>,
    pool: Arc<ClientPool>,
    default_reply_off: bool,
    op_rx: mpsc::UnboundedReceiver<AgentOp>,
    inbound_rx: mpsc::UnboundedReceiver<InboundEvent>,
    conn_out_rx: mpsc::UnboundedReceiver<AgentOut>,
    conn_out_tx: mpsc::UnboundedSender<AgentOut>,
    clients: HashMap<Uuid, mpsc::UnboundedSender<AgentOut>>,
    conns: HashMap<String, ConnHandle>,
    owners: HashMap<String, Uuid>,
}

impl AgentActor {
    async fn run(mut self) {
        self.resubscribe_persisted();
        loop {
            tokio::select! {
                op = self.op_rx.recv() => match op {
                    Some(op) => self.handle_op(op),
                    None => break,
                },
                event = self.inbound_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_inbound(event);
                    }
                }
                out = self.conn_out_rx.recv() => {
                    if let Some(out) = out {
                        self.route_out(out);
                    }
                }
            }
        }
        tracing::info!("agent stopped");
    }

    /// Revives every persisted connection after a restart: an actor per
    /// alias, and a SUB reissued for each receive queue so the broker
    /// resumes pushing before any local client shows up. A queue whose
    /// server is still unreachable is registered anyway; the client's
    /// reconnect loop resubscribes it once the transport is back.
    fn resubscribe_persisted(&mut self) {
        let queues = match self.store.all_rcv_queues() {
            Ok(queues) => queues,
            Err(e) => {
                tracing::error!(error = %e, "listing receive queues failed");
                return;
            }
        };
        for queue in queues {
            if let Err(e) = self.conn_sender(&queue.conn_alias, false) {
                tracing::warn!(conn = %queue.conn_alias, error = %e, "reviving connection failed");
                continue;
            }
            let pool = self.pool.clone();
            tokio::spawn(async move {
                let client = pool.get(&queue.server).await;
                let _ = client.wait_connected().await;
                if let Err(e) = client
                    .subscribe(&queue.recipient_id, queue.recipient_key.clone())
                    .await
                {
                    tracing::warn!(conn = %queue.conn_alias, error = %e, "startup resubscribe failed");
                }
            });
        }
    }

    fn handle_op(&mut self, op: AgentOp) {
        match op {
            AgentOp::Attach { client_id, out } => {
                self.clients.insert(client_id, out);
            }
            AgentOp::Detach { client_id } => {
                self.clients.remove(&client_id);
                self.owners.retain(|_, owner| *owner != client_id);
            }
            AgentOp::Command {
                client_id,
                corr_id,
                mut alias,
                cmd,
            } => {
                let creating = matches!(cmd, AgentCmd::New(_) | AgentCmd::Join(..));
                if alias.is_empty() {
                    if creating {
                        alias = Uuid::new_v4().to_string();
                    } else {
                        self.reply_err(
                            client_id,
                            &corr_id,
                            &alias,
                            AgentError::Syntax(ERR_NO_CONN_ALIAS),
                        );
                        return;
                    }
                }
                // a bare JOIN means the configured default reply mode
                let cmd = match cmd {
                    AgentCmd::Join(info, ReplyMode::On) if self.default_reply_off => {
                        AgentCmd::Join(info, ReplyMode::Off)
                    }
                    other => other,
                };

                let conn_tx = match self.conn_sender(&alias, creating) {
                    Ok(tx) => tx,
                    Err(e) => {
                        self.reply_err(client_id, &corr_id, &alias, e);
                        return;
                    }
                };
                self.owners.insert(alias.clone(), client_id);
                let _ = conn_tx.send(ConnOp::Cmd { corr_id, cmd });
            }
        }
    }

    /// The actor for `alias`, spawning one for creations and reviving one
    /// for connections that exist only in the store (after a restart).
    fn conn_sender(
        &mut self,
        alias: &str,
        creating: bool,
    ) -> Result<mpsc::UnboundedSender<ConnOp>, AgentError> {
        if !self.conns.contains_key(alias) {
            if creating {
                if self.store.get_conn(alias).is_ok() {
                    return Err(AgentError::Store("alias_taken".to_string()));
                }
            } else {
                self.store.get_conn(alias).map_err(|_| AgentError::Unknown)?;
            }
            let handle = spawn_conn_actor(
                alias.to_string(),
                self.store.clone(),
                self.pool.clone(),
                self.conn_out_tx.clone(),
            );
            self.conns.insert(alias.to_string(), handle);
        }
        Ok(self.conns[alias].tx.clone())
    }

    fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Msg {
                server,
                recipient_id,
                msg_id,
                timestamp,
                body,
            } => {
                let alias = match self.store.alias_by_recipient(&server, &recipient_id) {
                    Ok(Some(alias)) => alias,
                    Ok(None) => {
                        tracing::debug!(server = %server, "message for unknown queue dropped");
                        return;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "recipient lookup failed");
                        return;
                    }
                };
                match self.conn_sender(&alias, false) {
                    Ok(tx) => {
                        let _ = tx.send(ConnOp::Inbound {
                            msg_id,
                            timestamp,
                            body,
                        });
                    }
                    Err(e) => tracing::warn!(conn = %alias, error = %e, "no actor for inbound"),
                }
            }
            InboundEvent::End {
                server,
                recipient_id,
            } => {
                let alias = self
                    .store
                    .alias_by_recipient(&server, &recipient_id)
                    .ok()
                    .flatten();
                tracing::warn!(server = %server, conn = ?alias, "subscription taken over");
            }
        }
    }

    fn route_out(&mut self, out: AgentOut) {
        let Some(owner) = self.owners.get(&out.alias) else {
            tracing::debug!(conn = %out.alias, "event for unowned connection dropped");
            return;
        };
        if let Some(client) = self.clients.get(owner) {
            if client.send(out).is_ok() {
                return;
            }
        }
        tracing::debug!("owning client gone, event dropped");
    }

    fn reply_err(&self, client_id: Uuid, corr_id: &str, alias: &str, e: AgentError) {
        if let Some(client) = self.clients.get(&client_id) {
            let _ = client.send(AgentOut {
                corr_id: corr_id.to_string(),
                alias: alias.to_string(),
                event: AgentEvent::Err(e),
            });
        }
    }
}

/// Serves local clients over plain TCP with the agent transmission
/// grammar: correlation id, connection alias, command, optional body.
async fn serve_clients(listener: TcpListener, handle: AgentHandle) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(peer = %peer, "agent client connected");
                let client = handle.attach();
                tokio::spawn(serve_one_client(stream, client));
            }
            Err(e) => tracing::warn!(error = %e, "agent accept error"),
        }
    }
}

async fn serve_one_client(stream: tokio::net::TcpStream, mut client: AgentClient) {
    let transport = tcp::from_tcp_stream(stream);
    let (mut read, mut write) = transport.into_split();
    let commander = client.commander();
    let (err_tx, mut err_rx) = mpsc::unbounded_channel::<AgentOut>();

    let writer = tokio::spawn(async move {
        loop {
            let out = tokio::select! {
                out = client.next_event() => out,
                err = err_rx.recv() => err,
            };
            let Some(out) = out else { break };
            if write_agent_event(write.as_mut(), &out.corr_id, &out.alias, &out.event)
                .await
                .is_err()
            {
                break;
            }
        }
    });

    loop {
        match read_agent_transmission(read.as_mut()).await {
            Err(_) => break,
            Ok(Err((corr_id, e))) => {
                let _ = err_tx.send(AgentOut {
                    corr_id,
                    alias: String::new(),
                    event: AgentEvent::Err(e),
                });
            }
            Ok(Ok((corr_id, alias, cmd))) => commander.command(&corr_id, &alias, cmd),
        }
    }
    writer.abort();
    tracing::debug!("agent client disconnected");
}
