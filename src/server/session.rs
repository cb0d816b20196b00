// Per-session command loop: parse, verify, dispatch, reply

use crate::server::store::{QueueStatus, QueueStore, StoreError};
use crate::server::subscription::{Outbound, SessionSender, SubscriptionManager};
use crate::smp::transmission::{read_client_transmission, write_broker_transmission};
use crate::smp::{BrokerMsg, ClientCmd, ClientTransmission, ErrorCode};
use crate::transport::{Transport, TransportError, TransportRead, TransportWrite};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::timeout;
use uuid::Uuid;

/// Shared server state handed to every session.
pub struct ServerCtx {
    pub store: QueueStore,
    pub subs: SubscriptionManager,
    pub idle_timeout: Duration,
    /// Flips to true on shutdown; sessions close their transports then.
    pub shutdown: watch::Receiver<bool>,
}

/// Runs one client session until the transport closes, the idle timeout
/// fires, or the server shuts down. Always releases the session's
/// subscriptions on the way out.
pub async fn run_session(transport: Transport, ctx: Arc<ServerCtx>) {
    let session_id = Uuid::new_v4();
    tracing::debug!(session = %session_id, "session started");

    let (read, write) = transport.into_split();
    let (tx, rx) = mpsc::unbounded_channel::<Outbound>();

    let write_task = tokio::spawn(write_loop(write, rx));
    let result = read_loop(read, &tx, session_id, &ctx).await;

    ctx.subs.unsubscribe_session(session_id).await;
    drop(tx);
    let _ = write_task.await;

    match result {
        Ok(()) | Err(TransportError::ConnClosed) => {
            tracing::debug!(session = %session_id, "session ended")
        }
        Err(e) => tracing::warn!(session = %session_id, error = %e, "session ended"),
    }
}

async fn write_loop(
    mut write: Box<dyn TransportWrite>,
    mut rx: mpsc::UnboundedReceiver<Outbound>,
) {
    while let Some(out) = rx.recv().await {
        if write_broker_transmission(write.as_mut(), &out.corr_id, &out.queue_id, &out.msg)
            .await
            .is_err()
        {
            break;
        }
    }
    write.close().await;
}

async fn read_loop(
    mut read: Box<dyn TransportRead>,
    tx: &SessionSender,
    session_id: Uuid,
    ctx: &Arc<ServerCtx>,
) -> Result<(), TransportError> {
    let mut shutdown = ctx.shutdown.clone();
    loop {
        let next = tokio::select! {
            // a dropped sender reads the same as a signalled shutdown
            _ = shutdown.changed() => {
                tracing::debug!(session = %session_id, "server shutdown");
                return Ok(());
            }
            result = timeout(ctx.idle_timeout, read_client_transmission(read.as_mut())) => {
                match result {
                    Err(_) => {
                        tracing::debug!(session = %session_id, "idle timeout");
                        return Ok(());
                    }
                    Ok(result) => result?,
                }
            }
        };
        match next {
            Err((corr_id, code)) => {
                let _ = tx.send(Outbound {
                    corr_id,
                    queue_id: Vec::new(),
                    msg: BrokerMsg::Err(code),
                });
            }
            Ok(t) => handle_transmission(ctx, session_id, tx, t).await,
        }
    }
}

async fn handle_transmission(
    ctx: &Arc<ServerCtx>,
    session_id: Uuid,
    tx: &SessionSender,
    t: ClientTransmission,
) {
    let corr_id = t.corr_id.clone();
    let queue_echo = t.queue_id.clone();

    let reply = match dispatch(ctx, session_id, tx, t).await {
        // the command replied on its own to order a push after the OK
        Ok(None) => return,
        Ok(Some(reply)) => reply,
        Err(code) => BrokerMsg::Err(code),
    };
    let _ = tx.send(Outbound {
        corr_id,
        queue_id: queue_echo,
        msg: reply,
    });
}

/// Dispatches one verified-or-rejected command. Pushes that must follow
/// the reply (SUB and ACK head deliveries) are ordered by sending them
/// through the same outbound channel after the reply; SEND deliveries go
/// to the subscriber's own session.
async fn dispatch(
    ctx: &Arc<ServerCtx>,
    session_id: Uuid,
    tx: &SessionSender,
    t: ClientTransmission,
) -> Result<Option<BrokerMsg>, ErrorCode> {
    match t.command {
        ClientCmd::Ping => Ok(Some(BrokerMsg::Pong)),

        ClientCmd::New(ref key) => {
            if !t.queue_id.is_empty() {
                return Err(ErrorCode::CmdProhibited);
            }
            if t.signature.is_empty() {
                return Err(ErrorCode::CmdNoAuth);
            }
            key.verify(&t.signed_bytes, &t.signature)
                .map_err(|_| ErrorCode::Auth)?;
            let (recipient_id, sender_id) = ctx
                .store
                .create(key)
                .await
                .map_err(store_code)?;
            tracing::info!(session = %session_id, "queue created");
            Ok(Some(BrokerMsg::Ids {
                recipient_id,
                sender_id,
            }))
        }

        ref cmd if cmd.is_recipient_cmd() => {
            if t.queue_id.is_empty() {
                return Err(ErrorCode::CmdNoQueue);
            }
            // an unknown queue and a bad signature are indistinguishable
            let rec = ctx
                .store
                .get_by_recipient(&t.queue_id)
                .map_err(|_| ErrorCode::Auth)?;
            if t.signature.is_empty() {
                return Err(ErrorCode::CmdNoAuth);
            }
            rec.recipient_key
                .verify(&t.signed_bytes, &t.signature)
                .map_err(|_| ErrorCode::Auth)?;

            match cmd {
                ClientCmd::Sub => {
                    ctx.subs
                        .subscribe(&t.queue_id, session_id, tx.clone())
                        .await;
                    // the OK goes first, then the buffered head if any
                    let _ = tx.send(Outbound {
                        corr_id: t.corr_id.clone(),
                        queue_id: t.queue_id.clone(),
                        msg: BrokerMsg::Ok,
                    });
                    if let Some(head) = ctx.store.peek(&t.queue_id).await {
                        ctx.subs.deliver(&t.queue_id, head).await;
                    }
                    Ok(None)
                }
                ClientCmd::Key(key) => {
                    ctx.store.secure(&t.queue_id, key).map_err(store_code)?;
                    tracing::info!(session = %session_id, "queue secured");
                    Ok(Some(BrokerMsg::Ok))
                }
                ClientCmd::Ack => {
                    let next = ctx.store.ack(&t.queue_id).await.map_err(store_code)?;
                    ctx.subs.clear_pending(&t.queue_id).await;
                    let _ = tx.send(Outbound {
                        corr_id: t.corr_id.clone(),
                        queue_id: t.queue_id.clone(),
                        msg: BrokerMsg::Ok,
                    });
                    if let Some(next) = next {
                        ctx.subs.deliver(&t.queue_id, next).await;
                    }
                    Ok(None)
                }
                ClientCmd::Off => {
                    ctx.store.disable(&t.queue_id).map_err(store_code)?;
                    Ok(Some(BrokerMsg::Ok))
                }
                ClientCmd::Del => {
                    ctx.store.delete(&t.queue_id).await.map_err(store_code)?;
                    ctx.subs.unsubscribe_queue(&t.queue_id).await;
                    tracing::info!(session = %session_id, "queue deleted");
                    Ok(Some(BrokerMsg::Ok))
                }
                _ => Err(ErrorCode::CmdSyntax),
            }
        }

        ClientCmd::Send(body) => {
            if t.queue_id.is_empty() {
                return Err(ErrorCode::CmdNoQueue);
            }
            let rec = ctx
                .store
                .get_by_sender(&t.queue_id)
                .map_err(|_| ErrorCode::Auth)?;
            match (rec.status, &rec.sender_key) {
                (QueueStatus::Disabled, _) => return Err(ErrorCode::Auth),
                // an unsecured queue accepts exactly one kind of SEND: the
                // unsigned confirmation that will carry the sender key. A
                // signed SEND racing ahead of KEY cannot be verified yet,
                // so it fails AUTH like any other verification failure.
                (QueueStatus::New, _) => {
                    if !t.signature.is_empty() {
                        return Err(ErrorCode::Auth);
                    }
                }
                (_, Some(key)) => {
                    if t.signature.is_empty() {
                        return Err(ErrorCode::CmdNoAuth);
                    }
                    key.verify(&t.signed_bytes, &t.signature)
                        .map_err(|_| ErrorCode::Auth)?;
                }
                (_, None) => return Err(ErrorCode::Auth),
            }

            let (message, was_empty) = ctx
                .store
                .enqueue(&rec.recipient_id, body)
                .await
                .map_err(store_code)?;
            if rec.status == QueueStatus::Secured {
                ctx.store
                    .mark_active(&rec.recipient_id)
                    .map_err(store_code)?;
            }
            if was_empty {
                ctx.subs.deliver(&rec.recipient_id, message).await;
            }
            Ok(Some(BrokerMsg::Ok))
        }

        // is_recipient_cmd() above covers every other ClientCmd variant.
        _ => unreachable!("ClientCmd variant not covered by is_recipient_cmd"),
    }
}

fn store_code(e: StoreError) -> ErrorCode {
    match e {
        StoreError::NotFound | StoreError::Auth => ErrorCode::Auth,
        StoreError::Prohibited => ErrorCode::CmdProhibited,
        StoreError::Quota | StoreError::QueueLimit => ErrorCode::Quota,
        StoreError::NoMsg => ErrorCode::NoMsg,
        StoreError::IdCollision | StoreError::Sqlite(_) => ErrorCode::Internal,
    }
}
