//! Unix-domain control socket: listener lifecycle and per-connection
//! request/response framing (spec §4.1, §6). One JSON value per line in
//! either direction; `subscribe` switches the connection into a one-way
//! event stream after its acknowledgement frame.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use cb_protocol::{Action, Filter, Request, Response, SubscriptionFrame};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{UnixListener, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::broker::Broker;
use crate::subscriptions::SubFilter;

/// Bind the control socket (removing any stale file from a previous run),
/// chmod it to `0600`, and accept connections until `shutdown` fires.
pub async fn serve(broker: Broker, shutdown: CancellationToken) -> std::io::Result<()> {
    let path = broker.socket_path().to_string();
    if let Some(parent) = Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent)?;
            std::fs::set_permissions(parent, std::fs::Permissions::from_mode(0o700))?;
        }
    }
    if Path::new(&path).exists() {
        std::fs::remove_file(&path)?;
    }
    let listener = UnixListener::bind(&path)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o600))?;
    info!(socket_path = %path, "control socket listening");

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("control socket shutting down");
                return Ok(());
            }
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, _)) => {
                        let broker = broker.clone();
                        let conn_shutdown = shutdown.clone();
                        tokio::spawn(async move {
                            handle_connection(broker, stream, conn_shutdown).await;
                        });
                    }
                    Err(e) => warn!(error = %e, "accept failed"),
                }
            }
        }
    }
}

async fn handle_connection(broker: Broker, stream: UnixStream, shutdown: CancellationToken) {
    let (read_half, mut write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut line = String::new();

    loop {
        line.clear();
        let n = tokio::select! {
            _ = shutdown.cancelled() => return,
            res = reader.read_line(&mut line) => match res {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "connection read failed");
                    return;
                }
            },
        };
        if n == 0 {
            return; // client disconnected
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let request: Request = match serde_json::from_str(trimmed) {
            Ok(r) => r,
            Err(e) => {
                if write_response(&mut write_half, &Response::err(format!("invalid request: {e}"))).await.is_err() {
                    return;
                }
                continue;
            }
        };

        if request.action == Action::Subscribe {
            handle_subscribe(&broker, request, &mut write_half, &shutdown).await;
            return; // subscribe owns the connection until disconnect or shutdown
        }

        let response = dispatch(&broker, request).await;
        if write_response(&mut write_half, &response).await.is_err() {
            return;
        }
    }
}

async fn dispatch(broker: &Broker, req: Request) -> Response {
    match req.action {
        Action::Ping => Response::ack("pong"),
        Action::Bots => Response { bots: Some(broker.bots()), ..Response::ok() },
        Action::Send => match broker
            .send(
                req.service.as_deref(),
                req.bot.as_deref(),
                req.target.as_deref(),
                req.channel.as_deref(),
                req.thread.as_deref(),
                req.text.as_deref(),
            )
            .await
        {
            Ok(event) => Response { event: Some(event), ..Response::ok() },
            Err(e) => Response::err(e),
        },
        Action::History => {
            let filter = event_filter(&req);
            match broker.history(&filter) {
                Ok(events) => Response { events: Some(events), ..Response::ok() },
                Err(e) => Response::err(e),
            }
        }
        Action::Notifications => {
            let filter = notification_filter(&req);
            match broker.notifications(&filter) {
                Ok(notifications) => {
                    let events = notifications.into_iter().map(notification_as_event).collect();
                    Response { events: Some(events), ..Response::ok() }
                }
                Err(e) => Response::err(e),
            }
        }
        Action::ClearNotifications => {
            if let Some(id) = req.notification_id {
                match broker.clear_notification_by_id(id) {
                    Ok(cleared) => Response { cleared: Some(cleared), ..Response::ok() },
                    Err(e) => Response::err(e),
                }
            } else {
                let filter = notification_filter(&req);
                match broker.clear_notifications(&filter) {
                    Ok(cleared) => Response { cleared: Some(cleared), ..Response::ok() },
                    Err(e) => Response::err(e),
                }
            }
        }
        Action::ClearHistory => {
            let filter = event_filter(&req);
            match broker.clear_history(&filter) {
                Ok(cleared) => Response { cleared: Some(cleared), ..Response::ok() },
                Err(e) => Response::err(e),
            }
        }
        Action::Reload => match broker.reload(None).await {
            Ok(()) => Response::ok(),
            Err(e) => Response::err(e),
        },
        Action::Subscribe => unreachable!("handled by handle_subscribe"),
    }
}

async fn handle_subscribe(
    broker: &Broker,
    req: Request,
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    shutdown: &CancellationToken,
) {
    let keys = match broker.resolve_selector(req.service.as_deref(), req.bot.as_deref()) {
        Ok(keys) => keys,
        Err(e) => {
            let _ = write_frame(write_half, &SubscriptionFrame::err(e)).await;
            return;
        }
    };

    let filter = SubFilter {
        target: req.target.clone(),
        channel: req.channel.clone(),
        thread: req.thread.clone(),
        search: req.search.clone(),
        notify_only: req.notify.unwrap_or(false),
    };
    let (handle, mut rx) = broker.subscribe(&keys, filter);

    if write_frame(write_half, &SubscriptionFrame::ack("subscribed")).await.is_err() {
        broker.unsubscribe(&handle);
        return;
    }

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        if write_frame(write_half, &SubscriptionFrame::event(event)).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }
    broker.unsubscribe(&handle);
}

fn event_filter(req: &Request) -> Filter {
    Filter {
        service: req.service.clone(),
        bot: req.bot.clone(),
        target: req.target.clone(),
        channel: req.channel.clone(),
        thread: req.thread.clone(),
        search: req.search.clone(),
        since_id: req.since_id,
        limit: req.limit,
        restrict: req.notify.unwrap_or(false),
        all: req.all.unwrap_or(false),
    }
}

fn notification_filter(req: &Request) -> Filter {
    Filter {
        service: req.service.clone(),
        bot: req.bot.clone(),
        target: req.target.clone(),
        channel: req.channel.clone(),
        thread: req.thread.clone(),
        search: req.search.clone(),
        since_id: req.since_id,
        limit: req.limit,
        restrict: req.unseen.unwrap_or(false),
        all: req.all.unwrap_or(false),
    }
}

/// Notifications are returned to clients on the same `events` response key
/// as history (there is no separate wire shape); project the denormalised
/// `Notification` row back onto an `Event`-shaped value carrying its
/// `notification_id`/`seen`/`seen_at`.
fn notification_as_event(n: cb_protocol::Notification) -> cb_protocol::Event {
    cb_protocol::Event {
        id: n.event_id,
        timestamp: n.timestamp,
        service: n.service,
        bot: n.bot,
        kind: "message".to_string(),
        direction: "in".to_string(),
        user: String::new(),
        is_self: false,
        target: n.target,
        channel: n.channel,
        thread: n.thread,
        text: n.text,
        mentions: n.mentions,
        direct: n.direct,
        notify: n.notify,
        notification_id: Some(n.id),
        seen: Some(n.seen),
        seen_at: n.seen_at,
    }
}

async fn write_response(write_half: &mut tokio::net::unix::OwnedWriteHalf, response: &Response) -> std::io::Result<()> {
    write_line(write_half, response).await
}

async fn write_frame(write_half: &mut tokio::net::unix::OwnedWriteHalf, frame: &SubscriptionFrame) -> std::io::Result<()> {
    write_line(write_half, frame).await
}

async fn write_line<T: serde::Serialize>(
    write_half: &mut tokio::net::unix::OwnedWriteHalf,
    value: &T,
) -> std::io::Result<()> {
    let mut body = serde_json::to_vec(value).expect("wire types always serialize");
    body.push(b'\n');
    write_half.write_all(&body).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_as_event_carries_notification_fields() {
        let n = cb_protocol::Notification {
            id: 7,
            event_id: 3,
            timestamp: chrono::Utc::now(),
            service: "slack".to_string(),
            bot: "ops-bot".to_string(),
            target: String::new(),
            channel: "C1".to_string(),
            thread: String::new(),
            text: "@ops-bot deploy".to_string(),
            mentions: true,
            direct: false,
            notify: true,
            seen: false,
            seen_at: None,
        };
        let e = notification_as_event(n);
        assert_eq!(e.id, 3);
        assert_eq!(e.notification_id, Some(7));
        assert_eq!(e.seen, Some(false));
        assert!(e.mentions);
    }
}
