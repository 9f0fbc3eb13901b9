//! Concrete connector implementations and the `bot.type` constructor table
//! (spec §9: "new variants register themselves in the constructor table
//! keyed by `bot.type`").
//!
//! Wire fidelity is intentionally shallow: the spec treats each upstream
//! protocol as out of scope ("specified only by the interfaces the core
//! consumes"), so every connector here satisfies the `Connector` contract
//! (reconnect-with-backoff, heartbeats, identity, allowlist, self-filter)
//! against a small shared JSON envelope rather than each service's real
//! wire format. `Mock` is the one fully in-process, deterministic
//! implementation and is what the integration tests drive.

pub mod http_poll;
pub mod imessage;
pub mod irc;
pub mod mock;
pub mod placeholder;
pub mod ws_socket;

use std::sync::Arc;

use cb_config::BotConfig;
use cb_connector::{Connector, ConnectorError, PublishFn};

/// Build the connector named by `bot.kind`. Unknown types are a startup
/// (config) error, not a runtime one.
pub fn build(bot: &BotConfig, publish: PublishFn) -> Result<Arc<dyn Connector>, ConnectorError> {
    let identity = bot.credentials.get("identity").cloned().unwrap_or_default();
    match bot.kind.as_str() {
        "mock" => Ok(Arc::new(mock::Mock::new(identity, bot.allowlist.clone(), publish))),
        "slack" | "discord" | "mattermost" => {
            let endpoint = bot.endpoint.clone().ok_or_else(|| {
                ConnectorError::Unsupported(format!("{}: missing endpoint", bot.kind))
            })?;
            let token = bot.credentials.get("token").cloned().unwrap_or_default();
            Ok(Arc::new(ws_socket::WsSocketConnector::new(
                endpoint,
                token,
                identity,
                bot.allowlist.clone(),
                publish,
            )))
        }
        "telegram" | "twilio" | "zulip" | "matrix" => {
            let endpoint = bot.endpoint.clone().ok_or_else(|| {
                ConnectorError::Unsupported(format!("{}: missing endpoint", bot.kind))
            })?;
            let token = bot.credentials.get("token").cloned().unwrap_or_default();
            Ok(Arc::new(http_poll::HttpPollConnector::new(
                endpoint,
                token,
                identity,
                bot.allowlist.clone(),
                publish,
            )))
        }
        "irc" => {
            let endpoint = bot.endpoint.clone().ok_or_else(|| {
                ConnectorError::Unsupported("irc: missing endpoint (host:port)".to_string())
            })?;
            let nick = bot.credentials.get("nick").cloned().unwrap_or_else(|| bot.name.clone());
            Ok(Arc::new(irc::IrcConnector::new(endpoint, nick, bot.allowlist.clone(), publish)))
        }
        "imessage" => {
            let db_path = bot.credentials.get("db_path").cloned().unwrap_or_else(|| {
                "/Users/placeholder/Library/Messages/chat.db".to_string()
            });
            Ok(Arc::new(imessage::IMessageConnector::new(db_path, bot.allowlist.clone(), publish)))
        }
        "whatsapp" => Ok(Arc::new(placeholder::PlaceholderConnector::new(
            "whatsapp",
            "multi-device pairing is not implemented",
            publish,
        ))),
        other => Err(ConnectorError::Unsupported(format!("unknown bot type `{other}`"))),
    }
}
