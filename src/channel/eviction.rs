//! Waterline eviction.
//!
//! When the channel count reaches the high waterline, the eviction task
//! drains it back down to the low waterline. Client victims are simply
//! disconnected; server victims are asked to disconnect and retained
//! whenever the client refuses or does not answer, since the client is
//! authoritative over connection lifecycle.

use super::{Channel, ChannelManager, ChannelSide, WAIT_RESP_TIME};
use crate::channel::protocol::ControlMessage;
use crate::error::code;
use std::sync::Arc;

/// Condvar-driven eviction loop; one pass per notification.
pub(crate) async fn eviction_loop(manager: Arc<ChannelManager>) {
    loop {
        manager.evict_notify().notified().await;
        if manager.is_shutting_down() {
            break;
        }
        run_eviction(&manager).await;
    }
}

async fn run_eviction(manager: &Arc<ChannelManager>) {
    let high = manager.config().high_waterline;
    let low = manager.config().low_waterline;
    let current = manager.channel_count();
    if current < high {
        return;
    }
    log::info!("eviction triggered: channel_count={} >= high_waterline={}", current, high);

    let need_expire = current.saturating_sub(low);
    if need_expire == 0 {
        return;
    }
    let victims = select_candidates(manager, need_expire);
    log::info!("eviction selected {} victims (need_expire={})", victims.len(), need_expire);

    for victim in victims {
        match victim.side() {
            ChannelSide::Client => {
                if let Err(err) = manager.disconnect(victim.id()).await {
                    log::warn!("evicting client channel {} failed: {}", victim.id(), err);
                }
            }
            ChannelSide::Server => {
                request_server_disconnect(manager, &victim).await;
            }
        }
    }

    // Channels that stayed idle through this round become preferred
    // victims next round.
    for channel in manager.channels_snapshot() {
        if channel.transfer_count() == 0 {
            channel.reset_has_transferred();
        }
    }
}

/// Pick up to `need_expire` victims: balance the client/server lists, then
/// alternate between them. Idle clients (never transferred since the last
/// reset) come first within the client list; selection order is otherwise
/// stable. In-flight and already-disconnecting channels are skipped.
fn select_candidates(manager: &Arc<ChannelManager>, need_expire: usize) -> Vec<Arc<Channel>> {
    let mut clients = Vec::new();
    let mut servers = Vec::new();
    for channel in manager.channels_snapshot() {
        if channel.is_disconnecting() || channel.transfer_count() > 0 {
            continue;
        }
        match channel.side() {
            ChannelSide::Client => clients.push(channel),
            ChannelSide::Server => servers.push(channel),
        }
    }
    clients.sort_by_key(|channel| channel.has_transferred());

    let victims = order_candidates(clients, servers, need_expire);
    for victim in &victims {
        victim.set_disconnecting(true);
    }
    victims
}

/// Balance-then-alternate ordering shared by selection and its tests.
fn order_candidates<T>(clients: Vec<T>, servers: Vec<T>, need_expire: usize) -> Vec<T> {
    let client_count = clients.len();
    let (first, second) = if client_count >= servers.len() {
        (clients, servers)
    } else {
        (servers, clients)
    };
    let diff = first.len() - second.len();
    let pick_extra = diff.min(need_expire);

    let mut victims = Vec::with_capacity(need_expire.min(first.len() + second.len()));
    let mut first_iter = first.into_iter();
    let mut second_iter = second.into_iter();
    for _ in 0..pick_extra {
        match first_iter.next() {
            Some(item) => victims.push(item),
            None => break,
        }
        if victims.len() == need_expire {
            return victims;
        }
    }
    loop {
        let mut progressed = false;
        if let Some(item) = first_iter.next() {
            victims.push(item);
            progressed = true;
            if victims.len() == need_expire {
                break;
            }
        }
        if let Some(item) = second_iter.next() {
            victims.push(item);
            progressed = true;
            if victims.len() == need_expire {
                break;
            }
        }
        if !progressed {
            break;
        }
    }
    victims
}

/// Ask the client to release a server-side channel. The channel is
/// retained (made selectable again) unless the client agrees; an agreeing
/// client follows up with a Disconnect that the reader task applies.
async fn request_server_disconnect(manager: &Arc<ChannelManager>, victim: &Arc<Channel>) {
    let req_id = manager.next_req_id();
    let receiver = manager.register_pending_disconnect(req_id);
    let message = ControlMessage::RequestDisconnect {
        channel_id: victim.id().to_string(),
        req_id,
        timeout: WAIT_RESP_TIME.as_millis() as u64,
    };
    if let Err(err) = victim.send(&message).await {
        log::warn!("disconnect request on {} failed to send: {}", victim.id(), err);
        manager.forget_pending_disconnect(req_id);
        victim.set_disconnecting(false);
        return;
    }
    match tokio::time::timeout(WAIT_RESP_TIME, receiver).await {
        Ok(Ok(error_code)) if error_code == code::SUCCESS => {
            log::info!("channel {}: client accepted disconnect request {}", victim.id(), req_id);
        }
        Ok(Ok(error_code)) => {
            log::info!(
                "channel {}: client refused disconnect request {} (code {})",
                victim.id(),
                req_id,
                error_code
            );
            victim.set_disconnecting(false);
        }
        _ => {
            log::info!("channel {}: disconnect request {} timed out", victim.id(), req_id);
            manager.forget_pending_disconnect(req_id);
            victim.set_disconnecting(false);
        }
    }
}
