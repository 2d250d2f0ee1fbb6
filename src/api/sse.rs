//! SSE bridge (spec section 6): forwards the three pub/sub channels as named
//! events (`campaign`, `contact`, `campaign_event`) plus a 15s `ping`
//! heartbeat. `ConnectionManager` (used everywhere else in the engine)
//! doesn't support `SUBSCRIBE`, so this is the one place a dedicated
//! `redis::Client` connection is opened per subscriber.

use std::time::Duration;

use actix_web::web;
use actix_web_lab::sse::{self, Sse};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::engine::Engine;
use crate::models::ids::Id;
use crate::services::event_bus::EventBus;

const PING_INTERVAL: Duration = Duration::from_secs(15);
const CHANNEL_CAPACITY: usize = 64;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/campaigns/{campaign_id}/events", web::get().to(stream_campaign));
}

async fn stream_campaign(
    engine: web::Data<Engine>,
    path: web::Path<Id>,
) -> actix_web::Result<Sse<impl futures_util::Stream<Item = Result<sse::Event, std::convert::Infallible>>>> {
    let campaign_id = path.into_inner().as_uuid();
    let (tx, rx) = mpsc::channel::<sse::Event>(CHANNEL_CAPACITY);

    // Replay recent `campaign:new` history so a subscriber that connects
    // mid-campaign doesn't miss the lifecycle events published before it
    // opened the stream.
    if let Ok(history) = engine.bus.recent_campaign_history(50).await {
        for payload in history.into_iter().rev() {
            let _ = tx
                .send(sse::Event::Data(sse::Data::new(payload).event("campaign")))
                .await;
        }
    }

    let redis_url = engine.cfg.redis_url.clone();
    tokio::spawn(forward_pubsub(redis_url, campaign_id, tx.clone()));
    tokio::spawn(ping_loop(tx));

    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|event| (Ok(event), rx))
    });
    Ok(Sse::from_stream(stream))
}

async fn ping_loop(tx: mpsc::Sender<sse::Event>) {
    let mut ticker = tokio::time::interval(PING_INTERVAL);
    loop {
        ticker.tick().await;
        let event = sse::Event::Data(sse::Data::new("").event("ping"));
        if tx.send(event).await.is_err() {
            return;
        }
    }
}

async fn forward_pubsub(redis_url: String, campaign_id: Uuid, tx: mpsc::Sender<sse::Event>) {
    let client = match redis::Client::open(redis_url) {
        Ok(c) => c,
        Err(err) => {
            tracing::error!("sse: failed to open redis client: {err}");
            return;
        }
    };
    let conn = match client.get_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            tracing::error!("sse: failed to connect for pubsub: {err}");
            return;
        }
    };
    let mut pubsub = conn.into_pubsub();
    let contact_channel = EventBus::contact_channel(campaign_id);
    let events_channel = EventBus::events_channel(campaign_id);
    if let Err(err) = pubsub
        .subscribe(&[EventBus::CAMPAIGN_NEW_CHANNEL, contact_channel.as_str(), events_channel.as_str()])
        .await
    {
        tracing::error!("sse: subscribe failed: {err}");
        return;
    }

    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let channel = msg.get_channel_name().to_string();
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(_) => continue,
        };
        let kind = if channel == EventBus::CAMPAIGN_NEW_CHANNEL {
            "campaign"
        } else if channel == contact_channel {
            "contact"
        } else {
            "campaign_event"
        };
        let event = sse::Event::Data(sse::Data::new(payload).event(kind));
        if tx.send(event).await.is_err() {
            return;
        }
    }
}
