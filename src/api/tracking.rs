//! Tracking endpoints (spec section 6): open-pixel and click-redirect. Both
//! are hit by mail clients and browsers, not API callers, so they sit
//! outside the JWT gate (`middleware/auth.rs`'s public-path list).

use actix_web::{web, HttpResponse};
use chrono::Utc;

use crate::engine::Engine;
use crate::models::event::{CampaignEvent, EventType};
use crate::models::ids::Id;
use crate::models::wire::ContactUpdateEvent;
use crate::services::traits::{CacheBackend, EventBusBackend, EventLogBackend, LedgerBackend};

const TRANSPARENT_GIF: &[u8] = &[
    0x47, 0x49, 0x46, 0x38, 0x39, 0x61, 0x01, 0x00, 0x01, 0x00, 0x80, 0x00, 0x00, 0xff, 0xff, 0xff,
    0x00, 0x00, 0x00, 0x21, 0xf9, 0x04, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2c, 0x00, 0x00, 0x00, 0x00,
    0x01, 0x00, 0x01, 0x00, 0x00, 0x02, 0x02, 0x44, 0x01, 0x00, 0x3b,
];

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/track/open/{campaign_id}/{contact_id}", web::get().to(open_pixel))
        .route("/api/track/click/{campaign_id}/{contact_id}", web::get().to(click_redirect));
}

async fn open_pixel(engine: web::Data<Engine>, path: web::Path<(Id, Id)>) -> HttpResponse {
    let (campaign_id, contact_id) = path.into_inner();
    let (campaign_id, contact_id) = (campaign_id.as_uuid(), contact_id.as_uuid());

    let already_opened = engine
        .ledger
        .get(campaign_id, contact_id)
        .await
        .ok()
        .flatten()
        .map(|row| row.opened_at.is_some())
        .unwrap_or(true);

    let _ = engine
        .events
        .append(&CampaignEvent::new(campaign_id, contact_id, EventType::Open))
        .await;
    let _ = engine.cache.incr_metric(campaign_id, "opens").await;

    if !already_opened {
        let now = Utc::now();
        let _ = engine.ledger.record_open(campaign_id, contact_id, now).await;
    }

    let mut update = ContactUpdateEvent::new(campaign_id, contact_id);
    update.event = Some(EventType::Open.as_str().to_string());
    update.opened_at = Some(Utc::now());
    let _ = engine.bus.publish_contact(&update).await;

    HttpResponse::Ok()
        .insert_header(("Cache-Control", "no-store"))
        .content_type("image/gif")
        .body(TRANSPARENT_GIF)
}

#[derive(serde::Deserialize)]
struct ClickQuery {
    u: String,
    #[allow(dead_code)]
    t: Option<i64>,
    #[allow(dead_code)]
    o: Option<i32>,
}

async fn click_redirect(
    engine: web::Data<Engine>,
    path: web::Path<(Id, Id)>,
    query: web::Query<ClickQuery>,
) -> HttpResponse {
    let (campaign_id, contact_id) = path.into_inner();
    let (campaign_id, contact_id) = (campaign_id.as_uuid(), contact_id.as_uuid());

    let destination = match crate::services::html_rewriter::decode_click_target(&query.u) {
        Some(url) => url,
        None => {
            let event = CampaignEvent::new(campaign_id, contact_id, EventType::Click)
                .with_trace(serde_json::json!({ "note": "decode_failed" }));
            let _ = engine.events.append(&event).await;
            return HttpResponse::BadRequest().finish();
        }
    };

    let row = engine.ledger.get(campaign_id, contact_id).await.ok().flatten();
    let already_opened = row.as_ref().map(|r| r.opened_at.is_some()).unwrap_or(true);
    let now = Utc::now();

    if !already_opened {
        let _ = engine.ledger.record_open(campaign_id, contact_id, now).await;
        let _ = engine
            .events
            .append(&CampaignEvent::new(campaign_id, contact_id, EventType::Open))
            .await;
    }

    let _ = engine.ledger.record_click(campaign_id, contact_id, now).await;
    let _ = engine
        .events
        .append(&CampaignEvent::new(campaign_id, contact_id, EventType::Click).with_url(destination.clone()))
        .await;
    let _ = engine.cache.incr_metric(campaign_id, "clicks").await;

    let mut update = ContactUpdateEvent::new(campaign_id, contact_id);
    update.event = Some(EventType::Click.as_str().to_string());
    update.last_click_at = Some(now);
    let _ = engine.bus.publish_contact(&update).await;

    HttpResponse::Found()
        .insert_header(("Location", destination))
        .insert_header(("Cache-Control", "no-store"))
        .finish()
}
