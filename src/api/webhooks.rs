//! Inbound reply webhook (spec section 6). Authenticated by a shared-secret
//! header rather than the JWT gate (the sending MTA has no bearer token),
//! constant-time compared via `subtle` so response timing doesn't leak how
//! many leading bytes of the secret matched.

use actix_web::{web, HttpResponse};
use subtle::ConstantTimeEq;

use crate::engine::Engine;
use crate::models::wire::InboundReplyPayload;
use crate::services::reply_correlator::IngestOutcome;

const SECRET_HEADER: &str = "X-Webhook-Secret";

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/api/webhooks/reply", web::post().to(reply));
}

fn secret_matches(expected: &str, provided: &str) -> bool {
    expected.len() == provided.len() && bool::from(expected.as_bytes().ct_eq(provided.as_bytes()))
}

async fn reply(
    req: actix_web::HttpRequest,
    engine: web::Data<Engine>,
    payload: web::Json<InboundReplyPayload>,
) -> HttpResponse {
    let provided = req
        .headers()
        .get(SECRET_HEADER)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    if !secret_matches(&engine.cfg.webhook_secret, provided) {
        return HttpResponse::Unauthorized().finish();
    }

    match engine.reply_correlator.ingest(payload.into_inner()).await {
        Ok(IngestOutcome::Inserted) => HttpResponse::Ok().json(serde_json::json!({ "status": "inserted" })),
        Ok(IngestOutcome::Duplicate) => HttpResponse::Ok().json(serde_json::json!({ "status": "duplicate" })),
        Ok(IngestOutcome::Unroutable) => HttpResponse::Ok().json(serde_json::json!({ "status": "unroutable" })),
        Err(err) => {
            tracing::error!("reply ingest failed: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}
