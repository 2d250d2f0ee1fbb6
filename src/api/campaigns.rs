//! Control Plane REST surface (spec section 4.7), thin wrappers over
//! `services::control_plane::ControlPlane`. Business logic and idempotency
//! live entirely in the Control Plane; handlers here only parse the
//! request and translate `ControlError` into an HTTP status.

use actix_web::{web, HttpResponse};
use serde::Deserialize;

use crate::engine::Engine;
use crate::models::campaign::StartCampaignRequest;
use crate::models::ids::Id;
use crate::services::control_plane::ControlError;

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/campaigns")
            .route("", web::post().to(start))
            .route("/{id}", web::get().to(get))
            .route("/{id}/pause", web::post().to(pause))
            .route("/{id}/resume", web::post().to(resume))
            .route("/{id}/cancel", web::post().to(cancel))
            .route("/{id}", web::delete().to(delete))
            .route("/{id}/contacts/{contact_id}/retry", web::post().to(retry_contact))
            .route("/{id}/retry-failed", web::post().to(retry_failed))
            .route("/{id}/reconcile", web::post().to(reconcile)),
    );
}

fn control_error_status(err: ControlError) -> HttpResponse {
    match err {
        ControlError::NotFound => HttpResponse::NotFound().json(serde_json::json!({ "error": err.to_string() })),
        ControlError::DeleteNotConfirmed | ControlError::NotRetryEligible => {
            HttpResponse::Conflict().json(serde_json::json!({ "error": err.to_string() }))
        }
    }
}

async fn start(engine: web::Data<Engine>, req: web::Json<StartCampaignRequest>) -> HttpResponse {
    match engine.control_plane.start_campaign(req.into_inner()).await {
        Ok(campaign_id) => HttpResponse::Created().json(serde_json::json!({ "id": campaign_id })),
        Err(err) => {
            tracing::error!("start_campaign failed: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn get(engine: web::Data<Engine>, path: web::Path<Id>) -> HttpResponse {
    use crate::services::traits::CampaignBackend;
    match engine.campaigns.get(path.into_inner().as_uuid()).await {
        Ok(Some(campaign)) => HttpResponse::Ok().json(campaign),
        Ok(None) => HttpResponse::NotFound().finish(),
        Err(err) => {
            tracing::error!("fetch campaign failed: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn pause(engine: web::Data<Engine>, path: web::Path<Id>) -> HttpResponse {
    match engine.control_plane.pause(path.into_inner().as_uuid()).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(err) => {
            tracing::error!("pause failed: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn resume(engine: web::Data<Engine>, path: web::Path<Id>) -> HttpResponse {
    match engine.control_plane.resume(path.into_inner().as_uuid()).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(err) => {
            tracing::error!("resume failed: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn cancel(engine: web::Data<Engine>, path: web::Path<Id>) -> HttpResponse {
    match engine.control_plane.cancel(path.into_inner().as_uuid()).await {
        Ok(()) => HttpResponse::NoContent().finish(),
        Err(err) => {
            tracing::error!("cancel failed: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

#[derive(Deserialize)]
struct DeleteQuery {
    #[serde(default)]
    confirm: bool,
}

async fn delete(engine: web::Data<Engine>, path: web::Path<Id>, query: web::Query<DeleteQuery>) -> HttpResponse {
    match engine.control_plane.delete(path.into_inner().as_uuid(), query.confirm).await {
        Ok(Ok(())) => HttpResponse::NoContent().finish(),
        Ok(Err(err)) => control_error_status(err),
        Err(err) => {
            tracing::error!("delete failed: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn retry_contact(engine: web::Data<Engine>, path: web::Path<(Id, Id)>) -> HttpResponse {
    let (campaign_id, contact_id) = path.into_inner();
    match engine.control_plane.retry_contact(campaign_id.as_uuid(), contact_id.as_uuid()).await {
        Ok(Ok(())) => HttpResponse::NoContent().finish(),
        Ok(Err(err)) => control_error_status(err),
        Err(err) => {
            tracing::error!("retry_contact failed: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn retry_failed(engine: web::Data<Engine>, path: web::Path<Id>) -> HttpResponse {
    match engine.control_plane.retry_failed(path.into_inner().as_uuid()).await {
        Ok(retried) => HttpResponse::Ok().json(serde_json::json!({ "retried": retried })),
        Err(err) => {
            tracing::error!("retry_failed failed: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}

async fn reconcile(engine: web::Data<Engine>, path: web::Path<Id>) -> HttpResponse {
    match engine.control_plane.reconcile(path.into_inner().as_uuid()).await {
        Ok(finalized) => HttpResponse::Ok().json(serde_json::json!({ "finalized": finalized })),
        Err(err) => {
            tracing::error!("reconcile failed: {err}");
            HttpResponse::InternalServerError().finish()
        }
    }
}
