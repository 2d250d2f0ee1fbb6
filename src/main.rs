use actix_cors::Cors;
use actix_web::{middleware as actix_middleware, web, App, HttpServer};
use dotenvy::dotenv;

use campaign_delivery_engine::api;
use campaign_delivery_engine::config::Config;
use campaign_delivery_engine::engine::Engine;
use campaign_delivery_engine::middleware::auth::AuthMiddleware;

#[actix_web::main]
async fn main() -> std::io::Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt::init();

    let cfg = Config::from_env();
    let jwt_secret = cfg.jwt_secret.clone();
    let engine = Engine::start(cfg)
        .await
        .expect("failed to start delivery engine");

    tracing::info!("campaign delivery engine API starting on http://0.0.0.0:8080");

    let engine_data = web::Data::new(engine);

    HttpServer::new(move || {
        let frontend_url =
            std::env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());

        let cors = Cors::default()
            .allowed_origin(&frontend_url)
            .allowed_methods(vec!["GET", "POST", "PUT", "DELETE", "PATCH"])
            .allowed_headers(vec![
                actix_web::http::header::AUTHORIZATION,
                actix_web::http::header::CONTENT_TYPE,
                actix_web::http::header::ACCEPT,
            ])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .app_data(engine_data.clone())
            .wrap(cors)
            .wrap(actix_middleware::Logger::default())
            .wrap(AuthMiddleware::new(jwt_secret.clone()))
            .configure(api::campaigns::configure)
            .configure(api::tracking::configure)
            .configure(api::sse::configure)
            .configure(api::webhooks::configure)
            .route("/health", web::get().to(|| async { "OK" }))
    })
    .bind(("0.0.0.0", 8080))?
    .run()
    .await
}
