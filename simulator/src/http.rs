use actix_web::dev::ServerHandle;
use actix_web::{web, App, HttpResponse, HttpServer};
use camwatch_orchestrator::Metrics;
use std::sync::Arc;
use tracing::{error, info};

async fn serve_metrics(metrics: web::Data<Metrics>) -> HttpResponse {
    match metrics.render() {
        Ok(body) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(body),
        Err(e) => {
            error!("Metrics rendering failed: {}", e);
            HttpResponse::InternalServerError().body(e.to_string())
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/metrics", web::get().to(serve_metrics));
}

/// Serves the Prometheus exposition on `GET /metrics` until the returned
/// handle is stopped.
pub fn start_metrics_server(port: u16, metrics: Arc<Metrics>) -> std::io::Result<ServerHandle> {
    let data = web::Data::from(metrics);
    let server = HttpServer::new(move || App::new().app_data(data.clone()).configure(configure))
        .workers(1)
        .bind(("0.0.0.0", port))?
        .run();
    let handle = server.handle();

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server failed: {}", e);
        }
    });
    info!("Metrics endpoint listening on 0.0.0.0:{}", port);
    Ok(handle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::{http::StatusCode, test};

    #[actix_web::test]
    async fn serves_exposition_on_metrics_route() {
        let metrics = Arc::new(Metrics::new().unwrap());
        metrics.record_frame_dropped("yard");
        let app = test::init_service(
            App::new()
                .app_data(web::Data::from(metrics))
                .configure(configure),
        )
        .await;

        let resp = test::call_service(&app, test::TestRequest::get().uri("/metrics").to_request()).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let body = test::read_body(resp).await;
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert!(text.contains("camwatch_frames_dropped_total{stream_id=\"yard\"} 1"));

        let resp = test::call_service(&app, test::TestRequest::get().uri("/status").to_request()).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = test::call_service(&app, test::TestRequest::post().uri("/metrics").to_request()).await;
        assert_ne!(resp.status(), StatusCode::OK);
    }
}
