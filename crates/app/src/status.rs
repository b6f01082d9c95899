//! Actix Web status server exposing liveness, relay occupancy and metrics.
//!
//! The server runs on a dedicated thread so the relay's tokio runtime and the
//! controller's control loop never share an executor with HTTP handlers.

use actix_web::{App, HttpResponse, HttpServer, web};
use anyhow::{Context, Result, anyhow};
use robot_link::{SharedBroker, broker};
use serde::Serialize;
use tokio::sync::oneshot;
use tracing::{error, info};

use crate::telemetry;

/// What the status endpoints report on.
#[derive(Clone)]
pub(crate) enum StatusSource {
    Relay(SharedBroker),
    Controller,
}

#[derive(Default)]
/// Handle for the status server thread.
pub(crate) struct StatusServer {
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl StatusServer {
    /// Signal the server to stop and block until the thread exits.
    pub(crate) fn stop(self) {
        if let Some(tx) = self.shutdown {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle {
            let _ = handle.join();
        }
    }
}

#[derive(Serialize)]
struct Endpoints {
    controller: &'static str,
    robot: &'static str,
}

#[derive(Serialize)]
struct RelayIndex {
    status: &'static str,
    controllers_connected: usize,
    robots_connected: usize,
    endpoints: Endpoints,
}

#[derive(Serialize)]
struct RelayHealth {
    status: &'static str,
    controllers: usize,
    robots: usize,
}

#[derive(Serialize)]
struct ControllerIndex {
    status: &'static str,
    role: &'static str,
}

/// Spawn the status server on `bind`, returning once the socket is bound.
pub(crate) fn spawn_status_server(bind: &str, source: StatusSource) -> Result<StatusServer> {
    let addr = bind.to_owned();
    let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
    let (ready_tx, ready_rx) = crossbeam_channel::bounded::<std::io::Result<()>>(1);

    let handle = std::thread::Builder::new()
        .name("status-server".into())
        .spawn(move || {
            if let Err(err) = actix_web::rt::System::new().block_on(async move {
                let server = match HttpServer::new(move || {
                    App::new()
                        .app_data(web::Data::new(source.clone()))
                        .configure(routes)
                })
                .workers(1)
                .bind(addr.as_str())
                {
                    Ok(server) => {
                        let _ = ready_tx.send(Ok(()));
                        server.run()
                    }
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return Ok(());
                    }
                };

                let srv_handle = server.handle();
                actix_web::rt::spawn(async move {
                    let _ = shutdown_rx.await;
                    srv_handle.stop(true).await;
                });

                server.await
            }) {
                error!("status server error: {err}");
            }
        })
        .context("failed to spawn status server thread")?;

    match ready_rx.recv() {
        Ok(Ok(())) => {
            info!("status server listening on http://{bind}");
            Ok(StatusServer {
                shutdown: Some(shutdown_tx),
                handle: Some(handle),
            })
        }
        Ok(Err(err)) => {
            let _ = handle.join();
            Err(err).with_context(|| format!("failed to bind status server to {bind}"))
        }
        Err(_) => {
            let _ = handle.join();
            Err(anyhow!("status server thread exited before binding"))
        }
    }
}

fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(index_route))
        .route("/health", web::get().to(health_route))
        .route("/metrics", web::get().to(metrics_route));
}

fn occupancy(broker: &SharedBroker) -> (usize, usize) {
    let guard = broker::lock(broker);
    (guard.controller_count(), guard.robot_count())
}

async fn index_route(source: web::Data<StatusSource>) -> HttpResponse {
    match source.get_ref() {
        StatusSource::Relay(broker) => {
            let (controllers, robots) = occupancy(broker);
            HttpResponse::Ok().json(RelayIndex {
                status: "online",
                controllers_connected: controllers,
                robots_connected: robots,
                endpoints: Endpoints {
                    controller: broker::CONTROLLER_PATH,
                    robot: broker::ROBOT_PATH,
                },
            })
        }
        StatusSource::Controller => HttpResponse::Ok().json(ControllerIndex {
            status: "online",
            role: "controller",
        }),
    }
}

async fn health_route(source: web::Data<StatusSource>) -> HttpResponse {
    let (controllers, robots) = match source.get_ref() {
        StatusSource::Relay(broker) => occupancy(broker),
        StatusSource::Controller => (0, 0),
    };
    HttpResponse::Ok().json(RelayHealth {
        status: "healthy",
        controllers,
        robots,
    })
}

async fn metrics_route() -> HttpResponse {
    match telemetry::prometheus_handle() {
        Some(handle) => HttpResponse::Ok()
            .content_type("text/plain; version=0.0.4")
            .body(handle.render()),
        None => HttpResponse::ServiceUnavailable().body("metrics recorder not installed"),
    }
}

#[cfg(test)]
mod tests {
    use actix_web::test::{TestRequest, call_and_read_body_json, call_service, init_service};
    use robot_link::{RelayBroker, Role};
    use serde_json::Value;

    use super::*;

    #[actix_web::test]
    async fn relay_index_reports_occupancy() {
        let shared = RelayBroker::shared();
        let (tx, _rx) = broker::outbound();
        broker::lock(&shared).add(Role::Robot, tx);

        let app = init_service(
            App::new()
                .app_data(web::Data::new(StatusSource::Relay(shared.clone())))
                .configure(routes),
        )
        .await;

        let body: Value =
            call_and_read_body_json(&app, TestRequest::get().uri("/").to_request()).await;
        assert_eq!(body["status"], "online");
        assert_eq!(body["controllers_connected"], 0);
        assert_eq!(body["robots_connected"], 1);
        assert_eq!(body["endpoints"]["robot"], "/ws/robot");

        let health: Value =
            call_and_read_body_json(&app, TestRequest::get().uri("/health").to_request())
                .await;
        assert_eq!(health["status"], "healthy");
        assert_eq!(health["robots"], 1);
    }

    #[actix_web::test]
    async fn metrics_are_rendered_as_text() {
        telemetry::init_metrics_recorder();
        let app = init_service(
            App::new()
                .app_data(web::Data::new(StatusSource::Controller))
                .configure(routes),
        )
        .await;
        let response =
            call_service(&app, TestRequest::get().uri("/metrics").to_request()).await;
        assert!(response.status().is_success());
    }

    #[test]
    fn bind_failures_are_reported() {
        let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap().to_string();
        assert!(spawn_status_server(&addr, StatusSource::Controller).is_err());
    }
}
