use actix_web::{middleware, web::Data, App, HttpServer};
use anyhow::Result;
use faas_controller::controllers::State;
use tokio_util::sync::CancellationToken;

use crate::handlers::{health, metrics};

/// Serve `/`, `/health` and `/metrics` until `shutdown` fires
pub async fn start_server(state: State, addr: &str, shutdown: CancellationToken) -> Result<()> {
    let server = HttpServer::new(move || {
        App::new()
            .app_data(Data::new(state.clone()))
            .wrap(middleware::Logger::default().exclude("/health"))
            .service(health::index)
            .service(health::health)
            .service(metrics::metrics)
    })
    .bind(addr)?
    .shutdown_timeout(5)
    .disable_signals()
    .run();

    let handle = server.handle();
    tokio::spawn(async move {
        shutdown.cancelled().await;
        handle.stop(true).await;
    });

    server.await?;
    Ok(())
}
