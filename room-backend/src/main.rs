use env_logger::Env;
use room_backend::config::Config;
use room_backend::{app, AppState};

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Config::from_env();
    let bind_addr = config.bind_addr.clone();
    let state = AppState::from_config(config).await;
    let app = app(state);

    log::info!("starting server on {bind_addr}");
    axum::serve(
        tokio::net::TcpListener::bind(&bind_addr)
            .await
            .expect("bind"),
        app,
    )
    .await
    .expect("server error");
}
