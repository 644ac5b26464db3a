use std::path::Path;

use bolt_gateway::engine::Engine;
use bolt_gateway::{config, http, DEFAULT_CONFIG_DIR};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let config_dir =
        std::env::var("BOLT_CONFIG_DIR").unwrap_or_else(|_| DEFAULT_CONFIG_DIR.to_string());
    let (config, config_path) = match config::load(Path::new(&config_dir)) {
        Ok(loaded) => loaded,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    let addr = match config.bind_addr() {
        Ok(addr) => addr,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };
    let tls_enabled = config.engine.tls_enabled;
    let tls_cert = config.engine.tls_cert_file.clone();
    let tls_key = config.engine.tls_key_file.clone();

    let engine = match Engine::start(config, config_path).await {
        Ok(engine) => engine,
        Err(err) => {
            eprintln!("STARTUP_ERROR {}", err);
            std::process::exit(1);
        }
    };

    {
        let engine = engine.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("os signal received");
                engine.begin_shutdown();
            }
        });
    }

    let app = http::router(engine.clone());

    if tls_enabled {
        let tls = match axum_server::tls_rustls::RustlsConfig::from_pem_file(&tls_cert, &tls_key)
            .await
        {
            Ok(tls) => tls,
            Err(err) => {
                eprintln!("STARTUP_ERROR ERR_TLS_CONFIG {}", err);
                std::process::exit(1);
            }
        };
        tracing::info!(bind_addr = %addr, "bolt engine listening");
        if let Err(err) = axum_server::bind_rustls(addr, tls)
            .serve(app.into_make_service())
            .await
        {
            eprintln!("STARTUP_ERROR ERR_SERVER_FAILED {}", err);
            std::process::exit(1);
        }
    } else {
        tracing::warn!(bind_addr = %addr, "NOT running over https! Use tlsEnabled before going to production");
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(listener) => listener,
            Err(_) => {
                eprintln!("STARTUP_ERROR ERR_BIND_FAILED failed to bind engine listener");
                std::process::exit(1);
            }
        };
        tracing::info!(bind_addr = %addr, "bolt engine listening");
        let shutdown = engine.shutdown.clone();
        if let Err(err) = axum::serve(listener, app)
            .with_graceful_shutdown(async move { shutdown.wait().await })
            .await
        {
            eprintln!("STARTUP_ERROR ERR_SERVER_FAILED {}", err);
            std::process::exit(1);
        }
    }

    // The shutdown drain loop owns process exit; hold main open until it
    // calls it.
    std::future::pending::<()>().await;
}
