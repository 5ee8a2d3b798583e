//! Application startup and lifecycle management.

use crate::config::SubscriptionConfig;
use crate::error::BillingError;
use crate::handlers;
use crate::scheduler::{register_subscription_jobs, Scheduler};
use crate::services::{
    init_metrics, Clock, LogNotifier, Notifier, PgStore, SubscriptionManager, SystemClock,
    TapGateway, WebhookNotifier,
};
use axum::Router;
use secrecy::{ExposeSecret, Secret};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub service_name: String,
    pub manager: Arc<SubscriptionManager>,
    pub webhook_secret: Secret<String>,
}

impl AppState {
    pub fn new(
        service_name: impl Into<String>,
        manager: Arc<SubscriptionManager>,
        webhook_secret: Secret<String>,
    ) -> Self {
        Self {
            service_name: service_name.into(),
            manager,
            webhook_secret,
        }
    }
}

/// Application container for managing server lifecycle.
pub struct Application {
    port: u16,
    listener: TcpListener,
    router: Router,
    scheduler: Option<Scheduler>,
}

impl Application {
    /// Build the application with the given configuration.
    pub async fn build(config: SubscriptionConfig) -> Result<Self, BillingError> {
        init_metrics();

        let store = PgStore::connect(
            config.database.url.expose_secret(),
            config.database.max_connections,
            config.database.min_connections,
        )
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to connect to PostgreSQL");
            e
        })?;

        store.run_migrations().await.map_err(|e| {
            tracing::error!(error = %e, "Failed to run migrations");
            e
        })?;

        let gateway = TapGateway::new(config.gateway.clone())?;
        if gateway.is_configured() {
            tracing::info!(base_url = %config.gateway.base_url, "Tap gateway initialized");
        } else {
            tracing::warn!("Tap secret key not configured - charges will be rejected");
        }

        let notifier: Arc<dyn Notifier> = match &config.notifications.webhook_url {
            Some(url) => Arc::new(
                WebhookNotifier::new(
                    url.clone(),
                    Duration::from_secs(config.notifications.timeout_secs),
                )
                .map_err(|e| BillingError::Config(anyhow::anyhow!(e)))?,
            ),
            None => {
                tracing::warn!("No notification endpoint configured - notifications are logged only");
                Arc::new(LogNotifier)
            }
        };

        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let manager = Arc::new(SubscriptionManager::new(
            Arc::new(store),
            Arc::new(gateway),
            notifier,
            Arc::clone(&clock),
            config.lifecycle.clone(),
            config.gateway.redirect_url.clone(),
        ));

        let scheduler = if config.scheduler.enabled {
            let mut scheduler = Scheduler::new(clock);
            register_subscription_jobs(&mut scheduler, Arc::clone(&manager), &config.scheduler);
            Some(scheduler)
        } else {
            tracing::info!("Scheduler disabled by configuration");
            None
        };

        let state = AppState::new(
            config.service_name.clone(),
            Arc::clone(&manager),
            config.gateway.webhook_secret.clone(),
        );

        let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
        let listener = TcpListener::bind(addr).await.map_err(|e| {
            tracing::error!(error = %e, addr = %addr, "Failed to bind HTTP listener");
            BillingError::from(e)
        })?;
        let port = listener.local_addr()?.port();

        tracing::info!(http_port = port, "Subscription service listener bound");

        Ok(Self {
            port,
            listener,
            router: handlers::router(state),
            scheduler,
        })
    }

    /// Serve until `shutdown` resolves, then stop the scheduled jobs.
    pub async fn run_until_stopped<F>(self, shutdown: F) -> std::io::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut scheduler = self.scheduler;
        if let Some(scheduler) = scheduler.as_mut() {
            scheduler.start();
        }

        tracing::info!(
            service = "subscription-service",
            version = env!("CARGO_PKG_VERSION"),
            http_port = self.port,
            "Service ready to accept connections"
        );

        let result = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await;

        if let Some(scheduler) = scheduler {
            scheduler.shutdown().await;
        }

        result.map_err(|e| {
            tracing::error!(error = %e, "HTTP server error");
            std::io::Error::other(format!("HTTP server error: {}", e))
        })
    }
}
