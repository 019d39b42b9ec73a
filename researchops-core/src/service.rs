//! Admission layer in front of the research pipeline.
//!
//! [`ResearchService`] rate-limits callers per identifier, validates the
//! query, then hands it to a [`RequestBatcher`] that runs pipeline instances
//! in small concurrent batches. Callers poll for the outcome by request id.
//! While started, a background task also drops expired rate-limit windows.

use crate::config::{QueryLimits, ResearchOpsConfig};
use crate::error::Result;
use crate::research::ResearchOpsAgent;
use crate::resilience::{
    CircuitBreakerSnapshot, CircuitState, PendingRequest, RateLimiter, RequestBatcher,
};
use crate::types::{ResearchOutcome, ResearchQuery};
use serde::Serialize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Rate-limit endpoint for research submissions.
pub const RESEARCH_ENDPOINT: &str = "/research";
/// Rate-limit endpoint for health checks.
pub const HEALTH_ENDPOINT: &str = "/health";

/// A validated query waiting in the batcher.
#[derive(Debug, Clone)]
pub struct ResearchRequest {
    /// Caller identity the request was admitted for.
    pub identifier: String,
    pub query: ResearchQuery,
}

/// Overall service condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    /// Batcher running and every breaker closed.
    Healthy,
    /// Batcher running but at least one dependency circuit is not closed.
    Degraded,
    /// Batcher not running; submissions queue but are not processed.
    Stopped,
}

/// Snapshot returned by [`ResearchService::health`].
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub breakers: Vec<CircuitBreakerSnapshot>,
    pub queue_size: usize,
    pub batcher_running: bool,
}

/// Rate limiter, validation and batching around a shared [`ResearchOpsAgent`].
pub struct ResearchService {
    agent: Arc<ResearchOpsAgent>,
    limiter: Arc<RateLimiter>,
    batcher: RequestBatcher<ResearchRequest, ResearchOutcome>,
    limits: QueryLimits,
    sweep_interval: Duration,
    sweeper: Mutex<Option<(CancellationToken, JoinHandle<()>)>>,
}

impl ResearchService {
    pub fn new(agent: Arc<ResearchOpsAgent>, config: &ResearchOpsConfig) -> Self {
        let runner = Arc::clone(&agent);
        let batcher = RequestBatcher::with_processor(
            config.batcher.clone(),
            move |request: ResearchRequest| {
                let agent = Arc::clone(&runner);
                async move {
                    debug!(identifier = %request.identifier, "Processing research request");
                    agent.run_query(request.query).await
                }
            },
        );

        // Sweep as often as the shortest window rolls over.
        let shortest_window = config
            .rate_limit
            .endpoints
            .values()
            .map(|l| l.window_secs)
            .chain(std::iter::once(config.rate_limit.default_window_secs))
            .min()
            .unwrap_or(config.rate_limit.default_window_secs);

        Self {
            agent,
            limiter: Arc::new(RateLimiter::new(&config.rate_limit)),
            batcher,
            limits: config.query.clone(),
            sweep_interval: Duration::from_secs(shortest_window.max(1)),
            sweeper: Mutex::new(None),
        }
    }

    pub fn agent(&self) -> &ResearchOpsAgent {
        &self.agent
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    /// Start processing queued requests and the rate-limit window sweep.
    /// Requires a tokio runtime.
    pub fn start(&self) -> Result<()> {
        self.batcher.start()?;

        let mut sweeper = self.lock_sweeper();
        if sweeper.is_none() {
            let cancel = CancellationToken::new();
            let handle = tokio::spawn(sweep_windows(
                Arc::clone(&self.limiter),
                self.sweep_interval,
                cancel.clone(),
            ));
            *sweeper = Some((cancel, handle));
        }
        info!(
            sweep_secs = self.sweep_interval.as_secs(),
            "Research service started"
        );
        Ok(())
    }

    /// Admit a research request for `identifier`.
    ///
    /// The rate limit is checked first, so a rejected caller learns nothing
    /// about query validity. Nothing is enqueued unless both checks pass.
    pub fn submit(&self, identifier: &str, query: &str, max_papers: usize) -> Result<Uuid> {
        self.limiter
            .check_or_reject(identifier, Some(RESEARCH_ENDPOINT))?;
        let query = ResearchQuery::new(query, max_papers, &self.limits)?;
        let id = self.batcher.add_request(ResearchRequest {
            identifier: identifier.to_string(),
            query,
        })?;
        info!(request_id = %id, identifier, "Research request admitted");
        Ok(id)
    }

    /// Wait up to `timeout` for the outcome of a submitted request.
    pub async fn result(&self, request_id: Uuid, timeout: Duration) -> Result<ResearchOutcome> {
        self.batcher.get_result(request_id, timeout).await
    }

    /// Requests not yet finished, oldest first.
    pub fn pending(&self) -> Vec<PendingRequest> {
        self.batcher.get_pending_requests()
    }

    /// Health snapshot, rate-limited against the health endpoint.
    pub fn health(&self, identifier: &str) -> Result<HealthReport> {
        self.limiter
            .check_or_reject(identifier, Some(HEALTH_ENDPOINT))?;

        let breakers = self.agent.breaker_states();
        let batcher_running = self.batcher.is_running();
        let status = if !batcher_running {
            HealthStatus::Stopped
        } else if breakers.iter().any(|b| b.state != CircuitState::Closed) {
            HealthStatus::Degraded
        } else {
            HealthStatus::Healthy
        };

        Ok(HealthReport {
            status,
            breakers,
            queue_size: self.batcher.get_queue_size(),
            batcher_running,
        })
    }

    /// Drop expired rate-limit windows and uncollected results now.
    /// A started service does both on its own.
    pub fn cleanup(&self) -> usize {
        self.limiter.cleanup_expired() + self.batcher.cleanup_completed()
    }

    /// Stop processing and the window sweep. Queued requests stay queued.
    pub async fn shutdown(&self) {
        let sweeper = self.lock_sweeper().take();
        if let Some((cancel, handle)) = sweeper {
            cancel.cancel();
            let _ = handle.await;
        }
        self.batcher.stop().await;
        info!("Research service stopped");
    }

    fn lock_sweeper(&self) -> MutexGuard<'_, Option<(CancellationToken, JoinHandle<()>)>> {
        self.sweeper.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for ResearchService {
    fn drop(&mut self) {
        if let Some((cancel, _)) = self.lock_sweeper().take() {
            cancel.cancel();
        }
    }
}

async fn sweep_windows(limiter: Arc<RateLimiter>, every: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let removed = limiter.cleanup_expired();
                if removed > 0 {
                    debug!(removed, "Expired rate-limit windows dropped");
                }
            }
        }
    }
}
