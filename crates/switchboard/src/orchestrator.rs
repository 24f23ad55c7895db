//! Retry and failover loop.
//!
//! Walks the candidate sequence produced by the selector, one attempt at a
//! time, committing health deltas and trace events after every attempt. The
//! request deliberately never fans out to two models at once.

use std::sync::Arc;
use std::time::Duration;

use reqwest::StatusCode;
use serde_json::{Map, Value};
use tracing::{info, warn};

use crate::config::{AppConfig, Tier};
use crate::error::{RouteError, RouteResult};
use crate::health::HealthRegistry;
use crate::invoker::{AttemptOutcome, Invoker, UpstreamReply};
use crate::providers::{self, ModelRef};
use crate::selection;
use crate::tokens::TokenUsage;
use crate::trace::{Stage, TraceRecorder, TraceStatus};

/// How the routed request terminates on the north side.
#[derive(Debug)]
pub enum Disposition {
    /// A complete JSON body: 2xx on success, or the upstream error passed
    /// through verbatim when retrying would not help.
    Completed { status: StatusCode, body: Value },
    /// A live upstream SSE response; the gateway owns the passthrough, which
    /// must finish the trace, health delta, and log.
    Streaming {
        response: reqwest::Response,
        generation_timeout: Duration,
    },
}

#[derive(Debug)]
pub struct RouteOutcome {
    pub disposition: Disposition,
    pub chosen: ModelRef,
    /// Failed attempts before the terminal one.
    pub retry_count: u32,
    pub usage: Option<TokenUsage>,
    pub assistant_text: String,
}

pub struct Orchestrator {
    invoker: Invoker,
    health: Arc<HealthRegistry>,
}

impl Orchestrator {
    pub fn new(invoker: Invoker, health: Arc<HealthRegistry>) -> Self {
        Self { invoker, health }
    }

    pub fn health(&self) -> &Arc<HealthRegistry> {
        &self.health
    }

    pub async fn run(
        &self,
        config: &AppConfig,
        tier: Tier,
        client_body: &Map<String, Value>,
        client_streaming: bool,
        trace: &TraceRecorder,
    ) -> RouteResult<RouteOutcome> {
        let pool = config.models.pool(tier);
        if pool.is_empty() {
            trace.record(
                Stage::AllFailed,
                TraceStatus::Fail,
                None,
                None,
                Some(format!("no models configured for tier {tier}")),
                0,
            );
            return Err(RouteError::Exhausted {
                attempted: Vec::new(),
                last_reason: format!("no models configured for tier {tier}"),
            });
        }

        let strategy = *config.models.strategies.get(tier);
        let plan = selection::plan(
            pool,
            strategy,
            *config.retries.rounds.get(tier),
            *config.retries.max_retries.get(tier),
            &self.health,
        );

        let mut attempted: Vec<String> = Vec::new();
        let mut last_reason = String::new();

        for (index, entry) in plan.iter().enumerate() {
            let retry_count = index as u32;
            let (target, endpoint) = providers::resolve(config, entry)?;
            let canonical = target.canonical();
            attempted.push(canonical.clone());

            trace.record(
                Stage::ModelCallStart,
                TraceStatus::Info,
                Some(&target.model),
                Some(&target.provider_id),
                None,
                retry_count,
            );

            let outcome = self
                .invoker
                .attempt(config, &target, endpoint, client_body, client_streaming, tier)
                .await;

            match outcome {
                AttemptOutcome::Success(success) => {
                    return match success.reply {
                        UpstreamReply::Buffered(body) => {
                            self.health.on_success(&canonical);
                            trace.record(
                                Stage::FullResponse,
                                TraceStatus::Success,
                                Some(&target.model),
                                Some(&target.provider_id),
                                None,
                                retry_count,
                            );
                            info!(model = %canonical, attempts = index + 1, "routed");
                            Ok(RouteOutcome {
                                disposition: Disposition::Completed {
                                    status: StatusCode::OK,
                                    body,
                                },
                                chosen: target,
                                retry_count,
                                usage: success.usage,
                                assistant_text: success.assistant_text,
                            })
                        }
                        UpstreamReply::Streaming(response) => {
                            // stream completion decides success or abort;
                            // health and FULL_RESPONSE are committed there
                            Ok(RouteOutcome {
                                disposition: Disposition::Streaming {
                                    response,
                                    generation_timeout: Duration::from_millis(
                                        *config.timeouts.generation.get(tier),
                                    ),
                                },
                                chosen: target,
                                retry_count,
                                usage: None,
                                assistant_text: String::new(),
                            })
                        }
                    };
                }
                AttemptOutcome::Failure(failure) => {
                    self.health.on_failure(&canonical, failure.kind);
                    last_reason = failure.kind.as_str().to_string();
                    trace.record(
                        Stage::ModelFail,
                        TraceStatus::Fail,
                        Some(&target.model),
                        Some(&target.provider_id),
                        Some(failure.reason.clone()),
                        retry_count + 1,
                    );

                    if failure.retryable {
                        warn!(
                            model = %canonical,
                            kind = failure.kind.as_str(),
                            reason = %failure.reason,
                            "attempt failed, trying next candidate"
                        );
                        continue;
                    }

                    // Retrying would not help; the client must see the real
                    // upstream error.
                    warn!(
                        model = %canonical,
                        kind = failure.kind.as_str(),
                        "non-retryable failure, passing upstream error through"
                    );
                    trace.record(
                        Stage::FullResponse,
                        TraceStatus::Fail,
                        Some(&target.model),
                        Some(&target.provider_id),
                        Some(format!("upstream {} passed through", failure.kind)),
                        retry_count,
                    );
                    let status = failure.status.unwrap_or(StatusCode::BAD_GATEWAY);
                    let body = failure.body.unwrap_or_else(|| {
                        serde_json::json!({
                            "error": {"kind": failure.kind.as_str(), "message": failure.reason}
                        })
                    });
                    return Ok(RouteOutcome {
                        disposition: Disposition::Completed { status, body },
                        chosen: target,
                        retry_count,
                        usage: None,
                        assistant_text: String::new(),
                    });
                }
            }
        }

        trace.record(
            Stage::AllFailed,
            TraceStatus::Fail,
            None,
            None,
            Some(last_reason.clone()),
            attempted.len() as u32,
        );
        Err(RouteError::Exhausted {
            attempted,
            last_reason,
        })
    }
}
