// src/api/http/analysis.rs
// Analysis API (spec.md §6): protected by the analysis bearer token,
// rate-limited per domain (15 creations/min, 100 retrievals/min).
//
// Grounded on the teacher's `utils::rate_limiter::RateLimiter`
// (`governor::RateLimiter` + `Quota::per_minute`), generalized here to one
// limiter per domain per operation kind.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use governor::clock::{Clock, DefaultClock};
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovRateLimiter};
use parking_lot::{Mutex, RwLock};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::domain_from_host;
use crate::analysis::store::CreateOutcome;
use crate::auth::tokens_match;
use crate::error::AppError;
use crate::state::AppState;

/// A `governor` limiter plus the bookkeeping needed to render
/// `X-RateLimit-*` headers (spec.md §6), which `governor`'s direct,
/// unkeyed limiter doesn't expose on its own.
struct TrackedLimiter {
    limiter: GovRateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    limit: u32,
    window: Duration,
    remaining: Mutex<(u32, Instant)>,
}

impl TrackedLimiter {
    fn new(limit: u32, window: Duration) -> Self {
        Self {
            limiter: GovRateLimiter::direct(Quota::with_period(window / limit).unwrap().allow_burst(NonZeroU32::new(limit).unwrap())),
            limit,
            window,
            remaining: Mutex::new((limit, Instant::now() + window)),
        }
    }

    /// Check the quota, returning the `(remaining, reset_at)` snapshot to
    /// render as headers whether or not the check passed.
    fn check(&self) -> Result<(u32, Instant), (Duration, u32, Instant)> {
        let mut state = self.remaining.lock();
        if Instant::now() >= state.1 {
            *state = (self.limit, Instant::now() + self.window);
        }
        match self.limiter.check() {
            Ok(()) => {
                state.0 = state.0.saturating_sub(1);
                Ok((state.0, state.1))
            }
            Err(not_until) => {
                let retry_after = not_until.wait_time_from(DefaultClock::default().now());
                Err((retry_after, state.0, state.1))
            }
        }
    }
}

type DomainLimiter = Arc<TrackedLimiter>;

/// Per-domain rate limiters for the two operation kinds this API exposes.
/// Lazily created on first use, one pair per domain.
pub struct AnalysisRateLimiters {
    creations: RwLock<HashMap<String, DomainLimiter>>,
    retrievals: RwLock<HashMap<String, DomainLimiter>>,
}

impl AnalysisRateLimiters {
    pub fn new() -> Self {
        Self {
            creations: RwLock::new(HashMap::new()),
            retrievals: RwLock::new(HashMap::new()),
        }
    }

    fn creation_limiter(&self, domain: &str) -> DomainLimiter {
        if let Some(limiter) = self.creations.read().get(domain) {
            return limiter.clone();
        }
        let limiter = Arc::new(TrackedLimiter::new(15, Duration::from_secs(60)));
        self.creations.write().insert(domain.to_string(), limiter.clone());
        limiter
    }

    fn retrieval_limiter(&self, domain: &str) -> DomainLimiter {
        if let Some(limiter) = self.retrievals.read().get(domain) {
            return limiter.clone();
        }
        let limiter = Arc::new(TrackedLimiter::new(100, Duration::from_secs(60)));
        self.retrievals.write().insert(domain.to_string(), limiter.clone());
        limiter
    }
}

impl Default for AnalysisRateLimiters {
    fn default() -> Self {
        Self::new()
    }
}

/// Stamp `X-RateLimit-Limit/Remaining/Reset` (spec.md §6) on any response,
/// success or error.
fn stamp_rate_limit_headers(response: &mut Response, limit: u32, remaining: u32, reset_secs: u64) {
    let headers = response.headers_mut();
    headers.insert(
        "x-ratelimit-limit",
        HeaderValue::from_str(&limit.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    headers.insert(
        "x-ratelimit-remaining",
        HeaderValue::from_str(&remaining.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
    headers.insert(
        "x-ratelimit-reset",
        HeaderValue::from_str(&reset_secs.to_string()).unwrap_or_else(|_| HeaderValue::from_static("0")),
    );
}

/// Apply `limiter`, building the eventual `Response` so both the success
/// and the 429 path carry `X-RateLimit-*` headers, and `Retry-After` on the
/// 429 (spec.md §6).
fn check_rate_limit(limiter: &TrackedLimiter) -> Result<RateLimitStamp, Response> {
    match limiter.check() {
        Ok((remaining, reset_at)) => Ok(RateLimitStamp {
            limit: limiter.limit,
            remaining,
            reset_secs: reset_at.saturating_duration_since(Instant::now()).as_secs(),
        }),
        Err((retry_after, remaining, reset_at)) => {
            let retry_after_secs = retry_after.as_secs().max(1);
            let mut response = AppError::RateLimit { retry_after_secs }.into_response();
            stamp_rate_limit_headers(
                &mut response,
                limiter.limit,
                remaining,
                reset_at.saturating_duration_since(Instant::now()).as_secs(),
            );
            Err(response)
        }
    }
}

/// A passed rate-limit check's header values, applied to the eventual
/// success response once the handler knows its final shape.
struct RateLimitStamp {
    limit: u32,
    remaining: u32,
    reset_secs: u64,
}

impl RateLimitStamp {
    fn apply(&self, mut response: Response) -> Response {
        stamp_rate_limit_headers(&mut response, self.limit, self.remaining, self.reset_secs);
        response
    }
}

fn authenticate_dashboard(headers: &HeaderMap, state: &AppState) -> Result<(), AppError> {
    let Some(expected) = state.config.analysis.dashboard_api_key.as_deref() else {
        return Ok(());
    };
    let presented = crate::auth::extract_client_token(headers).ok_or(AppError::Authentication)?;
    if tokens_match(&presented, expected) {
        Ok(())
    } else {
        Err(AppError::Authentication)
    }
}

#[derive(Debug, Deserialize)]
pub struct CreateAnalysisBody {
    #[serde(rename = "conversationId")]
    pub conversation_id: Uuid,
    #[serde(rename = "branchId", default = "default_branch")]
    pub branch_id: String,
}

fn default_branch() -> String {
    "main".to_string()
}

/// `POST /api/analyses` (spec.md §6): 403 in read-only mode (no
/// `DASHBOARD_API_KEY` configured), else 201 on creation or 409 with the
/// existing record.
pub async fn create(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateAnalysisBody>,
) -> Result<Response, AppError> {
    if state.config.analysis.read_only() {
        return Err(AppError::Authorization("analysis API is in read-only mode".to_string()));
    }
    authenticate_dashboard(&headers, &state)?;

    let domain = domain_from_host(&headers)?;
    let stamp = match check_rate_limit(&state.analysis_rate_limiters.creation_limiter(&domain)) {
        Ok(stamp) => stamp,
        Err(response) => return Ok(response),
    };

    let outcome = state
        .analysis_store
        .create(body.conversation_id, &body.branch_id, None)
        .await?;

    let response = match outcome {
        CreateOutcome::Created(job) => (StatusCode::CREATED, Json(job)).into_response(),
        CreateOutcome::AlreadyExists(job) => (StatusCode::CONFLICT, Json(job)).into_response(),
    };
    Ok(stamp.apply(response))
}

/// `GET /api/analyses/:conversationId/:branchId` (spec.md §6): readable even
/// in read-only mode.
pub async fn get(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((conversation_id, branch_id)): Path<(Uuid, String)>,
) -> Result<Response, AppError> {
    authenticate_dashboard(&headers, &state)?;

    let domain = domain_from_host(&headers)?;
    let stamp = match check_rate_limit(&state.analysis_rate_limiters.retrieval_limiter(&domain)) {
        Ok(stamp) => stamp,
        Err(response) => return Ok(response),
    };

    let response = match state.analysis_store.get(conversation_id, &branch_id).await? {
        Some(job) => Json(job).into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "no analysis for this conversation/branch" })),
        )
            .into_response(),
    };
    Ok(stamp.apply(response))
}

#[derive(Debug, Deserialize, Default)]
pub struct RegenerateBody {
    #[serde(rename = "customPrompt")]
    pub custom_prompt: Option<String>,
}

/// `POST /api/analyses/:conversationId/:branchId/regenerate` (spec.md §6).
pub async fn regenerate(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path((conversation_id, branch_id)): Path<(Uuid, String)>,
    body: Option<Json<RegenerateBody>>,
) -> Result<Response, AppError> {
    if state.config.analysis.read_only() {
        return Err(AppError::Authorization("analysis API is in read-only mode".to_string()));
    }
    authenticate_dashboard(&headers, &state)?;

    let domain = domain_from_host(&headers)?;
    let stamp = match check_rate_limit(&state.analysis_rate_limiters.creation_limiter(&domain)) {
        Ok(stamp) => stamp,
        Err(response) => return Ok(response),
    };

    let custom_prompt = body.map(|Json(b)| b.custom_prompt).unwrap_or(None);
    state
        .analysis_store
        .regenerate(conversation_id, &branch_id, custom_prompt)
        .await?;

    match state.analysis_store.get(conversation_id, &branch_id).await? {
        Some(job) => Ok(stamp.apply(Json(job).into_response())),
        None => Err(AppError::NotFound("no analysis for this conversation/branch".to_string())),
    }
}
