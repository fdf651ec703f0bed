//! HTTP request handlers.
//!
//! The gateway in front of this API handles authentication; requests arrive
//! already authorized and scoped to an owner (`x-owner-id` header).

use super::AppState;
use crate::aggregate::{bucket_width_for, window_stats, BucketBuilder};
use crate::db::{Bucket, CurrentStatus, DbError, Target};
use crate::probe::normalize_url;

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};

const RECENT_TICK_LIMIT: i64 = 50;

fn owner_id(headers: &HeaderMap) -> String {
    headers
        .get("x-owner-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("local")
        .to_string()
}

fn db_error_response(e: DbError) -> Response {
    match e {
        DbError::NotFound => (StatusCode::NOT_FOUND, "Not found").into_response(),
        other => (StatusCode::INTERNAL_SERVER_ERROR, other.to_string()).into_response(),
    }
}

/// "all" / "global" (and empty) mean the union across regions.
fn region_filter(raw: Option<&str>) -> Option<String> {
    raw.map(str::trim)
        .filter(|r| !r.is_empty() && !r.eq_ignore_ascii_case("all") && !r.eq_ignore_ascii_case("global"))
        .map(str::to_string)
}

/// Resolve the requested window: explicit [start, end] wins, otherwise the
/// last `days` (default 1, capped at 90).
fn resolve_window(
    start: Option<&str>,
    end: Option<&str>,
    days: Option<i64>,
    now: DateTime<Utc>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let parse = |s: Option<&str>| {
        s.and_then(|v| DateTime::parse_from_rfc3339(v).ok())
            .map(|dt| dt.with_timezone(&Utc))
    };

    if let (Some(s), Some(e)) = (parse(start), parse(end)) {
        if s < e {
            return (s, e);
        }
    }

    let days = days.unwrap_or(1).clamp(1, 90);
    (now - ChronoDuration::days(days), now)
}

fn authorized_target(state: &AppState, id: i64, owner: &str) -> Result<Target, Response> {
    let target = state.store.get_target(id).map_err(db_error_response)?;
    if target.owner_id != owner {
        // Not distinguishable from absent, by contract.
        return Err((StatusCode::NOT_FOUND, "Not found").into_response());
    }
    Ok(target)
}

// ============================================================================
// GET /websites
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WebsitesQuery {
    pub region: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct WebsiteInfo {
    pub id: i64,
    pub url: String,
    pub status: CurrentStatus,
    pub last_check: Option<DateTime<Utc>>,
    pub response_time: Option<i64>,
    pub region_id: Option<String>,
    pub streak: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct GetWebsitesOutput {
    pub websites: Vec<WebsiteInfo>,
}

pub async fn handle_get_websites(
    State(state): State<AppState>,
    Query(query): Query<WebsitesQuery>,
    headers: HeaderMap,
) -> Response {
    let owner = owner_id(&headers);
    let region = region_filter(query.region.as_deref());

    let targets = match state.store.get_targets_for_owner(&owner) {
        Ok(t) => t,
        Err(e) => return db_error_response(e),
    };

    let now = Utc::now();
    let mut websites = Vec::with_capacity(targets.len());

    for target in targets {
        let latest = match state.store.latest_tick(target.id, region.as_deref()) {
            Ok(t) => t,
            Err(e) => return db_error_response(e),
        };

        let status = match &region {
            Some(r) => state.tracker.snapshot(target.id, r).current_status,
            None => state.tracker.global_status(target.id),
        };
        let streak = match state.store.current_streak_secs(target.id, now) {
            Ok(s) => s,
            Err(e) => return db_error_response(e),
        };

        websites.push(WebsiteInfo {
            id: target.id,
            url: target.url,
            status,
            last_check: latest.as_ref().map(|t| t.created_at),
            response_time: latest.as_ref().map(|t| t.response_time_ms),
            region_id: latest.map(|t| t.region_id),
            streak,
        });
    }

    Json(GetWebsitesOutput { websites }).into_response()
}

// ============================================================================
// GET /website/{id}
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct WebsiteDetailsQuery {
    pub days: Option<i64>,
    pub start: Option<String>,
    pub end: Option<String>,
    pub region: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TickInfo {
    pub status: &'static str,
    pub response_time: i64,
    pub created_at: DateTime<Utc>,
    pub region_id: String,
}

#[derive(Debug, Serialize)]
pub struct WebsiteStats {
    pub uptime_24h: Option<f64>,
    pub uptime_7d: Option<f64>,
    pub uptime_30d: Option<f64>,
    pub incidents_24h: i64,
    pub avg_response_time_24h: Option<i64>,
}

#[derive(Debug, Serialize)]
pub struct GetWebsiteOutput {
    pub id: i64,
    pub url: String,
    pub recent_ticks: Vec<TickInfo>,
    pub stats: WebsiteStats,
    pub graph_data: Vec<Bucket>,
    pub streak: Option<i64>,
    pub created_at: DateTime<Utc>,
}

pub async fn handle_get_website(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    Query(query): Query<WebsiteDetailsQuery>,
    headers: HeaderMap,
) -> Response {
    let owner = owner_id(&headers);
    let target = match authorized_target(&state, id, &owner) {
        Ok(t) => t,
        Err(resp) => return resp,
    };

    let now = Utc::now();
    let region = region_filter(query.region.as_deref());
    let (start, end) = resolve_window(
        query.start.as_deref(),
        query.end.as_deref(),
        query.days,
        now,
    );

    // Graph: the live series covers the default union window; everything
    // else recomputes from the raw log in a single ordered pass.
    let width = bucket_width_for(end - start);
    let live_graph = if region.is_none() {
        state.live.graph(id, width, start, end)
    } else {
        None
    };
    let graph_data = match live_graph {
        Some(buckets) => buckets,
        None => {
            let graph_ticks = match state.store.ticks_in_range(id, region.as_deref(), start, end)
            {
                Ok(t) => t,
                Err(e) => return db_error_response(e),
            };
            let mut builder = BucketBuilder::new(width);
            for tick in &graph_ticks {
                builder.ingest(tick);
            }
            builder.finish()
        }
    };

    // Rolling stats windows are anchored to now, independent of the graph.
    let stats_window = |hours: i64| {
        state
            .store
            .ticks_in_range(id, region.as_deref(), now - ChronoDuration::hours(hours), now)
    };
    let t24 = match stats_window(24) {
        Ok(t) => t,
        Err(e) => return db_error_response(e),
    };
    let t7d = match stats_window(24 * 7) {
        Ok(t) => t,
        Err(e) => return db_error_response(e),
    };
    let t30d = match stats_window(24 * 30) {
        Ok(t) => t,
        Err(e) => return db_error_response(e),
    };

    let incidents_24h = match state.store.count_incidents_opened_in(
        id,
        region.as_deref(),
        now - ChronoDuration::hours(24),
        now,
    ) {
        Ok(n) => n,
        Err(e) => return db_error_response(e),
    };

    let s24 = window_stats(&t24, incidents_24h);
    let stats = WebsiteStats {
        uptime_24h: s24.as_ref().map(|s| s.uptime_pct),
        uptime_7d: window_stats(&t7d, 0).map(|s| s.uptime_pct),
        uptime_30d: window_stats(&t30d, 0).map(|s| s.uptime_pct),
        incidents_24h,
        avg_response_time_24h: s24.and_then(|s| s.avg_response_time_ms),
    };

    let recent_ticks = match state.store.recent_ticks(id, region.as_deref(), RECENT_TICK_LIMIT)
    {
        Ok(ticks) => ticks
            .into_iter()
            .map(|t| TickInfo {
                status: t.status.as_str(),
                response_time: t.response_time_ms,
                created_at: t.created_at,
                region_id: t.region_id,
            })
            .collect(),
        Err(e) => return db_error_response(e),
    };

    let streak = match state.store.current_streak_secs(id, now) {
        Ok(s) => s,
        Err(e) => return db_error_response(e),
    };

    Json(GetWebsiteOutput {
        id: target.id,
        url: target.url,
        recent_ticks,
        stats,
        graph_data,
        streak,
        created_at: target.created_at,
    })
    .into_response()
}

// ============================================================================
// POST /website, DELETE /website/{id}
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct CreateWebsiteInput {
    pub url: String,
}

#[derive(Debug, Serialize)]
pub struct CreateWebsiteOutput {
    pub id: i64,
}

pub async fn handle_create_website(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(input): Json<CreateWebsiteInput>,
) -> Response {
    let owner = owner_id(&headers);

    let url = match normalize_url(&input.url) {
        Ok(u) => u,
        Err(e) => return (StatusCode::BAD_REQUEST, e.to_string()).into_response(),
    };

    let target = match state.store.add_target(&url, &owner) {
        Ok(t) => t,
        Err(e) => return db_error_response(e),
    };

    state.scheduler.add_target(&target).await;
    Json(CreateWebsiteOutput { id: target.id }).into_response()
}

pub async fn handle_delete_website(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let owner = owner_id(&headers);
    if let Err(resp) = authorized_target(&state, id, &owner) {
        return resp;
    }

    state.scheduler.remove_target(id).await;
    state.tracker.forget_target(id);
    state.live.forget_target(id);

    match state.store.delete_target(id) {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => db_error_response(e),
    }
}

// ============================================================================
// POST /website/{id}/alert-test
// ============================================================================

pub async fn handle_alert_test(
    State(state): State<AppState>,
    Path(id): Path<i64>,
    headers: HeaderMap,
) -> Response {
    let owner = owner_id(&headers);
    if let Err(resp) = authorized_target(&state, id, &owner) {
        return resp;
    }

    // Synthetic event only: no tick, no incident.
    state.dispatcher.test(id);

    Json(serde_json::json!({
        "status": "success",
        "message": "Test alert dispatched"
    }))
    .into_response()
}
