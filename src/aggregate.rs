//! Read-side rollups over the persisted usage records.
//!
//! Both reports are recomputed from the full record set on every call;
//! there is no incremental materialized state to keep consistent.

use std::collections::{BTreeMap, HashMap};

use serde::Serialize;
use time::OffsetDateTime;
use time::macros::format_description;

use crate::store_types::UsageRecord;

pub const MAX_BREAKDOWN_LIMIT: usize = 500;
pub const DEFAULT_BREAKDOWN_LIMIT: usize = 50;

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DailyUsage {
    /// UTC calendar date, "YYYY-MM-DD".
    pub day: String,
    pub daily_hits: u64,
    /// Sum of estimated cost for the day, rounded to 3 decimals.
    pub daily_cost: f64,
    /// Running sum of daily hits across the ascending day sequence.
    pub accumulative_total: u64,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceBreakdown {
    pub service_name: String,
    pub endpoint: String,
    pub user_id: String,
    pub total_hits: u64,
    pub success_count: u64,
    pub error_count: u64,
    #[serde(rename = "avgLatency")]
    pub avg_latency_ms: u64,
    /// Percentage with one decimal.
    pub success_rate: f64,
    /// Sum of estimated cost, rounded to 4 decimals.
    pub estimated_cost: f64,
    pub total_tokens: u64,
    #[serde(rename = "lastUsed")]
    pub last_used_ms: u64,
}

/// Groups records by UTC calendar date, ascending, with a running hit
/// total across the sequence.
pub fn daily_usage(records: &[UsageRecord]) -> Vec<DailyUsage> {
    let mut days: BTreeMap<String, (u64, f64)> = BTreeMap::new();
    for record in records {
        let entry = days.entry(utc_day(record.created_at_ms)).or_insert((0, 0.0));
        entry.0 += 1;
        entry.1 += record.estimated_cost;
    }

    let mut running_total = 0u64;
    days.into_iter()
        .map(|(day, (hits, cost))| {
            running_total += hits;
            DailyUsage {
                day,
                daily_hits: hits,
                daily_cost: round_to(cost, 3),
                accumulative_total: running_total,
            }
        })
        .collect()
}

#[derive(Default)]
struct BreakdownAccumulator {
    total_hits: u64,
    success_count: u64,
    latency_sum: u64,
    cost_sum: f64,
    token_sum: u64,
    last_used_ms: u64,
}

/// Groups records by (service, endpoint, user), sorted by total hits
/// descending. Pagination applies to the aggregated, sorted result set,
/// never to the raw records; the limit is capped at
/// [`MAX_BREAKDOWN_LIMIT`].
pub fn service_breakdown(
    records: &[UsageRecord],
    limit: usize,
    offset: usize,
) -> Vec<ServiceBreakdown> {
    let mut groups: HashMap<(String, String, String), BreakdownAccumulator> = HashMap::new();
    for record in records {
        let key = (
            record.service_name.clone(),
            record.endpoint.clone(),
            record.user_id.clone(),
        );
        let acc = groups.entry(key).or_default();
        acc.total_hits += 1;
        if (200..300).contains(&record.status_code) {
            acc.success_count += 1;
        }
        acc.latency_sum += record.latency_ms;
        acc.cost_sum += record.estimated_cost;
        acc.token_sum += record.input_tokens + record.output_tokens;
        acc.last_used_ms = acc.last_used_ms.max(record.created_at_ms);
    }

    let mut rows: Vec<ServiceBreakdown> = groups
        .into_iter()
        .map(|((service_name, endpoint, user_id), acc)| {
            let hits = acc.total_hits.max(1);
            ServiceBreakdown {
                service_name,
                endpoint,
                user_id,
                total_hits: acc.total_hits,
                success_count: acc.success_count,
                error_count: acc.total_hits - acc.success_count,
                avg_latency_ms: ((acc.latency_sum as f64 / hits as f64).round()) as u64,
                success_rate: round_to(acc.success_count as f64 / hits as f64 * 100.0, 1),
                estimated_cost: round_to(acc.cost_sum, 4),
                total_tokens: acc.token_sum,
                last_used_ms: acc.last_used_ms,
            }
        })
        .collect();

    // Descending by hits; key order as a deterministic tie-break.
    rows.sort_by(|a, b| {
        b.total_hits.cmp(&a.total_hits).then_with(|| {
            (&a.service_name, &a.endpoint, &a.user_id)
                .cmp(&(&b.service_name, &b.endpoint, &b.user_id))
        })
    });

    let limit = limit.min(MAX_BREAKDOWN_LIMIT);
    rows.into_iter().skip(offset).take(limit).collect()
}

fn utc_day(epoch_ms: u64) -> String {
    let seconds = (epoch_ms / 1_000) as i64;
    let datetime =
        OffsetDateTime::from_unix_timestamp(seconds).unwrap_or(OffsetDateTime::UNIX_EPOCH);
    datetime
        .date()
        .format(format_description!("[year]-[month]-[day]"))
        .unwrap_or_else(|_| datetime.date().to_string())
}

fn round_to(value: f64, decimals: u32) -> f64 {
    let factor = 10f64.powi(decimals as i32);
    (value * factor).round() / factor
}

#[cfg(test)]
mod tests {
    use super::*;

    const DAY_MS: u64 = 86_400_000;
    // 2024-05-13T00:00:00Z
    const D1: u64 = 1_715_558_400_000;

    fn record(service: &str, user: &str, status: u16, created_at_ms: u64) -> UsageRecord {
        UsageRecord {
            user_id: user.to_string(),
            service_name: service.to_string(),
            endpoint: "/v1/chat/completions".to_string(),
            status_code: status,
            latency_ms: 100,
            model: "gpt-4".to_string(),
            input_tokens: 10,
            output_tokens: 5,
            estimated_cost: 0.001,
            created_at_ms,
        }
    }

    #[test]
    fn daily_usage_accumulates_ascending() {
        let records = vec![
            record("svc", "u1", 200, D1),
            record("svc", "u1", 200, D1 + 3_600_000),
            record("svc", "u1", 200, D1 + 7_200_000),
            record("svc", "u1", 200, D1 + DAY_MS),
            record("svc", "u1", 200, D1 + DAY_MS + 60_000),
        ];

        let days = daily_usage(&records);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].day, "2024-05-13");
        assert_eq!(days[0].daily_hits, 3);
        assert_eq!(days[0].accumulative_total, 3);
        assert_eq!(days[1].day, "2024-05-14");
        assert_eq!(days[1].daily_hits, 2);
        assert_eq!(days[1].accumulative_total, 5);
    }

    #[test]
    fn daily_cost_rounds_to_three_decimals() {
        let mut a = record("svc", "u1", 200, D1);
        a.estimated_cost = 0.0014;
        let mut b = record("svc", "u1", 200, D1);
        b.estimated_cost = 0.0012;

        let days = daily_usage(&[a, b]);
        assert_eq!(days[0].daily_cost, 0.003);
    }

    #[test]
    fn day_boundary_is_utc() {
        // One millisecond before midnight vs. midnight.
        let records = vec![
            record("svc", "u1", 200, D1 + DAY_MS - 1),
            record("svc", "u1", 200, D1 + DAY_MS),
        ];
        let days = daily_usage(&records);
        assert_eq!(days.len(), 2);
        assert_eq!(days[0].daily_hits, 1);
        assert_eq!(days[1].daily_hits, 1);
    }

    #[test]
    fn empty_record_set_yields_empty_reports() {
        assert!(daily_usage(&[]).is_empty());
        assert!(service_breakdown(&[], 50, 0).is_empty());
    }

    #[test]
    fn breakdown_counts_successes_and_errors() {
        let mut fast = record("svc", "u1", 200, D1);
        fast.latency_ms = 100;
        let mut slow = record("svc", "u1", 500, D1 + 1_000);
        slow.latency_ms = 301;

        let rows = service_breakdown(&[fast, slow], 50, 0);
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.total_hits, 2);
        assert_eq!(row.success_count, 1);
        assert_eq!(row.error_count, 1);
        assert_eq!(row.success_count + row.error_count, row.total_hits);
        assert_eq!(row.avg_latency_ms, 201);
        assert_eq!(row.success_rate, 50.0);
        assert_eq!(row.total_tokens, 30);
        assert_eq!(row.last_used_ms, D1 + 1_000);
    }

    #[test]
    fn success_rate_keeps_one_decimal() {
        let mut records = vec![
            record("svc", "u1", 200, D1),
            record("svc", "u1", 200, D1),
            record("svc", "u1", 503, D1),
        ];
        records[0].latency_ms = 0;
        records[1].latency_ms = 0;
        records[2].latency_ms = 0;

        let rows = service_breakdown(&records, 50, 0);
        assert_eq!(rows[0].success_rate, 66.7);
    }

    #[test]
    fn breakdown_sorts_by_hits_and_paginates_aggregates() {
        let mut records = Vec::new();
        for _ in 0..10 {
            records.push(record("a", "u1", 200, D1));
        }
        for _ in 0..7 {
            records.push(record("b", "u1", 200, D1));
        }
        for _ in 0..3 {
            records.push(record("c", "u1", 200, D1));
        }

        let all = service_breakdown(&records, 50, 0);
        assert_eq!(
            all.iter().map(|r| r.service_name.as_str()).collect::<Vec<_>>(),
            vec!["a", "b", "c"]
        );

        let page = service_breakdown(&records, 1, 1);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].service_name, "b");
        assert_eq!(page[0].total_hits, 7);
    }

    #[test]
    fn breakdown_limit_is_capped() {
        let records: Vec<UsageRecord> = (0..600)
            .map(|idx| record(&format!("svc-{idx}"), "u1", 200, D1))
            .collect();
        let rows = service_breakdown(&records, 10_000, 0);
        assert_eq!(rows.len(), MAX_BREAKDOWN_LIMIT);
    }

    #[test]
    fn breakdown_groups_by_full_composite_key() {
        let records = vec![
            record("svc", "u1", 200, D1),
            record("svc", "u2", 200, D1),
            record("other", "u1", 200, D1),
        ];
        let rows = service_breakdown(&records, 50, 0);
        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|row| row.total_hits == 1));
    }
}
