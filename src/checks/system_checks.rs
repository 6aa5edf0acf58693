//! 系统自检：远端API可达性、结果新鲜度，以及API故障的确认动作

use crate::{
    error::AppResult,
    models::{CheckEntry, Kwargs, parse_uuid},
    repositories::RunResult,
    services::{CheckRegistry, Connection},
};
use anyhow::anyhow;
use chrono::{Duration, Utc};
use serde_json::{Value, json};

pub const MODULE: &str = "system_checks";

pub fn register(registry: &mut CheckRegistry) -> AppResult<()> {
    registry.register_check(MODULE, "api_reachable", Kwargs::new(), api_reachable)?;

    let mut freshness_defaults = Kwargs::new();
    freshness_defaults.insert("checks".to_string(), json!(["api_reachable"]));
    freshness_defaults.insert("max_age_hours".to_string(), json!(24));
    registry.register_check(MODULE, "result_freshness", freshness_defaults, result_freshness)?;

    registry.register_action(
        MODULE,
        "acknowledge_api_outage",
        Kwargs::new(),
        acknowledge_api_outage,
    )?;

    registry.register_group(
        "system_checks",
        vec![
            CheckEntry::new(format!("{}/api_reachable", MODULE)),
            CheckEntry::new(format!("{}/result_freshness", MODULE)),
        ],
    );
    Ok(())
}

async fn api_reachable(connection: Connection, _kwargs: Kwargs) -> anyhow::Result<RunResult> {
    let mut check = connection.check_result("api_reachable");
    check.action = Some("acknowledge_api_outage".to_string());

    match connection.api().health().await {
        Ok(code) if (200..300).contains(&code) => {
            check.status = "PASS".to_string();
            check.summary = "API is reachable".to_string();
            check.brief_output = json!(code);
        }
        Ok(code) => {
            check.status = "FAIL".to_string();
            check.summary = format!("API health returned {}", code);
            check.brief_output = json!(code);
            check.allow_action = true;
        }
        Err(e) => {
            check.status = "FAIL".to_string();
            check.summary = "API is unreachable".to_string();
            check.full_output = json!(e.to_string());
            check.allow_action = true;
        }
    }
    check.description = format!("Health endpoint: {}", connection.api().url("/health"));
    Ok(check)
}

async fn result_freshness(connection: Connection, kwargs: Kwargs) -> anyhow::Result<RunResult> {
    let names: Vec<String> = kwargs
        .get("checks")
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let max_age_hours = kwargs
        .get("max_age_hours")
        .and_then(Value::as_i64)
        .ok_or_else(|| anyhow!("max_age_hours must be an integer"))?;
    let cutoff = Utc::now() - Duration::hours(max_age_hours);

    let mut fresh = Vec::new();
    let mut stale = Vec::new();
    for name in names {
        let latest = connection.check_result(&name).get_latest_result().await;
        match latest.and_then(|record| parse_uuid(&record.uuid)) {
            Some(ran_at) if ran_at >= cutoff => fresh.push(name),
            _ => stale.push(name),
        }
    }

    let mut check = connection.check_result("result_freshness");
    check.status = if stale.is_empty() { "PASS" } else { "WARN" }.to_string();
    check.summary = if stale.is_empty() {
        "All results are fresh".to_string()
    } else {
        format!("{} check(s) have no result within {}h", stale.len(), max_age_hours)
    };
    check.brief_output = json!(stale);
    check.full_output = json!({"fresh": fresh, "stale": stale});
    Ok(check)
}

async fn acknowledge_api_outage(
    connection: Connection,
    kwargs: Kwargs,
) -> anyhow::Result<RunResult> {
    let mut action = connection.action_result("acknowledge_api_outage");
    let check = action
        .get_associated_check_result(&kwargs)
        .await
        .ok_or_else(|| anyhow!("associated api_reachable result not found"))?;

    action.status = "DONE".to_string();
    action.description = format!("Acknowledged {} result {}", check.status, check.uuid);
    action.output = json!({
        "check_uuid": check.uuid,
        "check_status": check.status,
        "check_summary": check.summary,
    });
    Ok(action)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{CheckExecutor, RunOutcome};
    use crate::test_support::test_connection;
    use std::sync::Arc;

    fn executor() -> CheckExecutor {
        let mut registry = CheckRegistry::new();
        register(&mut registry).unwrap();
        CheckExecutor::new(Arc::new(registry), std::time::Duration::from_secs(10))
    }

    #[tokio::test]
    async fn test_api_reachable_fails_against_unreachable_api() {
        let connection = test_connection();
        let outcome = executor()
            .run_check(&connection, "system_checks/api_reachable", json!({}))
            .await
            .unwrap();
        let record = outcome.record().unwrap();
        assert_eq!(record.status, "FAIL");
        assert!(record.allow_action);
        assert_eq!(record.action.as_deref(), Some("acknowledge_api_outage"));
    }

    #[tokio::test]
    async fn test_result_freshness() {
        let connection = test_connection();
        let executor = executor();

        let outcome = executor
            .run_check(
                &connection,
                "system_checks/result_freshness",
                json!({"checks": ["api_reachable"]}),
            )
            .await
            .unwrap();
        assert_eq!(outcome.record().unwrap().status, "WARN");

        executor
            .run_check(&connection, "system_checks/api_reachable", json!({}))
            .await
            .unwrap();
        let outcome = executor
            .run_check(
                &connection,
                "system_checks/result_freshness",
                json!({"checks": ["api_reachable"]}),
            )
            .await
            .unwrap();
        let record = outcome.record().unwrap();
        assert_eq!(record.status, "PASS");
        assert_eq!(record.full_output["fresh"], json!(["api_reachable"]));
    }

    #[tokio::test]
    async fn test_acknowledge_api_outage_runs_once() {
        let connection = test_connection();
        let executor = executor();
        let check = executor
            .run_check(&connection, "system_checks/api_reachable", json!({}))
            .await
            .unwrap();
        let check = check.record().unwrap();

        let kwargs = json!({"check_name": "api_reachable", "called_by": check.uuid});
        let first = executor
            .run_action(&connection, "system_checks/acknowledge_api_outage", kwargs.clone())
            .await
            .unwrap();
        let action = first.record().unwrap();
        assert_eq!(action.status, "DONE");
        assert_eq!(action.output["check_status"], json!("FAIL"));

        let second = executor
            .run_action(&connection, "system_checks/acknowledge_api_outage", kwargs)
            .await
            .unwrap();
        assert!(matches!(second, RunOutcome::Skipped { .. }));
    }
}
