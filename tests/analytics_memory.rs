use anyhow::Result;
use kpistore::filters::{CommonFilterMap, TenantFilterMap};
use kpistore::pipeline::{DateRange, WipCriteria, WipStatuses};
use kpistore::repository::DailyCommitCount;
use kpistore::tracing::QueryTrace;
use kpistore::{
    AnalyticsRepository, BatchResultExt, CapacityFoldEngine, CriteriaMode, Error, MemoryExecutor,
};
use serde_json::{Value, json};

fn tenants(value: Value) -> TenantFilterMap {
    serde_json::from_value(value).unwrap()
}

fn commits() -> Vec<Value> {
    vec![
        json!({"sha": "a1", "basicProjectConfigId": "p1", "authorId": "u1", "repositoryName": "api", "commitTimestamp": 1704103200000_i64}),
        json!({"sha": "a2", "basicProjectConfigId": "p1", "authorId": "u2", "repositoryName": "web", "commitTimestamp": 1704123000000_i64}),
        json!({"sha": "a3", "basicProjectConfigId": "p1", "authorId": "u1", "repositoryName": "web", "commitTimestamp": 1704186000000_i64}),
        // other tenant, same day
        json!({"sha": "b1", "basicProjectConfigId": "p2", "authorId": "u3", "repositoryName": "api", "commitTimestamp": 1704103200000_i64}),
        // outside the window
        json!({"sha": "a4", "basicProjectConfigId": "p1", "authorId": "u1", "repositoryName": "api", "commitTimestamp": 1704326400000_i64}),
    ]
}

fn repo() -> AnalyticsRepository<MemoryExecutor> {
    let executor = MemoryExecutor::new()
        .with_collection("commit_details", commits())
        .with_collection(
            "user_info",
            [
                json!({"id": "u1", "email": "ana@example.com"}),
                json!({"id": "u2", "email": "bo@example.com"}),
            ],
        );
    AnalyticsRepository::new(executor)
}

#[tokio::test]
async fn daily_commit_stats_bucket_by_utc_day() -> Result<()> {
    let range = DateRange::new(1704067200000_i64, 1704239999000_i64);
    let rows = repo().daily_commit_stats(["p1"], &range).await?;
    assert_eq!(
        rows,
        vec![
            DailyCommitCount {
                date: "2024-01-01".into(),
                tenant_id: "p1".into(),
                count: 2
            },
            DailyCommitCount {
                date: "2024-01-02".into(),
                tenant_id: "p1".into(),
                count: 1
            },
        ]
    );
    Ok(())
}

#[tokio::test]
async fn empty_tenant_list_is_rejected_before_querying() -> Result<()> {
    let range = DateRange::new(1704067200000_i64, 1704239999000_i64);
    let err = repo()
        .daily_commit_stats(Vec::<String>::new(), &range)
        .await
        .unwrap_err();
    assert!(matches!(err, Error::MissingTenants));
    Ok(())
}

#[tokio::test]
async fn author_rollup_counts_commits_and_repositories() -> Result<()> {
    let range = DateRange::new(1704067200000_i64, 1704239999000_i64);
    let rows = repo().author_rollup(["p1", "p2"], &range).await?;
    assert_eq!(rows.len(), 3);
    let top = &rows[0];
    assert_eq!(top.tenant_id, "p1");
    assert_eq!(top.author.as_deref(), Some("u1"));
    assert_eq!(top.commits, 2);
    assert_eq!(top.repositories, ["api", "web"]);
    Ok(())
}

#[tokio::test]
async fn commits_carry_joined_authors() -> Result<()> {
    let rows = repo().commits_with_authors(["p1"]).await?;
    assert_eq!(rows.len(), 4);
    assert_eq!(rows[0]["authorDetails"][0]["email"], json!("ana@example.com"));
    assert_eq!(rows[1]["authorDetails"][0]["email"], json!("bo@example.com"));
    Ok(())
}

#[tokio::test]
async fn wip_includes_open_and_recently_closed_issues() -> Result<()> {
    let issues = vec![
        json!({"key": "OPEN-1", "basicProjectConfigId": "p1", "issueType": "Story", "status": "In Progress", "updateDate": "2024-01-10T08:00:00"}),
        json!({"key": "DONE-1", "basicProjectConfigId": "p1", "issueType": "Story", "status": "Done", "updateDate": "2024-01-15T12:00:00"}),
        json!({"key": "DONE-OLD", "basicProjectConfigId": "p1", "issueType": "Story", "status": "Done", "updateDate": "2023-12-20T12:00:00"}),
        json!({"key": "OPEN-LATE", "basicProjectConfigId": "p1", "issueType": "Story", "status": "In Progress", "updateDate": "2024-02-05T12:00:00"}),
        json!({"key": "BUG-1", "basicProjectConfigId": "p1", "issueType": "Bug", "status": "In Progress", "updateDate": "2024-01-10T08:00:00"}),
        json!({"key": "OTHER-1", "basicProjectConfigId": "p2", "issueType": "Story", "status": "In Progress", "updateDate": "2024-01-10T08:00:00"}),
    ];
    let repo = AnalyticsRepository::new(MemoryExecutor::new().with_collection("jira_issue", issues));

    let common: CommonFilterMap = [("issueType".to_string(), vec![json!("Story")])]
        .into_iter()
        .collect();
    let criteria = WipCriteria::new(DateRange::new("2024-01-01T00:00:00", "2024-01-31T23:59:59"))
        .tenant(
            "p1",
            WipStatuses {
                wip: vec!["In Progress".into()],
                closed: vec!["Done".into()],
            },
        );

    let rows = repo
        .wip_issues(
            &common,
            &tenants(json!({"p1": {}})),
            CriteriaMode::In,
            &criteria,
        )
        .await?;
    let keys: Vec<&str> = rows.iter().filter_map(|r| r["key"].as_str()).collect();
    assert_eq!(keys, ["OPEN-1", "DONE-1"]);
    Ok(())
}

#[tokio::test]
async fn sprint_capacity_is_folded_after_the_query() -> Result<()> {
    let docs = vec![
        json!({
            "basicProjectConfigId": "p1",
            "sprintId": "s1",
            "capacityPerSprint": 999.0,
            "additionalFilterCapacityList": [
                {"filterId": "Filter1", "nodeCapacityList": [
                    {"additionalFilterId": "node1", "additionalFilterCapacity": 100.0},
                    {"additionalFilterId": "node2", "additionalFilterCapacity": 50.0}
                ]}
            ]
        }),
        json!({"basicProjectConfigId": "p1", "sprintId": "s2", "capacityPerSprint": 40.0}),
        json!({"basicProjectConfigId": "p2", "sprintId": "s1", "capacityPerSprint": 10.0}),
    ];
    let trace = QueryTrace::new(16);
    let repo = AnalyticsRepository::new(
        MemoryExecutor::new().with_collection("capacity_kpi_data", docs),
    )
    .with_trace(trace.clone(), "req-1");

    let per_tenant = tenants(json!({"p1": {"sprintId": ["s1", "s2"]}}));
    let fold = CapacityFoldEngine::new(["FILTER1"], ["node1", "node2"]);
    let rows = repo
        .sprint_capacity(&CommonFilterMap::new(), &per_tenant, CriteriaMode::In, &fold)
        .await?;

    let totals: Vec<f64> = rows.iter().map(|r| r.capacity_per_sprint).collect();
    assert_eq!(totals, [150.0, 0.0]);
    assert_eq!(trace.len("req-1"), 4);
    assert!(trace.mermaid("req-1").contains("STORE->>FOLD"));
    assert!(trace.mermaid("req-1").contains(r#""total":150.0"#));
    Ok(())
}

#[tokio::test]
async fn criteria_mode_applies_per_call() -> Result<()> {
    let issues = vec![
        json!({"key": "K1", "basicProjectConfigId": "p1", "status": "Open", "rejectionStatus": "Won't Do"}),
        json!({"key": "K2", "basicProjectConfigId": "p1", "status": "Open"}),
        json!({"key": "K3", "basicProjectConfigId": "p1", "status": "Closed"}),
    ];
    let repo =
        AnalyticsRepository::new(MemoryExecutor::new().with_collection("jira_issue", issues));
    let per_tenant = tenants(json!({
        "p1": {"status": ["Open"], "rejectionStatus": ["Won't Do"]}
    }));
    let keys = |rows: Vec<Value>| -> Vec<String> {
        rows.iter()
            .filter_map(|r| r["key"].as_str().map(str::to_string))
            .collect()
    };

    // rejection fields exclude under the default mode
    let included = repo
        .find_filtered("jira_issue", &CommonFilterMap::new(), &per_tenant, CriteriaMode::In)
        .await?;
    // the same repository inverts for one call only
    let inverted = repo
        .find_filtered("jira_issue", &CommonFilterMap::new(), &per_tenant, CriteriaMode::Nin)
        .await?;
    let again = repo
        .find_filtered("jira_issue", &CommonFilterMap::new(), &per_tenant, CriteriaMode::In)
        .await?;

    assert_eq!(keys(included), ["K2"]);
    assert_eq!(keys(inverted), ["K3"]);
    assert_eq!(keys(again), ["K2"]);
    Ok(())
}

#[tokio::test]
async fn non_list_tenant_values_stay_errors_in_batches() -> Result<()> {
    let per_tenant = tenants(json!({"p1": {"status": "Open"}}));
    let result: kpistore::Result<Vec<Value>> = repo()
        .find_filtered("jira_issue", &CommonFilterMap::new(), &per_tenant, CriteriaMode::In)
        .await;
    let err = result.or_empty("p1").unwrap_err();
    assert!(matches!(err, Error::InvalidFilterValue { .. }));
    Ok(())
}

#[tokio::test]
async fn latest_for_tenant_returns_newest_first() -> Result<()> {
    let rows: Vec<Value> = repo()
        .latest_for_tenant("commit_details", "p1", "commitTimestamp", 2)
        .await?;
    let shas: Vec<&str> = rows.iter().filter_map(|r| r["sha"].as_str()).collect();
    assert_eq!(shas, ["a4", "a3"]);

    let err = repo()
        .latest_for_tenant::<Value>("commit_details", "p1", "commitTimestamp", 0)
        .await
        .unwrap_err();
    assert!(err.is_caller_contract());
    Ok(())
}
