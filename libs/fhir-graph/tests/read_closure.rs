mod support;

use serde_json::json;
use support::{graph, search_types, seed_referral, server};
use tandem_graph::memory::RecordedRequest;
use tandem_graph::{Error, LoadStrategy};

#[tokio::test]
async fn referral_without_consent_resolves_every_role() -> anyhow::Result<()> {
    let server = server();
    seed_referral(&server);

    let resources = graph(&server).task_resources("T1").await?;

    assert_eq!(resources.task["id"], "T1");
    assert_eq!(resources.service_request["id"], "S1");
    assert_eq!(resources.patient["id"], "P1");
    assert_eq!(resources.requester.as_ref().map(|r| &r["id"]), Some(&json!("O1")));
    assert!(resources.consent.is_none());
    assert_eq!(resources.conditions.len(), 1);
    assert_eq!(resources.conditions[0]["id"], "C1");
    assert_eq!(resources.goals.len(), 1);
    assert_eq!(resources.goals[0]["id"], "G1");
    assert!(resources.procedures.is_empty());

    // One include search for the task, then one read per missing type.
    let searches = search_types(&server);
    assert_eq!(searches.len(), 3);
    assert_eq!(searches[0], "Task");
    assert!(searches.contains(&"Condition".to_string()));
    assert!(searches.contains(&"Goal".to_string()));
    Ok(())
}

#[tokio::test]
async fn outputs_and_consent_are_loaded_once_per_type() -> anyhow::Result<()> {
    let server = server();
    seed_referral(&server);
    server.seed(json!({ "resourceType": "Consent", "id": "CN1", "patient": { "reference": "Patient/P1" } }));
    server.seed(json!({ "resourceType": "Condition", "id": "C2", "subject": { "reference": "Patient/P1" } }));
    server.seed(json!({ "resourceType": "Procedure", "id": "PR1", "subject": { "reference": "Patient/P1" } }));
    server.seed(json!({ "resourceType": "Procedure", "id": "PR2", "subject": { "reference": "Patient/P1" } }));
    server.seed(json!({
        "resourceType": "ServiceRequest",
        "id": "S1",
        "subject": { "reference": "Patient/P1" },
        "reasonReference": [
            { "reference": "Condition/C1" },
            { "reference": "Condition/C2" },
            { "reference": "Condition/C1" }
        ],
        "supportingInfo": [{ "reference": "Consent/CN1" }, { "reference": "Goal/G1" }]
    }));
    server.seed(json!({
        "resourceType": "Task",
        "id": "T1",
        "status": "completed",
        "focus": { "reference": "ServiceRequest/S1" },
        "for": { "reference": "Patient/P1" },
        "output": [
            { "type": { "text": "procedure" }, "valueReference": { "reference": "Procedure/PR1" } },
            { "type": { "text": "procedure" }, "valueReference": { "reference": "Procedure/PR2" } }
        ]
    }));

    let resources = graph(&server).task_resources("T1").await?;

    assert_eq!(resources.consent.as_ref().map(|c| &c["id"]), Some(&json!("CN1")));
    let condition_ids: Vec<&str> = resources
        .conditions
        .iter()
        .filter_map(|c| c["id"].as_str())
        .collect();
    assert_eq!(condition_ids, vec!["C1", "C2"]);
    assert_eq!(resources.procedures.len(), 2);
    assert!(resources.requester.is_none());

    let mut loaded = search_types(&server).split_off(1);
    loaded.sort();
    assert_eq!(loaded, vec!["Condition", "Consent", "Goal", "Procedure"]);
    Ok(())
}

#[tokio::test]
async fn batch_strategy_loads_in_one_round_trip() -> anyhow::Result<()> {
    let server = server();
    seed_referral(&server);

    let resources = graph(&server)
        .with_load_strategy(LoadStrategy::Batch)
        .task_resources("T1")
        .await?;
    assert_eq!(resources.goals.len(), 1);

    let requests = server.requests();
    assert_eq!(requests.len(), 2);
    assert_eq!(requests[1], RecordedRequest::Batch { entries: 2 });
    Ok(())
}

#[tokio::test]
async fn missing_task_or_focus_is_not_found() -> anyhow::Result<()> {
    let server = server();
    seed_referral(&server);
    server.seed(json!({
        "resourceType": "Task",
        "id": "T2",
        "focus": { "reference": "ServiceRequest/S404" },
        "for": { "reference": "Patient/P1" }
    }));
    let graph = graph(&server);

    match graph.task_resources("T404").await {
        Err(Error::ResourceNotFound { resource_type, id }) => {
            assert_eq!(resource_type, "Task");
            assert_eq!(id, "T404");
        }
        other => panic!("unexpected result: {other:?}"),
    }

    match graph.task_resources("T2").await {
        Err(Error::ResourceNotFound { resource_type, id }) => {
            assert_eq!(resource_type, "ServiceRequest");
            assert_eq!(id, "S404");
        }
        other => panic!("unexpected result: {other:?}"),
    }
    Ok(())
}

#[tokio::test]
async fn failed_load_returns_nothing() -> anyhow::Result<()> {
    let server = server();
    seed_referral(&server);
    server.fail_searches_for("Goal");

    let err = graph(&server).task_resources("T1").await.unwrap_err();
    assert!(matches!(err, Error::LoadFailure { ref resource_type, .. } if resource_type == "Goal"));
    Ok(())
}

#[tokio::test]
async fn roles_follow_the_declared_reference_fields() -> anyhow::Result<()> {
    let server = server();
    seed_referral(&server);
    server.seed(json!({ "resourceType": "Condition", "id": "C2", "subject": { "reference": "Patient/P1" } }));
    server.seed(json!({ "resourceType": "Goal", "id": "G2", "subject": { "reference": "Patient/P1" } }));
    server.seed(json!({
        "resourceType": "ServiceRequest",
        "id": "S1",
        "subject": { "reference": "Patient/P1" },
        "reasonReference": [{ "reference": "Condition/C1" }],
        "supportingInfo": [{ "reference": "Goal/G1" }, { "reference": "Condition/C2" }],
        "relevantHistory": [{ "reference": "Goal/G2" }]
    }));

    let resources = graph(&server).task_resources("T1").await?;

    let condition_ids: Vec<&str> = resources
        .conditions
        .iter()
        .filter_map(|c| c["id"].as_str())
        .collect();
    assert_eq!(condition_ids, vec!["C1", "C2"]);
    let goal_ids: Vec<&str> = resources.goals.iter().filter_map(|g| g["id"].as_str()).collect();
    assert_eq!(goal_ids, vec!["G1"]);

    let goal_reads: Vec<Vec<(String, String)>> = server
        .requests()
        .into_iter()
        .filter_map(|r| match r {
            RecordedRequest::Search { resource_type, params } if resource_type == "Goal" => {
                Some(params)
            }
            _ => None,
        })
        .collect();
    assert_eq!(goal_reads.len(), 1);
    assert!(goal_reads[0].contains(&("_id".to_string(), "G1".to_string())));
    Ok(())
}

#[tokio::test]
async fn paged_reads_fail_the_whole_closure() -> anyhow::Result<()> {
    let server = server();
    seed_referral(&server);
    server.seed(json!({ "resourceType": "Condition", "id": "C2", "subject": { "reference": "Patient/P1" } }));
    server.seed(json!({
        "resourceType": "ServiceRequest",
        "id": "S1",
        "subject": { "reference": "Patient/P1" },
        "reasonReference": [{ "reference": "Condition/C1" }, { "reference": "Condition/C2" }]
    }));
    server.set_max_page_size(1);

    let err = graph(&server).task_resources("T1").await.unwrap_err();
    assert!(
        matches!(err, Error::LoadFailure { ref resource_type, .. } if resource_type == "Condition")
    );
    Ok(())
}
