mod support;

use anyhow::Context;
use serde_json::json;
use support::{graph, seed_people, server, transaction_count};
use tandem_graph::{Error, Reference, Target, TransactionBuilder, Verb};

#[tokio::test]
async fn new_resources_reference_each_other_by_real_id() -> anyhow::Result<()> {
    let server = server();
    seed_people(&server);
    let graph = graph(&server);

    let mut builder = TransactionBuilder::new();
    let goal = builder.create(json!({ "resourceType": "Goal", "lifecycleStatus": "proposed" }));
    let condition = builder.create(json!({ "resourceType": "Condition", "code": { "text": "Food insecurity" } }));
    builder
        .link(goal, "addresses[]", condition)
        .link(goal, "subject", Target::existing("Patient", "P1"))
        .link(condition, "subject", Target::existing("Patient", "P1"));
    let request = builder.build()?;

    // The referenced Condition is written first.
    assert_eq!(request.operations()[0].local_id, condition);

    let result = graph.submit(&request).await?;
    assert_eq!(result.len(), 2);
    let goal = result.get(goal).context("goal identity")?;
    let condition = result.get(condition).context("condition identity")?;
    assert_eq!(goal.verb, Verb::Create);
    assert_ne!(goal.id, condition.id);

    let stored_goal = server.get("Goal", &goal.id).context("stored goal")?;
    let target = Reference::from_json(&stored_goal["addresses"][0]).context("goal.addresses")?;
    assert_eq!(target, condition.reference());
    assert!(server.get("Condition", &condition.id).is_some());
    assert_eq!(stored_goal["subject"]["reference"], "Patient/P1");
    Ok(())
}

#[tokio::test]
async fn dangling_placeholder_fails_before_any_request() -> anyhow::Result<()> {
    let server = server();

    let mut unrelated = TransactionBuilder::new();
    let foreign = unrelated.create(json!({ "resourceType": "Patient" }));

    let mut builder = TransactionBuilder::new();
    let goal = builder.create(json!({ "resourceType": "Goal" }));
    builder.link(goal, "subject", foreign);

    assert!(matches!(builder.build(), Err(Error::InvalidSpec(_))));
    assert!(server.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn failing_entry_rolls_back_the_whole_transaction() -> anyhow::Result<()> {
    let server = server();
    seed_people(&server);
    let graph = graph(&server);

    let mut builder = TransactionBuilder::new();
    builder.create(json!({ "resourceType": "Goal" }));
    builder.read("Practitioner", "nobody");
    let request = builder.build()?;

    let err = graph.submit(&request).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert_eq!(server.count("Goal"), 0);
    assert_eq!(transaction_count(&server), 1);
    Ok(())
}

#[tokio::test]
async fn reads_and_updates_keep_their_ids() -> anyhow::Result<()> {
    let server = server();
    seed_people(&server);
    let graph = graph(&server);

    let mut builder = TransactionBuilder::new();
    let patient = builder.read("Patient", "P1");
    let organization = builder.update(json!({
        "resourceType": "Organization",
        "id": "O1",
        "name": "Community Housing Services of the Valley"
    }));
    let result = graph.submit(&builder.build()?).await?;

    assert_eq!(result.get(patient).context("patient")?.id, "P1");
    let organization = result.get(organization).context("organization")?;
    assert_eq!(organization.id, "O1");
    assert_eq!(organization.version_id.as_deref(), Some("2"));
    assert_eq!(
        server.get("Organization", "O1").context("stored")?["name"],
        "Community Housing Services of the Valley"
    );
    Ok(())
}
