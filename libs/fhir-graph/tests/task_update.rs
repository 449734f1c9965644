mod support;

use anyhow::Context;
use support::{graph, seed_referral, server, transaction_count};
use tandem_graph::{Error, TaskStatus, TaskUpdate};

#[tokio::test]
async fn status_change_is_written_and_reloaded() -> anyhow::Result<()> {
    let server = server();
    seed_referral(&server);

    let update = TaskUpdate {
        status: Some(TaskStatus::Accepted),
        status_reason: None,
        comment: Some("Accepted by the housing team".to_string()),
    };
    let resources = graph(&server).update_task("T1", &update).await?;

    assert_eq!(resources.task["status"], "accepted");
    assert_eq!(resources.task["note"][0]["text"], "Accepted by the housing team");
    assert_eq!(resources.task["meta"]["versionId"], "2");
    assert_eq!(resources.goals.len(), 1);
    assert_eq!(transaction_count(&server), 1);
    Ok(())
}

#[tokio::test]
async fn comment_only_leaves_the_status_alone() -> anyhow::Result<()> {
    let server = server();
    seed_referral(&server);

    let update = TaskUpdate {
        comment: Some("Left a voicemail".to_string()),
        ..TaskUpdate::default()
    };
    graph(&server).update_task("T1", &update).await?;

    let stored = server.get("Task", "T1").context("stored task")?;
    assert_eq!(stored["status"], "requested");
    assert_eq!(stored["note"][0]["text"], "Left a voicemail");
    assert!(stored.get("lastModified").is_none());
    Ok(())
}

#[tokio::test]
async fn invalid_updates_never_reach_the_server() -> anyhow::Result<()> {
    let server = server();
    seed_referral(&server);
    let graph = graph(&server);

    let cancel = TaskUpdate {
        status: Some(TaskStatus::Cancelled),
        ..TaskUpdate::default()
    };
    assert!(matches!(
        graph.update_task("T1", &cancel).await,
        Err(Error::Validation(_))
    ));
    assert!(matches!(
        graph.update_task("T1", &TaskUpdate::default()).await,
        Err(Error::Validation(_))
    ));
    assert!(server.requests().is_empty());
    Ok(())
}

#[tokio::test]
async fn cancelling_records_the_reason() -> anyhow::Result<()> {
    let server = server();
    seed_referral(&server);

    let cancel = TaskUpdate {
        status: Some(TaskStatus::Cancelled),
        status_reason: Some("Patient moved out of the service area".to_string()),
        comment: None,
    };
    let resources = graph(&server).update_task("T1", &cancel).await?;
    assert_eq!(resources.task["status"], "cancelled");
    assert_eq!(
        resources.task["statusReason"]["text"],
        "Patient moved out of the service area"
    );
    Ok(())
}
