mod test_utils;

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use chrono::Utc;
use pipes::error::{ErrorKind, SyncError};
use pipes::integrations::ServiceError;
use pipes::models::{QueuedPipe, queued_pipe};
use pipes::queue::PRIORITY_MANUAL;
use pipes::repositories::{Authorization, IdMapping, IdMappingRepository, RunStatusRepository};
use pipes::status::RunState;
use pipes::sync::RunNowOutcome;
use pipes::types::{Client, EntityType, PipeId, TimeEntry};
use sea_orm::EntityTrait;
use test_utils::{Harness, LOG_HOST, SERVICE, fresh_token, mapping_of, project, task, test_config, user};

fn mappings(harness: &Harness) -> IdMappingRepository {
    IdMappingRepository::new(harness.db.clone())
}

async fn save_mapping(harness: &Harness, key: &str, pairs: &[(&str, i64)]) {
    let mut mapping = IdMapping::new(5, key);
    for (foreign, local) in pairs {
        mapping.insert(*foreign, *local);
    }
    mappings(harness).save(&mapping).await.unwrap();
}

fn time_entry(id: i64, user_id: i64, project_id: Option<i64>) -> TimeEntry {
    TimeEntry {
        id,
        user_id,
        project_id,
        start: Utc::now(),
        duration_in_seconds: 600,
        description: format!("entry {id}"),
        ..Default::default()
    }
}

#[tokio::test]
async fn inactive_items_are_forwarded_only_when_mapped() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    let pipe = harness.configure(5, EntityType::Tasks, false).await.unwrap();

    *harness.state.projects.lock().unwrap() = vec![project("p-1", true, None)];
    *harness.state.tasks.lock().unwrap() = vec![
        task("t-mapped", false, "p-1"),
        task("t-unmapped", false, "p-1"),
        task("t-active", true, "p-1"),
    ];
    save_mapping(&harness, "asana:tasks", &[("t-mapped", 7)]).await;

    let status = harness.orchestrator.run_pipe(5, &pipe).await.unwrap();
    assert_eq!(status.state, RunState::Success);
    assert_eq!(harness.central.posted("tasks"), 2);

    let tasks = mappings(&harness).load(5, "asana:tasks").await.unwrap();
    assert_eq!(tasks.local_id("t-mapped"), 7);
    assert!(tasks.local_id("t-active") > 0);
    assert_eq!(tasks.local_id("t-unmapped"), 0);
}

#[tokio::test]
async fn each_dependency_runs_once_per_run() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    let pipe = harness.configure(5, EntityType::Tasks, false).await.unwrap();

    harness.orchestrator.run_pipe(5, &pipe).await.unwrap();

    assert_eq!(
        harness.state.fetches(),
        vec![EntityType::Clients, EntityType::Projects, EntityType::Tasks]
    );
}

#[tokio::test]
async fn parent_references_resolve_through_mappings() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    let pipe = harness.configure(5, EntityType::Projects, false).await.unwrap();

    save_mapping(&harness, "asana:clients", &[("c-1", 42)]).await;
    *harness.state.projects.lock().unwrap() = vec![
        project("p-1", true, Some("c-1")),
        project("p-2", true, Some("c-unknown")),
    ];

    harness.orchestrator.run_pipe(5, &pipe).await.unwrap();

    let projects = mappings(&harness).load(5, "asana:projects").await.unwrap();
    assert_eq!(projects.len(), 2);
    assert_eq!(harness.central.posted("projects"), 2);
}

fn client(foreign_id: String, name: String) -> Client {
    Client {
        name,
        foreign_id,
        ..Default::default()
    }
}

#[tokio::test]
async fn large_imports_are_posted_in_chunks() {
    let mut config = test_config();
    config.sync.max_payload_bytes = 1024;
    let harness = Harness::with_config(config).await.unwrap();
    harness.authorize(5).await.unwrap();
    let pipe = harness.configure(5, EntityType::Clients, false).await.unwrap();
    *harness.state.clients.lock().unwrap() = (0..40)
        .map(|i| client(format!("c-{i:02}"), format!("Client c-{i:02}")))
        .collect();

    let status = harness.orchestrator.run_pipe(5, &pipe).await.unwrap();

    assert_eq!(status.state, RunState::Success);
    assert_eq!(status.object_counts, vec!["40 clients"]);
    let chunks: Vec<usize> = harness
        .central
        .posts
        .lock()
        .unwrap()
        .iter()
        .filter(|(name, _)| *name == "clients")
        .map(|(_, count)| *count)
        .collect();
    assert!(chunks.len() > 1, "expected several posts, got {chunks:?}");
    assert_eq!(harness.central.posted("clients"), 40);

    // Every chunk's results land in one mapping, in posting order.
    let stored = mappings(&harness).load(5, "asana:clients").await.unwrap();
    assert_eq!(stored.len(), 40);
    for i in 0..40 {
        assert_eq!(stored.local_id(&format!("c-{i:02}")), 100 + i);
    }
}

#[tokio::test]
async fn oversized_item_fails_the_run() {
    let mut config = test_config();
    config.sync.max_payload_bytes = 1024;
    let harness = Harness::with_config(config).await.unwrap();
    harness.authorize(5).await.unwrap();
    let pipe = harness.configure(5, EntityType::Clients, false).await.unwrap();
    *harness.state.clients.lock().unwrap() = vec![
        client("c-small".to_string(), "Small".to_string()),
        client("c-huge".to_string(), "x".repeat(2_000)),
    ];

    let status = harness.orchestrator.run_pipe(5, &pipe).await.unwrap();

    assert_eq!(status.state, RunState::Error);
    assert!(status.message.contains("above the 1024 byte limit"), "{}", status.message);
    assert_eq!(harness.central.posted("clients"), 0);
    assert_eq!(harness.notifier.messages().len(), 1);
    assert!(mappings(&harness).load(5, "asana:clients").await.unwrap().is_empty());

    let stored = harness.orchestrator.pipe(5, &pipe).await.unwrap();
    assert!(stored.last_sync.is_none());
}

#[tokio::test]
async fn successful_run_records_status_and_last_sync() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    let pipe = harness.configure(5, EntityType::Projects, false).await.unwrap();
    *harness.state.projects.lock().unwrap() = vec![project("p-1", true, None), project("p-2", true, None)];
    *harness.central.notifications.lock().unwrap() = vec!["Project limit almost reached".to_string()];

    let before = Utc::now();
    let status = harness.orchestrator.run_pipe(5, &pipe).await.unwrap();

    assert_eq!(status.object_counts, vec!["2 projects"]);
    assert_eq!(status.message, "2 projects successfully imported");
    assert_eq!(
        status.sync_log,
        format!("{LOG_HOST}/api/v1/integrations/asana/pipes/projects/log")
    );
    assert!(status.notifications.contains(&"Project limit almost reached".to_string()));

    let stored = harness.orchestrator.pipe(5, &pipe).await.unwrap();
    assert!(stored.configured);
    assert!(stored.last_sync.unwrap() >= before - chrono::Duration::seconds(1));
    assert_eq!(stored.status.unwrap().state, RunState::Success);

    let log = harness.orchestrator.pipe_log(5, &pipe).await.unwrap().unwrap();
    assert!(log.starts_with("Log for asana projects ("));
    assert!(log.contains("2 projects successfully imported"));

    // The next run asks the adapter only for changes since the last one.
    harness.orchestrator.run_pipe(5, &pipe).await.unwrap();
    let since = harness.state.since.lock().unwrap().clone();
    assert_eq!(since.first(), Some(&None));
    assert!(since.last().unwrap().is_some());
}

#[tokio::test]
async fn adapter_failure_is_recorded_and_reported() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    let pipe = harness.configure(5, EntityType::Tasks, false).await.unwrap();
    *harness.state.fail_fetch.lock().unwrap() = Some(ServiceError::Http {
        status: 503,
        body: None,
    });

    let status = harness.orchestrator.run_pipe(5, &pipe).await.unwrap();

    assert_eq!(status.state, RunState::Error);
    assert!(status.message.contains("503"));
    assert!(status.object_counts.is_empty());
    // The first failing stage stops the run.
    assert_eq!(harness.state.fetches(), vec![EntityType::Clients]);
    assert_eq!(harness.notifier.messages().len(), 1);

    let stored = harness.orchestrator.pipe(5, &pipe).await.unwrap();
    assert!(stored.last_sync.is_none());
    assert_eq!(stored.status.unwrap().state, RunState::Error);
}

#[tokio::test]
async fn missing_authorization_fails_background_run() {
    let harness = Harness::new().await.unwrap();
    let pipe = harness.configure(5, EntityType::Clients, false).await.unwrap();

    let status = harness.orchestrator.run_pipe(5, &pipe).await.unwrap();
    assert_eq!(status.state, RunState::Error);
    assert!(status.message.contains("no authorization"));
    assert!(harness.state.fetches().is_empty());
}

#[tokio::test]
async fn expired_token_is_refreshed_once_per_run() {
    let harness = Harness::new().await.unwrap();
    let expired = pipes::oauth::OAuth2Token {
        expiry: Some(Utc::now() - chrono::Duration::hours(1)),
        ..fresh_token("stale")
    };
    let auth = Authorization::oauth2(5, SERVICE, "workspace-token", &expired).unwrap();
    harness.credentials.save(&auth).await.unwrap();
    let pipe = harness.configure(5, EntityType::Tasks, false).await.unwrap();

    let status = harness.orchestrator.run_pipe(5, &pipe).await.unwrap();
    assert_eq!(status.state, RunState::Success);
    assert_eq!(harness.oauth.refreshes.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn time_entry_export_continues_past_failures() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    let pipe = harness.configure(5, EntityType::TimeEntries, false).await.unwrap();

    save_mapping(&harness, "asana:users", &[("u-1", 10)]).await;
    save_mapping(&harness, "asana:projects", &[("p-1", 20)]).await;
    *harness.central.time_entries.lock().unwrap() = vec![
        time_entry(1, 10, Some(20)),
        time_entry(2, 10, None),
        time_entry(3, 10, Some(20)),
    ];
    harness.state.failing_entries.lock().unwrap().insert(2);

    let status = harness.orchestrator.run_pipe(5, &pipe).await.unwrap();

    assert_eq!(status.state, RunState::Success);
    assert_eq!(status.object_counts, vec!["2 timeentries"]);
    assert_eq!(status.notifications.len(), 1);
    assert!(status.notifications[0].contains("Time entry 2"));
    assert_eq!(harness.notifier.messages().len(), 1);

    let exported = harness.state.exported.lock().unwrap().clone();
    assert_eq!(exported.len(), 2);
    assert_eq!(exported[0].foreign_user_id.as_deref(), Some("u-1"));
    assert_eq!(exported[0].foreign_project_id.as_deref(), Some("p-1"));

    let entries = mappings(&harness).load(5, "asana:timeentries").await.unwrap();
    assert_eq!(
        entries.data,
        mapping_of(&[("foreign-entry-1", 1), ("foreign-entry-3", 3)])
    );

    let queries = harness.central.time_entry_queries.lock().unwrap().clone();
    let (since, users, projects) = &queries[0];
    assert_eq!(users, &vec![10]);
    assert_eq!(projects, &vec![20]);
    let lookback = Utc::now() - *since;
    assert!(lookback >= chrono::Duration::days(29) && lookback <= chrono::Duration::days(31));
}

#[tokio::test]
async fn time_entries_wait_for_imported_users() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    let pipe = harness.configure(5, EntityType::TimeEntries, false).await.unwrap();

    let status = harness.orchestrator.run_pipe(5, &pipe).await.unwrap();

    assert_eq!(status.state, RunState::Success);
    assert_eq!(status.notifications.len(), 1);
    assert!(harness.central.time_entry_queries.lock().unwrap().is_empty());
}

#[tokio::test]
async fn runs_in_one_workspace_never_overlap() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    let users = harness.configure(5, EntityType::Users, false).await.unwrap();
    let clients = harness.configure(5, EntityType::Clients, false).await.unwrap();
    *harness.state.fetch_delay.lock().unwrap() = Duration::from_millis(50);

    let orchestrator = Arc::clone(&harness.orchestrator);
    let scheduled = tokio::spawn(async move { orchestrator.run_pipe(5, &clients).await });
    let manual = harness.orchestrator.run_now(5, &users).await.unwrap();

    assert!(matches!(manual, RunNowOutcome::Finished(_)));
    scheduled.await.unwrap().unwrap();
    assert_eq!(harness.state.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn different_workspaces_run_in_parallel() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    let auth = Authorization::oauth2(6, SERVICE, "ws6", &fresh_token("a")).unwrap();
    harness.credentials.save(&auth).await.unwrap();
    let five = harness.configure(5, EntityType::Clients, false).await.unwrap();
    let six = harness.configure(6, EntityType::Clients, false).await.unwrap();
    *harness.state.fetch_delay.lock().unwrap() = Duration::from_millis(200);

    let (a, b) = tokio::join!(
        harness.orchestrator.run_pipe(5, &five),
        harness.orchestrator.run_pipe(6, &six)
    );
    a.unwrap();
    b.unwrap();
    assert_eq!(harness.state.max_active.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn run_now_waits_for_user_pipes() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    let pipe = harness.configure(5, EntityType::Users, false).await.unwrap();
    *harness.state.users.lock().unwrap() = vec![user("u-1"), user("u-2")];

    match harness.orchestrator.run_now(5, &pipe).await.unwrap() {
        RunNowOutcome::Finished(status) => {
            assert_eq!(status.state, RunState::Success);
            assert_eq!(status.object_counts, vec!["2 users"]);
        }
        other => panic!("expected a finished run, got {other:?}"),
    }
}

#[tokio::test]
async fn run_now_records_its_run_in_the_queue() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    let pipe = harness.configure(5, EntityType::Users, false).await.unwrap();

    let outcome = harness.orchestrator.run_now(5, &pipe).await.unwrap();
    assert!(matches!(outcome, RunNowOutcome::Finished(_)));

    let rows = QueuedPipe::find().all(&harness.db).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].pipe_key, "asana:users");
    assert!(rows[0].completed_at.is_some());
    assert!(rows[0].claimed_by.as_deref().unwrap().starts_with("manual-"));
}

#[tokio::test]
async fn run_now_yields_to_a_run_claimed_elsewhere() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    let pipe = harness.configure(5, EntityType::Users, false).await.unwrap();
    harness.configure(5, EntityType::Clients, true).await.unwrap();
    let queue = harness.orchestrator.queue();
    queue.enqueue_automatic().await.unwrap();
    // Another process holds the workspace through its queue claim.
    assert_eq!(queue.claim_batch("other-process").await.unwrap().len(), 1);

    let outcome = harness.orchestrator.run_now(5, &pipe).await.unwrap();

    assert_eq!(outcome, RunNowOutcome::Queued);
    assert!(harness.state.fetches().is_empty());
    let rows = QueuedPipe::find().all(&harness.db).await.unwrap();
    let pending = rows
        .iter()
        .find(|row| row.pipe_key == "asana:users")
        .expect("users run should be queued");
    assert!(pending.claimed_at.is_none());
    assert_eq!(pending.priority, PRIORITY_MANUAL);
}

#[tokio::test]
async fn run_now_reports_in_progress_after_wait() {
    let mut config = test_config();
    config.sync.run_now_wait_ms = 20;
    let harness = Harness::with_config(config).await.unwrap();
    harness.authorize(5).await.unwrap();
    let pipe = harness.configure(5, EntityType::Users, false).await.unwrap();
    *harness.state.fetch_delay.lock().unwrap() = Duration::from_millis(300);

    let outcome = harness.orchestrator.run_now(5, &pipe).await.unwrap();
    assert_eq!(outcome, RunNowOutcome::InProgress);

    // The background run still finishes and holds the workspace lock meanwhile.
    let status = harness.orchestrator.run_pipe(5, &pipe).await.unwrap();
    assert_eq!(status.state, RunState::Success);
    assert_eq!(harness.state.fetches().len(), 2);
    assert_eq!(harness.state.max_active.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn run_now_surfaces_auth_errors() {
    let harness = Harness::new().await.unwrap();
    let pipe = harness.configure(5, EntityType::Users, false).await.unwrap();

    let err = harness.orchestrator.run_now(5, &pipe).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Auth);
    assert!(harness.state.fetches().is_empty());
}

#[tokio::test]
async fn run_now_queues_other_pipes_at_manual_priority() {
    let harness = Harness::new().await.unwrap();
    let pipe = harness.configure(5, EntityType::Projects, true).await.unwrap();

    let outcome = harness.orchestrator.run_now(5, &pipe).await.unwrap();
    assert_eq!(outcome, RunNowOutcome::Queued);

    let rows = QueuedPipe::find().all(&harness.db).await.unwrap();
    assert_eq!(rows.len(), 1);
    assert_eq!(rows[0].priority, PRIORITY_MANUAL);
    assert!(harness.state.fetches().is_empty());
}

#[tokio::test]
async fn unconfigured_pipes_are_rejected() {
    let harness = Harness::new().await.unwrap();
    let pipe = PipeId::new(SERVICE, EntityType::Users);

    assert!(matches!(
        harness.orchestrator.run_now(5, &pipe).await,
        Err(SyncError::NotConfigured { workspace_id: 5, .. })
    ));
    assert!(matches!(
        harness.orchestrator.run_pipe(5, &pipe).await,
        Err(SyncError::NotConfigured { .. })
    ));
    assert!(matches!(
        harness.orchestrator.delete_pipe(5, &pipe).await,
        Err(SyncError::NotConfigured { .. })
    ));
}

#[tokio::test]
async fn configure_validates_requests() {
    let harness = Harness::new().await.unwrap();
    let orchestrator = &harness.orchestrator;

    let bad_params = orchestrator
        .configure_pipe(5, &PipeId::new(SERVICE, EntityType::Projects), false, Some(b"{}".to_vec()))
        .await
        .unwrap_err();
    assert_eq!(bad_params.kind(), ErrorKind::Validation);

    let unsupported = orchestrator
        .configure_pipe(5, &PipeId::new("freshbooks", EntityType::Users), false, None)
        .await
        .unwrap_err();
    assert_eq!(unsupported.kind(), ErrorKind::Validation);

    let not_automatic = orchestrator
        .configure_pipe(5, &PipeId::new(SERVICE, EntityType::Users), true, None)
        .await
        .unwrap_err();
    assert_eq!(not_automatic.kind(), ErrorKind::Validation);

    let unknown = orchestrator
        .configure_pipe(5, &PipeId::new("trello", EntityType::Users), false, None)
        .await
        .unwrap_err();
    assert_eq!(unknown.kind(), ErrorKind::Validation);

    assert!(orchestrator.list_pipes(5).await.unwrap().is_empty());
}

#[tokio::test]
async fn configure_keeps_params_on_update() {
    let harness = Harness::new().await.unwrap();
    let id = PipeId::new(SERVICE, EntityType::Projects);
    let params = br#"{"account_id":"acme"}"#.to_vec();

    harness
        .orchestrator
        .configure_pipe(5, &id, false, Some(params.clone()))
        .await
        .unwrap();
    let updated = harness
        .orchestrator
        .configure_pipe(5, &id, true, None)
        .await
        .unwrap();

    assert!(updated.automatic);
    assert_eq!(updated.service_params, Some(params));
}

#[tokio::test]
async fn delete_removes_status_mapping_and_queue_entry() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    let id = PipeId::new(SERVICE, EntityType::Projects);
    harness
        .orchestrator
        .configure_pipe(5, &id, true, Some(br#"{"account_id":"acme"}"#.to_vec()))
        .await
        .unwrap();
    *harness.state.projects.lock().unwrap() = vec![project("p-1", true, None)];
    harness.orchestrator.run_pipe(5, &id).await.unwrap();
    harness.orchestrator.queue().boost_and_enqueue(5, &id).await.unwrap();

    let mapping_key = "asana:acme:projects";
    assert_eq!(mappings(&harness).load(5, mapping_key).await.unwrap().len(), 1);

    harness.orchestrator.delete_pipe(5, &id).await.unwrap();

    let statuses = RunStatusRepository::new(harness.db.clone(), LOG_HOST);
    assert!(statuses.load(5, &id).await.unwrap().is_none());
    assert!(mappings(&harness).load(5, mapping_key).await.unwrap().is_empty());
    assert_eq!(harness.orchestrator.queue().pending_count().await.unwrap(), 0);
    assert!(!harness.orchestrator.pipe(5, &id).await.unwrap().configured);
    assert!(harness.orchestrator.list_pipes(5).await.unwrap().is_empty());
    let rows: Vec<queued_pipe::Model> = QueuedPipe::find().all(&harness.db).await.unwrap();
    assert!(rows.is_empty());
}

#[tokio::test]
async fn workspace_integrations_show_authorization_and_pipes() {
    let harness = Harness::new().await.unwrap();
    harness.authorize(5).await.unwrap();
    harness.configure(5, EntityType::Projects, true).await.unwrap();

    let integrations = harness.orchestrator.workspace_integrations(5).await.unwrap();
    let ids: Vec<&str> = integrations.iter().map(|i| i.integration.id.as_str()).collect();
    assert_eq!(ids, vec!["asana", "freshbooks"]);

    let asana = &integrations[0];
    assert!(asana.authorized);
    assert_eq!(asana.pipes.len(), EntityType::ALL.len());
    let projects = asana
        .pipes
        .iter()
        .find(|p| p.id.entity == EntityType::Projects)
        .unwrap();
    assert!(projects.configured && projects.automatic);
    assert!(asana
        .pipes
        .iter()
        .filter(|p| p.id.entity != EntityType::Projects)
        .all(|p| !p.configured));

    assert!(!integrations[1].authorized);
}
