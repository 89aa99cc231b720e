use std::sync::Arc;

use pgsandbox::cluster::{Cluster, ClusterState};
use pgsandbox::database::Database;
use pgsandbox::test_utils::cluster::connect;
use pgsandbox_telemetry::tracing::init_test_tracing;

use crate::sandbox_config;

async fn started_cluster() -> Option<Arc<Cluster>> {
    let config = sandbox_config()?;
    if config.is_external() {
        return None;
    }

    let cluster = Cluster::new(config);
    cluster.initialize().await.unwrap();
    cluster.start().await.unwrap();

    Some(Arc::new(cluster))
}

#[tokio::test(flavor = "multi_thread")]
async fn template_clones_carry_committed_data() {
    init_test_tracing();
    let Some(cluster) = started_cluster().await else {
        return;
    };
    let prefix = cluster.config().name_prefix.clone();
    let data_dir = cluster.data_dir().await.unwrap();

    let template = Database::new(cluster.clone(), cluster.create_instance(None).await.unwrap());
    assert_eq!(template.name(), format!("{prefix}1"));

    let client = connect(&template).await;
    client
        .batch_execute(
            "CREATE TABLE fixtures (id int PRIMARY KEY, label text NOT NULL);
             INSERT INTO fixtures VALUES (1, 'one'), (2, 'two');",
        )
        .await
        .unwrap();
    drop(client);

    let clone = Database::new(
        cluster.clone(),
        cluster
            .create_instance(Some(template.name()))
            .await
            .unwrap(),
    );
    assert_eq!(clone.name(), format!("{prefix}2"));

    let client = connect(&clone).await;
    let labels: Vec<String> = client
        .query("SELECT label FROM fixtures ORDER BY id", &[])
        .await
        .unwrap()
        .iter()
        .map(|row| row.get(0))
        .collect();
    assert_eq!(labels, vec!["one".to_owned(), "two".to_owned()]);
    drop(client);

    // The second clone comes from the preload buffer.
    let preloaded = cluster
        .create_instance(Some(template.name()))
        .await
        .unwrap();
    assert_eq!(preloaded, format!("{prefix}3"));

    clone.drop_instance().await.unwrap();
    cluster.drop_instance(&preloaded).await.unwrap();
    template.drop_instance().await.unwrap();

    cluster.stop().await.unwrap();
    assert_eq!(cluster.state().await, ClusterState::Stopped);

    cluster.cleanup().await.unwrap();
    cluster.cleanup().await.unwrap();
    assert_eq!(cluster.state().await, ClusterState::Uninitialized);
    assert!(!data_dir.exists());
}

#[tokio::test(flavor = "multi_thread")]
async fn restarted_cluster_keeps_its_instances() {
    init_test_tracing();
    let Some(cluster) = started_cluster().await else {
        return;
    };

    let first = cluster.create_instance(None).await.unwrap();
    cluster.stop().await.unwrap();
    cluster.start().await.unwrap();

    let second = cluster.create_instance(None).await.unwrap();
    assert_ne!(first, second);

    cluster.drop_instance(&first).await.unwrap();
    cluster.drop_instance(&second).await.unwrap();
    cluster.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn transaction_commits_mark_the_database_dirty() {
    init_test_tracing();
    let Some(cluster) = started_cluster().await else {
        return;
    };

    let database = Database::new(cluster.clone(), cluster.create_instance(None).await.unwrap());
    connect(&database)
        .await
        .batch_execute("CREATE TABLE touched (id int)")
        .await
        .unwrap();
    let mut client = database.dirty_on_commit(connect(&database).await);
    assert!(!database.is_dirty());

    let transaction = client.transaction().await.unwrap();
    transaction
        .execute("INSERT INTO touched VALUES (1)", &[])
        .await
        .unwrap();
    transaction.rollback().await.unwrap();
    assert!(!database.is_dirty());

    let transaction = client.transaction().await.unwrap();
    transaction
        .execute("INSERT INTO touched VALUES (2)", &[])
        .await
        .unwrap();
    assert!(!database.is_dirty());
    transaction.commit().await.unwrap();
    assert!(database.is_dirty());

    drop(client);
    database.drop_instance().await.unwrap();
    cluster.cleanup().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn autocommitted_statements_mark_the_database_dirty() {
    init_test_tracing();
    let Some(cluster) = started_cluster().await else {
        return;
    };

    let database = Database::new(cluster.clone(), cluster.create_instance(None).await.unwrap());
    let client = database.dirty_on_commit(connect(&database).await);

    assert!(
        client
            .execute("INSERT INTO missing VALUES (1)", &[])
            .await
            .is_err()
    );
    assert!(!database.is_dirty());

    client
        .batch_execute("CREATE TABLE touched (id int)")
        .await
        .unwrap();
    assert!(database.is_dirty());

    database.reset_dirty();
    let inserted = client
        .execute("INSERT INTO touched VALUES ($1)", &[&7_i32])
        .await
        .unwrap();
    assert_eq!(inserted, 1);
    assert!(database.is_dirty());

    // Inside a plain BEGIN block the explicit commit still marks the database.
    client.batch_execute("BEGIN").await.unwrap();
    client
        .execute("INSERT INTO touched VALUES (8)", &[])
        .await
        .unwrap();
    database.reset_dirty();
    client.commit().await.unwrap();
    assert!(database.is_dirty());

    let rows = connect(&database)
        .await
        .query("SELECT id FROM touched ORDER BY id", &[])
        .await
        .unwrap();
    assert_eq!(rows.len(), 2);

    drop(client.into_inner());
    database.drop_instance().await.unwrap();
    cluster.cleanup().await.unwrap();
}
