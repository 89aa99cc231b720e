use std::sync::Arc;

use pgsandbox::resources::{
    ClusterManager, DatabaseDependencies, DatabaseManager, ResourceManager, SandboxContext,
};
use pgsandbox::test_utils::cluster::{connect, test_config};
use pgsandbox_telemetry::tracing::init_test_tracing;

use crate::sandbox_config;

#[tokio::test(flavor = "multi_thread")]
async fn managers_build_and_tear_down_template_clones() {
    init_test_tracing();
    if sandbox_config().is_none() {
        return;
    }

    let context = Arc::new(SandboxContext::new(test_config()).unwrap());
    let clusters = ClusterManager::new(context);
    let templates: Arc<DatabaseManager> = Arc::new(DatabaseManager::new());
    let databases: DatabaseManager = DatabaseManager::new().with_template(templates.clone());

    let cluster = clusters.make(()).await.unwrap();
    let template = templates
        .make(DatabaseDependencies {
            cluster: cluster.clone(),
            template: None,
        })
        .await
        .unwrap();

    let client = connect(&template).await;
    client
        .batch_execute("CREATE TABLE seeded (id int); INSERT INTO seeded VALUES (42);")
        .await
        .unwrap();
    drop(client);

    let database = databases
        .make(DatabaseDependencies {
            cluster: cluster.clone(),
            template: Some(template.clone()),
        })
        .await
        .unwrap();
    assert!(!databases.is_dirty(&database));

    let client = connect(&database).await;
    let row = client.query_one("SELECT id FROM seeded", &[]).await.unwrap();
    assert_eq!(row.get::<_, i32>(0), 42);
    drop(client);

    database.mark_dirty();
    assert!(databases.is_dirty(&database));

    databases.clean(database).await.unwrap();
    templates.clean(template).await.unwrap();
    clusters.clean(cluster).await.unwrap();
}
