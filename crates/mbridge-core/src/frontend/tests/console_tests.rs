use std::time::Duration;

use crate::frontend::{ConsoleFrontend, Frontend};
use crate::plugin_system::registry::PluginStatus;
use crate::tests::fixtures::{Behavior, Harness, eventually};

const WAIT: Duration = Duration::from_secs(2);

#[tokio::test]
async fn test_console_tracks_plugin_views_through_the_bus() {
    let harness = Harness::new();
    harness.manager.attach_bus();
    let console = ConsoleFrontend::new(harness.bus.clone());
    console.start().await.unwrap();
    assert!(console.is_running());

    harness.add_plugin("lights", Behavior::default()).await;
    harness.manager.load("lights").await.unwrap();

    let watched = console.clone();
    assert!(
        eventually(WAIT, || {
            let console = watched.clone();
            async move { console.latest("lights").is_some_and(|p| p.status == PluginStatus::Loaded) }
        })
        .await
    );
    assert_eq!(console.known_plugins(), vec!["lights".to_string()]);

    harness.manager.remove("lights").await.unwrap();
    let watched = console.clone();
    assert!(
        eventually(WAIT, || {
            let console = watched.clone();
            async move { console.latest("lights").is_none() }
        })
        .await
    );
}

#[tokio::test]
async fn test_stopped_console_no_longer_listens() {
    let harness = Harness::new();
    harness.manager.attach_bus();
    let console = ConsoleFrontend::new(harness.bus.clone());
    console.start().await.unwrap();
    console.start().await.unwrap();
    let subscribers = harness.bus.subscriber_count();

    console.stop().await.unwrap();
    console.stop().await.unwrap();
    assert!(!console.is_running());
    assert_eq!(harness.bus.subscriber_count(), subscribers - 1);

    harness.add_plugin("lights", Behavior::default()).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(console.latest("lights").is_none());
    assert_eq!(console.name(), "console");
}
