//! One-shot flow against the bundled mock tool server

use std::time::Duration;

use serde_json::json;
use workspace_finder::config::{RunMode, ServersConfig};
use workspace_finder::oneshot::{run_oneshot, OneshotOptions};
use workspace_finder::rpc::{RpcError, ToolBackend};

use crate::helpers::{primary, supervisor_for};

const MOCK: &str = env!("CARGO_BIN_EXE_mock-tool-server");

fn mock_config() -> ServersConfig {
    let toml = format!(
        r#"
[services.drive]
env = {{ DRIVE_TOKEN = "${{FINDER_TEST_UNSET_DRIVE_TOKEN}}" }}

[services.drive.primary]
exec = "{mock}"
args = ["--name", "drive", "--blob"]

[services.drive.fallback]
exec = "{mock}"
args = ["--name", "drive", "--blob"]

[services.github.primary]
exec = "{mock}"
args = ["--name", "github"]

[services.github.adapter]
fetch = "tool"
limit_param = "limit"

[services.slack.primary]
exec = "{mock}"
args = ["--name", "slack", "--rate-limited"]
"#,
        mock = MOCK
    );
    ServersConfig::from_toml(&toml).expect("valid config")
}

#[tokio::test]
async fn test_oneshot_against_mock_servers() {
    let config = mock_config();
    let mut options = OneshotOptions::new("roadmap");
    options.readiness_timeout = Duration::from_secs(5);
    options.deadline = Some(Duration::from_secs(20));

    let result = run_oneshot(&config, &options, None).await;

    assert!(result.modes.contains("drive"));
    assert!(result.modes.contains("fallback"));

    let drive: Vec<_> = result
        .documents
        .iter()
        .filter(|d| d.service == "drive")
        .collect();
    assert_eq!(drive.len(), 3);
    assert_eq!(drive[0].uri, "drive://doc/0");
    assert_eq!(drive[0].content, "contents of drive://doc/0");
    assert_eq!(drive[0].title, "drive result 0 for roadmap");

    let github: Vec<_> = result
        .documents
        .iter()
        .filter(|d| d.service == "github")
        .collect();
    assert_eq!(github.len(), 3);
    assert_eq!(github[0].content, "body of github://doc/0");

    assert!(result.documents.iter().all(|d| d.service != "slack"));
    assert!(
        result
            .warnings
            .iter()
            .any(|w| w.starts_with("slack") && w.contains("rate limit")),
        "warnings: {:?}",
        result.warnings
    );
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("missing credentials for drive")));

    assert_eq!(result.summary.links.len(), 6);
    assert_eq!(result.summary.links[0].number, 1);
    assert!(result.summary.used_fallback);
    assert!(result
        .summary
        .markdown
        .contains("- drive result 0 for roadmap (drive): drive://doc/0"));
}

#[tokio::test]
async fn test_oneshot_with_nothing_ready() {
    let config = ServersConfig::from_toml(
        r#"
[services.broken.primary]
exec = "/bin/sh"
args = ["-c", "exit 2"]
"#,
    )
    .expect("valid config");
    let mut options = OneshotOptions::new("anything");
    options.readiness_timeout = Duration::from_secs(2);

    let result = run_oneshot(&config, &options, None).await;

    assert!(result.documents.is_empty());
    assert!(result
        .warnings
        .iter()
        .any(|w| w == "broken unavailable: start failed: exit code 2"));
    assert!(result
        .warnings
        .iter()
        .any(|w| w.contains("no tool server is ready")));
    assert!(result
        .summary
        .markdown
        .contains("no documents could be retrieved"));
}

#[tokio::test]
async fn test_launched_client_talks_to_mock() {
    let mock = std::path::Path::new(MOCK);
    let supervisor = supervisor_for(&[("mock", mock)], Duration::from_secs(5), 0);

    let mut statuses = supervisor.launch_all().await;
    let status = statuses.get_mut("mock").unwrap();
    assert!(status.ready, "{:?}", status.warning);
    assert_eq!(status.mode, RunMode::Primary);
    assert_eq!(primary("mock").selected_mode, status.mode);

    let client = status
        .process
        .as_mut()
        .unwrap()
        .take_client("mock")
        .expect("pipes available");
    let taken_twice = status.process.as_mut().unwrap().take_client("mock");
    assert!(matches!(taken_twice, Err(RpcError::PipesUnavailable { .. })));

    let hits = ToolBackend::invoke(&client, "search", json!({"query": "q"}))
        .await
        .unwrap();
    assert_eq!(hits[0]["type"], "text");
    assert!(hits[0]["text"].as_str().unwrap().contains("mock result 0 for q"));

    let text = ToolBackend::read_resource(&client, "mock://doc/1").await.unwrap();
    assert_eq!(text, "contents of mock://doc/1");

    let err = client.invoke("nope", json!({})).await.unwrap_err();
    assert!(err.to_string().contains("unknown tool"), "{}", err);

    drop(client);
    supervisor.shutdown(&mut statuses).await;
}
