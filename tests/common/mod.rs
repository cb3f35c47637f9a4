#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use fluux_sandbox::container::fake::FakeRuntime;
use fluux_sandbox::{Config, ExecutionRequest, SandboxEngine, SessionSource};

/// Configuration rooted entirely inside `dir`.
pub fn config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.paths.data_dir = dir.join("data");
    config.paths.vault = dir.join("vault");
    config.paths.transcripts = dir.join("transcripts");
    config.paths.credentials_file = dir.join("credentials.json");
    config.paths.tool_config = dir.join("tools.json");
    config.paths.host_scratch = dir.join("scratch");
    config
}

pub async fn engine(dir: &Path) -> (Arc<FakeRuntime>, SandboxEngine) {
    let runtime = Arc::new(FakeRuntime::new());
    let engine = SandboxEngine::new(config(dir), runtime.clone()).unwrap();
    engine.startup().await.unwrap();
    (runtime, engine)
}

pub fn request(session: &str, source: SessionSource) -> ExecutionRequest {
    ExecutionRequest {
        session_id: session.to_string(),
        workspace_id: None,
        named_env_slug: None,
        session_source: source,
        requested_trust_level: "sandboxed".to_string(),
        payload: serde_json::Value::Null,
    }
}
