use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

use llamachat::engine::{Script, ScriptedEngine};
use llamachat::{ChatApp, Config};

#[allow(dead_code)]
pub fn scripted_app(script: Script) -> (ChatApp, ScriptedEngine) {
    let engine = ScriptedEngine::new(script);
    let app = ChatApp::new(Arc::new(engine.clone()), Config::default());
    (app, engine)
}

#[allow(dead_code)]
pub fn texts(app: &ChatApp) -> Vec<String> {
    app.store()
        .messages()
        .iter()
        .map(|m| m.text().to_string())
        .collect()
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}
