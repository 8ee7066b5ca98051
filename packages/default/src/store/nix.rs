use super::{BuildStore, Derivation, parse_derivation_show};
use crate::models::{BuildOutput, BuildOutputPath};
use anyhow::{Result, bail};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashSet;
use tokio::process::Command;
use tracing::debug;

/// Content store backed by the local nix CLI.
pub struct NixStore;

impl NixStore {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NixStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BuildStore for NixStore {
    async fn is_valid_path(&self, path: &str) -> Result<bool> {
        // Exit status is the answer here; an invalid path is an expected
        // outcome, not an error.
        let output = Command::new("nix-store")
            .args(["--check-validity", path])
            .output()
            .await?;

        debug!("nix-store --check-validity {} => {}", path, output.status);
        Ok(output.status.success())
    }

    async fn read_derivation(&self, drv_path: &str) -> Result<Derivation> {
        let output = Command::new("nix")
            .args(["derivation", "show", drv_path])
            .output()
            .await?;

        if !output.status.success() {
            bail!(
                "nix derivation show failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let v: Value = serde_json::from_slice(&output.stdout)?;
        parse_derivation_show(drv_path, &v)
    }

    /// Confirms every output against the store via `nix path-info` before
    /// it is recorded, instead of trusting the paths parsed out of the
    /// derivation.
    async fn build_output(&self, drv: &Derivation) -> Result<BuildOutput> {
        let mut cmd = Command::new("nix");
        cmd.args(["path-info", "--json"]);
        for output in &drv.outputs {
            cmd.arg(&output.path);
        }

        let output = cmd.output().await?;
        if !output.status.success() {
            bail!(
                "nix path-info failed: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let v: Value = serde_json::from_slice(&output.stdout)?;
        let registered = path_info_paths(&v);

        let mut result = BuildOutput::default();
        for out in &drv.outputs {
            if !registered.contains(&out.path) {
                bail!("output {} is not registered in the store", out.path);
            }
            result.outputs.push(BuildOutputPath {
                name: out.name.clone(),
                path: out.path.clone(),
            });
        }
        Ok(result)
    }
}

/// Store paths confirmed by `nix path-info --json`. Older nix emits an array
/// of objects with a `path` field, newer nix an object keyed by path.
fn path_info_paths(json: &Value) -> HashSet<String> {
    match json {
        Value::Array(entries) => entries
            .iter()
            .filter_map(|e| e.get("path").and_then(|p| p.as_str()))
            .map(str::to_string)
            .collect(),
        Value::Object(map) => map.keys().cloned().collect(),
        _ => HashSet::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_info_paths_array_format() {
        let v: Value = serde_json::from_str(
            r#"[
                { "path": "/nix/store/a1b2c-hello-2.12", "narSize": 123456 },
                { "path": "/nix/store/d4e5f-hello-2.12-dev", "narSize": 7890 }
            ]"#,
        )
        .unwrap();

        let paths = path_info_paths(&v);
        assert_eq!(paths.len(), 2);
        assert!(paths.contains("/nix/store/a1b2c-hello-2.12"));
        assert!(paths.contains("/nix/store/d4e5f-hello-2.12-dev"));
    }

    #[test]
    fn test_path_info_paths_object_format() {
        let v: Value = serde_json::from_str(
            r#"{
                "/nix/store/a1b2c-hello-2.12": { "narSize": 123456 }
            }"#,
        )
        .unwrap();

        let paths = path_info_paths(&v);
        assert_eq!(paths.len(), 1);
        assert!(paths.contains("/nix/store/a1b2c-hello-2.12"));
    }

    #[test]
    fn test_path_info_paths_rejects_junk() {
        let v: Value = serde_json::from_str(r#""not a path listing""#).unwrap();
        assert!(path_info_paths(&v).is_empty());
    }
}
