use crate::models::{BuildOutput, BuildOutputPath};
use anyhow::{Result, anyhow};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{BTreeSet, HashMap};

pub mod nix;

pub use nix::NixStore;

/// A parsed derivation: the build recipe behind one store path.
#[derive(Debug, Clone, Default)]
pub struct Derivation {
    pub platform: String,
    pub outputs: Vec<DerivationOutput>,
    pub input_drvs: Vec<String>,
    pub env: HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct DerivationOutput {
    pub name: String,
    pub path: String,
}

impl Derivation {
    /// Tokens from `requiredSystemFeatures`, whitespace separated.
    pub fn required_system_features(&self) -> BTreeSet<String> {
        self.env
            .get("requiredSystemFeatures")
            .map(|s| s.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }

    /// True iff the derivation asks to be built locally and its platform is
    /// one we treat as local.
    pub fn prefer_local_build(&self, local_platforms: &[String]) -> bool {
        self.env.get("preferLocalBuild").map(String::as_str) == Some("1")
            && local_platforms.iter().any(|p| *p == self.platform)
    }

    pub fn output_paths(&self) -> Vec<String> {
        self.outputs.iter().map(|o| o.path.clone()).collect()
    }

    pub fn build_output(&self) -> BuildOutput {
        BuildOutput {
            outputs: self
                .outputs
                .iter()
                .map(|o| BuildOutputPath {
                    name: o.name.clone(),
                    path: o.path.clone(),
                })
                .collect(),
        }
    }
}

/// Content store operations the queue monitor consumes. The real store talks
/// to the nix CLI; tests swap in an in-memory one.
#[async_trait]
pub trait BuildStore: Send + Sync {
    async fn is_valid_path(&self, path: &str) -> Result<bool>;

    async fn read_derivation(&self, drv_path: &str) -> Result<Derivation>;

    /// Collects what a derivation with all-valid outputs produced, for the
    /// cached-success record.
    async fn build_output(&self, drv: &Derivation) -> Result<BuildOutput> {
        Ok(drv.build_output())
    }
}

/// Parses one entry of `nix derivation show` output into a [`Derivation`].
pub fn parse_derivation_show(drv_path: &str, json: &Value) -> Result<Derivation> {
    let obj = json
        .as_object()
        .and_then(|m| m.get(drv_path))
        .and_then(|x| x.as_object())
        .ok_or_else(|| anyhow!("bad JSON from nix derivation show for {}", drv_path))?;

    let platform = obj
        .get("system")
        .and_then(|x| x.as_str())
        .unwrap_or_default()
        .to_string();

    let outputs = obj
        .get("outputs")
        .and_then(|x| x.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(name, v)| {
                    v.get("path").and_then(|p| p.as_str()).map(|p| {
                        DerivationOutput {
                            name: name.clone(),
                            path: p.to_string(),
                        }
                    })
                })
                .collect()
        })
        .unwrap_or_else(Vec::new);

    let input_drvs = obj
        .get("inputDrvs")
        .and_then(|x| x.as_object())
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_else(Vec::new);

    let env = obj
        .get("env")
        .and_then(|x| x.as_object())
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|v| (k.clone(), v.to_string())))
                .collect()
        })
        .unwrap_or_default();

    Ok(Derivation {
        platform,
        outputs,
        input_drvs,
        env,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SHOW_JSON: &str = r#"{
        "/nix/store/q3p7x-hello-2.12.drv": {
            "outputs": {
                "out": { "path": "/nix/store/a1b2c-hello-2.12" },
                "dev": { "path": "/nix/store/d4e5f-hello-2.12-dev" }
            },
            "inputDrvs": {
                "/nix/store/m5n6o-glibc-2.39.drv": { "outputs": ["out"] },
                "/nix/store/p8q9r-gcc-13.2.drv": { "outputs": ["out"] }
            },
            "system": "x86_64-linux",
            "env": {
                "requiredSystemFeatures": "kvm big-parallel",
                "preferLocalBuild": "1",
                "pname": "hello"
            }
        }
    }"#;

    fn parsed() -> Derivation {
        let v: Value = serde_json::from_str(SHOW_JSON).unwrap();
        parse_derivation_show("/nix/store/q3p7x-hello-2.12.drv", &v).unwrap()
    }

    #[test]
    fn test_parse_derivation_show() {
        let drv = parsed();
        assert_eq!(drv.platform, "x86_64-linux");
        assert_eq!(drv.outputs.len(), 2);
        assert_eq!(drv.input_drvs.len(), 2);
        assert!(
            drv.output_paths()
                .contains(&"/nix/store/a1b2c-hello-2.12".to_string())
        );
        assert_eq!(drv.env.get("pname").map(String::as_str), Some("hello"));
    }

    #[test]
    fn test_parse_unknown_path_fails() {
        let v: Value = serde_json::from_str(SHOW_JSON).unwrap();
        assert!(parse_derivation_show("/nix/store/other.drv", &v).is_err());
    }

    #[test]
    fn test_required_system_features() {
        let drv = parsed();
        let feats = drv.required_system_features();
        assert_eq!(feats.len(), 2);
        assert!(feats.contains("kvm"));
        assert!(feats.contains("big-parallel"));

        let empty = Derivation::default();
        assert!(empty.required_system_features().is_empty());
    }

    #[test]
    fn test_prefer_local_build_needs_local_platform() {
        let drv = parsed();
        assert!(drv.prefer_local_build(&["x86_64-linux".to_string()]));
        assert!(!drv.prefer_local_build(&["aarch64-darwin".to_string()]));
        assert!(!drv.prefer_local_build(&[]));

        let mut other = parsed();
        other.env.remove("preferLocalBuild");
        assert!(!other.prefer_local_build(&["x86_64-linux".to_string()]));
    }

    #[test]
    fn test_build_output_mirrors_outputs() {
        let out = parsed().build_output();
        assert_eq!(out.outputs.len(), 2);
        assert!(out.outputs.iter().any(|o| o.name == "out"));
    }
}
