use crate::config::MachineConfig;
use std::collections::BTreeSet;

/// One entry of the build machine registry. The registry only answers
/// pre-flight support queries; dispatching work to a machine is the worker
/// pool's business.
#[derive(Debug, Clone)]
pub struct Machine {
    pub name: String,
    pub systems: Vec<String>,
    pub supported_features: BTreeSet<String>,
    pub mandatory_features: BTreeSet<String>,
    pub max_jobs: u32,
}

impl Machine {
    pub fn from_config(cfg: &MachineConfig) -> Self {
        Self {
            name: cfg.name.clone(),
            systems: cfg.systems.clone(),
            supported_features: cfg.supported_features.iter().cloned().collect(),
            mandatory_features: cfg.mandatory_features.iter().cloned().collect(),
            max_jobs: cfg.max_jobs,
        }
    }

    /// Whether this machine can run a step of the given platform needing the
    /// given feature set. Mandatory features must be requested by the step;
    /// requested features must all be supported or mandatory here.
    pub fn supports_step(&self, platform: &str, required_features: &BTreeSet<String>) -> bool {
        if !self.systems.iter().any(|s| s == platform) {
            return false;
        }
        if !self
            .mandatory_features
            .iter()
            .all(|f| required_features.contains(f))
        {
            return false;
        }
        required_features
            .iter()
            .all(|f| self.supported_features.contains(f) || self.mandatory_features.contains(f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn features(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn machine() -> Machine {
        Machine {
            name: "builder-1".into(),
            systems: vec!["x86_64-linux".into(), "i686-linux".into()],
            supported_features: features(&["kvm", "big-parallel"]),
            mandatory_features: BTreeSet::new(),
            max_jobs: 4,
        }
    }

    #[test]
    fn test_supports_matching_platform() {
        let m = machine();
        assert!(m.supports_step("x86_64-linux", &BTreeSet::new()));
        assert!(m.supports_step("i686-linux", &features(&["kvm"])));
        assert!(!m.supports_step("aarch64-linux", &BTreeSet::new()));
    }

    #[test]
    fn test_unknown_feature_is_unsupported() {
        let m = machine();
        assert!(!m.supports_step("x86_64-linux", &features(&["cuda"])));
        assert!(m.supports_step("x86_64-linux", &features(&["kvm", "big-parallel"])));
    }

    #[test]
    fn test_mandatory_features_must_be_requested() {
        let mut m = machine();
        m.mandatory_features = features(&["benchmark"]);
        // Steps that don't ask for the mandatory feature are kept off this
        // machine entirely.
        assert!(!m.supports_step("x86_64-linux", &BTreeSet::new()));
        assert!(m.supports_step("x86_64-linux", &features(&["benchmark"])));
    }
}
