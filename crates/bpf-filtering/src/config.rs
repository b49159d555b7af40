use probe_core::pdk::{ConfigError, ModuleConfig};

use crate::FilterPolicy;

/// [`FilterConfig`] is the user configuration of the rules deciding which
/// syscalls are captured.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FilterConfig {
    pub pid_allowlist: Vec<u32>,
    pub pid_denylist: Vec<u32>,
    pub ns_allowlist: Vec<u64>,
    pub ns_denylist: Vec<u64>,
    /// Keep only calls from processes with a controlling terminal
    pub tty_only: bool,
}

impl FilterConfig {
    /// Rules are enabled by having a non empty list.
    pub fn policy(&self) -> FilterPolicy {
        let mut policy = FilterPolicy::empty();
        for (enabled, rule) in [
            (!self.pid_allowlist.is_empty(), FilterPolicy::PID_ALLOW),
            (!self.pid_denylist.is_empty(), FilterPolicy::PID_DENY),
            (!self.ns_allowlist.is_empty(), FilterPolicy::NS_ALLOW),
            (!self.ns_denylist.is_empty(), FilterPolicy::NS_DENY),
            (self.tty_only, FilterPolicy::TTY_ONLY),
        ] {
            if enabled {
                policy.insert(rule);
            }
        }
        policy
    }
}

/// Extract FilterConfig from configuration file
impl TryFrom<&ModuleConfig> for FilterConfig {
    type Error = ConfigError;

    fn try_from(config: &ModuleConfig) -> Result<Self, Self::Error> {
        Ok(FilterConfig {
            pid_allowlist: config.get_list("pid_allowlist")?,
            pid_denylist: config.get_list("pid_denylist")?,
            ns_allowlist: config.get_list("ns_allowlist")?,
            ns_denylist: config.get_list("ns_denylist")?,
            tty_only: config.with_default("tty_only", false)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_lists_and_flags() {
        let mut module_config = ModuleConfig::default();
        module_config.insert("pid_allowlist".to_string(), "1, 42".to_string());
        module_config.insert("ns_denylist".to_string(), "4026531836".to_string());
        module_config.insert("tty_only".to_string(), "true".to_string());

        let config = FilterConfig::try_from(&module_config).unwrap();
        assert_eq!(config.pid_allowlist, vec![1, 42]);
        assert!(config.pid_denylist.is_empty());
        assert_eq!(config.ns_denylist, vec![4026531836]);
        assert!(config.tty_only);

        let policy = config.policy();
        assert!(policy.contains(FilterPolicy::PID_ALLOW));
        assert!(policy.contains(FilterPolicy::NS_DENY));
        assert!(policy.contains(FilterPolicy::TTY_ONLY));
        assert!(!policy.contains(FilterPolicy::PID_DENY));
        assert!(!policy.contains(FilterPolicy::NS_ALLOW));
    }

    #[test]
    fn empty_config_filters_nothing() {
        let config = FilterConfig::try_from(&ModuleConfig::default()).unwrap();
        assert_eq!(config.policy(), FilterPolicy::empty());
    }

    #[test]
    fn invalid_pid_is_rejected() {
        let mut module_config = ModuleConfig::default();
        module_config.insert("pid_denylist".to_string(), "init".to_string());
        assert!(FilterConfig::try_from(&module_config).is_err());
    }
}
