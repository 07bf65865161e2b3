use serde::{Deserialize, Serialize};

/// Machines carrying this tag run services, never analyses
pub const SERVICE_TAG: &str = "service";

/// An analysis or service virtual machine known to the store
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Machine {
    pub name: String,
    /// Identifier the machinery driver uses
    pub label: String,
    pub platform: String,
    pub ip: String,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Flags such as `noagent`
    #[serde(default)]
    pub options: Vec<String>,
    #[serde(default)]
    pub locked: bool,
    /// Task this machine is being kept free for
    #[serde(default)]
    pub reserved_by: Option<i64>,
    /// Name of the machinery driver managing this machine
    #[serde(default)]
    pub manager: String,
    #[serde(default)]
    pub interface: Option<String>,
    #[serde(default)]
    pub snapshot: Option<String>,
}

impl Machine {
    pub fn new(name: &str, platform: &str) -> Self {
        Self {
            name: name.to_string(),
            label: name.to_string(),
            platform: platform.to_string(),
            ip: "192.168.56.101".to_string(),
            tags: Vec::new(),
            options: Vec::new(),
            locked: false,
            reserved_by: None,
            manager: "command".to_string(),
            interface: None,
            snapshot: None,
        }
    }

    pub fn is_analysis(&self) -> bool {
        !self.tags.iter().any(|t| t == SERVICE_TAG)
    }

    pub fn has_option(&self, option: &str) -> bool {
        self.options.iter().any(|o| o == option)
    }

    pub fn has_tags(&self, tags: &[String]) -> bool {
        tags.iter().all(|t| self.tags.contains(t))
    }

    /// Whether this machine satisfies the given constraints
    pub fn matches(&self, name: Option<&str>, platform: Option<&str>, tags: &[String]) -> bool {
        name.map_or(true, |n| self.name == n)
            && platform.map_or(true, |p| self.platform == p)
            && self.has_tags(tags)
    }
}

/// A series of tasks sharing one machine
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct Longterm {
    pub id: i64,
    /// Label of the machine bound to the series
    #[serde(default)]
    pub machine: Option<String>,
    #[serde(default)]
    pub last_completed: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_service_machines_are_not_analysis_machines() {
        let mut machine = Machine::new("svc1", "linux");
        assert!(machine.is_analysis());

        machine.tags.push(SERVICE_TAG.to_string());
        assert!(!machine.is_analysis());
    }

    #[test]
    fn test_matches_constraints() {
        let mut machine = Machine::new("win7", "windows");
        machine.tags = vec!["x64".to_string(), "office".to_string()];

        assert!(machine.matches(None, None, &[]));
        assert!(machine.matches(Some("win7"), Some("windows"), &["x64".to_string()]));
        assert!(!machine.matches(None, Some("linux"), &[]));
        assert!(!machine.matches(None, None, &["linux-only".to_string()]));
        assert!(!machine.matches(Some("win10"), None, &[]));
    }
}
