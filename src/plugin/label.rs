/// Identity of the agent hosting the plugin
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceLabel {
    label: String,
}

impl ServiceLabel {
    pub fn new(label: impl Into<String>) -> Self {
        Self { label: label.into() }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Key prefix owned by this agent: `/agent/<label>/`
    pub fn agent_prefix(&self) -> String {
        format!("{AGENT_ROOT}{}/", self.label)
    }
}

const AGENT_ROOT: &str = "/agent/";
