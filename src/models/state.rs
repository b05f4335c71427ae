use serde::Serialize;

/// Proxy lifecycle state
///
/// `Idle -> Starting -> Running -> Stopping -> Idle`, with `Failed` reachable
/// from `Starting` (bind error) or `Running` (accept loop died).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ProxyState {
    #[default]
    Idle,
    Starting,
    Running,
    Stopping,
    Failed,
}

impl ProxyState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyState::Idle => "idle",
            ProxyState::Starting => "starting",
            ProxyState::Running => "running",
            ProxyState::Stopping => "stopping",
            ProxyState::Failed => "failed",
        }
    }

    /// Whether `start` may be called in this state
    pub fn can_start(&self) -> bool {
        matches!(self, ProxyState::Idle | ProxyState::Failed)
    }
}

impl std::fmt::Display for ProxyState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}
