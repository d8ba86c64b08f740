//! Protocol scenarios exercised against a local cluster.

/// Scenario identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScenarioId {
    /// PS-001: default model, 10 agents over 3 workers
    Baseline,

    /// PS-002: population that does not divide evenly among workers
    UnevenSplit,

    /// PS-003: one worker holds the whole population
    SingleWorker,

    /// PS-004: continue commands interleaved with ticks
    Heartbeat,

    /// PS-005: coordinator loses its link to one worker during step
    SeveredLink,
}

impl ScenarioId {
    /// Returns a list of all scenarios.
    pub fn all() -> Vec<ScenarioId> {
        vec![
            ScenarioId::Baseline,
            ScenarioId::UnevenSplit,
            ScenarioId::SingleWorker,
            ScenarioId::Heartbeat,
            ScenarioId::SeveredLink,
        ]
    }

    /// Returns the scenario name.
    pub fn name(&self) -> &'static str {
        match self {
            ScenarioId::Baseline => "baseline",
            ScenarioId::UnevenSplit => "uneven_split",
            ScenarioId::SingleWorker => "single_worker",
            ScenarioId::Heartbeat => "heartbeat",
            ScenarioId::SeveredLink => "severed_link",
        }
    }

    /// Returns a description of the scenario.
    pub fn description(&self) -> &'static str {
        match self {
            ScenarioId::Baseline => "Scatter, tick and gather; every value ends at 1 + ticks",
            ScenarioId::UnevenSplit => "Remainder lands on the last worker (3, 3, 4 for 10 over 3)",
            ScenarioId::SingleWorker => "World of two ranks; the only worker owns every agent",
            ScenarioId::Heartbeat => "Continue between ticks must not change any state",
            ScenarioId::SeveredLink => "Step lost on one link; its slice lags and the tick is reported degraded",
        }
    }

    /// True when the scenario injects faults and expects degraded ticks.
    pub fn expects_degradation(&self) -> bool {
        matches!(self, ScenarioId::SeveredLink)
    }
}

impl std::fmt::Display for ScenarioId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for ScenarioId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "baseline" | "ps-001" => Ok(ScenarioId::Baseline),
            "uneven_split" | "unevensplit" | "ps-002" => Ok(ScenarioId::UnevenSplit),
            "single_worker" | "singleworker" | "ps-003" => Ok(ScenarioId::SingleWorker),
            "heartbeat" | "ps-004" => Ok(ScenarioId::Heartbeat),
            "severed_link" | "severedlink" | "ps-005" => Ok(ScenarioId::SeveredLink),
            _ => Err(format!("Unknown scenario: {}", s)),
        }
    }
}
