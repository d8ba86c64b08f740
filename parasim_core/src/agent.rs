//! Agents, their id source, and the toroidal space they live in.

use crate::error::CoreError;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One simulation entity.
///
/// On the wire an agent is the ordered tuple `(id, x, y, value)` with no
/// version field, so adding a field here changes the protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "(u64, i32, i32, i64)", into = "(u64, i32, i32, i64)")]
pub struct Agent {
    /// Unique within the population that created it
    pub id: u64,

    /// Column in the torus
    pub x: i32,

    /// Row in the torus
    pub y: i32,

    /// Mutable scalar state, starts at 1
    pub value: i64,
}

impl Agent {
    /// Creates an agent at `(x, y)` with the initial value of one.
    pub fn new(id: u64, x: i32, y: i32) -> Self {
        Self { id, x, y, value: 1 }
    }

    /// Increases the agent's value by one.
    pub fn increment_value(&mut self) {
        self.value += 1;
    }
}

impl From<(u64, i32, i32, i64)> for Agent {
    fn from((id, x, y, value): (u64, i32, i32, i64)) -> Self {
        Self { id, x, y, value }
    }
}

impl From<Agent> for (u64, i32, i32, i64) {
    fn from(agent: Agent) -> Self {
        (agent.id, agent.x, agent.y, agent.value)
    }
}

/// Monotone source of agent ids.
///
/// Owned by whoever builds a population, so two populations never share
/// (or collide through) a counter.
#[derive(Debug, Clone, Default)]
pub struct IdCounter {
    next: u64,
}

impl IdCounter {
    /// Creates a counter starting at zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh id.
    pub fn next_id(&mut self) -> u64 {
        let id = self.next;
        self.next += 1;
        id
    }

    /// Number of ids handed out relative to zero.
    pub fn issued(&self) -> u64 {
        self.next
    }
}

/// A bounded 2D space whose edges wrap around.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Space {
    width: i32,
    height: i32,
}

impl Space {
    /// Creates a `width x height` torus. Both dimensions must be positive.
    pub fn new(width: i32, height: i32) -> Result<Self, CoreError> {
        if width <= 0 || height <= 0 {
            return Err(CoreError::InvalidSpace { width, height });
        }
        Ok(Self { width, height })
    }

    pub fn width(&self) -> i32 {
        self.width
    }

    pub fn height(&self) -> i32 {
        self.height
    }

    /// Maps any coordinate pair onto the torus.
    pub fn wrap(&self, x: i32, y: i32) -> (i32, i32) {
        (x.rem_euclid(self.width), y.rem_euclid(self.height))
    }

    /// Checks whether `(x, y)` already lies inside the torus.
    pub fn contains(&self, x: i32, y: i32) -> bool {
        (0..self.width).contains(&x) && (0..self.height).contains(&y)
    }

    /// Draws a uniformly random cell.
    pub fn random_position<R: Rng + ?Sized>(&self, rng: &mut R) -> (i32, i32) {
        (rng.gen_range(0..self.width), rng.gen_range(0..self.height))
    }
}

/// Builds `total` agents at random cells, ids drawn from `counter` in order.
pub fn spawn_population<R: Rng + ?Sized>(
    total: usize,
    space: &Space,
    rng: &mut R,
    counter: &mut IdCounter,
) -> Vec<Agent> {
    (0..total)
        .map(|_| {
            let (x, y) = space.random_position(rng);
            Agent::new(counter.next_id(), x, y)
        })
        .collect()
}
