pub mod agent;
pub mod model;
pub mod replay;
pub mod reward;
pub mod state;

pub use agent::{AgentConfig, AgentStats, QLearningAgent};
pub use replay::{Experience, ReplayBuffer};
pub use reward::TradeStreak;
pub use state::{StateDiscretizer, StateKey};
