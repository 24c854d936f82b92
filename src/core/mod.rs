pub mod circuit_breaker;
pub mod engine;
pub mod guardian;
