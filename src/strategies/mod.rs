pub mod arbiter;
pub mod scorer;
pub mod traits;
