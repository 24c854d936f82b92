pub mod paper;
pub mod traits;
