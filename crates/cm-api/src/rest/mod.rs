pub mod health;
pub mod usage;
