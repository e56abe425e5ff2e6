#![forbid(unsafe_code)]

pub mod connection;
pub mod health;
pub mod history;
pub mod lifecycle;
pub mod room_hub;
pub mod router;
pub mod state;

#[cfg(test)]
mod lifecycle_tests;


#[cfg(test)]
mod state_tests;
