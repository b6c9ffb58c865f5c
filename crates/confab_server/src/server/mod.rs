#![forbid(unsafe_code)]

pub mod connection;
pub mod coordinator;
pub mod health;
pub mod presence;
pub mod room_hub;
pub mod store;


#[cfg(test)]
mod presence_tests;


#[cfg(test)]
mod store_tests;
