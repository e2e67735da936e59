//! # agent-fleet
//!
//! Supervises a fleet of game-client agents: keeps each one connected,
//! assigns farm duties, answers authorized remote commands and reports
//! security and health events to a webhook.
//!
//! The game protocol itself lives in a sidecar process; agents reach it
//! through [`bridge::SidecarFactory`], or anything else implementing
//! [`transport::TransportFactory`].

pub mod bridge;
pub mod commands;
pub mod config;
pub mod connection;
pub mod dedup;
pub mod duties;
pub mod error;
pub mod events;
pub mod fleet;
pub mod monitor;
pub mod notify;
pub mod protocol;
pub mod registry;
pub mod secure_settings;
pub mod state;
pub mod supervisor;
pub mod transport;
pub mod whitelist;
