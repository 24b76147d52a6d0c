//! PC Agent - Home Assistant integration for a desktop PC.
//!
//! Bridges the workstation to a Home Assistant hub over MQTT:
//! - Game detection via process monitoring
//! - Idle time tracking
//! - Sleep/wake power events with display wake-up
//! - Remote command execution under an allow-listed grammar
//! - MQTT discovery so entities appear on the hub automatically

pub mod agent;
pub mod commands;
pub mod config;
pub mod core;
pub mod logging;
pub mod mqtt;
pub mod os;
pub mod power;
pub mod sensors;
