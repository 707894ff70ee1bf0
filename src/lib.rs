//! lidar-driver: lifecycle-managed acquisition driver for spinning lidars
//!
//! Receives raw UDP datagrams from the sensor, decodes them into columns,
//! assembles full revolutions and publishes point clouds, range, intensity
//! and noise images and IMU samples over ZeroMQ.

pub mod assembler;
pub mod common;
pub mod config;
pub mod converter;
pub mod decoder;
pub mod driver;
pub mod emulator;
pub mod publisher;
pub mod sensor;
