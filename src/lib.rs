// StreamRelay Server Library
// Multi-destination RTMP relay: topology compiler and ingest process supervisor

pub mod commands;
pub mod models;
pub mod services;
