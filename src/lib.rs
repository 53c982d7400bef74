// vidswarm - lib.rs
//
// Peers on a local network announce the videos they hold over multicast, exchange catalogs over
// a small request/response protocol, and download a file chunk by chunk from several sources.

pub mod catalog;
pub mod config;
pub mod control_client;
pub mod control_server;
pub mod download_manager;
pub mod file_manager;
pub mod logging;
pub mod metadata;
pub mod p2p_manager;
pub mod peer_directory;
pub mod protocol;
