// screenfix: screenshot capture daemon and the tool server agents query it through

// Platform capture, annotation and clipboard commands
pub mod capture;

// Daemon binary discovery
pub mod cli_paths;

pub mod config;

// Daemon event loop and trigger sources
pub mod daemon;

// Spawning and signalling the daemon from the tool server
pub mod daemon_client;

// Markdown task file
pub mod ledger;

pub mod logging;
pub mod persistence;

// Capture -> annotate -> commit cycle
pub mod pipeline;

pub mod screenshots;

// Daemon state record (state.json)
pub mod state;

// Tool handlers and the JSON-RPC stdio server
pub mod tools;

pub mod trigger;

// Test utilities (only compiled in test builds)
#[cfg(test)]
pub mod test_utils;
