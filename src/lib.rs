pub mod archive;
pub mod client;
pub mod config;
pub mod download;
pub mod engine;
pub mod error;
pub mod operation;
pub mod report;
pub mod run;
pub mod sandbox;
pub mod spooler;
pub mod supervisor;
pub mod terminator;
pub mod variable;

pub use client::EngineClients;
pub use config::Config;
pub use engine::Engine;
pub use error::EngineError;
pub use run::{Phase, Run, RunStatus};
