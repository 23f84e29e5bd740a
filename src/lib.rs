//! Library of the `nimbus` backup orchestrator.
//!
//! A run of one backup job sweeps expired archives from every configured
//! backup directory, lets the job (see [`jobs`]) produce a fresh archive in
//! the local directory, replicates it to the remote directories and mails a
//! report of everything that happened. The sequencing lives in
//! [`orchestrator`].

#![forbid(unsafe_code)]

pub mod cli;
pub mod config;
pub mod jobs;
pub mod orchestrator;
pub mod replication;
pub mod report;
pub mod util;
