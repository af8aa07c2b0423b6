//! Storage-node agent that keeps committed capacity filled with filler files
//! and answers on-chain storage challenges.
//!
//! Two long-running loops share a height-indexed [`ledger::Ledger`]:
//!
//! - [`space::IdleAcquisition`] requests filler files from attestation
//!   workers, verifies them, registers them on-chain and records the
//!   confirmation height.
//! - [`challenge::ChallengeScheduler`] waits for challenge windows and proves
//!   every file registered at or above the window start, writing proof
//!   bundles and aggregate signatures.
//!
//! The chain, the peer transport and the proof math sit behind the
//! [`chain::ChainClient`], [`p2p::PeerTransport`] and [`proof::ProofEngine`]
//! traits; [`mock`] has in-memory versions of all three.

pub mod chain;
pub mod challenge;
pub mod config;
pub mod error;
pub mod identity;
pub mod ledger;
pub mod mock;
pub mod p2p;
pub mod proof;
pub mod space;
pub mod supervisor;
pub mod workspace;
