//! poc-challenger
//!
//! The `poc_challenger_core` crate owns the lifecycle of Proof-of-Coverage
//! challenges for which the local validator is the challenger.
//!
//! ## Overview
//!
//! - **Challenge Manager**: a single-writer actor that consumes block
//!   events, initializes challenges for ephemeral keys we own, ingests
//!   receipts and witnesses from peers, and submits the signed receipts
//!   transaction once a challenge times out.
//!
//! - **Deterministic derivation**: target and path selection are seeded
//!   exclusively from public block data and the challenge's ephemeral
//!   secret, so any validator can replay the derivation from the submitted
//!   transaction.
//!
//! - **Bounded state**: the key cache, the local PoC store and the ledger's
//!   public PoC records are all garbage collected on block-count TTLs.
//!
//! The blockchain event source, ledger, onion packet builder, path builder
//! and transaction submitter are external collaborators modeled as traits
//! in [`interfaces`].

pub mod interfaces;
pub mod poc;

mod testing;
