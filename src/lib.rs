//! # Knowledge Chat
//!
//! A small chat widget that answers questions from a single admin-managed
//! knowledge snippet by forwarding them to a hosted, OpenAI-compatible
//! completion API.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌──────────┐   ┌───────────────┐
//! │ Admin      │──▶│  ingest  │──▶│ knowledge.txt │
//! │ PDF / text │   │ extract  │   │ (≤ max_chars) │
//! └────────────┘   └──────────┘   └───────┬───────┘
//!                                         │
//! ┌────────────┐   ┌──────────┐   ┌───────▼───────┐   ┌────────────┐
//! │ HTTP / CLI │──▶│   chat   │──▶│    prompt     │──▶│ completion │
//! │  (axum)    │   │ session  │   │  assembler    │   │  (reqwest) │
//! └────────────┘   └──────────┘   └───────────────┘   └────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration and environment secrets |
//! | [`knowledge`] | Flat-file knowledge store |
//! | [`extract`] | PDF and plain-text extraction |
//! | [`ingest`] | Admin ingestion pipeline |
//! | [`session`] | Per-session messages, turns, admin flag |
//! | [`prompt`] | Prompt assembly and system instructions |
//! | [`completion`] | Completion service and fallback policy |
//! | [`chat`] | Chat loop state machine |
//! | [`export`] | CSV export of the chat log |
//! | [`server`] | HTTP server |

pub mod chat;
pub mod completion;
pub mod config;
pub mod export;
pub mod extract;
pub mod ingest;
pub mod knowledge;
pub mod prompt;
pub mod server;
pub mod session;
