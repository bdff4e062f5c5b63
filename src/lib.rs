//! # Draft Harness
//!
//! An incremental document structure model and feedback scheduling engine
//! for AI writing assistants.
//!
//! Draft Harness watches a mutable text buffer, keeps stable identities for
//! its paragraphs, sentences and words across revisions, notices when the
//! writer finishes a word or a sentence, and runs user-configured analysis
//! rules against an external text-generation service at the right moments.
//! Generated feedback is bound to the content that produced it and is
//! withdrawn when that content disappears or is rewritten.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────┐   ┌────────────┐   ┌─────────────┐
//! │ Structure  │   │ Completion │──▶│  Scheduler  │
//! │   model    │   │  detector  │   │ timers/batch│
//! └────────────┘   └────────────┘   └──────┬──────┘
//!        ▲                ▲                │ fire
//!        │   text         │                ▼
//!  ┌─────┴────────────────┴─┐       ┌─────────────┐
//!  │     FeedbackEngine     │◀──────│ Generation  │
//!  │  (context object)      │       │   client    │
//!  └───────────┬────────────┘       └─────────────┘
//!              ▼
//!       ┌─────────────┐   ┌─────────────┐
//!       │ Association │──▶│ Persistent  │
//!       │    store    │   │    store    │
//!       └─────────────┘   └─────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! draft analyze notes.md            # structure summary
//! draft rules                       # configured rules and delays
//! draft run notes.md                # one batch over every enabled rule
//! draft watch notes.md              # live feedback while you edit
//! draft associations show           # saved feedback bindings
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`models`] | Spans, content kinds, structure snapshot types |
//! | [`structure`] | Paragraph/sentence/word decomposition with stable ids |
//! | [`completion`] | Word and sentence completion detection |
//! | [`associations`] | Feedback-to-content bindings and their invalidation |
//! | [`scheduler`] | Per-rule timers, delay resolution, batch coalescing |
//! | [`rules`] | Rule definitions and prompt rendering |
//! | [`generation`] | Text-generation client abstraction |
//! | [`persist`] | Key/blob persistence for association tables |
//! | [`engine`] | The context object wiring everything together |
//! | [`report`] | Human and JSON event reporters |
//! | [`commands`] | CLI subcommand implementations |
//! | [`config`] | TOML configuration parsing |
//! | [`error`] | Error taxonomy |

pub mod associations;
pub mod commands;
pub mod completion;
pub mod config;
pub mod engine;
pub mod error;
pub mod generation;
pub mod models;
pub mod persist;
pub mod report;
pub mod rules;
pub mod scheduler;
pub mod structure;
