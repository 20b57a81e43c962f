#![warn(clippy::all, clippy::pedantic)]
#![allow(
    clippy::doc_markdown,
    clippy::implicit_clone,
    clippy::items_after_statements,
    clippy::map_unwrap_or,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::needless_pass_by_value,
    clippy::redundant_closure_for_method_calls,
    clippy::return_self_not_must_use,
    clippy::similar_names,
    clippy::single_match_else,
    clippy::struct_field_names,
    clippy::too_many_lines,
    clippy::uninlined_format_args,
    clippy::cast_possible_truncation,
    clippy::cast_sign_loss,
    clippy::unnecessary_wraps
)]

//! Steward, a personal assistant control plane.
//!
//! The reliability core lives here: a durable cross-process session store,
//! a model/provider fallback engine, and a single-shot gateway RPC client,
//! composed per agent invocation by the orchestrator. Channel connectors and
//! the agent's own prompt/tool machinery are external collaborators.

pub mod agent;
pub mod config;
pub mod error;
pub mod gateway;
pub mod providers;
pub mod session;
pub mod util;

pub use config::Config;
