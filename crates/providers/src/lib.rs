//! Completion client implementations for Clinscribe.
//!
//! All clients implement the `clinscribe_core::CompletionClient` trait.

pub mod openai_compat;

pub use openai_compat::OpenAiCompatClient;
