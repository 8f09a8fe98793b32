//! # Chat Language Model
//!
//! The interface between the chat loop and the model that powers it: the conversation history, the
//! parameters used to generate a reply, how weights are quantized, and the traits a model backend
//! implements.

#![warn(missing_docs)]

pub use llm_samplers;

mod chat;
pub use chat::*;
mod generation_parameters;
pub use generation_parameters::*;
mod model;
pub use model::*;
mod quantization;
pub use quantization::*;
mod sampling;
pub use sampling::*;
