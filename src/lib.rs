//! # Therapy Chat
//!
//! An interactive terminal chat with a 4-bit quantized Llama 2 model fine-tuned as a mental therapy
//! assistant. The fine-tune is either loaded as a merged model or as a LoRA adapter layered over the
//! base model at startup.
//!
//! ```rust, no_run
//! use lora_llama::LlamaLoader;
//! use therapy_chat::{initialize, run, SessionConfig};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = SessionConfig::default();
//! let mut session = initialize(&LlamaLoader::new(), &config)?;
//! run(
//!     &mut session,
//!     config.exit_command(),
//!     std::io::stdin().lock(),
//!     std::io::stdout(),
//! )?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod config;
pub use config::*;
mod session;
pub use session::*;
mod turn_loop;
pub use turn_loop::*;
