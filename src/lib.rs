//! Switchboard - a coordination-free client-side load balancer for
//! OpenAI-compatible chat deployments.
//!
//! A [`Switchboard`] owns a pool of interchangeable deployments and, for
//! each request, picks one using power-of-two-choices selection weighted
//! by observed rate-limit utilization. Session identifiers pin their
//! requests to one deployment while it stays healthy (preserving
//! server-side prompt-cache locality), failed deployments cool down and
//! are probed back to health in the background, and the outer failover
//! loop retries across deployments. Instances across processes share no
//! state yet spread load evenly, because the selection needs nothing but
//! local observations.
//!
//! ```no_run
//! use switchboard::{
//!     ChatCompletionRequest, ChatMessage, DeploymentConfig, Switchboard, SwitchboardOptions,
//! };
//!
//! # async fn run() -> Result<(), Box<dyn std::error::Error>> {
//! let deployments = vec![
//!     DeploymentConfig::builder()
//!         .name("east".to_string())
//!         .api_base("https://east.example.com/openai".parse()?)
//!         .api_key("sk-east".to_string())
//!         .tpm_ratelimit(100_000)
//!         .rpm_ratelimit(600)
//!         .build(),
//!     DeploymentConfig::builder()
//!         .name("west".to_string())
//!         .api_base("https://west.example.com/openai".parse()?)
//!         .api_key("sk-west".to_string())
//!         .tpm_ratelimit(100_000)
//!         .rpm_ratelimit(600)
//!         .build(),
//! ];
//!
//! let switchboard = Switchboard::new(deployments, SwitchboardOptions::default())?;
//! switchboard.start();
//!
//! let request = ChatCompletionRequest::builder()
//!     .model("gpt-4o-mini".to_string())
//!     .messages(vec![ChatMessage::user("hello")])
//!     .build();
//! let response = switchboard.create(request, Some("session-42")).await?;
//! # let _ = response;
//! switchboard.stop().await;
//! # Ok(())
//! # }
//! ```

mod balancer;
pub mod client;
pub mod config;
pub mod deployment;
pub mod errors;
pub mod models;
mod session;
mod sse;
pub mod stream;
mod supervisor;
pub mod switchboard;
pub mod telemetry;

pub use client::{ChatClient, ChunkStream, HttpChatClient};
pub use config::{ConfigFile, DeploymentConfig};
pub use deployment::{DeploymentClient, DeploymentSnapshot, RetryPolicy};
pub use errors::{AttemptFailure, SwitchboardError};
pub use models::{
    ChatChoice, ChatCompletion, ChatCompletionChunk, ChatCompletionRequest, ChatDelta, ChatMessage,
    StreamOptions, Usage,
};
pub use stream::CompletionStream;
pub use switchboard::{ChatCompletionResponse, Switchboard, SwitchboardOptions};
