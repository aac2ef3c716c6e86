//! Hemmer provider for the HealthSuite Digital Platform (HSDP).
//!
//! This crate implements the resources and data sources the Hemmer IaC host
//! uses to manage HSDP services: identity (organizations, groups, roles,
//! propositions, applications, services), clinical data (FHIR organizations
//! and subscriptions), container hosts, PKI certificates, notification
//! topics, autoscalers and functions.
//!
//! # Overview
//!
//! The crate provides:
//!
//! - **Host boundary**: the [`ProviderService`] trait and its implementation
//!   [`HsdpProvider`]
//! - **Schema types**: builders describing provider, resource and data source
//!   attributes, including diff-suppression rules
//! - **Reconciler contract**: [`reconcile::Resource`] and
//!   [`reconcile::DataSource`], driven through [`state::ResourceData`]
//! - **Client plumbing**: a process-wide [`registry::ClientRegistry`] of
//!   authenticated HTTP clients with retry, token refresh and request signing
//! - **Poller**: bounded waits for asynchronous upstream work
//! - **Error types**: the [`ProviderError`] taxonomy and diagnostics
//! - **Logging**: `tracing` integration with an optional file sink
//!
//! # Quick Start
//!
//! ```ignore
//! use hemmer_provider_hsdp::{HsdpProvider, ProviderService};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     hemmer_provider_hsdp::init_logging();
//!
//!     let provider = HsdpProvider::new();
//!     provider
//!         .configure(json!({
//!             "region": "us-east",
//!             "environment": "client-test",
//!             "oauth2_client_id": "client",
//!             "oauth2_password": "secret",
//!             "org_admin_username": "admin",
//!             "org_admin_password": "password",
//!         }))
//!         .await?;
//!
//!     let result = provider
//!         .create(
//!             "hsdp_iam_org",
//!             json!({"name": "ACC-demo", "parent_org_id": "root-org"}),
//!             &CancellationToken::new(),
//!         )
//!         .await?;
//!     println!("created {}", result.state["id"]);
//!     Ok(())
//! }
//! ```
//!
//! # Host Operations
//!
//! - **Metadata / Schema**: resource and data source names and their schemas
//! - **ValidateProviderConfig / Configure**: credentials and endpoints
//! - **Stop**: cancels in-flight work
//! - **ValidateResourceConfig**: attribute checks before planning
//! - **UpgradeResourceState**: migrates state written by older schema versions
//! - **Plan**: computes changes, honouring diff-suppression and replacement
//! - **Create/Read/Update/Delete**: resource lifecycle
//! - **ImportResourceState**: adopts existing objects by import id
//! - **ReadDataSource**: read-only lookups

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod diff;
pub mod discovery;
pub mod error;
pub mod host;
pub mod import;
pub mod logging;
pub mod patch;
pub mod poll;
pub mod provider;
pub mod reconcile;
pub mod registry;
pub mod resources;
pub mod retry;
pub mod schema;
pub mod ssh;
pub mod state;
pub mod testing;
pub mod types;
pub mod validation;

// Re-export main types at crate root
pub use error::{HttpTaxon, ProviderError};
pub use host::ProviderService;
pub use logging::{init_logging, init_logging_with_default, try_init_logging};
pub use provider::HsdpProvider;
pub use schema::ProviderSchema;
pub use types::{ApplyResult, AttributeChange, ImportedResource, PlanResult, ProviderMetadata};
pub use validation::{is_valid, validate};

// Re-export async_trait for convenience
pub use async_trait::async_trait;

// Re-export commonly used external types
pub use serde_json;
pub use tracing;
