//! Business logic services layer

pub mod aggregator;
pub mod archive_service;
pub mod automation;
pub mod blob_store;
pub mod notifier;
pub mod playbook_executor;
pub mod playbook_generator;
pub mod scoring;
pub mod token_refresh;
pub mod undo_service;

pub use aggregator::AuditAggregator;
pub use archive_service::{ArchiveError, ArchivePolicy, ArchiveService};
pub use automation::{AutomationPolicy, AutomationService};
pub use blob_store::BlobStore;
pub use notifier::{LogNotifier, Notification, Notifier};
pub use playbook_executor::{ExecutionMode, PlaybookExecutor};
pub use playbook_generator::{GeneratorPolicy, PlaybookGenerator};
pub use scoring::ScoringPolicy;
pub use token_refresh::TokenService;
pub use undo_service::UndoService;
