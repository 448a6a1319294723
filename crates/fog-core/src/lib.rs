pub mod config;
pub mod events;
pub mod naming;
pub mod title;
pub mod types;

pub use config::FogConfig;
pub use events::EventType;
pub use naming::{
    generate_branch_name, is_protected_branch, split_repo_full_name, validate_branch_name,
    NamingError,
};
pub use title::resolve_commit_title;
pub use types::{Id, RepoRecord, Run, RunEvent, RunState, Session, SessionStatus, ToolKind};
