//! HTTP 处理器模块

pub mod archives;
pub mod audits;
pub mod events;
pub mod health;
pub mod playbooks;
pub mod undo;
pub mod webhooks;
