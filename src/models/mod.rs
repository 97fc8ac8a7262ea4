//! 数据模型模块
//! 集成与审计数据、剧本、撤销账本、归档记录以及作业事件

pub mod archive;
pub mod audit;
pub mod integration;
pub mod jobs;
pub mod playbook;
pub mod tenant;
pub mod undo;
