//! 工作区工具审计服务库
//! 连接器、审计评分、剧本执行与撤销、归档生命周期、后台作业

pub mod concurrency;
pub mod config;
pub mod connectors;
pub mod db;
pub mod error;
pub mod handlers;
pub mod jobs;
pub mod middleware;
pub mod models;
pub mod repository;
pub mod routes;
pub mod services;
pub mod telemetry;
pub mod webhooks;
