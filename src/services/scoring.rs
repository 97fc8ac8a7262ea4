//! 评分引擎
//!
//! 纯函数：浪费估算、风险计数与 0–100 健康分。相同输入总是得到相同输出。

use chrono::{DateTime, Utc};

use crate::config::PricingConfig;
use crate::models::audit::{FileRecord, RiskCounts, UserRecord, WasteBreakdown};

/// 各项扣分上限
pub const STORAGE_DEDUCTION_CAP: f64 = 30.0;
pub const DUPLICATE_DEDUCTION_CAP: f64 = 20.0;
pub const PUBLIC_DEDUCTION_CAP: f64 = 25.0;
pub const INACTIVE_DEDUCTION_CAP: f64 = 25.0;

/// 每 100 美元年化存储浪费扣 1 分
const STORAGE_POINTS_PER_DOLLAR: f64 = 0.01;
const DUPLICATE_POINTS_EACH: f64 = 0.5;
const PUBLIC_POINTS_EACH: f64 = 2.0;
const INACTIVE_POINTS_EACH: f64 = 1.0;

/// 计算所需的价格与阈值
#[derive(Debug, Clone)]
pub struct ScoringPolicy {
    pub storage_cost_per_gb_month: f64,
    pub seat_cost_month: f64,
    pub inactive_user_days: i64,
    pub stale_file_days: i64,
}

impl ScoringPolicy {
    pub fn from_config(pricing: &PricingConfig) -> Self {
        Self {
            storage_cost_per_gb_month: pricing.storage_cost_per_gb_month,
            seat_cost_month: pricing.seat_cost_month,
            inactive_user_days: pricing.inactive_user_days,
            stale_file_days: pricing.stale_file_days,
        }
    }
}

impl Default for ScoringPolicy {
    fn default() -> Self {
        Self {
            storage_cost_per_gb_month: 0.023,
            seat_cost_month: 12.0,
            inactive_user_days: 90,
            stale_file_days: 365,
        }
    }
}

/// 一次审计的评分结果
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreCard {
    pub score: i32,
    pub waste: WasteBreakdown,
    pub risks: RiskCounts,
    pub estimated_savings: f64,
}

/// 年化存储浪费 = MB / 1024 × 单价 × 12
pub fn storage_waste(wasted_mb: f64, cost_per_gb_month: f64) -> f64 {
    (wasted_mb / 1024.0) * cost_per_gb_month * 12.0
}

/// 年化许可浪费 = 不活跃用户数 × 席位单价 × 12
pub fn license_waste(inactive_users: i64, seat_cost_month: f64) -> f64 {
    inactive_users as f64 * seat_cost_month * 12.0
}

fn bytes_to_mb(bytes: i64) -> f64 {
    bytes.max(0) as f64 / (1024.0 * 1024.0)
}

/// 浪费明细：重复与陈旧文件的体积（同一文件只计一次）以及不活跃 / 访客用户
pub fn compute_waste(
    files: &[FileRecord],
    users: &[UserRecord],
    now: DateTime<Utc>,
    policy: &ScoringPolicy,
) -> WasteBreakdown {
    let mut wasted_bytes = 0i64;
    let mut duplicate_files = 0i64;
    let mut stale_files = 0i64;
    let mut public_files = 0i64;

    for file in files {
        let stale = file.is_stale(now, policy.stale_file_days);
        if file.is_duplicate {
            duplicate_files += 1;
        }
        if stale {
            stale_files += 1;
        }
        if file.is_duplicate || stale {
            wasted_bytes = wasted_bytes.saturating_add(file.size_bytes.max(0));
        }
        if file.is_public {
            public_files += 1;
        }
    }

    let inactive_users = users
        .iter()
        .filter(|u| u.is_inactive(now, policy.inactive_user_days))
        .count() as i64;
    let guest_users = users.iter().filter(|u| u.is_guest).count() as i64;

    let wasted_storage_mb = bytes_to_mb(wasted_bytes);

    WasteBreakdown {
        storage_waste: storage_waste(wasted_storage_mb, policy.storage_cost_per_gb_month),
        license_waste: license_waste(inactive_users, policy.seat_cost_month),
        wasted_storage_mb,
        duplicate_files,
        stale_files,
        public_files,
        inactive_users,
        guest_users,
    }
}

/// 风险计数
///
/// active = 公开文件 + 访客；critical = 类数据库的公开文件；moderate = 其余公开文件 + 访客
pub fn risk_counts(files: &[FileRecord], users: &[UserRecord]) -> RiskCounts {
    let public: Vec<&FileRecord> = files.iter().filter(|f| f.is_public).collect();
    let critical = public.iter().filter(|f| f.is_database_like()).count() as i64;
    let guests = users.iter().filter(|u| u.is_guest).count() as i64;
    let public_count = public.len() as i64;

    RiskCounts {
        active_risks: public_count + guests,
        critical_risks: critical,
        moderate_risks: (public_count - critical) + guests,
    }
}

/// 各项扣分（已按上限截断），顺序无关
pub fn deductions(waste: &WasteBreakdown) -> [f64; 4] {
    [
        (waste.storage_waste * STORAGE_POINTS_PER_DOLLAR).min(STORAGE_DEDUCTION_CAP),
        (waste.duplicate_files as f64 * DUPLICATE_POINTS_EACH).min(DUPLICATE_DEDUCTION_CAP),
        (waste.public_files as f64 * PUBLIC_POINTS_EACH).min(PUBLIC_DEDUCTION_CAP),
        (waste.inactive_users as f64 * INACTIVE_POINTS_EACH).min(INACTIVE_DEDUCTION_CAP),
    ]
}

/// 健康分 = 100 - 扣分之和，截断到 [0, 100]
pub fn health_score(waste: &WasteBreakdown) -> i32 {
    let total: f64 = deductions(waste).iter().map(|d| d.max(0.0)).sum();
    (100.0 - total).round().clamp(0.0, 100.0) as i32
}

pub fn score_audit(
    files: &[FileRecord],
    users: &[UserRecord],
    now: DateTime<Utc>,
    policy: &ScoringPolicy,
) -> ScoreCard {
    let waste = compute_waste(files, users, now, policy);
    let risks = risk_counts(files, users);
    ScoreCard {
        score: health_score(&waste),
        estimated_savings: waste.storage_waste + waste.license_waste,
        waste,
        risks,
    }
}
