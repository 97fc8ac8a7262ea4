//! 剧本生成器
//!
//! 把单个平台的审计数据转换为修复剧本。每个条目都带上生成时的原始状态，
//! 执行和撤销只依赖这些元数据。

use chrono::{DateTime, Months, Utc};
use std::collections::HashMap;
use tracing::debug;
use uuid::Uuid;

use super::scoring::storage_waste;
use crate::config::{AutomationConfig, PricingConfig};
use crate::models::audit::{AuditData, ChannelRecord, FileRecord, UserRecord};
use crate::models::integration::Platform;
use crate::models::playbook::{
    ImpactCategory, ItemMetadata, ItemType, Playbook, PlaybookDraft, PlaybookItem, PlaybookKind,
    PlaybookStatus, RiskLevel,
};
use sqlx::types::Json;

/// 自动审批允许的条目类型
pub const SAFE_AUTO_ITEM_TYPES: [ItemType; 2] = [ItemType::Channel, ItemType::File];

#[derive(Debug, Clone)]
pub struct GeneratorPolicy {
    pub stale_file_days: i64,
    pub dormant_channel_months: u32,
    /// 成员数严格小于该值才算休眠
    pub dormant_channel_max_members: i64,
    pub auto_approve_max_items: usize,
    pub storage_cost_per_gb_month: f64,
}

impl GeneratorPolicy {
    pub fn from_config(pricing: &PricingConfig, automation: &AutomationConfig) -> Self {
        Self {
            stale_file_days: pricing.stale_file_days,
            dormant_channel_months: pricing.dormant_channel_months.max(0) as u32,
            dormant_channel_max_members: pricing.dormant_channel_max_members,
            auto_approve_max_items: automation.max_items.max(0) as usize,
            storage_cost_per_gb_month: pricing.storage_cost_per_gb_month,
        }
    }
}

impl Default for GeneratorPolicy {
    fn default() -> Self {
        Self {
            stale_file_days: 365,
            dormant_channel_months: 12,
            dormant_channel_max_members: 5,
            auto_approve_max_items: 10,
            storage_cost_per_gb_month: 0.023,
        }
    }
}

/// 自动审批资格：LOW + EFFICIENCY + 条目数不超过上限 + 全部条目类型安全
pub fn is_auto_approvable(
    risk: RiskLevel,
    impact: ImpactCategory,
    items: &[PlaybookItem],
    max_items: usize,
) -> bool {
    risk == RiskLevel::Low
        && impact == ImpactCategory::Efficiency
        && items.len() <= max_items
        && items
            .iter()
            .all(|item| SAFE_AUTO_ITEM_TYPES.contains(&item.item_type))
}

fn platform_label(platform: Platform) -> &'static str {
    match platform {
        Platform::Slack => "Slack",
        Platform::GoogleWorkspace => "Google Workspace",
        Platform::Notion => "Notion",
        Platform::Figma => "Figma",
        Platform::Jira => "Jira",
    }
}

fn plural(count: usize, word: &str) -> String {
    if count == 1 {
        format!("1 {}", word)
    } else {
        format!("{} {}s", count, word)
    }
}

/// 按重复键分组，组内按最近访问降序；返回除第一个以外的成员
pub fn duplicate_targets(files: &[FileRecord]) -> Vec<&FileRecord> {
    let mut groups: HashMap<String, Vec<&FileRecord>> = HashMap::new();
    for file in files {
        groups.entry(file.duplicate_key()).or_default().push(file);
    }

    let mut keys: Vec<&String> = groups.keys().collect();
    keys.sort();

    let mut targets = Vec::new();
    for key in keys {
        let mut members = groups[key].clone();
        if members.len() < 2 {
            continue;
        }
        // None 视为最早
        members.sort_by(|a, b| b.last_accessed.cmp(&a.last_accessed));
        targets.extend(members.into_iter().skip(1));
    }
    targets
}

pub struct PlaybookGenerator {
    policy: GeneratorPolicy,
}

impl PlaybookGenerator {
    pub fn new(policy: GeneratorPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &GeneratorPolicy {
        &self.policy
    }

    /// 为单个平台生成全部剧本
    pub fn generate(
        &self,
        tenant_id: Uuid,
        audit_result_id: Option<Uuid>,
        platform: Platform,
        data: &AuditData,
        now: DateTime<Utc>,
    ) -> Vec<PlaybookDraft> {
        let ctx = DraftContext {
            tenant_id,
            audit_result_id,
            platform,
            now,
        };

        let mut drafts = Vec::new();
        drafts.extend(self.duplicates(&ctx, &data.files));
        drafts.extend(self.public_exposure(&ctx, &data.files));
        drafts.extend(self.stale_files(&ctx, &data.files));
        if platform.is_chat() {
            if let Some(channels) = &data.channels {
                drafts.extend(self.dormant_channels(&ctx, channels));
            }
        }
        drafts.extend(self.guest_users(&ctx, &data.users));

        debug!(
            tenant_id = %tenant_id,
            platform = %platform,
            playbooks = drafts.len(),
            "Generated playbooks"
        );
        drafts
    }

    fn duplicates(&self, ctx: &DraftContext, files: &[FileRecord]) -> Option<PlaybookDraft> {
        let targets = duplicate_targets(files);
        if targets.is_empty() {
            return None;
        }

        let wasted_bytes: i64 = targets.iter().map(|f| f.size_bytes.max(0)).sum();
        let savings = storage_waste(
            wasted_bytes as f64 / (1024.0 * 1024.0),
            self.policy.storage_cost_per_gb_month,
        );

        Some(ctx.draft(
            PlaybookKind::Duplicates,
            format!("Remove {} in {}", plural(targets.len(), "duplicate file"), platform_label(ctx.platform)),
            "Archive redundant copies and keep the most recently accessed version of each file."
                .to_string(),
            ImpactCategory::Savings,
            RiskLevel::Low,
            savings,
            targets.into_iter().map(file_item).collect(),
            self.policy.auto_approve_max_items,
        ))
    }

    fn public_exposure(&self, ctx: &DraftContext, files: &[FileRecord]) -> Option<PlaybookDraft> {
        let targets: Vec<&FileRecord> = files.iter().filter(|f| f.is_public).collect();
        if targets.is_empty() {
            return None;
        }

        let risk = if targets.iter().any(|f| f.is_database_like()) {
            RiskLevel::Critical
        } else {
            RiskLevel::High
        };

        Some(ctx.draft(
            PlaybookKind::PublicExposure,
            format!("Restrict {} in {}", plural(targets.len(), "public file"), platform_label(ctx.platform)),
            "Remove link sharing from files that anyone on the internet can open.".to_string(),
            ImpactCategory::Security,
            risk,
            0.0,
            targets.into_iter().map(file_item).collect(),
            self.policy.auto_approve_max_items,
        ))
    }

    fn stale_files(&self, ctx: &DraftContext, files: &[FileRecord]) -> Option<PlaybookDraft> {
        let targets: Vec<&FileRecord> = files
            .iter()
            .filter(|f| f.is_stale(ctx.now, self.policy.stale_file_days))
            .collect();
        if targets.is_empty() {
            return None;
        }

        let wasted_bytes: i64 = targets.iter().map(|f| f.size_bytes.max(0)).sum();
        let savings = storage_waste(
            wasted_bytes as f64 / (1024.0 * 1024.0),
            self.policy.storage_cost_per_gb_month,
        );

        Some(ctx.draft(
            PlaybookKind::StaleFiles,
            format!("Archive {} in {}", plural(targets.len(), "stale file"), platform_label(ctx.platform)),
            format!(
                "Archive files nobody has opened in the last {} days.",
                self.policy.stale_file_days
            ),
            ImpactCategory::Savings,
            RiskLevel::Medium,
            savings,
            targets.into_iter().map(file_item).collect(),
            self.policy.auto_approve_max_items,
        ))
    }

    fn dormant_channels(&self, ctx: &DraftContext, channels: &[ChannelRecord]) -> Option<PlaybookDraft> {
        let cutoff = ctx
            .now
            .checked_sub_months(Months::new(self.policy.dormant_channel_months))
            .unwrap_or(ctx.now);

        let targets: Vec<&ChannelRecord> = channels
            .iter()
            .filter(|c| {
                !c.is_archived
                    && c.member_count < self.policy.dormant_channel_max_members
                    && c.last_activity.map_or(true, |t| t <= cutoff)
            })
            .collect();
        if targets.is_empty() {
            return None;
        }

        Some(ctx.draft(
            PlaybookKind::DormantChannels,
            format!("Archive {} in {}", plural(targets.len(), "dormant channel"), platform_label(ctx.platform)),
            format!(
                "Archive channels with fewer than {} members and no activity for {} months.",
                self.policy.dormant_channel_max_members, self.policy.dormant_channel_months
            ),
            ImpactCategory::Efficiency,
            RiskLevel::Low,
            0.0,
            targets.into_iter().map(channel_item).collect(),
            self.policy.auto_approve_max_items,
        ))
    }

    fn guest_users(&self, ctx: &DraftContext, users: &[UserRecord]) -> Option<PlaybookDraft> {
        let targets: Vec<&UserRecord> = users.iter().filter(|u| u.is_guest).collect();
        if targets.is_empty() {
            return None;
        }

        Some(ctx.draft(
            PlaybookKind::GuestUsers,
            format!("Review {} in {}", plural(targets.len(), "guest account"), platform_label(ctx.platform)),
            "Remove external and guest accounts that still have workspace access.".to_string(),
            ImpactCategory::Security,
            RiskLevel::High,
            0.0,
            targets.into_iter().map(user_item).collect(),
            self.policy.auto_approve_max_items,
        ))
    }
}

/// 条目草稿（还没有剧本 ID）
struct ItemDraft {
    item_name: String,
    external_id: String,
    metadata: ItemMetadata,
}

fn file_item(file: &FileRecord) -> ItemDraft {
    ItemDraft {
        item_name: file.name.clone(),
        external_id: file.external_id.clone(),
        metadata: ItemMetadata::File {
            original_path: file.path.clone(),
            parent_id: file.parent_id.clone(),
            size_bytes: file.size_bytes,
            file_type: file.file_type.clone(),
            content_hash: file.content_hash.clone(),
            last_accessed: file.last_accessed,
            owner: file.owner.clone(),
            duplicate_group: file.duplicate_group.clone(),
            is_public: file.is_public,
            sharing: file.shared_with.clone(),
        },
    }
}

fn channel_item(channel: &ChannelRecord) -> ItemDraft {
    ItemDraft {
        item_name: channel.name.clone(),
        external_id: channel.external_id.clone(),
        metadata: ItemMetadata::Channel {
            is_private: channel.is_private,
            member_count: channel.member_count,
            last_activity: channel.last_activity,
        },
    }
}

fn user_item(user: &UserRecord) -> ItemDraft {
    ItemDraft {
        item_name: user.email.clone().unwrap_or_else(|| user.name.clone()),
        external_id: user.external_id.clone(),
        metadata: ItemMetadata::User {
            email: user.email.clone(),
            role: user.role.clone(),
            license_type: user.license_type.clone(),
            group_id: user.group_id.clone(),
            is_guest: user.is_guest,
            last_active: user.last_active,
        },
    }
}

struct DraftContext {
    tenant_id: Uuid,
    audit_result_id: Option<Uuid>,
    platform: Platform,
    now: DateTime<Utc>,
}

impl DraftContext {
    #[allow(clippy::too_many_arguments)]
    fn draft(
        &self,
        kind: PlaybookKind,
        title: String,
        description: String,
        impact: ImpactCategory,
        risk: RiskLevel,
        estimated_savings: f64,
        items: Vec<ItemDraft>,
        auto_max_items: usize,
    ) -> PlaybookDraft {
        let playbook_id = Uuid::new_v4();
        let items: Vec<PlaybookItem> = items
            .into_iter()
            .map(|draft| PlaybookItem {
                id: Uuid::new_v4(),
                playbook_id,
                item_type: draft.metadata.item_type(),
                item_name: draft.item_name,
                external_id: draft.external_id,
                metadata: Json(draft.metadata),
                is_selected: true,
                created_at: self.now,
            })
            .collect();

        let auto_approvable = is_auto_approvable(risk, impact, &items, auto_max_items);

        PlaybookDraft {
            playbook: Playbook {
                id: playbook_id,
                tenant_id: self.tenant_id,
                audit_result_id: self.audit_result_id,
                kind,
                title,
                description,
                impact,
                source: self.platform,
                risk,
                item_count: items.len() as i32,
                estimated_savings,
                status: PlaybookStatus::Pending,
                auto_approvable,
                processed_count: 0,
                failed_count: 0,
                execution_duration_ms: None,
                approved_by: None,
                executed_by: None,
                executed_at: None,
                created_at: self.now,
                updated_at: self.now,
            },
            items,
        }
    }
}
