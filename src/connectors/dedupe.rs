//! 重复文件标记
//!
//! 第一遍按内容哈希（退化为 名称+大小）分组，第二遍在每个 ≥2 的组里
//! 保留最近访问的一份，其余标记为重复。标记只在一次审计内有效。

use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::models::audit::FileRecord;

/// 分组键的短哈希，作为 duplicate_group
pub fn group_id(key: &str) -> String {
    let digest = Sha256::digest(key.as_bytes());
    hex::encode(&digest[..8])
}

/// 标记重复文件，返回被标记的数量
pub fn mark_duplicates(files: &mut [FileRecord]) -> usize {
    // 上一次审计留下的标记不算数
    for file in files.iter_mut() {
        file.is_duplicate = false;
        file.duplicate_group = None;
    }

    let mut groups: HashMap<String, Vec<usize>> = HashMap::new();
    for (idx, file) in files.iter().enumerate() {
        groups.entry(file.duplicate_key()).or_default().push(idx);
    }

    let mut marked = 0;
    for (key, mut members) in groups {
        if members.len() < 2 {
            continue;
        }

        // 最近访问的排最前；没有访问时间的视为最旧；同时刻保持原顺序
        members.sort_by(|a, b| files[*b].last_accessed.cmp(&files[*a].last_accessed));

        let group = group_id(&key);
        for (rank, idx) in members.into_iter().enumerate() {
            let file = &mut files[idx];
            file.duplicate_group = Some(group.clone());
            if rank > 0 {
                file.is_duplicate = true;
                marked += 1;
            }
        }
    }

    marked
}
