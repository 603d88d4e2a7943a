use std::collections::{BTreeMap, HashMap};

use crate::graph::SimilarityGraph;
use crate::miniature::ItemId;

/// 把新一轮的分组结果与历史分组 id 对账
///
/// 在同一张合并图里，旧分组的成员互相连边，新分组的成员互相连边，
/// 然后提取连通分量作为最终分组。每个最终分组取成员中最小的非空旧
/// id；完全由新成员构成的分组领取一个单调递增的新 id。本轮没有触及
/// 的条目保持原有 id 不变。
///
/// 函数是纯的：输入不被修改，结果以新映射返回，任何上游失败都不会
/// 产生部分提交，持久化层看到的要么是完整的新映射，要么什么都没有。
pub fn merge_groups(
    prior: Option<&HashMap<ItemId, Option<i64>>>,
    new_groups: &[Vec<ItemId>],
) -> HashMap<ItemId, Option<i64>> {
    let mut result: HashMap<ItemId, Option<i64>> =
        prior.map(|p| p.clone()).unwrap_or_default();

    // 旧分组按 id 聚合，BTreeMap 保证遍历顺序确定
    let mut old_members: BTreeMap<i64, Vec<ItemId>> = BTreeMap::new();
    if let Some(prior) = prior {
        for (&item, &group) in prior {
            if let Some(group) = group {
                old_members.entry(group).or_default().push(item);
            }
        }
    }

    let mut graph = SimilarityGraph::new();
    for members in old_members.values() {
        for window in members.windows(2) {
            graph.connect(window[0], window[1]);
        }
        if members.len() == 1 {
            graph.add_node(members[0]);
        }
    }
    for members in new_groups {
        for window in members.windows(2) {
            graph.connect(window[0], window[1]);
        }
    }

    // 新 id 从历史最大值之后单调递增
    let mut next_id = old_members.keys().next_back().map_or(0, |&max| max + 1);

    // groups() 会丢弃单例，这里需要保住只含一个旧成员的分量
    let mut components = graph.groups();
    let grouped: std::collections::HashSet<ItemId> =
        components.iter().flatten().copied().collect();
    for members in old_members.values() {
        if members.len() == 1 && !grouped.contains(&members[0]) {
            components.push(vec![members[0]]);
        }
    }

    for members in &components {
        let old_id = members
            .iter()
            .filter_map(|item| result.get(item).copied().flatten())
            .min();
        let id = old_id.unwrap_or_else(|| {
            let id = next_id;
            next_id += 1;
            id
        });
        for &item in members {
            result.insert(item, Some(id));
        }
    }

    result
}
