use std::collections::HashMap;

use crate::miniature::ItemId;

/// "是同一画面" 关系的无向图，带路径压缩的并查集实现
///
/// 原型实现用破坏性遍历提取连通分量，每个节点只能被消费一次；这里
/// 改为并查集节点池，提取分组后图仍然可以继续插入和再次查询。
#[derive(Default)]
pub struct SimilarityGraph {
    ids: Vec<ItemId>,
    index: HashMap<ItemId, usize>,
    parent: Vec<usize>,
    rank: Vec<u8>,
}

impl SimilarityGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    fn node(&mut self, id: ItemId) -> usize {
        if let Some(&i) = self.index.get(&id) {
            return i;
        }
        let i = self.ids.len();
        self.ids.push(id);
        self.index.insert(id, i);
        self.parent.push(i);
        self.rank.push(0);
        i
    }

    fn find(&mut self, mut x: usize) -> usize {
        while self.parent[x] != x {
            self.parent[x] = self.parent[self.parent[x]];
            x = self.parent[x];
        }
        x
    }

    /// 插入一条对称的相似边，两端节点不存在时自动创建
    pub fn connect(&mut self, a: ItemId, b: ItemId) {
        let (na, nb) = (self.node(a), self.node(b));
        let (ra, rb) = (self.find(na), self.find(nb));
        if ra == rb {
            return;
        }
        match self.rank[ra].cmp(&self.rank[rb]) {
            std::cmp::Ordering::Less => self.parent[ra] = rb,
            std::cmp::Ordering::Greater => self.parent[rb] = ra,
            std::cmp::Ordering::Equal => {
                self.parent[rb] = ra;
                self.rank[ra] += 1;
            }
        }
    }

    /// 仅注册节点，不连边；落单的节点会成为单例分量
    pub fn add_node(&mut self, id: ItemId) {
        self.node(id);
    }

    /// 提取全部连通分量，剔除单例
    ///
    /// 分组整体无序（调用方可按大小重排），但输出是确定的：组内成员
    /// 按 id 升序，组间按最小成员 id 升序。
    pub fn groups(&mut self) -> Vec<Vec<ItemId>> {
        let mut by_root: HashMap<usize, Vec<ItemId>> = HashMap::new();
        for i in 0..self.ids.len() {
            let root = self.find(i);
            by_root.entry(root).or_default().push(self.ids[i]);
        }

        let mut groups: Vec<Vec<ItemId>> =
            by_root.into_values().filter(|members| members.len() > 1).collect();
        for members in &mut groups {
            members.sort_unstable();
        }
        groups.sort_unstable_by_key(|members| members[0]);
        groups
    }

    /// 按成员数量降序的视图，前端展示用；数量相同按最小 id
    pub fn groups_by_size(&mut self) -> Vec<Vec<ItemId>> {
        let mut groups = self.groups();
        groups.sort_by_key(|members| (std::cmp::Reverse(members.len()), members[0]));
        groups
    }
}
